//! Post-submission assessment.
//!
//! Evidence is checked in a fixed order: configured failure indicators,
//! configured success indicators, built-in failure phrases and banners,
//! built-in success markers, the password field disappearing, and the URL
//! leaving the login path. A configured failure indicator always wins, even
//! when the URL changed. Built-in banners only count while the password field
//! is still showing, since a signed-in page may carry its own alerts.

use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Indicator, LoginPageConfiguration};
use crate::errors::{PageError, PageErrorKind};
use crate::page::{Page, Selector, first_usable};
use crate::types::{Evidence, FormElements, LoginAssessmentResult};
use crate::wait::{Budget, Interrupt};

/// Phrases that mean the site rejected the credentials
pub const DEFAULT_FAILURE_TEXTS: &[&str] = &[
    "invalid username or password",
    "invalid user name or password",
    "incorrect username or password",
    "invalid email or password",
    "invalid credentials",
    "incorrect password",
    "invalid password",
    "wrong password",
    "login failed",
    "authentication failed",
    "your account has been locked",
];

/// Error banners commonly rendered next to a rejected login form
pub const DEFAULT_FAILURE_SELECTORS: &[&str] = &[
    "[role='alert']",
    ".alert-danger",
    ".alert-error",
    ".error-message",
    ".login-error",
    ".validation-summary-errors",
    ".field-validation-error",
];

/// Markers that only show up once signed in
pub const DEFAULT_SUCCESS_SELECTORS: &[&str] = &[
    "a[href*='logout' i]",
    "a[href*='logoff' i]",
    "a[href*='signout' i]",
    "button[id*='logout' i]",
];

pub const CONFIGURED_FAILURE_CONFIDENCE: u8 = 95;
pub const BUILTIN_FAILURE_TEXT_CONFIDENCE: u8 = 90;
pub const BUILTIN_FAILURE_BANNER_CONFIDENCE: u8 = 85;
pub const CONFIGURED_SUCCESS_CONFIDENCE: u8 = 90;
pub const BUILTIN_SUCCESS_CONFIDENCE: u8 = 85;
pub const PASSWORD_GONE_AND_URL_CHANGED_CONFIDENCE: u8 = 80;
pub const PASSWORD_GONE_CONFIDENCE: u8 = 70;
pub const URL_CHANGED_CONFIDENCE: u8 = 60;
pub const AMBIGUOUS_CONFIDENCE: u8 = 15;

/// Banners shorter than this are usually icons or empty placeholders
const MIN_BANNER_TEXT: usize = 5;

/// Assesses page state after submission
#[derive(Debug, Clone)]
pub struct LoginVerifier {
    failure_texts: Vec<String>,
    failure_selectors: Vec<String>,
    success_selectors: Vec<String>,
}

impl Default for LoginVerifier {
    fn default() -> Self {
        Self {
            failure_texts: DEFAULT_FAILURE_TEXTS.iter().map(|s| s.to_string()).collect(),
            failure_selectors: DEFAULT_FAILURE_SELECTORS.iter().map(|s| s.to_string()).collect(),
            success_selectors: DEFAULT_SUCCESS_SELECTORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl LoginVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A verifier that only uses configured indicators and heuristics
    pub fn without_builtins() -> Self {
        Self {
            failure_texts: Vec::new(),
            failure_selectors: Vec::new(),
            success_selectors: Vec::new(),
        }
    }

    /// `verify(page, elements, config)`: one look at the page
    pub async fn verify<P: Page + ?Sized>(
        &self,
        page: &P,
        elements: &FormElements<P::Element>,
        config: Option<&LoginPageConfiguration>,
        original_url: &str,
    ) -> Result<LoginAssessmentResult, PageError> {
        let text = page.page_text().await?.to_lowercase();

        // 1. Configured evidence, failure first
        if let Some(config) = config {
            for indicator in &config.failure_indicators {
                if let Some(matched) = self.indicator_matches(page, indicator, &text).await? {
                    return Ok(failure(matched, CONFIGURED_FAILURE_CONFIDENCE));
                }
            }
            for indicator in &config.success_indicators {
                if let Some(matched) = self.indicator_matches(page, indicator, &text).await? {
                    return Ok(success(matched, CONFIGURED_SUCCESS_CONFIDENCE));
                }
            }
        }

        // 2. Built-in evidence
        if let Some(phrase) = self.failure_texts.iter().find(|p| text.contains(p.as_str())) {
            return Ok(failure(phrase.clone(), BUILTIN_FAILURE_TEXT_CONFIDENCE));
        }
        let password_gone = password_gone(page, elements).await?;
        if !password_gone {
            for selector in &self.failure_selectors {
                if let Some(banner) = banner_text(page, selector).await? {
                    return Ok(failure(banner, BUILTIN_FAILURE_BANNER_CONFIDENCE));
                }
            }
        }
        for selector in &self.success_selectors {
            if first_usable(page, Selector::parse(selector)).await?.is_some() {
                return Ok(success(selector.clone(), BUILTIN_SUCCESS_CONFIDENCE));
            }
        }

        // 3. Heuristics
        let current_url = page.current_url().await?;
        let url_changed = !same_location(original_url, &current_url);
        debug!(
            "Heuristics: password_gone={}, url_changed={} ({} -> {})",
            password_gone, url_changed, original_url, current_url
        );

        let result = match (password_gone, url_changed) {
            (true, true) => LoginAssessmentResult {
                success: true,
                confidence: PASSWORD_GONE_AND_URL_CHANGED_CONFIDENCE,
                reason: "password field gone and URL changed".to_string(),
                matched_indicator: None,
                evidence: Evidence::PasswordFieldGoneAndUrlChanged,
            },
            (true, false) => LoginAssessmentResult {
                success: true,
                confidence: PASSWORD_GONE_CONFIDENCE,
                reason: "password field gone".to_string(),
                matched_indicator: None,
                evidence: Evidence::PasswordFieldGone,
            },
            (false, true) => LoginAssessmentResult {
                success: true,
                confidence: URL_CHANGED_CONFIDENCE,
                reason: format!("URL changed to {}", current_url),
                matched_indicator: None,
                evidence: Evidence::UrlChanged,
            },
            (false, false) => ambiguous(),
        };
        Ok(result)
    }

    /// Poll [`verify`](Self::verify) until the evidence settles.
    ///
    /// Explicit indicators end the wait immediately. Heuristic evidence must
    /// be seen on two consecutive polls, since a failure banner can render
    /// just after a redirect. When the budget runs out the last result is
    /// returned, which may be ambiguous.
    pub async fn verify_until_settled<P: Page + ?Sized>(
        &self,
        page: &P,
        elements: &FormElements<P::Element>,
        config: Option<&LoginPageConfiguration>,
        original_url: &str,
        budget: &Budget,
        poll_interval: Duration,
    ) -> Result<LoginAssessmentResult, VerifyError> {
        let mut previous: Option<Evidence> = None;
        let mut last = ambiguous();

        loop {
            match self.verify(page, elements, config, original_url).await {
                Ok(result) => {
                    let explicit = matches!(
                        result.evidence,
                        Evidence::FailureIndicator | Evidence::SuccessIndicator
                    );
                    let settled = !result.is_ambiguous() && previous == Some(result.evidence);
                    if explicit || settled {
                        info!(
                            "Login {} (confidence {}): {}",
                            if result.success { "succeeded" } else { "failed" },
                            result.confidence,
                            result.reason
                        );
                        return Ok(result);
                    }
                    previous = Some(result.evidence);
                    last = result;
                }
                Err(e) if e.is_transient() => debug!("Verification poll failed: {}", e),
                Err(e) => return Err(VerifyError::Page(e)),
            }

            match budget.sleep(poll_interval).await {
                Ok(()) => {}
                Err(Interrupt::DeadlineExceeded) => {
                    debug!("Verification window closed; last result: {}", last.reason);
                    return Ok(last);
                }
                Err(Interrupt::Cancelled) => return Err(VerifyError::Cancelled),
            }
        }
    }

    async fn indicator_matches<P: Page + ?Sized>(
        &self,
        page: &P,
        indicator: &Indicator,
        lowered_text: &str,
    ) -> Result<Option<String>, PageError> {
        match indicator {
            Indicator::Text(needle) => {
                let needle = needle.trim().to_lowercase();
                Ok((!needle.is_empty() && lowered_text.contains(&needle)).then_some(needle))
            }
            Indicator::Selector(selector) => Ok(first_usable(page, Selector::parse(selector))
                .await?
                .map(|_| selector.clone())),
        }
    }
}

/// Why settled verification stopped without a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    Page(PageError),
    Cancelled,
}

fn failure(matched: String, confidence: u8) -> LoginAssessmentResult {
    LoginAssessmentResult {
        success: false,
        confidence,
        reason: format!("invalid credentials: page shows '{}'", matched),
        matched_indicator: Some(matched),
        evidence: Evidence::FailureIndicator,
    }
}

fn success(matched: String, confidence: u8) -> LoginAssessmentResult {
    LoginAssessmentResult {
        success: true,
        confidence,
        reason: format!("success indicator '{}' present", matched),
        matched_indicator: Some(matched),
        evidence: Evidence::SuccessIndicator,
    }
}

pub fn ambiguous() -> LoginAssessmentResult {
    LoginAssessmentResult {
        success: false,
        confidence: AMBIGUOUS_CONFIDENCE,
        reason: "ambiguous".to_string(),
        matched_indicator: None,
        evidence: Evidence::None,
    }
}

/// Text of the first displayed banner matching `selector`, if it says anything
async fn banner_text<P: Page + ?Sized>(page: &P, selector: &str) -> Result<Option<String>, PageError> {
    let Some(element) = first_usable(page, Selector::parse(selector)).await? else {
        return Ok(None);
    };
    let text = match page.text(&element).await {
        Ok(text) => text.trim().to_string(),
        Err(e) if e.is_transient() => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok((text.chars().count() >= MIN_BANNER_TEXT).then_some(text))
}

/// The original password field is hidden or detached and no other password
/// input is showing
async fn password_gone<P: Page + ?Sized>(
    page: &P,
    elements: &FormElements<P::Element>,
) -> Result<bool, PageError> {
    if let Some(password) = &elements.password {
        match page.is_displayed(password).await {
            Ok(true) => return Ok(false),
            Ok(false) => {}
            Err(e) if matches!(e.kind, PageErrorKind::StaleElement | PageErrorKind::NoSuchElement) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(first_usable(page, Selector::Css("input[type='password']")).await?.is_none())
}

/// Same host and path, ignoring query, fragment and a trailing slash
pub fn same_location(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.host_str() == b.host_str()
                && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
        }
        _ => a.trim_end_matches('/') == b.trim_end_matches('/'),
    }
}
