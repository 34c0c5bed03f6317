//! One login attempt, end to end, and the retrying wrapper around it.
//!
//! Every phase runs sequentially against a single page. Failures come back as
//! a [`LoginOutcome`] describing what happened; only fatal driver failures are
//! returned as errors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AttemptSettings, ConfigSet, LoginPageConfiguration};
use crate::detection::tiers::SUBMIT_SELECTORS;
use crate::detection::{FormDetector, domain_expected, score};
use crate::domain::{self, DeferredError, DomainDirective, DomainRequest};
use crate::entry::{CredentialEntryEngine, EntryError, EntryMode, EntryPlan};
use crate::errors::{FailureClass, FailureContext, LoginError, PageError, PageErrorKind, Phase};
use crate::metrics::MetricsStore;
use crate::page::{ENTER_KEY, Page, Selector, first_usable};
use crate::progressive::{MonitorState, ProgressiveFieldMonitor};
use crate::retry::RetryOrchestrator;
use crate::types::{
    Credentials, DetectionMethod, DetectionSummary, FieldKind, FieldSet, FormElements,
    LoginAssessmentResult,
};
use crate::verify::{LoginVerifier, VerifyError};
use crate::wait::{Budget, Interrupt};

/// How a login ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    InvalidCredentials,
    FormNotFound,
    CredentialEntryFailed,
    Timeout,
    Ambiguous,
    InteractionFailed,
    DriverFailure,
    ConfigurationError,
    Cancelled,
}

impl OutcomeKind {
    pub fn of(error: &LoginError) -> Self {
        match error {
            LoginError::FormNotFound(_) => OutcomeKind::FormNotFound,
            LoginError::CredentialEntry(_) => OutcomeKind::CredentialEntryFailed,
            LoginError::Timeout(_) => OutcomeKind::Timeout,
            LoginError::VerificationAmbiguous(_) => OutcomeKind::Ambiguous,
            LoginError::InvalidCredentials(_) => OutcomeKind::InvalidCredentials,
            LoginError::Interaction { .. } => OutcomeKind::InteractionFailed,
            LoginError::Driver { .. } => OutcomeKind::DriverFailure,
            LoginError::Configuration(_) => OutcomeKind::ConfigurationError,
            LoginError::Cancelled => OutcomeKind::Cancelled,
        }
    }
}

/// What one attempt observed, kept even when the attempt fails
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttemptReport {
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempted_tiers: Vec<DetectionMethod>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub progressive: Vec<MonitorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainDirective>,
    pub populated: FieldSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<LoginAssessmentResult>,
}

/// Discriminated result of a whole login, retries included
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub id: Uuid,
    pub url: String,
    pub kind: OutcomeKind,
    pub success: bool,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Observations from the last attempt
    pub last_attempt: AttemptReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub exit_code: i32,
}

impl LoginOutcome {
    fn succeeded(
        url: &str,
        report: AttemptReport,
        attempts: u32,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            kind: OutcomeKind::Success,
            success: true,
            attempts,
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            last_attempt: report,
            failure: None,
            failure_class: None,
            message: None,
            exit_code: 0,
        }
    }

    fn failed(
        url: &str,
        error: &LoginError,
        report: AttemptReport,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        let attempts = error
            .context()
            .map(|ctx| ctx.attempts)
            .unwrap_or(report.attempt.max(1));
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            kind: OutcomeKind::of(error),
            success: false,
            attempts,
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            last_attempt: report,
            failure: error.context().cloned(),
            failure_class: Some(error.class()),
            message: Some(error.to_string()),
            exit_code: error.exit_code(),
        }
    }
}

/// Result of `detect` without logging in
#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutcome {
    pub url: String,
    pub found: bool,
    pub detection: DetectionSummary,
    pub attempted_tiers: Vec<DetectionMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended: Option<DetectionMethod>,
    pub elapsed_ms: u64,
}

/// Logs into sites on one page
pub struct LoginSession<'a, P: Page> {
    page: &'a P,
    configs: &'a ConfigSet,
    settings: AttemptSettings,
    metrics: Option<&'a dyn MetricsStore>,
    cancel: CancellationToken,
    detector: FormDetector<P>,
    verifier: LoginVerifier,
}

impl<'a, P: Page + 'static> LoginSession<'a, P> {
    pub fn new(page: &'a P, configs: &'a ConfigSet, settings: AttemptSettings) -> Self {
        let detector = FormDetector::new(settings.max_context_depth);
        Self {
            page,
            configs,
            settings,
            metrics: None,
            cancel: CancellationToken::new(),
            detector,
            verifier: LoginVerifier::new(),
        }
    }
}

impl<'a, P: Page> LoginSession<'a, P> {
    pub fn with_metrics(mut self, metrics: &'a dyn MetricsStore) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_verifier(mut self, verifier: LoginVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_detector(mut self, detector: FormDetector<P>) -> Self {
        self.detector = detector;
        self
    }

    pub fn settings(&self) -> &AttemptSettings {
        &self.settings
    }

    /// Log in, retrying transient failures per the configured policy.
    ///
    /// Returns `Err` only for fatal driver failures; everything else is
    /// described by the outcome.
    pub async fn login(&self, url: &str, credentials: &Credentials) -> Result<LoginOutcome, LoginError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let last_report = Mutex::new(AttemptReport::default());
        let orchestrator = RetryOrchestrator::new(self.settings.retry.clone(), self.cancel.clone())
            .with_deadline(self.settings.overall_timeout);

        info!("Logging into {}", url);
        let mut result = orchestrator
            .run(|attempt| {
                let last_report = &last_report;
                async move {
                    let mut report = AttemptReport {
                        attempt: attempt + 1,
                        ..Default::default()
                    };
                    let result = self
                        .run_attempt(url, credentials, started.elapsed(), &mut report)
                        .await;
                    *last_report.lock().unwrap_or_else(|e| e.into_inner()) = report;
                    result
                }
            })
            .await;

        let report = last_report.into_inner().unwrap_or_else(|e| e.into_inner());
        if let Err(error) = &mut result
            && let Some(ctx) = error.context_mut()
            && ctx.url.is_empty()
        {
            ctx.url = url.to_string();
        }
        match result {
            Ok(retried) => {
                info!("Logged into {} after {} attempt(s)", url, retried.attempts);
                Ok(LoginOutcome::succeeded(url, report, retried.attempts, started_at, started.elapsed()))
            }
            Err(error) if error.class() == FailureClass::Fatal => Err(error),
            Err(error) => {
                warn!("Login to {} failed: {}", url, error);
                Ok(LoginOutcome::failed(url, &error, report, started_at, started.elapsed()))
            }
        }
    }

    /// A single attempt without retries
    pub async fn attempt(&self, url: &str, credentials: &Credentials) -> Result<AttemptReport, LoginError> {
        let mut report = AttemptReport {
            attempt: 1,
            ..Default::default()
        };
        self.run_attempt(url, credentials, Duration::ZERO, &mut report).await?;
        Ok(report)
    }

    /// Navigate and run detection only
    pub async fn detect_only(&self, url: &str) -> Result<DetectionOutcome, LoginError> {
        let started = Instant::now();
        let matched = self.configs.matching(url);
        let deadlines = self.settings.deadlines_at(Duration::ZERO);

        if self.settings.navigate {
            self.navigate(url, &matched, started).await?;
        }

        let budget = Budget::new(self.cancel.clone(), deadlines.detection);
        let report = self
            .detector
            .scan(self.page, url, &matched, true, &budget, self.metrics)
            .await
            .map_err(|e| LoginError::from_page(e, self.context(url, Phase::Detection, "detection failed", started)))?;
        if report.interrupted == Some(Interrupt::Cancelled) {
            return Err(LoginError::Cancelled);
        }

        Ok(DetectionOutcome {
            url: url.to_string(),
            found: report.is_valid(),
            detection: report.elements.summary(),
            attempted_tiers: report.attempted,
            recommended: self.metrics.and_then(|m| m.recommended_method(url)),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn context(&self, url: &str, phase: Phase, reason: impl Into<String>, started: Instant) -> FailureContext {
        FailureContext::new(url, phase, reason).with_elapsed(started.elapsed())
    }

    async fn settle(&self, wait: Duration) -> Result<(), LoginError> {
        if wait.is_zero() {
            return Ok(());
        }
        debug!("Waiting {:?} for the page to settle", wait);
        match Budget::unbounded(self.cancel.clone()).sleep(wait).await {
            Err(Interrupt::Cancelled) => Err(LoginError::Cancelled),
            _ => Ok(()),
        }
    }

    async fn navigate(
        &self,
        url: &str,
        matched: &[&LoginPageConfiguration],
        started: Instant,
    ) -> Result<(), LoginError> {
        if self.cancel.is_cancelled() {
            return Err(LoginError::Cancelled);
        }
        self.page.goto(url).await.map_err(|e| {
            LoginError::from_page(e, self.context(url, Phase::Navigation, "navigation failed", started))
        })?;
        if let Some(config) = matched.first() {
            self.settle(config.additional_wait()).await?;
        }
        Ok(())
    }

    async fn run_attempt(
        &self,
        url: &str,
        credentials: &Credentials,
        login_elapsed: Duration,
        report: &mut AttemptReport,
    ) -> Result<(), LoginError> {
        let started = Instant::now();
        let page = self.page;
        let matched = self.configs.matching(url);
        let primary = matched.first().copied();
        let deadlines = self.settings.deadlines_at(login_elapsed);
        let requires_javascript = primary.is_some_and(|c| c.requires_javascript);

        let request = DomainRequest::parse(
            credentials.domain.as_deref(),
            &self.settings.domain_skip_sentinel,
        );
        let want_domain = !request.is_skip();
        let expect_domain = domain_expected(&matched, want_domain);

        if self.settings.navigate {
            self.navigate(url, &matched, started).await?;
        }

        // Detection
        let detect_budget = Budget::new(self.cancel.clone(), deadlines.detection);
        let scan = self
            .detector
            .scan(page, url, &matched, want_domain, &detect_budget, self.metrics)
            .await
            .map_err(|e| LoginError::from_page(e, self.context(url, Phase::Detection, "detection failed", started)))?;
        report.attempted_tiers = scan.attempted.clone();

        match scan.interrupted {
            Some(Interrupt::Cancelled) => return Err(LoginError::Cancelled),
            Some(Interrupt::DeadlineExceeded) if !scan.is_valid() => {
                let ctx = self
                    .context(url, Phase::Detection, "detection deadline passed", started)
                    .with_tiers(scan.attempted.clone())
                    .with_confidence(scan.elements.confidence);
                return Err(LoginError::Timeout(Box::new(ctx)));
            }
            _ => {}
        }

        let entry_budget = Budget::new(self.cancel.clone(), deadlines.entry);
        let engine = CredentialEntryEngine::new(self.settings.keystroke_delay).with_events(requires_javascript);
        let mut mode = if requires_javascript {
            EntryMode::Humanized
        } else {
            EntryMode::Direct
        };
        let mut elements = scan.elements;
        let mut populated = FieldSet::new();
        let mut directive = DomainDirective::resolve(&request, elements.has(FieldKind::Domain));

        // Progressive reveal
        if !elements.is_valid() {
            let monitor = ProgressiveFieldMonitor::new(&self.detector, &engine, self.settings.progressive);
            let plan = EntryPlan {
                credentials,
                directive: &directive,
                mode: EntryMode::Humanized,
            };
            let outcome = monitor
                .run(page, url, &matched, elements, &plan, want_domain, &entry_budget)
                .await
                .map_err(|e| self.entry_failure(e, url, Phase::ProgressiveReveal, started))?;

            let complete = outcome.is_complete();
            report.progressive = outcome.transitions;
            elements = outcome.elements;
            populated = outcome.populated;
            mode = EntryMode::Humanized;

            if !complete {
                let diagnostic = outcome
                    .diagnostic
                    .unwrap_or_else(|| "progressive form did not complete".to_string());
                // No password anywhere means there is no login form to wait for
                if !elements.has(FieldKind::Password) {
                    let reason = if elements.is_empty() {
                        "no detection tier found a login form".to_string()
                    } else {
                        format!("no password field found ({})", diagnostic)
                    };
                    let ctx = self
                        .context(url, Phase::Detection, reason, started)
                        .with_tiers(scan.attempted.clone())
                        .with_confidence(score(&elements, expect_domain));
                    return Err(LoginError::FormNotFound(Box::new(ctx)));
                }
                if !elements.is_valid() {
                    let ctx = self
                        .context(url, Phase::ProgressiveReveal, diagnostic, started)
                        .with_tiers(scan.attempted.clone())
                        .with_confidence(score(&elements, expect_domain));
                    return Err(LoginError::Timeout(Box::new(ctx)));
                }
                warn!("Progressive form incomplete ({}); submitting what was found", diagnostic);
            }

            elements.confidence = score(&elements, expect_domain);
            directive = DomainDirective::resolve(&request, elements.has(FieldKind::Domain));
        }

        if directive.is_skip() && elements.take(FieldKind::Domain).is_some() {
            debug!("Domain handling skipped; leaving the detected domain field alone");
        }
        report.detection = Some(elements.summary());
        report.domain = Some(directive.clone());
        debug!("Domain directive: {:?}", directive);

        // Entry
        let plan = EntryPlan {
            credentials,
            directive: &directive,
            mode,
        };
        let entered = engine
            .enter(page, &elements, &plan, &mut populated, &entry_budget)
            .await
            .map_err(|e| self.entry_failure(e, url, Phase::Entry, started))?;
        if !entered {
            let ctx = self
                .context(url, Phase::Entry, "a credential field refused input", started)
                .with_confidence(elements.confidence);
            report.populated = populated;
            return Err(LoginError::CredentialEntry(Box::new(ctx)));
        }

        // Domain field revealed by the password
        if let DomainDirective::DeferredUntilAfterPassword(_) = &directive {
            let domain_budget = entry_budget.child(self.settings.progressive.stage_deadline);
            match domain::await_deferred_field(
                page,
                &self.detector,
                url,
                &matched,
                &domain_budget,
                self.settings.progressive.poll_interval,
            )
            .await
            {
                Ok(Some(found)) => {
                    elements.merge_gaps(found);
                    engine
                        .populate(page, &elements, FieldKind::Domain, &plan, &mut populated, &entry_budget)
                        .await
                        .map_err(|e| self.entry_failure(e, url, Phase::DomainResolution, started))?;
                    report.detection = Some(elements.summary());
                }
                Ok(None) => warn!("Requested domain field never appeared; continuing without it"),
                Err(DeferredError::Cancelled) => return Err(LoginError::Cancelled),
                Err(DeferredError::Page(e)) => {
                    return Err(LoginError::from_page(
                        e,
                        self.context(url, Phase::DomainResolution, "domain detection failed", started),
                    ));
                }
            }
        }
        report.populated = populated;

        // Submission
        if self.cancel.is_cancelled() {
            return Err(LoginError::Cancelled);
        }
        let original_url = match page.current_url().await {
            Ok(current) => current,
            Err(e) => {
                debug!("Could not read URL before submitting ({}); using {}", e, url);
                url.to_string()
            }
        };
        self.submit(&elements).await.map_err(|e| {
            LoginError::from_page(e, self.context(url, Phase::Submission, "could not submit the form", started))
        })?;
        if let Some(config) = primary {
            self.settle(config.additional_wait()).await?;
        }

        // Verification
        let verify_budget = Budget::new(self.cancel.clone(), deadlines.verification);
        let assessment = self
            .verifier
            .verify_until_settled(
                page,
                &elements,
                primary,
                &original_url,
                &verify_budget,
                self.settings.verification_poll,
            )
            .await
            .map_err(|e| match e {
                VerifyError::Cancelled => LoginError::Cancelled,
                VerifyError::Page(e) => LoginError::from_page(
                    e,
                    self.context(url, Phase::Verification, "verification failed", started),
                ),
            })?;
        report.assessment = Some(assessment.clone());

        if assessment.success {
            return Ok(());
        }

        let ctx = self
            .context(url, Phase::Verification, assessment.reason.clone(), started)
            .with_tiers(scan.attempted)
            .with_confidence(assessment.confidence);
        if assessment.is_ambiguous() {
            Err(LoginError::VerificationAmbiguous(Box::new(ctx)))
        } else {
            Err(LoginError::InvalidCredentials(Box::new(ctx)))
        }
    }

    /// Click submit, else a generic submit button, else press Enter in the
    /// password field
    async fn submit(&self, elements: &FormElements<P::Element>) -> Result<(), PageError> {
        let page = self.page;

        if let Some(submit) = &elements.submit {
            match page.click(submit).await {
                Ok(()) => {
                    debug!("Clicked submit");
                    return Ok(());
                }
                Err(e) if e.is_transient() => debug!("Submit click failed ({}); trying fallbacks", e),
                Err(e) => return Err(e),
            }
        }

        for css in SUBMIT_SELECTORS {
            if let Some(button) = first_usable(page, Selector::Css(css)).await? {
                debug!("Clicking fallback submit {}", css);
                page.click(&button).await?;
                return Ok(());
            }
        }

        if let Some(password) = &elements.password {
            debug!("No submit button; pressing Enter in the password field");
            return page.send_keys(password, ENTER_KEY).await;
        }

        Err(PageError::new(PageErrorKind::NoSuchElement, "nothing to submit the form with"))
    }

    fn entry_failure(&self, error: EntryError, url: &str, phase: Phase, started: Instant) -> LoginError {
        match error {
            EntryError::Interrupted(Interrupt::Cancelled) => LoginError::Cancelled,
            EntryError::Interrupted(Interrupt::DeadlineExceeded) => LoginError::Timeout(Box::new(
                self.context(url, phase, "entry deadline passed", started),
            )),
            EntryError::Page(e) if e.is_transient() => LoginError::CredentialEntry(Box::new(
                self.context(url, phase, e.to_string(), started),
            )),
            EntryError::Page(e) => LoginError::from_page(e, self.context(url, phase, "field interaction failed", started)),
        }
    }
}
