//! Domain field handling.
//!
//! The requested domain string is turned into a [`DomainDirective`] once per
//! attempt. `Skip` means the domain element is never touched, even when the
//! page has one.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LoginPageConfiguration;
use crate::detection::FormDetector;
use crate::errors::PageError;
use crate::page::{Page, SelectOption};
use crate::types::{FieldKind, FormElements};
use crate::wait::{Budget, Interrupt};

/// What the caller asked for, before looking at the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainRequest {
    Skip,
    Value(String),
}

impl DomainRequest {
    /// Empty, absent and sentinel values (case-insensitive) all mean skip
    pub fn parse(raw: Option<&str>, sentinel: &str) -> Self {
        match raw.map(str::trim) {
            None => DomainRequest::Skip,
            Some("") => DomainRequest::Skip,
            Some(value) if value.eq_ignore_ascii_case(sentinel.trim()) => DomainRequest::Skip,
            Some(value) => DomainRequest::Value(value.to_string()),
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            DomainRequest::Skip => None,
            DomainRequest::Value(v) => Some(v),
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, DomainRequest::Skip)
    }
}

/// Resolved intent for the domain field in one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", content = "value", rename_all = "snake_case")]
pub enum DomainDirective {
    /// The field was found by the initial detection pass
    Present(String),
    /// The field is expected to appear once the password is entered
    DeferredUntilAfterPassword(String),
    /// No domain detection or entry at all
    Skip,
}

impl DomainDirective {
    /// Decide from the request and whether initial detection saw a domain field
    pub fn resolve(request: &DomainRequest, domain_detected: bool) -> Self {
        match request {
            DomainRequest::Skip => DomainDirective::Skip,
            DomainRequest::Value(value) if domain_detected => DomainDirective::Present(value.clone()),
            DomainRequest::Value(value) => DomainDirective::DeferredUntilAfterPassword(value.clone()),
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            DomainDirective::Present(v) | DomainDirective::DeferredUntilAfterPassword(v) => Some(v),
            DomainDirective::Skip => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, DomainDirective::Skip)
    }
}

/// Pick the dropdown option for `wanted`.
///
/// Exact value match wins, then case-insensitive exact text, then the option
/// sharing the longest containment with `wanted`. An option whose text is
/// shorter than [`MIN_CONTAINED_LEN`] only matches by containing `wanted`.
pub fn match_option<'a>(options: &'a [SelectOption], wanted: &str) -> Option<&'a SelectOption> {
    let wanted = wanted.trim();
    let lower = wanted.to_lowercase();

    if let Some(option) = options.iter().find(|o| o.value == wanted) {
        return Some(option);
    }

    if let Some(option) = options
        .iter()
        .find(|o| o.text.trim().to_lowercase() == lower)
    {
        return Some(option);
    }

    if lower.is_empty() {
        return None;
    }

    // First option with the longest overlap wins ties
    let mut best: Option<(&SelectOption, usize)> = None;
    for option in options {
        let overlap = containment_overlap(option, &lower);
        if overlap > 0 && best.is_none_or(|(_, longest)| overlap > longest) {
            best = Some((option, overlap));
        }
    }
    best.map(|(option, _)| option)
}

/// Shortest option text that may match by being contained in the request
pub const MIN_CONTAINED_LEN: usize = 3;

/// Length of the text shared by containment, 0 when neither contains the other
fn containment_overlap(option: &SelectOption, lower: &str) -> usize {
    let text = option.text.trim().to_lowercase();
    let value = option.value.to_lowercase();

    if (!text.is_empty() && text.contains(lower)) || (!value.is_empty() && value.contains(lower)) {
        return lower.chars().count();
    }
    let len = text.chars().count();
    if len >= MIN_CONTAINED_LEN && lower.contains(&text) {
        return len;
    }
    0
}

/// Write the domain into a dropdown or a text field.
///
/// Returns `Ok(false)` when a dropdown has no option matching `value`.
pub async fn populate<P: Page + ?Sized>(
    page: &P,
    element: &P::Element,
    value: &str,
    dispatch_events: bool,
) -> Result<bool, PageError> {
    let tag = page.tag_name(element).await?.to_lowercase();

    if tag == "select" {
        let options = page.select_options(element).await?;
        let Some(option) = match_option(&options, value) else {
            warn!("No domain option matches the requested domain ({} options)", options.len());
            return Ok(false);
        };
        debug!("Selecting domain option '{}'", option.text);
        page.select_by_value(element, &option.value).await?;
    } else {
        page.clear(element).await?;
        page.send_keys(element, value).await?;
    }

    if dispatch_events {
        page.dispatch_input_events(element).await?;
    }
    Ok(true)
}

/// Poll for a domain field that appears after the password was entered.
///
/// Bounded by `budget`; `Ok(None)` when the field never shows up. The
/// returned form holds only the domain field.
pub async fn await_deferred_field<P: Page>(
    page: &P,
    detector: &FormDetector<P>,
    url: &str,
    configs: &[&LoginPageConfiguration],
    budget: &Budget,
    poll_interval: Duration,
) -> Result<Option<FormElements<P::Element>>, DeferredError> {
    loop {
        let found = detector
            .scan_fields(page, url, configs, &[FieldKind::Domain])
            .await
            .map_err(DeferredError::Page)?;
        if found.has(FieldKind::Domain) {
            info!("Domain field appeared after password entry");
            return Ok(Some(found));
        }

        match budget.sleep(poll_interval).await {
            Ok(()) => continue,
            Err(Interrupt::DeadlineExceeded) => {
                debug!("Domain field did not appear within {:?}", budget.elapsed());
                return Ok(None);
            }
            Err(Interrupt::Cancelled) => return Err(DeferredError::Cancelled),
        }
    }
}

/// Why the deferred domain pass stopped without a verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredError {
    Page(PageError),
    Cancelled,
}
