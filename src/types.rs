use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Output format for CLI results
#[derive(Clone, Copy, Debug, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON format for programmatic consumption
    Json,
    /// Human-readable simple format
    Simple,
}

/// A login form field the detector looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Username,
    Password,
    Domain,
    Submit,
}

impl FieldKind {
    pub const ALL: [FieldKind; 4] = [
        FieldKind::Username,
        FieldKind::Password,
        FieldKind::Domain,
        FieldKind::Submit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Username => "username",
            FieldKind::Password => "password",
            FieldKind::Domain => "domain",
            FieldKind::Submit => "submit",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields already written during the current attempt
pub type FieldSet = BTreeSet<FieldKind>;

/// Detection strategy, in fixed tier order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Tier 1: selectors from the site's configuration
    UrlConfiguration,
    /// Tier 2: generic attribute heuristics
    CommonAttributes,
    /// Tier 3: label proximity and attribute XPath
    Structural,
    /// Tier 4: frames and shadow roots
    NestedContext,
}

impl DetectionMethod {
    pub const ALL: [DetectionMethod; 4] = [
        DetectionMethod::UrlConfiguration,
        DetectionMethod::CommonAttributes,
        DetectionMethod::Structural,
        DetectionMethod::NestedContext,
    ];

    /// Reliability weight used by confidence scoring; earlier tiers weigh more
    pub fn weight(&self) -> f64 {
        match self {
            DetectionMethod::UrlConfiguration => 1.0,
            DetectionMethod::CommonAttributes => 0.85,
            DetectionMethod::Structural => 0.7,
            DetectionMethod::NestedContext => 0.6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::UrlConfiguration => "url_configuration",
            DetectionMethod::CommonAttributes => "common_attributes",
            DetectionMethod::Structural => "structural",
            DetectionMethod::NestedContext => "nested_context",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        DetectionMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("Unknown detection method: {}", s))
    }
}

/// Located login form fields for one page load.
///
/// Handles are only valid until the page navigates. A form is usable once
/// both username and password are known.
#[derive(Debug, Clone)]
pub struct FormElements<E> {
    pub username: Option<E>,
    pub password: Option<E>,
    pub domain: Option<E>,
    pub submit: Option<E>,
    /// Tier that completed the form (or the last one that contributed)
    pub method: Option<DetectionMethod>,
    /// Detection confidence in [0, 100]
    pub confidence: u8,
    /// Tier that produced each field
    pub sources: Vec<(FieldKind, DetectionMethod)>,
    /// How many frames or shadow roots deep the fields live
    pub context_depth: usize,
}

impl<E> Default for FormElements<E> {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            domain: None,
            submit: None,
            method: None,
            confidence: 0,
            sources: Vec::new(),
            context_depth: 0,
        }
    }
}

impl<E> FormElements<E> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn is_empty(&self) -> bool {
        FieldKind::ALL.iter().all(|kind| !self.has(*kind))
    }

    pub fn get(&self, kind: FieldKind) -> Option<&E> {
        match kind {
            FieldKind::Username => self.username.as_ref(),
            FieldKind::Password => self.password.as_ref(),
            FieldKind::Domain => self.domain.as_ref(),
            FieldKind::Submit => self.submit.as_ref(),
        }
    }

    pub fn has(&self, kind: FieldKind) -> bool {
        self.get(kind).is_some()
    }

    fn slot(&mut self, kind: FieldKind) -> &mut Option<E> {
        match kind {
            FieldKind::Username => &mut self.username,
            FieldKind::Password => &mut self.password,
            FieldKind::Domain => &mut self.domain,
            FieldKind::Submit => &mut self.submit,
        }
    }

    /// Record a located field along with the tier that found it
    pub fn set(&mut self, kind: FieldKind, element: E, method: DetectionMethod) {
        *self.slot(kind) = Some(element);
        self.sources.retain(|(k, _)| *k != kind);
        self.sources.push((kind, method));
    }

    /// Forget a field, e.g. a domain element that must not be touched
    pub fn take(&mut self, kind: FieldKind) -> Option<E> {
        self.sources.retain(|(k, _)| *k != kind);
        self.slot(kind).take()
    }

    pub fn source(&self, kind: FieldKind) -> Option<DetectionMethod> {
        self.sources
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, method)| *method)
    }

    pub fn found(&self) -> Vec<FieldKind> {
        FieldKind::ALL
            .into_iter()
            .filter(|kind| self.has(*kind))
            .collect()
    }

    /// Fields from `wanted` that are still unknown
    pub fn missing(&self, wanted: &[FieldKind]) -> Vec<FieldKind> {
        wanted
            .iter()
            .copied()
            .filter(|kind| !self.has(*kind))
            .collect()
    }

    /// Fill only the fields that are still empty; returns what was filled
    pub fn merge_gaps(&mut self, mut candidate: FormElements<E>) -> Vec<FieldKind> {
        let mut filled = Vec::new();
        for kind in FieldKind::ALL {
            if self.has(kind) {
                continue;
            }
            let method = candidate.source(kind);
            if let Some(element) = candidate.take(kind) {
                let method = method
                    .or(candidate.method)
                    .unwrap_or(DetectionMethod::CommonAttributes);
                self.set(kind, element, method);
                filled.push(kind);
            }
        }
        if !filled.is_empty() {
            self.method = candidate.method.or(self.method);
        }
        filled
    }

    pub fn summary(&self) -> DetectionSummary {
        DetectionSummary {
            username: self.username.is_some(),
            password: self.password.is_some(),
            domain: self.domain.is_some(),
            submit: self.submit.is_some(),
            method: self.method,
            confidence: self.confidence,
            sources: self.sources.clone(),
            context_depth: self.context_depth,
            valid: self.is_valid(),
        }
    }
}

/// Serializable view of [`FormElements`] without the handles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub username: bool,
    pub password: bool,
    pub domain: bool,
    pub submit: bool,
    pub method: Option<DetectionMethod>,
    pub confidence: u8,
    pub sources: Vec<(FieldKind, DetectionMethod)>,
    pub context_depth: usize,
    pub valid: bool,
}

/// One detection tier run against one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionAttempt {
    pub id: Uuid,
    pub url: String,
    pub method: DetectionMethod,
    pub success: bool,
    pub confidence: u8,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl DetectionAttempt {
    pub fn new(
        url: impl Into<String>,
        method: DetectionMethod,
        success: bool,
        confidence: u8,
        duration: Duration,
    ) -> Self {
        let duration_ms = duration.as_millis() as u64;
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            method,
            success,
            confidence: confidence.min(100),
            started_at: Utc::now() - chrono::Duration::milliseconds(duration_ms as i64),
            duration_ms,
        }
    }
}

/// Which piece of evidence decided a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    FailureIndicator,
    SuccessIndicator,
    PasswordFieldGone,
    UrlChanged,
    PasswordFieldGoneAndUrlChanged,
    None,
}

/// Post-submission judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAssessmentResult {
    pub success: bool,
    /// Confidence in [0, 100]
    pub confidence: u8,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_indicator: Option<String>,
    pub evidence: Evidence,
}

impl LoginAssessmentResult {
    pub fn is_ambiguous(&self) -> bool {
        self.evidence == Evidence::None
    }
}

/// Credentials for one login attempt
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Requested domain; the skip sentinel disables all domain handling
    #[serde(default)]
    pub domain: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Browser viewport dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ViewportSize {
    /// Viewport width in pixels
    pub width: u32,
    /// Viewport height in pixels
    pub height: u32,
}

impl ViewportSize {
    /// Parse viewport size from "WIDTHxHEIGHT" format (e.g., "1920x1080")
    pub fn parse(s: &str) -> Result<Self> {
        let (width, height) = s
            .split_once('x')
            .ok_or_else(|| anyhow::anyhow!("Invalid viewport format. Use WIDTHxHEIGHT (e.g., 1920x1080)"))?;

        let width = width
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("Invalid width in viewport size"))?;
        let height = height
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("Invalid height in viewport size"))?;

        Ok(ViewportSize { width, height })
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
