//! Failure taxonomy for login attempts.
//!
//! Driver-level failures surface as [`PageError`]; everything a login attempt can fail with is a
//! [`LoginError`], which classifies itself as transient, permanent or fatal for the retry layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::DetectionMethod;

/// What went wrong inside the browser automation driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorKind {
    /// The element handle no longer refers to a live node
    StaleElement,
    /// The element exists but cannot receive input right now
    NotInteractable,
    /// No element matched
    NoSuchElement,
    /// The selector itself was rejected by the browser
    InvalidSelector,
    /// A driver command timed out
    Timeout,
    /// The connection to the driver or the site failed
    Connection,
    /// Page script raised an exception
    Script,
    /// The driver itself failed (session gone, crash, protocol violation)
    Driver,
}

impl PageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageErrorKind::StaleElement => "stale element",
            PageErrorKind::NotInteractable => "element not interactable",
            PageErrorKind::NoSuchElement => "no such element",
            PageErrorKind::InvalidSelector => "invalid selector",
            PageErrorKind::Timeout => "timeout",
            PageErrorKind::Connection => "connection failure",
            PageErrorKind::Script => "script error",
            PageErrorKind::Driver => "driver failure",
        }
    }
}

impl fmt::Display for PageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a [`crate::page::Page`] implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct PageError {
    pub kind: PageErrorKind,
    pub message: String,
}

impl PageError {
    pub fn new(kind: PageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a raw driver message.
    ///
    /// WebDriver implementations report failures as free text, so the kind is
    /// recovered from well-known phrases in the message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let kind = if lower.contains("stale element") || lower.contains("stale_element") {
            PageErrorKind::StaleElement
        } else if lower.contains("not interactable")
            || lower.contains("click intercepted")
            || lower.contains("invalid element state")
        {
            PageErrorKind::NotInteractable
        } else if lower.contains("invalid selector") || lower.contains("not a valid xpath") {
            PageErrorKind::InvalidSelector
        } else if lower.contains("no such element") || lower.contains("unable to locate") {
            PageErrorKind::NoSuchElement
        } else if lower.contains("timeout") || lower.contains("timed out") {
            PageErrorKind::Timeout
        } else if lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("lost connection")
            || lower.contains("error sending request")
            || lower.contains("dns error")
            || lower.contains("net::err")
        {
            PageErrorKind::Connection
        } else if lower.contains("javascript error") || lower.contains("script error") {
            PageErrorKind::Script
        } else {
            PageErrorKind::Driver
        };

        Self { kind, message }
    }

    /// Whether the failure is expected to clear up on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            PageErrorKind::StaleElement
                | PageErrorKind::NotInteractable
                | PageErrorKind::NoSuchElement
                | PageErrorKind::Timeout
                | PageErrorKind::Connection
        )
    }
}

/// Retry eligibility of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Retried per policy
    Transient,
    /// Never retried, reported to the caller
    Permanent,
    /// Never retried, propagated immediately
    Fatal,
}

/// Phase of a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Navigation,
    Detection,
    ProgressiveReveal,
    DomainResolution,
    Entry,
    Submission,
    Verification,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Navigation => "navigation",
            Phase::Detection => "detection",
            Phase::ProgressiveReveal => "progressive reveal",
            Phase::DomainResolution => "domain resolution",
            Phase::Entry => "entry",
            Phase::Submission => "submission",
            Phase::Verification => "verification",
        };
        f.write_str(name)
    }
}

/// Diagnostic payload attached to every failure.
///
/// Carries enough for a caller to decide whether to capture a screenshot or
/// other artifact; nothing here touches the filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub url: String,
    pub phase: Phase,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempted_tiers: Vec<DetectionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_confidence: Option<u8>,
    pub elapsed_ms: u64,
    pub attempts: u32,
}

impl FailureContext {
    pub fn new(url: impl Into<String>, phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            phase,
            reason: reason.into(),
            attempted_tiers: Vec::new(),
            last_confidence: None,
            elapsed_ms: 0,
            attempts: 1,
        }
    }

    pub fn with_tiers(mut self, tiers: Vec<DetectionMethod>) -> Self {
        self.attempted_tiers = tiers;
        self
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.last_confidence = Some(confidence);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis() as u64;
        self
    }
}

/// Everything a login attempt can fail with
#[derive(Debug, Error)]
pub enum LoginError {
    /// No detection tier produced a usable form (exit code 2)
    #[error("login form not found on {}: {}", .0.url, .0.reason)]
    FormNotFound(Box<FailureContext>),

    /// A field could not be cleared or written (exit code 1)
    #[error("credential entry failed during {}: {}", .0.phase, .0.reason)]
    CredentialEntry(Box<FailureContext>),

    /// A phase deadline elapsed (exit code 5)
    #[error("{} phase timed out: {}", .0.phase, .0.reason)]
    Timeout(Box<FailureContext>),

    /// Neither success nor failure evidence was found (exit code 6)
    #[error("login result is ambiguous on {}: {}", .0.url, .0.reason)]
    VerificationAmbiguous(Box<FailureContext>),

    /// The site rejected the credentials (exit code 3)
    #[error("login rejected on {}: {}", .0.url, .0.reason)]
    InvalidCredentials(Box<FailureContext>),

    /// A page interaction failed in a way that may clear up on retry (exit code 1)
    #[error("page interaction failed during {}: {source}", .context.phase)]
    Interaction {
        source: PageError,
        context: Box<FailureContext>,
    },

    /// The automation driver itself failed (exit code 4)
    #[error("WebDriver failure during {}: {source}", .context.phase)]
    Driver {
        source: PageError,
        context: Box<FailureContext>,
    },

    /// Site configuration could not be loaded or compiled (exit code 1)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The attempt was cancelled by the caller (exit code 130)
    #[error("login attempt cancelled")]
    Cancelled,
}

impl LoginError {
    /// Wrap a driver error, choosing the variant from its kind
    pub fn from_page(source: PageError, context: FailureContext) -> Self {
        let context = Box::new(context);
        match source.kind {
            PageErrorKind::Driver | PageErrorKind::Script => LoginError::Driver { source, context },
            _ => LoginError::Interaction { source, context },
        }
    }

    /// Retry eligibility of this error
    pub fn class(&self) -> FailureClass {
        match self {
            LoginError::CredentialEntry(_) | LoginError::Timeout(_) => FailureClass::Transient,
            LoginError::Interaction { source, .. } => {
                if source.is_transient() {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
            LoginError::FormNotFound(_)
            | LoginError::VerificationAmbiguous(_)
            | LoginError::InvalidCredentials(_)
            | LoginError::Configuration(_)
            | LoginError::Cancelled => FailureClass::Permanent,
            LoginError::Driver { .. } => FailureClass::Fatal,
        }
    }

    pub fn context(&self) -> Option<&FailureContext> {
        match self {
            LoginError::FormNotFound(ctx)
            | LoginError::CredentialEntry(ctx)
            | LoginError::Timeout(ctx)
            | LoginError::VerificationAmbiguous(ctx)
            | LoginError::InvalidCredentials(ctx) => Some(ctx),
            LoginError::Interaction { context, .. } | LoginError::Driver { context, .. } => {
                Some(context)
            }
            LoginError::Configuration(_) | LoginError::Cancelled => None,
        }
    }

    pub fn context_mut(&mut self) -> Option<&mut FailureContext> {
        match self {
            LoginError::FormNotFound(ctx)
            | LoginError::CredentialEntry(ctx)
            | LoginError::Timeout(ctx)
            | LoginError::VerificationAmbiguous(ctx)
            | LoginError::InvalidCredentials(ctx) => Some(ctx),
            LoginError::Interaction { context, .. } | LoginError::Driver { context, .. } => {
                Some(context)
            }
            LoginError::Configuration(_) | LoginError::Cancelled => None,
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            LoginError::FormNotFound(_) => 2,
            LoginError::InvalidCredentials(_) => 3,
            LoginError::Driver { .. } => 4,
            LoginError::Timeout(_) => 5,
            LoginError::VerificationAmbiguous(_) => 6,
            LoginError::Cancelled => 130,
            LoginError::CredentialEntry(_)
            | LoginError::Interaction { .. }
            | LoginError::Configuration(_) => 1,
        }
    }
}

#[cfg(test)]
#[path = "errors_test.rs"]
mod errors_test;
