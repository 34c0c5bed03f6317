//! # autologin
#![allow(clippy::uninlined_format_args)]
//!
//! Signs into arbitrary web login pages through WebDriver: finds the login
//! form, fills it, submits it and decides whether authentication worked.
//!
//! ## CLI Usage
//!
//! ```bash
//! # Log in (password from the environment keeps it out of shell history)
//! AUTOLOGIN_PASSWORD=secret autologin login "https://intranet.example.com/login" \
//!     --username alice --password-env AUTOLOGIN_PASSWORD
//!
//! # Pick a domain from the form's domain dropdown
//! autologin login "https://vpn.example.com" --username alice --password-env PW --domain CORP
//!
//! # "none" disables every domain interaction, even if the form has a domain field
//! autologin login "https://vpn.example.com" --username alice --password-env PW --domain none
//!
//! # Only report which fields would be used
//! autologin detect "https://intranet.example.com/login" --format simple
//!
//! # Chrome, visible window, site hints from a file
//! autologin login "https://app.example.com" --username alice --password-env PW \
//!     --browser chrome --no-headless --config ./sites.json
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr (`-v` or
//! `RUST_LOG=autologin=debug` for more). The exit code tells what happened:
//! 0 success, 2 form not found, 3 credentials rejected, 4 WebDriver failure,
//! 5 timeout, 6 ambiguous result, 1 anything else.
//!
//! ## Site configuration
//!
//! ```json
//! {
//!   "sites": [
//!     {
//!       "url_pattern": "^https://vpn\\.example\\.com/",
//!       "priority": 10,
//!       "username_selectors": ["input#login"],
//!       "domain_selectors": ["select#realm"],
//!       "additional_wait_ms": 500,
//!       "failure_indicators": [{ "text": "access denied" }],
//!       "success_indicators": [{ "selector": "#portal-home" }]
//!     }
//!   ]
//! }
//! ```
//!
//! ## Library Usage
//!
//! ```no_run
//! use autologin::{AttemptSettings, Browser, BrowserOptions, BrowserType, ConfigSet, Credentials, LoginSession};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let browser = Browser::connect(BrowserOptions::new(BrowserType::Firefox)).await?;
//! let configs = ConfigSet::empty();
//! let session = LoginSession::new(&browser, &configs, AttemptSettings::default());
//!
//! let outcome = session
//!     .login("https://example.com/login", &Credentials::new("alice", "secret"))
//!     .await?;
//! println!("success: {}", outcome.success);
//! # Ok(())
//! # }
//! ```

/// Site configurations and attempt settings
pub mod config;

/// Multi-tier login form detection
pub mod detection;

/// Domain field directive and population
pub mod domain;

/// Credential entry
pub mod entry;

/// Failure taxonomy and exit codes
pub mod errors;

/// Login attempt orchestration
pub mod login;

/// Detection metrics
pub mod metrics;

/// Browser page capability interface
pub mod page;

/// Progressive form state machine
pub mod progressive;

/// Retry policy and orchestrator
pub mod retry;

/// Type definitions shared across the crate
pub mod types;

/// Post-submission verification
pub mod verify;

/// Cancellable waits
pub mod wait;

/// WebDriver browser control
pub mod webdriver;

pub use config::{AttemptSettings, ConfigSet, Indicator, LoginPageConfiguration};
pub use detection::FormDetector;
pub use errors::{FailureClass, FailureContext, LoginError, PageError, PageErrorKind};
pub use login::{DetectionOutcome, LoginOutcome, LoginSession, OutcomeKind};
pub use metrics::{DetectionMetricsRecorder, MetricsStore};
pub use page::Page;
pub use retry::{RetryOrchestrator, RetryPolicy};
pub use types::{
    Credentials, DetectionMethod, FieldKind, FormElements, LoginAssessmentResult, OutputFormat,
    ViewportSize,
};
pub use verify::LoginVerifier;
pub use webdriver::{Browser, BrowserOptions, BrowserType};
