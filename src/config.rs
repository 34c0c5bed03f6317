//! Site configurations and per-attempt settings.
//!
//! A [`ConfigSet`] is loaded once and shared read-only between attempts.
//! [`AttemptSettings`] is the immutable knob set injected at the CLI boundary.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::LoginError;
use crate::retry::RetryPolicy;
use crate::types::FieldKind;

/// Evidence to look for after submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    /// A selector that matches a displayed element
    Selector(String),
    /// Text that appears in the page, compared case-insensitively
    Text(String),
}

/// Detection and verification hints for one family of login pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginPageConfiguration {
    /// Regular expression matched against the page URL
    pub url_pattern: String,
    /// Higher wins when several configurations match
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub username_selectors: Vec<String>,
    #[serde(default)]
    pub password_selectors: Vec<String>,
    #[serde(default)]
    pub domain_selectors: Vec<String>,
    #[serde(default)]
    pub submit_selectors: Vec<String>,
    /// Extra settle time after navigation and after submission
    #[serde(default)]
    pub additional_wait_ms: u64,
    #[serde(default)]
    pub success_indicators: Vec<Indicator>,
    #[serde(default)]
    pub failure_indicators: Vec<Indicator>,
    /// The form only reacts to script-visible keystrokes and events
    #[serde(default)]
    pub requires_javascript: bool,
}

impl LoginPageConfiguration {
    pub fn new(url_pattern: impl Into<String>) -> Self {
        Self {
            url_pattern: url_pattern.into(),
            priority: 0,
            username_selectors: Vec::new(),
            password_selectors: Vec::new(),
            domain_selectors: Vec::new(),
            submit_selectors: Vec::new(),
            additional_wait_ms: 0,
            success_indicators: Vec::new(),
            failure_indicators: Vec::new(),
            requires_javascript: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_selectors(mut self, kind: FieldKind, selectors: &[&str]) -> Self {
        let selectors = selectors.iter().map(|s| s.to_string()).collect();
        match kind {
            FieldKind::Username => self.username_selectors = selectors,
            FieldKind::Password => self.password_selectors = selectors,
            FieldKind::Domain => self.domain_selectors = selectors,
            FieldKind::Submit => self.submit_selectors = selectors,
        }
        self
    }

    pub fn with_success(mut self, indicator: Indicator) -> Self {
        self.success_indicators.push(indicator);
        self
    }

    pub fn with_failure(mut self, indicator: Indicator) -> Self {
        self.failure_indicators.push(indicator);
        self
    }

    pub fn selectors(&self, kind: FieldKind) -> &[String] {
        match kind {
            FieldKind::Username => &self.username_selectors,
            FieldKind::Password => &self.password_selectors,
            FieldKind::Domain => &self.domain_selectors,
            FieldKind::Submit => &self.submit_selectors,
        }
    }

    pub fn additional_wait(&self) -> Duration {
        Duration::from_millis(self.additional_wait_ms)
    }
}

#[derive(Debug, Clone)]
struct CompiledEntry {
    pattern: Regex,
    config: LoginPageConfiguration,
}

/// Ordered, read-only collection of site configurations
#[derive(Debug, Clone, Default)]
pub struct ConfigSet {
    entries: Vec<CompiledEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    List(Vec<LoginPageConfiguration>),
    Sites { sites: Vec<LoginPageConfiguration> },
}

impl ConfigSet {
    /// Compile every URL pattern up front; a bad pattern rejects the whole set
    pub fn new(configs: Vec<LoginPageConfiguration>) -> Result<Self, LoginError> {
        let entries = configs
            .into_iter()
            .map(|config| {
                let pattern = Regex::new(&config.url_pattern).map_err(|e| {
                    LoginError::Configuration(format!(
                        "invalid url_pattern '{}': {}",
                        config.url_pattern, e
                    ))
                })?;
                Ok(CompiledEntry { pattern, config })
            })
            .collect::<Result<Vec<_>, LoginError>>()?;

        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse either a bare JSON array or `{"sites": [...]}`
    pub fn from_json_str(json: &str) -> Result<Self, LoginError> {
        let file: ConfigFile = serde_json::from_str(json)
            .map_err(|e| LoginError::Configuration(format!("invalid site configuration: {}", e)))?;
        let configs = match file {
            ConfigFile::List(configs) => configs,
            ConfigFile::Sites { sites } => sites,
        };
        Self::new(configs)
    }

    pub fn from_path(path: &Path) -> Result<Self, LoginError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            LoginError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let set = Self::from_json_str(&json)?;
        info!("Loaded {} site configuration(s) from {}", set.len(), path.display());
        Ok(set)
    }

    /// `~/.autologin/sites.json`, if a home directory is known
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".autologin").join("sites.json"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configurations whose pattern matches `url`, highest priority first.
    ///
    /// Entries with equal priority keep their load order.
    pub fn matching(&self, url: &str) -> Vec<&LoginPageConfiguration> {
        let mut matched: Vec<&LoginPageConfiguration> = self
            .entries
            .iter()
            .filter(|entry| entry.pattern.is_match(url))
            .map(|entry| &entry.config)
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!("{} configuration(s) match {}", matched.len(), url);
        matched
    }

    /// The highest-priority matching configuration
    pub fn primary(&self, url: &str) -> Option<&LoginPageConfiguration> {
        self.matching(url).into_iter().next()
    }
}

/// Deadlines for the three phases of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDeadlines {
    pub detection: Duration,
    pub entry: Duration,
    pub verification: Duration,
}

impl Default for PhaseDeadlines {
    fn default() -> Self {
        Self {
            detection: Duration::from_secs(20),
            entry: Duration::from_secs(30),
            verification: Duration::from_secs(15),
        }
    }
}

impl PhaseDeadlines {
    pub fn total(&self) -> Duration {
        self.detection + self.entry + self.verification
    }

    /// Scale all three down proportionally so they fit in `remaining`
    pub fn shrink_to(&self, remaining: Duration) -> Self {
        let total = self.total();
        if total <= remaining || total.is_zero() {
            return *self;
        }
        let ratio = remaining.as_secs_f64() / total.as_secs_f64();
        Self {
            detection: self.detection.mul_f64(ratio),
            entry: self.entry.mul_f64(ratio),
            verification: self.verification.mul_f64(ratio),
        }
    }
}

/// Timing of the progressive-form monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressiveSettings {
    /// How long each stage waits for its field
    pub stage_deadline: Duration,
    /// Cap on the sum of all stage deadlines
    pub max_total: Duration,
    /// Interval between page polls
    pub poll_interval: Duration,
}

impl Default for ProgressiveSettings {
    fn default() -> Self {
        Self {
            stage_deadline: Duration::from_secs(10),
            max_total: Duration::from_secs(25),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl ProgressiveSettings {
    /// Overall deadline for a three-stage reveal
    pub fn overall_deadline(&self) -> Duration {
        (self.stage_deadline * 3).min(self.max_total)
    }
}

/// Everything that tunes a login attempt
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub deadlines: PhaseDeadlines,
    /// Cap on the whole login including retries; phase deadlines shrink to fit
    pub overall_timeout: Option<Duration>,
    pub progressive: ProgressiveSettings,
    /// Interval between post-submission checks
    pub verification_poll: Duration,
    /// Pause between characters in humanized entry
    pub keystroke_delay: Duration,
    /// Domain value that disables all domain handling (case-insensitive)
    pub domain_skip_sentinel: String,
    pub retry: RetryPolicy,
    /// How many frames/shadow roots deep nested-context detection descends
    pub max_context_depth: usize,
    /// Navigate to the login URL at the start of each attempt
    pub navigate: bool,
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self {
            deadlines: PhaseDeadlines::default(),
            overall_timeout: None,
            progressive: ProgressiveSettings::default(),
            verification_poll: Duration::from_millis(500),
            keystroke_delay: Duration::from_millis(60),
            domain_skip_sentinel: "none".to_string(),
            retry: RetryPolicy::default(),
            max_context_depth: 3,
            navigate: true,
        }
    }
}

impl AttemptSettings {
    /// Phase deadlines for an attempt starting `elapsed` into the login
    pub fn deadlines_at(&self, elapsed: Duration) -> PhaseDeadlines {
        match self.overall_timeout {
            Some(overall) => self.deadlines.shrink_to(overall.saturating_sub(elapsed)),
            None => self.deadlines,
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
