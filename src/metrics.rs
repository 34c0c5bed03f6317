//! Per-URL, per-tier detection outcomes used to reorder tiers for known sites.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::types::{DetectionAttempt, DetectionMethod};

/// Sink and oracle for detection outcomes
pub trait MetricsStore: Send + Sync {
    fn record_attempt(&self, attempt: DetectionAttempt);

    /// Tier that has worked best for this URL so far
    fn recommended_method(&self, url: &str) -> Option<DetectionMethod>;
}

/// Running totals for one tier on one URL
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodStats {
    pub attempts: u64,
    pub successes: u64,
    pub total_confidence: u64,
    pub total_duration_ms: u64,
}

impl MethodStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.total_confidence as f64 / self.attempts as f64
        }
    }

    pub fn mean_duration_ms(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.attempts as f64
        }
    }

    fn add(&mut self, attempt: &DetectionAttempt) {
        self.attempts += 1;
        if attempt.success {
            self.successes += 1;
        }
        self.total_confidence += u64::from(attempt.confidence);
        self.total_duration_ms += attempt.duration_ms;
    }
}

/// Serializable copy of all aggregates, keyed by normalized URL
pub type MetricsSnapshot = BTreeMap<String, BTreeMap<DetectionMethod, MethodStats>>;

/// Thread-safe recorder shared by concurrent login attempts
pub struct DetectionMetricsRecorder {
    stats: DashMap<String, HashMap<DetectionMethod, MethodStats>>,
    history: Mutex<VecDeque<DetectionAttempt>>,
    history_limit: usize,
}

impl Default for DetectionMetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionMetricsRecorder {
    pub fn new() -> Self {
        Self::with_history_limit(1000)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            stats: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    /// Convenience form of [`MetricsStore::record_attempt`]
    pub fn record(
        &self,
        url: &str,
        method: DetectionMethod,
        success: bool,
        confidence: u8,
        duration: Duration,
    ) {
        self.record_attempt(DetectionAttempt::new(url, method, success, confidence, duration));
    }

    pub fn stats_for(&self, url: &str, method: DetectionMethod) -> Option<MethodStats> {
        self.stats
            .get(&url_key(url))
            .and_then(|by_method| by_method.get(&method).cloned())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.stats
            .iter()
            .map(|entry| {
                let by_method = entry
                    .value()
                    .iter()
                    .map(|(method, stats)| (*method, stats.clone()))
                    .collect();
                (entry.key().clone(), by_method)
            })
            .collect()
    }

    /// Most recent attempts, oldest first
    pub fn recent(&self, limit: usize) -> Vec<DetectionAttempt> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

impl MetricsStore for DetectionMetricsRecorder {
    fn record_attempt(&self, attempt: DetectionAttempt) {
        let key = url_key(&attempt.url);
        self.stats
            .entry(key)
            .or_default()
            .entry(attempt.method)
            .or_default()
            .add(&attempt);

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(attempt);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    fn recommended_method(&self, url: &str) -> Option<DetectionMethod> {
        let by_method = self.stats.get(&url_key(url))?;
        let best = by_method
            .iter()
            .filter(|(_, stats)| stats.successes > 0)
            .max_by(|(a_method, a), (b_method, b)| {
                a.success_rate()
                    .total_cmp(&b.success_rate())
                    .then(a.mean_confidence().total_cmp(&b.mean_confidence()))
                    // Prefer the earlier tier on a tie
                    .then(b_method.cmp(a_method))
            })
            .map(|(method, _)| *method);
        debug!("Recommended method for {}: {:?}", url, best);
        best
    }
}

/// Normalize a URL to host + path so query strings don't split statistics
pub fn url_key(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default().to_lowercase();
            let path = parsed.path().trim_end_matches('/');
            format!("{}{}", host, path)
        }
        Err(_) => raw.trim().to_lowercase(),
    }
}

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_test;
