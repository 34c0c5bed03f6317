//! Multi-tier login form detection.
//!
//! Tiers run in a fixed order (optionally with one promoted by past metrics)
//! and each one only fills fields that are still missing. Detection stops as
//! soon as username and password are both known.

pub mod tiers;

use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConfigSet, LoginPageConfiguration};
use crate::errors::PageError;
use crate::metrics::MetricsStore;
use crate::page::Page;
use crate::types::{DetectionAttempt, DetectionMethod, FieldKind, FormElements};
use crate::wait::{Budget, Interrupt};

pub use tiers::{
    CommonAttributeTier, DetectionRequest, DetectionTier, NestedContextTier, StructuralTier,
    UrlConfigTier, common_selectors, structural_queries,
};

/// Result of a full detection pass
#[derive(Debug, Clone)]
pub struct DetectionReport<E> {
    pub elements: FormElements<E>,
    /// Tiers that actually ran, in run order
    pub attempted: Vec<DetectionMethod>,
    /// Set when the pass was cut short by its budget
    pub interrupted: Option<Interrupt>,
}

impl<E> DetectionReport<E> {
    pub fn is_valid(&self) -> bool {
        self.elements.is_valid()
    }
}

/// Fields a detection pass looks for
pub fn wanted_fields(want_domain: bool) -> Vec<FieldKind> {
    let mut fields = vec![FieldKind::Username, FieldKind::Password];
    if want_domain {
        fields.push(FieldKind::Domain);
    }
    fields.push(FieldKind::Submit);
    fields
}

/// Whether the domain field counts toward the expected set for scoring
pub fn domain_expected(configs: &[&LoginPageConfiguration], want_domain: bool) -> bool {
    want_domain && configs.iter().any(|c| !c.domain_selectors.is_empty())
}

/// Detection confidence in [0, 100].
///
/// 60% is the mean tier weight of the expected fields that were found, 40% is
/// the fraction of expected fields found. Expected fields are username,
/// password and submit, plus domain when `expect_domain` is set.
pub fn score<E>(elements: &FormElements<E>, expect_domain: bool) -> u8 {
    let mut expected = vec![FieldKind::Username, FieldKind::Password, FieldKind::Submit];
    if expect_domain {
        expected.push(FieldKind::Domain);
    }

    let weights: Vec<f64> = expected
        .iter()
        .filter(|kind| elements.has(**kind))
        .map(|kind| {
            elements
                .source(*kind)
                .or(elements.method)
                .map(|m| m.weight())
                .unwrap_or(0.0)
        })
        .collect();

    if weights.is_empty() {
        return 0;
    }

    let mean_weight = weights.iter().sum::<f64>() / weights.len() as f64;
    let coverage = weights.len() as f64 / expected.len() as f64;
    let raw = 100.0 * (0.6 * mean_weight + 0.4 * coverage);
    raw.round().clamp(0.0, 100.0) as u8
}

/// Runs the detection tiers against a page
pub struct FormDetector<P: Page> {
    tiers: Vec<Box<dyn DetectionTier<P>>>,
}

impl<P: Page + 'static> FormDetector<P> {
    /// The standard four tiers in order
    pub fn new(max_context_depth: usize) -> Self {
        Self {
            tiers: vec![
                Box::new(UrlConfigTier),
                Box::new(CommonAttributeTier),
                Box::new(StructuralTier),
                Box::new(NestedContextTier::new(max_context_depth)),
            ],
        }
    }
}

impl<P: Page> FormDetector<P> {
    pub fn with_tiers(tiers: Vec<Box<dyn DetectionTier<P>>>) -> Self {
        Self { tiers }
    }

    pub fn methods(&self) -> Vec<DetectionMethod> {
        self.tiers.iter().map(|t| t.method()).collect()
    }

    /// Tier order for this run, with the recommended tier promoted to the front
    fn ordered(&self, recommended: Option<DetectionMethod>) -> Vec<&dyn DetectionTier<P>> {
        let mut ordered: Vec<&dyn DetectionTier<P>> = self.tiers.iter().map(|t| t.as_ref()).collect();
        if let Some(method) = recommended
            && let Some(pos) = ordered.iter().position(|t| t.method() == method)
        {
            let tier = ordered.remove(pos);
            ordered.insert(0, tier);
        }
        ordered
    }

    /// `detect(page, url, configSet)`: a valid form or nothing
    pub async fn detect(
        &self,
        page: &P,
        url: &str,
        configs: &ConfigSet,
    ) -> Result<Option<FormElements<P::Element>>, PageError> {
        let matched = configs.matching(url);
        let budget = Budget::unbounded(CancellationToken::new());
        let report = self.scan(page, url, &matched, true, &budget, None).await?;
        Ok(report.is_valid().then_some(report.elements))
    }

    /// Full detection pass with budget, metrics bias and per-tier recording
    pub async fn scan(
        &self,
        page: &P,
        url: &str,
        configs: &[&LoginPageConfiguration],
        want_domain: bool,
        budget: &Budget,
        metrics: Option<&dyn MetricsStore>,
    ) -> Result<DetectionReport<P::Element>, PageError> {
        let request = DetectionRequest {
            url,
            configs: configs.to_vec(),
        };
        let wanted = wanted_fields(want_domain);
        let expect_domain = domain_expected(configs, want_domain);
        let recommended = metrics.and_then(|m| m.recommended_method(url));
        if let Some(method) = recommended {
            debug!("Trying {} first for {}", method, url);
        }

        let mut result = FormElements::empty();
        let mut attempted = Vec::new();
        let mut interrupted = None;

        for tier in self.ordered(recommended) {
            if let Err(interrupt) = budget.check() {
                debug!("Detection stopped before {}: {:?}", tier.method(), interrupt);
                interrupted = Some(interrupt);
                break;
            }

            let method = tier.method();
            let missing = result.missing(&wanted);
            let started = Instant::now();
            let candidate = tier.detect(page, &request, &missing).await?;
            attempted.push(method);

            let contributed = if method == DetectionMethod::NestedContext && candidate.is_valid() {
                // Handles from another browsing context cannot be mixed with
                // top-level ones
                result = candidate;
                true
            } else {
                !result.merge_gaps(candidate).is_empty()
            };

            result.confidence = score(&result, expect_domain);
            debug!(
                "{} {} (fields: {:?}, confidence {})",
                method,
                if contributed { "contributed" } else { "found nothing new" },
                result.found(),
                result.confidence
            );

            if let Some(store) = metrics {
                store.record_attempt(DetectionAttempt::new(
                    url,
                    method,
                    contributed,
                    result.confidence,
                    started.elapsed(),
                ));
            }

            if result.is_valid() {
                break;
            }
        }

        if result.is_valid() {
            info!(
                "Detected login form via {} with confidence {}",
                result.method.map(|m| m.as_str()).unwrap_or("unknown"),
                result.confidence
            );
        } else {
            debug!("No complete login form yet; found {:?}", result.found());
        }

        Ok(DetectionReport {
            elements: result,
            attempted,
            interrupted,
        })
    }

    /// Single quick pass of the top-level tiers for specific fields.
    ///
    /// Used by poll loops that are waiting for individual fields to appear;
    /// nested contexts are not searched.
    pub async fn scan_fields(
        &self,
        page: &P,
        url: &str,
        configs: &[&LoginPageConfiguration],
        wanted: &[FieldKind],
    ) -> Result<FormElements<P::Element>, PageError> {
        let request = DetectionRequest {
            url,
            configs: configs.to_vec(),
        };
        let mut found = FormElements::empty();

        for tier in &self.tiers {
            if tier.method() == DetectionMethod::NestedContext {
                continue;
            }
            let missing = found.missing(wanted);
            if missing.is_empty() {
                break;
            }
            let candidate = tier.detect(page, &request, &missing).await?;
            found.merge_gaps(candidate);
        }

        Ok(found)
    }
}
