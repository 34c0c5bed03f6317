//! The four detection tiers.
//!
//! Each tier looks only for the fields it is asked for and returns whatever it
//! found; merging and ordering happen in [`super::FormDetector`].

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

use crate::config::LoginPageConfiguration;
use crate::errors::PageError;
use crate::page::{Page, Selector, first_usable};
use crate::types::{DetectionMethod, FieldKind, FormElements};

/// What a tier is looking for
#[derive(Debug, Clone)]
pub struct DetectionRequest<'a> {
    pub url: &'a str,
    /// Matching configurations, highest priority first
    pub configs: Vec<&'a LoginPageConfiguration>,
}

/// One detection strategy
#[async_trait]
pub trait DetectionTier<P: Page>: Send + Sync {
    fn method(&self) -> DetectionMethod;

    /// Look for `wanted` fields on the current context of `page`
    async fn detect(
        &self,
        page: &P,
        request: &DetectionRequest<'_>,
        wanted: &[FieldKind],
    ) -> Result<FormElements<P::Element>, PageError>;
}

/// Tier 1: selectors listed by matching site configurations
pub struct UrlConfigTier;

#[async_trait]
impl<P: Page> DetectionTier<P> for UrlConfigTier {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::UrlConfiguration
    }

    async fn detect(
        &self,
        page: &P,
        request: &DetectionRequest<'_>,
        wanted: &[FieldKind],
    ) -> Result<FormElements<P::Element>, PageError> {
        let mut found = FormElements::empty();
        found.method = Some(DetectionMethod::UrlConfiguration);

        for kind in wanted {
            'configs: for config in &request.configs {
                for raw in config.selectors(*kind) {
                    if let Some(element) = first_usable(page, Selector::parse(raw)).await? {
                        debug!("{} matched configured selector {}", kind, raw);
                        found.set(*kind, element, DetectionMethod::UrlConfiguration);
                        break 'configs;
                    }
                }
            }
        }

        Ok(found)
    }
}

pub const USERNAME_SELECTORS: &[&str] = &[
    "input[autocomplete='username']",
    "input[name*='user' i]:not([type='password']):not([type='hidden'])",
    "input[id*='user' i]:not([type='password']):not([type='hidden'])",
    "input[name*='login' i]:not([type='password']):not([type='hidden'])",
    "input[id*='login' i]:not([type='password']):not([type='hidden'])",
    "input[type='email']",
    "input[name*='email' i]:not([type='hidden'])",
    "input[id*='email' i]:not([type='hidden'])",
];

pub const PASSWORD_SELECTORS: &[&str] = &[
    "input[type='password']",
    "input[autocomplete='current-password']",
    "input[name*='pass' i]:not([type='hidden'])",
    "input[id*='pass' i]:not([type='hidden'])",
];

pub const DOMAIN_SELECTORS: &[&str] = &[
    "select[name*='domain' i]",
    "select[id*='domain' i]",
    "input[name*='domain' i]:not([type='hidden'])",
    "input[id*='domain' i]:not([type='hidden'])",
    "select[name*='tenant' i]",
    "select[name*='realm' i]",
];

pub const SUBMIT_SELECTORS: &[&str] = &[
    "button[type='submit']",
    "input[type='submit']",
    "button[id*='login' i]",
    "button[id*='signin' i]",
    "button[name*='login' i]",
    "input[type='button'][value*='log' i]",
    "button:not([type='button']):not([type='reset'])",
];

/// Generic selectors for a field, in priority order
pub fn common_selectors(kind: FieldKind) -> &'static [&'static str] {
    match kind {
        FieldKind::Username => USERNAME_SELECTORS,
        FieldKind::Password => PASSWORD_SELECTORS,
        FieldKind::Domain => DOMAIN_SELECTORS,
        FieldKind::Submit => SUBMIT_SELECTORS,
    }
}

/// Tier 2: hard-coded attribute heuristics
pub struct CommonAttributeTier;

#[async_trait]
impl<P: Page> DetectionTier<P> for CommonAttributeTier {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::CommonAttributes
    }

    async fn detect(
        &self,
        page: &P,
        _request: &DetectionRequest<'_>,
        wanted: &[FieldKind],
    ) -> Result<FormElements<P::Element>, PageError> {
        let mut found = FormElements::empty();
        found.method = Some(DetectionMethod::CommonAttributes);

        for kind in wanted {
            for css in common_selectors(*kind) {
                if let Some(element) = first_usable(page, Selector::Css(css)).await? {
                    debug!("{} matched heuristic {}", kind, css);
                    found.set(*kind, element, DetectionMethod::CommonAttributes);
                    break;
                }
            }
        }

        Ok(found)
    }
}

const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";

fn lowered(expr: &str) -> String {
    format!("translate({}, '{}', '{}')", expr, UPPER, LOWER)
}

/// Words a field's label or attributes tend to contain
pub fn semantic_terms(kind: FieldKind) -> &'static [&'static str] {
    match kind {
        FieldKind::Username => &["username", "user name", "user id", "email", "login", "user"],
        FieldKind::Password => &["password", "passcode", "pass"],
        FieldKind::Domain => &["domain", "tenant", "realm"],
        FieldKind::Submit => &["sign in", "log in", "login", "submit", "continue"],
    }
}

/// XPath queries tier 3 issues for a field, in order
pub fn structural_queries(kind: FieldKind) -> Vec<String> {
    let target = match kind {
        FieldKind::Username => {
            "input[not(@type='password') and not(@type='hidden') and not(@type='submit')]"
        }
        FieldKind::Password => "input[not(@type='hidden')]",
        FieldKind::Domain => "*[self::select or (self::input and not(@type='hidden'))]",
        FieldKind::Submit => "*[self::button or (self::input and (@type='submit' or @type='button'))]",
    };

    let mut queries = Vec::new();
    let terms = semantic_terms(kind);

    if kind == FieldKind::Submit {
        for term in terms {
            queries.push(format!(
                "//button[contains({}, '{}')]",
                lowered("normalize-space(.)"),
                term
            ));
            queries.push(format!(
                "//input[(@type='submit' or @type='button') and contains({}, '{}')]",
                lowered("@value"),
                term
            ));
        }
        return queries;
    }

    for term in terms {
        queries.push(format!(
            "//label[contains({}, '{}')]/following::{}[1]",
            lowered("normalize-space(.)"),
            term,
            target
        ));
    }

    let tag = if kind == FieldKind::Domain { "*[self::input or self::select]" } else { "input" };
    for attribute in ["@name", "@id", "@placeholder", "@aria-label"] {
        for term in terms {
            queries.push(format!(
                "//{}[contains({}, '{}')]",
                tag,
                lowered(attribute),
                term
            ));
        }
    }

    if kind == FieldKind::Password {
        // Attribute matches on "pass" must still be password inputs
        queries.retain(|q| q.starts_with("//label") || q.contains("password"));
        queries.push("//input[@type='password']".to_string());
    }

    queries
}

/// Tier 3: label proximity and attribute-translation XPath
pub struct StructuralTier;

#[async_trait]
impl<P: Page> DetectionTier<P> for StructuralTier {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Structural
    }

    async fn detect(
        &self,
        page: &P,
        _request: &DetectionRequest<'_>,
        wanted: &[FieldKind],
    ) -> Result<FormElements<P::Element>, PageError> {
        let mut found = FormElements::empty();
        found.method = Some(DetectionMethod::Structural);

        for kind in wanted {
            for query in structural_queries(*kind) {
                if let Some(element) = first_usable(page, Selector::XPath(&query)).await? {
                    debug!("{} matched structural query {}", kind, query);
                    found.set(*kind, element, DetectionMethod::Structural);
                    break;
                }
            }
        }

        Ok(found)
    }
}

type SearchFuture<'a, E> =
    Pin<Box<dyn Future<Output = Result<Option<FormElements<E>>, PageError>> + Send + 'a>>;

/// Tier 4: re-run tiers 1-3 inside frames and shadow roots.
///
/// On success the page is left inside the context holding the form, since
/// the handles are only usable from there.
pub struct NestedContextTier<P: Page> {
    inner: Vec<Box<dyn DetectionTier<P>>>,
    max_depth: usize,
}

impl<P: Page + 'static> NestedContextTier<P> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: vec![
                Box::new(UrlConfigTier),
                Box::new(CommonAttributeTier),
                Box::new(StructuralTier),
            ],
            max_depth,
        }
    }
}

impl<P: Page> NestedContextTier<P> {
    async fn detect_here(
        &self,
        page: &P,
        request: &DetectionRequest<'_>,
        wanted: &[FieldKind],
    ) -> Result<FormElements<P::Element>, PageError> {
        let mut found = FormElements::empty();
        for tier in &self.inner {
            let missing = found.missing(wanted);
            if missing.is_empty() {
                break;
            }
            let candidate = tier.detect(page, request, &missing).await?;
            found.merge_gaps(candidate);
        }
        Ok(found)
    }

    fn search<'a>(
        &'a self,
        page: &'a P,
        request: &'a DetectionRequest<'a>,
        wanted: &'a [FieldKind],
        depth: usize,
    ) -> SearchFuture<'a, P::Element> {
        Box::pin(async move {
            if depth >= self.max_depth {
                return Ok(None);
            }

            for context in page.nested_contexts().await? {
                if let Err(e) = page.enter_context(&context).await {
                    debug!("Could not enter {} at depth {}: {}", context.kind(), depth, e);
                    continue;
                }

                match self.search_inside(page, request, wanted, depth).await {
                    Ok(Some(found)) => {
                        debug!("Form found inside {} at depth {}", context.kind(), found.context_depth);
                        return Ok(Some(found));
                    }
                    Ok(None) => page.leave_context().await?,
                    Err(e) => {
                        // Leave before reporting so later lookups run at the right level
                        if let Err(leave) = page.leave_context().await {
                            debug!("Could not leave {} after error: {}", context.kind(), leave);
                        }
                        return Err(e);
                    }
                }
            }

            Ok(None)
        })
    }

    /// Look in the context just entered, then below it
    async fn search_inside(
        &self,
        page: &P,
        request: &DetectionRequest<'_>,
        wanted: &[FieldKind],
        depth: usize,
    ) -> Result<Option<FormElements<P::Element>>, PageError> {
        let mut found = self.detect_here(page, request, wanted).await?;
        if found.is_valid() {
            found.context_depth = depth + 1;
            return Ok(Some(found));
        }
        self.search(page, request, wanted, depth + 1).await
    }
}

#[async_trait]
impl<P: Page> DetectionTier<P> for NestedContextTier<P> {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::NestedContext
    }

    async fn detect(
        &self,
        page: &P,
        request: &DetectionRequest<'_>,
        wanted: &[FieldKind],
    ) -> Result<FormElements<P::Element>, PageError> {
        // A nested form is self-contained, so look for everything asked for
        // plus the username/password pair even if the top level had one.
        let mut fields: Vec<FieldKind> = wanted.to_vec();
        for kind in [FieldKind::Username, FieldKind::Password] {
            if !fields.contains(&kind) {
                fields.push(kind);
            }
        }

        match self.search(page, request, &fields, 0).await? {
            Some(found) => {
                let mut relabeled = FormElements::empty();
                relabeled.context_depth = found.context_depth;
                relabeled.method = Some(DetectionMethod::NestedContext);
                let FormElements {
                    username,
                    password,
                    domain,
                    submit,
                    ..
                } = found;
                for (kind, element) in [
                    (FieldKind::Username, username),
                    (FieldKind::Password, password),
                    (FieldKind::Domain, domain),
                    (FieldKind::Submit, submit),
                ] {
                    if let Some(element) = element {
                        relabeled.set(kind, element, DetectionMethod::NestedContext);
                    }
                }
                Ok(relabeled)
            }
            None => Ok(FormElements::empty()),
        }
    }
}
