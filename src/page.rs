//! Capability interface over the browser automation driver.
//!
//! The login engine only ever talks to a page through [`Page`]. The WebDriver
//! adapter in [`crate::webdriver`] implements it for a live browser; tests
//! implement it with an in-memory page.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{PageError, PageErrorKind};

/// WebDriver key code for Enter
pub const ENTER_KEY: &str = "\u{e007}";

/// How an element is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    Css(&'a str),
    XPath(&'a str),
}

impl<'a> Selector<'a> {
    /// Interpret a configured selector string.
    ///
    /// Strings prefixed with `xpath=` or starting like a path expression are
    /// XPath; everything else is CSS.
    pub fn parse(raw: &'a str) -> Self {
        let trimmed = raw.trim();
        if let Some(xpath) = trimmed.strip_prefix("xpath=") {
            Selector::XPath(xpath)
        } else if let Some(css) = trimmed.strip_prefix("css=") {
            Selector::Css(css)
        } else if trimmed.starts_with('/') || trimmed.starts_with("./") || trimmed.starts_with("(/") {
            Selector::XPath(trimmed)
        } else {
            Selector::Css(trimmed)
        }
    }

    pub fn as_str(&self) -> &'a str {
        match self {
            Selector::Css(s) | Selector::XPath(s) => s,
        }
    }
}

impl fmt::Display for Selector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(s) => write!(f, "css:{}", s),
            Selector::XPath(s) => write!(f, "xpath:{}", s),
        }
    }
}

/// One `<option>` of a dropdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            text: text.into(),
        }
    }
}

/// A nested rendering context reachable from the current one
#[derive(Debug, Clone)]
pub enum NestedContext<E> {
    /// An `<iframe>` or `<frame>` element
    Frame(E),
    /// An element hosting an open shadow root
    ShadowRoot(E),
}

impl<E> NestedContext<E> {
    pub fn host(&self) -> &E {
        match self {
            NestedContext::Frame(e) | NestedContext::ShadowRoot(e) => e,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NestedContext::Frame(_) => "frame",
            NestedContext::ShadowRoot(_) => "shadow root",
        }
    }
}

/// What the login engine needs from a browser page.
///
/// Element handles are owned by the current page load and become invalid
/// after navigation; implementations report that as
/// [`PageErrorKind::StaleElement`].
#[async_trait]
pub trait Page: Send + Sync {
    type Element: Clone + Send + Sync + fmt::Debug;

    /// Navigate the page and wait for it to settle
    async fn goto(&self, url: &str) -> Result<(), PageError>;

    /// All elements matching a selector in the current context
    async fn find_all(&self, selector: Selector<'_>) -> Result<Vec<Self::Element>, PageError>;

    async fn is_displayed(&self, element: &Self::Element) -> Result<bool, PageError>;

    async fn is_enabled(&self, element: &Self::Element) -> Result<bool, PageError>;

    async fn tag_name(&self, element: &Self::Element) -> Result<String, PageError>;

    async fn attr(&self, element: &Self::Element, name: &str) -> Result<Option<String>, PageError>;

    /// Rendered text of an element
    async fn text(&self, element: &Self::Element) -> Result<String, PageError>;

    async fn clear(&self, element: &Self::Element) -> Result<(), PageError>;

    async fn send_keys(&self, element: &Self::Element, text: &str) -> Result<(), PageError>;

    async fn click(&self, element: &Self::Element) -> Result<(), PageError>;

    /// Options of a `<select>` element
    async fn select_options(&self, element: &Self::Element) -> Result<Vec<SelectOption>, PageError>;

    async fn select_by_value(&self, element: &Self::Element, value: &str) -> Result<(), PageError>;

    /// Fire `input` and `change` events on an element for script-driven forms
    async fn dispatch_input_events(&self, element: &Self::Element) -> Result<(), PageError>;

    async fn current_url(&self) -> Result<String, PageError>;

    /// Visible text of the current document
    async fn page_text(&self) -> Result<String, PageError>;

    async fn execute(
        &self,
        script: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, PageError>;

    /// Frames and shadow roots directly reachable from the current context
    async fn nested_contexts(&self) -> Result<Vec<NestedContext<Self::Element>>, PageError>;

    /// Make a nested context current
    async fn enter_context(&self, context: &NestedContext<Self::Element>) -> Result<(), PageError>;

    /// Return to the context that was current before the last `enter_context`
    async fn leave_context(&self) -> Result<(), PageError>;
}

/// First element matching `selector` that is both displayed and enabled.
///
/// Elements whose state cannot be queried (detached mid-lookup) are skipped,
/// as are selectors the browser rejects.
pub async fn first_usable<P: Page + ?Sized>(
    page: &P,
    selector: Selector<'_>,
) -> Result<Option<P::Element>, PageError> {
    let candidates = match page.find_all(selector).await {
        Ok(candidates) => candidates,
        Err(e) if matches!(e.kind, PageErrorKind::NoSuchElement | PageErrorKind::InvalidSelector) => {
            tracing::debug!("Selector {} yielded nothing: {}", selector, e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    for element in candidates {
        match is_usable(page, &element).await {
            Ok(true) => return Ok(Some(element)),
            Ok(false) => continue,
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

/// Whether an element is displayed and enabled
pub async fn is_usable<P: Page + ?Sized>(page: &P, element: &P::Element) -> Result<bool, PageError> {
    Ok(page.is_displayed(element).await? && page.is_enabled(element).await?)
}
