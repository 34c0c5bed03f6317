use anyhow::{Context, Result};
use async_trait::async_trait;
use fantoccini::elements::{Element, ElementRef};
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{PageError, PageErrorKind};
use crate::page::{NestedContext, Page, SelectOption, Selector};
use crate::types::ViewportSize;

/// W3C WebDriver key for element references in script results
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Supported browser types
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    /// Mozilla Firefox
    Firefox,
    /// Google Chrome/Chromium
    Chrome,
}

impl std::str::FromStr for BrowserType {
    type Err = anyhow::Error;

    /// Parse browser type from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "firefox" => Ok(BrowserType::Firefox),
            "chrome" | "chromium" => Ok(BrowserType::Chrome),
            _ => anyhow::bail!("Unsupported browser: {}", s),
        }
    }
}

impl BrowserType {
    /// Default WebDriver URL for this browser type
    pub fn default_webdriver_url(&self) -> &'static str {
        match self {
            BrowserType::Firefox => "http://localhost:4444",
            BrowserType::Chrome => "http://localhost:9515",
        }
    }

    fn driver_name(&self) -> &'static str {
        match self {
            BrowserType::Firefox => "geckodriver",
            BrowserType::Chrome => "chromedriver",
        }
    }
}

/// How to start a browser session
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub browser_type: BrowserType,
    /// Overrides the browser's default WebDriver URL
    pub webdriver_url: Option<String>,
    pub viewport: Option<ViewportSize>,
    pub headless: bool,
}

impl BrowserOptions {
    pub fn new(browser_type: BrowserType) -> Self {
        Self {
            browser_type,
            webdriver_url: None,
            viewport: None,
            headless: true,
        }
    }

    pub fn webdriver_url(&self) -> String {
        self.webdriver_url
            .clone()
            .unwrap_or_else(|| self.browser_type.default_webdriver_url().to_string())
    }
}

/// Where element lookups currently run
#[derive(Debug, Clone)]
enum Scope {
    Frame,
    Shadow(Element),
}

/// Browser session over a running WebDriver
pub struct Browser {
    client: Client,
    browser_type: BrowserType,
    scopes: Mutex<Vec<Scope>>,
    // Chrome needs its own user-data-dir; removed on drop
    _profile_dir: Option<TempDir>,
}

impl Browser {
    /// Connect to the WebDriver and open a session
    pub async fn connect(options: BrowserOptions) -> Result<Self> {
        let browser_type = options.browser_type;
        let webdriver_url = options.webdriver_url();
        info!("Connecting to {:?} WebDriver", browser_type);

        if !Self::is_webdriver_running(&webdriver_url).await {
            let driver_name = browser_type.driver_name();
            anyhow::bail!(
                "Cannot connect to {} WebDriver at {}.\n\
                Please ensure {} is running:\n\
                  For Firefox: geckodriver --port 4444\n\
                  For Chrome: chromedriver --port 9515",
                driver_name,
                webdriver_url,
                driver_name
            );
        }

        let profile_dir = match browser_type {
            BrowserType::Chrome => Some(
                tempfile::Builder::new()
                    .prefix("autologin-chrome-")
                    .tempdir()
                    .context("Failed to create Chrome profile directory")?,
            ),
            BrowserType::Firefox => None,
        };

        let caps = Self::capabilities(&options, profile_dir.as_ref());
        debug!("Connecting to WebDriver at {}", webdriver_url);

        let client = ClientBuilder::rustls()
            .capabilities(caps)
            .connect(&webdriver_url)
            .await
            .context("Failed to connect to WebDriver")?;

        if let Some(vp) = options.viewport {
            debug!("Setting viewport to {}x{}", vp.width, vp.height);
            if let Err(e) = client.set_window_size(vp.width, vp.height).await {
                debug!("Note: Could not set window size: {}", e);
            }
        }

        Ok(Browser {
            client,
            browser_type,
            scopes: Mutex::new(Vec::new()),
            _profile_dir: profile_dir,
        })
    }

    fn capabilities(
        options: &BrowserOptions,
        profile_dir: Option<&TempDir>,
    ) -> serde_json::Map<String, Value> {
        let mut caps = serde_json::Map::new();

        match options.browser_type {
            BrowserType::Firefox => {
                let mut args = Vec::new();
                if options.headless {
                    args.push("--headless".to_string());
                }
                if let Some(vp) = &options.viewport {
                    args.push(format!("--width={}", vp.width));
                    args.push(format!("--height={}", vp.height));
                }
                caps.insert("moz:firefoxOptions".to_string(), json!({ "args": args }));
            }
            BrowserType::Chrome => {
                let mut args = vec!["--no-sandbox".to_string()];
                if options.headless {
                    args.push("--headless=new".to_string());
                    args.push("--disable-gpu".to_string());
                    args.push("--disable-dev-shm-usage".to_string());
                }
                if let Some(vp) = &options.viewport {
                    args.push(format!("--window-size={},{}", vp.width, vp.height));
                }
                if let Some(dir) = profile_dir {
                    args.push(format!("--user-data-dir={}", dir.path().display()));
                }
                caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
            }
        }

        caps
    }

    async fn is_webdriver_running(url: &str) -> bool {
        let status_url = format!("{}/status", url.trim_end_matches('/'));

        match reqwest::get(&status_url).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub fn browser_type(&self) -> BrowserType {
        self.browser_type
    }

    pub async fn close(self) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }

    fn element_arg(element: &Element) -> Result<Value, PageError> {
        serde_json::to_value(element).map_err(|e| PageError::new(PageErrorKind::Script, e.to_string()))
    }

    /// Turn a script result holding element references into elements
    fn elements_from(&self, value: Value) -> Vec<Element> {
        let Value::Array(items) = value else {
            return Vec::new();
        };
        items
            .into_iter()
            .filter_map(|item| {
                item.get(ELEMENT_KEY)
                    .and_then(Value::as_str)
                    .map(|id| Element::from_element_id(self.client.clone(), ElementRef::from(id.to_string())))
            })
            .collect()
    }

    async fn shadow_host(&self) -> Option<Element> {
        match self.scopes.lock().await.last() {
            Some(Scope::Shadow(host)) => Some(host.clone()),
            _ => None,
        }
    }

    async fn query_shadow(&self, host: &Element, css: &str) -> Result<Vec<Element>, PageError> {
        let script = "const root = arguments[0].shadowRoot; \
                      return root ? Array.from(root.querySelectorAll(arguments[1])) : [];";
        let value = self
            .client
            .execute(script, vec![Self::element_arg(host)?, json!(css)])
            .await
            .map_err(page_error)?;
        Ok(self.elements_from(value))
    }
}

fn page_error(error: CmdError) -> PageError {
    PageError::from_message(error.to_string())
}

fn locator<'a>(selector: &Selector<'a>) -> Locator<'a> {
    match selector {
        Selector::Css(css) => Locator::Css(css),
        Selector::XPath(xpath) => Locator::XPath(xpath),
    }
}

#[async_trait]
impl Page for Browser {
    type Element = Element;

    async fn goto(&self, url: &str) -> Result<(), PageError> {
        info!("Navigating to {}", url);
        self.client.goto(url).await.map_err(page_error)?;
        self.scopes.lock().await.clear();

        // Wait for the page to be ready to avoid stale element references
        let wait_script = "return document.readyState === 'complete';";
        for _ in 0..20 {
            match self.client.execute(wait_script, vec![]).await {
                Ok(val) if val.as_bool().unwrap_or(false) => break,
                _ => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
            }
        }
        Ok(())
    }

    async fn find_all(&self, selector: Selector<'_>) -> Result<Vec<Element>, PageError> {
        if let Some(host) = self.shadow_host().await {
            return match selector {
                Selector::Css(css) => self.query_shadow(&host, css).await,
                // XPath does not reach into shadow trees
                Selector::XPath(_) => Ok(Vec::new()),
            };
        }
        self.client
            .find_all(locator(&selector))
            .await
            .map_err(page_error)
    }

    async fn is_displayed(&self, element: &Element) -> Result<bool, PageError> {
        element.is_displayed().await.map_err(page_error)
    }

    async fn is_enabled(&self, element: &Element) -> Result<bool, PageError> {
        element.is_enabled().await.map_err(page_error)
    }

    async fn tag_name(&self, element: &Element) -> Result<String, PageError> {
        element.tag_name().await.map_err(page_error)
    }

    async fn attr(&self, element: &Element, name: &str) -> Result<Option<String>, PageError> {
        element.attr(name).await.map_err(page_error)
    }

    async fn text(&self, element: &Element) -> Result<String, PageError> {
        element.text().await.map_err(page_error)
    }

    async fn clear(&self, element: &Element) -> Result<(), PageError> {
        element.clear().await.map_err(page_error)
    }

    async fn send_keys(&self, element: &Element, text: &str) -> Result<(), PageError> {
        element.send_keys(text).await.map_err(page_error)
    }

    async fn click(&self, element: &Element) -> Result<(), PageError> {
        element.click().await.map_err(page_error)
    }

    async fn select_options(&self, element: &Element) -> Result<Vec<SelectOption>, PageError> {
        let options = element
            .find_all(Locator::Css("option"))
            .await
            .map_err(page_error)?;
        let mut result = Vec::with_capacity(options.len());
        for option in options {
            let value = option.attr("value").await.map_err(page_error)?;
            let text = option.text().await.map_err(page_error)?;
            result.push(SelectOption::new(value.unwrap_or_else(|| text.clone()), text));
        }
        Ok(result)
    }

    async fn select_by_value(&self, element: &Element, value: &str) -> Result<(), PageError> {
        element.select_by_value(value).await.map_err(page_error)
    }

    async fn dispatch_input_events(&self, element: &Element) -> Result<(), PageError> {
        let script = "const el = arguments[0]; \
                      el.dispatchEvent(new Event('input', { bubbles: true })); \
                      el.dispatchEvent(new Event('change', { bubbles: true }));";
        self.client
            .execute(script, vec![Self::element_arg(element)?])
            .await
            .map_err(page_error)?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.client.current_url().await.map_err(page_error)?.to_string())
    }

    async fn page_text(&self) -> Result<String, PageError> {
        let value = self
            .client
            .execute("return document.body ? document.body.innerText : '';", vec![])
            .await
            .map_err(page_error)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, PageError> {
        self.client.execute(script, args).await.map_err(page_error)
    }

    async fn nested_contexts(&self) -> Result<Vec<NestedContext<Element>>, PageError> {
        let shadow = self.shadow_host().await;

        let frames = match &shadow {
            Some(host) => self.query_shadow(host, "iframe, frame").await?,
            None => self
                .client
                .find_all(Locator::Css("iframe, frame"))
                .await
                .map_err(page_error)?,
        };

        let hosts_script = "const root = arguments.length ? arguments[0].shadowRoot : document; \
                            return root ? Array.from(root.querySelectorAll('*')).filter(e => e.shadowRoot) : [];";
        let args = match &shadow {
            Some(host) => vec![Self::element_arg(host)?],
            None => Vec::new(),
        };
        let hosts = self
            .client
            .execute(hosts_script, args)
            .await
            .map(|value| self.elements_from(value))
            .map_err(page_error)?;

        debug!("Found {} frame(s) and {} shadow host(s)", frames.len(), hosts.len());
        Ok(frames
            .into_iter()
            .map(NestedContext::Frame)
            .chain(hosts.into_iter().map(NestedContext::ShadowRoot))
            .collect())
    }

    async fn enter_context(&self, context: &NestedContext<Element>) -> Result<(), PageError> {
        let mut scopes = self.scopes.lock().await;
        match context {
            NestedContext::Frame(frame) => {
                frame.clone().enter_frame().await.map_err(page_error)?;
                scopes.push(Scope::Frame);
            }
            NestedContext::ShadowRoot(host) => scopes.push(Scope::Shadow(host.clone())),
        }
        Ok(())
    }

    async fn leave_context(&self) -> Result<(), PageError> {
        let mut scopes = self.scopes.lock().await;
        if let Some(Scope::Frame) = scopes.pop() {
            self.client.enter_parent_frame().await.map_err(page_error)?;
        }
        Ok(())
    }
}
