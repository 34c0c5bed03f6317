// Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use autologin::config::{AttemptSettings, PhaseDeadlines, ProgressiveSettings};
use autologin::errors::{PageError, PageErrorKind};
use autologin::page::{ENTER_KEY, NestedContext, Page, SelectOption, Selector};
use autologin::retry::RetryPolicy;

pub const LOGIN_URL: &str = "https://portal.example.com/login";
pub const HOME_URL: &str = "https://portal.example.com/home";

// Generic selectors the heuristic tier tries first for each field
pub const USERNAME_CSS: &str = "input[autocomplete='username']";
pub const PASSWORD_CSS: &str = "input[type='password']";
pub const DOMAIN_CSS: &str = "select[name*='domain' i]";
pub const SUBMIT_CSS: &str = "button[type='submit']";

/// Handle to an element of a [`MockPage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockElement(pub usize);

/// Browsing context of a [`MockPage`]; `TOP` is the main document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextId(pub usize);

impl ContextId {
    pub const TOP: ContextId = ContextId(0);
}

/// Everything the engine did to the page, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    Goto(String),
    Clear(String),
    Keys(String, String),
    Click(String),
    Select(String, String),
    Events(String),
    EnterContext(String),
    LeaveContext,
}

impl Interaction {
    /// Name of the element this interaction wrote to, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            Interaction::Clear(name)
            | Interaction::Keys(name, _)
            | Interaction::Click(name)
            | Interaction::Select(name, _)
            | Interaction::Events(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

/// When an initially absent element joins the document
#[derive(Debug, Clone, Copy)]
pub enum Reveal {
    /// Once `trigger` holds at least this many characters
    AfterInput(MockElement, usize),
    /// This long after the last navigation
    AfterDelay(Duration),
    /// Never; only an effect can show it
    Never,
}

/// Description of one element
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    tag: String,
    selectors: Vec<String>,
    attrs: HashMap<String, String>,
    text: String,
    options: Vec<SelectOption>,
    displayed: bool,
    enabled: bool,
    reveal: Option<Reveal>,
    context: ContextId,
    submits: bool,
}

impl Field {
    pub fn new(tag: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
            selectors: Vec::new(),
            attrs: HashMap::new(),
            text: String::new(),
            options: Vec::new(),
            displayed: true,
            enabled: true,
            reveal: None,
            context: ContextId::TOP,
            submits: false,
        }
    }

    pub fn input(name: &str) -> Self {
        Self::new("input", name)
    }

    pub fn button(name: &str) -> Self {
        Self::new("button", name).submits()
    }

    pub fn select(name: &str, options: &[(&str, &str)]) -> Self {
        let mut field = Self::new("select", name);
        field.options = options
            .iter()
            .map(|(value, text)| SelectOption::new(*value, *text))
            .collect();
        field
    }

    /// Selector strings this element answers to
    pub fn matching(mut self, selector: &str) -> Self {
        self.selectors.push(selector.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.displayed = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn revealed(mut self, reveal: Reveal) -> Self {
        self.reveal = Some(reveal);
        self
    }

    pub fn inside(mut self, context: ContextId) -> Self {
        self.context = context;
        self
    }

    /// Clicking this element submits the form
    pub fn submits(mut self) -> Self {
        self.submits = true;
        self
    }
}

/// What the page does when the form is submitted
#[derive(Debug, Clone, Default)]
pub struct Effect {
    navigate_to: Option<String>,
    page_text: Option<String>,
    hide: Vec<MockElement>,
    show: Vec<MockElement>,
    detach: Vec<MockElement>,
}

impl Effect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn navigate(mut self, url: &str) -> Self {
        self.navigate_to = Some(url.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.page_text = Some(text.to_string());
        self
    }

    pub fn hide(mut self, element: MockElement) -> Self {
        self.hide.push(element);
        self
    }

    pub fn show(mut self, element: MockElement) -> Self {
        self.show.push(element);
        self
    }

    pub fn detach(mut self, element: MockElement) -> Self {
        self.detach.push(element);
        self
    }
}

#[derive(Debug, Clone)]
struct SubmitRule {
    expected: Vec<(MockElement, String)>,
    accepted: Effect,
    rejected: Effect,
}

#[derive(Debug)]
struct ElementState {
    field: Field,
    value: String,
    displayed: bool,
    detached: bool,
    forced_visible: bool,
}

#[derive(Debug)]
struct ContextInfo {
    host: MockElement,
    shadow: bool,
    parent: ContextId,
}

#[derive(Debug)]
struct State {
    url: String,
    base_text: String,
    text: String,
    elements: Vec<ElementState>,
    contexts: Vec<Option<ContextInfo>>,
    stack: Vec<ContextId>,
    log: Vec<Interaction>,
    navigated_at: Instant,
    goto_count: u32,
    goto_failures: VecDeque<PageErrorKind>,
    persistent_goto_failure: Option<PageErrorKind>,
    key_failures: HashMap<usize, (PageErrorKind, u32)>,
    click_failures: HashMap<usize, (PageErrorKind, u32)>,
    rejected_selectors: Vec<String>,
    context_find_failure: Option<(ContextId, PageErrorKind)>,
    url_failures: u32,
    submit_rule: Option<SubmitRule>,
    submissions: u32,
}

impl State {
    fn current(&self) -> ContextId {
        self.stack.last().copied().unwrap_or(ContextId::TOP)
    }

    fn in_document(&self, index: usize) -> bool {
        let element = &self.elements[index];
        if element.detached {
            return false;
        }
        if element.forced_visible {
            return true;
        }
        match element.field.reveal {
            None => true,
            Some(Reveal::AfterInput(trigger, chars)) => {
                self.elements[trigger.0].value.chars().count() >= chars
            }
            Some(Reveal::AfterDelay(delay)) => self.navigated_at.elapsed() >= delay,
            Some(Reveal::Never) => false,
        }
    }

    fn live(&self, element: &MockElement) -> Result<&ElementState, PageError> {
        let state = self
            .elements
            .get(element.0)
            .ok_or_else(|| PageError::new(PageErrorKind::NoSuchElement, "unknown element"))?;
        if state.detached || !self.in_document(element.0) {
            return Err(PageError::new(
                PageErrorKind::StaleElement,
                format!("stale element reference: {}", state.field.name),
            ));
        }
        Ok(state)
    }

    fn name(&self, element: &MockElement) -> String {
        self.elements[element.0].field.name.clone()
    }

    fn injected(failures: &mut HashMap<usize, (PageErrorKind, u32)>, element: &MockElement) -> Option<PageError> {
        let (kind, remaining) = failures.get_mut(&element.0)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(PageError::new(*kind, "injected failure"))
    }

    fn submit(&mut self) {
        self.submissions += 1;
        let Some(rule) = self.submit_rule.clone() else {
            return;
        };
        let accepted = rule
            .expected
            .iter()
            .all(|(element, value)| self.elements[element.0].value == *value);
        self.apply(if accepted { rule.accepted } else { rule.rejected });
    }

    fn apply(&mut self, effect: Effect) {
        if let Some(url) = effect.navigate_to {
            self.url = url;
        }
        if let Some(text) = effect.page_text {
            self.text = text;
        }
        for element in effect.hide {
            self.elements[element.0].displayed = false;
        }
        for element in effect.show {
            let state = &mut self.elements[element.0];
            state.displayed = true;
            state.forced_visible = true;
        }
        for element in effect.detach {
            self.elements[element.0].detached = true;
        }
    }
}

/// In-memory [`Page`] with scripted layout and behavior.
///
/// Elements match selectors by exact string, so tests list the selector
/// strings each element should answer to.
#[derive(Debug)]
pub struct MockPage {
    state: Mutex<State>,
}

impl MockPage {
    pub fn new(url: &str) -> Self {
        Self {
            state: Mutex::new(State {
                url: url.to_string(),
                base_text: String::new(),
                text: String::new(),
                elements: Vec::new(),
                contexts: vec![None],
                stack: Vec::new(),
                log: Vec::new(),
                navigated_at: Instant::now(),
                goto_count: 0,
                goto_failures: VecDeque::new(),
                persistent_goto_failure: None,
                key_failures: HashMap::new(),
                click_failures: HashMap::new(),
                rejected_selectors: Vec::new(),
                context_find_failure: None,
                url_failures: 0,
                submit_rule: None,
                submissions: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add(&self, field: Field) -> MockElement {
        let mut state = self.lock();
        let displayed = field.displayed;
        state.elements.push(ElementState {
            field,
            value: String::new(),
            displayed,
            detached: false,
            forced_visible: false,
        });
        MockElement(state.elements.len() - 1)
    }

    fn add_context(&self, host: Field, shadow: bool) -> (MockElement, ContextId) {
        let parent = host.context;
        let host = self.add(host);
        let mut state = self.lock();
        state.contexts.push(Some(ContextInfo {
            host,
            shadow,
            parent,
        }));
        (host, ContextId(state.contexts.len() - 1))
    }

    /// An iframe whose document can hold fields via [`Field::inside`]
    pub fn add_frame(&self, host: Field) -> (MockElement, ContextId) {
        self.add_context(host, false)
    }

    /// An element with an open shadow root
    pub fn add_shadow_host(&self, host: Field) -> (MockElement, ContextId) {
        self.add_context(host, true)
    }

    pub fn set_text(&self, text: &str) {
        let mut state = self.lock();
        state.base_text = text.to_string();
        state.text = text.to_string();
    }

    pub fn set_url(&self, url: &str) {
        self.lock().url = url.to_string();
    }

    pub fn apply(&self, effect: Effect) {
        self.lock().apply(effect);
    }

    /// Submitting always has this effect
    pub fn on_submit(&self, effect: Effect) {
        self.lock().submit_rule = Some(SubmitRule {
            expected: Vec::new(),
            accepted: effect,
            rejected: Effect::new(),
        });
    }

    /// Submitting has `accepted` when every field holds its expected value,
    /// `rejected` otherwise
    pub fn on_submit_expecting(&self, expected: &[(MockElement, &str)], accepted: Effect, rejected: Effect) {
        self.lock().submit_rule = Some(SubmitRule {
            expected: expected
                .iter()
                .map(|(element, value)| (*element, value.to_string()))
                .collect(),
            accepted,
            rejected,
        });
    }

    /// The next `goto` calls fail with these kinds, in order
    pub fn fail_gotos(&self, kinds: &[PageErrorKind]) {
        self.lock().goto_failures.extend(kinds.iter().copied());
    }

    /// Every `goto` fails with this kind
    pub fn always_fail_goto(&self, kind: PageErrorKind) {
        self.lock().persistent_goto_failure = Some(kind);
    }

    pub fn fail_keys(&self, element: MockElement, kind: PageErrorKind, times: u32) {
        self.lock().key_failures.insert(element.0, (kind, times));
    }

    pub fn fail_clicks(&self, element: MockElement, kind: PageErrorKind, times: u32) {
        self.lock().click_failures.insert(element.0, (kind, times));
    }

    /// The browser rejects this selector as invalid
    pub fn reject_selector(&self, selector: &str) {
        self.lock().rejected_selectors.push(selector.to_string());
    }

    /// Every `find_all` inside `context` fails with this kind
    pub fn fail_finds_inside(&self, context: ContextId, kind: PageErrorKind) {
        self.lock().context_find_failure = Some((context, kind));
    }

    /// The next `times` reads of the current URL fail
    pub fn fail_url_reads(&self, times: u32) {
        self.lock().url_failures = times;
    }

    pub fn value(&self, element: MockElement) -> String {
        self.lock().elements[element.0].value.clone()
    }

    pub fn log(&self) -> Vec<Interaction> {
        self.lock().log.clone()
    }

    /// Whether anything was written to, clicked or selected on `element`
    pub fn touched(&self, element: MockElement) -> bool {
        let state = self.lock();
        let name = state.name(&element);
        state.log.iter().any(|i| i.target() == Some(name.as_str()))
    }

    /// Every `send_keys` payload sent to `element`
    pub fn keys_for(&self, element: MockElement) -> Vec<String> {
        let state = self.lock();
        let name = state.name(&element);
        state
            .log
            .iter()
            .filter_map(|i| match i {
                Interaction::Keys(target, keys) if *target == name => Some(keys.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, interaction: &Interaction) -> usize {
        self.lock().log.iter().filter(|i| *i == interaction).count()
    }

    pub fn goto_count(&self) -> u32 {
        self.lock().goto_count
    }

    pub fn submissions(&self) -> u32 {
        self.lock().submissions
    }

    pub fn current_context(&self) -> ContextId {
        self.lock().current()
    }
}

#[async_trait]
impl Page for MockPage {
    type Element = MockElement;

    async fn goto(&self, url: &str) -> Result<(), PageError> {
        let mut state = self.lock();
        state.goto_count += 1;
        state.log.push(Interaction::Goto(url.to_string()));

        if let Some(kind) = state.goto_failures.pop_front().or(state.persistent_goto_failure) {
            return Err(PageError::new(kind, format!("navigation to {} failed", url)));
        }

        state.url = url.to_string();
        state.text = state.base_text.clone();
        state.stack.clear();
        state.navigated_at = Instant::now();
        for element in &mut state.elements {
            element.value.clear();
            element.displayed = element.field.displayed;
            element.detached = false;
            element.forced_visible = false;
        }
        Ok(())
    }

    async fn find_all(&self, selector: Selector<'_>) -> Result<Vec<MockElement>, PageError> {
        let state = self.lock();
        let wanted = selector.as_str();
        if state.rejected_selectors.iter().any(|s| s == wanted) {
            return Err(PageError::new(
                PageErrorKind::InvalidSelector,
                format!("invalid selector: {}", wanted),
            ));
        }
        let current = state.current();
        if let Some((context, kind)) = state.context_find_failure
            && context == current
        {
            return Err(PageError::new(kind, "lookup failed inside context"));
        }
        Ok((0..state.elements.len())
            .filter(|i| {
                let field = &state.elements[*i].field;
                field.context == current
                    && field.selectors.iter().any(|s| s == wanted)
                    && state.in_document(*i)
            })
            .map(MockElement)
            .collect())
    }

    async fn is_displayed(&self, element: &MockElement) -> Result<bool, PageError> {
        Ok(self.lock().live(element)?.displayed)
    }

    async fn is_enabled(&self, element: &MockElement) -> Result<bool, PageError> {
        Ok(self.lock().live(element)?.field.enabled)
    }

    async fn tag_name(&self, element: &MockElement) -> Result<String, PageError> {
        Ok(self.lock().live(element)?.field.tag.clone())
    }

    async fn attr(&self, element: &MockElement, name: &str) -> Result<Option<String>, PageError> {
        let state = self.lock();
        let live = state.live(element)?;
        if name == "value" {
            return Ok(Some(live.value.clone()));
        }
        Ok(live.field.attrs.get(name).cloned())
    }

    async fn text(&self, element: &MockElement) -> Result<String, PageError> {
        Ok(self.lock().live(element)?.field.text.clone())
    }

    async fn clear(&self, element: &MockElement) -> Result<(), PageError> {
        let mut state = self.lock();
        state.live(element)?;
        let name = state.name(element);
        state.elements[element.0].value.clear();
        state.log.push(Interaction::Clear(name));
        Ok(())
    }

    async fn send_keys(&self, element: &MockElement, text: &str) -> Result<(), PageError> {
        let mut state = self.lock();
        state.live(element)?;
        if let Some(error) = State::injected(&mut state.key_failures, element) {
            return Err(error);
        }
        let name = state.name(element);
        state.log.push(Interaction::Keys(name, text.to_string()));

        let typed = text.replace(ENTER_KEY, "");
        state.elements[element.0].value.push_str(&typed);
        if text.contains(ENTER_KEY) {
            state.submit();
        }
        Ok(())
    }

    async fn click(&self, element: &MockElement) -> Result<(), PageError> {
        let mut state = self.lock();
        state.live(element)?;
        if let Some(error) = State::injected(&mut state.click_failures, element) {
            return Err(error);
        }
        let name = state.name(element);
        state.log.push(Interaction::Click(name));
        if state.elements[element.0].field.submits {
            state.submit();
        }
        Ok(())
    }

    async fn select_options(&self, element: &MockElement) -> Result<Vec<SelectOption>, PageError> {
        Ok(self.lock().live(element)?.field.options.clone())
    }

    async fn select_by_value(&self, element: &MockElement, value: &str) -> Result<(), PageError> {
        let mut state = self.lock();
        state.live(element)?;
        let name = state.name(element);
        state.elements[element.0].value = value.to_string();
        state.log.push(Interaction::Select(name, value.to_string()));
        Ok(())
    }

    async fn dispatch_input_events(&self, element: &MockElement) -> Result<(), PageError> {
        let mut state = self.lock();
        state.live(element)?;
        let name = state.name(element);
        state.log.push(Interaction::Events(name));
        Ok(())
    }

    async fn current_url(&self) -> Result<String, PageError> {
        let mut state = self.lock();
        if state.url_failures > 0 {
            state.url_failures -= 1;
            return Err(PageError::new(PageErrorKind::Script, "location unavailable"));
        }
        Ok(state.url.clone())
    }

    async fn page_text(&self) -> Result<String, PageError> {
        Ok(self.lock().text.clone())
    }

    async fn execute(
        &self,
        _script: &str,
        _args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, PageError> {
        Ok(serde_json::Value::Null)
    }

    async fn nested_contexts(&self) -> Result<Vec<NestedContext<MockElement>>, PageError> {
        let state = self.lock();
        let current = state.current();
        Ok(state
            .contexts
            .iter()
            .flatten()
            .filter(|info| info.parent == current && state.in_document(info.host.0))
            .map(|info| {
                if info.shadow {
                    NestedContext::ShadowRoot(info.host)
                } else {
                    NestedContext::Frame(info.host)
                }
            })
            .collect())
    }

    async fn enter_context(&self, context: &NestedContext<MockElement>) -> Result<(), PageError> {
        let mut state = self.lock();
        let host = *context.host();
        let id = state
            .contexts
            .iter()
            .position(|info| info.as_ref().is_some_and(|info| info.host == host))
            .ok_or_else(|| PageError::new(PageErrorKind::NoSuchElement, "no such frame"))?;
        let name = state.name(&host);
        state.stack.push(ContextId(id));
        state.log.push(Interaction::EnterContext(name));
        Ok(())
    }

    async fn leave_context(&self) -> Result<(), PageError> {
        let mut state = self.lock();
        state.stack.pop();
        state.log.push(Interaction::LeaveContext);
        Ok(())
    }
}

/// A plain username/password/submit form using the first generic selectors
pub fn standard_form(page: &MockPage) -> (MockElement, MockElement, MockElement) {
    let username = page.add(Field::input("username").matching(USERNAME_CSS));
    let password = page.add(Field::input("password").matching(PASSWORD_CSS));
    let submit = page.add(Field::button("submit").matching(SUBMIT_CSS));
    (username, password, submit)
}

/// Accept alice/secret by leaving the login page; reject anything else with
/// an error message
pub fn accept_alice(page: &MockPage, username: MockElement, password: MockElement) {
    page.on_submit_expecting(
        &[(username, "alice"), (password, "secret")],
        Effect::new().navigate(HOME_URL).text("Welcome back, Alice").hide(password),
        Effect::new().text("Invalid username or password."),
    );
}

/// Millisecond-scale settings so tests finish quickly
pub fn fast_settings() -> AttemptSettings {
    AttemptSettings {
        deadlines: PhaseDeadlines {
            detection: Duration::from_secs(2),
            entry: Duration::from_secs(2),
            verification: Duration::from_millis(300),
        },
        progressive: ProgressiveSettings {
            stage_deadline: Duration::from_millis(300),
            max_total: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        },
        verification_poll: Duration::from_millis(10),
        keystroke_delay: Duration::from_millis(1),
        retry: RetryPolicy::none(),
        ..Default::default()
    }
}

/// Fast settings with quick retries
pub fn retrying_settings(attempt_count: u32) -> AttemptSettings {
    AttemptSettings {
        retry: RetryPolicy::new(attempt_count)
            .with_backoff(1, 5, 2.0)
            .with_jitter(false),
        ..fast_settings()
    }
}
