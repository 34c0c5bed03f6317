//! State machine for login forms that reveal their fields one at a time.
//!
//! The driver has no DOM mutation events, so each state polls the page at a
//! fixed interval until its field shows up or the stage deadline passes.
//! Before advancing, the field that came before is typed in humanized mode,
//! because the page usually reveals the next field in response to it.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{LoginPageConfiguration, ProgressiveSettings};
use crate::detection::{FormDetector, wanted_fields};
use crate::entry::{CredentialEntryEngine, EntryError, EntryMode, EntryPlan};
use crate::page::Page;
use crate::types::{FieldKind, FieldSet, FormElements};
use crate::wait::{Budget, Interrupt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorFailure {
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    AwaitingUsername,
    AwaitingPassword,
    AwaitingDomainOrSubmit,
    Complete,
    Failed(MonitorFailure),
}

impl MonitorState {
    /// Where to start given what initial detection already found
    pub fn initial<E>(elements: &FormElements<E>) -> Self {
        if !elements.has(FieldKind::Username) {
            MonitorState::AwaitingUsername
        } else if !elements.has(FieldKind::Password) {
            MonitorState::AwaitingPassword
        } else {
            MonitorState::AwaitingDomainOrSubmit
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitorState::Complete | MonitorState::Failed(_))
    }

    /// Field whose appearance ends this state
    fn awaited(&self, want_domain: bool) -> Vec<FieldKind> {
        match self {
            MonitorState::AwaitingUsername => vec![FieldKind::Username],
            MonitorState::AwaitingPassword => vec![FieldKind::Password],
            MonitorState::AwaitingDomainOrSubmit if want_domain => {
                vec![FieldKind::Domain, FieldKind::Submit]
            }
            MonitorState::AwaitingDomainOrSubmit => vec![FieldKind::Submit],
            MonitorState::Complete | MonitorState::Failed(_) => Vec::new(),
        }
    }

    /// Field to populate before entering this state
    fn predecessor(&self) -> Option<FieldKind> {
        match self {
            MonitorState::AwaitingPassword => Some(FieldKind::Username),
            MonitorState::AwaitingDomainOrSubmit => Some(FieldKind::Password),
            _ => None,
        }
    }

    fn next(&self) -> Self {
        match self {
            MonitorState::AwaitingUsername => MonitorState::AwaitingPassword,
            MonitorState::AwaitingPassword => MonitorState::AwaitingDomainOrSubmit,
            MonitorState::AwaitingDomainOrSubmit => MonitorState::Complete,
            terminal => *terminal,
        }
    }
}

/// Where the monitor stopped and what it found on the way
#[derive(Debug, Clone)]
pub struct ProgressiveOutcome<E> {
    pub state: MonitorState,
    pub elements: FormElements<E>,
    /// Fields already typed; entry must not write them again
    pub populated: FieldSet,
    /// Every state visited, in order
    pub transitions: Vec<MonitorState>,
    pub diagnostic: Option<String>,
    pub elapsed: Duration,
}

impl<E> ProgressiveOutcome<E> {
    pub fn is_complete(&self) -> bool {
        self.state == MonitorState::Complete
    }
}

/// Drives a form through its reveal stages
pub struct ProgressiveFieldMonitor<'a, P: Page> {
    detector: &'a FormDetector<P>,
    engine: &'a CredentialEntryEngine,
    settings: ProgressiveSettings,
}

impl<'a, P: Page> ProgressiveFieldMonitor<'a, P> {
    pub fn new(
        detector: &'a FormDetector<P>,
        engine: &'a CredentialEntryEngine,
        settings: ProgressiveSettings,
    ) -> Self {
        Self {
            detector,
            engine,
            settings,
        }
    }

    /// Run from the partial result of initial detection.
    ///
    /// Timeouts are reported through [`MonitorState::Failed`] with the best
    /// partial form; only cancellation and driver failures are errors.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        page: &P,
        url: &str,
        configs: &[&LoginPageConfiguration],
        initial: FormElements<P::Element>,
        plan: &EntryPlan<'_>,
        want_domain: bool,
        parent: &Budget,
    ) -> Result<ProgressiveOutcome<P::Element>, EntryError> {
        let started = Instant::now();
        let overall = parent.child(self.settings.overall_deadline());
        let wanted = wanted_fields(want_domain);
        let humanized = EntryPlan {
            mode: EntryMode::Humanized,
            ..*plan
        };

        let mut elements = initial;
        let mut populated = FieldSet::new();
        let mut state = MonitorState::initial(&elements);
        let mut transitions = vec![state];
        let mut diagnostic = None;
        info!("Progressive form: starting in {:?}", state);

        while !state.is_terminal() {
            if let Some(previous) = state.predecessor() {
                match self
                    .engine
                    .populate(page, &elements, previous, &humanized, &mut populated, &overall)
                    .await
                {
                    Ok(()) => {}
                    Err(EntryError::Interrupted(Interrupt::DeadlineExceeded)) => {
                        diagnostic = Some(format!("deadline passed while typing {}", previous));
                        state = MonitorState::Failed(MonitorFailure::Timeout);
                        transitions.push(state);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            let awaited = state.awaited(want_domain);
            let stage = overall.child(self.settings.stage_deadline);

            match self
                .poll_stage(page, url, configs, &mut elements, &wanted, &awaited, &stage)
                .await
            {
                Ok(()) => {
                    let next = state.next();
                    debug!("Progressive form: {:?} -> {:?}", state, next);
                    state = next;
                }
                Err(EntryError::Interrupted(Interrupt::DeadlineExceeded)) => {
                    let missing: Vec<&str> = awaited.iter().map(|k| k.as_str()).collect();
                    warn!("Progressive form timed out in {:?}", state);
                    diagnostic = Some(format!(
                        "timed out after {:?} in {:?} waiting for {}",
                        started.elapsed(),
                        state,
                        missing.join(" or ")
                    ));
                    state = MonitorState::Failed(MonitorFailure::Timeout);
                }
                Err(e) => return Err(e),
            }
            transitions.push(state);
        }

        Ok(ProgressiveOutcome {
            state,
            elements,
            populated,
            transitions,
            diagnostic,
            elapsed: started.elapsed(),
        })
    }

    /// Poll until any of `awaited` is known, merging every new field found
    #[allow(clippy::too_many_arguments)]
    async fn poll_stage(
        &self,
        page: &P,
        url: &str,
        configs: &[&LoginPageConfiguration],
        elements: &mut FormElements<P::Element>,
        wanted: &[FieldKind],
        awaited: &[FieldKind],
        stage: &Budget,
    ) -> Result<(), EntryError> {
        loop {
            if awaited.iter().any(|kind| elements.has(*kind)) {
                return Ok(());
            }
            stage.check().map_err(EntryError::Interrupted)?;

            let missing = elements.missing(wanted);
            match self.detector.scan_fields(page, url, configs, &missing).await {
                Ok(found) => {
                    let filled = elements.merge_gaps(found);
                    if !filled.is_empty() {
                        debug!("Progressive form revealed {:?}", filled);
                    }
                }
                // The page is mid-update; try again next tick
                Err(e) if e.is_transient() => debug!("Poll failed: {}", e),
                Err(e) => return Err(EntryError::Page(e)),
            }

            if awaited.iter().any(|kind| elements.has(*kind)) {
                return Ok(());
            }
            stage
                .sleep(self.settings.poll_interval)
                .await
                .map_err(EntryError::Interrupted)?;
        }
    }
}
