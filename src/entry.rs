//! Clearing and writing credential fields.

use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{self, DomainDirective};
use crate::errors::PageError;
use crate::page::Page;
use crate::types::{Credentials, FieldKind, FieldSet, FormElements};
use crate::wait::{Budget, Interrupt};

/// How values reach a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    /// One `send_keys` with the whole value
    Direct,
    /// One character at a time with a pause in between, so page scripts see
    /// every keystroke
    Humanized,
}

/// Why entry stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    Page(PageError),
    Interrupted(Interrupt),
}

impl From<PageError> for EntryError {
    fn from(error: PageError) -> Self {
        EntryError::Page(error)
    }
}

/// What to write and how, for one attempt
#[derive(Debug, Clone, Copy)]
pub struct EntryPlan<'a> {
    pub credentials: &'a Credentials,
    pub directive: &'a DomainDirective,
    pub mode: EntryMode,
}

/// Writes credentials into located fields
#[derive(Debug, Clone)]
pub struct CredentialEntryEngine {
    keystroke_delay: Duration,
    dispatch_events: bool,
}

impl CredentialEntryEngine {
    pub fn new(keystroke_delay: Duration) -> Self {
        Self {
            keystroke_delay,
            dispatch_events: false,
        }
    }

    /// Fire `input`/`change` after each write
    pub fn with_events(mut self, dispatch_events: bool) -> Self {
        self.dispatch_events = dispatch_events;
        self
    }

    /// Clear a field and write `value` into it.
    ///
    /// An interrupted humanized write clears the field again so it is never
    /// left half-typed.
    pub async fn write<P: Page + ?Sized>(
        &self,
        page: &P,
        element: &P::Element,
        value: &str,
        mode: EntryMode,
        budget: &Budget,
    ) -> Result<(), EntryError> {
        budget.check().map_err(EntryError::Interrupted)?;
        page.clear(element).await?;

        match mode {
            EntryMode::Direct => page.send_keys(element, value).await?,
            EntryMode::Humanized => {
                let mut buf = [0u8; 4];
                for (i, ch) in value.chars().enumerate() {
                    if i > 0
                        && let Err(interrupt) = budget.sleep(self.keystroke_delay).await
                    {
                        debug!("Typing interrupted ({:?}); clearing partial value", interrupt);
                        if let Err(e) = page.clear(element).await {
                            warn!("Could not clear partially typed field: {}", e);
                        }
                        return Err(EntryError::Interrupted(interrupt));
                    }
                    page.send_keys(element, ch.encode_utf8(&mut buf)).await?;
                }
            }
        }

        if self.dispatch_events {
            page.dispatch_input_events(element).await?;
        }
        Ok(())
    }

    /// Populate one field kind from the credentials and record it in `populated`.
    ///
    /// Fields already in `populated`, fields not located and the domain under
    /// `Skip` are left alone.
    pub async fn populate<P: Page + ?Sized>(
        &self,
        page: &P,
        elements: &FormElements<P::Element>,
        kind: FieldKind,
        plan: &EntryPlan<'_>,
        populated: &mut FieldSet,
        budget: &Budget,
    ) -> Result<(), EntryError> {
        if populated.contains(&kind) {
            return Ok(());
        }
        let Some(element) = elements.get(kind) else {
            return Ok(());
        };
        let EntryPlan {
            credentials,
            directive,
            mode,
        } = *plan;

        match kind {
            FieldKind::Username => {
                debug!("Entering username ({} chars, {:?})", credentials.username.chars().count(), mode);
                self.write(page, element, &credentials.username, mode, budget).await?;
            }
            FieldKind::Password => {
                debug!("Entering password ({} chars, {:?})", credentials.password.chars().count(), mode);
                self.write(page, element, &credentials.password, mode, budget).await?;
            }
            FieldKind::Domain => {
                let Some(value) = directive.value() else {
                    return Ok(());
                };
                budget.check().map_err(EntryError::Interrupted)?;
                if !domain::populate(page, element, value, self.dispatch_events).await? {
                    return Ok(());
                }
            }
            FieldKind::Submit => return Ok(()),
        }

        populated.insert(kind);
        Ok(())
    }

    /// Enter every located credential field that has not been entered yet.
    ///
    /// Returns `Ok(false)` when an element refused input in a way that may
    /// clear up on retry (stale or not interactable).
    pub async fn enter<P: Page + ?Sized>(
        &self,
        page: &P,
        elements: &FormElements<P::Element>,
        plan: &EntryPlan<'_>,
        populated: &mut FieldSet,
        budget: &Budget,
    ) -> Result<bool, EntryError> {
        for kind in [FieldKind::Username, FieldKind::Password, FieldKind::Domain] {
            match self
                .populate(page, elements, kind, plan, populated, budget)
                .await
            {
                Ok(()) => {}
                Err(EntryError::Page(e)) if e.is_transient() => {
                    warn!("Could not enter {}: {}", kind, e);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
