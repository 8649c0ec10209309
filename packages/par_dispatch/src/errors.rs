//! Errors surfaced by the dispatcher APIs.

use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::panic::resume_unwind;

use thiserror::Error;

/// The requested maximum concurrency was outside the accepted range.
///
/// Valid values are `-1` (resolve to the processor count) and anything `>= 1`.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("max concurrency must be at least 1, or -1 to use the processor count; got {requested}")]
pub struct MaxConcurrencyError {
    pub(crate) requested: i32,
}

impl MaxConcurrencyError {
    /// The value that was rejected.
    #[must_use]
    pub fn requested(&self) -> i32 {
        self.requested
    }
}

/// An operation was attempted in a dispatcher state that forbids it.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum UsageError {
    /// The dispatcher has been disposed; no further operations are valid.
    #[error("the dispatcher has been disposed")]
    Disposed,

    /// Actions can only be added before the first cycle is triggered.
    #[error("actions cannot be added once the first cycle has been triggered")]
    Sealed,

    /// A previously triggered cycle has not completed yet.
    #[error("a previous cycle has not yet completed")]
    CycleInProgress,

    /// A cycle was triggered without any registered actions.
    #[error("no actions have been registered")]
    NoActions,
}

/// Why a synchronous dispatch cycle failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The cycle could not be triggered at all.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The cycle ran to completion but one or more actions panicked.
    #[error(transparent)]
    Panicked(#[from] AggregatePanic),
}

/// The panic raised by a single dispatched action, captured verbatim.
///
/// The payload is whatever the action passed to `panic!`. For the common string
/// payloads, [`message`][Self::message] offers direct access; anything else can be
/// recovered through [`into_payload`][Self::into_payload] or re-raised with
/// [`resume`][Self::resume].
pub struct ActionPanic {
    payload: Box<dyn Any + Send>,
}

impl ActionPanic {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        Self { payload }
    }

    /// The panic message, if the payload was a string.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            Some(message)
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            Some(message)
        } else {
            None
        }
    }

    /// Unwraps the raw panic payload.
    #[must_use]
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Resumes unwinding with the original payload, as if the panic had happened
    /// on the current thread.
    pub fn resume(self) -> ! {
        resume_unwind(self.payload)
    }
}

impl Debug for ActionPanic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActionPanic")
            .field(&self.message().unwrap_or("<non-string panic payload>"))
            .finish()
    }
}

impl Display for ActionPanic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.message().unwrap_or("<non-string panic payload>"))
    }
}

/// Every action panic from one dispatch cycle, merged into a single failure.
///
/// A cycle never aborts early: all remaining actions still run after one panics,
/// and every panic that occurred is preserved here - none are dropped or merged.
#[derive(Debug)]
pub struct AggregatePanic {
    panics: Vec<ActionPanic>,
}

impl AggregatePanic {
    pub(crate) fn new(panics: Vec<ActionPanic>) -> Self {
        debug_assert!(!panics.is_empty());

        Self { panics }
    }

    /// The individual panics, one per failed action, in recording order.
    #[must_use]
    pub fn panics(&self) -> &[ActionPanic] {
        &self.panics
    }

    /// Unwraps the individual panics.
    #[must_use]
    pub fn into_panics(self) -> Vec<ActionPanic> {
        self.panics
    }
}

impl Display for AggregatePanic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} dispatched action(s) panicked during the cycle",
            self.panics.len()
        )
    }
}

impl std::error::Error for AggregatePanic {}
