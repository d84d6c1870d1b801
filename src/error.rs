//! Error kinds of the switch protocol.
//!
//! `OperationError` is returned directly at the call site that detected it
//! (structural or resource errors never disturb the running-task pointer).
//! `Failure` travels through the switch/throw machinery itself and is
//! delivered to a *task*, not to a call site — it becomes the `Err` arm of
//! the `Result<T, Raised>` that a `switch`/`throw` call returns once it has
//! actually resumed.

use std::any::Any;
use std::fmt;

use crate::core::TaskId;

/// Structural misuse of the task tree: cycles, cross-thread parents, switches
/// whose resolved target lives on a different OS thread.
#[derive(Debug, thiserror::Error)]
pub enum StructuralError {
    #[error("task {0:?} is owned by a different OS thread than the caller")]
    ForeignThread(TaskId),
    #[error("assigning this parent would introduce a cycle in the task tree")]
    Cycle,
    #[error("new parent is owned by a different OS thread")]
    ForeignParent,
    #[error("task has not been properly initialized")]
    Uninitialized,
}

/// Errors detected and reported at the call site of the operation that
/// found them.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("failed to allocate a {size}-byte stack segment during switch-out")]
    Resource { size: usize },
}

/// The kind of a `Failure`: either the reserved exit-signal used by forced
/// termination or an ordinary failure raised by user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The sentinel used to force a suspended task to unwind.
    /// User code may catch it to run cleanup; letting it escape (or
    /// re-raising it) is how a task is expected to die.
    Exit,
    /// Any other failure raised by user code that escaped a task's entry
    /// point and is being propagated to the parent via `throw`.
    User,
}

/// A failure in flight across a `throw`, or escaping a task's entry point.
///
/// Carries an optional type-erased payload and an optional message used for
/// `Display`/logging. `Failure::exit()` builds the reserved exit-signal;
/// everything else is a user-failure.
pub struct Failure {
    kind: FailureKind,
    value: Option<Box<dyn Any + Send>>,
    message: Option<String>,
}

impl Failure {
    /// The reserved exit-signal kind.
    pub fn exit() -> Self {
        Failure {
            kind: FailureKind::Exit,
            value: None,
            message: None,
        }
    }

    /// A user-failure carrying an arbitrary `Send` payload.
    pub fn user<V: Any + Send + 'static>(value: V) -> Self {
        Failure {
            kind: FailureKind::User,
            value: Some(Box::new(value)),
            message: None,
        }
    }

    /// A user-failure built from a message alone, with no typed payload.
    pub fn user_message(message: impl Into<String>) -> Self {
        Failure {
            kind: FailureKind::User,
            value: None,
            message: Some(message.into()),
        }
    }

    /// A user-failure wrapping any `std::error::Error`, preserving its
    /// `Display` text. Carries no captured backtrace of its own — callers
    /// who need one can attach it to their own error type and pass it
    /// through `user`.
    pub fn from_error<E: std::error::Error + Send + 'static>(err: E) -> Self {
        let message = err.to_string();
        Failure {
            kind: FailureKind::User,
            value: Some(Box::new(err)),
            message: Some(message),
        }
    }

    /// Build a user-failure from a caught `std::panic` payload, the way an
    /// entry point's own panic is turned into something deliverable to its
    /// parent via `throw`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            Some((*s).to_string())
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Some(s.clone())
        } else {
            None
        };
        Failure {
            kind: FailureKind::User,
            value: Some(payload),
            message,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_exit(&self) -> bool {
        self.kind == FailureKind::Exit
    }

    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.value.as_deref()?.downcast_ref::<V>()
    }

    pub fn into_value(self) -> Option<Box<dyn Any + Send>> {
        self.value
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.message) {
            (FailureKind::Exit, _) => write!(f, "exit-signal"),
            (FailureKind::User, Some(msg)) => write!(f, "user-failure: {msg}"),
            (FailureKind::User, None) => write!(f, "user-failure"),
        }
    }
}

impl std::error::Error for Failure {}

/// What a `switch`/`throw` call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum Raised {
    /// Detected and reported before anything was transferred.
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// A failure delivered into the resumed task (an escaped user-failure,
    /// or an explicit `throw`).
    #[error(transparent)]
    Failure(#[from] Failure),
}
