//! Tracing hook.
//!
//! A single process-wide observer callback, invoked around every switch and
//! at task creation/destruction, purely for diagnostics — nothing in the
//! core depends on whether one is installed. An observer that panics is
//! treated as a logging bug, not a task-system error: the panic is caught
//! and logged at `warn`, and the observer stays installed.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::core::TaskId;

/// What happened, passed to the installed trace callback.
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent {
    /// A task was created, with the id of its initial parent.
    Created { task: TaskId, parent: TaskId },
    /// A switch is about to move control from `from` to `to`.
    SwitchOut { from: TaskId, to: TaskId },
    /// A switch just landed with a value; `now_current` is executing.
    SwitchIn { now_current: TaskId },
    /// A switch just landed delivering a failure (an escaped user-failure or
    /// an explicit `throw`) to be raised at `now_current`'s resumption point.
    Throw { now_current: TaskId },
    /// A task finished (normally, by escaped failure, or by exit).
    Destroyed { task: TaskId },
}

type TraceFn = dyn Fn(TraceEvent) + Send + Sync;

static TRACE: RwLock<Option<Box<TraceFn>>> = RwLock::new(None);
static TRACE_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install a process-wide trace callback, replacing any previous one.
pub fn set_trace<F>(f: F)
where
    F: Fn(TraceEvent) + Send + Sync + 'static,
{
    *TRACE.write().unwrap() = Some(Box::new(f));
    TRACE_INSTALLED.store(true, Ordering::Release);
}

/// Remove whatever trace callback is installed, if any.
pub fn clear_trace() {
    *TRACE.write().unwrap() = None;
    TRACE_INSTALLED.store(false, Ordering::Release);
}

pub fn has_trace() -> bool {
    TRACE_INSTALLED.load(Ordering::Acquire)
}

/// Fire `event` at whatever observer is installed, absorbing both a
/// poisoned lock (another thread's observer already panicked) and a panic
/// from this call.
pub(crate) fn emit(event: TraceEvent) {
    if !has_trace() {
        return;
    }
    let guard = match TRACE.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(f) = guard.as_ref() {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| f(event)));
        if result.is_err() {
            log::warn!("corostack: trace observer panicked handling {event:?}; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskCore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn sample_id() -> TaskId {
        TaskCore::new_main(std::thread::current().id()).id()
    }

    #[test]
    fn observer_panic_is_absorbed() {
        set_trace(|_event| panic!("boom"));
        emit(TraceEvent::Destroyed { task: sample_id() });
        clear_trace();
    }

    #[test]
    fn observer_without_install_is_a_no_op() {
        clear_trace();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        set_trace(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        emit(TraceEvent::SwitchIn { now_current: sample_id() });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        clear_trace();
    }
}
