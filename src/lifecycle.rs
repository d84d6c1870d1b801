//! Trampoline and termination.
//!
//! [`trampoline`] is the one Rust function every task's fabricated context
//! ever points at (see `context::prime`). It runs the task's entry closure,
//! catches whatever it produces — a normal return, an escaped user-failure,
//! or the reserved exit-signal unwind — and hands the result to the first
//! live ancestor by tail-calling into [`crate::switch::terminal_switch`],
//! which never returns.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use crate::core::{State, TaskCore, Transfer};
use crate::error::Failure;
use crate::host;
use crate::switch::terminal_switch;
use crate::thread_state;
use crate::trace::{self, TraceEvent};

/// Payload used to force the exit-signal through `std::panic` so that it
/// propagates out of a task's entry point even if the task's own code never
/// looks at the `Result` a `switch`/`throw` call returned.
pub(crate) struct ExitUnwind(pub(crate) Failure);

/// The entry point of every fabricated task context. `a0`/`a1` (whatever
/// the platform's first two integer argument registers are) are always
/// zero on arrival — `context::switch` clears them on every landing, not
/// just this one — so this function ignores them and instead reads
/// everything it needs off the now-current `TaskCore`.
pub(crate) extern "C" fn trampoline(_a0: usize, _a1: usize) -> ! {
    let me = thread_state::current();
    debug_assert_eq!(me.state(), State::Running);

    let initial = unsafe { (*me.transfer.get()).take() }.expect("a started task always has an initial transfer");

    let outcome: Result<Box<dyn Any + Send>, Box<dyn Any + Send>> = match initial {
        Transfer::Failure(f) if f.is_exit() => Err(Box::new(ExitUnwind(f))),
        Transfer::Failure(f) => {
            // A task can be killed before it ever ran its own code: there is no entry
            // closure invocation to wrap, just the failure to propagate.
            finish_with(&me, Transfer::Failure(f));
        }
        Transfer::Value(input) => {
            let entry = me
                .entry
                .lock()
                .unwrap()
                .take()
                .expect("a started task's entry point runs exactly once");
            std::panic::catch_unwind(AssertUnwindSafe(|| entry(input)))
        }
    };

    match outcome {
        Ok(value) => finish_with(&me, Transfer::Value(value)),
        Err(panic_payload) => match panic_payload.downcast::<ExitUnwind>() {
            Ok(exit) => finish_with(&me, Transfer::Failure(exit.0)),
            Err(other) => finish_with(&me, Transfer::Failure(Failure::from_panic(other))),
        },
    }
}

/// Mark `me` dead and hand `transfer` to its nearest live ancestor. Never
/// returns: the stack `me` was running on is never switched back into.
fn finish_with(me: &std::sync::Arc<TaskCore>, transfer: Transfer) -> ! {
    me.set_state(State::Dead);
    trace::emit(TraceEvent::Destroyed { task: me.id() });
    // A dead task no longer needs its captured stack bytes or host-state
    // snapshot; dropping them here (rather than leaving it to `Task::drop`)
    // frees that memory as soon as the task actually finishes, which may be
    // long before the last `Task` handle to it goes away.
    unsafe {
        *me.stack.get() = None;
    }
    let _ = host::take();

    let parent = me.parent().unwrap_or_else(thread_state::main_task);
    terminal_switch(me, parent, transfer)
}

/// Force a suspended task to unwind and drop its engine, for the case where
/// the last `Task` handle to it was dropped while it was neither unstarted
/// nor dead. Must run on `task`'s
/// owner thread. Temporarily reparents `task` to whichever task is running
/// right now, so that once it finishes unwinding, control lands back here
/// instead of wherever its structural parent happens to be.
pub(crate) fn force_unwind_and_drop(task: std::sync::Arc<TaskCore>) {
    debug_assert_eq!(task.owner, std::thread::current().id());
    if matches!(task.state(), State::Unstarted | State::Dead) {
        // No live Rust frames to unwind; dropping the `Arc` is enough.
        drop(task);
        return;
    }
    let caller = thread_state::current();
    let _ = task.set_parent(caller);
    let id = task.id();
    match crate::switch::perform_switch(task.clone(), Transfer::Failure(Failure::exit())) {
        Ok(_) => {}
        Err(crate::error::Raised::Failure(f)) if f.is_exit() => {}
        Err(other) => log::warn!("corostack: task {id:?} raised {other} while unwinding the exit-signal"),
    }
    drop(task);
}

/// Reclaim a suspended task whose owner OS thread has already exited,
/// without running its unwind. A normal termination resumes the task onto
/// its own captured stack so its entry closure's drop glue runs in place;
/// that requires a live owner thread to resume onto, which by definition
/// this task no longer has, and migrating its stack to resume it elsewhere
/// is the one thing this crate's switch protocol refuses to do. So instead
/// of unwinding, this just marks the task dead and releases the captured
/// stack bytes and host-state snapshot directly — the same outcome the
/// task's suspended frames would get if the whole process had exited
/// without ever coming back to it.
pub(crate) fn hard_reclaim(task: &std::sync::Arc<TaskCore>) {
    if task.is_dead() {
        return;
    }
    log::warn!(
        "corostack: hard-reclaiming task {:?} whose owner thread exited without resuming it",
        task.id()
    );
    task.set_state(State::Dead);
    trace::emit(TraceEvent::Destroyed { task: task.id() });
    // Safety: the owner thread is gone, so nothing else can be touching
    // these fields concurrently; this is the same single-writer guarantee
    // the owner thread itself relied on while it was alive.
    unsafe {
        *task.stack.get() = None;
        *task.host.get() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_unwind_carries_the_exit_failure() {
        let f = Failure::exit();
        assert!(f.is_exit());
        let wrapped = ExitUnwind(f);
        assert!(wrapped.0.is_exit());
    }
}
