//! A stackful coroutine runtime: cooperatively scheduled tasks, each with
//! its own logical native call stack, switching on a single OS thread.
//!
//! Tasks never run in parallel with each other — only one is ever
//! `Running` on a given OS thread at a time — and switching between them is
//! a plain function call's worth of cost: a handful of callee-saved
//! registers swapped via [`context::switch`], plus copying whatever part
//! of the thread's one native stack the outgoing task had reached back out
//! to the heap and the incoming task's own copy back in (see [`stack`] for
//! why this crate uses one shared stack with byte-exact copy-out/copy-in
//! rather than giving every task its own dedicated stack memory).
//!
//! ```
//! use corostack::Task;
//!
//! let worker: Task<u32> = Task::spawn(|n| n * 2);
//! assert_eq!(worker.switch_to(21).unwrap(), 42);
//! assert!(worker.is_dead());
//! ```

mod context;
mod core;
mod error;
mod host;
mod lifecycle;
mod stack;
mod switch;
mod task;
mod thread_state;
mod trace;

pub use crate::core::TaskId;
pub use error::{Failure, FailureKind, OperationError, Raised, StructuralError};
pub use host::{current_context, set_current_context, ContextOption, ContextSnapshot, Frame, FrameGuard, FrameRoot};
pub use task::{Builder, Task, TaskHandle};
pub use trace::{clear_trace, has_trace as get_trace, set_trace, TraceEvent};

/// The calling OS thread's currently running task, as an untyped handle.
pub fn current() -> TaskHandle {
    TaskHandle(thread_state::current())
}

/// Number of dead tasks this OS thread owns but hasn't yet finished
/// tearing down because their last `Task` handle was dropped from another
/// thread.
pub fn get_pending_cleanup_count() -> usize {
    thread_state::get_pending_cleanup_count()
}

/// Total number of implicit main tasks ever created process-wide, one per
/// OS thread that has touched this crate.
pub fn get_total_main_tasks() -> u64 {
    thread_state::get_total_main_tasks()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_defaults_to_a_main_task() {
        let cur = current();
        assert!(cur.is_main());
        assert!(cur.is_current());
    }

    #[test]
    fn total_main_tasks_counts_at_least_this_thread() {
        let _ = current();
        assert!(get_total_main_tasks() >= 1);
    }

    #[test]
    fn pending_cleanup_starts_empty() {
        assert_eq!(get_pending_cleanup_count(), 0);
    }
}

/// End-to-end scenarios exercising the switch protocol and lifecycle rules
/// together. Colocated here rather than in a separate `tests/` directory,
/// keeping tests next to the code they exercise instead of in an
/// integration-test crate.
#[cfg(test)]
mod scenario_tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Surfaces the `log::trace!`/`log::debug!` diagnostics `switch.rs` and
    /// `stack.rs` emit when scenarios below run under `RUST_LOG=trace`;
    /// harmless to call more than once.
    fn init_logging() {
        let _ = env_logger::try_init();
    }

    /// A chain of `N` tasks, each receiving `v` from its predecessor and
    /// switching to its successor with `v + 1`; the last just returns `v + 1`.
    /// Driver switches `0` into the first link and expects `N` back.
    ///
    /// Kept small deliberately: every link in the chain parks one native
    /// stack frame on top of the last (driver -> t1 -> t2 -> ...
    /// -> tN all sit on the one shared stack at once, per `crate::stack`),
    /// so a five-digit chain would overflow a test thread's default stack
    /// well before exercising anything the switch protocol doesn't already
    /// exercise at a few hundred links.
    #[test]
    fn chain_of_tasks_propagates_through_every_link() {
        init_logging();
        const N: u32 = 400;

        // Built back-to-front: tN needs no successor, so it can be created
        // first; each earlier link then captures the already-built next one
        // by value, with no forward-reference cells required.
        let mut next: Option<Task<u32>> = None;
        let mut built = Vec::with_capacity(N as usize);
        for _ in 0..N {
            let successor = next.take();
            let t: Task<u32> = Task::spawn(move |v: u32| match &successor {
                Some(s) => s.switch_to(v + 1).unwrap(),
                None => v + 1,
            });
            next = Some(t.clone());
            built.push(t);
        }
        built.reverse();

        let result = built[0].switch_to(0).unwrap();
        assert_eq!(result, N);
    }

    /// Two tasks ping-ponging a value back and forth; after the first
    /// completes, both must be dead with no captured stack left behind.
    /// `b`'s last iteration returns instead of switching, so its normal
    /// completion (to its parent, `a`) is exactly the resume that lets `a`'s
    /// own last iteration finish and fall through to its own completion.
    #[test]
    fn two_task_ping_pong_leaves_no_captured_stacks() {
        init_logging();
        const ITERS: usize = 10_000;

        let a_slot: Arc<Mutex<Option<Task<u32>>>> = Arc::new(Mutex::new(None));
        let b_slot: Arc<Mutex<Option<Task<u32>>>> = Arc::new(Mutex::new(None));

        let a_for_b = a_slot.clone();
        let b: Task<u32> = Task::spawn(move |mut x: u32| {
            for i in 0..ITERS {
                if i + 1 == ITERS {
                    return x;
                }
                let a = a_for_b.lock().unwrap().clone().unwrap();
                x = a.switch_to(x).unwrap();
            }
            x
        });

        let b_for_a = b_slot.clone();
        let a: Task<u32> = Task::spawn(move |mut x: u32| {
            let b = b_for_a.lock().unwrap().clone().unwrap();
            for _ in 0..ITERS {
                x = b.switch_to(x).unwrap();
            }
            x
        });

        b.set_parent(&a).expect("b and a share an owner thread");
        *a_slot.lock().unwrap() = Some(a.clone());
        *b_slot.lock().unwrap() = Some(b.clone());

        let _ = a.switch_to(0).unwrap();

        assert!(a.is_dead());
        assert!(b.is_dead());
        assert!(a.captured_stack_bounds().is_none());
        assert!(b.captured_stack_bounds().is_none());
    }

    #[derive(Debug)]
    struct SomeError;

    /// An escaped user-failure in `g2` surfaces in `g2.parent` (`g1`),
    /// not at whatever call site happened to switch into `g2`; once `g1`
    /// has handled it and died in turn, a further switch to `g2` resolves
    /// past both dead ancestors to the (live) main task and is a same-thread
    /// no-op rather than a raise.
    #[test]
    fn escaped_failure_surfaces_at_the_parent_not_the_caller() {
        init_logging();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let log_for_g1 = log.clone();
        let g1: Task<()> = Task::spawn(move |_| match Task::<()>::current_main().switch_to(()) {
            Ok(()) => {}
            Err(Raised::Failure(f)) if f.downcast_ref::<SomeError>().is_some() => {
                log_for_g1.lock().unwrap().push("caught SomeError".to_string());
            }
            other => panic!("unexpected resume: {other:?}"),
        });

        let g2: Task<()> = Task::spawn(|_| {
            Task::<()>::current_main().switch_to(()).unwrap();
            std::panic::panic_any(SomeError);
        });
        g2.set_parent(&g1).expect("g1 and g2 share an owner thread");

        g1.switch_to(()).unwrap(); // g1 activates, immediately suspends back to us
        g2.switch_to(()).unwrap(); // g2 activates, immediately suspends back to us

        // resumes g2's panic, which escapes to g1 (its parent); g1 handles
        // it and returns normally, resuming us in turn -- the error never
        // reaches this call site.
        g2.switch_to(()).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["caught SomeError".to_string()]);
        assert!(g1.is_dead());
        assert!(g2.is_dead());

        let result = g2.switch_to(7);
        assert_eq!(result.unwrap(), 7);
    }

    /// Forced termination on the last `Task` drop delivers the
    /// exit-signal exactly once; user code may catch it (to log cleanup)
    /// but must let it keep unwinding.
    #[test]
    fn forced_termination_runs_cleanup_exactly_once() {
        init_logging();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log_for_task = log.clone();

        let g: Task<()> = Task::spawn(move |_| {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                Task::<()>::current_main().switch_to(())
            }));
            if let Err(payload) = outcome {
                if payload.downcast_ref::<crate::lifecycle::ExitUnwind>().is_some() {
                    log_for_task.lock().unwrap().push("exit".to_string());
                }
                std::panic::resume_unwind(payload);
            }
        });

        g.switch_to(()).unwrap();
        assert!(!g.is_dead());

        drop(g);

        assert_eq!(*log.lock().unwrap(), vec!["exit".to_string()]);
    }

    /// A task switched at from a thread that doesn't own it fails with
    /// a structural error, and the task itself is left untouched.
    #[test]
    fn cross_thread_switch_is_rejected() {
        init_logging();
        let (tx, rx) = std::sync::mpsc::channel();
        let creator = thread::spawn(move || {
            let g: Task<u32> = Task::spawn(|x| x);
            tx.send(g).unwrap();
        });
        creator.join().unwrap();
        let g = rx.recv().unwrap();

        let result = g.switch_to(0);
        assert!(matches!(
            result,
            Err(Raised::Operation(OperationError::Structural(StructuralError::ForeignThread(_))))
        ));
        assert!(!g.is_dead());
        assert!(!g.is_started());
    }

    /// A task's saved frame-chain root, walked from the parent after it
    /// suspends, reflects exactly the recursion depth it reached.
    #[test]
    fn saved_frame_chain_reflects_recursion_depth() {
        init_logging();
        fn recurse(depth: usize) {
            let _guard = FrameGuard::enter("frame");
            if depth == 0 {
                Task::<()>::current_main().switch_to(()).unwrap();
            } else {
                recurse(depth - 1);
            }
        }

        const DEPTH: usize = 50;
        let g: Task<()> = Task::spawn(|_| recurse(DEPTH));
        g.switch_to(()).unwrap();

        assert_eq!(g.stack_frame_root().depth(), DEPTH + 1);
    }

    /// A task's last reference dropped on a foreign thread is deferred
    /// to its owner, who must drain and force-terminate it on the owner's
    /// next switch.
    #[test]
    fn cross_thread_release_is_drained_by_the_owner() {
        init_logging();
        let g: Task<()> = Task::spawn(|_| {
            Task::<()>::current_main().switch_to(()).unwrap();
        });
        let watch: TaskHandle = (*g).clone();
        g.switch_to(()).unwrap();
        assert!(!watch.is_dead());

        thread::spawn(move || drop(g)).join().unwrap();

        assert!(get_pending_cleanup_count() >= 1);
        assert!(!watch.is_dead());

        // Any subsequent switch on the owner thread drains the queue; a
        // throwaway task that completes immediately is enough to trigger it.
        let helper: Task<()> = Task::spawn(|x| x);
        helper.switch_to(()).unwrap();

        assert_eq!(get_pending_cleanup_count(), 0);
        assert!(watch.is_dead());
    }
}
