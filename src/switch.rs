//! The switch protocol: the sequence of steps that turns a
//! `Task::switch`/`Task::throw` call into a raw context swap and back.
//!
//! Every switch, in either direction, runs through [`perform_switch`]. There
//! is no separate "resume" code path: when task B later switches back to
//! task A, that is simply B's own call to `perform_switch(A, ...)` — by the
//! time A's own earlier call to `context::switch` returns, B's call has
//! already done all the bookkeeping (materializing A's stack, installing
//! A's host state, marking A `Running`, recording A as current). A's call
//! only has to read whatever `Transfer` B left for it.

use std::any::Any;
use std::sync::Arc;

use crate::context;
use crate::core::{State, TaskCore, Transfer};
use crate::error::{OperationError, Raised, StructuralError};
use crate::host;
use crate::stack::{self, StackSlot};
use crate::thread_state;
use crate::trace::{self, TraceEvent};

/// Switch the calling OS thread from whatever task is currently running to
/// `target`, delivering `transfer` to it, and return whatever is delivered
/// back the next time this task is resumed.
///
/// `target` is resolved to its nearest live ancestor first: switching to a
/// dead task hands control to whoever would inherit its role instead of
/// failing.
pub(crate) fn perform_switch(
    target: Arc<TaskCore>,
    transfer: Transfer,
) -> Result<Box<dyn Any + Send>, Raised> {
    let origin = thread_state::current();
    let resolved = TaskCore::resolve_target(target);

    if resolved.owner != std::thread::current().id() {
        return Err(OperationError::Structural(StructuralError::ForeignThread(resolved.id())).into());
    }

    if Arc::ptr_eq(&origin, &resolved) {
        // Switching a task to itself delivers the payload without ever
        // touching the real stack or host state.
        return deliver(resolved.id(), transfer);
    }

    debug_assert!(
        origin.state() == State::Running,
        "only the currently running task may initiate a switch"
    );

    // Step: drop any destructors this thread owes other threads before we
    // potentially hand control away for an unbounded time.
    thread_state::drain_deferred_for_current_thread();

    // Step: stash the payload where `resolved` will look for it once it's
    // current again.
    unsafe {
        *resolved.transfer.get() = Some(transfer);
    }

    // Step: capture the origin's host state (exception, frame chain,
    // context snapshot, recursion depth) before it stops being current, and
    // stash it on the engine — not just in a local — since it is the
    // *next* switch into `origin` that will read it back, from whatever
    // stack frame that resume happens to be running on.
    let origin_host = host::take();

    // Step: compute the exact low boundary of the range `context::switch`
    // is about to leave behind, and copy it out.
    let low = stack::current_low_bound();
    if origin.stack_ceiling.get() == 0 {
        // The first time any task (always the thread's main task, since
        // every other task has its ceiling fixed at activation) switches
        // out, its own stack_start is wherever it has reached right now.
        origin.stack_ceiling.set(low);
    }
    let high = origin.stack_ceiling.get();
    match StackSlot::capture(low, high, crate::stack::next_seq()) {
        Ok(slot) => unsafe { *origin.stack.get() = Some(slot) },
        Err(e) => {
            // Nothing has been handed off yet; restore exactly what we took
            // and fail at the call site.
            host::install(origin_host);
            unsafe {
                *resolved.transfer.get() = None;
            }
            return Err(e.into());
        }
    }
    unsafe {
        *origin.host.get() = Some(origin_host);
    }
    origin.set_state(State::Suspended);

    // Step: prepare `resolved` to actually run: if it has never been
    // activated, fabricate the context and stack slot that make it look
    // like a task which just suspended the instant it was entered;
    // otherwise its context/stack are already whatever its own earlier
    // switch-out left behind.
    activate_if_unstarted(&resolved);

    // Step: materialize `resolved`'s captured bytes back into real stack
    // memory, install its host-state snapshot, and record it as current —
    // all of this must happen before we hand off control, never after.
    unsafe {
        (*resolved.stack.get()).as_ref().unwrap().materialize();
    }
    let resolved_host = unsafe { (*resolved.host.get()).take() }
        .expect("a task always has a host-state snapshot while not current");
    host::install(resolved_host);
    resolved.set_state(State::Running);
    let resolved_id = resolved.id();
    thread_state::set_current(resolved.clone());

    trace::emit(TraceEvent::SwitchOut { from: origin.id(), to: resolved_id });
    log::trace!("corostack: switching {:?} -> {:?}", origin.id(), resolved_id);

    // Step: the actual register swap. Everything above this line ran on
    // `origin`'s stack; everything below runs once some later switch lands
    // back on it.
    unsafe {
        context::switch(origin.context.get(), resolved.context.get());
    }

    log::trace!("corostack: resumed {:?}", origin.id());

    // We only get here once another task switches back to `origin`. That
    // call already materialized our stack, installed our host state, set
    // us `Running`, and recorded us as current; all that is left is to
    // pick up whatever it left for us.
    let incoming = unsafe { (*origin.transfer.get()).take() }
        .expect("a resumed task always has a pending transfer");
    deliver(origin.id(), incoming)
}

/// Hand `transfer` to the task it just resumed into, firing the trace event
/// that matches what it actually is: a plain resume, or one delivering a
/// failure to be raised at the resumption point.
fn deliver(now_current: crate::core::TaskId, transfer: Transfer) -> Result<Box<dyn Any + Send>, Raised> {
    match transfer {
        Transfer::Value(v) => {
            trace::emit(TraceEvent::SwitchIn { now_current });
            Ok(v)
        }
        Transfer::Failure(f) if f.is_exit() => {
            trace::emit(TraceEvent::Throw { now_current });
            // The reserved exit-signal must propagate regardless of whether
            // the call site is even structured to look at its `Result` —
            // a plain `Err` a caller can ignore would not do that, so it is
            // delivered as a panic instead and only `crate::lifecycle`'s
            // trampoline is allowed to catch it.
            std::panic::panic_any(crate::lifecycle::ExitUnwind(f));
        }
        Transfer::Failure(f) => {
            trace::emit(TraceEvent::Throw { now_current });
            Err(Raised::Failure(f))
        }
    }
}

fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Fabricate `resolved`'s context and seed stack slot if this is its first
/// ever activation. The ceiling is fixed to wherever the activating task's
/// own stack has reached right now, 16-byte-aligned; it never changes again
/// for the lifetime of the task.
fn activate_if_unstarted(resolved: &Arc<TaskCore>) {
    if resolved.state() != State::Unstarted {
        return;
    }
    log::debug!("corostack: initializing context for task {:?}", resolved.id());
    let ceiling = align_down(stack::current_low_bound(), context::STACK_ALIGNMENT);
    let (ctx, low, seed) = context::prime(ceiling, crate::lifecycle::trampoline as usize);
    resolved.stack_ceiling.set(ceiling);
    unsafe {
        *resolved.context.get() = ctx;
        *resolved.stack.get() = Some(StackSlot::seed(low, ceiling, resolved.seq(), seed));
    }
}

/// Switch away from a task that is finishing (normally or by exit) and will
/// never be resumed. Unlike [`perform_switch`] there is no origin stack or
/// host state to capture — `dying`'s context slot is written into purely to
/// satisfy the raw switch routine's ABI and is never read again.
pub(crate) fn terminal_switch(dying: &Arc<TaskCore>, target: Arc<TaskCore>, transfer: Transfer) -> ! {
    let resolved = TaskCore::resolve_target(target);
    debug_assert_eq!(resolved.owner, dying.owner, "a task's live ancestors share its owner thread");

    thread_state::drain_deferred_for_current_thread();

    unsafe {
        *resolved.transfer.get() = Some(transfer);
    }

    activate_if_unstarted(&resolved);

    unsafe {
        (*resolved.stack.get()).as_ref().unwrap().materialize();
    }
    let resolved_host = unsafe { (*resolved.host.get()).take() }
        .expect("a task always has a host-state snapshot while not current");
    host::install(resolved_host);
    resolved.set_state(State::Running);
    thread_state::set_current(resolved.clone());

    unsafe {
        context::switch(dying.context.get(), resolved.context.get());
    }
    unreachable!("a dead task's context is never switched back into");
}
