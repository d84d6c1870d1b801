//! The public task API.
//!
//! [`Task<T>`] is a thin typed handle around the non-generic [`TaskCore`]
//! engine: creation, switching, and throwing deal in `T` at this boundary
//! and type-erase to `Box<dyn Any + Send>` immediately before crossing into
//! [`crate::switch`]. Introspection that doesn't need `T` (liveness,
//! parent, frame root, captured stack bounds) lives on the untyped
//! [`TaskHandle`] that every `Task<T>` derefs to.

use std::any::Any;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::core::{Entry, TaskCore, Transfer};
use crate::error::{Raised, StructuralError};
use crate::host::ContextOption;
use crate::trace::{self, TraceEvent};

/// A type-erased reference to a task, usable for introspection regardless
/// of what value type it switches with.
#[derive(Clone)]
pub struct TaskHandle(pub(crate) Arc<TaskCore>);

impl TaskHandle {
    pub fn is_dead(&self) -> bool {
        self.0.is_dead()
    }

    pub fn is_started(&self) -> bool {
        self.0.is_started()
    }

    pub fn is_current(&self) -> bool {
        self.0.is_current()
    }

    pub fn is_main(&self) -> bool {
        self.0.is_main()
    }

    pub fn owner(&self) -> std::thread::ThreadId {
        self.0.owner()
    }

    pub fn parent(&self) -> Option<TaskHandle> {
        self.0.parent().map(TaskHandle)
    }

    pub fn stack_frame_root(&self) -> crate::host::FrameRoot {
        self.0.stack_frame_root()
    }

    /// The `[low, high)` byte range of this task's captured native stack,
    /// if it is currently suspended.
    pub fn captured_stack_bounds(&self) -> Option<(usize, usize)> {
        self.0.captured_stack_bounds()
    }
}

/// A cooperatively scheduled task exchanging values of type `T` with
/// whoever switches into or out of it.
pub struct Task<T> {
    handle: TaskHandle,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Deref for Task<T> {
    type Target = TaskHandle;
    fn deref(&self) -> &TaskHandle {
        &self.handle
    }
}

/// Configuration for a new [`Task`].
pub struct Builder<T> {
    context: ContextOption,
    stack_hint: Option<usize>,
    parent: Option<TaskHandle>,
    _marker: PhantomData<T>,
}

impl<T: Send + 'static> Default for Builder<T> {
    fn default() -> Self {
        Builder {
            context: ContextOption::Propagate,
            stack_hint: None,
            parent: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Builder<T> {
    /// Whether the new task starts with its creator's host-state snapshot
    /// (`Propagate`, the default), a blank one (`Fresh`), or an explicit one.
    pub fn context(mut self, option: ContextOption) -> Self {
        self.context = option;
        self
    }

    /// Advisory only: this crate's tasks share the OS thread's one native
    /// stack rather than pre-allocating their own, so there is
    /// no buffer to size up front. Kept for API parity with runtimes that
    /// do pre-allocate, and ignored otherwise.
    pub fn stack_hint(mut self, bytes: usize) -> Self {
        self.stack_hint = Some(bytes);
        self
    }

    /// Create the task as a child of `parent` instead of the calling task.
    /// `parent` must share the new task's owner thread, the same constraint
    /// `Task::set_parent` enforces after the fact; giving one up front
    /// avoids the spawn-then-reparent window in which `TraceEvent::Created`
    /// would otherwise report the wrong parent.
    pub fn parent(mut self, parent: &TaskHandle) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Create the task as a child of the calling task (or of whatever
    /// `Builder::parent` set), without starting it: tasks begin `Unstarted`
    /// and run their entry point lazily on first switch.
    pub fn spawn<F>(self, body: F) -> Task<T>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        let _ = self.stack_hint;
        let parent = self.parent.map(|p| p.0).unwrap_or_else(crate::thread_state::current);
        let owner = parent.owner;
        let entry: Entry = Box::new(move |input: Box<dyn Any + Send>| {
            let value = *input.downcast::<T>().expect("task received a value of the wrong type");
            Box::new(body(value)) as Box<dyn Any + Send>
        });
        let core = TaskCore::new_child(owner, parent.clone(), entry, self.context);
        trace::emit(TraceEvent::Created { task: core.id(), parent: parent.id() });
        Task { handle: TaskHandle(core), _marker: PhantomData }
    }
}

impl<T: Send + 'static> Task<T> {
    pub fn builder() -> Builder<T> {
        Builder::default()
    }

    /// Spawn with default options.
    pub fn spawn<F>(body: F) -> Task<T>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        Self::builder().spawn(body)
    }

    /// A handle to the calling OS thread's implicit main task, typed `T`
    /// for callers who know that's what they'll exchange with it.
    pub fn current_main() -> Task<T> {
        let core = crate::thread_state::main_task();
        // A fresh `Task` handle to an already-shared `TaskCore`, exactly
        // like `Clone`: bump the manual refcount so this handle's own
        // `Drop` has something to balance.
        core.inc_ref();
        Task {
            handle: TaskHandle(core),
            _marker: PhantomData,
        }
    }

    /// Switch from the calling task to this one, delivering `value` and
    /// blocking until something switches back.
    pub fn switch_to(&self, value: T) -> Result<T, Raised> {
        let result = crate::switch::perform_switch(
            self.handle.0.clone(),
            Transfer::Value(Box::new(value)),
        )?;
        Ok(*result.downcast::<T>().expect("task switch delivered a value of the wrong type"))
    }

    /// Force this task to unwind with the reserved exit-signal, or deliver
    /// an arbitrary failure to be raised at its suspension point.
    pub fn throw(&self, failure: crate::error::Failure) -> Result<T, Raised> {
        let result = crate::switch::perform_switch(self.handle.0.clone(), Transfer::Failure(failure))?;
        Ok(*result.downcast::<T>().expect("task switch delivered a value of the wrong type"))
    }

    /// Reassign this task's parent: rejected if `new_parent` is owned by a
    /// different OS thread or would close a cycle.
    pub fn set_parent(&self, new_parent: &TaskHandle) -> Result<(), StructuralError> {
        self.handle.0.set_parent(new_parent.0.clone())
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        self.handle.0.inc_ref();
        Task {
            handle: TaskHandle(self.handle.0.clone()),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // `fetch_sub` returns the count as it was *before* decrementing;
        // exactly one dropper ever observes `1` here, unlike a check against
        // `Arc::strong_count`, which two concurrent droppers could both see
        // as "2" before either had actually decremented (see DESIGN.md).
        if self.handle.0.dec_ref() != 1 {
            return;
        }
        let core = self.handle.0.clone();
        if core.owner == std::thread::current().id() {
            crate::lifecycle::force_unwind_and_drop(core);
        } else if crate::thread_state::is_owner_dead(core.owner) {
            // The owner thread is gone; it will never drain a deferred
            // queue again, so queuing this task there would leak it
            // forever. Reclaim it here instead of waiting for an owner
            // that isn't coming back.
            crate::lifecycle::hard_reclaim(&core);
        } else {
            crate::thread_state::defer_destruction(core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_task_starts_unstarted() {
        let t: Task<u32> = Task::spawn(|x| x + 1);
        assert!(!t.is_started());
        assert!(!t.is_dead());
    }

    #[test]
    fn current_main_is_main_and_current() {
        let main: Task<()> = Task::current_main();
        assert!(main.is_main());
        assert!(main.is_current());
    }

    #[test]
    fn switch_to_child_and_back_round_trips_values() {
        let child: Task<u32> = Task::spawn(|x| {
            let back = Task::<u32>::current_main().switch_to(x + 1).unwrap();
            back * 2
        });
        let first = child.switch_to(10).unwrap();
        assert_eq!(first, 11);
        let second = child.switch_to(5).unwrap();
        assert_eq!(second, 10);
        assert!(child.is_dead());
    }

    #[test]
    fn builder_parent_sets_a_non_default_parent_up_front() {
        let grandparent: Task<()> = Task::builder().spawn(|_| {});
        let child: Task<()> = Task::builder().parent(&grandparent).spawn(|_| {});
        let parent = child.parent().expect("child was given an explicit parent");
        assert!(Arc::ptr_eq(&parent.0, &grandparent.handle.0));
    }

    /// `ContextOption::Propagate` (the default) hands a new task the
    /// creator's context snapshot at spawn time; `Fresh` starts it blank
    /// regardless of what the creator currently has installed; `Explicit`
    /// seeds it with a caller-supplied value instead of either.
    #[test]
    fn context_option_controls_the_spawned_task_initial_snapshot() {
        use crate::host::{current_context, set_current_context, ContextSnapshot};

        set_current_context(ContextSnapshot::new(7u32));

        let propagated: Task<()> = Task::builder().spawn(|_| {
            assert_eq!(current_context().get::<u32>(), Some(&7));
        });
        propagated.switch_to(()).unwrap();

        let fresh: Task<()> = Task::builder().context(ContextOption::Fresh).spawn(|_| {
            assert_eq!(current_context().get::<u32>(), None);
        });
        fresh.switch_to(()).unwrap();

        let explicit: Task<()> = Task::builder()
            .context(ContextOption::Explicit(ContextSnapshot::new(99u32)))
            .spawn(|_| {
                assert_eq!(current_context().get::<u32>(), Some(&99));
            });
        explicit.switch_to(()).unwrap();

        set_current_context(ContextSnapshot::empty());
    }
}
