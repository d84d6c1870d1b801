//! Host-runtime capabilities the core requires from its embedder, and the
//! per-task snapshot built from them.
//!
//! A suspended task's logical execution state includes more than its native
//! stack: a live exception, a call-frame chain, a "current context"
//! snapshot, and a recursion counter, all of which must travel with
//! whichever task is logically executing rather than staying pinned to the
//! OS thread. This crate's host is Rust itself: the four capabilities are
//! modeled as `thread_local!` slots that `switch` captures out of and
//! restores into around every switch.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;

use crate::error::Failure;

/// One node of a task's call-frame chain. Nothing in the crate pushes
/// these automatically — user code (or a generator/scheduler built on top)
/// opts in by holding a `Frame` guard for the duration of a call it wants
/// visible to `Task::stack_frame_root`.
pub struct Frame {
    parent: *const Frame,
    label: &'static str,
}

thread_local! {
    static EXCEPTION_IN_FLIGHT: RefCell<Option<Failure>> = const { RefCell::new(None) };
    static FRAME_CHAIN: Cell<*const Frame> = const { Cell::new(ptr::null()) };
    static CONTEXT_SNAPSHOT: RefCell<ContextSnapshot> = RefCell::new(ContextSnapshot::default());
    static RECURSION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// An opaque "current context" value. Modeled as a cheaply
/// cloneable handle rather than a concrete type, since the core has no
/// opinion on what a host's context snapshot contains.
#[derive(Clone, Default)]
pub struct ContextSnapshot(pub(crate) Option<Arc<dyn std::any::Any + Send + Sync>>);

impl ContextSnapshot {
    pub fn empty() -> Self {
        ContextSnapshot(None)
    }

    pub fn new<V: std::any::Any + Send + Sync>(value: V) -> Self {
        ContextSnapshot(Some(Arc::new(value)))
    }

    pub fn get<V: std::any::Any>(&self) -> Option<&V> {
        self.0.as_deref()?.downcast_ref::<V>()
    }
}

/// RAII guard that pushes one frame onto the *current task's* call-frame
/// chain for as long as it's held, restoring the previous head on drop.
/// This is the mechanism `Task::stack_frame_root` walks.
pub struct FrameGuard {
    previous: *const Frame,
    // Box so the frame has a stable address for children to point at.
    frame: Box<Frame>,
}

impl FrameGuard {
    pub fn enter(label: &'static str) -> Self {
        let previous = FRAME_CHAIN.with(Cell::get);
        let frame = Box::new(Frame { parent: previous, label });
        FRAME_CHAIN.with(|c| c.set(frame.as_ref() as *const Frame));
        FrameGuard { previous, frame }
    }

    pub fn label(&self) -> &'static str {
        self.frame.label
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAME_CHAIN.with(|c| c.set(self.previous));
    }
}

/// A read-only view of a task's saved (or live) frame-chain root.
#[derive(Clone, Copy)]
pub struct FrameRoot(pub(crate) *const Frame);

impl FrameRoot {
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Number of frames from this root up to (and including) the furthest
    /// ancestor. Safe to call as long as the owning task's frames are still
    /// alive on its (possibly suspended) stack, which is always true while
    /// the `Task` handle that produced this root is reachable.
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cur = self.0;
        while !cur.is_null() {
            n += 1;
            // Safety: frame nodes are boxed and linked only while their
            // owning stack (real or captured) is alive; a task's frame
            // chain never outlives the task itself.
            cur = unsafe { (*cur).parent };
        }
        n
    }

    pub fn label(&self) -> Option<&'static str> {
        if self.0.is_null() {
            None
        } else {
            Some(unsafe { (*self.0).label })
        }
    }
}

/// Whether to start a new task's host state as a clone of the creator's, a
/// blank slate, or an explicit value.
pub enum ContextOption {
    Propagate,
    Fresh,
    Explicit(ContextSnapshot),
}

impl Default for ContextOption {
    fn default() -> Self {
        ContextOption::Propagate
    }
}

/// The bundle of host state that travels with a task across a switch.
pub struct HostState {
    pub(crate) exception: Option<Failure>,
    pub(crate) frame_root: *const Frame,
    pub(crate) context_snapshot: ContextSnapshot,
    pub(crate) recursion_depth: u32,
}

impl HostState {
    pub(crate) fn fresh() -> Self {
        HostState {
            exception: None,
            frame_root: ptr::null(),
            context_snapshot: ContextSnapshot::empty(),
            recursion_depth: 0,
        }
    }

    pub(crate) fn from_option(option: &ContextOption) -> Self {
        match option {
            ContextOption::Fresh => HostState::fresh(),
            ContextOption::Explicit(snapshot) => HostState {
                context_snapshot: snapshot.clone(),
                ..HostState::fresh()
            },
            ContextOption::Propagate => capture_current(),
        }
    }

    pub(crate) fn frame_root(&self) -> FrameRoot {
        FrameRoot(self.frame_root)
    }
}

/// The calling thread's live frame-chain head, for a task that is currently
/// `Running` (its frames are on the real stack, not a saved snapshot).
pub(crate) fn current_frame_chain() -> *const Frame {
    FRAME_CHAIN.with(Cell::get)
}

/// The context snapshot of whatever task is currently running on this OS
/// thread. Reflects `ContextOption::{Fresh,Explicit}` immediately after a
/// switch lands in a freshly activated task, and tracks `set_current_context`
/// calls a running task makes to update its own snapshot in place.
pub fn current_context() -> ContextSnapshot {
    CONTEXT_SNAPSHOT.with(|c| c.borrow().clone())
}

/// Replace the current task's context snapshot in place, without a switch.
/// The new value becomes part of what the next switch-out captures, so a
/// later resume of this same task observes it again.
pub fn set_current_context(snapshot: ContextSnapshot) {
    CONTEXT_SNAPSHOT.with(|c| *c.borrow_mut() = snapshot);
}

/// Read the calling thread's current host state without disturbing it
/// (used for `ContextOption::Propagate` at task creation).
fn capture_current() -> HostState {
    HostState {
        exception: None,
        frame_root: FRAME_CHAIN.with(Cell::get),
        context_snapshot: CONTEXT_SNAPSHOT.with(|c| c.borrow().clone()),
        recursion_depth: RECURSION_DEPTH.with(Cell::get),
    }
}

/// Swap the calling thread's host state out, returning what was there.
pub(crate) fn take() -> HostState {
    HostState {
        exception: EXCEPTION_IN_FLIGHT.with(|e| e.borrow_mut().take()),
        frame_root: FRAME_CHAIN.with(Cell::get),
        context_snapshot: CONTEXT_SNAPSHOT.with(|c| c.borrow().clone()),
        recursion_depth: RECURSION_DEPTH.with(Cell::get),
    }
}

/// Install `state` as the calling thread's host state.
pub(crate) fn install(state: HostState) {
    EXCEPTION_IN_FLIGHT.with(|e| *e.borrow_mut() = state.exception);
    FRAME_CHAIN.with(|c| c.set(state.frame_root));
    CONTEXT_SNAPSHOT.with(|c| *c.borrow_mut() = state.context_snapshot);
    RECURSION_DEPTH.with(|d| d.set(state.recursion_depth));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_guard_tracks_depth() {
        assert_eq!(FrameRoot(FRAME_CHAIN.with(Cell::get)).depth(), 0);
        let _a = FrameGuard::enter("a");
        let _b = FrameGuard::enter("b");
        let root = FrameRoot(FRAME_CHAIN.with(Cell::get));
        assert_eq!(root.depth(), 2);
        assert_eq!(root.label(), Some("b"));
        drop(_b);
        assert_eq!(FrameRoot(FRAME_CHAIN.with(Cell::get)).depth(), 1);
    }

    #[test]
    fn take_and_install_round_trip_recursion_depth() {
        RECURSION_DEPTH.with(|d| d.set(7));
        let state = take();
        assert_eq!(RECURSION_DEPTH.with(Cell::get), 7);
        RECURSION_DEPTH.with(|d| d.set(0));
        install(state);
        assert_eq!(RECURSION_DEPTH.with(Cell::get), 7);
    }

    #[test]
    fn set_current_context_is_visible_through_current_context() {
        set_current_context(ContextSnapshot::new(42u32));
        assert_eq!(current_context().get::<u32>(), Some(&42));
        set_current_context(ContextSnapshot::empty());
        assert_eq!(current_context().get::<u32>(), None);
    }
}
