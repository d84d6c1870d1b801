//! The non-generic task engine.
//!
//! `TaskCore` holds everything about a task that the switch protocol needs
//! regardless of what value type it exchanges: identity, parent link,
//! liveness, the saved machine context, the captured stack slot, and the
//! host-state snapshot. It is deliberately *not* generic — the one piece
//! that varies per task (the entry point closure and the last delivered
//! value) is type-erased to `Box<dyn Any + Send>` here and given back its
//! concrete type only at the `Task<T>` boundary in `task.rs`. This keeps
//! the unsafe switch machinery monomorphized exactly once instead of once
//! per payload type.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::context::Context;
use crate::host::{ContextOption, FrameRoot, HostState};
use crate::stack::StackSlot;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Unstarted,
    Suspended,
    Running,
    Dead,
}

impl State {
    fn to_u8(self) -> u8 {
        match self {
            State::Unstarted => 0,
            State::Suspended => 1,
            State::Running => 2,
            State::Dead => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Unstarted,
            1 => State::Suspended,
            2 => State::Running,
            _ => State::Dead,
        }
    }
}

/// Type-erased payload crossing a switch boundary: either a value headed
/// into the resumed task, or a failure to re-raise there (`Task::throw`).
pub(crate) enum Transfer {
    Value(Box<dyn Any + Send>),
    Failure(crate::error::Failure),
}

pub(crate) type Entry = Box<dyn FnOnce(Box<dyn Any + Send>) -> Box<dyn Any + Send> + Send>;

/// The engine behind one task. Shared via `Arc`; mutated only by code
/// running on `owner` (enforced by debug assertions at every mutation
/// site), except for the atomics (`state`, `refs`) and `parent`'s `Mutex`,
/// which are safe to touch from any thread by construction.
pub struct TaskCore {
    id: TaskId,
    pub(crate) owner: ThreadId,
    parent: Mutex<Option<std::sync::Arc<TaskCore>>>,
    state: AtomicU8,
    /// Manual refcount mirroring the `Arc`'s, incremented/decremented only
    /// by `Task::clone`/`Task::drop` so the last-reference check used to
    /// trigger destruction can never race (see DESIGN.md).
    refs: AtomicUsize,
    is_main: bool,
    seq: u64,

    pub(crate) entry: Mutex<Option<Entry>>,
    pub(crate) context: std::cell::UnsafeCell<Context>,
    pub(crate) stack: std::cell::UnsafeCell<Option<StackSlot>>,
    pub(crate) host: std::cell::UnsafeCell<Option<HostState>>,
    pub(crate) transfer: std::cell::UnsafeCell<Option<Transfer>>,
    pub(crate) stack_ceiling: std::cell::Cell<usize>,
    pub(crate) live_frame_root: std::cell::Cell<*const crate::host::Frame>,
}

// Safety: every field above that isn't already thread-safe on its own
// (the atomics, the `Mutex`es) is touched exclusively by whichever OS
// thread currently holds the "I am `owner`" guarantee the switch protocol
// establishes before it lets any task-specific code run: a task's captured
// stack, host-state snapshot, and parent pointer are mutated only on the
// owner thread. Cross-thread access is limited to: dropping the last `Task`
// handle (which only reads `owner`/`state`/`refs`, or hands the whole `Arc`
// to the owner's deferred queue), and the read-only atomic queries.
unsafe impl Send for TaskCore {}
unsafe impl Sync for TaskCore {}

impl TaskCore {
    pub(crate) fn new_main(owner: ThreadId) -> std::sync::Arc<Self> {
        let core = std::sync::Arc::new(TaskCore {
            id: TaskId::next(),
            owner,
            parent: Mutex::new(None),
            state: AtomicU8::new(State::Running.to_u8()),
            refs: AtomicUsize::new(1),
            is_main: true,
            seq: crate::stack::next_seq(),
            entry: Mutex::new(None),
            context: std::cell::UnsafeCell::new(Context::default()),
            stack: std::cell::UnsafeCell::new(None),
            host: std::cell::UnsafeCell::new(Some(HostState::fresh())),
            transfer: std::cell::UnsafeCell::new(None),
            stack_ceiling: std::cell::Cell::new(0),
            live_frame_root: std::cell::Cell::new(std::ptr::null()),
        });
        crate::thread_state::register_owned(&core);
        core
    }

    pub(crate) fn new_child(
        owner: ThreadId,
        parent: std::sync::Arc<TaskCore>,
        entry: Entry,
        context_option: ContextOption,
    ) -> std::sync::Arc<Self> {
        let core = std::sync::Arc::new(TaskCore {
            id: TaskId::next(),
            owner,
            parent: Mutex::new(Some(parent)),
            state: AtomicU8::new(State::Unstarted.to_u8()),
            refs: AtomicUsize::new(1),
            is_main: false,
            seq: crate::stack::next_seq(),
            entry: Mutex::new(Some(entry)),
            context: std::cell::UnsafeCell::new(Context::default()),
            stack: std::cell::UnsafeCell::new(None),
            host: std::cell::UnsafeCell::new(Some(HostState::from_option(&context_option))),
            transfer: std::cell::UnsafeCell::new(None),
            stack_ceiling: std::cell::Cell::new(0),
            live_frame_root: std::cell::Cell::new(std::ptr::null()),
        });
        crate::thread_state::register_owned(&core);
        core
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: State) {
        self.state.store(s.to_u8(), Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.state() == State::Dead
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.state(), State::Unstarted)
    }

    pub fn is_current(&self) -> bool {
        crate::thread_state::is_current(self)
    }

    pub fn parent(&self) -> Option<std::sync::Arc<TaskCore>> {
        self.parent.lock().unwrap().clone()
    }

    /// Reassign this task's parent: rejected if the new parent is on another
    /// thread or the assignment would introduce a cycle. Locking `parent`
    /// (ours, uncontended on the owner thread) makes this atomic with
    /// respect to any other operation touching the tree on this thread.
    pub fn set_parent(
        self: &std::sync::Arc<Self>,
        new_parent: std::sync::Arc<TaskCore>,
    ) -> Result<(), crate::error::StructuralError> {
        if new_parent.owner != self.owner {
            return Err(crate::error::StructuralError::ForeignParent);
        }
        let mut walker = Some(new_parent.clone());
        while let Some(t) = walker {
            if std::sync::Arc::ptr_eq(&t, self) {
                return Err(crate::error::StructuralError::Cycle);
            }
            walker = t.parent();
        }
        *self.parent.lock().unwrap() = Some(new_parent);
        Ok(())
    }

    /// The first live ancestor of a dead task, or the main task of `T`'s
    /// owner thread if every ancestor is dead.
    pub(crate) fn resolve_target(target: std::sync::Arc<TaskCore>) -> std::sync::Arc<TaskCore> {
        let mut cur = target;
        while cur.is_dead() {
            match cur.parent() {
                Some(p) => cur = p,
                None => break,
            }
        }
        cur
    }

    pub fn stack_frame_root(&self) -> FrameRoot {
        if self.is_current() {
            FrameRoot(crate::host::current_frame_chain())
        } else if self.state() == State::Suspended {
            // Safety: only the owner thread writes `host`; reading it from
            // any thread is a snapshot read of an `Option` that is never
            // freed while this `Arc` is alive, and `FrameRoot` itself is
            // just a pointer value, not a dereference.
            let root = unsafe { (*self.host.get()).as_ref().map(|h| h.frame_root()) };
            root.unwrap_or(FrameRoot(std::ptr::null()))
        } else {
            FrameRoot(std::ptr::null())
        }
    }

    pub fn captured_stack_bounds(&self) -> Option<(usize, usize)> {
        if self.state() != State::Suspended {
            return None;
        }
        // Safety: read-only peek; only valid to call while suspended, and
        // only meaningful for introspection (matches invariant 4: a
        // non-empty captured region exists iff suspended and started).
        unsafe { (*self.stack.get()).as_ref().map(StackSlot::bounds) }
    }

    /// Manual refcount used to detect the truly-last `Task` handle without
    /// racing `Arc`'s own internal count (see `task.rs`).
    pub(crate) fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_ref(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("is_main", &self.is_main)
            .finish()
    }
}
