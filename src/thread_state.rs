//! Per-OS-thread registry.
//!
//! Each OS thread lazily gets exactly one main task the first time this
//! crate is touched on it, and exactly one deferred-destruction
//! queue that only that thread ever drains. When an OS thread itself
//! terminates, this module also has one last opportunity to act, through
//! the `STATE` thread-local's own destructor: §4.4 requires that a dead
//! thread's main task be marked dead and its remaining owned tasks be
//! force-terminated "by the next core call on any thread" — but a
//! suspended task's captured stack can only ever be safely resumed on its
//! owner thread (migrating it elsewhere is the one thing §1/§5 forbid), and
//! by the time the owner thread is gone, no thread, including the owner
//! itself mid-teardown, can safely run that resume. So the actual
//! reclamation a dead owner's tasks get is a *hard* one: mark dead, drop the
//! captured stack and host-state bytes, and skip the exit-signal unwind
//! entirely, the same outcome a suspended generator gets if the process
//! itself exited out from under it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use crate::core::{State, TaskCore};

thread_local! {
    static STATE: RefCell<ThreadState> = RefCell::new(ThreadState::new());
}

static TOTAL_MAIN_TASKS: AtomicU64 = AtomicU64::new(0);

struct ThreadState {
    main: Option<Arc<TaskCore>>,
    current: Option<Arc<TaskCore>>,
    /// Single-producer (any thread dropping a `Task` it doesn't own)
    /// single-consumer (this thread, via `drain_pending_cleanup`) queue of
    /// task engines awaiting destruction.
    deferred: Vec<Arc<TaskCore>>,
}

impl ThreadState {
    fn new() -> Self {
        ThreadState {
            main: None,
            current: None,
            deferred: Vec::new(),
        }
    }
}

/// Runs once, as this thread's last act, when `STATE` itself is torn down.
/// Must not call back into `thread_state::current()`/`main_task()` (or
/// anything that reaches `STATE.with`) — the thread-local is already mid-
/// destruction and a reentrant access would panic. Everything needed comes
/// from `self` or the process-wide statics below.
impl Drop for ThreadState {
    fn drop(&mut self) {
        let owner = match &self.main {
            Some(main) => {
                main.set_state(State::Dead);
                main.owner
            }
            // This thread never touched the runtime; nothing to reclaim.
            None => return,
        };
        mark_owner_dead(owner);

        for weak in GLOBAL_OWNED.take_for_owner(owner) {
            if let Some(task) = weak.upgrade() {
                crate::lifecycle::hard_reclaim(&task);
            }
        }
        // Anyone who dropped a `Task` handle to one of our tasks from a
        // foreign thread before we got here was counting on us to drain
        // this; we're the last thread that ever will.
        for task in GLOBAL_DEFERRED.take_for_owner(owner) {
            crate::lifecycle::hard_reclaim(&task);
        }
    }
}

/// The calling thread's main task, creating it on first call.
pub(crate) fn main_task() -> Arc<TaskCore> {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if s.main.is_none() {
            let main = TaskCore::new_main(std::thread::current().id());
            TOTAL_MAIN_TASKS.fetch_add(1, Ordering::Relaxed);
            s.current = Some(main.clone());
            s.main = Some(main);
        }
        s.main.clone().unwrap()
    })
}

/// The calling thread's currently running task, creating the main task if
/// nothing has run yet.
pub(crate) fn current() -> Arc<TaskCore> {
    STATE.with(|s| {
        if s.borrow().current.is_none() {
            drop(s.borrow());
            main_task();
        }
        s.borrow().current.clone().unwrap()
    })
}

pub(crate) fn is_current(task: &TaskCore) -> bool {
    STATE.with(|s| match &s.borrow().current {
        Some(cur) => std::ptr::eq(cur.as_ref(), task),
        None => false,
    })
}

/// Record that `task` is now the running task on this thread. Must only be
/// called by the switch protocol, on `task`'s own owner thread, immediately
/// after the raw context switch lands.
pub(crate) fn set_current(task: Arc<TaskCore>) {
    STATE.with(|s| s.borrow_mut().current = Some(task));
}

/// Record a freshly created task under its owner thread's entry in the
/// process-wide registry, so that if the owner thread later exits while the
/// task is still alive, its destructor has something to sweep. Holds only a
/// `Weak`: a task's lifetime is governed entirely by its `Task` handles and
/// its parent chain, never by this bookkeeping entry.
pub(crate) fn register_owned(task: &Arc<TaskCore>) {
    GLOBAL_OWNED.register(task.owner, Arc::downgrade(task));
}

/// Hand a dead, foreign-owned task's engine to its owner thread's deferred
/// queue instead of running its destructor inline. Called from
/// `Task::drop` when the dropping thread isn't the task's owner.
pub(crate) fn defer_destruction(task: Arc<TaskCore>) {
    let owner = task.owner;
    // There is no cross-thread handle to another thread's `thread_local`,
    // so the owner thread must itself later notice and drain this queue.
    // Since we cannot reach into another thread's `STATE` from here, the
    // queue this function pushes into lives with the task system's global
    // registry instead, keyed by owner thread, and is drained the next
    // time that thread performs any switch (see `drain_for_current_thread`),
    // or, if the owner thread has already exited, by its `ThreadState`
    // destructor instead.
    GLOBAL_DEFERRED.with_owner(owner, |q| q.push(task));
}

/// Drain every task engine deferred to the calling thread and force each
/// one through the same exit-signal unwind a same-thread `Task::drop` would
/// have triggered. The switch protocol calls this opportunistically at the
/// start of every switch.
pub(crate) fn drain_deferred_for_current_thread() {
    let owner = std::thread::current().id();
    for task in GLOBAL_DEFERRED.take_for_owner(owner) {
        crate::lifecycle::force_unwind_and_drop(task);
    }
}

/// Whether `owner` is an OS thread that has already torn down its `STATE`.
/// A `Task` whose owner reports true here can never again be the target of
/// a real unwind — `Task::drop` hard-reclaims it immediately instead of
/// queuing it for an owner that will never come back to drain it.
pub(crate) fn is_owner_dead(owner: ThreadId) -> bool {
    DEAD_OWNERS.lock().unwrap().contains(&owner)
}

fn mark_owner_dead(owner: ThreadId) {
    let mut dead = DEAD_OWNERS.lock().unwrap();
    if !dead.contains(&owner) {
        dead.push(owner);
    }
}

/// A flat `Vec` rather than a `HashSet`: the number of OS threads that ever
/// touch this crate and then exit is small over a process lifetime, and a
/// linear scan avoids pulling in a non-`const`-constructible set here.
static DEAD_OWNERS: std::sync::Mutex<Vec<ThreadId>> = std::sync::Mutex::new(Vec::new());

pub fn get_pending_cleanup_count() -> usize {
    GLOBAL_DEFERRED.len_for_owner(std::thread::current().id())
}

pub fn get_total_main_tasks() -> u64 {
    TOTAL_MAIN_TASKS.load(Ordering::Relaxed)
}

/// Process-wide table of per-owner-thread deferred-destruction queues.
/// Needed because a `Task` can be dropped from a thread that is not its
/// owner and has no other way to reach the owner's `thread_local` state.
struct GlobalDeferred {
    inner: std::sync::Mutex<std::collections::HashMap<ThreadId, Vec<Arc<TaskCore>>>>,
}

impl GlobalDeferred {
    const fn new() -> Self {
        GlobalDeferred {
            inner: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn with_owner(&self, owner: ThreadId, f: impl FnOnce(&mut Vec<Arc<TaskCore>>)) {
        let mut map = self.inner.lock().unwrap();
        f(map.entry(owner).or_default());
    }

    fn take_for_owner(&self, owner: ThreadId) -> Vec<Arc<TaskCore>> {
        self.inner.lock().unwrap().remove(&owner).unwrap_or_default()
    }

    fn len_for_owner(&self, owner: ThreadId) -> usize {
        self.inner.lock().unwrap().get(&owner).map_or(0, Vec::len)
    }
}

static GLOBAL_DEFERRED: GlobalDeferred = GlobalDeferred::new();

/// Process-wide table of every task ever created, by owner thread, held
/// weakly so this bookkeeping never keeps a task alive on its own. Only
/// consulted when an owner thread's `ThreadState` is torn down; pruned of
/// stale entries on every registration so a long-running thread that
/// creates and finishes many short-lived tasks doesn't accumulate dead
/// weak pointers forever.
struct GlobalOwned {
    inner: std::sync::Mutex<std::collections::HashMap<ThreadId, Vec<Weak<TaskCore>>>>,
}

impl GlobalOwned {
    const fn new() -> Self {
        GlobalOwned {
            inner: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn register(&self, owner: ThreadId, weak: Weak<TaskCore>) {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(owner).or_default();
        entry.retain(|w| w.strong_count() > 0);
        entry.push(weak);
    }

    fn take_for_owner(&self, owner: ThreadId) -> Vec<Weak<TaskCore>> {
        self.inner.lock().unwrap().remove(&owner).unwrap_or_default()
    }
}

static GLOBAL_OWNED: GlobalOwned = GlobalOwned::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_task_is_lazily_created_once() {
        let a = main_task();
        let b = main_task();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_main());
    }

    #[test]
    fn current_defaults_to_main_task() {
        let main = main_task();
        let cur = current();
        assert!(Arc::ptr_eq(&main, &cur));
        assert!(is_current(&main));
    }

    #[test]
    fn owner_of_a_still_running_thread_is_not_dead() {
        assert!(!is_owner_dead(std::thread::current().id()));
    }

    /// A thread that exits while a `Task` handle it created is still held
    /// by another (live) thread must have that task hard-reclaimed: dead,
    /// with its captured-stack/host-state resources released, rather than
    /// left dangling in a registry keyed by a thread that will never come
    /// back to drain it.
    #[test]
    fn owner_thread_exit_hard_reclaims_orphaned_tasks() {
        let (tx, rx) = std::sync::mpsc::channel();
        let owner = std::thread::spawn(move || {
            let g: crate::task::Task<()> = crate::task::Task::spawn(|_| {
                crate::task::Task::<()>::current_main().switch_to(()).unwrap();
            });
            g.switch_to(()).unwrap();
            assert!(!g.is_dead());
            tx.send(g).unwrap();
        });
        let g = rx.recv().unwrap();
        owner.join().unwrap();

        assert!(is_owner_dead(g.owner()));
        assert!(g.is_dead());
    }
}
