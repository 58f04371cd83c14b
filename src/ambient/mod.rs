// Copyright 2024 tison <wander4096@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-task ambient lock context: which [`Awaiter`](crate::core::Awaiter)s the currently
//! executing task holds, and the current [`HideLocks`](crate::AsyncRwLock::hide_locks)
//! suppression depth.
//!
//! Rust has no built-in analogue of a framework-flowed logical call context (the way the
//! original design's `AsyncLocal` rides along with every continuation). We approximate it with
//! thread-local storage plus an explicit snapshot/[`Scope`] pair that a caller can use to carry
//! ambient state across a task boundary it controls (e.g. before `tokio::spawn`-ing a child task,
//! or around a sub-future that a work-stealing runtime might resume on a different worker
//! thread). Within a single `async fn`/`async` block — the common case, since everything between
//! two `.await` points is one state machine polled as a unit — the thread-local view is exactly
//! as consistent as the task itself, because nothing else can run in between.
//!
//! See [`propagate`] for the combinator that re-enters a snapshot on every poll of a wrapped
//! future, which is the tool to reach for when ambient visibility must survive a spawn or a
//! thread hop.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

/// Identifies one [`crate::AsyncRwLock`] instance so the ambient stack — which is shared across
/// every lock a task happens to touch — can find "the nearest enclosing held Awaiter **for this
/// lock**" rather than for whichever lock was acquired most recently overall.
pub(crate) type LockInstanceId = u64;

static NEXT_LOCK_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh [`LockInstanceId`], called once per [`crate::AsyncRwLock::new`].
pub(crate) fn next_lock_instance_id() -> LockInstanceId {
    NEXT_LOCK_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct StackEntry {
    lock_id: LockInstanceId,
    awaiter: u64,
}

thread_local! {
    static STACK: RefCell<Vec<StackEntry>> = const { RefCell::new(Vec::new()) };
    static SUPPRESSION_DEPTH: RefCell<u32> = const { RefCell::new(0) };
}

/// Pushes `awaiter` as the new innermost held Awaiter for `lock_id` on the current task.
///
/// Called exactly once, synchronously, at the moment a request is granted.
pub(crate) fn push(lock_id: LockInstanceId, awaiter: u64) {
    STACK.with(|s| s.borrow_mut().push(StackEntry { lock_id, awaiter }));
}

/// Removes `awaiter` from the current task's stack. A no-op if it is not present (defensive:
/// release is idempotent and may be invoked from a different logical moment than its push under
/// test harnesses that drive guards manually).
pub(crate) fn pop(lock_id: LockInstanceId, awaiter: u64) {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        if let Some(pos) = stack
            .iter()
            .rposition(|e| e.lock_id == lock_id && e.awaiter == awaiter)
        {
            stack.remove(pos);
        }
    });
}

/// Returns `true` while any [`HideLocksGuard`] is alive on the current task.
pub(crate) fn is_suppressed() -> bool {
    SUPPRESSION_DEPTH.with(|d| *d.borrow() > 0)
}

/// The nearest enclosing held Awaiter for `lock_id`, or `None` if the task holds none — or if
/// suppression is active, per spec: suppression makes new top-level requests behave as if the
/// task held nothing, without actually releasing anything.
pub(crate) fn current_parent(lock_id: LockInstanceId) -> Option<u64> {
    if is_suppressed() {
        return None;
    }
    STACK.with(|s| {
        s.borrow()
            .iter()
            .rev()
            .find(|e| e.lock_id == lock_id)
            .map(|e| e.awaiter)
    })
}

/// Returns `true` if the ambient stack (ignoring suppression) contains `awaiter` for `lock_id` —
/// used by `is_read_lock_held`-style queries, which must answer `false` under suppression even
/// though the Awaiter is technically still held.
pub(crate) fn contains(lock_id: LockInstanceId, awaiter: u64) -> bool {
    if is_suppressed() {
        return false;
    }
    STACK.with(|s| {
        s.borrow()
            .iter()
            .any(|e| e.lock_id == lock_id && e.awaiter == awaiter)
    })
}

/// Invokes `f` for every Awaiter the current task holds on `lock_id`, innermost first. Yields
/// nothing while suppressed — matching `contains`/`current_parent`.
pub(crate) fn for_each_held(lock_id: LockInstanceId, mut f: impl FnMut(u64)) {
    if is_suppressed() {
        return;
    }
    STACK.with(|s| {
        for entry in s.borrow().iter().rev() {
            if entry.lock_id == lock_id {
                f(entry.awaiter);
            }
        }
    });
}

/// A one-shot handle produced by [`crate::AsyncRwLock::hide_locks`].
///
/// While alive it masks the ambient stack for the *entire current task*, across every lock the
/// task touches — matching the "global suppression frame" semantics of spec.md §4.1. Suppression
/// frames are reference-counted, not strictly nested: they may be released in any order, and the
/// underlying Awaiters remain held (suppression never releases a lock, it only hides it).
#[must_use = "dropping this guard immediately ends the suppression scope"]
pub struct HideLocksGuard {
    // Not `Send`: the suppression depth is thread-local, so the guard must be dropped on the
    // thread that created it.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl HideLocksGuard {
    pub(crate) fn enter() -> Self {
        SUPPRESSION_DEPTH.with(|d| *d.borrow_mut() += 1);
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for HideLocksGuard {
    fn drop(&mut self) {
        SUPPRESSION_DEPTH.with(|d| {
            let mut depth = d.borrow_mut();
            *depth = depth.saturating_sub(1);
        });
    }
}

/// A snapshot of one task's ambient lock stack and suppression depth, taken at spawn time.
///
/// Child tasks see a *copy* of the parent's stack: mutating the parent's or child's stack after
/// the snapshot does not cross over.
#[derive(Clone)]
pub struct Snapshot {
    stack: Vec<StackEntry>,
    suppression_depth: u32,
}

/// Captures the current task's ambient stack, for handing to a spawned child task (or to
/// [`propagate`]).
pub fn snapshot() -> Snapshot {
    Snapshot {
        stack: STACK.with(|s| s.borrow().clone()),
        suppression_depth: SUPPRESSION_DEPTH.with(|d| *d.borrow()),
    }
}

/// Installs `snapshot` as the current task's ambient stack for the duration of this guard,
/// restoring whatever was previously installed when dropped.
struct Scope {
    previous_stack: Vec<StackEntry>,
    previous_suppression: u32,
}

impl Scope {
    fn enter(snapshot: &Snapshot) -> Self {
        let previous_stack = STACK.with(|s| s.replace(snapshot.stack.clone()));
        let previous_suppression =
            SUPPRESSION_DEPTH.with(|d| d.replace(snapshot.suppression_depth));
        Self {
            previous_stack,
            previous_suppression,
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        STACK.with(|s| *s.borrow_mut() = std::mem::take(&mut self.previous_stack));
        SUPPRESSION_DEPTH.with(|d| *d.borrow_mut() = self.previous_suppression);
    }
}

/// Wraps `future` so that `snapshot`'s ambient stack is installed for the duration of every poll,
/// regardless of which thread performs that poll.
///
/// Use this around a child task's future when spawning onto a runtime that may resume the task on
/// a different worker thread than the one that spawned it — the common case with work-stealing
/// multi-threaded executors:
///
/// ```ignore
/// let snap = arwl::ambient::snapshot();
/// tokio::spawn(arwl::ambient::propagate(snap, async move {
///     // sees the parent's held Awaiters as ancestors for nested requests
/// }));
/// ```
pub fn propagate<F: Future>(snapshot: Snapshot, future: F) -> Propagated<F> {
    Propagated { snapshot, future }
}

/// Future returned by [`propagate`].
pub struct Propagated<F> {
    snapshot: Snapshot,
    future: F,
}

impl<F: Future> Future for Propagated<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: we only ever project `future` through a `Pin<&mut F>` obtained from the
        // original `Pin<&mut Self>`, never moving it; `snapshot` is plain data accessed by value.
        let this = unsafe { self.get_unchecked_mut() };
        let _scope = Scope::enter(&this.snapshot);
        let future = unsafe { Pin::new_unchecked(&mut this.future) };
        future.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_parent_is_topmost_matching_lock() {
        let lock_a = next_lock_instance_id();
        let lock_b = next_lock_instance_id();
        assert_eq!(current_parent(lock_a), None);

        push(lock_a, 1);
        push(lock_b, 100);
        push(lock_a, 2);

        assert_eq!(current_parent(lock_a), Some(2));
        assert_eq!(current_parent(lock_b), Some(100));

        pop(lock_a, 2);
        assert_eq!(current_parent(lock_a), Some(1));

        pop(lock_a, 1);
        pop(lock_b, 100);
        assert_eq!(current_parent(lock_a), None);
        assert_eq!(current_parent(lock_b), None);
    }

    #[test]
    fn suppression_hides_ancestors_and_is_refcounted() {
        let lock_id = next_lock_instance_id();
        push(lock_id, 7);
        assert_eq!(current_parent(lock_id), Some(7));
        assert!(contains(lock_id, 7));

        let g1 = HideLocksGuard::enter();
        let g2 = HideLocksGuard::enter();
        assert_eq!(current_parent(lock_id), None);
        assert!(!contains(lock_id, 7));

        drop(g1);
        assert_eq!(current_parent(lock_id), None, "still suppressed by g2");

        drop(g2);
        assert_eq!(current_parent(lock_id), Some(7));

        pop(lock_id, 7);
    }

    #[test]
    fn snapshot_is_a_copy_not_shared() {
        let lock_id = next_lock_instance_id();
        push(lock_id, 42);
        let snap = snapshot();
        pop(lock_id, 42);
        assert_eq!(current_parent(lock_id), None);

        {
            let _scope = Scope::enter(&snap);
            assert_eq!(current_parent(lock_id), Some(42));
            push(lock_id, 43);
            assert_eq!(current_parent(lock_id), Some(43));
        }
        // mutation inside the scope does not leak back out.
        assert_eq!(current_parent(lock_id), None);
    }
}
