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

//! The private-mutex state machine behind [`crate::AsyncRwLock`].
//!
//! Everything in this module runs under [`Shared::mutex`], a small synchronous lock (see
//! `internal::lock`): state transitions — recording a new request, granting it, recording a
//! release — happen there, and nothing that awaits or wakes a task ever runs while it is held.
//! Waking a granted request's waiter, and running `on_before_write_lock_released` callbacks, both
//! happen strictly after the mutex is dropped (`release` in `core::release`), which is what keeps
//! a release from deadlocking against a task that re-enters this lock from inside a callback
//! (`CompletionContinuationsDoNotDeadlockWithLockClass`).

mod admission;
mod release;

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use crate::ambient;
use crate::ambient::LockInstanceId;
use crate::cancellation::CancellationRegistration;
use crate::cancellation::CancellationToken;
use crate::error::LockError;
use crate::flags::LockFlags;
use crate::flags::LockKind;
use crate::internal::lock::Mutex as PrivateMutex;
use crate::internal::queue::PendingRequest;
use crate::internal::queue::RequestQueue;
use crate::internal::signal::Signal;

pub(crate) use release::Callback;

/// The identity of one issued or pending lock request. `Copy` because it is small and because
/// admission needs to read it freely while also mutating the state it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Awaiter {
    pub(crate) id: u64,
    pub(crate) kind: LockKind,
    pub(crate) flags: LockFlags,
    /// The nearest enclosing held Awaiter on the requester's ambient stack at the moment this
    /// request was made, or `None` for a top-level request. Fixed for the Awaiter's lifetime.
    pub(crate) parent: Option<u64>,
}

/// A chain of Awaiters sharing one exclusive write hold: the first writer to acquire it and every
/// write nested underneath (directly, or via an upgradeable-read ancestor). `sticky` is set when
/// this chain lives under an upgradeable-read requested with [`LockFlags::STICKY_WRITE`] — see
/// [`release::release_write`] for what that changes about when the chain actually drains.
struct WriteChain {
    holders: HashSet<u64>,
    sticky: bool,
    callbacks: VecDeque<Callback>,
}

/// The currently held upgradeable-read, if any. At most one may be directly held at a time
/// (invariant 2); `hold_ids` also covers any further upgradeable-read requests nested under it
/// (e.g. the repeated `U`/`S` steps in a `"SUSU..."` lock script), which share its visibility
/// without being separate admission decisions.
struct UpgradeableHold {
    hold_ids: HashSet<u64>,
    sticky: bool,
    write: Option<WriteChain>,
}

pub(crate) enum Outcome {
    Granted(Awaiter),
    Failed(LockError),
}

pub(crate) struct State {
    next_id: u64,
    completing: bool,
    outstanding: u64,
    /// Every Awaiter currently alive (pending or held), keyed by id, so ancestor chains can be
    /// walked regardless of where in the three queues (or holder sets) an ancestor currently
    /// sits. Entries are never removed: a released Awaiter may still be another live Awaiter's
    /// ancestor-chain link.
    all: HashMap<u64, Awaiter>,
    read_holders: HashSet<u64>,
    upgradeable: Option<UpgradeableHold>,
    write: Option<WriteChain>,
    queue: RequestQueue,
    pending_signals: HashMap<u64, Arc<Signal>>,
    outcomes: HashMap<u64, Outcome>,
}

impl State {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// `true` if the ancestor chain starting at `parent` passes through a Write or
    /// UpgradeableRead Awaiter anywhere along the way. A nested write or upgradeable-read whose
    /// entire ancestor chain is plain reads has nothing to attach its exclusivity to — it would
    /// be escalating a bare read lock, which this core rejects outright rather than queuing it
    /// forever (spec.md §8 S6, `"RW"`/`"RU"`/`"RS"`).
    fn nested_escalation_has_anchor(&self, parent: u64) -> bool {
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            let Some(a) = self.all.get(&id) else {
                return false;
            };
            if a.kind != LockKind::Read {
                return true;
            }
            cursor = a.parent;
        }
        false
    }

    /// `true` if `awaiter`'s ancestor chain passes through the currently held upgradeable-read
    /// (directly or via one of its nested reacquisitions) — i.e. a write requested from inside
    /// that upgradeable-read, which shares its chain rather than starting a new top-level one.
    fn write_nests_under_upgradeable(&self, awaiter: &Awaiter) -> bool {
        match &self.upgradeable {
            Some(up) => up
                .hold_ids
                .iter()
                .any(|id| admission::is_ancestor_or_self(self, *id, awaiter)),
            None => false,
        }
    }

    /// Records `awaiter` as held. Called only once admission has already approved it (either the
    /// fast nested path or a queue-head grant in [`admission::run_admission`]).
    fn grant(&mut self, awaiter: Awaiter) {
        match awaiter.kind {
            LockKind::Read => {
                self.read_holders.insert(awaiter.id);
            }
            LockKind::UpgradeableRead => match &mut self.upgradeable {
                Some(hold) => {
                    hold.hold_ids.insert(awaiter.id);
                }
                None => {
                    self.upgradeable = Some(UpgradeableHold {
                        hold_ids: HashSet::from([awaiter.id]),
                        sticky: awaiter.flags.contains(LockFlags::STICKY_WRITE),
                        write: None,
                    });
                }
            },
            LockKind::Write => {
                if self.write_nests_under_upgradeable(&awaiter) {
                    let up = self.upgradeable.as_mut().expect("checked above");
                    let sticky = up.sticky;
                    match &mut up.write {
                        Some(chain) => {
                            chain.holders.insert(awaiter.id);
                        }
                        None => {
                            up.write = Some(WriteChain {
                                holders: HashSet::from([awaiter.id]),
                                sticky,
                                callbacks: VecDeque::new(),
                            });
                        }
                    }
                } else {
                    match &mut self.write {
                        Some(chain) => {
                            chain.holders.insert(awaiter.id);
                        }
                        None => {
                            self.write = Some(WriteChain {
                                holders: HashSet::from([awaiter.id]),
                                sticky: false,
                                callbacks: VecDeque::new(),
                            });
                        }
                    }
                }
            }
        }
    }
}

struct Shared {
    lock_id: LockInstanceId,
    mutex: PrivateMutex<State>,
    completion_signal: Signal,
}

/// Handle onto the lock's private state machine. Cheap to clone (an `Arc` underneath) — cloned
/// into the 'static closures that cancellation and the public facade both need (a cancellation
/// callback must be able to reach back into the core long after the `request` call that
/// registered it has returned its future to the caller).
#[derive(Clone)]
pub(crate) struct LockCore {
    shared: Arc<Shared>,
}

impl LockCore {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                lock_id: ambient::next_lock_instance_id(),
                mutex: PrivateMutex::new(State {
                    next_id: 0,
                    completing: false,
                    outstanding: 0,
                    all: HashMap::new(),
                    read_holders: HashSet::new(),
                    upgradeable: None,
                    write: None,
                    queue: RequestQueue::new(),
                    pending_signals: HashMap::new(),
                    outcomes: HashMap::new(),
                }),
                completion_signal: Signal::new(),
            }),
        }
    }

    pub(crate) fn lock_id(&self) -> LockInstanceId {
        self.shared.lock_id
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        self.shared.mutex.with(f)
    }

    /// Entry point for `read_lock_async` / `upgradeable_read_lock_async` / `write_lock_async`.
    /// Never fails synchronously (spec.md §7): a pre-canceled token or a post-`complete`
    /// top-level request both resolve through the returned future, on first poll.
    pub(crate) fn request(&self, kind: LockKind, flags: LockFlags, token: Option<CancellationToken>) -> RequestFuture {
        let lock_id = self.shared.lock_id;

        if let Some(token) = &token {
            if token.is_cancelled() {
                return RequestFuture::ready(lock_id, Err(LockError::Canceled));
            }
        }

        let parent = ambient::current_parent(lock_id);

        enum Decision {
            Immediate(Result<Awaiter, LockError>),
            Pending(u64, Arc<Signal>),
        }

        let decision = self.with_state(|state| {
            if parent.is_none() && state.completing {
                return Decision::Immediate(Err(LockError::LockCompleted));
            }
            if matches!(kind, LockKind::Write | LockKind::UpgradeableRead) {
                if let Some(p) = parent {
                    if !state.nested_escalation_has_anchor(p) {
                        return Decision::Immediate(Err(LockError::InvalidOperation(
                            "cannot escalate a read lock directly; acquire an upgradeable read instead",
                        )));
                    }
                }
            }
            let id = state.alloc_id();
            let awaiter = Awaiter { id, kind, flags, parent };
            state.all.insert(id, awaiter);
            state.outstanding += 1;
            if admission::can_admit(state, &awaiter) {
                state.grant(awaiter);
                Decision::Immediate(Ok(awaiter))
            } else {
                let signal = Arc::new(Signal::new());
                state.queue.push(PendingRequest { id, kind, flags, parent });
                state.pending_signals.insert(id, signal.clone());
                Decision::Pending(id, signal)
            }
        });

        match decision {
            Decision::Immediate(result) => RequestFuture::ready(lock_id, result),
            Decision::Pending(id, signal) => {
                let cancel_guard = token.map(|token| {
                    let core = self.clone();
                    token.on_cancelled(move || core.cancel_pending(id))
                });
                RequestFuture::pending(self.clone(), lock_id, id, signal, cancel_guard)
            }
        }
    }

    fn take_outcome(&self, id: u64) -> Result<Awaiter, LockError> {
        self.with_state(|state| match state.outcomes.remove(&id) {
            Some(Outcome::Granted(awaiter)) => Ok(awaiter),
            Some(Outcome::Failed(err)) => Err(err),
            None => unreachable!("signal fired without a recorded outcome for request {id}"),
        })
    }

    /// Invoked from the cancellation token's `on_cancelled` callback, at most once. A no-op if the
    /// request has already left the queue (granted, or already canceled) — cancellation never
    /// revokes a held lock.
    fn cancel_pending(&self, id: u64) {
        let signal = self.with_state(|state| {
            let removed = state.queue.remove(id);
            if removed.is_none() {
                return None;
            }
            state.outstanding -= 1;
            state.outcomes.insert(id, Outcome::Failed(LockError::Canceled));
            state.pending_signals.remove(&id)
        });
        if let Some(signal) = signal {
            signal.set();
        }
        self.maybe_signal_completion();
    }

    pub(crate) fn release_read(&self, id: u64) {
        let wakes = self.with_state(|state| {
            if !state.read_holders.remove(&id) {
                return Vec::new();
            }
            state.outstanding -= 1;
            admission::run_admission(state)
        });
        ambient::pop(self.shared.lock_id, id);
        for signal in wakes {
            signal.set();
        }
        self.maybe_signal_completion();
    }

    /// Releases a nested upgradeable-read reacquisition (one where another upgradeable-read in
    /// the same chain is still held). Finalizing the chain itself — which may need to drain
    /// sticky-write callbacks — is [`release::release_upgradeable`].
    fn release_upgradeable_nested(&self, id: u64) -> bool {
        let released = self.with_state(|state| {
            let Some(up) = &mut state.upgradeable else {
                return false;
            };
            if !up.hold_ids.contains(&id) {
                // Not a member: either a double release, or `id` is the chain's last holder and
                // `release::release_upgradeable` has already claimed finalizing it — either way,
                // not this function's job.
                return false;
            }
            if up.hold_ids.len() == 1 {
                // Last holder: defer to `release::release_upgradeable`'s finalize path, which may
                // need to drain a sticky write's callbacks before the chain is actually gone.
                return false;
            }
            up.hold_ids.remove(&id);
            state.outstanding -= 1;
            true
        });
        if released {
            ambient::pop(self.shared.lock_id, id);
            self.maybe_signal_completion();
        }
        released
    }

    pub(crate) fn complete(&self) {
        let wakes = self.with_state(|state| {
            state.completing = true;
            admission::run_admission(state)
        });
        for signal in wakes {
            signal.set();
        }
        self.maybe_signal_completion();
    }

    pub(crate) fn completion(&self) -> impl Future<Output = ()> + '_ {
        self.shared.completion_signal.wait()
    }

    /// `true` if the current task's ambient stack holds an Awaiter of `kind` on this lock — or,
    /// for [`LockKind::Write`], if the task holds the upgradeable-read whose sticky nested write
    /// is still logically active even though its last nested write guard has already released.
    pub(crate) fn is_kind_held(&self, kind: LockKind) -> bool {
        let lock_id = self.shared.lock_id;
        let mut held = false;
        ambient::for_each_held(lock_id, |id| {
            if held {
                return;
            }
            held = self.with_state(|state| {
                if state.all.get(&id).is_some_and(|a| a.kind == kind) {
                    return true;
                }
                if kind != LockKind::Write {
                    return false;
                }
                let Some(up) = &state.upgradeable else {
                    return false;
                };
                if !up.hold_ids.contains(&id) {
                    return false;
                }
                up.write.as_ref().is_some_and(|chain| chain.sticky)
            });
        });
        held
    }

    pub(crate) fn lock_stack_contains(&self, flags: LockFlags) -> bool {
        let lock_id = self.shared.lock_id;
        let mut result = false;
        ambient::for_each_held(lock_id, |id| {
            if result {
                return;
            }
            result = self.with_state(|state| state.all.get(&id).is_some_and(|a| a.flags.contains(flags)));
        });
        result
    }

    fn maybe_signal_completion(&self) {
        let ready = self.with_state(|state| state.completing && state.outstanding == 0);
        if ready {
            self.shared.completion_signal.set();
        }
    }

    #[cfg(test)]
    pub(crate) fn debug_outstanding(&self) -> u64 {
        self.with_state(|state| state.outstanding)
    }
}

enum RequestFutureState {
    /// Resolves on first poll — a request admitted synchronously at `request()` time still only
    /// touches ambient state from inside `poll()`, on whichever task actually polls it.
    Ready(LockInstanceId, Option<Result<Awaiter, LockError>>),
    /// Waiting on `signal`; `_cancel_guard` deregisters the cancellation callback if the request
    /// resolves (by grant or failure) before the token ever fires.
    Pending {
        core: LockCore,
        lock_id: LockInstanceId,
        id: u64,
        signal: Arc<Signal>,
        _cancel_guard: Option<CancellationRegistration>,
    },
}

/// Future returned by [`LockCore::request`]. Resolves to the granted [`Awaiter`] — at which point
/// it pushes that Awaiter onto the *polling* task's ambient stack, since that is the only task
/// whose thread-local state it is safe to touch — or to the [`LockError`] the request failed
/// with.
pub(crate) struct RequestFuture {
    state: RequestFutureState,
}

impl RequestFuture {
    fn ready(lock_id: LockInstanceId, result: Result<Awaiter, LockError>) -> Self {
        Self {
            state: RequestFutureState::Ready(lock_id, Some(result)),
        }
    }

    fn pending(
        core: LockCore,
        lock_id: LockInstanceId,
        id: u64,
        signal: Arc<Signal>,
        cancel_guard: Option<CancellationRegistration>,
    ) -> Self {
        Self {
            state: RequestFutureState::Pending {
                core,
                lock_id,
                id,
                signal,
                _cancel_guard: cancel_guard,
            },
        }
    }
}

impl Future for RequestFuture {
    type Output = Result<Awaiter, LockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            RequestFutureState::Ready(lock_id, slot) => {
                let result = slot.take().expect("RequestFuture polled after completion");
                if let Ok(awaiter) = &result {
                    ambient::push(*lock_id, awaiter.id);
                }
                Poll::Ready(result)
            }
            RequestFutureState::Pending { core, lock_id, id, signal, .. } => {
                let mut wait = signal.wait();
                match Pin::new(&mut wait).poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => {
                        let id = *id;
                        let lock_id = *lock_id;
                        let core = core.clone();
                        let outcome = core.take_outcome(id);
                        if let Ok(awaiter) = &outcome {
                            ambient::push(lock_id, awaiter.id);
                        }
                        this.state = RequestFutureState::Ready(lock_id, None);
                        Poll::Ready(outcome)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaiter(id: u64, kind: LockKind, parent: Option<u64>) -> Awaiter {
        Awaiter { id, kind, flags: LockFlags::NONE, parent }
    }

    #[test]
    fn concurrent_readers_admit_immediately() {
        let core = LockCore::new();
        let r1 = pollster::block_on(core.request(LockKind::Read, LockFlags::NONE, None)).unwrap();
        let r2 = pollster::block_on(core.request(LockKind::Read, LockFlags::NONE, None)).unwrap();
        assert_ne!(r1.id, r2.id);
        core.release_read(r1.id);
        core.release_read(r2.id);
        assert_eq!(core.debug_outstanding(), 0);
    }

    #[test]
    fn writer_waits_for_reader() {
        let core = LockCore::new();
        let r = pollster::block_on(core.request(LockKind::Read, LockFlags::NONE, None)).unwrap();
        let mut write_fut = core.request(LockKind::Write, LockFlags::NONE, None);
        let waker = futures_waker_noop();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut write_fut).poll(&mut cx).is_pending());
        core.release_read(r.id);
        let w = pollster::block_on(write_fut).unwrap();
        assert_eq!(w.kind, LockKind::Write);
    }

    #[test]
    fn ancestor_chain_is_followed_through_released_parents() {
        let state = State {
            next_id: 0,
            completing: false,
            outstanding: 0,
            all: HashMap::from([
                (1, awaiter(1, LockKind::UpgradeableRead, None)),
                (2, awaiter(2, LockKind::Write, Some(1))),
            ]),
            read_holders: HashSet::new(),
            upgradeable: None,
            write: None,
            queue: RequestQueue::new(),
            pending_signals: HashMap::new(),
            outcomes: HashMap::new(),
        };
        let grandchild = awaiter(3, LockKind::Read, Some(2));
        assert!(admission::is_ancestor_or_self(&state, 1, &grandchild));
        assert!(admission::is_ancestor_or_self(&state, 2, &grandchild));
        assert!(!admission::is_ancestor_or_self(&state, 99, &grandchild));
    }

    // A tiny no-op waker so synchronous tests can poll a future without a real executor.
    fn futures_waker_noop() -> std::task::Waker {
        use std::task::RawWaker;
        use std::task::RawWakerVTable;
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            raw()
        }
        fn raw() -> RawWaker {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        unsafe { std::task::Waker::from_raw(raw()) }
    }
}
