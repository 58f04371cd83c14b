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

//! The write-lock release pipeline: draining `on_before_write_lock_released` callbacks while the
//! write is still observably held, and the sticky-write deferral that hands that drain off to the
//! owning upgradeable-read instead.
//!
//! Callbacks are popped one at a time from the live chain, under the private mutex, rather than
//! snapshotted up front — a callback that registers another callback while running appends to the
//! same [`VecDeque`] this loop is still draining, so it runs in the same pass
//! (`OnBeforeWriteLockReleasedNestedCallbacks`), with no separate "next pass" bookkeeping needed.

use std::future::Future;
use std::pin::Pin;

use crate::ambient;
use crate::core::LockCore;
use crate::core::admission;
use crate::error::CallbackError;
use crate::error::LockError;
use crate::flags::LockKind;

/// A registered `on_before_write_lock_released` callback, already boxed and type-erased: the
/// caller's error type is flattened to a `String` (via [`CallbackError`]) at registration time,
/// exactly as `mea` flattens heterogeneous completions elsewhere (see `error.rs`'s doc comment).
pub(crate) type Callback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>> + Send>;

#[derive(Clone, Copy)]
enum ChainTarget {
    Plain,
    UnderUpgradeable,
}

fn pop_next_callback(core: &LockCore, target: ChainTarget) -> Option<Callback> {
    core.with_state(|state| match target {
        ChainTarget::Plain => state.write.as_mut().and_then(|chain| chain.callbacks.pop_front()),
        ChainTarget::UnderUpgradeable => state
            .upgradeable
            .as_mut()
            .and_then(|up| up.write.as_mut())
            .and_then(|chain| chain.callbacks.pop_front()),
    })
}

/// Drains every callback currently queued on `target`, awaiting each in order and appending
/// anything a callback itself registers (it lands on the same queue, so the next `pop_front` sees
/// it). The write lock — and the upgradeable-read that owns it, if any — remains recorded as held
/// in `core`'s state for the whole loop, so `is_write_lock_held`, `lock_stack_contains`, and
/// further `on_before_write_lock_released` registrations all see it as still active.
async fn drain(core: &LockCore, target: ChainTarget) -> Vec<CallbackError> {
    let mut errors = Vec::new();
    while let Some(callback) = pop_next_callback(core, target) {
        if let Err(err) = callback().await {
            errors.push(err);
        }
    }
    errors
}

fn finish(core: &LockCore, id: u64, errors: Vec<CallbackError>) -> Result<(), LockError> {
    ambient::pop(core.lock_id(), id);
    core.maybe_signal_completion();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LockError::Aggregate(errors))
    }
}

impl LockCore {
    /// Registers `cb` against whichever write lock the *current task* holds, per its ambient
    /// stack (respecting [`crate::AsyncRwLock::hide_locks`] suppression) — not necessarily the
    /// write of whichever guard this was called through, matching spec.md §4.6: legal whenever a
    /// write lock is held by the caller's ambient, including one made logically active by a
    /// sticky upgradeable-read even after the nested write guard that created it has itself
    /// already released (`OnBeforeWriteLockReleasedWithStickyUpgradedWrite`).
    pub(crate) fn register_callback(&self, cb: Callback) -> Result<(), LockError> {
        let lock_id = self.lock_id();
        let mut target = None;
        ambient::for_each_held(lock_id, |id| {
            if target.is_some() {
                return;
            }
            target = self.with_state(|state| {
                if let Some(chain) = &state.write {
                    if chain.holders.contains(&id) {
                        return Some(ChainTarget::Plain);
                    }
                }
                if let Some(up) = &state.upgradeable {
                    let owns_active_write = up.write.is_some() && (up.hold_ids.contains(&id) || up.write.as_ref().is_some_and(|c| c.holders.contains(&id)));
                    if owns_active_write {
                        return Some(ChainTarget::UnderUpgradeable);
                    }
                }
                None
            });
        });
        let Some(target) = target else {
            return Err(LockError::InvalidOperation(
                "on_before_write_lock_released requires a write lock held by the current task",
            ));
        };
        self.with_state(|state| {
            match target {
                ChainTarget::Plain => state
                    .write
                    .as_mut()
                    .expect("target was determined under this same mutex discipline")
                    .callbacks
                    .push_back(cb),
                ChainTarget::UnderUpgradeable => state
                    .upgradeable
                    .as_mut()
                    .and_then(|up| up.write.as_mut())
                    .expect("target was determined under this same mutex discipline")
                    .callbacks
                    .push_back(cb),
            }
            Ok(())
        })
    }

    /// Releases a write Awaiter. A no-op (idempotent) if `id` is not currently held. When this is
    /// the last holder of its chain the release pipeline drains that chain's callbacks before the
    /// write bit clears and admission re-runs — unless the chain lives under a `StickyWrite`
    /// upgradeable-read, in which case the chain (and its callbacks) stay recorded as logically
    /// active until that upgradeable-read itself releases (`release_upgradeable`).
    pub(crate) async fn release_write(&self, id: u64) -> Result<(), LockError> {
        enum Step {
            NotFound,
            Simple,
            Drain(ChainTarget),
        }

        let step = self.with_state(|state| {
            if let Some(chain) = &mut state.write {
                if chain.holders.remove(&id) {
                    state.outstanding -= 1;
                    return if chain.holders.is_empty() { Step::Drain(ChainTarget::Plain) } else { Step::Simple };
                }
            }
            if let Some(up) = &mut state.upgradeable {
                if let Some(chain) = &mut up.write {
                    if chain.holders.remove(&id) {
                        state.outstanding -= 1;
                        if !chain.holders.is_empty() {
                            return Step::Simple;
                        }
                        if chain.sticky {
                            // Logically still active: stays on `up.write` with empty holders
                            // until the upgradeable-read itself releases.
                            return Step::Simple;
                        }
                        return Step::Drain(ChainTarget::UnderUpgradeable);
                    }
                }
            }
            Step::NotFound
        });

        match step {
            Step::NotFound => Ok(()),
            Step::Simple => {
                ambient::pop(self.lock_id(), id);
                self.maybe_signal_completion();
                Ok(())
            }
            Step::Drain(target) => {
                let errors = drain(self, target).await;
                let wakes = self.with_state(|state| {
                    match target {
                        ChainTarget::Plain => state.write = None,
                        ChainTarget::UnderUpgradeable => {
                            if let Some(up) = &mut state.upgradeable {
                                up.write = None;
                            }
                        }
                    }
                    admission::run_admission(state)
                });
                for signal in wakes {
                    signal.set();
                }
                finish(self, id, errors)
            }
        }
    }

    /// Releases an upgradeable-read Awaiter. If other reacquisitions of the same upgradeable-read
    /// chain (see [`super::UpgradeableHold::hold_ids`]) are still held, this just removes `id`
    /// from the chain. Only when the chain's last holder releases does it actually finalize: if a
    /// sticky nested write is still logically active, its deferred callbacks drain now, before the
    /// upgradeable-read — and the write it was carrying — are considered fully released.
    ///
    /// Fails with [`LockError::InvalidOperation`], without changing any state, if a nested write
    /// guard under this upgradeable-read is still literally held — dropping guards out of nesting
    /// order is legal Rust, but finalizing the upgradeable-read here would discard that write's
    /// `WriteChain` (and its holder id) out from under the still-live guard, leaving `outstanding`
    /// forever above zero and the ambient stack permanently reporting a write no code can reach
    /// anymore. The caller must release the nested write first.
    pub(crate) async fn release_upgradeable(&self, id: u64) -> Result<(), LockError> {
        if self.release_upgradeable_nested(id) {
            return Ok(());
        }

        enum Step {
            NotFound,
            StillNested,
            Simple,
            Drain,
        }

        let step = self.with_state(|state| {
            let Some(up) = &state.upgradeable else {
                return Step::NotFound;
            };
            if !up.hold_ids.contains(&id) {
                return Step::NotFound;
            }
            if up.write.as_ref().is_some_and(|chain| !chain.holders.is_empty()) {
                return Step::StillNested;
            }
            let up = state.upgradeable.as_mut().expect("checked above");
            up.hold_ids.remove(&id);
            state.outstanding -= 1;
            if up.write.is_some() { Step::Drain } else { Step::Simple }
        });

        match step {
            Step::NotFound => Ok(()),
            Step::StillNested => Err(LockError::InvalidOperation(
                "cannot release an upgradeable-read while a nested write lock under it is still held",
            )),
            Step::Simple => {
                let wakes = self.with_state(|state| {
                    state.upgradeable = None;
                    admission::run_admission(state)
                });
                for signal in wakes {
                    signal.set();
                }
                ambient::pop(self.lock_id(), id);
                self.maybe_signal_completion();
                Ok(())
            }
            Step::Drain => {
                let errors = drain(self, ChainTarget::UnderUpgradeable).await;
                let wakes = self.with_state(|state| {
                    state.upgradeable = None;
                    admission::run_admission(state)
                });
                for signal in wakes {
                    signal.set();
                }
                finish(self, id, errors)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::flags::LockFlags;

    fn boxed_ok() -> Callback {
        Box::new(|| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn plain_write_release_drains_callbacks_before_admission() {
        let core = LockCore::new();
        let w = pollster::block_on(core.request(LockKind::Write, LockFlags::NONE, None)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        core.register_callback(Box::new(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();
        pollster::block_on(core.release_write(w.id)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_release_is_a_no_op() {
        let core = LockCore::new();
        let w = pollster::block_on(core.request(LockKind::Write, LockFlags::NONE, None)).unwrap();
        pollster::block_on(core.release_write(w.id)).unwrap();
        pollster::block_on(core.release_write(w.id)).unwrap();
        let w2 = pollster::block_on(core.request(LockKind::Write, LockFlags::NONE, None)).unwrap();
        assert_ne!(w2.id, w.id);
        pollster::block_on(core.release_write(w2.id)).unwrap();
    }

    #[test]
    fn callback_registration_without_write_lock_fails() {
        let core = LockCore::new();
        let err = core.register_callback(boxed_ok()).unwrap_err();
        assert!(matches!(err, LockError::InvalidOperation(_)));
    }

    #[test]
    fn release_upgradeable_rejects_release_while_its_nested_write_is_still_held() {
        let core = LockCore::new();
        let ur = pollster::block_on(core.request(LockKind::UpgradeableRead, LockFlags::NONE, None)).unwrap();
        let w = pollster::block_on(core.request(LockKind::Write, LockFlags::NONE, None)).unwrap();

        let err = pollster::block_on(core.release_upgradeable(ur.id)).unwrap_err();
        assert!(matches!(err, LockError::InvalidOperation(_)));
        assert_eq!(core.debug_outstanding(), 2);

        pollster::block_on(core.release_write(w.id)).unwrap();
        pollster::block_on(core.release_upgradeable(ur.id)).unwrap();
        assert_eq!(core.debug_outstanding(), 0);
    }
}
