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

//! The admission policy: given the current [`State`] and a candidate [`Awaiter`], decide whether
//! that Awaiter may be granted right now.
//!
//! Every rule here — fast-admission of a nested request and head-of-queue admission of a
//! top-level one — reduces to the same question: "is every currently held Awaiter that this
//! request would conflict with actually an ancestor of the request?" A top-level request has no
//! ancestors, so any conflicting holder blocks it; a nested request's ancestors are exactly the
//! Awaiters it may safely ignore. This single predicate, applied per lock kind, is what lets one
//! admission pass serve both the queue-head case (spec.md §4.4 rules 3-5) and the fast-path nested
//! case (rule 2) without separate code paths.

use std::sync::Arc;

use crate::core::Awaiter;
use crate::core::State;
use crate::flags::LockKind;
use crate::internal::signal::Signal;

/// `true` if `candidate` is `awaiter` itself or sits on `awaiter`'s ancestor chain.
pub(crate) fn is_ancestor_or_self(state: &State, candidate: u64, awaiter: &Awaiter) -> bool {
    if candidate == awaiter.id {
        return true;
    }
    let mut cursor = awaiter.parent;
    while let Some(id) = cursor {
        if id == candidate {
            return true;
        }
        cursor = state.all.get(&id).and_then(|a| a.parent);
    }
    false
}

fn holders_are_all_ancestors(state: &State, holders: &std::collections::HashSet<u64>, awaiter: &Awaiter) -> bool {
    holders.iter().all(|h| is_ancestor_or_self(state, *h, awaiter))
}

/// Rule 5: a write is admitted only when no read, upgradeable-read, or write is held by anyone
/// outside the requester's own ancestor chain. Applied verbatim to a top-level request (which has
/// no ancestors, so any unrelated holder blocks it) and to a nested request (rule 2c), which is
/// exactly how `UpgradeableReaderWaitsForExistingReadersToExit` ends up waiting: a reader nested
/// under the same upgradeable-read is not on *this* write's ancestor chain unless the write's
/// direct parent is that reader.
pub(crate) fn can_admit_write(state: &State, awaiter: &Awaiter) -> bool {
    if !holders_are_all_ancestors(state, &state.read_holders, awaiter) {
        return false;
    }
    if let Some(up) = &state.upgradeable {
        if !holders_are_all_ancestors(state, &up.hold_ids, awaiter) {
            return false;
        }
        if let Some(chain) = &up.write {
            if !holders_are_all_ancestors(state, &chain.holders, awaiter) {
                return false;
            }
        }
    }
    if let Some(chain) = &state.write {
        if !holders_are_all_ancestors(state, &chain.holders, awaiter) {
            return false;
        }
    }
    true
}

/// Rule 4 (top-level) / rule 2 (nested): admitted when no write is held outside the ancestor
/// chain and no upgradeable-read is held outside the ancestor chain. Reads never block an
/// upgradeable-read.
pub(crate) fn can_admit_upgradeable(state: &State, awaiter: &Awaiter) -> bool {
    if let Some(up) = &state.upgradeable {
        if !holders_are_all_ancestors(state, &up.hold_ids, awaiter) {
            return false;
        }
        if let Some(chain) = &up.write {
            if !holders_are_all_ancestors(state, &chain.holders, awaiter) {
                return false;
            }
        }
    }
    if let Some(chain) = &state.write {
        if !holders_are_all_ancestors(state, &chain.holders, awaiter) {
            return false;
        }
    }
    true
}

/// Rule 5 (top-level) / rule 2 (nested): admitted when no write is held outside the ancestor
/// chain. A top-level read additionally waits behind a non-empty write queue so writers are not
/// starved; a nested read (one whose parent is already held) always skips that check.
pub(crate) fn can_admit_read(state: &State, awaiter: &Awaiter) -> bool {
    if let Some(up) = &state.upgradeable {
        if let Some(chain) = &up.write {
            if !holders_are_all_ancestors(state, &chain.holders, awaiter) {
                return false;
            }
        }
    }
    if let Some(chain) = &state.write {
        if !holders_are_all_ancestors(state, &chain.holders, awaiter) {
            return false;
        }
    }
    if awaiter.parent.is_none() && !state.queue.is_empty(LockKind::Write) {
        return false;
    }
    true
}

pub(crate) fn can_admit(state: &State, awaiter: &Awaiter) -> bool {
    match awaiter.kind {
        LockKind::Read => can_admit_read(state, awaiter),
        LockKind::UpgradeableRead => can_admit_upgradeable(state, awaiter),
        LockKind::Write => can_admit_write(state, awaiter),
    }
}

/// Repeatedly scans the three queues (writers first, so a drain doesn't let a burst of readers
/// starve a waiting writer further — see spec.md §4.4's tie-breaking note) admitting every request
/// that has become admissible, until a full pass makes no further progress.
///
/// Returns the [`Signal`]s of every request granted this call, to be `set()` by the caller once
/// the private mutex is released — nothing here wakes anything while `state` is locked.
pub(crate) fn run_admission(state: &mut State) -> Vec<Arc<Signal>> {
    let mut wakes = Vec::new();
    loop {
        let mut progressed = false;
        for kind in [LockKind::Write, LockKind::UpgradeableRead, LockKind::Read] {
            loop {
                let Some(front) = state.queue.front(kind) else {
                    break;
                };
                let awaiter = Awaiter {
                    id: front.id,
                    kind: front.kind,
                    flags: front.flags,
                    parent: front.parent,
                };
                if !can_admit(state, &awaiter) {
                    break;
                }
                let request = state.queue.pop_front(kind).expect("front just matched");
                state.grant(awaiter);
                if let Some(signal) = state.pending_signals.remove(&request.id) {
                    state.outcomes.insert(request.id, crate::core::Outcome::Granted(awaiter));
                    wakes.push(signal);
                }
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    wakes
}
