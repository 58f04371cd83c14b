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

//! The three per-kind FIFOs of not-yet-admitted requests.
//!
//! A request that can fast-admit (because it is nested under an Awaiter the requesting task
//! already holds) never passes through here — see `core::admission`. Everything else waits in
//! one of these queues in arrival order until the admission policy says it may proceed, or until
//! its [`crate::CancellationToken`] fires and it is pulled back out.

use std::collections::VecDeque;

use crate::flags::LockFlags;
use crate::flags::LockKind;

/// A request sitting in a [`RequestQueue`], waiting to be admitted.
pub(crate) struct PendingRequest {
    pub(crate) id: u64,
    pub(crate) kind: LockKind,
    pub(crate) flags: LockFlags,
    /// The ambient Awaiter this request is nested under, if any — `None` for a top-level
    /// request. A nested request that could not fast-admit still remembers its parent so the
    /// admission policy can let it jump the line ahead of unrelated top-level requests of the
    /// same kind.
    pub(crate) parent: Option<u64>,
}

/// The three FIFOs of pending requests, one per [`LockKind`].
#[derive(Default)]
pub(crate) struct RequestQueue {
    read: VecDeque<PendingRequest>,
    upgradeable: VecDeque<PendingRequest>,
    write: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            read: VecDeque::new(),
            upgradeable: VecDeque::new(),
            write: VecDeque::new(),
        }
    }

    fn queue_for(&self, kind: LockKind) -> &VecDeque<PendingRequest> {
        match kind {
            LockKind::Read => &self.read,
            LockKind::UpgradeableRead => &self.upgradeable,
            LockKind::Write => &self.write,
        }
    }

    fn queue_for_mut(&mut self, kind: LockKind) -> &mut VecDeque<PendingRequest> {
        match kind {
            LockKind::Read => &mut self.read,
            LockKind::UpgradeableRead => &mut self.upgradeable,
            LockKind::Write => &mut self.write,
        }
    }

    /// Enqueues `request` at the back of its kind's FIFO.
    ///
    /// A nested request (`request.parent.is_some()`) is inserted ahead of every top-level
    /// request of the same kind already queued, but behind any earlier-queued nested request —
    /// preserving arrival order within the "nested" and "top-level" sub-groups.
    pub(crate) fn push(&mut self, request: PendingRequest) {
        let nested = request.parent.is_some();
        let queue = self.queue_for_mut(request.kind);
        if nested {
            let split = queue.iter().take_while(|r| r.parent.is_some()).count();
            queue.insert(split, request);
        } else {
            queue.push_back(request);
        }
    }

    /// The request at the head of `kind`'s FIFO, if any.
    pub(crate) fn front(&self, kind: LockKind) -> Option<&PendingRequest> {
        self.queue_for(kind).front()
    }

    /// Removes and returns the request at the head of `kind`'s FIFO.
    pub(crate) fn pop_front(&mut self, kind: LockKind) -> Option<PendingRequest> {
        self.queue_for_mut(kind).pop_front()
    }

    /// `true` if `kind`'s FIFO has no pending requests.
    pub(crate) fn is_empty(&self, kind: LockKind) -> bool {
        self.queue_for(kind).is_empty()
    }

    /// Removes the request with the given `id` from whichever FIFO it is in, wherever it sits —
    /// used by cancellation, which does not know (or care) about queue position.
    pub(crate) fn remove(&mut self, id: u64) -> Option<PendingRequest> {
        for kind in [LockKind::Read, LockKind::UpgradeableRead, LockKind::Write] {
            let queue = self.queue_for_mut(kind);
            if let Some(pos) = queue.iter().position(|r| r.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }
}
