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

//! A minimal, runtime-agnostic cancellation token.
//!
//! This is deliberately small — just the contract [`crate::core::RequestQueue`] needs (§4.3 of
//! the design notes): a way to observe "already canceled" synchronously, and a way to register a
//! one-shot callback that fires at most once, either immediately (if already canceled) or the
//! first time [`CancellationToken::cancel`] is called.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, Box<dyn FnOnce() + Send>>>,
}

/// A cooperative cancellation signal shared between a requester and the lock it's waiting on.
///
/// Cloning a `CancellationToken` shares the same underlying signal; `cancel` on any clone cancels
/// all of them.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Creates a token that has not yet been canceled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a token that is already canceled.
    pub fn canceled() -> Self {
        let token = Self::new();
        token.cancel();
        token
    }

    /// Returns `true` if [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the token. Idempotent: only the first call runs registered callbacks.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = {
            let mut guard = self.inner.callbacks.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Registers `f` to run the first time this token is canceled, or immediately (inline, on
    /// the calling thread) if it is already canceled.
    ///
    /// Returns a guard that deregisters the callback on drop if it has not fired yet — callers
    /// that no longer care about cancellation (e.g. a request that was just admitted) should
    /// drop the guard promptly.
    pub(crate) fn on_cancelled(&self, f: impl FnOnce() + Send + 'static) -> CancellationRegistration {
        if self.is_cancelled() {
            f();
            return CancellationRegistration { inner: None };
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.inner.callbacks.lock().unwrap_or_else(|p| p.into_inner());
            // Re-check under the lock: `cancel` may have run (and drained the map) between the
            // `is_cancelled` check above and taking this lock.
            if self.is_cancelled() {
                drop(guard);
                f();
                return CancellationRegistration { inner: None };
            }
            guard.insert(id, Box::new(f));
        }
        CancellationRegistration {
            inner: Some((self.inner.clone(), id)),
        }
    }
}

/// Deregisters a [`CancellationToken::on_cancelled`] callback when dropped, unless it has
/// already fired.
pub(crate) struct CancellationRegistration {
    inner: Option<(Arc<Inner>, u64)>,
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        if let Some((inner, id)) = self.inner.take() {
            let mut guard = inner.callbacks.lock().unwrap_or_else(|p| p.into_inner());
            guard.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn fires_once_on_cancel() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _reg = token.on_cancelled(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fires_immediately_if_already_canceled() {
        let token = CancellationToken::canceled();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _reg = token.on_cancelled(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_registration_prevents_later_fire() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let reg = token.on_cancelled(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(reg);
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
