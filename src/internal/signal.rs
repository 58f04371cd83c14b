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

//! A single-resolution wake latch.
//!
//! [`LockCore`](crate::core::LockCore) never wakes a task while its private mutex is held (see
//! the `core` module docs): granting a request records the decision under the lock, then —
//! after the lock is released — fires the signal belonging to that request. [`Signal`] is the
//! primitive that carries that decision across: `set` is always called from a synchronous,
//! non-async context (the unlock continuation), and `wait` is always polled from the requester's
//! task, so the two sides never run on the same stack.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

enum State {
    Pending(Option<Waker>),
    Set,
}

/// A one-shot, multi-waiter-safe latch: `wait()` resolves the first time `set()` is called,
/// including if `set()` already ran before `wait()` was ever polled.
pub(crate) struct Signal {
    state: Mutex<State>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(None)),
        }
    }

    /// Resolves the latch, waking whichever task is currently polling [`Signal::wait`] if any.
    /// Idempotent: calling this more than once after the first has no further effect.
    pub(crate) fn set(&self) {
        let waker = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match std::mem::replace(&mut *state, State::Set) {
                State::Pending(waker) => waker,
                State::Set => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Returns `true` if [`Signal::set`] has already been called.
    pub(crate) fn is_set(&self) -> bool {
        matches!(*self.state.lock().unwrap_or_else(|p| p.into_inner()), State::Set)
    }

    /// A future that resolves once [`Signal::set`] is called.
    pub(crate) fn wait(&self) -> Wait<'_> {
        Wait { signal: self }
    }
}

pub(crate) struct Wait<'a> {
    signal: &'a Signal,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self
            .signal
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match &mut *state {
            State::Set => Poll::Ready(()),
            State::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn set_before_wait_resolves_immediately() {
        let signal = Signal::new();
        signal.set();
        assert!(signal.is_set());
        pollster::block_on(signal.wait());
    }

    #[test]
    fn set_after_wait_wakes_the_waiter() {
        let signal = Arc::new(Signal::new());
        let setter = signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            setter.set();
        });
        pollster::block_on(signal.wait());
        assert!(signal.is_set());
    }
}
