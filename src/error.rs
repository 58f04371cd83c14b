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

//! The error taxonomy a lock request or release can fail with.

use std::error;
use std::fmt;

/// Errors a lock request or release can fail with.
///
/// Request failures are always delivered through the returned future — never thrown
/// synchronously from the request method — so that they compose with the rest of a
/// cooperative-concurrency call chain.
#[derive(Debug)]
#[non_exhaustive]
pub enum LockError {
    /// The request's cancellation token fired before the request was admitted.
    Canceled,
    /// [`crate::AsyncRwLock::complete`] had already been called and the request was top-level
    /// (not nested in a currently-held [`crate::core::Awaiter`]).
    LockCompleted,
    /// The operation is not valid in the caller's current state: a synchronous variant was
    /// invoked on an affinity-constrained thread, a release callback was registered without
    /// holding a write lock, or a release targeted an `Awaiter` no longer in the holder set.
    InvalidOperation(&'static str),
    /// One or more `on_before_write_lock_released` callbacks failed while draining on release.
    /// Every callback still runs to completion regardless of earlier failures; this aggregates
    /// all of them.
    Aggregate(Vec<CallbackError>),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Canceled => write!(f, "lock request canceled"),
            LockError::LockCompleted => {
                write!(f, "lock has completed; no new top-level requests are accepted")
            }
            LockError::InvalidOperation(reason) => write!(f, "invalid operation: {reason}"),
            LockError::Aggregate(errors) => {
                write!(f, "{} release callback(s) failed", errors.len())
            }
        }
    }
}

impl error::Error for LockError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LockError::Aggregate(errors) => errors.first().map(|e| e as &(dyn error::Error + 'static)),
            _ => None,
        }
    }
}

/// An error captured from a single `on_before_write_lock_released` callback.
///
/// The callback's own error type is erased to a `String` so that the aggregate can hold
/// callbacks of differing error types, matching how the original release pipeline surfaces
/// heterogeneous failures as a single aggregate.
#[derive(Debug)]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl error::Error for CallbackError {}
