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

//! An asynchronous reader/writer lock with nesting across ambient task context, cooperative
//! cancellation, graceful shutdown, and pre-release callbacks.
//!
//! The headline type is [`AsyncRwLock`]; see its module documentation for the access grades it
//! offers and how nested acquisition works. [`ambient`] documents how "the current task already
//! holds a compatible lock" is tracked and how to carry that across a spawned child task.
//! [`CancellationToken`] is the cooperative cancellation primitive every `_async` method accepts.

pub mod ambient;
mod cancellation;
mod core;
mod error;
mod flags;
mod internal;
mod rwlock;

pub use crate::cancellation::CancellationToken;
pub use crate::error::CallbackError;
pub use crate::error::LockError;
pub use crate::flags::LockFlags;
pub use crate::flags::LockKind;
pub use crate::rwlock::AsyncRwLock;
pub use crate::rwlock::ReadGuard;
pub use crate::rwlock::ThreadAffinity;
pub use crate::rwlock::UpgradableReadGuard;
pub use crate::rwlock::WriteGuard;
