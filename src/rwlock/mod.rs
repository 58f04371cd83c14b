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

//! An asynchronous reader/writer lock with three grades of access — shared read, upgradeable
//! read, and exclusive write — plus nesting across task-local ambient context, cooperative
//! cancellation, graceful shutdown, and pre-release callbacks.
//!
//! Unlike [`std::sync::RwLock`] or `tokio::sync::RwLock`, a nested acquire from *within* a task
//! that already holds a compatible lock on the same [`AsyncRwLock`] is admitted immediately
//! rather than queued behind unrelated requests — that nesting is what lets an upgradeable-read
//! holder call `write_lock_async` on itself to upgrade, and is tracked through the task's ambient
//! context (see the [`crate::ambient`] module) rather than through any value the caller passes
//! around explicitly.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main]
//! # async fn main() {
//! use arwl::AsyncRwLock;
//!
//! let lock = AsyncRwLock::new(5);
//!
//! // many reader locks can be held at once
//! let r1 = lock.read_lock_async(None).await.unwrap();
//! let r2 = lock.read_lock_async(None).await.unwrap();
//! assert_eq!(*r1, 5);
//! assert_eq!(*r2, 5);
//! drop((r1, r2));
//!
//! // only one write lock may be held, however
//! let mut w = lock.write_lock_async(None).await.unwrap();
//! *w += 1;
//! assert_eq!(*w, 6);
//! # }
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

use crate::ambient;
use crate::ambient::HideLocksGuard;
use crate::cancellation::CancellationToken;
use crate::core::Callback;
use crate::core::LockCore;
use crate::error::CallbackError;
use crate::error::LockError;
use crate::flags::LockFlags;
use crate::flags::LockKind;

/// The single-threaded-affinity (STA) boundary the core depends on only at its contract (spec.md
/// §5): a runtime integrator that constrains certain threads (e.g. a UI thread) implements this to
/// make the synchronous `_lock` variants fail fast with [`LockError::InvalidOperation`] there,
/// rather than deadlock the constrained thread against itself. No concrete platform
/// implementation ships with this crate — that marshaling policy is out of scope (spec.md §1).
pub trait ThreadAffinity: Send + Sync {
    /// `true` if the calling thread is allowed to synchronously block waiting for a lock.
    fn can_hold_lock_on_this_thread(&self) -> bool;
}

fn box_callback<F, Fut, E>(f: F) -> Callback
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Box::new(move || Box::pin(async move { f().await.map_err(|e| CallbackError::new(e.to_string())) }))
}

/// An asynchronous reader/writer lock that allows multiple readers, one upgradeable reader
/// alongside them, or a single writer at a time.
///
/// See the [module level documentation](self) for more.
pub struct AsyncRwLock<T: ?Sized> {
    core: LockCore,
    affinity: Option<Arc<dyn ThreadAffinity>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for AsyncRwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for AsyncRwLock<T> {}

impl<T> AsyncRwLock<T> {
    /// Creates a new lock, unheld, wrapping `t`.
    pub fn new(t: T) -> Self {
        Self {
            core: LockCore::new(),
            affinity: None,
            data: UnsafeCell::new(t),
        }
    }

    /// Creates a new lock whose synchronous `_lock` methods consult `affinity` before blocking,
    /// failing with [`LockError::InvalidOperation`] on a thread `affinity` rejects.
    pub fn with_thread_affinity(t: T, affinity: Arc<dyn ThreadAffinity>) -> Self {
        Self {
            core: LockCore::new(),
            affinity: Some(affinity),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> AsyncRwLock<T> {
    fn check_affinity(&self) -> Result<(), LockError> {
        match &self.affinity {
            Some(affinity) if !affinity.can_hold_lock_on_this_thread() => Err(LockError::InvalidOperation(
                "synchronous lock method invoked on an affinity-constrained thread",
            )),
            _ => Ok(()),
        }
    }

    /// Requests shared read access. Admitted immediately if no write is held (or only one on the
    /// caller's own ambient chain); otherwise queues behind any pending writer, unless this
    /// request nests under an Awaiter the caller already holds.
    pub fn read_lock_async(&self, token: Option<&CancellationToken>) -> impl Future<Output = Result<ReadGuard<'_, T>, LockError>> + '_ {
        let request = self.core.request(LockKind::Read, LockFlags::NONE, token.cloned());
        async move {
            let awaiter = request.await?;
            Ok(ReadGuard { lock: self, id: awaiter.id })
        }
    }

    /// Requests upgradeable-read access: shared with plain readers, exclusive among other
    /// upgradeable-readers. Pass [`LockFlags::STICKY_WRITE`] so that a write later acquired
    /// nested under the returned guard stays logically active until the guard itself releases,
    /// even across repeated nested `write_lock_async`/release cycles.
    pub fn upgradeable_read_lock_async(
        &self,
        flags: LockFlags,
        token: Option<&CancellationToken>,
    ) -> impl Future<Output = Result<UpgradableReadGuard<'_, T>, LockError>> + '_ {
        let request = self.core.request(LockKind::UpgradeableRead, flags, token.cloned());
        async move {
            let awaiter = request.await?;
            Ok(UpgradableReadGuard { lock: self, id: awaiter.id })
        }
    }

    /// Requests exclusive write access. A top-level request waits for every reader,
    /// upgradeable-reader, and writer to drain; a request nested under a held Awaiter (including
    /// an upgradeable-read, to upgrade it) is admitted as soon as any readers on *that* ambient
    /// chain specifically have drained.
    pub fn write_lock_async(&self, token: Option<&CancellationToken>) -> impl Future<Output = Result<WriteGuard<'_, T>, LockError>> + '_ {
        let request = self.core.request(LockKind::Write, LockFlags::NONE, token.cloned());
        async move {
            let awaiter = request.await?;
            Ok(WriteGuard { lock: self, id: awaiter.id })
        }
    }

    /// Blocking variant of [`read_lock_async`](Self::read_lock_async). Fails with
    /// [`LockError::InvalidOperation`] on an affinity-constrained thread rather than blocking it.
    pub fn read_lock(&self, token: Option<&CancellationToken>) -> Result<ReadGuard<'_, T>, LockError> {
        self.check_affinity()?;
        pollster::block_on(self.read_lock_async(token))
    }

    /// Blocking variant of [`upgradeable_read_lock_async`](Self::upgradeable_read_lock_async).
    pub fn upgradeable_read_lock(&self, flags: LockFlags, token: Option<&CancellationToken>) -> Result<UpgradableReadGuard<'_, T>, LockError> {
        self.check_affinity()?;
        pollster::block_on(self.upgradeable_read_lock_async(flags, token))
    }

    /// Blocking variant of [`write_lock_async`](Self::write_lock_async).
    pub fn write_lock(&self, token: Option<&CancellationToken>) -> Result<WriteGuard<'_, T>, LockError> {
        self.check_affinity()?;
        pollster::block_on(self.write_lock_async(token))
    }

    /// `true` if the *current task* holds a read lock on this instance, per its ambient context.
    /// Always `false` while a [`HideLocksGuard`] is active on the current task.
    pub fn is_read_lock_held(&self) -> bool {
        self.core.is_kind_held(LockKind::Read)
    }

    /// `true` if the current task holds an upgradeable-read lock on this instance.
    pub fn is_upgradeable_read_lock_held(&self) -> bool {
        self.core.is_kind_held(LockKind::UpgradeableRead)
    }

    /// `true` if the current task holds a write lock on this instance — including one made
    /// logically active by a `StickyWrite` upgradeable-read it holds.
    pub fn is_write_lock_held(&self) -> bool {
        self.core.is_kind_held(LockKind::Write)
    }

    /// Masks this task's ambient lock stack for as long as the returned guard lives: while any
    /// such guard is alive, `is_*_lock_held` reports `false` for the current task and new
    /// top-level requests no longer see this task's held Awaiters as ancestors. The underlying
    /// Awaiters remain held — this only hides them, it does not release anything, and other
    /// tasks are unaffected.
    pub fn hide_locks(&self) -> HideLocksGuard {
        ambient::HideLocksGuard::enter()
    }

    /// Registers `f` to run just before the next write lock release that actually clears the
    /// write bit, while it is still observably held by the current task. Fails with
    /// [`LockError::InvalidOperation`] if the current task does not hold a write lock.
    pub fn on_before_write_lock_released<F, Fut, E>(&self, f: F) -> Result<(), LockError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.core.register_callback(box_callback(f))
    }

    /// Marks this lock as draining: subsequent *top-level* requests fail with
    /// [`LockError::LockCompleted`]. Requests already queued, and any nested in an Awaiter
    /// currently held, continue to be serviced normally. Idempotent.
    pub fn complete(&self) {
        self.core.complete();
    }

    /// Resolves once [`complete`](Self::complete) has been called, every Awaiter has been
    /// released, and every registered release callback has run to completion.
    pub fn completion(&self) -> impl Future<Output = ()> + '_ {
        self.core.completion()
    }

    /// `true` if some Awaiter on the current task's ambient chain (for this lock) carries every
    /// bit set in `flags` — the extension point a `LockFlags`-extending subtype would build its
    /// own public query on top of, since Rust has no `protected` to expose it through directly.
    pub fn lock_stack_contains(&self, flags: LockFlags) -> bool {
        self.core.lock_stack_contains(flags)
    }
}

/// RAII guard for shared read access, created by [`AsyncRwLock::read_lock_async`] and
/// [`AsyncRwLock::read_lock`]. Dropping it releases the read lock; releasing never involves
/// callbacks (those only ever run on a write release), so `Drop` alone is always enough.
#[must_use = "if unused the read lock is released immediately"]
pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a AsyncRwLock<T>,
    id: u64,
}

unsafe impl<T: ?Sized + Sync> Send for ReadGuard<'_, T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for ReadGuard<'_, T> {}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.core.release_read(self.id);
    }
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// RAII guard for upgradeable-read access, created by [`AsyncRwLock::upgradeable_read_lock_async`]
/// and [`AsyncRwLock::upgradeable_read_lock`].
///
/// To upgrade, call [`AsyncRwLock::write_lock_async`] again while this guard is alive (and on the
/// same task): the nested request is admitted as soon as any unrelated readers drain, without
/// consuming this guard. Dropping this guard releases it synchronously if no write was ever
/// nested underneath, or drives that write's deferred release pipeline to completion on the
/// current thread otherwise — prefer the explicit async [`release`](Self::release) to avoid that
/// blocking fallback and to observe any aggregated callback errors.
#[must_use = "if unused the upgradeable-read lock is released immediately"]
pub struct UpgradableReadGuard<'a, T: ?Sized> {
    lock: &'a AsyncRwLock<T>,
    id: u64,
}

unsafe impl<T: ?Sized + Sync> Send for UpgradableReadGuard<'_, T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for UpgradableReadGuard<'_, T> {}

impl<T: ?Sized> UpgradableReadGuard<'_, T> {
    /// Registers `f` to run just before the sticky write nested under this guard is finally
    /// released (i.e. when this guard itself releases). Fails with
    /// [`LockError::InvalidOperation`] if no write is currently active under this guard.
    pub fn on_before_write_lock_released<F, Fut, E>(&self, f: F) -> Result<(), LockError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.lock.core.register_callback(box_callback(f))
    }

    /// Releases this guard, awaiting any deferred sticky-write callback drain and surfacing
    /// [`LockError::Aggregate`] if any of them failed.
    pub fn release(self) -> impl Future<Output = Result<(), LockError>> + 'static {
        let core = self.lock.core.clone();
        let id = self.id;
        std::mem::forget(self);
        async move { core.release_upgradeable(id).await }
    }
}

impl<T: ?Sized> Drop for UpgradableReadGuard<'_, T> {
    fn drop(&mut self) {
        let core = self.lock.core.clone();
        let id = self.id;
        let _ = pollster::block_on(async move { core.release_upgradeable(id).await });
    }
}

impl<T: ?Sized> Deref for UpgradableReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for UpgradableReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// RAII guard for exclusive write access, created by [`AsyncRwLock::write_lock_async`] and
/// [`AsyncRwLock::write_lock`].
///
/// Dropping this guard releases it synchronously if no callbacks are registered, or drives the
/// release pipeline to completion on the current thread otherwise — prefer the explicit async
/// [`release`](Self::release) to avoid that blocking fallback and to observe any aggregated
/// callback errors.
#[must_use = "if unused the write lock is released immediately"]
pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a AsyncRwLock<T>,
    id: u64,
}

unsafe impl<T: ?Sized + Send + Sync> Send for WriteGuard<'_, T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for WriteGuard<'_, T> {}

impl<T: ?Sized> WriteGuard<'_, T> {
    /// Registers `f` to run just before this write lock actually releases (immediately, or — if
    /// nested under a `StickyWrite` upgradeable-read — when that upgradeable-read releases).
    pub fn on_before_write_lock_released<F, Fut, E>(&self, f: F) -> Result<(), LockError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.lock.core.register_callback(box_callback(f))
    }

    /// Releases this guard, awaiting the registered release callbacks and surfacing
    /// [`LockError::Aggregate`] if any of them failed.
    pub fn release(self) -> impl Future<Output = Result<(), LockError>> + 'static {
        let core = self.lock.core.clone();
        let id = self.id;
        std::mem::forget(self);
        async move { core.release_write(id).await }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let core = self.lock.core.clone();
        let id = self.id;
        let _ = pollster::block_on(async move { core.release_write(id).await });
    }
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_readers_see_the_same_value() {
        pollster::block_on(async {
            let lock = AsyncRwLock::new(5);
            let r1 = lock.read_lock_async(None).await.unwrap();
            let r2 = lock.read_lock_async(None).await.unwrap();
            assert_eq!(*r1, 5);
            assert_eq!(*r2, 5);
            assert!(lock.is_read_lock_held());
        });
    }

    #[test]
    fn write_lock_mutates_in_place() {
        pollster::block_on(async {
            let lock = AsyncRwLock::new(5);
            {
                let mut w = lock.write_lock_async(None).await.unwrap();
                *w += 1;
            }
            let r = lock.read_lock_async(None).await.unwrap();
            assert_eq!(*r, 6);
        });
    }

    #[test]
    fn upgradeable_read_can_nest_a_write() {
        pollster::block_on(async {
            let lock = AsyncRwLock::new(5);
            let ur = lock.upgradeable_read_lock_async(LockFlags::NONE, None).await.unwrap();
            assert_eq!(*ur, 5);
            {
                let mut w = lock.write_lock_async(None).await.unwrap();
                *w = 6;
            }
            assert_eq!(*ur, 6);
        });
    }

    #[test]
    fn hide_locks_masks_is_held_queries() {
        pollster::block_on(async {
            let lock = AsyncRwLock::new(());
            let _r = lock.read_lock_async(None).await.unwrap();
            assert!(lock.is_read_lock_held());
            {
                let _guard = lock.hide_locks();
                assert!(!lock.is_read_lock_held());
            }
            assert!(lock.is_read_lock_held());
        });
    }
}
