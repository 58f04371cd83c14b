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

//! The concrete acquire/release scenarios a reader/writer lock has to get right: concurrent
//! readers, a writer draining behind existing readers, writer-before-reader fairness, nested
//! admission under a pending writer, and sticky-write retention across an upgradeable-read's
//! lifetime.

use std::sync::Arc;
use std::time::Duration;

use arwl::AsyncRwLock;
use arwl::LockFlags;

/// A bounded wait for a future that is expected to still be pending — polling to completion here
/// would hang the test forever if the implementation is wrong, so we race against a timeout and
/// treat "still running" as the pending case.
async fn still_pending<F: std::future::Future>(fut: F) -> bool {
    tokio::select! {
        _ = fut => false,
        _ = tokio::time::sleep(Duration::from_millis(50)) => true,
    }
}

#[tokio::test]
async fn s1_concurrent_readers() {
    let lock = Arc::new(AsyncRwLock::new(()));

    let r1 = lock.read_lock_async(None).await.unwrap();
    assert!(lock.is_read_lock_held());

    let lock2 = lock.clone();
    let b = tokio::spawn(async move {
        let r2 = lock2.read_lock_async(None).await.unwrap();
        assert!(lock2.is_read_lock_held());
        drop(r2);
    });
    b.await.unwrap();

    drop(r1);
}

#[tokio::test]
async fn s2_writer_waits_for_readers() {
    let lock = Arc::new(AsyncRwLock::new(0));
    let r = lock.read_lock_async(None).await.unwrap();

    let lock2 = lock.clone();
    let writer = tokio::spawn(async move {
        let mut w = lock2.write_lock_async(None).await.unwrap();
        *w += 1;
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!writer.is_finished());

    drop(r);
    writer.await.unwrap();

    let r2 = lock.read_lock_async(None).await.unwrap();
    assert_eq!(*r2, 1);
}

#[tokio::test]
async fn s3_new_readers_wait_behind_a_pending_writer() {
    let lock = Arc::new(AsyncRwLock::new(()));
    let a = lock.read_lock_async(None).await.unwrap();

    let lock_for_writer = lock.clone();
    let writer_started = Arc::new(tokio::sync::Notify::new());
    let notify = writer_started.clone();
    let writer = tokio::spawn(async move {
        notify.notify_one();
        let _w = lock_for_writer.write_lock_async(None).await.unwrap();
    });
    writer_started.notified().await;
    // Give the writer a moment to actually enqueue before racing the reader against it.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let lock_for_reader = lock.clone();
    let c_fut = lock_for_reader.read_lock_async(None);
    assert!(still_pending(c_fut).await, "new top-level reader must queue behind the pending writer");

    drop(a);
    writer.await.unwrap();

    let _c = lock.read_lock_async(None).await.unwrap();
}

#[tokio::test]
async fn s4_nested_reader_under_pending_writer_is_admitted_immediately() {
    let lock = Arc::new(AsyncRwLock::new(()));
    let a = lock.read_lock_async(None).await.unwrap();

    let lock2 = lock.clone();
    let writer_started = Arc::new(tokio::sync::Notify::new());
    let notify = writer_started.clone();
    let writer = tokio::spawn(async move {
        notify.notify_one();
        let _w = lock2.write_lock_async(None).await.unwrap();
    });
    writer_started.notified().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Nested under `a` (same task, same ambient chain): admitted immediately even though a write
    // is queued.
    let nested = lock.read_lock_async(None).await.unwrap();
    drop(nested);
    drop(a);
    writer.await.unwrap();
}

#[tokio::test]
async fn s5_sticky_upgrade_retains_write_across_releases() {
    let lock = AsyncRwLock::new(0);

    let ur = lock.upgradeable_read_lock_async(LockFlags::STICKY_WRITE, None).await.unwrap();
    {
        let mut w = lock.write_lock_async(None).await.unwrap();
        *w = 1;
        w.release().await.unwrap();
    }
    // The write lock stays logically active under the sticky upgradeable-read even though its
    // own guard already released.
    assert!(lock.is_write_lock_held());

    // A further nested write is granted immediately (no queueing, no conflict).
    {
        let mut w2 = lock.write_lock_async(None).await.unwrap();
        *w2 = 2;
    }

    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = fired.clone();
    lock.on_before_write_lock_released(move || {
        let flag = flag.clone();
        async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok::<(), std::convert::Infallible>(())
        }
    })
    .unwrap();

    ur.release().await.unwrap();
    assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!lock.is_write_lock_held());

    let r = lock.read_lock_async(None).await.unwrap();
    assert_eq!(*r, 2);
}

#[tokio::test]
async fn completion_waits_for_outstanding_holders_and_callbacks() {
    let lock = Arc::new(AsyncRwLock::new(()));
    let w = lock.write_lock_async(None).await.unwrap();

    lock.complete();
    let lock2 = lock.clone();
    let waiter = tokio::spawn(async move {
        lock2.completion().await;
    });

    assert!(!waiter.is_finished());
    w.release().await.unwrap();
    waiter.await.unwrap();
}
