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

//! Validity of nested lock scripts over the alphabet R (read), U (upgradeable-read), S
//! (upgradeable-read with `StickyWrite`), W (write). Each letter nests under whatever the
//! previous letter in the sequence acquired, on the same task; release is LIFO.
//!
//! A script is invalid exactly when some letter would escalate a plain read it already holds
//! (directly or transitively) into an upgradeable-read or a write without ever having gone
//! through an upgradeable-read first — escalating a bare read is rejected synchronously rather
//! than left to hang forever waiting on itself.

use arwl::AsyncRwLock;
use arwl::LockError;
use arwl::LockFlags;
use arwl::ReadGuard;
use arwl::UpgradableReadGuard;
use arwl::WriteGuard;

enum Held<'a> {
    Read(ReadGuard<'a, ()>),
    Upgradeable(UpgradableReadGuard<'a, ()>),
    Write(WriteGuard<'a, ()>),
}

async fn acquire<'a>(lock: &'a AsyncRwLock<()>, step: char) -> Result<Held<'a>, LockError> {
    match step {
        'R' => lock.read_lock_async(None).await.map(Held::Read),
        'U' => lock.upgradeable_read_lock_async(LockFlags::NONE, None).await.map(Held::Upgradeable),
        'S' => lock.upgradeable_read_lock_async(LockFlags::STICKY_WRITE, None).await.map(Held::Upgradeable),
        'W' => lock.write_lock_async(None).await.map(Held::Write),
        other => panic!("unknown lock script letter {other:?}"),
    }
}

/// Runs `seq` nesting each step under the previous one. On success, releases every guard in
/// LIFO order and returns `Ok(())`. On the first failing step, returns its zero-based index.
async fn run_sequence(seq: &str) -> Result<(), usize> {
    let lock = AsyncRwLock::new(());
    let mut held = Vec::new();
    for (i, step) in seq.chars().enumerate() {
        match acquire(&lock, step).await {
            Ok(guard) => held.push(guard),
            Err(_) => return Err(i),
        }
    }
    while held.pop().is_some() {}
    assert!(!lock.is_read_lock_held());
    assert!(!lock.is_upgradeable_read_lock_held());
    assert!(!lock.is_write_lock_held());
    Ok(())
}

const VALID: &[&str] = &[
    "R",
    "RR",
    "U",
    "UU",
    "UR",
    "UW",
    "URW",
    "S",
    "SS",
    "SR",
    "SW",
    "SUSURWR",
    "WW",
    "WR",
    "WU",
    "SWRW",
];

const INVALID: &[(&str, usize)] = &[("RW", 1), ("RU", 1), ("RS", 1), ("RRW", 2), ("RRU", 2)];

#[tokio::test]
async fn valid_lock_scripts_fully_succeed() {
    assert_eq!(VALID.len() + INVALID.len(), 21, "the script grid should cover all 21 sequences");
    for seq in VALID {
        run_sequence(seq).await.unwrap_or_else(|i| panic!("{seq:?} was expected to fully succeed but failed at step {i}"));
    }
}

#[tokio::test]
async fn invalid_lock_scripts_fail_at_the_expected_step() {
    for (seq, expected) in INVALID {
        match run_sequence(seq).await {
            Ok(()) => panic!("{seq:?} was expected to fail at step {expected} but fully succeeded"),
            Err(actual) => assert_eq!(actual, *expected, "{seq:?} failed at the wrong step"),
        }
    }
}
