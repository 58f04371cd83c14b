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

//! The grade of access a lock request asks for, and the flag bitset that modifies it.

use std::fmt;
use std::ops::BitOr;

/// The grade of access an [`Awaiter`](crate::core::Awaiter) holds or requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared access; many may hold concurrently.
    Read,
    /// Shared with readers; exclusive among upgradeable-readers; may contain nested write
    /// requests.
    UpgradeableRead,
    /// Exclusive. Nested writes under a held write share the exclusion.
    Write,
}

/// A bitset of request modifiers.
///
/// The only flag this crate recognizes is [`LockFlags::STICKY_WRITE`], which is only meaningful
/// on an [`LockKind::UpgradeableRead`] request. Bits `0x80` and above are reserved for
/// subtype-style extensions built on top of [`crate::core::LockCore::lock_stack_contains`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockFlags(u8);

impl LockFlags {
    /// No modifiers.
    pub const NONE: LockFlags = LockFlags(0);

    /// Only meaningful combined with [`LockKind::UpgradeableRead`]: once a nested write is
    /// acquired under this upgradeable-read, the write is not returned to the pool on release —
    /// the upgradeable-read keeps a logically-active write until it itself releases.
    pub const STICKY_WRITE: LockFlags = LockFlags(0b0000_0001);

    /// Returns `true` if `self` contains every bit set in `other`.
    pub fn contains(&self, other: LockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no bits are set.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn bits(&self) -> u8 {
        self.0
    }

    /// Reserved for subtype-style extensions: construct a flag set from raw bits in the
    /// `0x80`-and-above range.
    pub const fn from_bits_retain(bits: u8) -> LockFlags {
        LockFlags(bits)
    }
}

impl BitOr for LockFlags {
    type Output = LockFlags;

    fn bitor(self, rhs: LockFlags) -> LockFlags {
        LockFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for LockFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "NONE");
        }
        let mut first = true;
        if self.contains(LockFlags::STICKY_WRITE) {
            write!(f, "STICKY_WRITE")?;
            first = false;
        }
        let extra = self.0 & !LockFlags::STICKY_WRITE.0;
        if extra != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{extra:#04x}")?;
        }
        Ok(())
    }
}
