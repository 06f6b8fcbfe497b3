//! A seqlock-style version word with an embedded spin-lock bit.
//!
//! The word is laid out as follows:
//!
//! ```text
//! 63                                 2   1   0
//! +-----------------------------------+---+---+
//! |          version counter          | P | L |
//! +-----------------------------------+---+---+
//! ```
//!
//! - `L` is the lock bit.
//! - `P` is the phantom bit. Only entry versions use it; it marks an entry
//!   that was inserted by an uncommitted transaction, or deleted by a
//!   committed one but not yet physically removed.
//! - The counter advances by [`VERSION_INCREMENT`] every time a critical
//!   section ends with [`VersionedLock::unlock`].
//!
//! This module is the only place in the crate that touches the raw bits.

use std::sync::atomic::{self, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

pub(crate) const LOCK_BIT: u64 = 0b01;
pub(crate) const PHANTOM_BIT: u64 = 0b10;
pub(crate) const VERSION_INCREMENT: u64 = 0b100;

#[derive(Debug, Default)]
pub(crate) struct VersionedLock {
    word: AtomicU64,
}

impl VersionedLock {
    pub(crate) fn new(version: u64) -> Self {
        Self {
            word: AtomicU64::new(version),
        }
    }

    /// Loads the current word.
    ///
    /// The load is preceded by an acquire fence so that it can also serve as
    /// the closing read of an optimistic section: every load done in the
    /// section is ordered before it.
    #[inline]
    pub(crate) fn version(&self) -> u64 {
        atomic::fence(Ordering::Acquire);
        self.word.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        is_locked(self.word.load(Ordering::Relaxed))
    }

    pub(crate) fn lock(&self) {
        let backoff = Backoff::new();
        loop {
            if self.try_lock() {
                return;
            }
            while self.is_locked() {
                backoff.snooze();
            }
        }
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        let current = self.word.load(Ordering::Relaxed);
        if is_locked(current) {
            return false;
        }
        let acquired = self
            .word
            .compare_exchange_weak(
                current,
                current | LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok();
        if acquired {
            // Optimistic readers must never see a protected store before the
            // lock bit.
            atomic::fence(Ordering::Release);
        }
        acquired
    }

    /// Tries to take the lock, spinning for a bounded amount of time.
    pub(crate) fn try_lock_for(&self, max_spins: u32) -> bool {
        let backoff = Backoff::new();
        for _ in 0..max_spins {
            if self.try_lock() {
                return true;
            }
            backoff.spin();
        }
        false
    }

    /// Ends a critical section: bumps the version and clears the lock bit in
    /// a single atomic step.
    #[inline]
    pub(crate) fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.word
            .fetch_add(VERSION_INCREMENT - LOCK_BIT, Ordering::Release);
    }

    /// Clears the lock bit without bumping the version.
    #[inline]
    pub(crate) fn release(&self) {
        debug_assert!(self.is_locked());
        self.word.fetch_and(!LOCK_BIT, Ordering::Release);
    }

    /// Advances the version whether or not the lock is held by someone.
    #[inline]
    pub(crate) fn bump(&self) {
        self.word.fetch_add(VERSION_INCREMENT, Ordering::Release);
    }

    /// Stores `version` while keeping the lock. The caller must hold it.
    #[inline]
    pub(crate) fn set_version_locked(&self, version: u64) {
        debug_assert!(self.is_locked());
        self.word.store(version | LOCK_BIT, Ordering::Release);
    }

    /// Sets or clears the phantom bit. The caller must hold the lock.
    pub(crate) fn set_phantom_locked(&self, phantom: bool) {
        let current = self.word.load(Ordering::Relaxed);
        let next = if phantom {
            current | PHANTOM_BIT
        } else {
            current & !PHANTOM_BIT
        };
        self.set_version_locked(next);
    }

    #[inline]
    pub(crate) fn check_version(before: u64, after: u64) -> bool {
        before == after && !is_locked(before)
    }
}

#[inline]
pub(crate) fn is_locked(version: u64) -> bool {
    version & LOCK_BIT != 0
}

#[inline]
pub(crate) fn is_phantom(version: u64) -> bool {
    version & PHANTOM_BIT != 0
}

#[inline]
pub(crate) fn with_phantom(version: u64) -> u64 {
    version | PHANTOM_BIT
}

/// Strips the lock and phantom bits, leaving only the counter.
#[inline]
pub(crate) fn counter(version: u64) -> u64 {
    version & !(LOCK_BIT | PHANTOM_BIT)
}

/// Compares two versions ignoring the lock bit. Used by a lock holder to
/// validate its own earlier observation.
#[inline]
pub(crate) fn same_ignoring_lock(a: u64, b: u64) -> bool {
    a & !LOCK_BIT == b & !LOCK_BIT
}
