// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-process segment lock.
//!
//! The lock is a `u32` word inside the shared mapping: 0 when unlocked,
//! otherwise the pid of the holder. Acquisition is a compare-and-swap on that
//! word, so it excludes threads of this process and of every other process
//! that mapped the same region. Waiters back off in three stages: busy spins
//! of growing length, then `yield_now`, then sleeps doubling up to 1ms.
//!
//! # Hazard
//!
//! A process that dies while holding the lock leaves the segment locked for
//! every attacher, forever. There is no automatic recovery. A waiter blocked
//! for longer than [`STALE_CHECK_AFTER`] checks whether the recorded holder
//! is still alive and logs a warning if it is not. The lock is not
//! reentrant: locking a segment twice from one thread deadlocks.

use core::sync::atomic::{AtomicU32, Ordering};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Rounds of busy spinning before yielding. Round `n` spins `2^n` times.
const SPIN_ROUNDS: u32 = 7;
/// Yields before falling back to sleeping.
const YIELD_ROUNDS: u32 = 16;
const MIN_SLEEP: Duration = Duration::from_micros(50);
const MAX_SLEEP: Duration = Duration::from_millis(1);
/// How long a waiter blocks before checking the holder's liveness.
pub const STALE_CHECK_AFTER: Duration = Duration::from_secs(1);

const UNLOCKED: u32 = 0;

/// The lock word of one segment.
pub struct SegmentLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> SegmentLock<'a> {
    #[inline]
    pub(crate) fn new(word: &'a AtomicU32) -> Self {
        SegmentLock { word }
    }

    /// Pid of the current holder, if locked.
    #[inline]
    pub fn holder(&self) -> Option<u32> {
        match self.word.load(Ordering::Relaxed) {
            UNLOCKED => None,
            pid => Some(pid),
        }
    }

    /// Returns the holder's pid if the segment is locked by a process that
    /// no longer exists.
    pub fn stale_holder(&self) -> Option<u32> {
        self.holder().filter(|&pid| !process_alive(pid))
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SegmentGuard<'a>> {
        self.word
            .compare_exchange(UNLOCKED, current_pid(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SegmentGuard { word: self.word })
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> SegmentGuard<'a> {
        let pid = current_pid();
        if self
            .word
            .compare_exchange_weak(UNLOCKED, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return SegmentGuard { word: self.word };
        }
        self.lock_contended(pid)
    }

    #[cold]
    fn lock_contended(&self, pid: u32) -> SegmentGuard<'a> {
        let started = Instant::now();
        let mut round = 0u32;
        let mut sleep = MIN_SLEEP;
        let mut stale_checked = false;
        loop {
            // Only attempt the CAS when the word looks free, to keep the
            // cache line shared while someone else holds it.
            if self.word.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .word
                    .compare_exchange_weak(UNLOCKED, pid, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                if round > SPIN_ROUNDS {
                    trace!(waited = ?started.elapsed(), "acquired contended segment lock");
                }
                return SegmentGuard { word: self.word };
            }

            if round < SPIN_ROUNDS {
                for _ in 0..(1u32 << round) {
                    core::hint::spin_loop();
                }
            } else if round < SPIN_ROUNDS + YIELD_ROUNDS {
                std::thread::yield_now();
            } else {
                std::thread::sleep(sleep);
                sleep = (sleep * 2).min(MAX_SLEEP);

                if !stale_checked && started.elapsed() >= STALE_CHECK_AFTER {
                    stale_checked = true;
                    if let Some(holder) = self.stale_holder() {
                        warn!(
                            holder,
                            "segment lock is held by a process that no longer exists; \
                             the segment will stay locked"
                        );
                    }
                }
            }
            round = round.saturating_add(1);
        }
    }
}

/// Holds a segment lock and releases it when dropped, including during
/// unwinding.
pub struct SegmentGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for SegmentGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

#[inline]
fn current_pid() -> u32 {
    std::process::id()
}

fn process_alive(pid: u32) -> bool {
    if pid == current_pid() {
        return true;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence. EPERM means it exists but belongs
    // to someone else.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}
