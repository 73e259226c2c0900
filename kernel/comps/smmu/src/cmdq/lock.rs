// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicI32, Ordering};

/// A shared/exclusive counter lock guarding the cached consumer index.
///
/// Shared holders are `CMD_SYNC` waiters. The last of them to leave writes
/// back the consumer index it observed. The exclusive holder refreshes the
/// cached consumer index when the queue looks full. Neither side ever blocks
/// on the other for longer than a refresh takes.
pub(super) struct CmdqLock(AtomicI32);

impl CmdqLock {
    pub(super) const fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    pub(super) fn shared_lock(&self) {
        // While the lock is held exclusively, the counter is negative and the
        // stray increment is wiped out by the exclusive unlock.
        if self.0.fetch_add(1, Ordering::Acquire) >= 0 {
            return;
        }

        loop {
            let val = self.0.load(Ordering::Relaxed);
            if val < 0 {
                core::hint::spin_loop();
                continue;
            }
            if self
                .0
                .compare_exchange_weak(val, val + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(super) fn shared_unlock(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    /// Releases a shared hold unless it is the last one.
    ///
    /// Returns `false`, still holding the lock, if the caller is the last
    /// shared holder.
    pub(super) fn shared_tryunlock(&self) -> bool {
        if self.0.load(Ordering::Relaxed) == 1 {
            return false;
        }
        self.shared_unlock();
        true
    }

    pub(super) fn exclusive_trylock(&self) -> bool {
        self.0
            .compare_exchange(0, i32::MIN, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(super) fn exclusive_unlock(&self) {
        self.0.store(0, Ordering::Release);
    }
}
