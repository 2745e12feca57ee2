//! The single flight lock guarding a write-back bucket.
//!
//! Flushers never queue on it: `try_lock` failing means another thread is already writing the
//! bucket back, and the caller treats the bucket as being taken care of.

use crossbeam_utils::Backoff;
use lock_api::{GuardSend, RawMutex};
use std::sync::atomic::{
    AtomicU16,
    Ordering::{Acquire, Relaxed, Release},
};

const UNLOCKED: u16 = 0;
const LOCKED: u16 = 1;

#[derive(Debug)]
pub struct WriteBackLock {
    state: AtomicU16,
}

unsafe impl RawMutex for WriteBackLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: WriteBackLock = WriteBackLock {
        state: AtomicU16::new(UNLOCKED),
    };
    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        if unlikely!(!self.try_lock()) {
            self.lock_slow()
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        // test before the CAS, so that a held lock costs a shared load instead of an exclusive
        // cache line transfer
        self.state.load(Relaxed) == UNLOCKED
            && self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
                .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        let _prev = self.state.swap(UNLOCKED, Release);
        debug_assert_eq!(
            _prev, LOCKED,
            "attempt to unlock an unlocked `WriteBackLock`"
        );
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(Relaxed) == LOCKED
    }
}

impl WriteBackLock {
    #[cold]
    #[inline(never)]
    fn lock_slow(&self) {
        let backoff = Backoff::new();
        while !self.try_lock() {
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn send_sync<T: Send + Sync>() {}

    #[test]
    fn is_send_sync() {
        send_sync::<WriteBackLock>()
    }

    #[test]
    fn try_lock_is_exclusive() {
        let lock = WriteBackLock::INIT;
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
        lock.lock();
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
    }
}
