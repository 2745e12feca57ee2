//! Hardware transactional memory, behind a runtime capability check.
//!
//! Every entry point degrades to "not supported" when the crate is built without the `htm`
//! feature, on a non x86_64 target, or on a CPU without `rtm`. Callers are expected to always keep
//! a non transactional fallback.

#![cfg_attr(all(feature = "htm", target_arch = "x86_64"), feature(stdarch_x86_rtm))]
#![warn(missing_debug_implementations)]
#![deny(rust_2018_idioms)]

use core::mem;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "htm", target_arch = "x86_64"))] {
        mod x86_64;
        use self::x86_64 as imp;
    } else {
        mod unsupported;
        use self::unsupported as imp;
    }
}

pub use self::imp::BeginCode;

/// Returns true if hardware transactions can be started on this machine.
#[inline]
pub fn htm_supported() -> bool {
    imp::htm_supported()
}

/// Returns true if the calling thread is currently inside a hardware transaction.
#[inline]
pub fn in_transaction() -> bool {
    htm_supported() && unsafe { imp::test() }
}

/// A running hardware transaction. Dropping it commits.
#[derive(Debug)]
pub struct HardwareTx {
    _private: (),
}

impl Drop for HardwareTx {
    #[inline]
    fn drop(&mut self) {
        unsafe { imp::end() }
    }
}

impl HardwareTx {
    /// Starts a hardware transaction.
    ///
    /// On an abort, execution resumes here and `retry_handler` decides whether to try again.
    /// Returns `None` once the handler gives up, or immediately if transactions are unsupported.
    ///
    /// # Safety
    ///
    /// Everything executed while the transaction is live must be safe to roll back, which excludes
    /// system calls, allocation and anything else with effects outside of plain memory.
    #[inline]
    pub unsafe fn begin<F: FnMut(BeginCode) -> bool>(mut retry_handler: F) -> Option<Self> {
        if !htm_supported() {
            return None;
        }
        loop {
            let code = imp::begin();
            if code.is_started() {
                return Some(HardwareTx { _private: () });
            } else if !retry_handler(code) {
                return None;
            }
        }
    }

    /// Explicitly aborts the transaction. Control returns to the matching `begin`.
    #[inline]
    pub fn abort(self) -> ! {
        mem::forget(self);
        unsafe { imp::abort() }
    }
}
