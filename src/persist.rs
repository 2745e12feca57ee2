//! Cache line write-back primitives.
//!
//! Everything durable in this crate goes through a [`Persist`] implementation. [`Simulated`]
//! models the latency of non-volatile memory on ordinary DRAM by busy waiting on the cycle
//! counter, [`Clflush`] issues the real instructions on x86_64.

use core::hint;

/// Size of the unit of write-back.
pub const CACHE_LINE: usize = 64;

/// Returns the address of the cache line containing `addr`.
#[inline]
pub const fn line_of(addr: usize) -> usize {
    addr & !(CACHE_LINE - 1)
}

/// Persistence primitives.
///
/// `flush_line` may return before the line is durable. Every line flushed by a thread is durable
/// once that thread's next `store_fence` returns.
pub trait Persist: Send + Sync {
    /// Starts writing back the cache line containing `addr`.
    fn flush_line(&self, addr: usize);

    /// Waits until every line previously flushed by this thread is durable.
    fn store_fence(&self);

    /// Writes back the cache line containing `addr` and waits for it to become durable.
    #[inline]
    fn flush_line_blocking(&self, addr: usize) {
        self.flush_line(addr);
        self.store_fence();
    }
}

impl<'a, P: Persist + ?Sized> Persist for &'a P {
    #[inline]
    fn flush_line(&self, addr: usize) {
        (**self).flush_line(addr)
    }

    #[inline]
    fn store_fence(&self) {
        (**self).store_fence()
    }

    #[inline]
    fn flush_line_blocking(&self, addr: usize) {
        (**self).flush_line_blocking(addr)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Reads the cycle counter.
        #[inline]
        pub fn ticks() -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }
    } else {
        /// Reads the cycle counter, approximated by nanoseconds since the first call.
        #[inline]
        pub fn ticks() -> u64 {
            use lazy_static::lazy_static;
            use std::time::Instant;

            lazy_static! {
                static ref START: Instant = Instant::now();
            }
            START.elapsed().as_nanos() as u64
        }
    }
}

/// Spins until at least `cycles` ticks have passed.
#[inline]
pub fn spin_for(cycles: u64) {
    let start = ticks();
    while ticks().wrapping_sub(start) < cycles {
        hint::spin_loop()
    }
}

/// Latency model of non-volatile memory behind a write-back cache, for machines without it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Simulated {
    /// Cost of issuing a non-blocking flush.
    pub flush_cycles: u64,

    /// Cost of waiting for outstanding flushes to complete.
    pub fence_cycles: u64,
}

impl Simulated {
    pub const FLUSH_CYCLES: u64 = 9;
    pub const FENCE_CYCLES: u64 = 370;

    /// A model without any latency. Useful in tests.
    #[inline]
    pub const fn free() -> Self {
        Simulated {
            flush_cycles: 0,
            fence_cycles: 0,
        }
    }
}

impl Default for Simulated {
    #[inline]
    fn default() -> Self {
        Simulated {
            flush_cycles: Simulated::FLUSH_CYCLES,
            fence_cycles: Simulated::FENCE_CYCLES,
        }
    }
}

impl Persist for Simulated {
    #[inline]
    fn flush_line(&self, _addr: usize) {
        // too short to be worth reading the counter
        for _ in 0..self.flush_cycles {
            hint::spin_loop()
        }
    }

    #[inline]
    fn store_fence(&self) {
        spin_for(self.fence_cycles)
    }

    #[inline]
    fn flush_line_blocking(&self, _addr: usize) {
        spin_for(self.fence_cycles)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Real write-backs using `clflush` and `sfence`.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct Clflush;

        impl Persist for Clflush {
            #[inline]
            fn flush_line(&self, addr: usize) {
                // clflush never faults on a mapped address, and every address handed to a
                // `Persist` points into memory owned by a live structure
                unsafe { core::arch::x86_64::_mm_clflush(addr as *const u8) }
            }

            #[inline]
            fn store_fence(&self) {
                unsafe { core::arch::x86_64::_mm_sfence() }
            }
        }
    }
}
