//! The write-back buffer, a fixed size table of links that were published but whose cache lines
//! have not been written back yet.
//!
//! Publishing a link is a CAS on the link itself, bracketed by two transitions of a slot in the
//! bucket the caller's key hashes to:
//!
//! ```text
//!            reserve           target CAS ok           written back
//!    FREE ------------> PENDING -------------> BUSY ------------------> FREE
//!      ^                   |
//!      +-------------------+
//!        target CAS failed
//! ```
//!
//! Only the publishing thread moves its slot out of `FREE` and `PENDING`. Only the holder of the
//! bucket's write-back lock moves slots from `BUSY` to `FREE`, and only after it issued their
//! write-backs. While a slot is `PENDING` the link carries the
//! [`DURABILITY_PENDING`](crate::tagged::DURABILITY_PENDING) tag, so a reader that needs the link
//! to be durable can tell it has to write it back itself.
//!
//! All CAS retry loops below are lock free, but not wait free. A thread can be starved by an
//! adversarial scheduler that keeps changing unrelated bits of the same bitmap.

use crate::{
    internal::{
        slot_bitmap::{self as bitmap, Bitmap, BUSY, ENTRIES, FREE, PENDING},
        write_back_lock::WriteBackLock,
    },
    persist::Persist,
    tagged::Link,
};
use crossbeam_utils::{Backoff, CachePadded};
use log::trace;
use nvreclaim_htm::HardwareTx;
use std::{
    fmt::{self, Debug, Formatter},
    sync::atomic::{
        fence, AtomicPtr, AtomicU16, AtomicU64, AtomicUsize,
        Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst},
    },
};

/// Number of slots per bucket.
pub const ENTRIES_PER_BUCKET: usize = ENTRIES;

/// Modulus of the in-bucket hash of a key.
pub const KEY_HASH_MOD: u64 = 65536;

/// Number of times a hardware transaction is retried after a transient abort.
const HTM_RETRIES: usize = 3;

type BucketLock = lock_api::Mutex<WriteBackLock, ()>;

/// The state of one slot, as reported by [`WriteBackBuffer::slot_states`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free,
    /// Reserved, the link is not published yet.
    Pending,
    /// Published, waiting to be written back.
    Busy,
}

impl SlotState {
    #[inline]
    fn from_bits(bits: Bitmap) -> Self {
        match bits {
            FREE => SlotState::Free,
            PENDING => SlotState::Pending,
            BUSY => SlotState::Busy,
            _ => unreachable!("invalid write-back slot state {:#b}", bits),
        }
    }
}

/// Totals of slot traffic.
///
/// Once publishers and flushers are quiescent, `published == written_back + busy_count()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Links published, by either path.
    pub published:     u64,
    /// Links published through a hardware transaction.
    pub htm_published: u64,
    /// Slots moved from `BUSY` to `FREE` by a write-back.
    pub written_back:  u64,
}

impl Counters {
    #[inline]
    fn merge(&mut self, rhs: Counters) {
        self.published += rhs.published;
        self.htm_published += rhs.htm_published;
        self.written_back += rhs.written_back;
    }
}

/// Type erased link target. Aligned like every valid link target.
#[repr(align(8))]
struct Erased;

#[derive(Default)]
struct Bucket {
    lock:          BucketLock,
    state:         AtomicU16,
    hashes:        [AtomicU16; ENTRIES],
    /// Address of the `AtomicPtr` each slot published into, or 0.
    addresses:     [AtomicUsize; ENTRIES],
    published:     AtomicU64,
    htm_published: AtomicU64,
    written_back:  AtomicU64,
}

impl Bucket {
    #[inline]
    fn state(&self) -> Bitmap {
        self.state.load(Acquire)
    }

    /// Moves slot `pos` to `to`. Must only be called by the thread that owns the slot.
    ///
    /// Retries until the CAS sees the live bitmap. Other threads only ever change other slots, so
    /// the new value is always valid.
    #[inline]
    fn transition(&self, pos: usize, to: Bitmap) {
        let backoff = Backoff::new();
        let mut state = self.state.load(Relaxed);
        loop {
            match self.state.compare_exchange_weak(
                state,
                bitmap::mark(state, pos, to),
                AcqRel,
                Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => state = actual,
            }
            backoff.spin();
        }
    }

    #[inline]
    fn counters(&self) -> Counters {
        Counters {
            published:     self.published.load(Relaxed),
            htm_published: self.htm_published.load(Relaxed),
            written_back:  self.written_back.load(Relaxed),
        }
    }
}

/// Defers and batches the write-back of freshly published links.
///
/// Shared by every thread of a [`Global`](crate::Global). It owns the [`Persist`] used by the rest
/// of the crate.
pub struct WriteBackBuffer<P> {
    buckets: Box<[CachePadded<Bucket>]>,
    persist: P,
    use_htm: bool,
}

impl<P: Persist> Debug for WriteBackBuffer<P> {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBackBuffer")
            .field("buckets", &self.buckets.len())
            .field("busy", &self.busy_count())
            .field("use_htm", &self.use_htm)
            .finish()
    }
}

impl<P: Persist> WriteBackBuffer<P> {
    /// Creates an empty buffer. `use_htm` is ignored if hardware transactions are unavailable.
    pub fn new(buckets: usize, persist: P, use_htm: bool) -> Self {
        assert!(buckets > 0, "a `WriteBackBuffer` needs at least one bucket");
        WriteBackBuffer {
            buckets: (0..buckets).map(|_| CachePadded::default()).collect(),
            persist,
            use_htm: use_htm && nvreclaim_htm::htm_supported(),
        }
    }

    #[inline]
    pub fn persist(&self) -> &P {
        &self.persist
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the bucket a key maps to.
    #[inline]
    pub fn bucket_of(&self, key: u64) -> usize {
        (key % self.buckets.len() as u64) as usize
    }

    #[inline]
    fn hash_of(&self, key: u64) -> u16 {
        ((key / self.buckets.len() as u64) % KEY_HASH_MOD) as u16
    }

    /// CASes `target` from `expected` to `new`, recording the write-back of `target`'s cache line
    /// in the bucket of `key`.
    ///
    /// Returns false if `target` did not hold `expected`, or if the bucket is full of links whose
    /// publication is still in flight. Either way nothing was changed and the caller should retry.
    ///
    /// # Safety
    ///
    /// `target` must stay valid until the bucket of `key` has been written back, and must not be
    /// freed while any thread may [`scan_for_key`](Self::scan_for_key) for `key`. In practice
    /// `target` lives in a node only ever freed through the epoch reclaimer, whose generation
    /// change drains the whole buffer. `T` must be aligned to at least 8 bytes.
    pub unsafe fn try_link_and_publish<T>(
        &self,
        key: u64,
        target: &AtomicPtr<T>,
        expected: *mut T,
        new: *mut T,
    ) -> bool {
        debug_assert!(
            !Link::decode(new).is_pending(),
            "attempt to publish an already tagged link"
        );
        let bucket = &self.buckets[self.bucket_of(key)];
        let hash = self.hash_of(key);
        let address = target as *const AtomicPtr<T> as usize;

        if self.use_htm && self.publish_htm(bucket, hash, address, target, expected, new) {
            return true;
        }

        // reserve a slot
        let mut state = bucket.state();
        let pos = loop {
            let pos = match bitmap::find_free(state) {
                Some(pos) => pos,
                None => {
                    if bitmap::has_busy(state) && self.flush_bucket(self.bucket_of(key)) {
                        state = bucket.state();
                        continue;
                    }
                    return false;
                }
            };
            match bucket.state.compare_exchange(
                state,
                bitmap::mark(state, pos, PENDING),
                AcqRel,
                Acquire,
            ) {
                Ok(_) => break pos,
                Err(actual) => state = actual,
            }
        };
        bucket.addresses[pos].store(address, Release);
        bucket.hashes[pos].store(hash, Release);

        let pending = Link::Pending(new).encode();
        if unlikely!(target
            .compare_exchange(expected, pending, AcqRel, Relaxed)
            .is_err())
        {
            bucket.addresses[pos].store(0, Release);
            bucket.transition(pos, FREE);
            return false;
        }

        bucket.transition(pos, BUSY);
        let _published = bucket.published.fetch_add(1, Relaxed);

        // a reader may have replaced the link in the meantime, in which case it is no longer ours
        // to untag
        let _ = target.compare_exchange(pending, new, AcqRel, Relaxed);
        true
    }

    /// The whole publication inside one hardware transaction. Returns false if the transaction
    /// could not commit, in which case nothing happened.
    #[inline]
    unsafe fn publish_htm<T>(
        &self,
        bucket: &Bucket,
        hash: u16,
        address: usize,
        target: &AtomicPtr<T>,
        expected: *mut T,
        new: *mut T,
    ) -> bool {
        let mut retries = 0;
        let htx = match HardwareTx::begin(|code| {
            retries += 1;
            code.is_retry() && retries <= HTM_RETRIES
        }) {
            Some(htx) => htx,
            None => return false,
        };
        let state = bucket.state.load(Relaxed);
        let pos = match bitmap::find_free(state) {
            Some(pos) => pos,
            None => htx.abort(),
        };
        if target.load(Relaxed) != expected {
            htx.abort()
        }
        bucket.state.store(bitmap::mark(state, pos, BUSY), Relaxed);
        bucket.addresses[pos].store(address, Relaxed);
        bucket.hashes[pos].store(hash, Relaxed);
        target.store(new, Relaxed);
        drop(htx);

        let _published = bucket.published.fetch_add(1, Relaxed);
        let _htm_published = bucket.htm_published.fetch_add(1, Relaxed);
        true
    }

    /// Writes back every `BUSY` slot of a bucket and frees them.
    ///
    /// Returns false without doing anything if another thread is already writing the bucket back.
    pub fn flush_bucket(&self, bucket_idx: usize) -> bool {
        let bucket = &self.buckets[bucket_idx];
        let guard = match bucket.lock.try_lock() {
            Some(guard) => guard,
            None => return false,
        };

        let mut already_flushed: Bitmap = 0;
        let mut state = bucket.state();
        loop {
            let busy = bitmap::busy_slots(state);
            for pos in bitmap::positions(busy & !already_flushed) {
                let address = bucket.addresses[pos].load(Acquire);
                if address != 0 {
                    self.persist.flush_line(address);
                }
                // a scanner must never follow the address of a freed slot
                bucket.addresses[pos].store(0, Release);
            }
            already_flushed |= busy;

            match bucket.state.compare_exchange(
                state,
                bitmap::clear_busy(state),
                AcqRel,
                Acquire,
            ) {
                Ok(_) => {
                    let freed = bitmap::positions(busy).count() as u64;
                    let _written_back = bucket.written_back.fetch_add(freed, Relaxed);
                    break;
                }
                Err(actual) => state = actual,
            }
        }

        self.persist.store_fence();
        drop(guard);
        fence(SeqCst);
        true
    }

    /// Writes back every bucket at least once.
    ///
    /// Every slot that was `BUSY` when this was called is durable when it returns. Slots published
    /// concurrently may or may not be.
    pub fn flush_all(&self) {
        const CHUNK: usize = 64;

        let backoff = Backoff::new();
        for first in (0..self.buckets.len()).step_by(CHUNK) {
            let len = (self.buckets.len() - first).min(CHUNK);
            // bit `i` is set while bucket `first + i` still has to be written back once
            let mut remaining = if len == CHUNK { !0u64 } else { (1u64 << len) - 1 };
            while remaining != 0 {
                let mut todo = remaining;
                while todo != 0 {
                    let bit = todo.trailing_zeros() as usize;
                    todo &= todo - 1;
                    if self.flush_bucket(first + bit) {
                        remaining &= !(1 << bit);
                    }
                }
                if remaining != 0 {
                    backoff.spin();
                }
            }
        }
        trace!("write-back buffer drained");
    }

    /// Makes sure a link published under `key` is durable before returning.
    ///
    /// If a `BUSY` slot matches, its bucket is written back. If a `PENDING` slot matches and its
    /// link is still tagged, the line the link points at is written back directly. Returns true if
    /// either happened.
    ///
    /// Matching is by a 16 bit hash, so unrelated keys may cause spurious write-backs.
    pub fn scan_for_key(&self, key: u64) -> bool {
        let bucket_idx = self.bucket_of(key);
        let bucket = &self.buckets[bucket_idx];
        let hash = self.hash_of(key);
        if likely!(bitmap::all_free(bucket.state())) {
            return false;
        }
        for pos in 0..ENTRIES {
            if bucket.hashes[pos].load(Acquire) != hash {
                continue;
            }
            let state = bucket.state();
            if bitmap::is_busy(state, pos) {
                let backoff = Backoff::new();
                while !self.flush_bucket(bucket_idx) {
                    backoff.snooze();
                }
                return true;
            } else if bitmap::is_pending(state, pos) {
                let address = bucket.addresses[pos].load(Acquire);
                if address == 0 {
                    continue;
                }
                // the publisher keeps the target alive while its slot is pending
                let target = unsafe { &*(address as *const AtomicPtr<Erased>) };
                if let Link::Pending(ptr) = Link::decode(target.load(Acquire)) {
                    self.persist.flush_line_blocking(ptr as usize);
                    return true;
                }
            }
        }
        false
    }

    /// Number of slots waiting to be written back.
    ///
    /// Only exact while no other thread publishes or flushes.
    pub fn busy_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bitmap::positions(bitmap::busy_slots(bucket.state())).count())
            .sum()
    }

    pub fn slot_states(&self, bucket_idx: usize) -> [SlotState; ENTRIES] {
        let state = self.buckets[bucket_idx].state();
        let mut result = [SlotState::Free; ENTRIES];
        for (pos, slot) in result.iter_mut().enumerate() {
            *slot = SlotState::from_bits(bitmap::get(state, pos));
        }
        result
    }

    pub fn bucket_counters(&self, bucket_idx: usize) -> Counters {
        self.buckets[bucket_idx].counters()
    }

    pub fn counters(&self) -> Counters {
        let mut result = Counters::default();
        for bucket in self.buckets.iter() {
            result.merge(bucket.counters());
        }
        result
    }
}
