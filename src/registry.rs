//! The list of every thread that ever registered with a [`Global`](crate::Global).
//!
//! Records are appended with a CAS on the tail's `next` link and are never unlinked until the
//! registry itself is dropped. That keeps enumeration lock free: a collector walking the list can
//! never land on a freed record, and the walk order, which is append order, is stable. The index
//! of a thread in that order is its index into every timestamp vector.

use crossbeam_utils::CachePadded;
use log::debug;
use std::{
    fmt::{self, Debug, Formatter},
    ptr,
    sync::atomic::{
        AtomicPtr, AtomicU64,
        Ordering::{self, AcqRel, Acquire, Relaxed},
    },
};

/// A thread's logical clock. Odd while inside a critical section, even while quiescent.
pub type EpochTs = u64;

/// Every thread starts quiescent at the beginning of time.
pub const FIRST_EPOCH: EpochTs = 0;

/// Returns true if `ts` belongs to a thread that is inside a critical section.
#[inline]
pub const fn is_active(ts: EpochTs) -> bool {
    ts % 2 == 1
}

/// The shared part of a thread's epoch state. Only the owning thread writes `ts`; any thread may
/// read it.
pub struct ThreadEpochRecord {
    ts:                   CachePadded<AtomicU64>,
    largest_collected_ts: CachePadded<AtomicU64>,
    next:                 CachePadded<AtomicPtr<ThreadEpochRecord>>,
}

impl Debug for ThreadEpochRecord {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEpochRecord")
            .field("ts", &self.ts(Relaxed))
            .field("largest_collected_ts", &self.largest_collected_ts())
            .finish()
    }
}

impl ThreadEpochRecord {
    fn new() -> Self {
        ThreadEpochRecord {
            ts:                   CachePadded::new(AtomicU64::new(FIRST_EPOCH)),
            largest_collected_ts: CachePadded::new(AtomicU64::new(FIRST_EPOCH)),
            next:                 CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    #[inline]
    pub fn ts(&self, o: Ordering) -> EpochTs {
        self.ts.load(o)
    }

    /// Overwrites the timestamp. Must only be called by the owning thread.
    #[inline]
    pub(crate) fn set_ts(&self, ts: EpochTs, o: Ordering) {
        self.ts.store(ts, o)
    }

    /// Highest timestamp of this thread that a collection pass has proven safe to forget.
    #[inline]
    pub fn largest_collected_ts(&self) -> EpochTs {
        self.largest_collected_ts.load(Relaxed)
    }

    /// Raises the high water mark to `ts`, never lowering it.
    #[inline]
    pub(crate) fn raise_largest_collected_ts(&self, ts: EpochTs) {
        let _prev = self.largest_collected_ts.fetch_max(ts, Relaxed);
    }

    #[inline]
    fn next(&self) -> Option<&ThreadEpochRecord> {
        // records are only freed when the registry is dropped
        unsafe { self.next.load(Acquire).as_ref() }
    }
}

/// A freshly appended record and its position in registration order.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub record: &'a ThreadEpochRecord,
    pub index:  usize,
}

/// Append only, lock free list of [`ThreadEpochRecord`]s.
pub struct Registry {
    head: CachePadded<AtomicPtr<ThreadEpochRecord>>,
}

impl Debug for Registry {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl Default for Registry {
    #[inline]
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    #[inline]
    pub fn new() -> Self {
        Registry {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Appends a new quiescent record at the tail of the list.
    ///
    /// Walks to the tail and CASes its `next` link from null. On failure the walk resumes from the
    /// record that won, so every retry makes progress for some thread.
    pub fn register(&self) -> Registration<'_> {
        let new = Box::into_raw(Box::new(ThreadEpochRecord::new()));
        let mut index = 0;
        let mut link: &AtomicPtr<ThreadEpochRecord> = &self.head;
        loop {
            let mut cur = link.load(Acquire);
            if cur.is_null() {
                match link.compare_exchange(ptr::null_mut(), new, AcqRel, Acquire) {
                    Ok(_) => break,
                    Err(winner) => cur = winner,
                }
            }
            // cur is non-null and owned by the registry
            link = unsafe { &(*cur).next };
            index += 1;
        }
        debug!("registered thread epoch record at index {}", index);
        Registration {
            record: unsafe { &*new },
            index,
        }
    }

    /// Iterates over every record in registration order.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: unsafe { self.head.load(Acquire).as_ref() },
        }
    }

    /// Number of registered threads. Linear in the number of threads.
    #[inline]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Relaxed).is_null()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let record = unsafe { Box::from_raw(cur) };
            cur = record.next.load(Relaxed);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Iter<'a> {
    next: Option<&'a ThreadEpochRecord>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a ThreadEpochRecord;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.next();
        Some(cur)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_utils::thread;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn shared_across_threads() {
        fn send_sync<T: Send + Sync>() {}
        send_sync::<Registry>();
        send_sync::<ThreadEpochRecord>();
    }

    #[test]
    fn parity() {
        assert!(!is_active(FIRST_EPOCH));
        assert!(is_active(1));
        assert!(!is_active(4));
        assert!(is_active(7));
    }

    #[test]
    fn register_in_order() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        let a = registry.register();
        let b = registry.register();
        let c = registry.register();
        assert_eq!((a.index, b.index, c.index), (0, 1, 2));
        assert_eq!(registry.len(), 3);

        b.record.set_ts(3, SeqCst);
        let ts: Vec<_> = registry.iter().map(|r| r.ts(SeqCst)).collect();
        assert_eq!(ts, vec![0, 3, 0]);
        assert!(ptr::eq(registry.iter().nth(2).unwrap(), c.record));
    }

    #[test]
    fn largest_collected_ts_is_monotonic() {
        let registry = Registry::new();
        let a = registry.register();
        a.record.raise_largest_collected_ts(6);
        a.record.raise_largest_collected_ts(4);
        assert_eq!(a.record.largest_collected_ts(), 6);
    }

    #[test]
    fn concurrent_register() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 64;

        let registry = Registry::new();
        let mut indices = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|_| {
                        (0..PER_THREAD)
                            .map(|_| registry.register().index)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        assert_eq!(registry.len(), THREADS * PER_THREAD);
        indices.sort_unstable();
        assert_eq!(indices, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    }
}
