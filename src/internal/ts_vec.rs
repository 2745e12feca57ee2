use crate::registry::{is_active, EpochTs};
use core::ops::Deref;

/// Initial room for this many threads. Grows by doubling, never shrinks.
const START_SIZE: usize = 16;

/// A snapshot of every registered thread's timestamp, indexed by registration order.
#[derive(Clone, Debug)]
pub struct TsVector {
    data: Vec<EpochTs>,
}

impl Deref for TsVector {
    type Target = [EpochTs];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Default for TsVector {
    #[inline]
    fn default() -> Self {
        TsVector::new()
    }
}

impl TsVector {
    #[inline]
    pub fn new() -> Self {
        TsVector {
            data: Vec::with_capacity(START_SIZE),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Forgets the snapshot, keeping the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.data.clear()
    }

    #[inline]
    pub fn push(&mut self, ts: EpochTs) {
        self.data.push(ts)
    }

    /// Overwrites `self` with `other`, reusing the allocation.
    #[inline]
    pub fn copy_from(&mut self, other: &TsVector) {
        self.data.clear();
        self.data.extend_from_slice(&other.data)
    }

    /// Returns true if no thread recorded in `older` can still observe garbage retired before
    /// `older` was taken, judging by the later snapshot `self`.
    ///
    /// A thread does not block if it is now quiescent (even timestamp), or if it has since moved
    /// past the timestamp recorded in `older`. Threads registered after `older` was taken are
    /// absent from it and never block.
    #[inline]
    pub fn dominates(&self, older: &TsVector) -> bool {
        debug_assert!(
            self.len() >= older.len(),
            "newer timestamp vector is shorter than the older one, the registry lost a thread"
        );
        older
            .iter()
            .zip(self.iter())
            .all(|(&old, &new)| !is_active(new) || new > old)
    }
}

#[cfg(test)]
impl<'a> From<&'a [EpochTs]> for TsVector {
    fn from(slice: &'a [EpochTs]) -> Self {
        let mut result = TsVector::new();
        slice.iter().for_each(|&ts| result.push(ts));
        result
    }
}
