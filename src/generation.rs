//! A thread's retired nodes, batched into generations.
//!
//! Generations are never freed before the store is dropped. They cycle from `free`, to `current`,
//! to `used` once closed and stamped with a timestamp vector, and back to `free` once a newer
//! vector dominates theirs and all their nodes are finalized. `used` is ordered oldest first.

use crate::{internal::ts_vec::TsVector, registry::EpochTs};
use std::{
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
};

/// Releases a retired node, called with the arguments given to
/// [`EpochThread::reclaim_object`](crate::EpochThread::reclaim_object).
pub type FinalizeFn = unsafe fn(ptr: *mut (), context: *mut (), tls: *mut ());

#[derive(Clone, Copy)]
pub struct ReclaimNode {
    pub ptr:      *mut (),
    pub context:  *mut (),
    pub tls:      *mut (),
    pub finalize: FinalizeFn,
}

impl Debug for ReclaimNode {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimNode")
            .field("ptr", &self.ptr)
            .field("context", &self.context)
            .field("tls", &self.tls)
            .finish()
    }
}

impl ReclaimNode {
    #[inline]
    unsafe fn finalize(self) {
        (self.finalize)(self.ptr, self.context, self.tls)
    }
}

#[derive(Debug)]
struct Generation {
    nodes:     Vec<ReclaimNode>,
    vector_ts: TsVector,
}

impl Generation {
    fn new(capacity: usize) -> Self {
        Generation {
            nodes:     Vec::with_capacity(capacity),
            vector_ts: TsVector::new(),
        }
    }

    /// Finalizes and forgets every node, returning how many there were.
    #[inline]
    unsafe fn finalize_all(&mut self) -> usize {
        let count = self.nodes.len();
        for node in self.nodes.drain(..) {
            node.finalize()
        }
        count
    }
}

/// Outcome of a collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Collected {
    pub generations: usize,
    pub nodes:       usize,
    /// The collecting thread's own entry in the stamp of the newest finalized generation, or 0.
    ///
    /// Every node this thread retired before that stamp has been finalized.
    pub own_ts:      EpochTs,
}

pub struct GenerationStore {
    all:      Vec<Generation>,
    free:     Vec<usize>,
    used:     VecDeque<usize>,
    current:  usize,
    capacity: usize,
}

impl Debug for GenerationStore {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationStore")
            .field("generations", &self.all.len())
            .field("free", &self.free.len())
            .field("used", &self.used.len())
            .field("current_len", &self.current_len())
            .finish()
    }
}

impl GenerationStore {
    /// Creates a store with `count` generations of `capacity` nodes, one of which is current.
    pub fn new(capacity: usize, count: usize) -> Self {
        assert!(
            capacity > 0 && count > 0,
            "a `GenerationStore` needs room for at least one node"
        );
        GenerationStore {
            all: (0..count).map(|_| Generation::new(capacity)).collect(),
            free: (1..count).rev().collect(),
            used: VecDeque::with_capacity(count),
            current: 0,
            capacity,
        }
    }

    /// Adds a node to the current generation, returning true if that filled it.
    #[inline]
    pub fn push(&mut self, node: ReclaimNode) -> bool {
        let current = &mut self.all[self.current].nodes;
        debug_assert!(
            current.len() < self.capacity,
            "pushed to a full generation, the generation change was skipped"
        );
        current.push(node);
        current.len() == self.capacity
    }

    #[inline]
    pub fn current_len(&self) -> usize {
        self.all[self.current].nodes.len()
    }

    /// Total number of generations, including the current one.
    #[inline]
    pub fn generation_count(&self) -> usize {
        self.all.len()
    }

    #[inline]
    pub fn used_len(&self) -> usize {
        self.used.len()
    }

    #[inline]
    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// Nodes retired but not finalized yet.
    pub fn garbage_count(&self) -> usize {
        self.current_len()
            + self
                .used
                .iter()
                .map(|&idx| self.all[idx].nodes.len())
                .sum::<usize>()
    }

    /// Stamps the current generation with `vector_ts` and appends it to the used list.
    ///
    /// There is no current generation until [`open_next`](Self::open_next) is called.
    #[inline]
    pub fn close_current(&mut self, vector_ts: &TsVector) {
        self.all[self.current].vector_ts.copy_from(vector_ts);
        self.used.push_back(self.current);
    }

    /// Makes a free generation current, allocating one if there is none. Returns true if a
    /// generation was allocated.
    pub fn open_next(&mut self) -> bool {
        match self.free.pop() {
            Some(idx) => {
                self.current = idx;
                false
            }
            None => {
                self.current = self.all.len();
                self.all.push(Generation::new(self.capacity));
                true
            }
        }
    }

    /// Finalizes, oldest first, every used generation whose vector is dominated by `newer`.
    ///
    /// Stops at the first generation that is not dominated, even if younger ones would be. `own`
    /// is the index of the owning thread in the stamps.
    ///
    /// # Safety
    ///
    /// `newer` must have been collected from the registry after every generation in the used list
    /// was closed, and the finalizers of the nodes must be safe to call once no thread can observe
    /// their nodes.
    pub unsafe fn collect(&mut self, newer: &TsVector, own: usize) -> Collected {
        let mut collected = Collected::default();
        while let Some(&oldest) = self.used.front() {
            let generation = &mut self.all[oldest];
            if !newer.dominates(&generation.vector_ts) {
                break;
            }
            collected.nodes += generation.finalize_all();
            collected.generations += 1;
            collected.own_ts = generation.vector_ts.get(own).copied().unwrap_or(0);
            let _oldest = self.used.pop_front();
            self.free.push(oldest);
        }
        collected
    }

    /// Finalizes every node of every generation, regardless of timestamps.
    ///
    /// # Safety
    ///
    /// No other thread may be able to observe any of the nodes.
    pub unsafe fn finalize_all(&mut self) -> usize {
        let mut count = 0;
        for generation in self.all.iter_mut() {
            count += generation.finalize_all();
        }
        let current = self.current;
        self.free.extend(self.used.drain(..));
        debug_assert!(!self.free.contains(&current));
        count
    }
}
