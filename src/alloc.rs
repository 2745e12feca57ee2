//! The node allocator interface, and a volatile heap implementing it.

use crate::{error::Error, persist::CACHE_LINE};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::{
    alloc::{self, Layout},
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
    thread::{self, ThreadId},
};

/// Source of node memory.
///
/// `next_address` lets the active page table mark a page before the allocation that touches it has
/// happened. The following `allocate` of the same size, on the same thread, must return the peeked
/// address.
pub trait NodeAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error>;

    /// Returns memory obtained from `allocate`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Returns the address the next `allocate(size)` by the calling thread will return.
    fn next_address(&self, size: usize) -> Result<usize, Error>;

    /// Usable size of a live allocation, or 0 if `ptr` is not one.
    fn usable_size(&self, ptr: *const u8) -> usize;
}

/// Rounds `size` up to its size class, in bytes.
#[inline]
fn class_size(size: usize) -> usize {
    let lines = (size + CACHE_LINE - 1) / CACHE_LINE;
    lines.max(1) * CACHE_LINE
}

#[derive(Default)]
struct Heap {
    /// Freed blocks, by size class.
    free:   FxHashMap<usize, Vec<usize>>,
    /// Live block address to size class.
    live:   FxHashMap<usize, usize>,
    /// Blocks promised by `next_address`, by thread and size class.
    staged: FxHashMap<(ThreadId, usize), usize>,
}

impl Heap {
    fn take(&mut self, class: usize) -> Result<usize, Error> {
        if let Some(addr) = self.free.get_mut(&class).and_then(Vec::pop) {
            return Ok(addr);
        }
        let layout =
            Layout::from_size_align(class, CACHE_LINE).map_err(|_| Error::out_of_memory(class))?;
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            Err(Error::out_of_memory(class))
        } else {
            Ok(ptr as usize)
        }
    }
}

/// A size class heap on ordinary memory.
///
/// Blocks are cache line aligned and never returned to the system before the heap is dropped, so
/// freed memory is recycled by later allocations of the same size class.
#[derive(Default)]
pub struct VolatileHeap {
    heap: Mutex<Heap>,
}

impl Debug for VolatileHeap {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let heap = self.heap.lock();
        f.debug_struct("VolatileHeap")
            .field("live", &heap.live.len())
            .field("staged", &heap.staged.len())
            .field("free", &heap.free.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl VolatileHeap {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks currently allocated.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.heap.lock().live.len()
    }
}

impl NodeAllocator for VolatileHeap {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let class = class_size(size);
        let mut heap = self.heap.lock();
        let addr = match heap.staged.remove(&(thread::current().id(), class)) {
            Some(addr) => addr,
            None => heap.take(class)?,
        };
        let _prev = heap.live.insert(addr, class);
        debug_assert!(_prev.is_none(), "`VolatileHeap` handed out a live block");
        // never null, see `Heap::take`
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let mut heap = self.heap.lock();
        match heap.live.remove(&addr) {
            Some(class) => heap.free.entry(class).or_default().push(addr),
            None => debug_assert!(false, "`VolatileHeap::free` of an unknown block {:#x}", addr),
        }
    }

    fn next_address(&self, size: usize) -> Result<usize, Error> {
        let class = class_size(size);
        let key = (thread::current().id(), class);
        let mut heap = self.heap.lock();
        if let Some(&addr) = heap.staged.get(&key) {
            return Ok(addr);
        }
        let addr = heap.take(class)?;
        let _prev = heap.staged.insert(key, addr);
        Ok(addr)
    }

    fn usable_size(&self, ptr: *const u8) -> usize {
        self.heap
            .lock()
            .live
            .get(&(ptr as usize))
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for VolatileHeap {
    fn drop(&mut self) {
        let heap = self.heap.get_mut();
        let free = heap
            .free
            .drain()
            .flat_map(|(class, addrs)| addrs.into_iter().map(move |addr| (addr, class)));
        let live = heap.live.drain();
        let staged = heap.staged.drain().map(|((_, class), addr)| (addr, class));
        for (addr, class) in free.chain(live).chain(staged) {
            unsafe {
                alloc::dealloc(
                    addr as *mut u8,
                    Layout::from_size_align_unchecked(class, CACHE_LINE),
                )
            }
        }
    }
}
