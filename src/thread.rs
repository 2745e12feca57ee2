//! A registered thread's handle on the reclaimer.

use crate::{
    alloc::{NodeAllocator, VolatileHeap},
    error::Error,
    generation::{FinalizeFn, GenerationStore, ReclaimNode},
    global::Global,
    internal::ts_vec::TsVector,
    page_table::{Access, ActivePageTable},
    persist::{Persist, Simulated},
    registry::{is_active, EpochTs, Registration, ThreadEpochRecord},
    stats::ThreadStats,
    write_back::WriteBackBuffer,
};
use crossbeam_utils::Backoff;
use log::{debug, trace};
use std::{
    fmt::{self, Debug, Formatter},
    ptr::{self, NonNull},
    sync::atomic::{
        fence,
        Ordering::{Acquire, Relaxed, Release, SeqCst},
    },
};

/// Drops a `Box<T>` whose raw pointer was handed to the reclaimer.
unsafe fn drop_box<T>(ptr: *mut (), _: *mut (), _: *mut ()) {
    drop(Box::from_raw(ptr as *mut T))
}

/// The per thread part of the reclaimer, returned by [`Global::register`].
///
/// Nodes handed to [`reclaim_object`](Self::reclaim_object) are finalized once every thread that
/// was inside a critical section when they were retired has left it, and every link published
/// before the generation holding them was closed has been written back.
///
/// Dropping the handle ends any open critical section and blocks until all of the thread's garbage
/// has been finalized. It never returns while another handle, on any thread including this one,
/// stays inside a critical section that started before the garbage was retired. A `debug!` is
/// logged once the wait stops being short.
pub struct EpochThread<'g, P: Persist = Simulated, A: NodeAllocator = VolatileHeap> {
    global:      &'g Global<P, A>,
    record:      &'g ThreadEpochRecord,
    index:       usize,
    generations: GenerationStore,
    page_table:  ActivePageTable<'g, P, A>,
    /// Scratch space for timestamp snapshots.
    vector:      TsVector,
    stats:       ThreadStats,
}

impl<'g, P: Persist, A: NodeAllocator> Debug for EpochThread<'g, P, A> {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochThread")
            .field("index", &self.index)
            .field("record", &self.record)
            .field("generations", &self.generations)
            .field("page_table", &self.page_table)
            .finish()
    }
}

impl<'g, P: Persist, A: NodeAllocator> EpochThread<'g, P, A> {
    pub(crate) fn new(global: &'g Global<P, A>, registration: Registration<'g>) -> Self {
        let config = global.config();
        EpochThread {
            global,
            record: registration.record,
            index: registration.index,
            generations: GenerationStore::new(
                config.nodes_per_generation,
                config.generations_per_thread(),
            ),
            page_table: ActivePageTable::new(config, global.write_back(), global.allocator()),
            vector: TsVector::new(),
            stats: ThreadStats::default(),
        }
    }

    /// Position of this thread in the registry, and in every timestamp vector.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn global(&self) -> &'g Global<P, A> {
        self.global
    }

    #[inline]
    pub fn write_back(&self) -> &'g WriteBackBuffer<P> {
        self.global.write_back()
    }

    #[inline]
    pub fn ts(&self) -> EpochTs {
        self.record.ts(Relaxed)
    }

    /// Highest timestamp of this thread proven safe to forget by a collection pass.
    #[inline]
    pub fn largest_collected_ts(&self) -> EpochTs {
        self.record.largest_collected_ts()
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        is_active(self.ts())
    }

    /// Enters a critical section.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already inside one.
    #[inline]
    pub fn start(&mut self) {
        let ts = self.ts();
        assert!(
            !is_active(ts),
            "`EpochThread::start` called inside a critical section"
        );
        self.record.set_ts(ts + 1, Relaxed);
        // the new timestamp must be visible to collectors before any shared load below
        fence(SeqCst);
    }

    /// Leaves the critical section.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not inside one.
    #[inline]
    pub fn end(&mut self) {
        let ts = self.ts();
        assert!(
            is_active(ts),
            "`EpochThread::end` called outside of a critical section"
        );
        self.record.set_ts(ts + 1, Release);
    }

    #[inline]
    pub fn end_if_started(&mut self) {
        if self.is_started() {
            self.end()
        }
    }

    /// Runs `f` inside a critical section.
    #[inline]
    pub fn critical<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        self.start();
        let result = f(self);
        self.end_if_started();
        result
    }

    /// Retires a node. `finalize(ptr, context, tls)` is called once no thread can observe it.
    ///
    /// # Safety
    ///
    /// `ptr` must already be unreachable for threads that start a critical section from now on,
    /// and `finalize` must be safe to call with these arguments from this thread, at any later
    /// point up until the handle is dropped.
    pub unsafe fn reclaim_object(
        &mut self,
        ptr: *mut (),
        context: *mut (),
        tls: *mut (),
        finalize: FinalizeFn,
    ) {
        self.stats.deallocation_count();
        let full = self.generations.push(ReclaimNode {
            ptr,
            context,
            tls,
            finalize,
        });
        if unlikely!(full) {
            self.change_generation()
        }
    }

    /// Retires a boxed value, dropping it once no thread can observe it.
    ///
    /// The box must already be unreachable for threads that start a critical section from now on.
    #[inline]
    pub fn defer_drop<T: 'static>(&mut self, value: Box<T>) {
        unsafe {
            self.reclaim_object(
                Box::into_raw(value) as *mut (),
                ptr::null_mut(),
                ptr::null_mut(),
                drop_box::<T>,
            )
        }
    }

    /// Closes the current generation early, if it holds any node.
    pub fn flush(&mut self) {
        if self.generations.current_len() != 0 {
            self.change_generation()
        }
    }

    /// Finalizes whatever the current timestamps allow, without closing the current generation.
    pub fn scan(&mut self) {
        self.collect_vector();
        self.collect_generations();
    }

    /// Number of nodes retired but not finalized yet.
    #[inline]
    pub fn garbage_count(&self) -> usize {
        self.generations.garbage_count()
    }

    /// Number of generations owned by this thread.
    #[inline]
    pub fn generation_count(&self) -> usize {
        self.generations.generation_count()
    }

    /// Finalizes every retired node of this thread, ignoring timestamps.
    ///
    /// # Safety
    ///
    /// No other thread may be able to observe any retired node, which in practice means no other
    /// thread is running.
    pub unsafe fn finalize_all_unchecked(&mut self) {
        let count = self.generations.finalize_all();
        trace!("finalized {} nodes unchecked", count);
    }

    /// Allocates a node, first recording its page in the active page table.
    pub fn alloc_node(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let (ts, collected) = (self.ts(), self.largest_collected_ts());
        self.page_table
            .mark_page(0, size, ts, collected, Access::Insert)?;
        self.global.allocator().allocate(size)
    }

    /// Records the page of a node about to be unlinked.
    pub fn declare_unlink_node(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Error> {
        let (ts, collected) = (self.ts(), self.largest_collected_ts());
        self.page_table
            .mark_page(ptr.as_ptr() as usize, size, ts, collected, Access::Remove)
    }

    /// Returns a node's memory to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc_node`](Self::alloc_node) on the same `Global`, must not have
    /// been freed already, and no thread may be able to observe it.
    #[inline]
    pub unsafe fn free_node(&self, ptr: NonNull<u8>) {
        self.global.allocator().free(ptr)
    }

    #[inline]
    pub fn page_table(&self) -> &ActivePageTable<'g, P, A> {
        &self.page_table
    }

    #[inline]
    pub fn page_table_mut(&mut self) -> &mut ActivePageTable<'g, P, A> {
        &mut self.page_table
    }

    /// Snapshots every registered thread's timestamp into `self.vector`.
    ///
    /// The own entry is recorded two behind, so that garbage retired in the current critical
    /// section only waits for other threads.
    fn collect_vector(&mut self) {
        fence(SeqCst);
        self.vector.clear();
        for record in self.global.registry().iter() {
            if ptr::eq(record, self.record) {
                self.vector.push(record.ts(Relaxed).saturating_sub(2))
            } else {
                self.vector.push(record.ts(Acquire))
            }
        }
    }

    /// One collection pass with `self.vector`.
    fn collect_generations(&mut self) {
        self.stats.collect_count();
        let collected = unsafe { self.generations.collect(&self.vector, self.index) };
        if collected.generations > 0 {
            self.stats.collect_count_success();
            self.stats.finalized_per_collect(collected.nodes);
            // nodes retired after the newest finalized generation closed may still be waiting
            self.record.raise_largest_collected_ts(collected.own_ts);
        } else {
            self.stats.collect_count_fail();
        }
    }

    #[inline(never)]
    fn change_generation(&mut self) {
        self.collect_vector();
        self.generations.close_current(&self.vector);

        self.write_back().flush_all();
        self.stats.write_back_drains();

        self.collect_generations();
        if !self.generations.has_free()
            || self.generations.used_len() > self.global.config().max_nodes_per_thread
        {
            self.collect_vector();
            self.collect_generations();
        }

        if self.generations.open_next() {
            self.stats.new_generations_added();
            debug!(
                "thread {} allocated generation {}, {} nodes waiting",
                self.index,
                self.generations.generation_count(),
                self.generations.garbage_count()
            );
        }
    }
}

impl<'g, P: Persist, A: NodeAllocator> Drop for EpochThread<'g, P, A> {
    fn drop(&mut self) {
        self.end_if_started();
        self.flush();
        let backoff = Backoff::new();
        let mut reported = false;
        while self.garbage_count() != 0 {
            if !reported && backoff.is_completed() {
                reported = true;
                debug!(
                    "thread {} is shutting down, waiting on critical sections to end, {} nodes left",
                    self.index,
                    self.garbage_count()
                );
            }
            backoff.snooze();
            self.scan();
        }
        self.global.merge_stats(&self.stats.take());
        self.global.merge_stats(&self.page_table.take_stats());
        debug!("thread {} shut down", self.index);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use std::{
        cell::Cell,
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
    };

    fn global() -> Global {
        let config = Config {
            nodes_per_generation: 4,
            max_nodes_per_thread: 8,
            ..Config::default()
        };
        Global::new(config, Simulated::free(), VolatileHeap::new()).unwrap()
    }

    unsafe fn count(_: *mut (), context: *mut (), _: *mut ()) {
        let _ = (*(context as *const AtomicUsize)).fetch_add(1, SeqCst);
    }

    #[test]
    fn start_end_parity() {
        let global = global();
        let mut thread = global.register();
        assert_eq!(thread.ts(), 0);
        thread.start();
        assert!(thread.is_started());
        assert_eq!(thread.ts(), 1);
        thread.end();
        assert_eq!(thread.ts(), 2);
        thread.end_if_started();
        assert_eq!(thread.ts(), 2);
        let ts = thread.critical(|thread| thread.ts());
        assert_eq!(ts, 3);
        assert_eq!(thread.ts(), 4);
    }

    #[test]
    #[should_panic(expected = "called inside a critical section")]
    fn double_start() {
        let global = global();
        let mut thread = global.register();
        thread.start();
        thread.start();
    }

    #[test]
    #[should_panic(expected = "called outside of a critical section")]
    fn end_without_start() {
        let global = global();
        let mut thread = global.register();
        thread.end();
    }

    #[test]
    fn single_thread_reclaims_on_generation_change() {
        let global = global();
        let finalized = AtomicUsize::new(0);
        let context = &finalized as *const AtomicUsize as *mut ();
        let mut thread = global.register();

        thread.start();
        for _ in 0..3 {
            unsafe { thread.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
        }
        assert_eq!(thread.garbage_count(), 3);
        unsafe { thread.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
        // alone, the own entry recorded two behind dominates immediately
        assert_eq!(finalized.load(SeqCst), 4);
        assert_eq!(thread.garbage_count(), 0);
        assert_eq!(thread.largest_collected_ts(), 0);
        thread.end();

        // closed at ts 3, the generation is stamped with 1, which it does not dominate itself
        thread.critical(|thread| {
            for _ in 0..4 {
                unsafe { thread.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
            }
        });
        assert_eq!(finalized.load(SeqCst), 4);
        assert_eq!(thread.garbage_count(), 4);

        thread.scan();
        assert_eq!(finalized.load(SeqCst), 8);
        assert_eq!(thread.largest_collected_ts(), 1);
        assert_eq!(thread.generation_count(), 2);
    }

    #[test]
    fn stalled_reader_blocks_reclamation() {
        let global = global();
        let finalized = AtomicUsize::new(0);
        let context = &finalized as *const AtomicUsize as *mut ();
        let mut reader = global.register();
        let mut writer = global.register();

        reader.start();
        for _ in 0..8 {
            unsafe { writer.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
        }
        assert_eq!(finalized.load(SeqCst), 0);
        assert_eq!(writer.garbage_count(), 8);
        assert_eq!(writer.generation_count(), 3);

        writer.scan();
        assert_eq!(finalized.load(SeqCst), 0);

        reader.end();
        writer.scan();
        assert_eq!(finalized.load(SeqCst), 8);
        assert_eq!(writer.garbage_count(), 0);
    }

    #[test]
    fn flush_closes_partial_generation() {
        let global = global();
        let mut thread = global.register();
        let dropped = std::rc::Rc::new(Cell::new(false));

        struct SetOnDrop(std::rc::Rc<Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true)
            }
        }

        thread.defer_drop(Box::new(SetOnDrop(dropped.clone())));
        assert_eq!(thread.garbage_count(), 1);
        assert!(!dropped.get());
        thread.flush();
        assert!(dropped.get());
        assert_eq!(thread.garbage_count(), 0);

        // nothing to close
        thread.flush();
        assert_eq!(thread.garbage_count(), 0);
    }

    #[test]
    fn drop_finalizes_everything() {
        let global = global();
        let finalized = AtomicUsize::new(0);
        let context = &finalized as *const AtomicUsize as *mut ();
        {
            let mut thread = global.register();
            thread.start();
            for _ in 0..6 {
                unsafe { thread.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
            }
        }
        assert_eq!(finalized.load(SeqCst), 6);
        let stats = global.stats();
        if cfg!(feature = "stats") {
            assert_eq!(stats.deallocation_count().count(), 6);
        } else {
            assert_eq!(stats.deallocation_count().count(), 0);
        }
    }

    #[test]
    fn finalize_all_unchecked_ignores_readers() {
        let global = global();
        let finalized = AtomicUsize::new(0);
        let context = &finalized as *const AtomicUsize as *mut ();
        let mut reader = global.register();
        let mut writer = global.register();

        reader.start();
        for _ in 0..5 {
            unsafe { writer.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
        }
        assert_eq!(finalized.load(SeqCst), 0);
        unsafe { writer.finalize_all_unchecked() };
        assert_eq!(finalized.load(SeqCst), 5);
        assert_eq!(writer.garbage_count(), 0);
        reader.end();
    }

    #[test]
    fn waiting_garbage_keeps_its_page() {
        let global = global();
        let finalized = AtomicUsize::new(0);
        let context = &finalized as *const AtomicUsize as *mut ();
        let mut reader = global.register();
        let mut writer = global.register();
        let node = writer.alloc_node(32).unwrap();
        let page = writer.page_table().page_of(node.as_ptr() as usize);

        // the first generation closes while the reader is inside, stamped [1, 0]
        reader.start();
        for _ in 0..4 {
            unsafe { writer.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
        }
        reader.end();

        writer.critical(|writer| {
            writer.declare_unlink_node(node, 32).unwrap();
            unsafe { writer.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
        });
        for _ in 0..4 {
            writer.critical(|_| {});
        }
        assert_eq!(writer.ts(), 10);

        writer.scan();
        assert_eq!(finalized.load(SeqCst), 4);
        assert_eq!(writer.garbage_count(), 1);
        // only what the finalized generation covers is known to be collected
        assert_eq!(writer.largest_collected_ts(), 0);

        let elsewhere = NonNull::new((page + 4 * crate::config::PAGE_SIZE) as *mut u8).unwrap();
        writer.page_table_mut().request_clear();
        writer.declare_unlink_node(elsewhere, 32).unwrap();
        assert!(writer.page_table().contains(page));
        assert_eq!(writer.page_table().get(page).unwrap().last_ts_access(), 1);

        drop(writer);
        assert_eq!(finalized.load(SeqCst), 5);
        unsafe { global.allocator().free(node) };
    }

    #[test]
    fn drop_waits_for_readers() {
        let global = global();
        let finalized = AtomicUsize::new(0);
        let mut reader = global.register();
        reader.start();
        crossbeam_utils::thread::scope(|s| {
            let handle = s.spawn(|_| {
                let context = &finalized as *const AtomicUsize as *mut ();
                let mut writer = global.register();
                for _ in 0..3 {
                    unsafe { writer.reclaim_object(ptr::null_mut(), context, ptr::null_mut(), count) };
                }
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(finalized.load(SeqCst), 0);
            reader.end();
            handle.join().unwrap();
        })
        .unwrap();
        assert_eq!(finalized.load(SeqCst), 3);
    }

    #[test]
    fn alloc_marks_pages() {
        let global = global();
        let mut thread = global.register();
        let node = thread.alloc_node(32).unwrap();
        let page = thread.page_table().page_of(node.as_ptr() as usize);
        assert!(thread.page_table().contains(page));
        assert_eq!(thread.page_table().get(page).unwrap().last_ts_ins(), 0);

        thread.start();
        thread.declare_unlink_node(node, 32).unwrap();
        assert_eq!(thread.page_table().len(), 1);
        assert_eq!(thread.page_table().get(page).unwrap().last_ts_access(), 1);
        thread.end();

        assert_eq!(global.allocator().usable_size(node.as_ptr()), 64);
        unsafe { thread.free_node(node) };
        assert_eq!(global.allocator().usable_size(node.as_ptr()), 0);
    }
}
