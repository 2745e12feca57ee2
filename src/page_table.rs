//! The active page table, a per thread record of the pages that recently saw allocations or frees.
//!
//! Recovery only needs to look at pages that are present in some thread's table. Adding a page is
//! therefore made durable immediately, while its timestamps are advisory and never written back.
//!
//! Descriptors live in one flat array. Lookups only scan a window at its start, which doubles when
//! it fills up, up to `page_table_max_pages`, and halves again after a compaction leaves its upper
//! half empty.

use crate::{
    alloc::NodeAllocator,
    config::Config,
    error::Error,
    persist::Persist,
    registry::EpochTs,
    stats::{Stats, ThreadStats},
    write_back::WriteBackBuffer,
};
use log::{trace, warn};
use std::fmt::{self, Debug, Formatter};

/// Which kind of traffic touched a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// A node on the page is being allocated and linked in.
    Insert,
    /// A node on the page is being unlinked.
    Remove,
}

/// Timestamps of 0 mean "never".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PageDescriptor {
    page:           usize,
    last_ts_access: EpochTs,
    last_ts_ins:    EpochTs,
}

impl PageDescriptor {
    const EMPTY: PageDescriptor = PageDescriptor {
        page:           0,
        last_ts_access: 0,
        last_ts_ins:    0,
    };

    #[inline]
    fn is_empty(&self) -> bool {
        self.page == 0
    }

    #[inline]
    pub fn page(&self) -> usize {
        self.page
    }

    /// Timestamp of the latest removal from this page.
    #[inline]
    pub fn last_ts_access(&self) -> EpochTs {
        self.last_ts_access
    }

    /// Timestamp of the latest insertion into this page.
    #[inline]
    pub fn last_ts_ins(&self) -> EpochTs {
        self.last_ts_ins
    }

    #[inline]
    fn touch(&mut self, access: Access, ts: EpochTs) {
        let slot = match access {
            Access::Insert => &mut self.last_ts_ins,
            Access::Remove => &mut self.last_ts_access,
        };
        *slot = (*slot).max(ts);
    }

    /// A page is forgotten once neither direction of traffic is still recent.
    #[inline]
    fn is_stale(&self, clean_ts: EpochTs, curr_ts: EpochTs) -> bool {
        (self.last_ts_access == 0 || self.last_ts_access < clean_ts)
            && (self.last_ts_ins == 0 || self.last_ts_ins < curr_ts)
    }
}

pub struct ActivePageTable<'g, P, A> {
    descriptors:     Vec<PageDescriptor>,
    /// Number of leading descriptors searched.
    window:          usize,
    len:             usize,
    clear_requested: bool,

    page_mask:       usize,
    clean_threshold: usize,
    default_window:  usize,
    max_pages:       usize,

    write_back: &'g WriteBackBuffer<P>,
    allocator:  &'g A,
    stats:      ThreadStats,
}

impl<'g, P: Persist, A> Debug for ActivePageTable<'g, P, A> {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePageTable")
            .field("len", &self.len)
            .field("window", &self.window)
            .field("clear_requested", &self.clear_requested)
            .field("write_back", &self.write_back)
            .finish()
    }
}

impl<'g, P: Persist, A: NodeAllocator> ActivePageTable<'g, P, A> {
    pub fn new(config: &Config, write_back: &'g WriteBackBuffer<P>, allocator: &'g A) -> Self {
        ActivePageTable {
            descriptors: vec![PageDescriptor::EMPTY; config.page_table_default_window],
            window: config.page_table_default_window,
            len: 0,
            clear_requested: false,
            page_mask: !(config.page_size - 1),
            clean_threshold: config.page_table_clean_threshold,
            default_window: config.page_table_default_window,
            max_pages: config.page_table_max_pages,
            write_back,
            allocator,
            stats: ThreadStats::default(),
        }
    }

    /// Number of pages currently recorded.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of descriptor slots currently searched.
    #[inline]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Returns the page containing `addr`.
    #[inline]
    pub fn page_of(&self, addr: usize) -> usize {
        addr & self.page_mask
    }

    pub fn get(&self, page: usize) -> Option<&PageDescriptor> {
        self.descriptors[..self.window]
            .iter()
            .find(|d| !d.is_empty() && d.page == page)
    }

    #[inline]
    pub fn contains(&self, page: usize) -> bool {
        self.get(page).is_some()
    }

    /// Forces a compaction before the next mark.
    #[inline]
    pub fn request_clear(&mut self) {
        self.clear_requested = true
    }

    /// Records that the page of `addr` saw `access` at `current_ts`.
    ///
    /// If `addr` is 0, the page is the one the allocator's next allocation of `size` bytes lands
    /// on. `collect_ts` is the highest timestamp known to be reclaimed, used if the table has to
    /// be compacted first.
    ///
    /// Fails if the page is new and the table is at capacity even after compacting. Nothing is
    /// recorded then, and the caller must not proceed with the access.
    pub fn mark_page(
        &mut self,
        addr: usize,
        size: usize,
        current_ts: EpochTs,
        collect_ts: EpochTs,
        access: Access,
    ) -> Result<(), Error> {
        self.stats.page_marks();
        if unlikely!(self.clear_requested || self.len > self.clean_threshold) {
            self.compact(collect_ts, current_ts);
        }

        let addr = if addr == 0 {
            self.allocator.next_address(size)?
        } else {
            addr
        };
        let page = self.page_of(addr);

        let mut first_empty = None;
        for (idx, descriptor) in self.descriptors[..self.window].iter_mut().enumerate() {
            if descriptor.is_empty() {
                first_empty = first_empty.or(Some(idx));
            } else if descriptor.page == page {
                self.stats.page_hits();
                descriptor.touch(access, current_ts);
                return Ok(());
            }
        }

        let idx = match first_empty {
            Some(idx) => idx,
            None => self.grow()?,
        };
        let descriptor = &mut self.descriptors[idx];
        *descriptor = PageDescriptor {
            page,
            ..PageDescriptor::EMPTY
        };
        descriptor.touch(access, current_ts);
        self.len += 1;
        self.write_back
            .persist()
            .flush_line_blocking(descriptor as *const PageDescriptor as usize);
        Ok(())
    }

    /// Doubles the window, returning the first slot of the new half.
    #[cold]
    fn grow(&mut self) -> Result<usize, Error> {
        if self.window >= self.max_pages {
            warn!(
                "active page table is full at {} pages, refusing to record another",
                self.max_pages
            );
            return Err(Error::page_table_full(self.max_pages));
        }
        let first_new = self.window;
        self.window = (self.window * 2).min(self.max_pages);
        if self.descriptors.len() < self.window {
            self.descriptors.resize(self.window, PageDescriptor::EMPTY);
        }
        Ok(first_new)
    }

    /// Forgets every page that is stale with respect to `clean_ts` and `curr_ts`.
    ///
    /// Every pending link write-back is completed first, since a forgotten page is no longer
    /// looked at by recovery.
    pub fn compact(&mut self, clean_ts: EpochTs, curr_ts: EpochTs) {
        self.write_back.flush_all();
        self.stats.write_back_drains();

        let mut evicted = 0;
        let mut highest = None;
        for (idx, descriptor) in self.descriptors[..self.window].iter_mut().enumerate() {
            if descriptor.is_empty() {
                continue;
            }
            if descriptor.is_stale(clean_ts, curr_ts) {
                *descriptor = PageDescriptor::EMPTY;
                evicted += 1;
            } else {
                highest = Some(idx);
            }
        }
        self.len -= evicted;
        self.clear_requested = false;

        let half = self.window / 2;
        if half >= self.default_window && highest.map_or(true, |idx| idx < half) {
            self.window = half;
        }
        self.stats.page_compactions(evicted);
        trace!(
            "active page table compacted, {} evicted, {} left, window {}",
            evicted,
            self.len,
            self.window
        );
    }

    pub(crate) fn take_stats(&mut self) -> Stats {
        self.stats.take()
    }
}
