//! Statistics collection. Enabled with `--features stats`.
//!
//! Every thread records into its own [`Stats`], which is merged into the totals of its
//! [`Global`](crate::Global) when the thread's handle is dropped. Without the feature, recording
//! compiles to nothing and the totals stay zero.

use std::fmt::{self, Debug, Formatter};

#[derive(Copy, Clone, Default, Debug)]
struct MinMaxTotal {
    min:   u64,
    max:   u64,
    total: u64,
}

#[derive(Clone, Default)]
pub struct Size {
    min_max_total: Option<MinMaxTotal>,
    count:         u64,
}

impl Debug for Size {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Size")
            .field("count", &self.count)
            .field("min", &self.min_max_total.map(|x| x.min))
            .field("max", &self.min_max_total.map(|x| x.max))
            .field("total", &self.min_max_total.map(|x| x.total))
            .field(
                "avg",
                &self
                    .min_max_total
                    .map(|x| x.total as f64 / self.count as f64),
            )
            .finish()
    }
}

impl Size {
    fn record(&mut self, size: u64) {
        self.count += 1;
        if let Some(ref mut min_max_total) = &mut self.min_max_total {
            min_max_total.min = min_max_total.min.min(size);
            min_max_total.max = min_max_total.max.max(size);
            min_max_total.total += size;
        } else {
            self.min_max_total = Some(MinMaxTotal {
                min:   size,
                max:   size,
                total: size,
            });
        }
    }

    fn merge(&mut self, rhs: &Self) {
        self.count += rhs.count;
        self.min_max_total = match (self.min_max_total, rhs.min_max_total) {
            (Some(a), Some(b)) => Some(MinMaxTotal {
                min:   a.min.min(b.min),
                max:   a.max.max(b.max),
                total: a.total + b.total,
            }),
            (a, b) => a.or(b),
        };
    }

    /// Number of recorded samples.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of all recorded samples.
    #[inline]
    pub fn total(&self) -> u64 {
        self.min_max_total.unwrap_or_default().total
    }
}

#[derive(Clone, Default, Debug)]
pub struct Event {
    count: u64,
}

impl Event {
    fn happened(&mut self) {
        self.count += 1
    }

    fn merge(&mut self, rhs: &Self) {
        self.count += rhs.count
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }
}

macro_rules! stats_func {
    ($(#[$attr:meta])* $name:ident: Event) => {
        $(#[$attr])*
        #[inline]
        pub fn $name(&self) -> &Event {
            &self.$name
        }
    };
    ($(#[$attr:meta])* $name:ident: Size) => {
        $(#[$attr])*
        #[inline]
        pub fn $name(&self) -> &Size {
            &self.$name
        }
    };
}

macro_rules! stats_record {
    ($name:ident: Event) => {
        #[inline]
        pub(crate) fn $name(&mut self) {
            if cfg!(feature = "stats") {
                self.0.$name.happened()
            }
        }
    };
    ($name:ident: Size) => {
        #[inline]
        pub(crate) fn $name(&mut self, size: usize) {
            if cfg!(feature = "stats") {
                self.0.$name.record(size as u64)
            }
        }
    };
}

macro_rules! stats {
    ($($(#[$attr:meta])* $names:ident: $kinds:tt),* $(,)*) => {
        #[derive(Clone, Default, Debug)]
        pub struct Stats {
            $($names: $kinds),*
        }

        impl Stats {
            pub(crate) fn merge(&mut self, rhs: &Self) {
                $(self.$names.merge(&rhs.$names));*
            }

            $(stats_func!{$(#[$attr])* $names: $kinds})*
        }

        /// The recording side of a [`Stats`], owned by one thread.
        #[derive(Default, Debug)]
        pub(crate) struct ThreadStats(Stats);

        impl ThreadStats {
            $(stats_record!{$names: $kinds})*

            /// Returns everything recorded so far, and starts over.
            pub(crate) fn take(&mut self) -> Stats {
                std::mem::take(&mut self.0)
            }
        }
    };
}

stats! {
    /// A generation had to be allocated because none was free.
    new_generations_added:    Event,

    /// A collection pass.
    collect_count:            Event,

    /// A collection pass that finalized at least one generation.
    collect_count_success:    Event,

    /// A collection pass that finalized nothing.
    collect_count_fail:       Event,

    /// A node handed to the reclaimer.
    deallocation_count:       Event,

    /// Number of nodes finalized per successful collection pass.
    finalized_per_collect:    Size,

    /// A full drain of the write-back buffer before a generation was closed or pages forgotten.
    write_back_drains:        Event,

    /// A call to mark a page in the active page table.
    page_marks:               Event,

    /// A page mark that found the page already present.
    page_hits:                Event,

    /// Number of descriptors evicted per page table compaction.
    page_compactions:         Size,
}

impl Stats {
    pub fn print_summary(&self) {
        println!("{:#?}", self);

        let passes = self.collect_count.count;
        println!(
            "{:>12}: {:>12} {:>9}: {:.4} {:>13}: {:.4}",
            "collections",
            passes,
            "succ rate",
            self.collect_count_success.count as f64 / passes as f64,
            "freed avg",
            self.finalized_per_collect.total() as f64 / self.finalized_per_collect.count as f64
        );
        println!(
            "{:>12}: {:>12} {:>9}: {:.4} {:>13}: {:.4}",
            "page marks",
            self.page_marks.count,
            "hit rate",
            self.page_hits.count as f64 / self.page_marks.count as f64,
            "evict avg",
            self.page_compactions.total() as f64 / self.page_compactions.count as f64
        );
    }
}
