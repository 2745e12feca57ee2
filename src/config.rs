//! Tunables for a [`Global`](crate::Global) instance.

use crate::error::Error;

/// Maximum number of nodes a thread is expected to keep retired. This is not a hard limit, but the
/// point after which a generation change works harder to reclaim memory.
pub const MAX_NODES_PER_THREAD: usize = 512;

/// Number of retired nodes batched into one generation.
pub const NODES_PER_GENERATION: usize = 64;

pub const WRITE_BACK_BUCKETS: usize = 32;

pub const PAGE_SIZE: usize = 65536;

pub const PAGE_TABLE_CLEAN_THRESHOLD: usize = 16;

pub const PAGE_TABLE_DEFAULT_WINDOW: usize = 32;

pub const PAGE_TABLE_MAX_PAGES: usize = 8192;

/// Configuration shared by every thread of a [`Global`](crate::Global).
///
/// The defaults are sized for a few hundred threads retiring nodes of a lock-free structure.
///
/// ```
/// use nvreclaim::Config;
///
/// let config = Config {
///     nodes_per_generation: 32,
///     ..Config::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.generations_per_thread(), 16);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub nodes_per_generation: usize,
    pub max_nodes_per_thread: usize,

    /// Number of buckets in the write-back buffer.
    pub write_back_buckets: usize,

    /// Granularity of the active page table. Must be a power of two.
    pub page_size: usize,

    /// Page table occupancy above which the table is compacted before the next mark.
    pub page_table_clean_threshold: usize,

    /// Initial, and minimum, number of page table slots searched.
    pub page_table_default_window: usize,

    /// Absolute capacity of a page table. Marking a new page beyond it is an error.
    pub page_table_max_pages: usize,

    /// Attempt hardware transactions when publishing links. Ignored when unsupported.
    pub use_htm: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nodes_per_generation:       NODES_PER_GENERATION,
            max_nodes_per_thread:       MAX_NODES_PER_THREAD,
            write_back_buckets:         WRITE_BACK_BUCKETS,
            page_size:                  PAGE_SIZE,
            page_table_clean_threshold: PAGE_TABLE_CLEAN_THRESHOLD,
            page_table_default_window:  PAGE_TABLE_DEFAULT_WINDOW,
            page_table_max_pages:       PAGE_TABLE_MAX_PAGES,
            use_htm:                    true,
        }
    }
}

impl Config {
    /// Number of generations each thread allocates up front.
    #[inline]
    pub fn generations_per_thread(&self) -> usize {
        (self.max_nodes_per_thread / self.nodes_per_generation).max(1)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.nodes_per_generation == 0 {
            return Err(Error::invalid_config("`nodes_per_generation` must be non-zero"));
        }
        if self.max_nodes_per_thread < self.nodes_per_generation {
            return Err(Error::invalid_config(
                "`max_nodes_per_thread` must hold at least one generation",
            ));
        }
        if self.write_back_buckets == 0 {
            return Err(Error::invalid_config("`write_back_buckets` must be non-zero"));
        }
        if !self.page_size.is_power_of_two() {
            return Err(Error::invalid_config("`page_size` must be a power of two"));
        }
        if self.page_table_default_window == 0
            || self.page_table_default_window > self.page_table_max_pages
        {
            return Err(Error::invalid_config(
                "`page_table_default_window` must be in 1..=`page_table_max_pages`",
            ));
        }
        Ok(())
    }
}
