use crate::{
    alloc::{NodeAllocator, VolatileHeap},
    config::Config,
    error::Error,
    persist::{Persist, Simulated},
    registry::Registry,
    stats::Stats,
    thread::EpochThread,
    write_back::WriteBackBuffer,
};
use parking_lot::Mutex;
use std::fmt::{self, Debug, Formatter};

/// State shared by every thread taking part in reclamation: the thread registry, the write-back
/// buffer, and the node allocator.
///
/// Creating a `Global` initializes the system, dropping it shuts it down. Every [`EpochThread`]
/// borrows its `Global`, so all threads have shut down by the time it is dropped.
///
/// ```
/// use nvreclaim::Global;
///
/// let global = Global::default();
/// let mut thread = global.register();
/// thread.start();
/// thread.defer_drop(Box::new(42u64));
/// thread.end();
/// drop(thread);
/// ```
pub struct Global<P: Persist = Simulated, A: NodeAllocator = VolatileHeap> {
    config:     Config,
    registry:   Registry,
    write_back: WriteBackBuffer<P>,
    allocator:  A,
    stats:      Mutex<Stats>,
}

impl<P: Persist, A: NodeAllocator> Debug for Global<P, A> {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Global")
            .field("config", &self.config)
            .field("threads", &self.registry.len())
            .field("write_back", &self.write_back)
            .finish()
    }
}

impl Default for Global {
    /// The default configuration on simulated persistent memory.
    fn default() -> Self {
        let config = Config::default();
        let write_back =
            WriteBackBuffer::new(config.write_back_buckets, Simulated::default(), config.use_htm);
        Global {
            config,
            registry: Registry::new(),
            write_back,
            allocator: VolatileHeap::new(),
            stats: Mutex::default(),
        }
    }
}

impl<P: Persist, A: NodeAllocator> Global<P, A> {
    pub fn new(config: Config, persist: P, allocator: A) -> Result<Self, Error> {
        config.validate()?;
        let write_back = WriteBackBuffer::new(config.write_back_buckets, persist, config.use_htm);
        Ok(Global {
            config,
            registry: Registry::new(),
            write_back,
            allocator,
            stats: Mutex::default(),
        })
    }

    /// Registers the calling thread.
    ///
    /// The returned handle is the thread's view of the reclaimer. Its record stays in the registry,
    /// quiescent, after it is dropped.
    pub fn register(&self) -> EpochThread<'_, P, A> {
        let registration = self.registry.register();
        EpochThread::new(self, registration)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn write_back(&self) -> &WriteBackBuffer<P> {
        &self.write_back
    }

    #[inline]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Statistics of every thread that has shut down so far.
    pub fn stats(&self) -> Stats {
        self.stats.lock().clone()
    }

    pub(crate) fn merge_stats(&self, stats: &Stats) {
        self.stats.lock().merge(stats)
    }

    pub fn print_stats(&self) {
        if cfg!(feature = "stats") {
            self.stats.lock().print_summary();
            println!("{:#?}", self.write_back.counters());
        } else {
            println!("`nvreclaim/stats` feature is not enabled")
        }
    }
}
