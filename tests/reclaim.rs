mod reclaim {
    use crossbeam_utils::thread;
    use nvreclaim::{Config, Global, Simulated, VolatileHeap};
    use parking_lot::Mutex;
    use std::{
        ptr,
        sync::atomic::{
            AtomicBool, AtomicPtr, AtomicU64, AtomicUsize,
            Ordering::{AcqRel, Acquire, Relaxed, SeqCst},
        },
    };

    const POISON: u64 = 0xdead_beef_dead_beef;

    fn global() -> Global {
        let config = Config {
            nodes_per_generation: 8,
            max_nodes_per_thread: 32,
            ..Config::default()
        };
        Global::new(config, Simulated::free(), VolatileHeap::new()).unwrap()
    }

    #[repr(align(64))]
    struct Node {
        value: AtomicU64,
    }

    /// Finalized nodes are poisoned and parked here instead of being freed, so a reader that was
    /// let through too early reads the poison instead of freed memory.
    struct Graveyard(Mutex<Vec<Box<Node>>>);

    unsafe fn bury(ptr: *mut (), context: *mut (), _: *mut ()) {
        let node = Box::from_raw(ptr as *mut Node);
        node.value.store(POISON, Relaxed);
        (*(context as *const Graveyard)).0.lock().push(node);
    }

    #[test]
    fn no_premature_reclaim() {
        const READER_COUNT: usize = 4;
        const WRITE_COUNT: usize = 20_000;

        let global = global();
        let graveyard = Graveyard(Mutex::new(Vec::new()));
        let shared = AtomicPtr::new(Box::into_raw(Box::new(Node {
            value: AtomicU64::new(0),
        })));
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            for _ in 0..READER_COUNT {
                s.spawn(|_| {
                    let mut thread = global.register();
                    let mut reads = 0u64;
                    while !done.load(Relaxed) {
                        thread.critical(|_| {
                            let node = unsafe { &*shared.load(Acquire) };
                            for _ in 0..16 {
                                assert_ne!(node.value.load(Relaxed), POISON);
                            }
                        });
                        reads += 1;
                    }
                    assert!(reads > 0);
                });
            }
            s.spawn(|_| {
                let mut thread = global.register();
                let context = &graveyard as *const Graveyard as *mut ();
                for i in 1..=WRITE_COUNT as u64 {
                    let new = Box::into_raw(Box::new(Node {
                        value: AtomicU64::new(i),
                    }));
                    thread.critical(|thread| {
                        let old = shared.swap(new, AcqRel);
                        unsafe { thread.reclaim_object(old as *mut (), context, ptr::null_mut(), bury) };
                    });
                }
                done.store(true, Relaxed);
            });
        })
        .unwrap();

        let buried = graveyard.0.lock().len();
        assert_eq!(buried, WRITE_COUNT);
        assert!(graveyard
            .0
            .lock()
            .iter()
            .all(|node| node.value.load(Relaxed) == POISON));
        unsafe { drop(Box::from_raw(shared.load(SeqCst))) };
    }

    #[test]
    fn every_retired_node_is_dropped_once() {
        const THREAD_COUNT: usize = 8;
        const ITER_COUNT: usize = 5_000;

        static LIVE: AtomicUsize = AtomicUsize::new(0);
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        struct Counted(#[allow(dead_code)] usize);
        impl Counted {
            fn new(x: usize) -> Self {
                let _ = LIVE.fetch_add(1, Relaxed);
                Counted(x)
            }
        }
        impl Drop for Counted {
            fn drop(&mut self) {
                let _ = LIVE.fetch_sub(1, Relaxed);
                let _ = DROPPED.fetch_add(1, Relaxed);
            }
        }

        let global = global();
        thread::scope(|s| {
            for t in 0..THREAD_COUNT {
                let global = &global;
                s.spawn(move |_| {
                    let mut thread = global.register();
                    for i in 0..ITER_COUNT {
                        thread.critical(|thread| {
                            thread.defer_drop(Box::new(Counted::new(t * ITER_COUNT + i)));
                        });
                        if i % 1_000 == 0 {
                            thread.scan();
                        }
                    }
                    // dropping the handle waits for everything to be finalized
                });
            }
        })
        .unwrap();

        assert_eq!(LIVE.load(SeqCst), 0);
        assert_eq!(DROPPED.load(SeqCst), THREAD_COUNT * ITER_COUNT);
        assert_eq!(global.registry().len(), THREAD_COUNT);
        assert_eq!(global.write_back().busy_count(), 0);
    }

    #[test]
    fn stats_are_merged_on_shutdown() {
        let global = global();
        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|_| {
                    let mut thread = global.register();
                    for i in 0..20 {
                        thread.defer_drop(Box::new(i));
                    }
                });
            }
        })
        .unwrap();

        let stats = global.stats();
        if cfg!(feature = "stats") {
            assert_eq!(stats.deallocation_count().count(), 40);
            assert!(stats.collect_count().count() >= stats.collect_count_success().count());
            assert!(stats.collect_count_success().count() > 0);
        } else {
            assert_eq!(stats.deallocation_count().count(), 0);
        }
    }
}
