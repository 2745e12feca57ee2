use nvreclaim::{tagged::Link, EpochThread, Error, Global, NodeAllocator, VolatileHeap};
use std::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{
        AtomicPtr, AtomicUsize,
        Ordering::{Acquire, Relaxed},
    },
};

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

// used to verify nodes are neither leaked nor finalized twice
static COUNT: AtomicUsize = AtomicUsize::new(0);

// nodes are cache line aligned, leaving the durability pending bit of every link free
#[repr(align(64))]
struct Node {
    value: usize,
    next:  *mut Node,
}

struct PStack {
    head: AtomicPtr<Node>,
    // key of every publication into `head`
    key:  u64,
}

/// Returns a popped node to the allocator once no thread can observe it.
unsafe fn release(ptr: *mut (), context: *mut (), _: *mut ()) {
    COUNT.fetch_sub(1, Relaxed);
    let allocator = &*(context as *const VolatileHeap);
    allocator.free(NonNull::new_unchecked(ptr as *mut u8))
}

impl PStack {
    const fn new(key: u64) -> Self {
        // null means the stack is empty
        PStack {
            head: AtomicPtr::new(ptr::null_mut()),
            key,
        }
    }

    /// Loads the head, making sure it is durable before anything depends on it.
    fn head(&self, thread: &EpochThread<'_>) -> *mut Node {
        let raw = self.head.load(Acquire);
        if let Link::Pending(_) = Link::decode(raw) {
            let _ = thread.write_back().scan_for_key(self.key);
        }
        Link::decode(raw).ptr()
    }

    fn push(&self, thread: &mut EpochThread<'_>, value: usize) -> Result<(), Error> {
        // the page of the node is recorded before the node exists
        let node = thread.alloc_node(mem::size_of::<Node>())?.cast::<Node>();
        COUNT.fetch_add(1, Relaxed);
        thread.critical(|thread| loop {
            let next = self.head(thread);
            unsafe { node.as_ptr().write(Node { value, next }) };
            let published = unsafe {
                thread
                    .write_back()
                    .try_link_and_publish(self.key, &self.head, next, node.as_ptr())
            };
            if published {
                return Ok(());
            }
        })
    }

    fn pop(&self, thread: &mut EpochThread<'_>) -> Result<Option<usize>, Error> {
        thread.critical(|thread| loop {
            let to_pop = self.head(thread);
            // if it is null, then the stack is empty, so return None
            let to_pop = match NonNull::new(to_pop) {
                Some(to_pop) => to_pop,
                None => return Ok(None),
            };

            // the node stays valid until the critical section ends
            let Node { value, next } = unsafe { ptr::read(to_pop.as_ptr()) };
            thread.declare_unlink_node(to_pop.cast(), mem::size_of::<Node>())?;
            let unlinked = unsafe {
                thread
                    .write_back()
                    .try_link_and_publish(self.key, &self.head, to_pop.as_ptr(), next)
            };
            if unlinked {
                let allocator = thread.global().allocator() as *const VolatileHeap as *mut ();
                unsafe {
                    thread.reclaim_object(to_pop.as_ptr() as *mut (), allocator, ptr::null_mut(), release)
                };
                return Ok(Some(value));
            }
        })
    }
}

fn main() -> Result<(), Error> {
    static LIST: PStack = PStack::new(0);
    const ITER_COUNT: usize = 200_000;

    let global = Global::default();
    crossbeam_utils::thread::scope(|s| {
        let t1 = s.spawn(|_| {
            let mut thread = global.register();
            let mut iters = 0;
            let mut total = 0;
            while iters < ITER_COUNT {
                if let Some(x) = LIST.pop(&mut thread)? {
                    total += x;
                    iters += 1;
                }
            }
            assert_eq!(total, (ITER_COUNT - 1) * ITER_COUNT / 2);
            println!("done t1");
            Ok::<_, Error>(())
        });
        let t0 = s.spawn(|_| {
            let mut thread = global.register();
            for x in 0..ITER_COUNT {
                LIST.push(&mut thread, x)?;
            }
            println!("done t0");
            Ok::<_, Error>(())
        });
        t0.join().unwrap()?;
        t1.join().unwrap()
    })
    .unwrap()?;

    let mut thread = global.register();
    assert_eq!(LIST.pop(&mut thread)?, None);
    drop(thread);
    assert_eq!(COUNT.load(Relaxed), 0);
    assert_eq!(global.allocator().live_count(), 0);
    global.print_stats();
    Ok(())
}
