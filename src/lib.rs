//! Crash consistent epoch based memory reclamation for persistent memory data structures.
//!
//! `nvreclaim` lets lock free structures living in non volatile memory retire nodes while other
//! threads may still be reading them, and free them only once that is safe both for concurrent
//! readers and for recovery after a crash.
//!
//! # Examples
//!
//! Registering a thread and retiring a node:
//! ```
//! use nvreclaim::Global;
//!
//! let global = Global::default();
//! let mut thread = global.register();
//!
//! thread.critical(|thread| {
//!     // unlink the node from the shared structure here, then
//!     thread.defer_drop(Box::new([0u8; 64]));
//! });
//! ```
//!
//! Publishing a link whose write-back is deferred:
//! ```
//! # use nvreclaim::Global;
//! use std::{ptr, sync::atomic::AtomicPtr};
//!
//! #[repr(align(64))]
//! struct Node(u64);
//!
//! # let global = Global::default();
//! let head = AtomicPtr::new(ptr::null_mut());
//! let node = Box::into_raw(Box::new(Node(7)));
//! let published = unsafe {
//!     global
//!         .write_back()
//!         .try_link_and_publish(42, &head, ptr::null_mut(), node)
//! };
//! assert!(published);
//!
//! // make sure it is durable before depending on it
//! global.write_back().scan_for_key(42);
//! # unsafe { drop(Box::from_raw(node)) };
//! ```
//!
//! # Overview
//!
//! * [`Global`] owns the state every thread shares: the thread registry, the
//!   [`WriteBackBuffer`], and the [`NodeAllocator`].
//! * [`EpochThread`] is a registered thread's handle. Critical sections are bracketed by
//!   [`start`](EpochThread::start) and [`end`](EpochThread::end), and nodes are retired with
//!   [`reclaim_object`](EpochThread::reclaim_object).
//! * Retired nodes are batched into generations. A generation is only finalized after the write-back
//!   buffer has been drained and every thread that was in a critical section when it was closed has
//!   left that section.
//! * Every thread keeps an [`ActivePageTable`] of the pages that recently saw allocations or frees,
//!   so recovery only has to look at those.
//!
//! # Features
//!
//! * `htm`: publish links inside a hardware transaction when the CPU supports it. Requires a nightly
//!   compiler.
//! * `stats`: count reclamation events, see [`Global::print_stats`].

#![warn(macro_use_extern_crate)]
#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![cfg_attr(not(test), warn(unused_results))]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

#[macro_use]
mod internal;

pub mod alloc;
pub mod config;
pub mod error;
pub mod generation;
mod global;
pub mod page_table;
pub mod persist;
pub mod registry;
pub mod stats;
pub mod tagged;
mod thread;
pub mod write_back;

#[doc(inline)]
pub use nvreclaim_htm as htm;

pub use crate::{
    alloc::{NodeAllocator, VolatileHeap},
    config::Config,
    error::Error,
    generation::{FinalizeFn, ReclaimNode},
    global::Global,
    page_table::{Access, ActivePageTable},
    persist::{Persist, Simulated},
    tagged::Link,
    thread::EpochThread,
    write_back::{Counters, SlotState, WriteBackBuffer},
};
