//! A conservative, non-moving, mark-and-sweep garbage collector exposing a
//! malloc/free-compatible surface.
//!
//! The heap is split into two regions: a line-structured, Immix-style block
//! region for small and medium objects ([`block`], [`block_list`],
//! [`local_allocator`]), and an intrusive free-list region of variable-size
//! chunks for large objects ([`chunk`]). A single process-wide
//! [`GlobalAllocator`](global_allocator::GlobalAllocator) owns both regions
//! plus the finalizer table; each attached thread gets its own
//! [`LocalAllocator`](local_allocator::LocalAllocator), which bump-allocates
//! lock-free through a borrowed block until it needs another one from the
//! global allocator. Collection ([`collector`]) is stop-the-world,
//! conservative (no precise typing — every word-aligned word in a root
//! region or live object is treated as a possible interior pointer) and
//! triggered synchronously on the thread whose allocation request exhausted
//! the heap.
//!
//! See [`api`] for the public entry points: `init`, `attach_thread`,
//! `malloc`/`malloc_atomic`/`realloc`/`free`, `collect_once`, root
//! registration and finalizers.

pub mod block;
pub mod block_list;
pub mod chunk;
pub mod collector;
pub mod config;
pub mod constants;
pub mod error;
pub mod finalizers;
pub mod global_allocator;
pub mod local_allocator;
pub mod lock;
pub mod mmap;
pub mod object;
pub mod segments;
pub mod worklist;

pub mod api;

pub use api::{
    add_roots, attach_thread, collect, collect_once, deinit, detach_thread, free, in_heap, init,
    init_from_env, live_bytes, malloc, malloc_atomic, realloc, register_collect_callback,
    register_finalizer, stats, total_allocated_bytes, ThreadHandle,
};
pub use collector::CollectCallback;
pub use config::GcConfig;
pub use global_allocator::Stats;
pub use object::Finalizer;
