//! Public surface and process-wide singleton/thread registry (`spec.md` §6).
//!
//! Grounded in `original_source/src/gc.c` / `include/gc.h`: a single
//! process-wide `GlobalAllocator`/`Collector` pair, created by `init` and
//! destroyed by `deinit`, with one `LocalAllocator` per attached thread. The
//! singleton lives in a `static mut`, the same shape the teacher crate's
//! `gc_info_table.rs` uses for its own process-wide `GC_TABLE` — appropriate
//! here too, since this crate (like that one) is a single-process, manually
//! lifecycle-managed library rather than something that can lean on `once_cell`
//! plus a `Mutex<T>` (the lock must be releasable mid-collection around
//! finalizer calls, which a `Mutex<T>` guard can't express across an arbitrary
//! callback).

use crate::chunk::Chunk;
use crate::collector::{Collector, CollectCallback};
use crate::config::GcConfig;
use crate::constants::{round_up, LARGE_OBJECT_SIZE, WORD_SIZE};
use crate::error::fatal;
use crate::global_allocator::{GlobalAllocator, Stats};
use crate::lock::GcLock;
use crate::local_allocator::LocalAllocator;
use crate::object::{Finalizer, Object};
use std::cell::Cell;

struct Gc {
    lock: GcLock,
    global: Box<GlobalAllocator>,
    collector: Collector,
    locals: Vec<*mut LocalAllocator>,
}

unsafe impl Send for Gc {}

static mut GC: Option<Gc> = None;

unsafe fn gc() -> &'static Gc {
    GC.as_ref()
        .unwrap_or_else(|| fatal("conservo: not initialized — call init() before using the heap"))
}

pub(crate) unsafe fn gc_mut() -> &'static mut Gc {
    GC.as_mut()
        .unwrap_or_else(|| fatal("conservo: not initialized — call init() before using the heap"))
}

impl Gc {
    fn global_ptr(&mut self) -> *mut GlobalAllocator {
        self.global.as_mut() as *mut GlobalAllocator
    }
}

thread_local! {
    static CURRENT_LOCAL: Cell<*mut LocalAllocator> = Cell::new(core::ptr::null_mut());
}

/// Opaque handle returned by [`attach_thread`] and consumed by
/// [`detach_thread`]. Carries no data the host can inspect; it exists only so
/// `detach_thread` is matched to the `attach_thread` call that created the
/// registration.
pub struct ThreadHandle(*mut LocalAllocator);

unsafe impl Send for ThreadHandle {}

/// `spec.md` §6 `init`. `initial_size` must be at least twice `BLOCK_SIZE`
/// and a multiple of it; maximum heap size and the collection-trigger
/// divisor come from `GC_MAXIMUM_HEAP_SIZE`/`GC_FREE_SPACE_DIVISOR`
/// (`crate::config::GcConfig::from_env`).
pub fn init(initial_size: usize) {
    init_with_config(initial_size, GcConfig::from_env());
}

/// Convenience entry point that also takes the initial heap size from
/// `GC_INITIAL_HEAP_SIZE` (or the compiled-in default), for hosts that would
/// rather not compute it themselves.
pub fn init_from_env() {
    let config = GcConfig::from_env();
    init_with_config(config.initial_heap_size, config);
}

fn init_with_config(initial_size: usize, config: GcConfig) {
    unsafe {
        if GC.is_some() {
            fatal("conservo: init() called while already initialized");
        }

        let mut global = Box::new(GlobalAllocator::new(initial_size, &config));
        let global_ptr = global.as_mut() as *mut GlobalAllocator;
        let collector = Collector::new(global_ptr, crate::segments::default_provider());

        GC = Some(Gc {
            lock: GcLock::new(),
            global,
            collector,
            locals: Vec::new(),
        });
    }
}

/// `spec.md` §6 `deinit`. Host must have detached every thread first; any
/// `LocalAllocator` left registered is leaked along with the heap mappings
/// (matching `spec.md`'s guarantee that heap pages may remain mapped after
/// `deinit`, so the process can still shut down cleanly even if a thread
/// forgot to detach).
pub fn deinit() {
    unsafe {
        GC = None;
    }
}

/// `spec.md` §6 `attach_thread`. Must be called once per thread before that
/// thread allocates; registers a fresh `LocalAllocator` under the global
/// lock and stores it in thread-local storage for `malloc`/`free` to find.
pub fn attach_thread() -> ThreadHandle {
    unsafe {
        let gc = gc_mut();
        let global_ptr = gc.global_ptr();
        let lock_ptr = &gc.lock as *const GcLock;

        let local = Box::into_raw(Box::new(LocalAllocator::new(global_ptr, lock_ptr)));

        gc.lock.lock();
        gc.locals.push(local);
        gc.lock.unlock();

        CURRENT_LOCAL.with(|cell| cell.set(local));
        ThreadHandle(local)
    }
}

/// `spec.md` §6 `detach_thread`. Removes the thread's `LocalAllocator` from
/// the global registry and drops it; the thread must not allocate again
/// without a fresh `attach_thread` call.
pub fn detach_thread(handle: ThreadHandle) {
    unsafe {
        let gc = gc_mut();
        gc.lock.lock();
        gc.locals.retain(|&candidate| candidate != handle.0);
        gc.lock.unlock();

        CURRENT_LOCAL.with(|cell| cell.set(core::ptr::null_mut()));
        drop(Box::from_raw(handle.0));
    }
}

fn current_local() -> *mut LocalAllocator {
    CURRENT_LOCAL.with(|cell| {
        let local = cell.get();
        if local.is_null() {
            fatal("conservo: thread not attached — call attach_thread() before allocating");
        }
        local
    })
}

/// `spec.md` §6 `in_heap`: whether `pointer` falls within either heap
/// region, small or large.
pub fn in_heap(pointer: *const u8) -> bool {
    unsafe { gc().global.in_heap(pointer) }
}

fn malloc_internal(size: usize, atomic: bool) -> *mut u8 {
    let rsize = round_up(size + core::mem::size_of::<Object>(), WORD_SIZE);

    unsafe {
        if rsize <= LARGE_OBJECT_SIZE {
            let local = &mut *current_local();
            local.allocate_small(size, atomic)
        } else {
            let gc = gc_mut();
            gc.lock.lock();
            let pointer = gc.global.allocate_large(size, atomic, |g| crate::collector::try_collect(g));
            gc.lock.unlock();
            pointer
        }
    }
}

/// `spec.md` §6 `malloc`: a scannable allocation (the mark phase treats its
/// payload as conservative root data once reached).
pub fn malloc(size: usize) -> *mut u8 {
    malloc_internal(size, false)
}

/// `spec.md` §6 `malloc_atomic`: an allocation the collector never scans for
/// outgoing pointers, for payloads known to hold no references (strings,
/// numeric buffers).
pub fn malloc_atomic(size: usize) -> *mut u8 {
    malloc_internal(size, true)
}

unsafe fn header_of(gc: &Gc, pointer: *mut u8) -> *mut u8 {
    if gc.global.in_small_heap(pointer as *const u8) {
        Object::from_mutator_address(pointer) as *mut u8
    } else {
        Chunk::from_mutator_address(pointer) as *mut u8
    }
}

unsafe fn mutator_size_of(gc: &Gc, pointer: *mut u8) -> usize {
    if gc.global.in_small_heap(pointer as *const u8) {
        Object::mutator_size(Object::from_mutator_address(pointer))
    } else {
        Chunk::payload_size(Chunk::from_mutator_address(pointer))
    }
}

unsafe fn is_atomic_of(gc: &Gc, pointer: *mut u8) -> bool {
    if gc.global.in_small_heap(pointer as *const u8) {
        Object::is_atomic(Object::from_mutator_address(pointer))
    } else {
        Chunk::is_atomic(Chunk::from_mutator_address(pointer))
    }
}

/// `spec.md` §6 `free`. A no-op for small objects — those are reclaimed only
/// by the next sweep — but immediate and additive to sweep-driven
/// reclamation for large objects (`spec.md` §9 Open Question resolution).
pub fn free(pointer: *mut u8) {
    if pointer.is_null() {
        return;
    }
    unsafe {
        let gc = gc_mut();
        if gc.global.in_large_heap(pointer as *const u8) {
            gc.lock.lock();
            gc.global.deallocate_large(pointer);
            gc.lock.unlock();
        }
    }
}

/// `spec.md` §6 `realloc`. Never shrinks or moves an allocation that already
/// has enough room; otherwise allocates fresh, copies the overlapping
/// prefix, carries over any registered finalizer, and frees the original.
pub fn realloc(pointer: *mut u8, size: usize) -> *mut u8 {
    if pointer.is_null() {
        return malloc(size);
    }
    if size == 0 {
        free(pointer);
        return core::ptr::null_mut();
    }

    let (current, atomic) = unsafe {
        let gc = gc();
        (mutator_size_of(gc, pointer), is_atomic_of(gc, pointer))
    };
    if current >= size {
        return pointer;
    }

    let new_pointer = malloc_internal(size, atomic);
    unsafe {
        core::ptr::copy_nonoverlapping(pointer, new_pointer, current.min(size));

        let gc = gc_mut();
        let old_header = header_of(gc, pointer);
        let new_header = header_of(gc, new_pointer);
        if let Some(finalizer) = gc.global.finalizers_mut().delete(old_header) {
            gc.global.finalizers_mut().insert(new_header, finalizer);
        }
    }

    free(pointer);
    new_pointer
}

/// `spec.md` §6 `collect_once`: runs exactly one full mark/sweep cycle,
/// regardless of `should_collect`. Returns `false` if a collection was
/// already in progress on this thread (re-entrant call).
pub fn collect_once() -> bool {
    unsafe {
        let gc = gc_mut();
        gc.lock.lock();
        let ran = gc.collector.collect(&gc.lock, &gc.locals);
        gc.lock.unlock();
        ran
    }
}

/// `spec.md` §6 `collect`: the host-facing entry point for an unconditional
/// collection. Aliases `collect_once`.
pub fn collect() -> bool {
    collect_once()
}

/// `spec.md` §6 `register_collect_callback`: `callback` is invoked once per
/// collection cycle, during root seeding, so the host can supply its own
/// conservative roots (typically thread stacks) via [`add_roots`].
pub fn register_collect_callback(callback: CollectCallback) {
    unsafe {
        let gc = gc_mut();
        gc.lock.lock();
        gc.collector.set_collect_callback(callback);
        gc.lock.unlock();
    }
}

/// `spec.md` §6 `add_roots`. Intended to be called from within the
/// collect-callback registered through [`register_collect_callback`], while
/// the calling thread already holds the collection lock — this function
/// does not lock itself.
pub fn add_roots(top: *const u8, bottom: *const u8) {
    unsafe { gc_mut().collector.add_roots(top, bottom) };
}

/// `spec.md` §6 `register_finalizer`. `pointer` must be a live mutator
/// address previously returned by `malloc`/`malloc_atomic`/`allocate_large`.
pub fn register_finalizer(pointer: *mut u8, finalizer: Finalizer) {
    unsafe {
        let gc = gc_mut();
        gc.lock.lock();
        let header = header_of(gc, pointer);
        gc.global.finalizers_mut().insert(header, finalizer);
        gc.lock.unlock();
    }
}

/// `spec.md` §6 heap statistics.
pub fn stats() -> Stats {
    unsafe { gc().global.stats() }
}

/// Ambient convenience (`SPEC_FULL.md` §6): cumulative bytes ever handed out
/// by `malloc`/`malloc_atomic`/`allocate_large`, never decremented.
pub fn total_allocated_bytes() -> usize {
    unsafe { gc().global.total_allocated_bytes() }
}

/// Ambient convenience (`SPEC_FULL.md` §6): bytes currently reachable,
/// derived from the same walk `stats()` performs.
pub fn live_bytes() -> usize {
    let s = stats();
    s.small_object_bytes + s.large_object_bytes
}
