//! End-to-end coverage of the public surface re-exported from `lib.rs`,
//! exercising the allocator/collector pair the way a host embedding this
//! crate would: `init`, `attach_thread`, `malloc`/`malloc_atomic`, `free`,
//! `register_finalizer`, `collect_once`, and the root-registration hooks.
//!
//! The heap is a single process-wide singleton, so every test here takes
//! `SCENARIO_LOCK` for its whole `init`..`deinit` lifecycle.

use conservo::block::{Block, LineHeader};
use conservo::chunk::Chunk;
use conservo::constants::{round_up, BLOCK_SIZE, LARGE_OBJECT_SIZE, WORD_SIZE};
use conservo::object::Object;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

static SCENARIO_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn small_object_lifecycle_reuses_address_after_collection() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    conservo::init(BLOCK_SIZE * 2);
    let handle = conservo::attach_thread();

    let p0 = conservo::malloc(64);
    assert!(!p0.is_null());

    unsafe {
        let header = Object::from_mutator_address(p0);
        assert_eq!(
            Object::size(header),
            round_up(64 + core::mem::size_of::<Object>(), WORD_SIZE)
        );
        assert!(!Object::is_atomic(header));
        assert!(!Object::is_marked(header));

        let block = Block::from_pointer(p0 as *const u8);
        let line_index = Block::line_index(block, header as *const u8);
        assert!(line_index >= 0);
        let line_header = Block::line_header(block, line_index as usize);
        assert!(LineHeader::contains_object(line_header));
        let expected_offset =
            (header as *const u8 as isize) - (Block::line(block, line_index as usize) as isize);
        assert_eq!(LineHeader::offset(line_header) as isize, expected_offset);
    }

    // No reference to p0 survives past this point, so collect_once reclaims
    // it and the next same-size malloc lands on the same freshly-recycled
    // block at the same offset.
    conservo::collect_once();
    let p1 = conservo::malloc(64);
    assert_eq!(p0, p1);

    conservo::detach_thread(handle);
    conservo::deinit();
}

#[test]
fn large_object_lifecycle_reuses_chunk_after_free() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    conservo::init(BLOCK_SIZE * 2);
    let handle = conservo::attach_thread();

    let q0 = conservo::malloc(LARGE_OBJECT_SIZE);
    assert!(!q0.is_null());
    unsafe {
        let chunk = Chunk::from_mutator_address(q0);
        assert!(Chunk::is_allocated(chunk));
    }

    conservo::free(q0);
    unsafe {
        let chunk = Chunk::from_mutator_address(q0);
        assert!(!Chunk::is_allocated(chunk));
    }

    let q1 = conservo::malloc(LARGE_OBJECT_SIZE);
    assert_eq!(q0, q1);

    conservo::detach_thread(handle);
    conservo::deinit();
}

#[test]
fn split_and_coalesce_merges_freed_neighbors() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    conservo::init(BLOCK_SIZE * 2);
    let handle = conservo::attach_thread();

    let a = conservo::malloc(8192);
    let b = conservo::malloc(8192);
    let c = conservo::malloc(8192);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    conservo::free(b);
    // a and c are deliberately left unrooted: the sweep that follows has to
    // reclaim all three now-garbage chunks and coalesce them into a single
    // free span, not just the explicitly freed middle one.
    conservo::collect_once();

    let merged = conservo::malloc(16000);
    assert!(!merged.is_null());

    conservo::detach_thread(handle);
    conservo::deinit();
}

#[test]
fn inner_pointer_keeps_object_alive() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    conservo::init(BLOCK_SIZE * 2);
    let handle = conservo::attach_thread();

    let p0 = conservo::malloc(200);
    assert!(!p0.is_null());

    // Only a pointer 57 bytes into the payload is kept as a root — the mark
    // phase has to walk the line header backwards to find the enclosing
    // object's header.
    let inner: *const u8 = unsafe { p0.add(57) };
    conservo::add_roots(
        &inner as *const *const u8 as *const u8,
        unsafe { (&inner as *const *const u8 as *const u8).add(core::mem::size_of::<usize>()) },
    );

    conservo::collect_once();

    assert_eq!(conservo::stats().small_object_count, 1);
    assert!(conservo::in_heap(p0 as *const u8));

    conservo::detach_thread(handle);
    conservo::deinit();
}

#[test]
fn finalizer_fires_exactly_once_for_unreachable_object() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    conservo::init(BLOCK_SIZE * 2);
    let handle = conservo::attach_thread();

    static FIRED: AtomicUsize = AtomicUsize::new(0);
    unsafe extern "C" fn record(_ptr: *mut u8) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }
    FIRED.store(0, Ordering::SeqCst);

    let p = conservo::malloc(32);
    conservo::register_finalizer(p, record);

    conservo::collect_once();
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);

    // The entry was removed from the finalizer table the first time it
    // fired, so a second collection must not invoke it again.
    conservo::collect_once();
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);

    conservo::detach_thread(handle);
    conservo::deinit();
}

static GROWTH_ROOTS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

unsafe extern "C" fn reroot_growth_survivors() {
    let roots = GROWTH_ROOTS.lock().unwrap();
    if !roots.is_empty() {
        let top = roots.as_ptr() as *const u8;
        let bottom = top.add(roots.len() * core::mem::size_of::<usize>());
        conservo::add_roots(top, bottom);
    }
}

#[test]
fn exhausting_heap_triggers_collect_then_grow() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    GROWTH_ROOTS.lock().unwrap().clear();

    conservo::init(BLOCK_SIZE * 2);
    let handle = conservo::attach_thread();
    conservo::register_collect_callback(reroot_growth_survivors);

    // Every allocation is kept reachable through GROWTH_ROOTS, re-supplied to
    // the collector on every cycle via the callback above. Since nothing is
    // ever garbage, a collection triggered by crossing the free-space
    // threshold reclaims nothing, and continuing to allocate past the
    // initial heap's total capacity forces grow_small to map a fresh region.
    for _ in 0..3000 {
        let p = conservo::malloc(32);
        assert!(!p.is_null());
        GROWTH_ROOTS.lock().unwrap().push(p as usize);
    }

    assert!(conservo::stats().total_heap_bytes > BLOCK_SIZE * 2);

    GROWTH_ROOTS.lock().unwrap().clear();
    conservo::detach_thread(handle);
    conservo::deinit();
}

#[test]
fn allocation_size_boundary_routes_to_correct_region() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    conservo::init(BLOCK_SIZE * 2);
    let handle = conservo::attach_thread();

    let header_size = core::mem::size_of::<Object>();

    let at_boundary = conservo::malloc(LARGE_OBJECT_SIZE - header_size);
    assert!(!at_boundary.is_null());
    assert_eq!(conservo::stats().small_object_count, 1);
    assert_eq!(conservo::stats().large_object_count, 0);

    let past_boundary = conservo::malloc(LARGE_OBJECT_SIZE - header_size + 1);
    assert!(!past_boundary.is_null());
    assert_eq!(conservo::stats().large_object_count, 1);

    conservo::detach_thread(handle);
    conservo::deinit();
}
