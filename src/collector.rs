//! The mark/sweep cycle itself (`spec.md` §4.6).
//!
//! Grounded in `original_source/src/collector.c` / `include/collector.h`. A
//! single `Collector` owns the root worklist and the platform's
//! [`SegmentProvider`]; everything else it touches — blocks, lines, chunks,
//! the finalizer table — belongs to the [`GlobalAllocator`] it was built
//! with. Every public entry point here assumes the caller already holds
//! `crate::lock::GcLock`, exactly like the teacher's `marking.rs` assumes its
//! caller already holds the heap lock.

use crate::block::{Block, LineHeader};
use crate::chunk::Chunk;
use crate::constants::{BLOCK_SIZE, LINE_COUNT, LINE_SIZE, WORD_SIZE};
use crate::global_allocator::GlobalAllocator;
use crate::lock::GcLock;
use crate::local_allocator::LocalAllocator;
use crate::object::Object;
use crate::segments::SegmentProvider;
use crate::worklist::Worklist;

/// Invoked during root seeding so the host can push its own regions (thread
/// stacks, registers spilled to memory, anything the host knows about that
/// this crate doesn't) via [`crate::api::add_roots`]. Takes no arguments: the
/// host is expected to call back into the public API from inside it, the
/// same shape `original_source/include/collector.h`'s `collect_callback_t`
/// takes for "scan conservative roots I own."
pub type CollectCallback = unsafe extern "C" fn();

/// Runs one mark/sweep cycle end to end. Holds a raw pointer to the
/// [`GlobalAllocator`] it was constructed with rather than a borrow, for the
/// same reason `crate::local_allocator::LocalAllocator` does: the owning
/// singleton (`crate::api`) needs to hand out `&mut GlobalAllocator` to the
/// local allocators and the collector at the same time, which plain
/// borrowing can't express.
pub struct Collector {
    global: *mut GlobalAllocator,
    worklist: Worklist,
    segment_provider: Box<dyn SegmentProvider>,
    collect_callback: Option<CollectCallback>,
}

unsafe impl Send for Collector {}

impl Collector {
    /// # Safety
    /// `global` must outlive this `Collector` and must only be accessed
    /// while `crate::lock::GcLock` is held.
    pub unsafe fn new(global: *mut GlobalAllocator, segment_provider: Box<dyn SegmentProvider>) -> Self {
        Self {
            global,
            worklist: Worklist::new(),
            segment_provider,
            collect_callback: None,
        }
    }

    pub fn set_collect_callback(&mut self, callback: CollectCallback) {
        self.collect_callback = Some(callback);
    }

    /// `spec.md` §6 `add_roots`: registers `[top, bottom)` as a root region
    /// the next mark phase must conservatively scan.
    pub fn add_roots(&mut self, top: *const u8, bottom: *const u8) {
        debug_assert!(top <= bottom);
        crate::debug_log!("add_roots top={:p} bottom={:p}", top, bottom);
        self.worklist.push(top, bottom);
    }

    fn global(&self) -> &GlobalAllocator {
        unsafe { &*self.global }
    }

    fn global_mut(&mut self) -> &mut GlobalAllocator {
        unsafe { &mut *self.global }
    }

    /// Clears every block's, line's and object's mark bit. Runs over the
    /// whole small heap regardless of block state, since a block that was
    /// `Unavailable` last cycle may become `Recyclable` this cycle.
    unsafe fn unmark_small_objects(&mut self) {
        let mut block = self.global().small_heap_start() as *mut Block;
        let stop = self.global().small_heap_stop() as *mut Block;

        while (block as usize) < stop as usize {
            Block::unmark(block);

            for line_index in 0..LINE_COUNT {
                let header = Block::line_header(block, line_index);
                LineHeader::unmark(header);

                if LineHeader::contains_object(header) {
                    let line = Block::line(block, line_index);
                    let mut offset = LineHeader::offset(header);
                    while offset < LINE_SIZE {
                        let object = line.add(offset) as *mut Object;
                        let size = Object::size(object);
                        if size == 0 {
                            break;
                        }
                        Object::unmark(object);
                        offset += size;
                    }
                }
            }

            block = (block as *mut u8).add(BLOCK_SIZE) as *mut Block;
        }
    }

    unsafe fn unmark_large_objects(&mut self) {
        let mut chunk = self.global().large_chunk_list().first();
        while !chunk.is_null() {
            Chunk::unmark(chunk);
            chunk = Chunk::next(chunk);
        }
    }

    /// Pushes a live object's payload onto the worklist, unless it was
    /// allocated atomic (no outgoing pointers to scan).
    unsafe fn scan_object(&mut self, object: *mut Object) {
        if !Object::is_atomic(object) {
            let start = Object::mutator_address(object) as *const u8;
            let stop = (object as *const u8).add(Object::size(object));
            self.worklist.push(start, stop);
        }
    }

    unsafe fn mark_chunk(&mut self, chunk: *mut Chunk) {
        if chunk.is_null() || !Chunk::is_allocated(chunk) || Chunk::is_marked(chunk) {
            return;
        }
        Chunk::mark(chunk);
        if !Chunk::is_atomic(chunk) {
            let start = Chunk::mutator_address(chunk) as *const u8;
            let stop = (chunk as *const u8).add(Chunk::size(chunk));
            self.worklist.push(start, stop);
        }
    }

    /// Conservative inner-pointer resolution (`spec.md` §4.6.3): `pointer`
    /// may point anywhere inside a live object's payload, not just at its
    /// start, so the block's line headers are used to find the nearest
    /// preceding object header and walk forward from there.
    unsafe fn find_and_mark_small_object(&mut self, pointer: *const u8) {
        let block = Block::from_pointer(pointer);
        let mut line_index = Block::line_index(block, pointer);
        if line_index < 0 {
            return;
        }

        // If `pointer` falls inside the line that records an object start
        // but before that recorded offset, the object it belongs to (if any)
        // must have started in an earlier line.
        let header = Block::line_header(block, line_index as usize);
        if LineHeader::contains_object(header) {
            let line = Block::line(block, line_index as usize);
            let offset = LineHeader::offset(header);
            if (pointer as usize) < (line.add(offset) as usize) {
                line_index -= 1;
            }
        }

        while line_index >= 0 {
            let header = Block::line_header(block, line_index as usize);
            if LineHeader::contains_object(header) {
                let line = Block::line(block, line_index as usize);
                let mut offset = LineHeader::offset(header);

                while offset < LINE_SIZE {
                    let object = line.add(offset) as *mut Object;
                    let size = Object::size(object);
                    if size == 0 {
                        return;
                    }

                    if Object::contains(object, pointer) {
                        if !Object::is_marked(object) {
                            Object::mark(object);
                            Block::mark(block);

                            if size <= LINE_SIZE {
                                LineHeader::mark(header);
                            } else {
                                let limit = (object as *const u8).add(size);
                                let mut mark_line = line;
                                let mut mark_header = header;
                                while (mark_line as *const u8) < limit {
                                    LineHeader::mark(mark_header);
                                    mark_line = mark_line.add(LINE_SIZE);
                                    mark_header = mark_header.add(1);
                                }
                            }

                            self.scan_object(object);
                        }
                        return;
                    }

                    offset += size;
                }
                // Reached the end of the line that claims to contain an
                // object without finding one containing `pointer`: it must
                // have pointed into dead space left over from a previous
                // cycle's sweep. Nothing more to do.
                return;
            }
            line_index -= 1;
        }
    }

    /// Drains the worklist, conservatively scanning every registered root
    /// region and every live object reached transitively from it.
    unsafe fn mark(&mut self) {
        while let Some(region) = self.worklist.pop() {
            let mut cursor = region.top;
            while (cursor as usize) < region.bottom as usize {
                let pointer = *(cursor as *const usize) as *const u8;

                if self.global().in_small_heap(pointer) {
                    self.find_and_mark_small_object(pointer);
                } else if self.global().in_large_heap(pointer) {
                    let chunk = self.global().large_chunk_list().find(pointer);
                    self.mark_chunk(chunk);
                }

                cursor = cursor.add(WORD_SIZE);
            }
        }
    }

    /// Fires and removes every finalizer registered for an object that
    /// didn't survive the mark phase. Both small and large objects' headers
    /// live at addresses outside the mutator-visible payload, so a single
    /// pass over `FinalizerTable` (keyed by header address) covers both
    /// regions without a separate block/chunk walk — the table itself is the
    /// authoritative list of "objects anyone asked to be notified about."
    ///
    /// Finalizers run with the global lock released (`spec.md` §5, §9): a
    /// finalizer that allocates or frees must not deadlock against the lock
    /// its own invocation is nested under.
    unsafe fn finalize_unreachable(&mut self, lock: &GcLock) {
        let global = self.global;
        let mut fire = Vec::new();

        (*global).finalizers_mut().delete_if(|key, finalizer| {
            let marked = if (*global).in_small_heap(key as *const u8) {
                Object::is_marked(key as *const Object)
            } else {
                Chunk::is_marked(key as *const Chunk)
            };
            if !marked {
                fire.push((key, finalizer));
            }
            !marked
        });

        for (header, finalizer) in fire {
            let mutator = if (*global).in_small_heap(header as *const u8) {
                Object::mutator_address(header as *mut Object)
            } else {
                Chunk::mutator_address(header as *const Chunk)
            };
            lock.unlocked(|| finalizer(mutator));
        }
    }

    /// Reclaims every unmarked block and chunk (`spec.md` §4.6.5), via
    /// `GlobalAllocator::recycle_blocks` and `ChunkList::sweep`.
    unsafe fn sweep(&mut self) {
        self.global_mut().recycle_blocks();
        self.global_mut().large_chunk_list_mut().sweep();
    }

    /// Runs one full collection cycle: unmark, seed roots, mark, fire
    /// finalizers for the unreachable, sweep, then reset every thread's
    /// local allocator so the next allocation picks up freshly recycled
    /// blocks. Returns `false` without doing any work if a collection is
    /// already in progress on this thread (re-entrant trigger, e.g. a
    /// finalizer that allocates).
    ///
    /// # Safety
    /// The caller must already hold `lock`.
    pub unsafe fn collect(&mut self, lock: &GcLock, locals: &[*mut LocalAllocator]) -> bool {
        if !lock.begin_collecting() {
            return false;
        }

        crate::debug_log!("collection cycle start");

        self.unmark_small_objects();
        self.unmark_large_objects();

        if let Some((data_start, data_end, bss_start, bss_end)) = self.segment_provider.data_and_bss() {
            self.add_roots(data_start, data_end);
            self.add_roots(bss_start, bss_end);
        }
        if let Some(callback) = self.collect_callback {
            callback();
        }

        self.mark();

        self.global_mut().reset_counters();

        self.finalize_unreachable(lock);

        self.sweep();

        for &local in locals {
            (*local).reset();
        }

        crate::debug_log!("collection cycle end");
        lock.end_collecting();
        true
    }
}

/// `spec.md` §4.4.7's collection-triggering policy, called from
/// `GlobalAllocator::next_block`/`next_free_block`/`allocate_large` when a
/// fast-path allocation attempt fails. Declining to collect (because one is
/// already running, or because the heap hasn't grown enough to justify it)
/// is not an error: the caller falls back to growing the heap instead.
///
/// # Safety
/// The caller must already hold the process-wide lock, and `global` must be
/// the same allocator the process-wide `Collector` singleton was built with.
pub unsafe fn try_collect(global: &mut GlobalAllocator) -> bool {
    let gc = crate::api::gc_mut();
    if gc.lock.is_collecting() || !global.should_collect() {
        return false;
    }
    gc.collector.collect(&gc.lock, &gc.locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::constants::BLOCK_SIZE;
    use crate::segments::NullSegmentProvider;

    fn test_config() -> GcConfig {
        GcConfig {
            initial_heap_size: BLOCK_SIZE * 4,
            maximum_heap_size: 1024 * 1024 * 1024,
            free_space_divisor: 3,
        }
    }

    #[test]
    fn unreachable_small_object_is_swept() {
        let mut global = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let lock = GcLock::new();
        let mut local =
            unsafe { LocalAllocator::new(&mut global as *mut GlobalAllocator, &lock as *const GcLock) };

        let payload = local.allocate_small(64, false);
        assert!(!payload.is_null());

        let mut collector =
            unsafe { Collector::new(&mut global as *mut GlobalAllocator, Box::new(NullSegmentProvider)) };

        // No roots registered: the allocation above is unreachable.
        unsafe {
            assert!(collector.collect(&lock, &[&mut local as *mut LocalAllocator]));
        }

        let stats = global.stats();
        assert_eq!(stats.small_object_count, 0);
    }

    #[test]
    fn rooted_small_object_survives_collection() {
        let mut global = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let lock = GcLock::new();
        let mut local =
            unsafe { LocalAllocator::new(&mut global as *mut GlobalAllocator, &lock as *const GcLock) };

        let payload = local.allocate_small(64, false);
        assert!(!payload.is_null());

        let mut collector =
            unsafe { Collector::new(&mut global as *mut GlobalAllocator, Box::new(NullSegmentProvider)) };

        let root = Box::new(payload);
        collector.add_roots(
            &*root as *const *mut u8 as *const u8,
            unsafe { (&*root as *const *mut u8 as *const u8).add(WORD_SIZE) },
        );

        unsafe {
            assert!(collector.collect(&lock, &[&mut local as *mut LocalAllocator]));
        }

        let stats = global.stats();
        assert_eq!(stats.small_object_count, 1);
    }

    #[test]
    fn unreachable_large_object_fires_finalizer() {
        let mut global = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let lock = GcLock::new();

        let payload = global.allocate_large(16 * 1024, false, |_| false);
        assert!(!payload.is_null());

        unsafe extern "C" fn mark_fired(ptr: *mut u8) {
            *(ptr as *mut u8) = 1;
        }

        static mut FIRED: u8 = 0;
        unsafe extern "C" fn set_fired(_ptr: *mut u8) {
            FIRED = 1;
        }
        let _ = mark_fired as unsafe extern "C" fn(*mut u8);

        unsafe {
            let chunk = crate::chunk::Chunk::from_mutator_address(payload);
            global.finalizers_mut().insert(chunk as *mut u8, set_fired);
        }

        let mut collector =
            unsafe { Collector::new(&mut global as *mut GlobalAllocator, Box::new(NullSegmentProvider)) };

        unsafe {
            assert!(collector.collect(&lock, &[]));
            assert_eq!(FIRED, 1);
        }
    }

    #[test]
    fn second_call_while_collecting_is_a_no_op() {
        let mut global = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let lock = GcLock::new();
        lock.begin_collecting();

        let mut collector =
            unsafe { Collector::new(&mut global as *mut GlobalAllocator, Box::new(NullSegmentProvider)) };

        unsafe {
            assert!(!collector.collect(&lock, &[]));
        }
        lock.end_collecting();
    }
}
