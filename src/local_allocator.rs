//! Per-thread bump allocator for the small-object region (`spec.md` §4.5).
//!
//! Grounded in `original_source/src/local_allocator.c`. One instance is
//! owned by exactly one thread (`crate::api`'s thread registry); it borrows
//! a single block at a time from the `GlobalAllocator` under the global
//! lock, then bumps a cursor through that block's holes lock-free until it
//! runs out, at which point it borrows another block.

use crate::block::{Block, Hole};
use crate::constants::{round_up, LARGE_OBJECT_SIZE, LINE_SIZE, WORD_SIZE};
use crate::global_allocator::GlobalAllocator;
use crate::lock::GcLock;
use crate::object::Object;

/// A per-thread cursor into the small-object heap. `global` is a raw pointer
/// to the single process-wide `GlobalAllocator` rather than a borrow: the
/// collector and other threads' local allocators also need concurrent
/// (lock-serialized) access to the same allocator, so ordinary borrowing
/// can't express the sharing — access is instead guarded entirely by
/// `crate::lock::GcLock`, exactly like the C original's single global
/// `GlobalAllocator *`.
///
/// Bumping `cursor` through the current hole touches only fields owned
/// exclusively by this allocator, so it never takes the lock (`spec.md` §5:
/// "intra-thread bump allocation requires no lock as long as the current
/// block already exists"). The lock is acquired only around the two calls
/// that reach into shared global state: fetching a new block and fetching a
/// new overflow block.
pub struct LocalAllocator {
    global: *mut GlobalAllocator,
    lock: *const GcLock,

    block: *mut Block,
    cursor: *mut u8,
    limit: *mut u8,
    next_hole: *mut Hole,

    overflow_block: *mut Block,
    overflow_cursor: *mut u8,
    overflow_limit: *mut u8,
}

unsafe impl Send for LocalAllocator {}

impl LocalAllocator {
    /// Constructs a local allocator with no block borrowed yet. The first
    /// call to `allocate_small` (or an explicit `reset`) triggers
    /// `init_cursor`/`init_overflow_cursor`.
    ///
    /// # Safety
    /// `global` and `lock` must outlive this `LocalAllocator`, and `global`
    /// must only be accessed while `lock` is held.
    pub unsafe fn new(global: *mut GlobalAllocator, lock: *const GcLock) -> Self {
        Self {
            global,
            lock,
            block: core::ptr::null_mut(),
            cursor: core::ptr::null_mut(),
            limit: core::ptr::null_mut(),
            next_hole: core::ptr::null_mut(),
            overflow_block: core::ptr::null_mut(),
            overflow_cursor: core::ptr::null_mut(),
            overflow_limit: core::ptr::null_mut(),
        }
    }

    fn global(&mut self) -> &mut GlobalAllocator {
        unsafe { &mut *self.global }
    }

    /// `spec.md` §4.5 state machine: obtains a block via `next_block`, then
    /// positions `cursor`/`limit`/`next_hole` according to whether it came
    /// back `Free` or `Recyclable`. Takes the global lock for the duration of
    /// the call into `GlobalAllocator`, which may itself run a full
    /// collection.
    fn init_cursor(&mut self) {
        let global = self.global;
        let lock = unsafe { &*self.lock };
        lock.lock();
        let block = unsafe { (*global).next_block(|g| crate::collector::try_collect(g)) };
        unsafe { lock.unlock() };
        self.block = block;

        unsafe {
            if Block::is_free(block) {
                self.cursor = Block::start(block);
                self.limit = Block::stop(block);
                self.next_hole = core::ptr::null_mut();
            } else {
                debug_assert!(Block::is_recyclable(block));
                let hole = Block::first_free_line(block) as *mut Hole;
                self.cursor = hole as *mut u8;
                self.limit = (*hole).limit;
                self.next_hole = (*hole).next;
            }
        }
    }

    fn init_overflow_cursor(&mut self) {
        let global = self.global;
        let lock = unsafe { &*self.lock };
        lock.lock();
        let block = unsafe { (*global).next_free_block(|g| crate::collector::try_collect(g)) };
        unsafe { lock.unlock() };
        self.overflow_block = block;
        self.overflow_cursor = Block::start(block);
        self.overflow_limit = Block::stop(block);
    }

    /// Called by the collector at the end of every cycle (`spec.md` §4.5.2):
    /// discards the current block/overflow-block so the next allocation
    /// picks a (possibly just-recycled) block.
    pub fn reset(&mut self) {
        self.block = core::ptr::null_mut();
        self.cursor = core::ptr::null_mut();
        self.limit = core::ptr::null_mut();
        self.next_hole = core::ptr::null_mut();
        self.overflow_block = core::ptr::null_mut();
        self.overflow_cursor = core::ptr::null_mut();
        self.overflow_limit = core::ptr::null_mut();
    }

    fn find_next_hole(&mut self) -> bool {
        if self.next_hole.is_null() {
            return false;
        }
        unsafe {
            self.cursor = self.next_hole as *mut u8;
            self.limit = (*self.next_hole).limit;
            self.next_hole = (*self.next_hole).next;
        }
        true
    }

    /// Medium objects (> `LINE_SIZE`) are routed to a dedicated overflow
    /// block rather than consuming the current hole, so they don't
    /// fragment it for subsequent small allocations (`spec.md` §4.5.1).
    fn overflow_allocate_small(&mut self, size: usize) -> *mut Object {
        loop {
            let cursor = self.overflow_cursor;
            let stop = unsafe { cursor.add(size) };

            if stop <= self.overflow_limit {
                let object = cursor as *mut Object;
                unsafe { Block::line_update(self.overflow_block, object) };

                if stop < self.overflow_limit {
                    unsafe { Object::set_size_zero(stop as *mut Object) };
                }

                self.overflow_cursor = stop;
                return object;
            }

            self.init_overflow_cursor();
        }
    }

    fn try_allocate_small(&mut self, size: usize) -> *mut Object {
        loop {
            let cursor = self.cursor;
            let stop = unsafe { cursor.add(size) };

            if stop <= self.limit {
                let object = cursor as *mut Object;
                unsafe { Block::line_update(self.block, object) };

                if stop < self.limit {
                    unsafe { Object::set_size_zero(stop as *mut Object) };
                }

                self.cursor = stop;
                return object;
            }

            if size > LINE_SIZE && unsafe { self.limit.offset_from(cursor) } > LINE_SIZE as isize {
                return self.overflow_allocate_small(size);
            }

            if !self.find_next_hole() {
                return core::ptr::null_mut();
            }
        }
    }

    /// `spec.md` §4.5.1. `size` is the mutator-requested payload size; the
    /// object header is folded in and the total rounded to a word multiple.
    pub fn allocate_small(&mut self, size: usize, atomic: bool) -> *mut u8 {
        let rsize = round_up(size + core::mem::size_of::<Object>(), WORD_SIZE);
        debug_assert!(rsize <= LARGE_OBJECT_SIZE);

        loop {
            if self.block.is_null() {
                self.init_cursor();
            }
            if self.overflow_block.is_null() {
                self.init_overflow_cursor();
            }

            let object = self.try_allocate_small(rsize);
            if !object.is_null() {
                unsafe { Object::init(object, rsize, atomic) };
                self.global().increment_counters(size);
                return Object::mutator_address(object);
            }

            self.init_cursor();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::constants::BLOCK_SIZE;

    fn test_config() -> GcConfig {
        GcConfig {
            initial_heap_size: BLOCK_SIZE * 4,
            maximum_heap_size: 1024 * 1024 * 1024,
            free_space_divisor: 3,
        }
    }

    #[test]
    fn allocate_small_returns_distinct_non_null_pointers() {
        let mut global = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let lock = GcLock::new();
        let mut local = unsafe { LocalAllocator::new(&mut global as *mut GlobalAllocator, &lock) };

        let p0 = local.allocate_small(64, false);
        let p1 = local.allocate_small(64, false);
        assert!(!p0.is_null());
        assert!(!p1.is_null());
        assert_ne!(p0, p1);
    }

    #[test]
    fn allocate_small_initializes_header() {
        let mut global = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let lock = GcLock::new();
        let mut local = unsafe { LocalAllocator::new(&mut global as *mut GlobalAllocator, &lock) };

        let payload = local.allocate_small(64, false);
        unsafe {
            let header = Object::from_mutator_address(payload);
            assert!(Object::size(header) >= 64 + core::mem::size_of::<Object>());
            assert!(!Object::is_marked(header));
            assert!(!Object::is_atomic(header));
        }
    }

    #[test]
    fn medium_allocation_uses_overflow_block() {
        let mut global = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let lock = GcLock::new();
        let mut local = unsafe { LocalAllocator::new(&mut global as *mut GlobalAllocator, &lock) };

        // Force the primary cursor to have more than one line of room but
        // trigger the medium-object overflow path.
        let medium = LINE_SIZE * 2;
        let payload = local.allocate_small(medium, false);
        assert!(!payload.is_null());
        unsafe {
            let header = Object::from_mutator_address(payload);
            assert!(Object::size(header) >= medium);
        }
    }
}
