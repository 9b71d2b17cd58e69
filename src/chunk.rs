//! Large-object region: chunk header and the address-ordered, intrusive
//! [`ChunkList`] free list (`spec.md` §4.2).
//!
//! Grounded in `original_source/include/chunk_list.h`. Every byte of the
//! large-object heap belongs to exactly one chunk, allocated or free, and
//! chunks are address-adjacent: `chunk + CHUNK_HEADER_SIZE + chunk.size ==
//! next_chunk_address`. That adjacency is what lets [`ChunkList::sweep`]
//! coalesce runs of freed chunks by simply rewriting one chunk's `size` and
//! `next`, and what lets [`ChunkList::split`] carve a free chunk into an
//! allocated head and a free tail without touching neighbors.
//!
//! A chunk embeds a mark bit and atomic bit exactly like
//! [`crate::object::Object`], but its `size` field records the mutator
//! payload size only (not header-inclusive, unlike the small-object
//! convention) — `Chunk::size` adds [`CHUNK_HEADER_SIZE`] back in. Because
//! the bookkeeping convention differs we give `Chunk` its own fields rather
//! than layering `crate::object::Object` underneath. As with `Object`,
//! finalizers are tracked externally in `crate::finalizers::FinalizerTable`
//! keyed by header address, not in a per-chunk field.

use core::mem::size_of;

/// Bytes of header preceding every chunk's mutator payload.
pub const CHUNK_HEADER_SIZE: usize = size_of::<Chunk>();

/// Smallest chunk `ChunkList::split` will carve off as a standalone free
/// chunk; below this a split candidate is left attached to its neighbor
/// instead.
pub const CHUNK_MIN_SIZE: usize = CHUNK_HEADER_SIZE * 2;

#[repr(C)]
pub struct Chunk {
    next: *mut Chunk,
    allocated: u8,
    marked: u8,
    atomic: u8,
    /// Mutator payload size, header excluded.
    size: usize,
}

impl Chunk {
    /// Initializes a free chunk of mutator payload size `size`.
    ///
    /// # Safety
    /// `chunk` must point to at least `CHUNK_HEADER_SIZE + size` writable
    /// bytes.
    pub unsafe fn init(chunk: *mut Chunk, size: usize) {
        (*chunk).next = core::ptr::null_mut();
        (*chunk).allocated = 0;
        (*chunk).marked = 0;
        (*chunk).atomic = 0;
        (*chunk).size = size;
    }

    pub unsafe fn allocate(chunk: *mut Chunk, atomic: bool) {
        (*chunk).allocated = 1;
        (*chunk).atomic = atomic as u8;
    }

    /// Marks the chunk free for explicit release (`free`/`realloc`).
    /// Coalescing with neighboring free chunks happens lazily at the next
    /// sweep, not here.
    #[inline]
    pub unsafe fn deallocate(chunk: *mut Chunk) {
        (*chunk).allocated = 0;
    }

    #[inline]
    pub unsafe fn is_allocated(chunk: *const Chunk) -> bool {
        (*chunk).allocated == 1
    }

    #[inline]
    pub unsafe fn next(chunk: *const Chunk) -> *mut Chunk {
        (*chunk).next
    }

    #[inline]
    pub unsafe fn set_next(chunk: *mut Chunk, next: *mut Chunk) {
        (*chunk).next = next;
    }

    /// Mutator payload size, header excluded.
    #[inline]
    pub unsafe fn payload_size(chunk: *const Chunk) -> usize {
        (*chunk).size
    }

    #[inline]
    pub unsafe fn set_payload_size(chunk: *mut Chunk, size: usize) {
        (*chunk).size = size;
    }

    /// Total size this chunk occupies in the heap, header included.
    #[inline]
    pub unsafe fn size(chunk: *const Chunk) -> usize {
        (*chunk).size + CHUNK_HEADER_SIZE
    }

    #[inline]
    pub unsafe fn mark(chunk: *mut Chunk) {
        (*chunk).marked = 1;
    }

    #[inline]
    pub unsafe fn unmark(chunk: *mut Chunk) {
        (*chunk).marked = 0;
    }

    #[inline]
    pub unsafe fn is_marked(chunk: *const Chunk) -> bool {
        (*chunk).marked == 1
    }

    #[inline]
    pub unsafe fn is_atomic(chunk: *const Chunk) -> bool {
        (*chunk).atomic == 1
    }

    #[inline]
    pub fn mutator_address(chunk: *const Chunk) -> *mut u8 {
        unsafe { (chunk as *mut u8).add(CHUNK_HEADER_SIZE) }
    }

    #[inline]
    pub unsafe fn from_mutator_address(mutator_address: *mut u8) -> *mut Chunk {
        mutator_address.sub(CHUNK_HEADER_SIZE) as *mut Chunk
    }

    pub unsafe fn contains(chunk: *const Chunk, pointer: *const u8) -> bool {
        let start = Self::mutator_address(chunk) as *const u8;
        let stop = (chunk as *const u8).add(CHUNK_HEADER_SIZE + (*chunk).size);
        pointer >= start && pointer < stop
    }
}

/// Address-ordered, intrusive singly linked free/allocated list over the
/// large-object heap.
pub struct ChunkList {
    first: *mut Chunk,
    last: *mut Chunk,
    size: usize,
}

unsafe impl Send for ChunkList {}

impl ChunkList {
    pub const fn new() -> Self {
        Self {
            first: core::ptr::null_mut(),
            last: core::ptr::null_mut(),
            size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn first(&self) -> *mut Chunk {
        self.first
    }

    /// Appends `chunk` to the tail of the list (used when growing the
    /// large-object heap with a fresh mapping, always at a higher address
    /// than anything already tracked).
    ///
    /// # Safety
    /// `chunk` must be a live chunk at a higher address than `self.last`.
    pub unsafe fn push(&mut self, chunk: *mut Chunk) {
        Chunk::set_next(chunk, core::ptr::null_mut());
        if self.is_empty() {
            self.first = chunk;
        } else {
            Chunk::set_next(self.last, chunk);
        }
        self.last = chunk;
        self.size += 1;
    }

    /// Inserts `chunk` immediately after `after` in address order.
    ///
    /// # Safety
    /// `after` must be a chunk currently in this list; `chunk` must sit at
    /// the address immediately following `after`'s extent.
    pub unsafe fn insert(&mut self, chunk: *mut Chunk, after: *mut Chunk) {
        if after == self.last {
            Chunk::set_next(chunk, core::ptr::null_mut());
            Chunk::set_next(self.last, chunk);
            self.last = chunk;
        } else {
            Chunk::set_next(chunk, Chunk::next(after));
            Chunk::set_next(after, chunk);
        }
        self.size += 1;
    }

    /// Splits `chunk`'s payload so that the first `size` bytes remain
    /// assigned to `chunk` and the remainder becomes a new free chunk
    /// inserted immediately after it. Returns the new free chunk, or null if
    /// the remainder is too small to host a standalone chunk header
    /// ([`CHUNK_MIN_SIZE`]), in which case `chunk` keeps its full size.
    ///
    /// # Safety
    /// `chunk` must be a member of this list with payload size `>= size`.
    pub unsafe fn split(&mut self, chunk: *mut Chunk, size: usize) -> *mut Chunk {
        let remaining = Chunk::payload_size(chunk) - size;
        if remaining < CHUNK_MIN_SIZE {
            return core::ptr::null_mut();
        }

        Chunk::set_payload_size(chunk, size);

        let free_chunk = (chunk as *mut u8).add(CHUNK_HEADER_SIZE + size) as *mut Chunk;
        Chunk::init(free_chunk, remaining - CHUNK_HEADER_SIZE);
        self.insert(free_chunk, chunk);

        debug_assert_eq!(
            (chunk as *mut u8).add(CHUNK_HEADER_SIZE + size),
            free_chunk as *mut u8
        );
        let next = Chunk::next(free_chunk);
        if !next.is_null() {
            debug_assert_eq!(
                (free_chunk as *mut u8).add(remaining),
                next as *mut u8
            );
        }

        free_chunk
    }

    /// Finds the chunk containing `pointer`, scanning from the head.
    pub unsafe fn find(&self, pointer: *const u8) -> *mut Chunk {
        let mut chunk = self.first;
        while !chunk.is_null() {
            if Chunk::contains(chunk, pointer) {
                return chunk;
            }
            chunk = Chunk::next(chunk);
        }
        core::ptr::null_mut()
    }

    /// One past the last byte owned by the last chunk in the list, i.e. the
    /// current high-water mark of the large-object heap, or null if empty.
    pub unsafe fn limit(&self) -> *mut u8 {
        if self.last.is_null() {
            core::ptr::null_mut()
        } else {
            (self.last as *mut u8).add(Chunk::size(self.last))
        }
    }

    /// Absorbs `count` chunks following `chunk` (up to, but excluding,
    /// `limit`) into `chunk` itself, given that they have all already been
    /// determined to be free.
    unsafe fn merge(&mut self, chunk: *mut Chunk, limit: *mut Chunk, count: usize) {
        let stop = if limit.is_null() {
            self.limit()
        } else {
            limit as *mut u8
        };
        let size = (stop as usize - chunk as usize) - CHUNK_HEADER_SIZE;
        debug_assert!(size > Chunk::payload_size(chunk));

        Chunk::set_next(chunk, limit);
        Chunk::set_payload_size(chunk, size);

        if limit.is_null() {
            self.last = chunk;
        }
        self.size -= count;
    }

    /// Reclaims every unmarked chunk, coalescing runs of adjacent free
    /// chunks into a single larger free chunk.
    pub unsafe fn sweep(&mut self) {
        let mut chunk = self.first;

        while !chunk.is_null() {
            if Chunk::is_marked(chunk) {
                chunk = Chunk::next(chunk);
                continue;
            }

            Chunk::unmark(chunk);
            let allocated_chunk = chunk as *mut u8;
            (*(allocated_chunk as *mut Chunk)).allocated = 0;

            let mut limit = Chunk::next(chunk);
            let mut count = 0usize;
            while !limit.is_null() && !Chunk::is_marked(limit) {
                limit = Chunk::next(limit);
                count += 1;
            }

            if limit != Chunk::next(chunk) {
                self.merge(chunk, limit, count);
            }

            chunk = limit;
        }
    }

    /// Debug-only consistency check: every chunk's extent must exactly abut
    /// the next chunk's address, and the last chunk's extent must reach
    /// `heap_stop`.
    pub unsafe fn validate(&self, heap_stop: *const u8) {
        let mut chunk = self.first;
        let mut count = 0usize;

        while !chunk.is_null() {
            count += 1;
            let next = Chunk::next(chunk);
            let extent_end = (chunk as *const u8).add(CHUNK_HEADER_SIZE + Chunk::payload_size(chunk));

            if next.is_null() {
                debug_assert_eq!(extent_end, heap_stop);
                debug_assert_eq!(chunk, self.last);
                debug_assert_eq!(count, self.size);
                return;
            }

            debug_assert_eq!(extent_end, next as *const u8);
            chunk = next;
        }
    }
}

impl Default for ChunkList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct Heap {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Heap {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 16).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            Self { ptr, layout }
        }
    }

    impl Drop for Heap {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn split_carves_off_a_free_tail() {
        let heap = Heap::new(4096);
        let mut list = ChunkList::new();
        unsafe {
            let chunk = heap.ptr as *mut Chunk;
            Chunk::init(chunk, 4096 - CHUNK_HEADER_SIZE);
            list.push(chunk);

            let free_chunk = list.split(chunk, 128);
            assert!(!free_chunk.is_null());
            assert_eq!(Chunk::payload_size(chunk), 128);
            assert_eq!(
                (chunk as *mut u8).add(CHUNK_HEADER_SIZE + 128),
                free_chunk as *mut u8
            );
            list.validate(heap.ptr.add(4096));
        }
    }

    #[test]
    fn split_refuses_too_small_a_remainder() {
        let heap = Heap::new(CHUNK_HEADER_SIZE * 2 + 64);
        let mut list = ChunkList::new();
        unsafe {
            let chunk = heap.ptr as *mut Chunk;
            let total = CHUNK_HEADER_SIZE * 2 + 64;
            Chunk::init(chunk, total - CHUNK_HEADER_SIZE);
            list.push(chunk);

            // Leaves a remainder smaller than CHUNK_MIN_SIZE.
            let free_chunk = list.split(chunk, total - CHUNK_HEADER_SIZE - 4);
            assert!(free_chunk.is_null());
            assert_eq!(Chunk::payload_size(chunk), total - CHUNK_HEADER_SIZE);
        }
    }

    #[test]
    fn sweep_coalesces_adjacent_free_chunks() {
        let heap = Heap::new(4096);
        let mut list = ChunkList::new();
        unsafe {
            let a = heap.ptr as *mut Chunk;
            Chunk::init(a, 512);
            list.push(a);

            let b = list.split(a, 128);
            assert!(!b.is_null());
            let c = list.split(b, 128);
            assert!(!c.is_null());

            Chunk::mark(a);
            // b and c stay unmarked -> should coalesce into one free chunk.
            list.sweep();

            let merged = Chunk::next(a);
            assert!(!merged.is_null());
            assert!(!Chunk::is_marked(merged));
            assert!(Chunk::next(merged).is_null());
            assert_eq!(list.len(), 2);
            list.validate(heap.ptr.add(4096));
        }
    }

    #[test]
    fn find_locates_owning_chunk() {
        let heap = Heap::new(4096);
        let mut list = ChunkList::new();
        unsafe {
            let chunk = heap.ptr as *mut Chunk;
            Chunk::init(chunk, 4096 - CHUNK_HEADER_SIZE);
            list.push(chunk);
            let mid = Chunk::mutator_address(chunk).add(16);
            assert_eq!(list.find(mid), chunk);
            assert!(list.find(heap.ptr.add(4096)).is_null());
        }
    }
}
