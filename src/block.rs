//! Blocks, line headers and holes: the line-structured small-object region
//! (`spec.md` §4.3).
//!
//! Grounded in `original_source/include/block.h` and
//! `original_source/c/include/line_header.h`. A block is `BLOCK_SIZE` bytes,
//! self-describing: its first line holds a `Block` header followed by one
//! byte of metadata per remaining line, and the remaining `LINE_COUNT` lines
//! are the allocatable payload. A line header packs three pieces of
//! information into one byte: a mark bit, a "this line holds the start of an
//! object" bit, and (when that bit is set) the word-aligned byte offset of
//! that object's header within the line.

use crate::constants::{BLOCK_SIZE, BLOCK_SIZE_MASK, LINE_COUNT, LINE_SIZE, WORD_SIZE};
use crate::object::Object;

/// Block state, exactly the three states the global allocator cycles a
/// block through: freshly mapped, partially reusable after a sweep, or fully
/// live and off-limits to the recycler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockFlag {
    Free = 0x0,
    Recyclable = 0x1,
    Unavailable = 0x2,
}

const LINE_MARKED: u8 = 0x1;
const LINE_CONTAINS_OBJECT: u8 = 0x2;
const LINE_OBJECT_OFFSET_MASK: u8 = 0xFC;

const INVALID_LINE_INDEX: isize = -1;

/// One byte of per-line metadata. Never constructed directly; always
/// accessed through a raw pointer into a [`Block`]'s trailing array.
#[repr(transparent)]
pub struct LineHeader(u8);

impl LineHeader {
    #[inline]
    pub unsafe fn clear(flag: *mut LineHeader) {
        (*flag).0 = 0;
    }

    #[inline]
    pub unsafe fn is_marked(flag: *const LineHeader) -> bool {
        (*flag).0 & LINE_MARKED == LINE_MARKED
    }

    #[inline]
    pub unsafe fn mark(flag: *mut LineHeader) {
        (*flag).0 |= LINE_MARKED;
    }

    #[inline]
    pub unsafe fn unmark(flag: *mut LineHeader) {
        (*flag).0 &= !LINE_MARKED;
    }

    #[inline]
    pub unsafe fn contains_object(flag: *const LineHeader) -> bool {
        (*flag).0 & LINE_CONTAINS_OBJECT == LINE_CONTAINS_OBJECT
    }

    /// Records that an object header starts at byte `offset` within this
    /// line. `offset` must be word-aligned and fit in six bits.
    #[inline]
    pub unsafe fn set_offset(flag: *mut LineHeader, offset: usize) {
        debug_assert_eq!(offset % WORD_SIZE, 0);
        debug_assert!(offset < LINE_SIZE);
        (*flag).0 = (offset as u8 & LINE_OBJECT_OFFSET_MASK) | LINE_CONTAINS_OBJECT;
    }

    #[inline]
    pub unsafe fn offset(flag: *const LineHeader) -> usize {
        debug_assert!(Self::contains_object(flag));
        ((*flag).0 & LINE_OBJECT_OFFSET_MASK) as usize
    }
}

/// In-place free-list node written at the start of a contiguous run of free
/// lines discovered during a sweep. Reused directly as mutator-visible
/// payload once the hole is handed out, so it must fit in the minimum
/// allocation granularity.
#[repr(C)]
pub struct Hole {
    /// One past the last byte of this hole.
    pub limit: *mut u8,
    /// Next hole in the block's free-hole chain, or null.
    pub next: *mut Hole,
}

impl Hole {
    #[inline]
    pub unsafe fn init(hole: *mut Hole) {
        (*hole).limit = core::ptr::null_mut();
        (*hole).next = core::ptr::null_mut();
    }
}

/// Header occupying the first line of every block. `line_headers` covers the
/// remaining `LINE_COUNT` lines, one byte each.
#[repr(C)]
pub struct Block {
    marked: u8,
    flag: u8,
    first_free_line_index: i16,
    next: *mut Block,
    line_headers: [LineHeader; LINE_COUNT],
}

impl Block {
    /// Zeroes a freshly mapped block in place, leaving it in the `Free`
    /// state with no line metadata set.
    ///
    /// # Safety
    /// `block` must point to at least `BLOCK_SIZE` writable, properly
    /// aligned bytes.
    pub unsafe fn init(block: *mut Block) {
        core::ptr::write_bytes(block as *mut u8, 0, BLOCK_SIZE);
    }

    /// Recovers a block header from any pointer into that block's payload,
    /// by masking off the low `BLOCK_SIZE`-aligned bits.
    #[inline]
    pub fn from_pointer(pointer: *const u8) -> *mut Block {
        ((pointer as usize) & BLOCK_SIZE_MASK) as *mut Block
    }

    #[inline]
    pub unsafe fn set_flag(block: *mut Block, flag: BlockFlag) {
        (*block).flag = flag as u8;
    }

    #[inline]
    pub unsafe fn is_free(block: *const Block) -> bool {
        (*block).flag == BlockFlag::Free as u8
    }

    #[inline]
    pub unsafe fn is_recyclable(block: *const Block) -> bool {
        (*block).flag == BlockFlag::Recyclable as u8
    }

    #[inline]
    pub unsafe fn is_unavailable(block: *const Block) -> bool {
        (*block).flag == BlockFlag::Unavailable as u8
    }

    pub unsafe fn set_free(block: *mut Block) {
        Self::init(block);
    }

    pub unsafe fn set_recyclable(block: *mut Block, first_free_line_index: i16) {
        (*block).flag = BlockFlag::Recyclable as u8;
        (*block).first_free_line_index = first_free_line_index;
    }

    pub unsafe fn set_unavailable(block: *mut Block) {
        (*block).flag = BlockFlag::Unavailable as u8;
    }

    #[inline]
    pub unsafe fn mark(block: *mut Block) {
        (*block).marked = 1;
    }

    #[inline]
    pub unsafe fn unmark(block: *mut Block) {
        (*block).marked = 0;
    }

    #[inline]
    pub unsafe fn is_marked(block: *const Block) -> bool {
        (*block).marked == 1
    }

    #[inline]
    pub unsafe fn next(block: *const Block) -> *mut Block {
        (*block).next
    }

    #[inline]
    pub unsafe fn set_next(block: *mut Block, next: *mut Block) {
        (*block).next = next;
    }

    /// First byte of the block's allocatable payload (after the header
    /// line).
    #[inline]
    pub fn start(block: *const Block) -> *mut u8 {
        unsafe { (block as *mut u8).add(LINE_SIZE) }
    }

    /// One past the last allocatable byte of the block.
    #[inline]
    pub fn stop(block: *const Block) -> *mut u8 {
        unsafe { (block as *mut u8).add(BLOCK_SIZE) }
    }

    #[inline]
    pub fn contains(block: *const Block, pointer: *const u8) -> bool {
        pointer >= Self::start(block) as *const u8 && pointer < Self::stop(block) as *const u8
    }

    pub unsafe fn first_free_line(block: *const Block) -> *mut u8 {
        debug_assert!((*block).first_free_line_index >= 0);
        debug_assert!(((*block).first_free_line_index as usize) < LINE_COUNT);
        Self::start(block).add(LINE_SIZE * (*block).first_free_line_index as usize)
    }

    pub unsafe fn line_headers(block: *mut Block) -> *mut LineHeader {
        (*block).line_headers.as_mut_ptr()
    }

    pub unsafe fn line_header(block: *mut Block, line_index: usize) -> *mut LineHeader {
        debug_assert!(line_index < LINE_COUNT);
        (*block).line_headers.as_mut_ptr().add(line_index)
    }

    /// Index of the line that `pointer` falls in, or [`INVALID_LINE_INDEX`]
    /// if `pointer` is before the start of the allocatable payload.
    pub unsafe fn line_index(block: *const Block, pointer: *const u8) -> isize {
        debug_assert!(pointer <= Self::stop(block) as *const u8);
        let diff = (pointer as isize) - (Self::start(block) as isize);
        if diff < 0 {
            INVALID_LINE_INDEX
        } else {
            diff / LINE_SIZE as isize
        }
    }

    pub unsafe fn line(block: *const Block, line_index: usize) -> *mut u8 {
        debug_assert!(line_index < LINE_COUNT);
        Self::start(block).add(line_index * LINE_SIZE)
    }

    /// Records, in the owning line's header, that `object` is the first
    /// object starting within that line — but only the first time; later
    /// objects packed into the same line after the first don't overwrite the
    /// line's recorded offset, since inner-pointer resolution only ever
    /// needs to find *a* preceding object header to walk forward from.
    pub unsafe fn line_update(block: *mut Block, object: *mut Object) {
        debug_assert!(Self::contains(block, object as *const u8));

        let line_index = Self::line_index(block, object as *const u8);
        debug_assert!(line_index != INVALID_LINE_INDEX);
        let line_index = line_index as usize;

        let header = Self::line_header(block, line_index);
        if !LineHeader::contains_object(header) {
            let offset = (object as isize) - (Self::line(block, line_index) as isize);
            debug_assert!(offset >= 0 && (offset as usize) < LINE_SIZE);
            LineHeader::set_offset(header, offset as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct OwnedBlock {
        ptr: *mut Block,
        layout: Layout,
    }

    impl OwnedBlock {
        fn new() -> Self {
            let layout = Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) as *mut Block };
            unsafe { Block::init(ptr) };
            Self { ptr, layout }
        }
    }

    impl Drop for OwnedBlock {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr as *mut u8, self.layout) };
        }
    }

    #[test]
    fn from_pointer_recovers_header() {
        let block = OwnedBlock::new();
        let interior = unsafe { Block::start(block.ptr).add(LINE_SIZE * 3 + 10) };
        assert_eq!(Block::from_pointer(interior), block.ptr);
    }

    #[test]
    fn flag_round_trips() {
        let block = OwnedBlock::new();
        unsafe {
            assert!(Block::is_free(block.ptr));
            Block::set_recyclable(block.ptr, 4);
            assert!(Block::is_recyclable(block.ptr));
            assert_eq!(Block::first_free_line(block.ptr), Block::line(block.ptr, 4));
            Block::set_unavailable(block.ptr);
            assert!(Block::is_unavailable(block.ptr));
        }
    }

    #[test]
    fn line_index_and_contains() {
        let block = OwnedBlock::new();
        unsafe {
            assert!(!Block::contains(block.ptr, block.ptr as *const u8));
            let first_line = Block::start(block.ptr);
            assert!(Block::contains(block.ptr, first_line));
            assert_eq!(Block::line_index(block.ptr, first_line), 0);
            let third_line = Block::line(block.ptr, 2);
            assert_eq!(Block::line_index(block.ptr, third_line), 2);
        }
    }

    #[test]
    fn line_update_sets_offset_once() {
        let block = OwnedBlock::new();
        unsafe {
            let line = Block::line(block.ptr, 5);
            let object = line.add(WORD_SIZE) as *mut Object;
            Block::line_update(block.ptr, object);
            let header = Block::line_header(block.ptr, 5);
            assert!(LineHeader::contains_object(header));
            assert_eq!(LineHeader::offset(header), WORD_SIZE);

            // A second, later object in the same line must not move the
            // recorded offset backwards.
            let later = line.add(WORD_SIZE * 4) as *mut Object;
            Block::line_update(block.ptr, later);
            assert_eq!(LineHeader::offset(header), WORD_SIZE);
        }
    }

    #[test]
    fn line_header_mark_bit_is_independent_of_offset() {
        let block = OwnedBlock::new();
        unsafe {
            let header = Block::line_header(block.ptr, 9);
            LineHeader::set_offset(header, 16);
            LineHeader::mark(header);
            assert!(LineHeader::is_marked(header));
            assert!(LineHeader::contains_object(header));
            assert_eq!(LineHeader::offset(header), 16);
            LineHeader::unmark(header);
            assert!(!LineHeader::is_marked(header));
            assert!(LineHeader::contains_object(header));
        }
    }
}
