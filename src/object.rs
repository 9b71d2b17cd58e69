//! The header prepended to every small-object allocation (`spec.md` §3
//! "Object header").
//!
//! Grounded in `original_source/include/object.h`, with one deliberate
//! simplification: the original struct carries a `finalizer_t finalizer`
//! field directly, but `global_allocator.h`'s `GlobalAllocator_registerFinalizer`
//! / `_deleteFinalizer` never touch it — finalizers are actually registered
//! and looked up through the pointer-keyed `Hash` table
//! (`crate::finalizers::FinalizerTable`), keyed by the header address. This
//! port keeps a single source of truth for finalizers (the table) rather
//! than carrying a redundant, mostly-dead field on every object header.

use core::mem::size_of;

/// Callback invoked once for an object that did not survive a collection and
/// had a finalizer registered. Receives the mutator-visible address (the
/// first byte past the header), exactly as `original_source/include/object.h`
/// hands `Object_mutatorAddress` to `finalizer_t`.
pub type Finalizer = unsafe extern "C" fn(*mut u8);

/// Fixed-size metadata block prefixing every small object's mutator payload.
///
/// `#[repr(C)]` so its layout matches what a raw pointer arithmetic pass over
/// the heap expects, and so [`Self::mutator_address`]/[`Self::from_mutator_address`]
/// are simple pointer offsets by `size_of::<Object>()`.
#[repr(C)]
pub struct Object {
    /// Total size of this allocation in bytes, header included. Zero is
    /// never a valid value for a live object; the collector's line scan
    /// treats a zero-size header as "no more objects in this line"
    /// (`spec.md` §4.6).
    size: usize,
    /// Mark bit. Cleared at the start of every collection, set by the mark
    /// phase for every object a root chain reaches.
    marked: u8,
    /// Set when the object was allocated through `malloc_atomic`: the
    /// collector does not scan its payload for pointers.
    atomic: u8,
}

impl Object {
    /// Initializes a freshly carved-out header. Mirrors
    /// `Object_allocate` in `original_source/include/object.h`.
    ///
    /// # Safety
    /// `header` must point to at least `size_of::<Object>()` writable bytes.
    pub unsafe fn init(header: *mut Object, size: usize, atomic: bool) {
        (*header).size = size;
        (*header).atomic = atomic as u8;
        (*header).marked = 0;
    }

    /// Recovers the header from a mutator-visible payload pointer.
    ///
    /// # Safety
    /// `mutator_address` must have been returned by [`Self::mutator_address`]
    /// on a live object.
    #[inline]
    pub unsafe fn from_mutator_address(mutator_address: *mut u8) -> *mut Object {
        mutator_address.sub(size_of::<Object>()) as *mut Object
    }

    /// Address of the first byte of the mutator-visible payload, immediately
    /// following this header.
    #[inline]
    pub fn mutator_address(header: *mut Object) -> *mut u8 {
        unsafe { (header as *mut u8).add(size_of::<Object>()) }
    }

    /// Total size of the allocation, header included.
    #[inline]
    pub unsafe fn size(header: *const Object) -> usize {
        (*header).size
    }

    /// Size of the mutator-visible payload, header excluded.
    #[inline]
    pub unsafe fn mutator_size(header: *const Object) -> usize {
        (*header).size - size_of::<Object>()
    }

    #[inline]
    pub unsafe fn is_marked(header: *const Object) -> bool {
        (*header).marked == 1
    }

    #[inline]
    pub unsafe fn mark(header: *mut Object) {
        (*header).marked = 1;
    }

    #[inline]
    pub unsafe fn unmark(header: *mut Object) {
        (*header).marked = 0;
    }

    /// Stamps a zero size at a prospective next-object slot so a later
    /// object-chain walk within the same line knows where live objects end
    /// (`spec.md` §4.5.1, §4.6.1). Never called on a live object — only on
    /// the word immediately following a fresh allocation, when room remains
    /// before the current hole's limit.
    #[inline]
    pub unsafe fn set_size_zero(header: *mut Object) {
        (*header).size = 0;
    }

    #[inline]
    pub unsafe fn is_atomic(header: *const Object) -> bool {
        (*header).atomic == 1
    }

    /// Whether `pointer` falls within this object's mutator payload
    /// (`original_source/include/object.h`'s `Object_contains`, used during
    /// conservative inner-pointer resolution).
    #[inline]
    pub unsafe fn contains(header: *const Object, pointer: *const u8) -> bool {
        let start = Self::mutator_address(header as *mut Object) as *const u8;
        let end = (header as *const u8).add((*header).size);
        pointer >= start && pointer < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(8))]
    struct Backing([u8; 64]);

    #[test]
    fn init_and_accessors_round_trip() {
        let mut backing = Backing([0; 64]);
        let header = &mut backing as *mut Backing as *mut Object;
        unsafe {
            Object::init(header, 64, false);
            assert_eq!(Object::size(header), 64);
            assert_eq!(Object::mutator_size(header), 64 - size_of::<Object>());
            assert!(!Object::is_marked(header));
            Object::mark(header);
            assert!(Object::is_marked(header));
            Object::unmark(header);
            assert!(!Object::is_marked(header));
            assert!(!Object::is_atomic(header));
        }
    }

    #[test]
    fn mutator_address_round_trips() {
        let mut backing = Backing([0; 64]);
        let header = &mut backing as *mut Backing as *mut Object;
        unsafe {
            Object::init(header, 64, false);
            let mutator = Object::mutator_address(header);
            assert_eq!(Object::from_mutator_address(mutator), header);
        }
    }

    #[test]
    fn contains_respects_bounds() {
        let mut backing = Backing([0; 64]);
        let header = &mut backing as *mut Backing as *mut Object;
        unsafe {
            Object::init(header, 64, false);
            let mutator = Object::mutator_address(header);
            assert!(Object::contains(header, mutator));
            assert!(!Object::contains(header, header as *const u8));
            let end = (header as *const u8).add(64);
            assert!(!Object::contains(header, end));
        }
    }
}
