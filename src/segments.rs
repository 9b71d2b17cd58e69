//! Host `.data`/`.bss` segment discovery, supplementing the fixed root set
//! the mutator registers through [`crate::api::add_roots`] (`spec.md` §6
//! "Root symbols", expanded in `SPEC_FULL.md` §4.8).
//!
//! `original_source/src/dynamic_loading.c` and `include/segments.h` walk the
//! dynamic loader's image list to find every loaded object's data and bss
//! sections. Reimplementing dynamic-loader image walking is out of scope
//! here (the host owns root registration beyond static data/bss, per
//! `spec.md` §1) — this module only resolves the running binary's own
//! static data and bss extent, mirroring the linker-provided boundary
//! symbols the original's ELF-oriented build also relies on.

/// Supplies the address range of the process's statically allocated data —
/// initialized (`.data`) and zero-initialized (`.bss`) globals — so the
/// collector can conservatively scan them as roots alongside whatever the
/// host adds through `add_roots`.
pub trait SegmentProvider: Send + Sync {
    /// Returns `(data_start, data_end, bss_start, bss_end)`, or `None` if
    /// this platform exposes no such boundary symbols.
    fn data_and_bss(&self) -> Option<(*const u8, *const u8, *const u8, *const u8)>;
}

/// Contributes no root region. Used on platforms without the boundary
/// symbols `LinkerSegmentProvider` relies on; the host is then solely
/// responsible for registering roots.
pub struct NullSegmentProvider;

impl SegmentProvider for NullSegmentProvider {
    fn data_and_bss(&self) -> Option<(*const u8, *const u8, *const u8, *const u8)> {
        None
    }
}

unsafe impl Send for NullSegmentProvider {}
unsafe impl Sync for NullSegmentProvider {}

#[cfg(target_os = "linux")]
mod linker {
    // GNU ld defines these for every dynamically linked ELF executable; glibc
    // itself relies on `__data_start`/`_end` existing for very similar reasons
    // (e.g. `__libc_init_first`). Plain (non-weak) externs, since stable Rust
    // has no portable way to ask for weak linkage and in practice a
    // GNU-ld-linked executable always provides them.
    extern "C" {
        static __data_start: u8;
        static __bss_start: u8;
        static _edata: u8;
        static _end: u8;
    }

    /// Reads the GNU linker's conventional `__data_start`/`_edata`/
    /// `__bss_start`/`_end` boundary symbols.
    pub struct LinkerSegmentProvider;

    impl super::SegmentProvider for LinkerSegmentProvider {
        fn data_and_bss(&self) -> Option<(*const u8, *const u8, *const u8, *const u8)> {
            unsafe {
                let data_start = &__data_start as *const u8;
                let data_end = &_edata as *const u8;
                let bss_start = &__bss_start as *const u8;
                let bss_end = &_end as *const u8;

                Some((data_start, data_end, bss_start, bss_end))
            }
        }
    }

    unsafe impl Send for LinkerSegmentProvider {}
    unsafe impl Sync for LinkerSegmentProvider {}
}

#[cfg(target_os = "linux")]
pub use linker::LinkerSegmentProvider;

/// Returns the best [`SegmentProvider`] for the current platform.
pub fn default_provider() -> Box<dyn SegmentProvider> {
    #[cfg(target_os = "linux")]
    {
        Box::new(LinkerSegmentProvider)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullSegmentProvider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_provider_contributes_nothing() {
        assert!(NullSegmentProvider.data_and_bss().is_none());
    }
}
