//! Fatal-error reporting.
//!
//! The allocator never surfaces failure codes from its public allocation
//! entry points (`spec.md` §7): a call either returns a valid pointer or the
//! process aborts with a diagnostic on stderr. This mirrors the original C
//! sources' `fprintf(stderr, ...); abort();` pairs in `global_allocator.c`.

use std::fmt;

/// Prints `message` to stderr and aborts the process. Never returns.
#[cold]
pub fn fatal(message: impl fmt::Display) -> ! {
    eprintln!("conservo: {}", message);
    std::process::abort();
}

/// Configuration problems are the only recoverable error this crate ever
/// constructs: a malformed `GC_*` environment variable falls back to the
/// compiled-in default rather than aborting init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidSize { variable: &'static str, value: String },
    InvalidInteger { variable: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidSize { variable, value } => {
                write!(f, "ignoring invalid {} value {:?}", variable, value)
            }
            ConfigError::InvalidInteger { variable, value } => {
                write!(f, "ignoring invalid {} value {:?}", variable, value)
            }
        }
    }
}

/// Emits a debug diagnostic when `debug_assertions` are enabled, compiled out
/// entirely in release builds. Mirrors the original sources' `DEBUG()` macro.
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        {
            eprintln!("conservo: {}", format!($($arg)*));
        }
    };
}
