//! Environment-variable configuration, read once at `init` time
//! (`spec.md` §6, §9 "Environment configuration").
//!
//! Grounded in `original_source/include/options.h`: each knob has a
//! compiled-in default, is overridable through an environment variable, and
//! a malformed value is never fatal — it's reported and the default is kept.
//! This is the one place in the crate that returns a [`ConfigError`] instead
//! of calling `error::fatal`, matching `spec.md` §7's carve-out for
//! configuration parsing.

use crate::constants::{DEFAULT_FREE_SPACE_DIVISOR, DEFAULT_INITIAL_HEAP_SIZE};
use crate::error::ConfigError;
use crate::mmap::memory_limit;

/// Resolved configuration used by `init` to size the heap and choose a
/// growth/collection threshold.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    pub initial_heap_size: usize,
    pub maximum_heap_size: usize,
    pub free_space_divisor: usize,
}

impl GcConfig {
    /// Reads `GC_INITIAL_HEAP_SIZE`, `GC_MAXIMUM_HEAP_SIZE` and
    /// `GC_FREE_SPACE_DIVISOR` from the environment, falling back to
    /// compiled-in defaults for anything unset or malformed. Diagnostics for
    /// malformed values are emitted through [`crate::debug_log`].
    pub fn from_env() -> Self {
        let initial_heap_size = read_size("GC_INITIAL_HEAP_SIZE", DEFAULT_INITIAL_HEAP_SIZE);
        let maximum_heap_size = read_size("GC_MAXIMUM_HEAP_SIZE", memory_limit());
        let free_space_divisor = read_integer("GC_FREE_SPACE_DIVISOR", DEFAULT_FREE_SPACE_DIVISOR);

        Self {
            initial_heap_size,
            maximum_heap_size,
            free_space_divisor,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_heap_size: DEFAULT_INITIAL_HEAP_SIZE,
            maximum_heap_size: memory_limit(),
            free_space_divisor: DEFAULT_FREE_SPACE_DIVISOR,
        }
    }
}

/// Parses a byte-size environment variable, accepting an optional trailing
/// `k`/`K`, `m`/`M`, or `g`/`G` suffix.
fn read_size(name: &'static str, default_value: usize) -> usize {
    match parse_size(name) {
        Ok(Some(value)) => value,
        Ok(None) => default_value,
        Err(err) => {
            crate::debug_log!("{}", err);
            default_value
        }
    }
}

fn parse_size(name: &'static str) -> Result<Option<usize>, ConfigError> {
    let raw = match std::env::var(name) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };

    let trimmed = raw.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };

    digits
        .parse::<usize>()
        .map(|value| Some(value * multiplier))
        .map_err(|_| ConfigError::InvalidSize {
            variable: name,
            value: raw,
        })
}

fn read_integer(name: &'static str, default_value: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(value) => value,
            Err(_) => {
                crate::debug_log!(
                    "{}",
                    ConfigError::InvalidInteger {
                        variable: name,
                        value: raw,
                    }
                );
                default_value
            }
        },
        Err(_) => default_value,
    }
}
