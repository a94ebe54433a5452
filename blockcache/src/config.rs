//! Configuration of a [crate::reader::Reader] and its [crate::cache::BlockCache].
//!
//! Besides being built in code, a [Config] can be loaded from the environment, which is how
//! plugins loaded by a host process (and therefore without an API to configure them) are tuned:
//!
//! - `BLOCKCACHE_BLOCK_SIZE`: block size, as a plain byte count or with a binary unit suffix
//!   (`512k`, `1.5MiB`, `2G`).
//! - `BLOCKCACHE_NUM_BLOCKS`: number of blocks kept in memory.
//! - `BLOCKCACHE_NUM_SIZES`: number of object sizes remembered.
//! - `BLOCKCACHE_SPLIT_RANGES`: fetch every missing block separately (`1`, `yes`, `true`) instead
//!   of coalescing contiguous blocks into one request.
//!
//! Invalid values are logged and ignored.

use crate::Error;
use std::num::NonZeroUsize;
use tracing::warn;

pub const BLOCK_SIZE_VAR: &str = "BLOCKCACHE_BLOCK_SIZE";
pub const NUM_BLOCKS_VAR: &str = "BLOCKCACHE_NUM_BLOCKS";
pub const NUM_SIZES_VAR: &str = "BLOCKCACHE_NUM_SIZES";
pub const SPLIT_RANGES_VAR: &str = "BLOCKCACHE_SPLIT_RANGES";

/// Unwrap a non-zero constant at compile time.
pub(crate) const fn nz(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(n) => n,
        None => panic!("value must be non-zero"),
    }
}

/// Configuration for a [crate::reader::Reader].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The size of the blocks fetched from the backend and cached.
    ///
    /// Larger blocks mean fewer round trips for sequential or clustered reads, but more wasted
    /// bytes for isolated small reads. Defaults to 1 MiB.
    pub block_size: NonZeroUsize,

    /// The maximum number of blocks held in memory. Defaults to 1000.
    pub cached_blocks: NonZeroUsize,

    /// The maximum number of object sizes remembered. Defaults to 10000.
    pub cached_sizes: NonZeroUsize,

    /// Whether a read spanning several missing blocks fetches each block with its own request
    /// (allowing neighbouring reads to share blocks in flight) rather than with one request per
    /// contiguous run. Defaults to false.
    pub split_ranges: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: nz(1024 * 1024),
            cached_blocks: nz(1000),
            cached_sizes: nz(10_000),
            split_ranges: false,
        }
    }
}

impl Config {
    // Setters
    /// See [Config]
    pub const fn with_block_size(mut self, block_size: NonZeroUsize) -> Self {
        self.block_size = block_size;
        self
    }
    /// See [Config]
    pub const fn with_cached_blocks(mut self, cached_blocks: NonZeroUsize) -> Self {
        self.cached_blocks = cached_blocks;
        self
    }
    /// See [Config]
    pub const fn with_cached_sizes(mut self, cached_sizes: NonZeroUsize) -> Self {
        self.cached_sizes = cached_sizes;
        self
    }
    /// See [Config]
    pub const fn with_split_ranges(mut self, split_ranges: bool) -> Self {
        self.split_ranges = split_ranges;
        self
    }

    /// Load a configuration from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load a configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let value = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = value(BLOCK_SIZE_VAR) {
            match parse_size(&raw).and_then(|n| NonZeroUsize::new(n).ok_or(Error::InvalidBlockSize))
            {
                Ok(block_size) => cfg.block_size = block_size,
                Err(err) => warn!(var = BLOCK_SIZE_VAR, %raw, %err, "ignoring setting"),
            }
        }
        if let Some(raw) = value(NUM_BLOCKS_VAR) {
            match parse_count(&raw) {
                Ok(cached_blocks) => cfg.cached_blocks = cached_blocks,
                Err(err) => warn!(var = NUM_BLOCKS_VAR, %raw, %err, "ignoring setting"),
            }
        }
        if let Some(raw) = value(NUM_SIZES_VAR) {
            match parse_count(&raw) {
                Ok(cached_sizes) => cfg.cached_sizes = cached_sizes,
                Err(err) => warn!(var = NUM_SIZES_VAR, %raw, %err, "ignoring setting"),
            }
        }
        if let Some(raw) = lookup(SPLIT_RANGES_VAR) {
            cfg.split_ranges = parse_bool(&raw);
        }
        cfg
    }
}

/// Parse a byte count such as `4096`, `512k`, `1.5MB` or `2GiB`.
///
/// Units are case-insensitive binary multiples (`K`, `KB` and `KIB` all mean 1024 bytes).
pub fn parse_size(raw: &str) -> Result<usize, Error> {
    let invalid = || Error::InvalidSize(raw.to_string());
    let s = raw.trim().to_ascii_uppercase();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number = number.trim();
    if unit.is_empty() {
        return number.parse().map_err(|_| invalid());
    }

    let multiple: u64 = match unit {
        "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(invalid()),
    };
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * multiple as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > usize::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as usize)
}

/// Parse a non-zero entry count.
fn parse_count(raw: &str) -> Result<NonZeroUsize, Error> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| Error::InvalidSize(raw.to_string()))
        .and_then(|n| NonZeroUsize::new(n).ok_or(Error::InvalidCapacity))
}

/// Parse a flag: empty, `0`, `no` and `false` (in any case) are false, anything else is true.
pub fn parse_bool(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "no" | "false"
    )
}
