//! Serve random-access reads of slow object stores from a block-aligned, range-coalescing cache.
//!
//! File-format parsers issue many small, randomly placed (and sometimes batched) byte-range reads.
//! Passing each of them through to a remote object store costs a round trip per read and
//! re-fetches overlapping ranges. A [reader::Reader] instead splits every request into fixed-size,
//! offset-aligned blocks, serves the blocks it has seen before from a [Cacher] (by default an LRU
//! [cache::BlockCache]), and fetches the missing ones from a [Backend]. Batched requests are
//! [coalesce]d so that adjacent and overlapping spans cost a single backend call.
//!
//! # Example
//!
//! ```rust
//! use blockcache::{cache::BlockCache, memory::Memory, reader::Reader};
//! use std::num::NonZeroUsize;
//!
//! futures::executor::block_on(async {
//!     let backend = Memory::default();
//!     backend.insert("bucket/object.tif", (0..=255u8).collect::<Vec<_>>());
//!
//!     let cache = BlockCache::new(16).unwrap();
//!     let reader = Reader::new(backend, cache, NonZeroUsize::new(64).unwrap(), false);
//!
//!     let mut buf = [0u8; 4];
//!     let n = reader.read_at("bucket/object.tif", &mut buf, 100).await.unwrap();
//!     assert_eq!(n, 4);
//!     assert_eq!(buf, [100, 101, 102, 103]);
//! });
//! ```
//!
//! # Status
//!
//! `blockcache` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use bytes::Bytes;
use futures::future::try_join_all;
use std::{future::Future, sync::Arc};
use thiserror::Error;

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod memory;
pub mod metered;
pub mod reader;
pub mod registry;

#[cfg(test)]
pub(crate) mod mocks;

pub use coalesce::Span;

/// Errors that can occur when reading through the cache.
///
/// Errors are [Clone] so that the outcome of a single backend fetch can be handed to every caller
/// waiting on it.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected end of object")]
    Eof,
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("batch mismatch: {0} buffers, {1} offsets")]
    BatchMismatch(usize, usize),
    #[error("invalid cache capacity")]
    InvalidCapacity,
    #[error("invalid block size")]
    InvalidBlockSize,
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("handler already registered: {0}")]
    AlreadyRegistered(String),
    #[error("no handler registered for: {0}")]
    NoHandler(String),
    #[error("backend error: {0}")]
    Backend(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary backend failure.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Arc::new(err))
    }

    /// Returns true if the error means the backing object does not exist.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A read that could not fill its buffer.
///
/// `read` is the number of bytes copied into the buffer before the read stopped, so callers can
/// still consume the prefix when `error` is [Error::Eof].
#[derive(Clone, Debug, Error)]
#[error("read stopped after {read} bytes: {error}")]
pub struct ReadError {
    pub read: usize,
    #[source]
    pub error: Error,
}

impl ReadError {
    /// Returns true if the read stopped at the end of the object.
    pub const fn is_eof(&self) -> bool {
        matches!(self.error, Error::Eof)
    }
}

/// A multi-range read in which at least one request could not be filled.
///
/// `counts` holds the number of bytes delivered to each buffer, in request order. Buffers filled
/// by fetches that succeeded remain valid even though the batch as a whole failed.
#[derive(Clone, Debug, Error)]
#[error("batch read failed: {error}")]
pub struct BatchError {
    pub counts: Vec<usize>,
    #[source]
    pub error: Error,
}

impl BatchError {
    /// Returns true if the only failure was reading past the end of the object.
    pub const fn is_eof(&self) -> bool {
        matches!(self.error, Error::Eof)
    }
}

/// The slow source of truth behind the cache, addressed by opaque string keys.
///
/// Objects are treated as immutable for as long as their blocks are cached.
pub trait Backend: Clone + Send + Sync + 'static {
    /// Whether [Backend::read_ranges] is a native batched request. When false, the reader issues
    /// one [Backend::read_at] per span itself so that the spans that succeed can still be used
    /// when others fail.
    const BATCHED: bool = false;

    /// Return the size of the object, or [Error::NotFound] if it does not exist.
    fn size(&self, key: &str) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Read up to `len` bytes of the object starting at `offset`.
    ///
    /// Returning fewer than `len` bytes (possibly none) means the object ends before
    /// `offset + len`.
    fn read_at(
        &self,
        key: &str,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Read several spans of the same object, returning one buffer per span in order.
    fn read_ranges(
        &self,
        key: &str,
        spans: &[Span],
    ) -> impl Future<Output = Result<Vec<Bytes>, Error>> + Send {
        try_join_all(
            spans
                .iter()
                .map(|span| self.read_at(key, span.offset, span.len)),
        )
    }
}

/// A store of cached blocks, keyed by object key and block index.
pub trait Cacher: Send + Sync + 'static {
    /// Insert (or overwrite) the data of a block.
    fn add(&self, key: &str, block: u64, data: Bytes);

    /// Fetch the data of a block, if cached.
    fn get(&self, key: &str, block: u64) -> Option<Bytes>;

    /// Drop every cached block of the object at `key`.
    fn purge_key(&self, key: &str);

    /// Drop every cached block.
    fn purge(&self);
}

impl<C: Cacher> Cacher for Arc<C> {
    fn add(&self, key: &str, block: u64, data: Bytes) {
        self.as_ref().add(key, block, data)
    }

    fn get(&self, key: &str, block: u64) -> Option<Bytes> {
        self.as_ref().get(key, block)
    }

    fn purge_key(&self, key: &str) {
        self.as_ref().purge_key(key)
    }

    fn purge(&self) {
        self.as_ref().purge()
    }
}
