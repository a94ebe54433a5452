//! A [Backend] reader that serves byte ranges from fixed-size, offset-aligned cached blocks.
//!
//! # Reads
//!
//! Every request `[offset, offset + len)` is mapped to the run of blocks
//! `offset / block_size ..= (offset + len - 1) / block_size`. Blocks found in the [Cacher] are
//! copied straight into the caller's buffer. Missing blocks are fetched from the [Backend] and
//! inserted into the cache before being copied out. A block covering the end of an object is
//! shorter than the block size, and a block past the end is empty (and is never cached).
//!
//! # Fetching missing blocks
//!
//! In split mode, every missing block is fetched with its own request. Concurrent readers missing
//! the same block share a single in-flight request.
//!
//! Otherwise, missing blocks are [coalesce]d: each contiguous run of missing blocks costs a single
//! request. If the backend advertises [Backend::BATCHED], all runs are handed to it at once.
//!
//! # Object sizes
//!
//! Sizes are learned from [Reader::size] probes and from fetches that come back short, and are
//! remembered in a bounded LRU. Once the size of an object is known, blocks past its end are never
//! requested.

use crate::{
    cache::BlockCache, coalesce, config::Config, Backend, BatchError, Cacher, Error, ReadError,
    Span,
};
use bytes::Bytes;
use futures::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use lru::LruCache;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    num::NonZeroUsize,
    sync::Mutex,
};
use tracing::{debug, trace, warn};

// Fetches of a single block are shared by every reader missing that block through [Shared].
type BlockFetch = Shared<BoxFuture<'static, Result<Bytes, Error>>>;

type Fetches = Mutex<HashMap<(String, u64), InFlight>>;

/// A block fetch along with the number of readers waiting on it.
struct InFlight {
    fetch: BlockFetch,
    waiters: usize,
}

/// A reader waiting on an in-flight block fetch.
///
/// Dropping the last waiter of a fetch that has not completed forgets the fetch, so that the next
/// reader of the block starts a new one.
struct Waiter<'a> {
    fetches: &'a Fetches,
    id: (String, u64),
    fetch: BlockFetch,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut fetches = self.fetches.lock().unwrap();
        let Some(in_flight) = fetches.get_mut(&self.id) else {
            return;
        };
        if !in_flight.fetch.ptr_eq(&self.fetch) {
            return;
        }
        in_flight.waiters -= 1;
        if in_flight.waiters == 0 {
            fetches.remove(&self.id);
            trace!(key = self.id.0.as_str(), block = self.id.1, "abandoned block fetch");
        }
    }
}

/// Counters describing the effectiveness of a [Reader].
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Blocks served from the cache.
    pub hits: Counter,
    /// Blocks that had to be fetched (or joined an in-flight fetch).
    pub misses: Counter,
    /// Ranges requested from the backend.
    pub fetches: Counter,
    /// Bytes returned by the backend.
    pub fetched_bytes: Counter,
    /// Misses that shared another reader's in-flight fetch.
    pub joined: Counter,
}

impl Metrics {
    /// Register the counters in the provided registry.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "block_hits",
            "Number of blocks served from the cache",
            self.hits.clone(),
        );
        registry.register(
            "block_misses",
            "Number of blocks missing from the cache",
            self.misses.clone(),
        );
        registry.register(
            "fetches",
            "Number of ranges requested from the backend",
            self.fetches.clone(),
        );
        registry.register(
            "fetched_bytes",
            "Total amount of data read from the backend",
            self.fetched_bytes.clone(),
        );
        registry.register(
            "joined_fetches",
            "Number of misses served by another reader's in-flight fetch",
            self.joined.clone(),
        );
    }
}

/// Reads byte ranges of backend objects through a block cache.
pub struct Reader<B: Backend, C: Cacher = BlockCache> {
    backend: B,
    cache: C,
    block_size: u64,
    split: bool,

    /// Block fetches in flight (split mode only), keyed by object key and block index.
    fetches: Fetches,

    /// Known object sizes.
    sizes: Mutex<LruCache<String, u64>>,

    metrics: Metrics,
}

impl<B: Backend, C: Cacher> Reader<B, C> {
    /// Create a reader fetching `block_size` blocks of `backend` into `cache`.
    ///
    /// If `split` is true, every missing block is fetched with its own request. Otherwise
    /// contiguous missing blocks are fetched together.
    pub fn new(backend: B, cache: C, block_size: NonZeroUsize, split: bool) -> Self {
        Self {
            backend,
            cache,
            block_size: block_size.get() as u64,
            split,
            fetches: Mutex::default(),
            sizes: Mutex::new(LruCache::new(Config::default().cached_sizes)),
            metrics: Metrics::default(),
        }
    }

    /// Like [Reader::new], returning [Error::InvalidBlockSize] if `block_size` is 0.
    pub fn try_new(backend: B, cache: C, block_size: usize, split: bool) -> Result<Self, Error> {
        let block_size = NonZeroUsize::new(block_size).ok_or(Error::InvalidBlockSize)?;
        Ok(Self::new(backend, cache, block_size, split))
    }

    /// Remember the sizes of at most `cached_sizes` objects.
    pub fn with_cached_sizes(mut self, cached_sizes: NonZeroUsize) -> Self {
        self.sizes = Mutex::new(LruCache::new(cached_sizes));
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    pub fn split(&self) -> bool {
        self.split
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Return the size of the object at `key`, probing the backend if it is not known yet.
    ///
    /// Failed probes (including [Error::NotFound]) are not remembered.
    pub async fn size(&self, key: &str) -> Result<u64, Error> {
        if let Some(size) = self.known_size(key) {
            return Ok(size);
        }
        let size = self.backend.size(key).await?;
        self.sizes.lock().unwrap().put(key.to_string(), size);
        Ok(size)
    }

    fn known_size(&self, key: &str) -> Option<u64> {
        self.sizes.lock().unwrap().get(key).copied()
    }

    /// Record the size revealed by a fetch of `span` that returned `fetched` bytes.
    fn learn_size(&self, key: &str, span: Span, fetched: usize) {
        // A full fetch says nothing, and an empty one only bounds the size.
        if fetched >= span.len || (fetched == 0 && span.offset > 0) {
            return;
        }
        let size = span.offset + fetched as u64;
        trace!(key, size, "learned object size");
        self.sizes.lock().unwrap().put(key.to_string(), size);
    }

    fn block_span(&self, block: u64) -> Span {
        Span::new(block * self.block_size, self.block_size as usize)
    }

    /// Fill `buf` with the bytes of the object at `key` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is `buf.len()` on success. If the object ends
    /// before the buffer is full, the returned [ReadError] carries [Error::Eof] and the number of
    /// bytes that were read.
    pub async fn read_at(
        &self,
        key: &str,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, ReadError> {
        match self.read_at_multi(key, &mut [buf], &[offset]).await {
            Ok(counts) => Ok(counts[0]),
            Err(BatchError { counts, error }) => Err(ReadError {
                read: counts.first().copied().unwrap_or(0),
                error,
            }),
        }
    }

    /// Fill every buffer in `bufs` with the bytes of the object at `key` starting at the offset
    /// at the same position in `offsets`.
    ///
    /// Requests may overlap and come in any order. Each block needed by any request is fetched at
    /// most once per call. Returns the number of bytes copied into each buffer.
    ///
    /// If any fetch fails, the returned [BatchError] carries the first error (an
    /// [Error::NotFound], if any fetch returned one) along with the bytes delivered so far to each
    /// buffer. If every fetch succeeds but some request extends past the end of the object, the
    /// error is [Error::Eof].
    pub async fn read_at_multi(
        &self,
        key: &str,
        bufs: &mut [&mut [u8]],
        offsets: &[u64],
    ) -> Result<Vec<usize>, BatchError> {
        let mut counts = vec![0; bufs.len()];
        if bufs.len() != offsets.len() {
            return Err(BatchError {
                counts,
                error: Error::BatchMismatch(bufs.len(), offsets.len()),
            });
        }

        // Collect the blocks covering every request, skipping those past a known end.
        let limit = self
            .known_size(key)
            .map(|size| size.div_ceil(self.block_size));
        let mut blocks = BTreeSet::new();
        for (buf, &offset) in bufs.iter().zip(offsets) {
            if buf.is_empty() {
                continue;
            }
            let Some(end) = offset.checked_add(buf.len() as u64) else {
                return Err(BatchError {
                    counts,
                    error: Error::OffsetOverflow,
                });
            };
            let first = offset / self.block_size;
            let mut last = (end - 1) / self.block_size;
            if let Some(limit) = limit {
                if first >= limit {
                    continue;
                }
                last = last.min(limit - 1);
            }
            blocks.extend(first..=last);
        }
        trace!(key, requests = bufs.len(), blocks = blocks.len(), "reading blocks");

        let result = if self.split {
            self.read_split(key, &blocks, bufs, offsets, &mut counts)
                .await
        } else {
            self.read_coalesced(key, &blocks, bufs, offsets, &mut counts)
                .await
        };
        if let Err(error) = result {
            return Err(BatchError { counts, error });
        }
        if counts.iter().zip(bufs.iter()).any(|(&n, buf)| n < buf.len()) {
            return Err(BatchError {
                counts,
                error: Error::Eof,
            });
        }
        Ok(counts)
    }

    async fn read_split(
        &self,
        key: &str,
        blocks: &BTreeSet<u64>,
        bufs: &mut [&mut [u8]],
        offsets: &[u64],
        counts: &mut [usize],
    ) -> Result<(), Error> {
        let results = join_all(
            blocks
                .iter()
                .map(|&block| async move { (block, self.block(key, block).await) }),
        )
        .await;

        let mut failure = None;
        for (block, result) in results {
            match result {
                Ok(data) => self.apply(block, &data, bufs, offsets, counts),
                Err(err) => record(&mut failure, err),
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Return the data of `block`, from the cache or from a (possibly shared) backend fetch.
    async fn block(&self, key: &str, block: u64) -> Result<Bytes, Error> {
        let id = (key.to_string(), block);
        let span = self.block_span(block);

        // Create or join the fetch of the block. The cache is checked while holding the lock, as
        // a completed fetch is cached before it is removed from the map.
        let waiter = {
            let mut fetches = self.fetches.lock().unwrap();
            if let Some(data) = self.cache.get(key, block) {
                self.metrics.hits.inc();
                trace!(key, block, "block cache hit");
                return Ok(data);
            }
            self.metrics.misses.inc();
            let fetch = match fetches.entry(id.clone()) {
                Entry::Occupied(mut o) => {
                    self.metrics.joined.inc();
                    trace!(key, block, "joining block fetch");
                    let in_flight = o.get_mut();
                    in_flight.waiters += 1;
                    in_flight.fetch.clone()
                }
                Entry::Vacant(v) => {
                    debug!(key, block, offset = span.offset, len = span.len, "fetching block");
                    self.metrics.fetches.inc();
                    let backend = self.backend.clone();
                    let owned = key.to_string();
                    let fetch = async move { backend.read_at(&owned, span.offset, span.len).await }
                        .boxed()
                        .shared();
                    v.insert(InFlight {
                        fetch: fetch.clone(),
                        waiters: 1,
                    });
                    fetch
                }
            };
            Waiter {
                fetches: &self.fetches,
                id,
                fetch,
            }
        };
        let result = waiter.fetch.clone().await;

        // The first waiter to observe the result publishes it, unless the entry was purged (or
        // replaced) in the meantime.
        let mut fetches = self.fetches.lock().unwrap();
        if !matches!(fetches.get(&waiter.id), Some(current) if current.fetch.ptr_eq(&waiter.fetch))
        {
            return result;
        }
        fetches.remove(&waiter.id);
        match &result {
            Ok(data) => {
                self.metrics.fetched_bytes.inc_by(data.len() as u64);
                if !data.is_empty() {
                    self.cache.add(key, block, data.clone());
                }
                drop(fetches);
                self.learn_size(key, span, data.len());
            }
            Err(err) if !err.is_not_found() => warn!(key, block, %err, "block fetch failed"),
            Err(_) => {}
        }
        result
    }

    async fn read_coalesced(
        &self,
        key: &str,
        blocks: &BTreeSet<u64>,
        bufs: &mut [&mut [u8]],
        offsets: &[u64],
        counts: &mut [usize],
    ) -> Result<(), Error> {
        let mut missing = Vec::new();
        for &block in blocks {
            match self.cache.get(key, block) {
                Some(data) => {
                    self.metrics.hits.inc();
                    trace!(key, block, "block cache hit");
                    self.apply(block, &data, bufs, offsets, counts);
                }
                None => missing.push(self.block_span(block)),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        self.metrics.misses.inc_by(missing.len() as u64);

        let plan = coalesce::plan(&missing);
        trace!(
            key,
            blocks = missing.len(),
            fetches = plan.fetches.len(),
            "planned block fetches"
        );
        let results = self.fetch_spans(key, &plan.fetches).await;

        for piece in &plan.pieces {
            let Ok(fetched) = &results[piece.fetch] else {
                continue;
            };
            let block = missing[piece.request].offset / self.block_size;
            let data = piece.slice(fetched);
            if data.is_empty() {
                continue;
            }
            self.cache.add(key, block, data.clone());
            self.apply(block, &data, bufs, offsets, counts);
        }

        let mut failure = None;
        for (span, result) in plan.fetches.iter().zip(results) {
            match result {
                Ok(fetched) => {
                    self.metrics.fetched_bytes.inc_by(fetched.len() as u64);
                    self.learn_size(key, *span, fetched.len());
                }
                Err(err) => {
                    if !err.is_not_found() {
                        warn!(
                            key,
                            offset = span.offset,
                            len = span.len,
                            %err,
                            "range fetch failed"
                        );
                    }
                    record(&mut failure, err);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Fetch every span, returning one result per span in order.
    async fn fetch_spans(&self, key: &str, spans: &[Span]) -> Vec<Result<Bytes, Error>> {
        for span in spans {
            debug!(key, offset = span.offset, len = span.len, "fetching range");
        }
        self.metrics.fetches.inc_by(spans.len() as u64);

        if B::BATCHED {
            return match self.backend.read_ranges(key, spans).await {
                Ok(parts) if parts.len() == spans.len() => parts.into_iter().map(Ok).collect(),
                Ok(parts) => {
                    let err = Error::BatchMismatch(spans.len(), parts.len());
                    vec![Err(err); spans.len()]
                }
                Err(err) => vec![Err(err); spans.len()],
            };
        }
        join_all(
            spans
                .iter()
                .map(|span| self.backend.read_at(key, span.offset, span.len)),
        )
        .await
    }

    /// Copy the data of `block` into every buffer it intersects.
    fn apply(
        &self,
        block: u64,
        data: &[u8],
        bufs: &mut [&mut [u8]],
        offsets: &[u64],
        counts: &mut [usize],
    ) {
        let start = block * self.block_size;
        let end = start + data.len() as u64;
        for ((buf, &offset), count) in bufs.iter_mut().zip(offsets).zip(counts.iter_mut()) {
            let lo = start.max(offset);
            let hi = end.min(offset.saturating_add(buf.len() as u64));
            if lo >= hi {
                continue;
            }
            let n = (hi - lo) as usize;
            let src = (lo - start) as usize;
            let dst = (lo - offset) as usize;
            buf[dst..dst + n].copy_from_slice(&data[src..src + n]);
            *count += n;
        }
    }

    /// Drop every cached block and remembered size.
    pub fn purge(&self) {
        self.cache.purge();
        self.fetches.lock().unwrap().clear();
        self.sizes.lock().unwrap().clear();
    }

    /// Drop the cached blocks and remembered size of the object at `key`.
    pub fn purge_key(&self, key: &str) {
        self.cache.purge_key(key);
        self.fetches.lock().unwrap().retain(|(k, _), _| k != key);
        self.sizes.lock().unwrap().pop(key);
    }
}

impl<B: Backend> Reader<B> {
    /// Create a reader with its own [BlockCache], as described by `cfg`.
    pub fn from_config(backend: B, cfg: &Config) -> Result<Self, Error> {
        let cache = BlockCache::new(cfg.cached_blocks.get())?;
        Ok(
            Self::new(backend, cache, cfg.block_size, cfg.split_ranges)
                .with_cached_sizes(cfg.cached_sizes),
        )
    }
}

/// Keep the first failure of a batch, letting a missing object override any other error.
fn record(failure: &mut Option<Error>, err: Error) {
    match failure {
        Some(first) if first.is_not_found() || !err.is_not_found() => {}
        _ => *failure = Some(err),
    }
}
