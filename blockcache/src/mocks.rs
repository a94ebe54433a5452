//! Backends with injectable latency and failures for tests.

use crate::{memory::Memory, Backend, Error, Span};
use bytes::Bytes;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Key of the synthetic object.
pub const KEY: &str = "";

/// Key that fails every read at or beyond [FAIL_FROM].
pub const FAILING_KEY: &str = "fail_over_50";

pub const FAIL_FROM: u64 = 50;

/// A 1024-byte object in which every value `0..=255` appears 4 times in a row.
pub fn synthetic() -> Vec<u8> {
    (0..=255u8).flat_map(|i| [i; 4]).collect()
}

/// Drive `future` to completion on a fresh multi-threaded runtime.
pub fn run<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(future)
}

/// Install a subscriber that prints events from the test being run.
pub fn traced() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A failure injected by [Mock].
#[derive(Debug, thiserror::Error)]
#[error("injected failure at offset {0}")]
pub struct Injected(pub u64);

/// Returns true if `err` was injected by [Mock].
pub fn is_injected(err: &Error) -> bool {
    matches!(err, Error::Backend(inner) if inner.is::<Injected>())
}

#[derive(Clone)]
pub struct Mock {
    memory: Memory,
    delay: Arc<Mutex<Duration>>,
    failing: Arc<Mutex<HashMap<String, u64>>>,
    reads: Arc<AtomicUsize>,
}

impl Mock {
    pub fn new(delay: Duration) -> Self {
        Self {
            memory: Memory::default(),
            delay: Arc::new(Mutex::new(delay)),
            failing: Arc::default(),
            reads: Arc::default(),
        }
    }

    /// A mock serving [synthetic] at [KEY] and at [FAILING_KEY] (which fails beyond
    /// [FAIL_FROM]).
    pub fn synthetic(delay: Duration) -> Self {
        let mock = Self::new(delay);
        mock.memory.insert(KEY, synthetic());
        mock.memory.insert(FAILING_KEY, synthetic());
        mock.fail_from(FAILING_KEY, FAIL_FROM);
        mock
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Change the latency of subsequent reads.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Make every read of `key` starting at or beyond `offset` fail.
    pub fn fail_from(&self, key: &str, offset: u64) {
        self.failing.lock().unwrap().insert(key.into(), offset);
    }

    /// Number of [Backend::read_at] calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Backend for Mock {
    async fn size(&self, key: &str) -> Result<u64, Error> {
        self.memory.size(key).await
    }

    async fn read_at(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, Error> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let fail_from = self.failing.lock().unwrap().get(key).copied();
        if matches!(fail_from, Some(from) if offset >= from) {
            return Err(Error::backend(Injected(offset)));
        }
        self.memory.read_at(key, offset, len).await
    }
}

/// Wraps a backend, advertising its (default) span reads as a native batched request.
#[derive(Clone)]
pub struct Batched<B> {
    inner: B,
    batches: Arc<AtomicUsize>,
    truncate: Arc<AtomicBool>,
}

impl<B: Backend> Batched<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            batches: Arc::default(),
            truncate: Arc::default(),
        }
    }

    /// Number of [Backend::read_ranges] calls served so far.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Drop the last part of every subsequent non-empty batch.
    pub fn set_truncate(&self, truncate: bool) {
        self.truncate.store(truncate, Ordering::SeqCst);
    }
}

impl<B: Backend> Backend for Batched<B> {
    const BATCHED: bool = true;

    async fn size(&self, key: &str) -> Result<u64, Error> {
        self.inner.size(key).await
    }

    async fn read_at(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, Error> {
        self.inner.read_at(key, offset, len).await
    }

    async fn read_ranges(&self, key: &str, spans: &[Span]) -> Result<Vec<Bytes>, Error> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut parts = self.inner.read_ranges(key, spans).await?;
        if self.truncate.load(Ordering::SeqCst) {
            parts.pop();
        }
        Ok(parts)
    }
}
