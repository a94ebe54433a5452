use crate::{Backend, Error, Span};
use bytes::Bytes;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;

pub struct Metrics {
    pub backend_reads: Counter,
    pub backend_read_bytes: Counter,
    pub backend_size_probes: Counter,
    pub backend_errors: Counter,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            backend_reads: Counter::default(),
            backend_read_bytes: Counter::default(),
            backend_size_probes: Counter::default(),
            backend_errors: Counter::default(),
        };

        registry.register(
            "backend_reads",
            "Total number of ranges read from the backend",
            metrics.backend_reads.clone(),
        );
        registry.register(
            "backend_read_bytes",
            "Total amount of data read from the backend",
            metrics.backend_read_bytes.clone(),
        );
        registry.register(
            "backend_size_probes",
            "Total number of object sizes probed",
            metrics.backend_size_probes.clone(),
        );
        registry.register(
            "backend_errors",
            "Total number of failed backend requests",
            metrics.backend_errors.clone(),
        );

        metrics
    }

    fn record<T>(&self, result: &Result<T, Error>) {
        if result.is_err() {
            self.backend_errors.inc();
        }
    }
}

/// A wrapper around a [Backend] implementation that tracks metrics.
#[derive(Clone)]
pub struct Metered<B> {
    inner: B,
    metrics: Arc<Metrics>,
}

impl<B> Metered<B> {
    pub fn new(inner: B, registry: &mut Registry) -> Self {
        Self {
            inner,
            metrics: Metrics::new(registry).into(),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl<B: Backend> Backend for Metered<B> {
    const BATCHED: bool = B::BATCHED;

    async fn size(&self, key: &str) -> Result<u64, Error> {
        self.metrics.backend_size_probes.inc();
        let result = self.inner.size(key).await;
        self.metrics.record(&result);
        result
    }

    async fn read_at(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, Error> {
        self.metrics.backend_reads.inc();
        let result = self.inner.read_at(key, offset, len).await;
        self.metrics.record(&result);
        if let Ok(data) = &result {
            self.metrics.backend_read_bytes.inc_by(data.len() as u64);
        }
        result
    }

    async fn read_ranges(&self, key: &str, spans: &[Span]) -> Result<Vec<Bytes>, Error> {
        self.metrics.backend_reads.inc_by(spans.len() as u64);
        let result = self.inner.read_ranges(key, spans).await;
        self.metrics.record(&result);
        if let Ok(parts) = &result {
            let bytes: usize = parts.iter().map(Bytes::len).sum();
            self.metrics.backend_read_bytes.inc_by(bytes as u64);
        }
        result
    }
}
