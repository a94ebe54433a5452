//! Route object paths to the [Reader]s that serve them.
//!
//! A [Registry] maps path prefixes (such as `gs://` or `s3://bucket/`) to [Handler]s. Opening a
//! path strips the longest registered prefix that matches it and hands the remainder, the object
//! key, to the handler. Registries are plain values: each consumer owns (or shares) its own.

use crate::{reader::Reader, Backend, BatchError, Cacher, Error, ReadError};
use futures::{future::BoxFuture, FutureExt};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// An object-safe view of a [Reader], so that readers over different backends can be registered
/// side by side.
pub trait Handler: Send + Sync {
    fn size<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<u64, Error>>;

    fn read_at<'a>(
        &'a self,
        key: &'a str,
        buf: &'a mut [u8],
        offset: u64,
    ) -> BoxFuture<'a, Result<usize, ReadError>>;

    fn read_at_multi<'a, 'b: 'a>(
        &'a self,
        key: &'a str,
        bufs: &'a mut [&'b mut [u8]],
        offsets: &'a [u64],
    ) -> BoxFuture<'a, Result<Vec<usize>, BatchError>>;

    fn purge_key(&self, key: &str);
}

impl<B: Backend, C: Cacher> Handler for Reader<B, C> {
    fn size<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<u64, Error>> {
        Reader::size(self, key).boxed()
    }

    fn read_at<'a>(
        &'a self,
        key: &'a str,
        buf: &'a mut [u8],
        offset: u64,
    ) -> BoxFuture<'a, Result<usize, ReadError>> {
        Reader::read_at(self, key, buf, offset).boxed()
    }

    fn read_at_multi<'a, 'b: 'a>(
        &'a self,
        key: &'a str,
        bufs: &'a mut [&'b mut [u8]],
        offsets: &'a [u64],
    ) -> BoxFuture<'a, Result<Vec<usize>, BatchError>> {
        Reader::read_at_multi(self, key, bufs, offsets).boxed()
    }

    fn purge_key(&self, key: &str) {
        Reader::purge_key(self, key)
    }
}

/// A table of path prefixes and the handlers serving them.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every path starting with `prefix` with `handler`.
    ///
    /// Returns [Error::AlreadyRegistered] if `prefix` already has a handler.
    pub fn register(
        &mut self,
        prefix: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), Error> {
        let prefix = prefix.into();
        if self.handlers.contains_key(&prefix) {
            return Err(Error::AlreadyRegistered(prefix));
        }
        debug!(prefix, "registered handler");
        self.handlers.insert(prefix, handler);
        Ok(())
    }

    /// Remove the handler of `prefix`, returning it if there was one.
    pub fn deregister(&mut self, prefix: &str) -> Option<Arc<dyn Handler>> {
        let handler = self.handlers.remove(prefix);
        if handler.is_some() {
            debug!(prefix, "deregistered handler");
        }
        handler
    }

    /// Return the handler of the longest prefix of `path`, along with the object key (the rest
    /// of the path).
    pub fn resolve<'a>(&self, path: &'a str) -> Result<(Arc<dyn Handler>, &'a str), Error> {
        self.handlers
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, handler)| (handler.clone(), &path[prefix.len()..]))
            .ok_or_else(|| Error::NoHandler(path.to_string()))
    }

    /// Open the object at `path`, probing its size.
    pub async fn open(&self, path: &str) -> Result<Object, Error> {
        let (handler, key) = self.resolve(path)?;
        let size = handler.size(key).await?;
        Ok(Object {
            handler,
            key: key.to_string(),
            size,
        })
    }

    /// Drop everything cached about the object at `path`.
    pub fn invalidate(&self, path: &str) -> Result<(), Error> {
        let (handler, key) = self.resolve(path)?;
        handler.purge_key(key);
        Ok(())
    }
}

/// An object opened through a [Registry].
#[derive(Clone)]
pub struct Object {
    handler: Arc<dyn Handler>,
    key: String,
    size: u64,
}

impl Object {
    /// The key of the object within its handler.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The size of the object when it was opened.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// See [Reader::read_at].
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ReadError> {
        self.handler.read_at(&self.key, buf, offset).await
    }

    /// See [Reader::read_at_multi].
    pub async fn read_at_multi(
        &self,
        bufs: &mut [&mut [u8]],
        offsets: &[u64],
    ) -> Result<Vec<usize>, BatchError> {
        self.handler.read_at_multi(&self.key, bufs, offsets).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::BlockCache, config::nz, memory::Memory};
    use futures::executor::block_on;

    fn handler(memory: &Memory, cache: &BlockCache) -> Arc<dyn Handler> {
        Arc::new(Reader::new(memory.clone(), cache.partition(), nz(8), false))
    }

    #[test]
    fn test_open_and_read() {
        block_on(async {
            let memory = Memory::default();
            memory.insert("bucket/object", (0..32u8).collect::<Vec<_>>());
            let cache = BlockCache::new(16).unwrap();
            let mut registry = Registry::new();
            registry.register("mem://", handler(&memory, &cache)).unwrap();

            let object = registry.open("mem://bucket/object").await.unwrap();
            assert_eq!(object.key(), "bucket/object");
            assert_eq!(object.size(), 32);

            let mut buf = [0u8; 4];
            assert_eq!(object.read_at(&mut buf, 10).await.unwrap(), 4);
            assert_eq!(buf, [10, 11, 12, 13]);

            let (mut a, mut b) = ([0u8; 2], [0u8; 4]);
            let err = object
                .read_at_multi(&mut [&mut a[..], &mut b[..]], &[0, 30])
                .await
                .unwrap_err();
            assert!(err.is_eof());
            assert_eq!(err.counts, vec![2, 2]);
            assert_eq!(a, [0, 1]);
            assert_eq!(b[..2], [30, 31]);

            assert!(registry
                .open("mem://bucket/missing")
                .await
                .err()
                .is_some_and(|err| err.is_not_found()));
        });
    }

    #[test]
    fn test_register_twice() {
        let memory = Memory::default();
        let cache = BlockCache::new(16).unwrap();
        let mut registry = Registry::new();
        registry.register("mem://", handler(&memory, &cache)).unwrap();
        assert!(matches!(
            registry.register("mem://", handler(&memory, &cache)),
            Err(Error::AlreadyRegistered(prefix)) if prefix == "mem://"
        ));
    }

    #[test]
    fn test_longest_prefix() {
        block_on(async {
            let (wide, narrow) = (Memory::default(), Memory::default());
            wide.insert("bucket/object", vec![1u8; 8]);
            narrow.insert("object", vec![2u8; 8]);
            let cache = BlockCache::new(16).unwrap();
            let mut registry = Registry::new();
            registry.register("mem://", handler(&wide, &cache)).unwrap();
            registry
                .register("mem://bucket/", handler(&narrow, &cache))
                .unwrap();

            let object = registry.open("mem://bucket/object").await.unwrap();
            assert_eq!(object.key(), "object");
            let mut buf = [0u8; 1];
            object.read_at(&mut buf, 0).await.unwrap();
            assert_eq!(buf, [2]);

            // Once the narrower prefix is gone, the wider one serves the path.
            assert!(registry.deregister("mem://bucket/").is_some());
            assert!(registry.deregister("mem://bucket/").is_none());
            let object = registry.open("mem://bucket/object").await.unwrap();
            assert_eq!(object.key(), "bucket/object");
            object.read_at(&mut buf, 0).await.unwrap();
            assert_eq!(buf, [1]);
        });
    }

    #[test]
    fn test_no_handler() {
        block_on(async {
            let registry = Registry::new();
            assert!(matches!(
                registry.open("mem://object").await,
                Err(Error::NoHandler(path)) if path == "mem://object"
            ));
            assert!(matches!(
                registry.invalidate("mem://object"),
                Err(Error::NoHandler(_))
            ));
        });
    }

    #[test]
    fn test_invalidate() {
        block_on(async {
            let memory = Memory::default();
            memory.insert("object", vec![1u8; 8]);
            let cache = BlockCache::new(16).unwrap();
            let mut registry = Registry::new();
            registry.register("mem://", handler(&memory, &cache)).unwrap();

            let object = registry.open("mem://object").await.unwrap();
            let mut buf = [0u8; 4];
            object.read_at(&mut buf, 0).await.unwrap();
            assert_eq!(buf, [1; 4]);

            memory.insert("object", vec![2u8; 16]);
            object.read_at(&mut buf, 0).await.unwrap();
            assert_eq!(buf, [1; 4]);

            registry.invalidate("mem://object").unwrap();
            let object = registry.open("mem://object").await.unwrap();
            assert_eq!(object.size(), 16);
            object.read_at(&mut buf, 12).await.unwrap();
            assert_eq!(buf, [2; 4]);
        });
    }
}
