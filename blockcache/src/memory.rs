use crate::{Backend, Error};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

/// In-memory [Backend] holding whole objects.
///
/// Useful as a reference backend and for exercising readers without a remote store. Objects can
/// be replaced at any time, which models a backing store that changed behind the cache's back.
#[derive(Clone, Default)]
pub struct Memory {
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl Memory {
    /// Store `data` at `key`, replacing any previous object.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects
            .write()
            .unwrap()
            .insert(key.into(), data.into());
    }

    /// Remove the object at `key`, returning it if it existed.
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.objects.write().unwrap().remove(key)
    }

    fn object(&self, key: &str) -> Result<Bytes, Error> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.into()))
    }
}

impl Backend for Memory {
    async fn size(&self, key: &str) -> Result<u64, Error> {
        Ok(self.object(key)?.len() as u64)
    }

    async fn read_at(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, Error> {
        let object = self.object(key)?;
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(object.len());
        let end = start.saturating_add(len).min(object.len());
        Ok(object.slice(start..end))
    }
}
