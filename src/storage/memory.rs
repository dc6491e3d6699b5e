//! In-memory storage backend.

use super::Storage;
use crate::error::Result;
use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Volatile store for tests and embedders without persistence.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RefCell<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

#[async_trait(?Send)]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.borrow_mut().insert(key.into(), value.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .borrow()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    async fn remove_all(&self, prefix: &str) -> Result<()> {
        self.entries
            .borrow_mut()
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn round_trip_and_list() {
        let storage = MemoryStorage::new();
        block_on(async {
            storage.write("cert:AA", b"one").await.unwrap();
            storage.write("cert:BB", b"two").await.unwrap();
            storage.write("consensus:2026", b"three").await.unwrap();

            assert_eq!(storage.read("cert:AA").await.unwrap().unwrap(), b"one");
            assert!(storage.read("cert:CC").await.unwrap().is_none());

            let mut certs = storage.list("cert:").await.unwrap();
            certs.sort();
            assert_eq!(certs, vec!["cert:AA", "cert:BB"]);

            storage.remove_all("cert:").await.unwrap();
            assert!(storage.list("cert:").await.unwrap().is_empty());
            assert_eq!(storage.len(), 1);
        });
    }
}
