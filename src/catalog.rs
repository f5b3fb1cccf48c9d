//! Authoritative file catalog
//!
//! The catalog is the set of hashes this deployment is allowed to keep.
//! Physical files whose hash is missing from it are orphans and get removed
//! by the cleanup engine on the authoritative node.

use crate::error::FileError;
use crate::hash::ContentHash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

/// Catalog record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub hash: ContentHash,
    pub size_bytes: u64,
}

/// Queryable set of valid content hashes
#[async_trait]
pub trait Catalog: Send + Sync {
    /// All known hashes (canonical form)
    async fn list_all_hashes(&self) -> Result<HashSet<ContentHash>, FileError>;

    /// Remove entries, returning how many existed
    async fn remove_hashes(&self, hashes: &HashSet<ContentHash>) -> Result<usize, FileError>;

    /// Record an entry
    async fn insert(&self, entry: CatalogEntry) -> Result<(), FileError>;

    async fn contains(&self, hash: &ContentHash) -> Result<bool, FileError>;
}

// ============================================================================
// Sled-backed catalog
// ============================================================================

/// Catalog persisted in a sled database: `hash -> size (u64 BE)`
pub struct SledCatalog {
    db: sled::Db,
    hash_len: usize,
}

impl SledCatalog {
    /// Open or create the catalog database
    pub fn open<P: AsRef<Path>>(path: P, hash_len: usize) -> Result<Self, FileError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), entries = db.len(), "Opened catalog database");
        Ok(Self { db, hash_len })
    }

    /// Size recorded for a hash
    pub fn size_of(&self, hash: &ContentHash) -> Result<Option<u64>, FileError> {
        Ok(self.db.get(hash.as_str().as_bytes())?.and_then(|v| decode_size(&v)))
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

fn decode_size(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

#[async_trait]
impl Catalog for SledCatalog {
    async fn list_all_hashes(&self) -> Result<HashSet<ContentHash>, FileError> {
        let mut hashes = HashSet::with_capacity(self.db.len());
        for item in self.db.iter() {
            let (key, _) = item?;
            let Ok(raw) = std::str::from_utf8(&key) else {
                warn!("Skipping non-UTF8 catalog key");
                continue;
            };
            match ContentHash::parse(raw, self.hash_len) {
                Ok(hash) => {
                    hashes.insert(hash);
                }
                Err(_) => warn!(key = raw, "Skipping malformed catalog key"),
            }
        }
        Ok(hashes)
    }

    async fn remove_hashes(&self, hashes: &HashSet<ContentHash>) -> Result<usize, FileError> {
        let mut removed = 0;
        for hash in hashes {
            if self.db.remove(hash.as_str().as_bytes())?.is_some() {
                removed += 1;
            }
        }
        self.db.flush_async().await?;
        Ok(removed)
    }

    async fn insert(&self, entry: CatalogEntry) -> Result<(), FileError> {
        self.db
            .insert(entry.hash.as_str().as_bytes(), entry.size_bytes.to_be_bytes().to_vec())?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn contains(&self, hash: &ContentHash) -> Result<bool, FileError> {
        Ok(self.db.contains_key(hash.as_str().as_bytes())?)
    }
}

// ============================================================================
// In-memory catalog
// ============================================================================

/// Non-persistent catalog
#[derive(Default)]
pub struct MemoryCatalog {
    entries: RwLock<HashMap<ContentHash, u64>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I: IntoIterator<Item = CatalogEntry>>(entries: I) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(|e| (e.hash, e.size_bytes)).collect()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ContentHash, u64>>, FileError> {
        self.entries
            .read()
            .map_err(|_| FileError::Internal("catalog lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ContentHash, u64>>, FileError> {
        self.entries
            .write()
            .map_err(|_| FileError::Internal("catalog lock poisoned".into()))
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn list_all_hashes(&self) -> Result<HashSet<ContentHash>, FileError> {
        Ok(self.read()?.keys().cloned().collect())
    }

    async fn remove_hashes(&self, hashes: &HashSet<ContentHash>) -> Result<usize, FileError> {
        let mut entries = self.write()?;
        Ok(hashes.iter().filter(|h| entries.remove(*h).is_some()).count())
    }

    async fn insert(&self, entry: CatalogEntry) -> Result<(), FileError> {
        self.write()?.insert(entry.hash, entry.size_bytes);
        Ok(())
    }

    async fn contains(&self, hash: &ContentHash) -> Result<bool, FileError> {
        Ok(self.read()?.contains_key(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(c: char, size: u64) -> CatalogEntry {
        CatalogEntry {
            hash: ContentHash::parse(&c.to_string().repeat(40), 40).unwrap(),
            size_bytes: size,
        }
    }

    async fn exercise(catalog: &dyn Catalog) {
        catalog.insert(entry('a', 10)).await.unwrap();
        catalog.insert(entry('b', 20)).await.unwrap();
        catalog.insert(entry('c', 30)).await.unwrap();

        let all = catalog.list_all_hashes().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&entry('a', 0).hash));

        let to_remove: HashSet<_> = [entry('a', 0).hash, entry('d', 0).hash].into_iter().collect();
        assert_eq!(catalog.remove_hashes(&to_remove).await.unwrap(), 1);
        assert!(!catalog.contains(&entry('a', 0).hash).await.unwrap());
        assert!(catalog.contains(&entry('b', 0).hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_catalog() {
        exercise(&MemoryCatalog::new()).await;
    }

    #[tokio::test]
    async fn test_sled_catalog() {
        let temp = TempDir::new().unwrap();
        let catalog = SledCatalog::open(temp.path().join("catalog.sled"), 40).unwrap();
        exercise(&catalog).await;
        assert_eq!(catalog.size_of(&entry('c', 0).hash).unwrap(), Some(30));
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_sled_catalog_normalizes_lowercase_keys() {
        let temp = TempDir::new().unwrap();
        let catalog = SledCatalog::open(temp.path().join("catalog.sled"), 40).unwrap();
        catalog.db.insert("f".repeat(40).as_bytes(), 5u64.to_be_bytes().to_vec()).unwrap();
        catalog.db.insert(b"garbage", 1u64.to_be_bytes().to_vec()).unwrap();

        let all = catalog.list_all_hashes().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains(&entry('F', 0).hash));
    }
}
