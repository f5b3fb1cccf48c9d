//! Content-addressed file storage across hot and cold tiers
//!
//! Files are named by their canonical content hash and bucketed by the first
//! hash character:
//!
//! ```text
//! <tier root>/
//! ├── 0/
//! │   └── 0A1B2C...        # complete file, named by hash
//! ├── F/
//! │   ├── F00D...
//! │   └── F00D....<id>.tmp # in-flight write, renamed into place when done
//! ```
//!
//! Writes always land in a uniquely named temp file first and are renamed
//! into place, so a reader sees either no file or a complete one.

use crate::error::FileError;
use crate::hash::ContentHash;
use filetime::FileTime;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Suffixes marking partial writes
pub const TEMP_SUFFIXES: &[&str] = &[".tmp", ".dl"];

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

/// A physical file in one tier
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub hash: ContentHash,
    pub tier: Tier,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_access: SystemTime,
    pub last_write: SystemTime,
}

/// Result of walking a tier
#[derive(Debug, Default)]
pub struct FileScan {
    /// Hash-named files, least recently accessed first
    pub files: Vec<CachedFile>,
    /// Entries that could not be read
    pub errors: usize,
}

impl FileScan {
    /// Every entry under the root was read
    pub fn is_complete(&self) -> bool {
        self.errors == 0
    }
}

/// Tier statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub files: u64,
    pub bytes: u64,
}

// ============================================================================
// Single tier
// ============================================================================

/// One storage tier rooted at a directory
#[derive(Debug, Clone)]
pub struct TierStore {
    tier: Tier,
    root: PathBuf,
    hash_len: usize,
}

impl TierStore {
    /// Open a tier, creating its root directory
    pub async fn new<P: AsRef<Path>>(tier: Tier, root: P, hash_len: usize) -> Result<Self, FileError> {
        if hash_len == 0 {
            return Err(FileError::Config("hash_len must be at least 1".to_string()));
        }
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        info!(tier = %tier, path = %root.display(), "Initialized tier store");

        Ok(Self { tier, root, hash_len })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_len(&self) -> usize {
        self.hash_len
    }

    /// Final path for a hash
    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.shard_prefix()).join(hash.as_str())
    }

    fn temp_path_for(&self, hash: &ContentHash) -> PathBuf {
        self.root
            .join(hash.shard_prefix())
            .join(format!("{}.{}.tmp", hash, uuid::Uuid::new_v4().simple()))
    }

    /// Check if a file exists
    pub async fn exists(&self, hash: &ContentHash) -> bool {
        fs::metadata(self.path_for(hash))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Describe a stored file, `None` if absent
    pub async fn stat(&self, hash: &ContentHash) -> Result<Option<CachedFile>, FileError> {
        let path = self.path_for(hash);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(self.describe(hash.clone(), path, &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a file for reading, returning the handle and its length
    pub async fn open(&self, hash: &ContentHash) -> Result<Option<(fs::File, u64)>, FileError> {
        match fs::File::open(self.path_for(hash)).await {
            Ok(file) => {
                let len = file.metadata().await?.len();
                Ok(Some((file, len)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a whole file
    pub async fn read(&self, hash: &ContentHash) -> Result<Vec<u8>, FileError> {
        match fs::read(self.path_for(hash)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a file atomically (temp file, then rename into place)
    pub async fn write(&self, hash: &ContentHash, data: &[u8]) -> Result<u64, FileError> {
        let final_path = self.path_for(hash);
        let temp_path = self.temp_path_for(hash);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            fs::remove_file(&temp_path).await.ok();
            return Err(e.into());
        }

        debug!(tier = %self.tier, hash = %hash, size = data.len(), "Stored file");
        Ok(data.len() as u64)
    }

    /// Copy a file from another tier into this one, atomically
    pub async fn copy_from(&self, source: &TierStore, hash: &ContentHash) -> Result<u64, FileError> {
        let source_path = source.path_for(hash);
        let final_path = self.path_for(hash);
        let temp_path = self.temp_path_for(hash);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let copied = match fs::copy(&source_path, &temp_path).await {
            Ok(n) => n,
            Err(e) => {
                fs::remove_file(&temp_path).await.ok();
                if e.kind() == std::io::ErrorKind::NotFound {
                    return Err(FileError::NotFound(hash.to_string()));
                }
                return Err(e.into());
            }
        };

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            fs::remove_file(&temp_path).await.ok();
            return Err(e.into());
        }

        debug!(from = %source.tier, to = %self.tier, hash = %hash, size = copied, "Copied file between tiers");
        Ok(copied)
    }

    /// Delete a file, returning whether it existed
    pub async fn delete(&self, hash: &ContentHash) -> Result<bool, FileError> {
        delete_path(&self.path_for(hash)).await
    }

    /// Set the last-access time of a file. Returns `false` if it is gone.
    pub fn touch(&self, hash: &ContentHash, at: SystemTime) -> Result<bool, FileError> {
        match filetime::set_file_atime(self.path_for(hash), FileTime::from_system_time(at)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate hash-named files, least recently accessed first.
    ///
    /// Blocking; call from `spawn_blocking` on the runtime.
    pub fn list_files(&self) -> Vec<CachedFile> {
        self.scan_files().files
    }

    /// Like [`list_files`](Self::list_files), also counting entries that
    /// could not be read. Blocking.
    pub fn scan_files(&self) -> FileScan {
        let mut errors = 0;
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(tier = %self.tier, error = %e, "Failed to read directory entry");
                    errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(hash) = entry
                .file_name()
                .to_str()
                .and_then(|name| ContentHash::from_file_name(name, self.hash_len))
            else {
                continue;
            };
            match entry.metadata() {
                Ok(meta) => files.push(self.describe(hash, entry.into_path(), &meta)),
                Err(e) => {
                    warn!(tier = %self.tier, hash = %hash, error = %e, "Failed to read file metadata");
                    errors += 1;
                }
            }
        }

        files.sort_by_key(|f| f.last_access);
        FileScan { files, errors }
    }

    /// Enumerate temp files with their last-write time. Blocking.
    pub fn list_temp_files(&self) -> Vec<(PathBuf, SystemTime)> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
                TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
            })
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((entry.into_path(), modified))
            })
            .collect()
    }

    /// Count files and bytes in this tier
    pub async fn stats(&self) -> Result<TierStats, FileError> {
        let store = self.clone();
        let files = tokio::task::spawn_blocking(move || store.list_files())
            .await
            .map_err(|e| FileError::Internal(format!("stats task failed: {}", e)))?;

        Ok(TierStats {
            files: files.len() as u64,
            bytes: files.iter().map(|f| f.size_bytes).sum(),
        })
    }

    fn describe(&self, hash: ContentHash, path: PathBuf, meta: &std::fs::Metadata) -> CachedFile {
        let last_write = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        CachedFile {
            hash,
            tier: self.tier,
            path,
            size_bytes: meta.len(),
            last_access: meta.accessed().unwrap_or(last_write),
            last_write,
        }
    }
}

/// Remove a file by path, returning whether it existed
pub async fn delete_path(path: &Path) -> Result<bool, FileError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Both tiers
// ============================================================================

/// Hot tier plus optional cold tier
#[derive(Debug, Clone)]
pub struct ContentStore {
    hot: TierStore,
    cold: Option<TierStore>,
}

impl ContentStore {
    pub async fn new<P: AsRef<Path>>(
        hot_dir: P,
        cold_dir: Option<&Path>,
        hash_len: usize,
    ) -> Result<Self, FileError> {
        let hot = TierStore::new(Tier::Hot, hot_dir, hash_len).await?;
        let cold = match cold_dir {
            Some(dir) => Some(TierStore::new(Tier::Cold, dir, hash_len).await?),
            None => None,
        };
        Ok(Self { hot, cold })
    }

    pub fn hot(&self) -> &TierStore {
        &self.hot
    }

    pub fn cold(&self) -> Option<&TierStore> {
        self.cold.as_ref()
    }

    /// Tier holding the long-term copy: cold when enabled, otherwise hot
    pub fn authoritative(&self) -> &TierStore {
        self.cold.as_ref().unwrap_or(&self.hot)
    }

    pub fn hash_len(&self) -> usize {
        self.hot.hash_len
    }

    /// Parse a raw hash with this store's hash length
    pub fn parse_hash(&self, raw: &str) -> Result<ContentHash, FileError> {
        ContentHash::parse(raw, self.hot.hash_len)
    }
}
