//! Object storage for finalized evidence streams
//!
//! Both implementations are content-addressed: the storage reference is the
//! `sha256-…` hash of the bytes at write time. A reader that re-hashes what it
//! gets back can therefore tell if the stored object changed underneath it.
//!
//! ## Filesystem layout
//!
//! ```text
//! <root>/
//! └── blobs/
//!     ├── 9f86/                 # first 4 hex chars of the hash
//!     │   └── sha256-9f86d0…    # object bytes
//!     └── …
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::evidence::{compute_hash, HASH_PREFIX};
use crate::types::LifelineError;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage reference: {0}")]
    InvalidRef(String),

    #[error("Object storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ObjectStoreError> for LifelineError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(r) => LifelineError::NotFound(format!("object {r}")),
            ObjectStoreError::InvalidRef(r) => {
                LifelineError::Validation(format!("invalid storage reference {r}"))
            }
            other => LifelineError::Storage(other.to_string()),
        }
    }
}

/// Backend-agnostic object storage
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes, returning an opaque storage reference
    async fn put(&self, data: Bytes) -> Result<String, ObjectStoreError>;

    /// Fetch bytes by storage reference
    async fn get(&self, storage_ref: &str) -> Result<Bytes, ObjectStoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory object store (tests and development mode)
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an object's bytes without changing its reference
    ///
    /// Simulates out-of-band modification of stored evidence for audit drills.
    pub async fn overwrite_unchecked(&self, storage_ref: &str, data: Bytes) {
        self.objects
            .write()
            .await
            .insert(storage_ref.to_string(), data);
    }

    /// Drop an object without going through the ledger
    pub async fn remove_unchecked(&self, storage_ref: &str) -> bool {
        self.objects.write().await.remove(storage_ref).is_some()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, data: Bytes) -> Result<String, ObjectStoreError> {
        let hash = compute_hash(&data);
        self.objects
            .write()
            .await
            .entry(hash.clone())
            .or_insert(data);
        Ok(hash)
    }

    async fn get(&self, storage_ref: &str) -> Result<Bytes, ObjectStoreError> {
        self.objects
            .read()
            .await
            .get(storage_ref)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(storage_ref.to_string()))
    }
}

// ============================================================================
// Filesystem
// ============================================================================

/// Content-addressed object store on the local filesystem
pub struct FsObjectStore {
    root_dir: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, ObjectStoreError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(root_dir.join("blobs")).await?;

        info!(path = %root_dir.display(), "Initialized evidence object store");

        Ok(Self { root_dir })
    }

    /// Path for an object; rejects anything that is not a prefixed hex hash
    fn object_path(&self, storage_ref: &str) -> Result<PathBuf, ObjectStoreError> {
        let hash_part = storage_ref
            .strip_prefix(HASH_PREFIX)
            .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| ObjectStoreError::InvalidRef(storage_ref.to_string()))?;
        let subdir = &hash_part[..4];
        Ok(self.root_dir.join("blobs").join(subdir).join(storage_ref))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, data: Bytes) -> Result<String, ObjectStoreError> {
        let hash = compute_hash(&data);
        let path = self.object_path(&hash)?;

        if fs::metadata(&path).await.is_ok() {
            debug!(hash = %hash, "Object already exists");
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so readers never observe a partial object. Each
        // writer gets its own temp file; concurrent puts of the same bytes race
        // only on the final rename.
        let tmp_path = path.with_extension(format!("{}.partial", Uuid::new_v4().simple()));
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, &path).await?;

        info!(hash = %hash, size = data.len(), "Stored evidence object");
        Ok(hash)
    }

    async fn get(&self, storage_ref: &str) -> Result<Bytes, ObjectStoreError> {
        let path = self.object_path(storage_ref)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(storage_ref.to_string()))
            }
            Err(e) => Err(ObjectStoreError::Io(e)),
        }
    }
}
