use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::metastore::MetaStore;
use crate::sidecar::Sidecar;
use crate::store::lance::LanceBackend;
use crate::store::VectorBackend;

/// Generation of the collection directory layout.
pub const COLLECTION_SCHEMA_VERSION: u32 = 2;
const MANIFEST_FILE: &str = "collection.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub tenant: String,
    pub name: String,
    pub model_fingerprint: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state. Transitions out of `Ready` require the collection lock;
/// anything but `Ready` rejects operations with `unavailable`. The engine
/// also uses `Initializing`/`Deleting` as registry-slot markers while a
/// collection is being created or torn down, before an instance exists to
/// carry the state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Initializing,
    Ready,
    Deleting,
}

/// A live collection: its three substores plus identity and state. Shared
/// across tasks via `Arc` from the engine registry; all mutation happens
/// under the registry's per-collection lock.
#[derive(Debug)]
pub struct Collection {
    manifest: RwLock<CollectionManifest>,
    dir: PathBuf,
    pub backend: Box<dyn VectorBackend>,
    pub meta: MetaStore,
    pub sidecar: Sidecar,
    state: RwLock<CollectionState>,
}

impl Collection {
    /// Create a new collection directory with all three substores. Atomic:
    /// any mid-step failure removes the partially created directory.
    pub async fn create(
        dir: &Path,
        tenant: &str,
        name: &str,
        fingerprint: &str,
        dimension: usize,
    ) -> EngineResult<Self> {
        let result = Self::create_inner(dir, tenant, name, fingerprint, dimension).await;
        if result.is_err() && dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to clean up partial collection");
            }
        }
        result
    }

    async fn create_inner(
        dir: &Path,
        tenant: &str,
        name: &str,
        fingerprint: &str,
        dimension: usize,
    ) -> EngineResult<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create collection dir {}", dir.display()))
            .map_err(EngineError::Internal)?;

        let manifest = CollectionManifest {
            tenant: tenant.to_string(),
            name: name.to_string(),
            model_fingerprint: fingerprint.to_string(),
            schema_version: COLLECTION_SCHEMA_VERSION,
            created_at: Utc::now(),
        };
        write_manifest(dir, &manifest)?;

        let backend = LanceBackend::configure(dir, dimension, fingerprint).await?;
        let meta = MetaStore::create(dir)?;
        let sidecar = Sidecar::open(dir).map_err(EngineError::Internal)?;

        tracing::info!(tenant, collection = name, "created collection");
        Ok(Self {
            manifest: RwLock::new(manifest),
            dir: dir.to_path_buf(),
            backend: Box::new(backend),
            meta,
            sidecar,
            state: RwLock::new(CollectionState::Ready),
        })
    }

    /// Open an existing collection, verifying the embedding fingerprint and
    /// the metadata generation.
    pub async fn open(
        dir: &Path,
        fingerprint: &str,
        dimension: usize,
    ) -> EngineResult<Self> {
        let manifest = read_manifest(dir)?;
        if manifest.model_fingerprint != fingerprint {
            return Err(EngineError::ModelMismatch {
                stored: manifest.model_fingerprint,
                configured: fingerprint.to_string(),
            });
        }

        let backend = LanceBackend::configure(dir, dimension, fingerprint).await?;
        let meta = MetaStore::open(dir)?;
        let sidecar = Sidecar::open(dir).map_err(EngineError::Internal)?;

        Ok(Self {
            manifest: RwLock::new(manifest),
            dir: dir.to_path_buf(),
            backend: Box::new(backend),
            meta,
            sidecar,
            state: RwLock::new(CollectionState::Ready),
        })
    }

    /// Swap the backend for a test double.
    #[cfg(test)]
    pub(crate) fn with_backend(mut self, backend: Box<dyn VectorBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> CollectionManifest {
        self.manifest.read().clone()
    }

    pub fn state(&self) -> CollectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: CollectionState) {
        *self.state.write() = state;
    }

    pub fn ensure_ready(&self) -> EngineResult<()> {
        match self.state() {
            CollectionState::Ready => Ok(()),
            CollectionState::Initializing => Err(EngineError::Unavailable(
                "collection is initializing".to_string(),
            )),
            CollectionState::Deleting => Err(EngineError::Unavailable(
                "collection is being deleted".to_string(),
            )),
        }
    }
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

pub fn read_manifest(dir: &Path) -> EngineResult<CollectionManifest> {
    let path = manifest_path(dir);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))
        .map_err(EngineError::Internal)?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))
        .map_err(EngineError::Internal)
}

pub fn write_manifest(dir: &Path, manifest: &CollectionManifest) -> EngineResult<()> {
    let path = manifest_path(dir);
    let data = serde_json::to_string_pretty(manifest)
        .context("failed to serialize collection manifest")
        .map_err(EngineError::Internal)?;
    std::fs::write(&path, data)
        .with_context(|| format!("failed to write {}", path.display()))
        .map_err(EngineError::Internal)
}
