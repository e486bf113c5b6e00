//! Artifact Store (C6): offloads oversized node payloads to disk so
//! the durable store's `node_events.intermediate_output` column never
//! has to carry multi-megabyte blobs.
//!
//! Grounded on `ob-workflow`'s `blob_store.rs` (trait shape, local and
//! in-memory implementations) with the URI scheme and offload
//! threshold taken from `agent_executor.py`'s `ArtifactManager`.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid artifact uri: {0}")]
    InvalidRef(String),

    #[error("artifact lost: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<ArtifactError> for substrate_core::SubstrateError {
    fn from(err: ArtifactError) -> Self {
        substrate_core::SubstrateError::ArtifactMissing(err.to_string())
    }
}

/// Default content above which a node output is offloaded to the
/// artifact store rather than stored inline (matches
/// `ArtifactManager.should_offload`'s default).
pub const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 5 * 1024;

/// Returns true when `value` serialized exceeds `threshold_bytes`.
pub fn should_offload(value: &serde_json::Value, threshold_bytes: usize) -> bool {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len() > threshold_bytes,
        Err(_) => true,
    }
}

/// Abstract artifact storage for oversized node outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `value` under `execution_id`/`node_id`, returning an
    /// `artifact://` reference URI.
    async fn save(
        &self,
        execution_id: Uuid,
        node_id: &str,
        value: &serde_json::Value,
    ) -> Result<String, ArtifactError>;

    /// Load a value previously saved under `uri`.
    async fn load(&self, uri: &str) -> Result<serde_json::Value, ArtifactError>;

    async fn delete(&self, uri: &str) -> Result<(), ArtifactError>;
}

/// Filesystem-backed artifact store, one subdirectory per execution.
pub struct LocalArtifactStore {
    base_dir: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn execution_dir(&self, execution_id: Uuid) -> PathBuf {
        self.base_dir.join(execution_id.to_string())
    }

    fn path_from_uri(&self, uri: &str) -> Result<PathBuf, ArtifactError> {
        uri.strip_prefix("artifact://")
            .map(|rest| self.base_dir.join(rest))
            .ok_or_else(|| ArtifactError::InvalidRef(uri.to_string()))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn save(
        &self,
        execution_id: Uuid,
        node_id: &str,
        value: &serde_json::Value,
    ) -> Result<String, ArtifactError> {
        let dir = self.execution_dir(execution_id);
        tokio::fs::create_dir_all(&dir).await?;

        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.6f");
        let filename = format!("{node_id}_{timestamp}.json");
        let path = dir.join(&filename);

        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes).await?;

        let uri = format!("artifact://{}/{}", execution_id, filename);
        tracing::debug!(uri = %uri, "saved artifact");
        Ok(uri)
    }

    async fn load(&self, uri: &str) -> Result<serde_json::Value, ArtifactError> {
        let path = self.path_from_uri(uri)?;
        if !path.exists() {
            return Err(ArtifactError::NotFound(uri.to_string()));
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn delete(&self, uri: &str) -> Result<(), ArtifactError> {
        let path = self.path_from_uri(uri)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// In-memory artifact store for tests and for callers embedding the
/// control plane without a writable filesystem.
pub struct InMemoryArtifactStore {
    blobs: std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<String, serde_json::Value>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            blobs: Default::default(),
        }
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save(
        &self,
        execution_id: Uuid,
        node_id: &str,
        value: &serde_json::Value,
    ) -> Result<String, ArtifactError> {
        let uri = format!("artifact://{}/{}_{}", execution_id, node_id, Uuid::new_v4());
        self.blobs.write().await.insert(uri.clone(), value.clone());
        Ok(uri)
    }

    async fn load(&self, uri: &str) -> Result<serde_json::Value, ArtifactError> {
        self.blobs
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(uri.to_string()))
    }

    async fn delete(&self, uri: &str) -> Result<(), ArtifactError> {
        self.blobs.write().await.remove(uri);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn offload_threshold_respects_size() {
        let small = serde_json::json!({"ok": true});
        let big = serde_json::json!({"data": "x".repeat(10_000)});
        assert!(!should_offload(&small, DEFAULT_OFFLOAD_THRESHOLD_BYTES));
        assert!(should_offload(&big, DEFAULT_OFFLOAD_THRESHOLD_BYTES));
    }

    #[tokio::test]
    async fn local_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let execution_id = Uuid::new_v4();
        let value = serde_json::json!({"rows": [1, 2, 3]});

        let uri = store.save(execution_id, "fetch_rows", &value).await.unwrap();
        assert!(uri.starts_with("artifact://"));

        let loaded = store.load(&uri).await.unwrap();
        assert_eq!(loaded, value);

        store.delete(&uri).await.unwrap();
        let err = store.load(&uri).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_store_rejects_foreign_uri_scheme() {
        let dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let err = store.load("memory://nope").await.unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidRef(_)));
    }

    #[tokio::test]
    async fn in_memory_store_roundtrip() {
        let store = InMemoryArtifactStore::new();
        let execution_id = Uuid::new_v4();
        let value = serde_json::json!({"k": "v"});
        let uri = store.save(execution_id, "node_a", &value).await.unwrap();
        assert_eq!(store.load(&uri).await.unwrap(), value);
    }
}
