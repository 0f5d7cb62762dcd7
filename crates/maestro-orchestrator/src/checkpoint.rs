use crate::config::{CheckpointBackendKind, CheckpointConfig};
use crate::registry::WorkflowSnapshot;
use crate::types::WorkflowStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult, WorkflowId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Durable versioned key-value storage for checkpoint blobs.
///
/// `save` must replace the stored blob atomically and must ignore a version
/// that is not newer than the stored one.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Returns false when the write was ignored as stale.
    async fn save(&self, key: &str, blob: Vec<u8>, version: u64) -> MaestroResult<bool>;
    async fn load(&self, key: &str) -> MaestroResult<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> MaestroResult<()>;
    async fn keys(&self) -> MaestroResult<Vec<String>>;
}

/// In-process backend. Survives engine restarts only within one process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointBackend {
    entries: Mutex<HashMap<String, (Vec<u8>, u64)>>,
}

impl MemoryCheckpointBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointBackend {
    async fn save(&self, key: &str, blob: Vec<u8>, version: u64) -> MaestroResult<bool> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|(_, v)| *v >= version) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (blob, version));
        Ok(true)
    }

    async fn load(&self, key: &str) -> MaestroResult<Option<(Vec<u8>, u64)>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> MaestroResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> MaestroResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// One file per key. The first line holds the version, the rest is the blob.
/// Writes go to a temporary file that is flushed to disk and then renamed over
/// the old one.
pub struct FileCheckpointBackend {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointBackend {
    /// Opens `dir`, creating it when missing.
    pub async fn new(dir: PathBuf) -> MaestroResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.ckpt"))
    }

    async fn read(&self, key: &str) -> MaestroResult<Option<(Vec<u8>, u64)>> {
        let data = match tokio::fs::read(self.path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let split = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| MaestroError::Checkpoint(format!("checkpoint '{key}' has no header")))?;
        let version = std::str::from_utf8(&data[..split])
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                MaestroError::Checkpoint(format!("checkpoint '{key}' has an invalid version"))
            })?;
        Ok(Some((data[split + 1..].to_vec(), version)))
    }
}

#[async_trait]
impl CheckpointBackend for FileCheckpointBackend {
    async fn save(&self, key: &str, blob: Vec<u8>, version: u64) -> MaestroResult<bool> {
        let _guard = self.write_lock.lock().await;
        if let Some((_, current)) = self.read(key).await? {
            if current >= version {
                return Ok(false);
            }
        }
        let mut data = format!("{version}\n").into_bytes();
        data.extend_from_slice(&blob);

        let tmp = self.dir.join(format!("{key}.ckpt.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.path(key)).await?;
        Ok(true)
    }

    async fn load(&self, key: &str) -> MaestroResult<Option<(Vec<u8>, u64)>> {
        self.read(key).await
    }

    async fn delete(&self, key: &str) -> MaestroResult<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> MaestroResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".ckpt") {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Full point-in-time state of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Workflow this checkpoint captures.
    pub workflow_id: WorkflowId,
    /// Monotonic per workflow; older versions are never written over newer ones.
    pub version: u64,
    /// Workflow status when saved.
    pub status: WorkflowStatus,
    /// Definition and per-task state.
    pub workflow: WorkflowSnapshot,
    /// Highest event sequence reflected in `workflow`.
    pub last_applied_sequence: u64,
    /// Calls reserved against the workflow budget.
    #[serde(default)]
    pub calls_used: u64,
    /// Tokens charged to the workflow budget.
    #[serde(default)]
    pub tokens_used: u64,
    /// Run time consumed so far, summed over restarts.
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Wall-clock time of the write.
    pub saved_at: DateTime<Utc>,
}

/// Serializes checkpoints onto a [`CheckpointBackend`] and hands out versions.
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    versions: Mutex<HashMap<WorkflowId, u64>>,
}

impl CheckpointStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            backend,
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Store backed by memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointBackend::new()))
    }

    /// Builds the backend named by the configuration.
    pub async fn from_config(config: &CheckpointConfig) -> MaestroResult<Self> {
        let backend: Arc<dyn CheckpointBackend> = match config.backend {
            CheckpointBackendKind::Memory => Arc::new(MemoryCheckpointBackend::new()),
            CheckpointBackendKind::File => {
                Arc::new(FileCheckpointBackend::new(config.dir.clone()).await?)
            }
        };
        Ok(Self::new(backend))
    }

    /// Next version for a workflow; strictly increasing within this store.
    pub fn next_version(&self, workflow_id: WorkflowId) -> u64 {
        let mut versions = self.versions.lock();
        let v = versions.entry(workflow_id).or_insert(0);
        *v += 1;
        *v
    }

    /// Persist a checkpoint. Returns false when a newer version is already stored.
    pub async fn save(&self, checkpoint: &Checkpoint) -> MaestroResult<bool> {
        let blob = serde_json::to_vec(checkpoint)?;
        let written = self
            .backend
            .save(&checkpoint.workflow_id.to_string(), blob, checkpoint.version)
            .await?;
        debug!(
            workflow_id = %checkpoint.workflow_id,
            version = checkpoint.version,
            sequence = checkpoint.last_applied_sequence,
            written,
            "Checkpoint saved"
        );
        Ok(written)
    }

    /// Loads the latest checkpoint of a workflow.
    pub async fn load(&self, workflow_id: WorkflowId) -> MaestroResult<Checkpoint> {
        let (blob, version) = self
            .backend
            .load(&workflow_id.to_string())
            .await?
            .ok_or_else(|| MaestroError::NotFound(format!("checkpoint for workflow {workflow_id}")))?;
        let mut checkpoint: Checkpoint = serde_json::from_slice(&blob).map_err(|e| {
            MaestroError::Checkpoint(format!("corrupt checkpoint for {workflow_id}: {e}"))
        })?;
        checkpoint.version = version;

        let mut versions = self.versions.lock();
        let v = versions.entry(workflow_id).or_insert(0);
        *v = (*v).max(version);
        Ok(checkpoint)
    }

    /// Removes a workflow's checkpoint.
    pub async fn delete(&self, workflow_id: WorkflowId) -> MaestroResult<()> {
        self.backend.delete(&workflow_id.to_string()).await?;
        self.versions.lock().remove(&workflow_id);
        info!(workflow_id = %workflow_id, "Checkpoint deleted");
        Ok(())
    }

    /// Workflows with a stored checkpoint. Keys that are not workflow ids are ignored.
    pub async fn list(&self) -> MaestroResult<Vec<WorkflowId>> {
        Ok(self
            .backend
            .keys()
            .await?
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect())
    }
}
