//! Artifact registry: immutable metadata for files a task produced.
//!
//! The registry never stores bytes. It records name, kind, size and a
//! `sha256:` checksum for a file the runner hands over, and renders a
//! download URL for the outer transport.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ArtifactError;
use crate::error::DatabaseError;
use crate::store::TaskStore;

/// File suffixes picked up when scanning a tool result for output paths.
const OUTPUT_SUFFIXES: &[&str] = &[
    "xyz", "extxyz", "traj", "cif", "vasp", "poscar", "png", "svg", "eps", "pdf", "csv", "dat",
    "txt", "json", "log",
];

/// Coarse artifact category, inferred from the file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Structure,
    Table,
    File,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Structure => "structure",
            Self::Table => "table",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "image" => Self::Image,
            "structure" => Self::Structure,
            "table" => Self::Table,
            _ => Self::File,
        }
    }

    /// Kind for a file name.
    pub fn for_name(name: &str) -> Self {
        match suffix(Path::new(name)).as_deref() {
            Some("png" | "svg" | "eps" | "pdf") => Self::Image,
            Some("xyz" | "extxyz" | "traj" | "cif" | "vasp" | "poscar") => Self::Structure,
            Some("csv" | "dat") => Self::Table,
            _ => Self::File,
        }
    }
}

/// Registered artifact metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub task_id: Uuid,
    pub name: String,
    pub kind: ArtifactKind,
    pub size_bytes: u64,
    pub checksum: String,
    /// Local path the bytes were read from.
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registry of task artifacts.
pub struct ArtifactRegistry {
    store: Arc<dyn TaskStore>,
    base_url: Option<String>,
}

impl ArtifactRegistry {
    pub fn new(store: Arc<dyn TaskStore>, base_url: Option<String>) -> Self {
        Self {
            store,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Register a file produced by `task_id` while `worker_id` holds its lease.
    ///
    /// Idempotent on `(task_id, name)`: a second registration of the same
    /// name returns the first record unchanged.
    pub async fn register_file(
        &self,
        task_id: Uuid,
        worker_id: &str,
        path: &Path,
    ) -> Result<Artifact, ArtifactError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            })?;
        if !task.state.is_executing() || task.worker_id.as_deref() != Some(worker_id) {
            return Err(ArtifactError::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| ArtifactError::InvalidName(path.to_path_buf()))?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ArtifactError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let artifact = Artifact {
            artifact_id: format!("art_{}", Uuid::new_v4().simple()),
            task_id,
            kind: ArtifactKind::for_name(&name),
            name,
            size_bytes: bytes.len() as u64,
            checksum: checksum(&bytes),
            location: Some(path.display().to_string()),
            created_at: Utc::now(),
        };

        let stored = self.store.insert_artifact(&artifact).await?;
        tracing::debug!(
            task_id = %task_id,
            artifact_id = %stored.artifact_id,
            name = %stored.name,
            size = stored.size_bytes,
            "Artifact registered"
        );
        Ok(stored)
    }

    pub async fn list(&self, task_id: Uuid) -> Result<Vec<Artifact>, DatabaseError> {
        self.store.list_artifacts(task_id).await
    }

    pub async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>, DatabaseError> {
        self.store.get_artifact(artifact_id).await
    }

    /// URL a caller can fetch the artifact from.
    pub fn download_url(&self, artifact: &Artifact) -> String {
        let path = format!("/artifacts/{}/{}", artifact.artifact_id, artifact.name);
        match &self.base_url {
            Some(base) => format!("{base}{path}"),
            None => path,
        }
    }
}

/// `sha256:<hex>` digest of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn suffix(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Existing files with a known output suffix named anywhere in `value`.
pub fn discover_paths(value: &serde_json::Value) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    collect_paths(value, &mut found);
    found.into_iter().collect()
}

fn collect_paths(value: &serde_json::Value, found: &mut BTreeSet<PathBuf>) {
    match value {
        serde_json::Value::String(s) => {
            let path = Path::new(s);
            let known = suffix(path).is_some_and(|ext| OUTPUT_SUFFIXES.contains(&ext.as_str()));
            if known && path.is_file() {
                found.insert(path.to_path_buf());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_paths(item, found);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_paths(item, found);
            }
        }
        _ => {}
    }
}
