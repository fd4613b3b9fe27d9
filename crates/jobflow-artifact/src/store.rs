//! Artifact storage contract
//!
//! The orchestrator never sees the storage format. It reads values, writes
//! values and toggles the single-writer edit lock through [`ArtifactStore`].

use crate::artifact::{ArtifactId, ArtifactMetadata, DataArtifact};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Read of an artifact that was never written
    #[error("artifact {0} has never been written")]
    NotWritten(ArtifactId),

    /// Another job holds the write lock
    #[error("artifact {artifact} is locked by {holder}")]
    Locked {
        /// Locked artifact
        artifact: ArtifactId,
        /// Current lock holder
        holder: String,
    },

    /// Backend failure
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Storage contract for artifact values and write state
///
/// Implementations must be safe to call from worker and reaper threads.
pub trait ArtifactStore: Send + Sync + Debug {
    /// Read the current value
    ///
    /// # Errors
    /// `StoreError::NotWritten` if the artifact has no value yet
    fn read(&self, artifact: &DataArtifact) -> Result<Value, StoreError>;

    /// Write a value and stamp `last_write_time = now`
    ///
    /// When `editor` holds the edit lock, the lock is released as part of the
    /// same write.
    ///
    /// # Errors
    /// `StoreError::Locked` if another editor holds the lock
    fn write(
        &self,
        artifact: &DataArtifact,
        value: Value,
        editor: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Current write state
    fn metadata(&self, artifact: &DataArtifact) -> ArtifactMetadata;

    /// Acquire (`true`) or release (`false`) the edit lock for `editor`
    ///
    /// Acquiring twice for the same editor and releasing an unlocked
    /// artifact are no-ops.
    ///
    /// # Errors
    /// `StoreError::Locked` if another editor holds the lock
    fn set_edit_in_progress(
        &self,
        artifact: &DataArtifact,
        in_progress: bool,
        editor: &str,
    ) -> Result<(), StoreError>;

    /// Written and not being edited
    fn is_ready(&self, artifact: &DataArtifact) -> bool {
        self.metadata(artifact).is_ready()
    }
}

#[derive(Debug, Default)]
struct Entry {
    value: Option<Value>,
    meta: ArtifactMetadata,
}

/// In-memory artifact store
///
/// One lock guards every entry, so a write and its unlock are observed
/// together.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: Mutex<HashMap<ArtifactId, Entry>>,
}

impl InMemoryArtifactStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write with an explicit timestamp
    ///
    /// Used to seed inputs and to back-date outputs when exercising
    /// validity periods.
    ///
    /// # Errors
    /// `StoreError::Locked` if a job holds the lock
    pub fn write_at(
        &self,
        artifact: &DataArtifact,
        value: Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write_inner(artifact, value, None, at)
    }

    /// Number of artifacts known to the store
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn write_inner(
        &self,
        artifact: &DataArtifact,
        value: Value,
        editor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(artifact.id().clone()).or_default();

        if let Some(holder) = entry.meta.editor.as_deref() {
            if editor != Some(holder) {
                return Err(StoreError::Locked {
                    artifact: artifact.id().clone(),
                    holder: holder.to_string(),
                });
            }
        }

        entry.value = Some(value);
        entry.meta.last_write_time = Some(at);
        entry.meta.edit_in_progress = false;
        entry.meta.editor = None;

        tracing::trace!(artifact = %artifact.id(), "artifact written");
        Ok(())
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn read(&self, artifact: &DataArtifact) -> Result<Value, StoreError> {
        self.entries
            .lock()
            .get(artifact.id())
            .and_then(|e| e.value.clone())
            .ok_or_else(|| StoreError::NotWritten(artifact.id().clone()))
    }

    fn write(
        &self,
        artifact: &DataArtifact,
        value: Value,
        editor: Option<&str>,
    ) -> Result<(), StoreError> {
        self.write_inner(artifact, value, editor, Utc::now())
    }

    fn metadata(&self, artifact: &DataArtifact) -> ArtifactMetadata {
        self.entries
            .lock()
            .get(artifact.id())
            .map(|e| e.meta.clone())
            .unwrap_or_default()
    }

    fn set_edit_in_progress(
        &self,
        artifact: &DataArtifact,
        in_progress: bool,
        editor: &str,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(artifact.id().clone()).or_default();

        match entry.meta.editor.as_deref() {
            Some(holder) if holder != editor => Err(StoreError::Locked {
                artifact: artifact.id().clone(),
                holder: holder.to_string(),
            }),
            _ => {
                entry.meta.edit_in_progress = in_progress;
                entry.meta.editor = in_progress.then(|| editor.to_string());
                Ok(())
            }
        }
    }
}
