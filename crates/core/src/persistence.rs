//! Draft persistence manager.
//!
//! Snapshots the whole [`EnrollmentDraft`] to client-local storage and hydrates it again at
//! session start. Snapshots are last-write-wins and never merged.
//!
//! ## Snapshot format
//!
//! One JSON envelope per key:
//!
//! ```text
//! { "schema_version": 1, "saved_at": "...", "draft": { ... } }
//! ```
//!
//! Restore fails closed: a snapshot that does not parse, carries another schema version, or
//! breaks a draft invariant is discarded and deleted, and the caller starts from the empty
//! draft.

use crate::constants::{DRAFT_SNAPSHOT_KEY, SNAPSHOT_SCHEMA_VERSION};
use crate::draft::EnrollmentDraft;
use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Key/blob storage for draft snapshots.
pub trait DraftStorage: Send + Sync {
    fn write(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError>;

    /// Returns `Ok(None)` when nothing is stored under `key`.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), PersistenceError>;
}

fn validate_key(key: &str) -> Result<(), PersistenceError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidKey(key.to_string()))
    }
}

/// One JSON file per key inside a single directory.
#[derive(Debug)]
pub struct FileDraftStorage {
    directory: PathBuf,
}

impl FileDraftStorage {
    pub fn new(directory: &Path) -> Result<Self, PersistenceError> {
        fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        validate_key(key)?;
        Ok(self.directory.join(format!("{key}.json")))
    }
}

impl DraftStorage for FileDraftStorage {
    /// Writes to a sibling temp file and renames it over the target, so a reader never sees a
    /// partially written snapshot.
    fn write(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        let temp_path = self.directory.join(format!(".{key}.json.tmp"));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(blob)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::Io(e)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::Io(e)),
        }
    }
}

/// Process-local storage for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryDraftStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl InMemoryDraftStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write fails with `PersistenceError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrites the stored blob directly, bypassing the snapshot envelope.
    pub fn put_raw(&self, key: &str, blob: &[u8]) {
        let mut blobs = self.blobs.lock().unwrap_or_else(|p| p.into_inner());
        blobs.insert(key.to_string(), blob.to_vec());
    }
}

impl DraftStorage for InMemoryDraftStorage {
    fn write(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        validate_key(key)?;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("storage is offline".into()));
        }
        self.put_raw(key, blob);
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        validate_key(key)?;
        let blobs = self.blobs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(blobs.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        validate_key(key)?;
        let mut blobs = self.blobs.lock().unwrap_or_else(|p| p.into_inner());
        blobs.remove(key);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotEnvelope {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    draft: EnrollmentDraft,
}

/// Result of reading the stored snapshot at session start.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    /// No snapshot was stored.
    Empty,
    Restored(Box<EnrollmentDraft>),
    /// A snapshot existed but could not be used; start from the empty draft.
    Discarded { reason: String },
}

/// Confirmation of a successful snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveReceipt {
    pub saved_at: DateTime<Utc>,
}

/// Snapshots and restores the single live draft.
#[derive(Clone)]
pub struct DraftPersistence {
    storage: Arc<dyn DraftStorage>,
    key: String,
}

impl std::fmt::Debug for DraftPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftPersistence")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl DraftPersistence {
    pub fn new(storage: Arc<dyn DraftStorage>) -> Self {
        Self::with_key(storage, DRAFT_SNAPSHOT_KEY)
    }

    pub fn with_key(storage: Arc<dyn DraftStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    /// Writes the entire draft, stamped with `now`, over any earlier snapshot.
    pub fn snapshot(
        &self,
        draft: &EnrollmentDraft,
        now: DateTime<Utc>,
    ) -> Result<SaveReceipt, PersistenceError> {
        let mut draft = draft.clone();
        draft.saved_at = Some(now);
        let envelope = SnapshotEnvelope {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            saved_at: now,
            draft,
        };
        let blob = serde_json::to_vec(&envelope).map_err(PersistenceError::Serialise)?;
        self.storage.write(&self.key, &blob)?;
        tracing::debug!(key = %self.key, bytes = blob.len(), "draft snapshot written");
        Ok(SaveReceipt { saved_at: now })
    }

    /// Reads the latest snapshot. Never fails; unusable snapshots come back as `Discarded`.
    pub fn restore(&self) -> RestoreOutcome {
        let blob = match self.storage.read(&self.key) {
            Ok(Some(blob)) => blob,
            Ok(None) => return RestoreOutcome::Empty,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "draft snapshot could not be read");
                return RestoreOutcome::Discarded {
                    reason: e.to_string(),
                };
            }
        };

        match Self::parse(&blob) {
            Ok(draft) => {
                tracing::info!(
                    draft_id = %draft.draft_id,
                    position = draft.position.position(),
                    "restored draft snapshot"
                );
                RestoreOutcome::Restored(Box::new(draft))
            }
            Err(reason) => {
                tracing::warn!(key = %self.key, reason = %reason, "discarding malformed draft snapshot");
                if let Err(e) = self.storage.delete(&self.key) {
                    tracing::warn!(key = %self.key, error = %e, "failed to delete malformed snapshot");
                }
                RestoreOutcome::Discarded { reason }
            }
        }
    }

    fn parse(blob: &[u8]) -> Result<EnrollmentDraft, String> {
        let envelope: SnapshotEnvelope =
            serde_json::from_slice(blob).map_err(|e| format!("unparseable snapshot: {e}"))?;
        if envelope.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(format!(
                "unsupported snapshot schema version {}",
                envelope.schema_version
            ));
        }
        envelope.draft.check_structure()?;
        Ok(envelope.draft)
    }

    pub fn clear(&self) -> Result<(), PersistenceError> {
        self.storage.delete(&self.key)?;
        tracing::debug!(key = %self.key, "draft snapshot cleared");
        Ok(())
    }
}
