//! Content-addressed photo store implementation.
//!
//! Photos are identified by the SHA-256 digest of their bytes. The digest doubles as the
//! opaque handle the enrolment draft stores, so a restored draft can always locate its photo
//! again without holding any binary data itself.

use crate::{FilesError, HASH_FOLDER_NAME};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Metadata for a stored photo.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoredPhoto {
    /// Hexadecimal SHA-256 digest of the photo bytes
    pub hash: String,

    /// Detected media type, e.g. `image/jpeg`
    pub media_type: String,

    /// Size of the photo in bytes
    pub size_bytes: u64,

    /// UTC timestamp when the bytes were first stored
    pub stored_at: DateTime<Utc>,
}

/// Store for captured patient photos.
///
/// The store is rooted at one directory and never writes outside it. Paths are derived only
/// from validated hex digests, so caller input cannot steer a write elsewhere.
#[derive(Debug)]
pub struct PhotoStore {
    root_directory: PathBuf,
}

impl PhotoStore {
    /// Opens (creating if necessary) a photo store rooted at `root_directory`.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidRootDirectory` if the directory cannot be created or the
    /// path exists but is not a directory.
    pub fn new(root_directory: &Path) -> Result<Self, FilesError> {
        if root_directory.exists() && !root_directory.is_dir() {
            return Err(FilesError::InvalidRootDirectory(format!(
                "Path is not a directory: {}",
                root_directory.display()
            )));
        }

        fs::create_dir_all(root_directory).map_err(|e| {
            FilesError::InvalidRootDirectory(format!(
                "Cannot create {}: {}",
                root_directory.display(),
                e
            ))
        })?;

        Ok(Self {
            root_directory: root_directory.to_path_buf(),
        })
    }

    /// Stores a captured photo and returns its metadata.
    ///
    /// Capturing the same bytes twice returns the metadata of the existing file rather than
    /// writing a second copy.
    ///
    /// # Errors
    ///
    /// Returns `FilesError` if:
    /// - the capture is empty
    /// - the bytes are not a recognised image format
    /// - the storage directory or file cannot be written
    pub fn store(&self, bytes: &[u8]) -> Result<StoredPhoto, FilesError> {
        if bytes.is_empty() {
            return Err(FilesError::EmptyCapture);
        }

        let media_type = match infer::get(bytes) {
            Some(kind) if kind.matcher_type() == infer::MatcherType::Image => {
                kind.mime_type().to_string()
            }
            Some(kind) => return Err(FilesError::NotAnImage(kind.mime_type().to_string())),
            None => return Err(FilesError::NotAnImage("unknown format".into())),
        };

        let hash = hex::encode(Sha256::digest(bytes));
        let storage_path = self.storage_path(&hash);

        let stored_at = if storage_path.is_file() {
            let modified = fs::metadata(&storage_path)?.modified()?;
            DateTime::<Utc>::from(modified)
        } else {
            if let Some(parent) = storage_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&storage_path, bytes)?;
            tracing::debug!(hash = %hash, size = bytes.len(), "stored patient photo");
            Utc::now()
        };

        Ok(StoredPhoto {
            hash,
            media_type,
            size_bytes: bytes.len() as u64,
            stored_at,
        })
    }

    /// Reads a source file from disk and stores it.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the source cannot be read, otherwise as [`Self::store`].
    pub fn add(&self, source_path: &Path) -> Result<StoredPhoto, FilesError> {
        let bytes = fs::read(source_path).map_err(|e| {
            FilesError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to read source file {}: {}",
                    source_path.display(),
                    e
                ),
            ))
        })?;
        self.store(&bytes)
    }

    /// Retrieves photo bytes by hash, verifying them against the hash.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidHash` for a malformed hash or for stored bytes that no
    /// longer match it, and `FilesError::Io` if the file is missing or unreadable.
    pub fn read(&self, hash: &str) -> Result<Vec<u8>, FilesError> {
        if !Self::is_valid_hash(hash) {
            return Err(FilesError::InvalidHash(hash.to_string()));
        }

        let storage_path = self.storage_path(hash);
        let bytes = fs::read(&storage_path)?;
        if hex::encode(Sha256::digest(&bytes)) != hash {
            return Err(FilesError::InvalidHash(format!(
                "content of {} does not match its hash",
                storage_path.display()
            )));
        }
        Ok(bytes)
    }

    /// Returns true if a photo with this hash is present.
    pub fn contains(&self, hash: &str) -> bool {
        Self::is_valid_hash(hash) && self.storage_path(hash).is_file()
    }

    fn is_valid_hash(hash: &str) -> bool {
        hash.len() == 64
            && hash
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// `<root>/sha256/<h[0..2]>/<h[2..4]>/<h>`; callers validate `hash` before touching disk.
    fn storage_path(&self, hash: &str) -> PathBuf {
        if hash.len() < 4 || !hash.is_ascii() {
            return self.root_directory.join(HASH_FOLDER_NAME).join("invalid");
        }
        self.root_directory
            .join(HASH_FOLDER_NAME)
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(hash)
    }
}
