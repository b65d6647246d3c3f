//! Photo capture storage for patient enrolment.
//!
//! The enrolment engine treats a patient photo as an opaque reference. This crate is the
//! capture collaborator that produces such references: it stores the captured bytes in a
//! content-addressed layout and hands back metadata the engine can keep in its draft.
//!
//! ## Design Principles
//!
//! - Binary bytes never enter the draft snapshot; only the content hash does
//! - Stored photos are immutable (new content creates a new file)
//! - Identical captures are stored once
//! - Only image content is accepted
//!
//! ## Storage Model
//!
//! ```text
//! <photo_root>/
//! └── sha256/
//!     └── ab/
//!         └── cd/
//!             └── abcd3f9e…
//! ```

mod files;

pub use files::{PhotoStore, StoredPhoto};

/// Top-level folder under the photo root that holds content-addressed files.
pub const HASH_FOLDER_NAME: &str = "sha256";

/// Errors that can occur during photo storage operations
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    /// Root directory could not be created or is not a directory
    #[error("Invalid root directory: {0}")]
    InvalidRootDirectory(String),

    /// The supplied bytes are not a recognised image format
    #[error("Not an image: {0}")]
    NotAnImage(String),

    /// The supplied capture was empty
    #[error("Photo capture is empty")]
    EmptyCapture,

    /// Hash string was not a 64-character hex digest
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
