//! Constants used throughout the enrolment core crate.
//!
//! Path names, storage keys and policy defaults live here so the binaries and the engine
//! agree on them.

/// Default root directory for enrolment data when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "enrolment_data";

/// Directory name (under the data root) for in-progress draft snapshots.
pub const DRAFTS_DIR_NAME: &str = "drafts";

/// Directory name (under the data root) for completed enrolment records.
pub const RECORDS_DIR_NAME: &str = "records";

/// Directory name (under the data root) for captured photos.
pub const PHOTOS_DIR_NAME: &str = "photos";

/// Storage key for the single live in-progress enrolment draft.
pub const DRAFT_SNAPSHOT_KEY: &str = "current-enrollment-draft";

/// Version of the snapshot envelope; snapshots with any other version are discarded.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Filename for a completed enrolment record inside its sharded directory.
pub const ENROLLMENT_RECORD_FILENAME: &str = "enrollment.yaml";

/// Prefix of the scannable identifier payload.
pub const SCAN_PAYLOAD_PREFIX: &str = "ENROL1:";

/// Default number of code submissions allowed per dispatch.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default lifetime of a dispatched one-time code, in seconds.
pub const DEFAULT_CODE_TTL_SECS: u64 = 300;

/// Default autosave interval, in seconds.
pub const DEFAULT_AUTOSAVE_SECS: u64 = 30;
