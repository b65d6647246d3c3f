//! # Enrolment Core
//!
//! Core engine for multi-step patient enrolment.
//!
//! This crate drives one enrolment from a blank intake to an issued patient token:
//! - A fixed, linear step sequence with per-step validation gating
//! - A one-time-code verification sub-protocol, used for health-ID linking and consent
//! - A resumable draft, snapshotted to client-local storage and restored at start
//! - Token issuance and hand-off of the finished record to a sink
//!
//! **No API concerns**: HTTP surfaces and terminal harnesses belong in `api-rest` and `cli`.
//!
//! ## Typical flow
//!
//! ```text
//! EnrollmentSession::start  -> restore snapshot (or empty draft)
//!   edit_* / set_consent    -> mutate the active step, get live field errors
//!   send_*_code / submit_*  -> verification sub-protocol
//!   advance / retreat       -> gated navigation
//!   save_draft / autosave   -> snapshot
//!   finish(sink)            -> record handed off, snapshot cleared
//! ```

pub mod autosave;
pub mod completion;
pub mod config;
pub mod consent;
pub mod constants;
pub mod dispatch;
pub mod draft;
pub mod error;
pub mod persistence;
pub mod sink;
pub mod validation;
pub mod verification;
pub mod workflow;

pub use autosave::{AutosaveTask, SharedSession};
pub use completion::{decode_scan_payload, CompletionIssuer, EnrollmentResult, ScanPayload};
pub use config::CoreConfig;
pub use consent::{ConsentCatalogue, ConsentItem};
pub use dispatch::{FixedCodeDispatcher, InMemoryCodeDispatcher};
pub use draft::{
    Address, BloodGroup, CaptureMethod, Contact, Demographics, EmergencyContacts,
    EnrollmentDraft, Gender, IdentityLinkMode, MedicalHistory, PhotoReference, Step,
};
pub use error::{DispatchError, EnrolError, EnrolResult, PersistenceError, VerificationError};
pub use persistence::{
    DraftPersistence, DraftStorage, FileDraftStorage, InMemoryDraftStorage, RestoreOutcome,
    SaveReceipt,
};
pub use sink::{EnrollmentRecord, InMemoryRecordSink, PatientRecordSink, YamlRecordSink};
pub use validation::FieldErrors;
pub use verification::{
    CodeDispatcher, DispatchId, VerificationPhase, VerificationPolicy, VerificationState,
};
pub use workflow::{EnrollmentSession, RestoreStatus, StepView};

// Re-export commonly used types
pub use enrol_types::{PhoneNumber, TextError};
pub use enrol_uuid::ShardableUuid;
