use crate::draft::Step;
use crate::validation::FieldErrors;

/// Errors raised by the enrolment engine.
///
/// Field-level validation failures are not listed individually; they travel inside
/// [`EnrolError::StepBlocked`] as a [`FieldErrors`] map so a step surface can render them
/// next to the offending inputs.
#[derive(Debug, thiserror::Error)]
pub enum EnrolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("cannot leave {step}: {errors}")]
    StepBlocked { step: Step, errors: FieldErrors },
    #[error("{step} is not the active step (active: {active})")]
    StepNotActive { step: Step, active: Step },
    #[error("already at the first step")]
    AtFirstStep,
    #[error("already at the final step")]
    AtFinalStep,
    #[error("enrolment has not reached the completion step")]
    NotComplete,
    #[error("unknown consent item: {0}")]
    UnknownConsentItem(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("failed to create record directory: {0}")]
    RecordDirCreation(std::io::Error),
    #[error("failed to write record file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("enrolment record already exists at {}", .0.display())]
    RecordAlreadyExists(std::path::PathBuf),
    #[error("failed to serialize JSON: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to serialize YAML: {0}")]
    YamlSerialization(serde_yaml::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(String),
    #[error("invalid scan payload: {0}")]
    InvalidScanPayload(String),
}

pub type EnrolResult<T> = std::result::Result<T, EnrolError>;

/// Outcomes of the one-time-code verification sub-protocol that the user can act on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("code did not match ({remaining} attempts remaining)")]
    CodeMismatch { remaining: u32 },
    #[error("too many attempts; request a new code")]
    TooManyAttempts,
    #[error("code has expired; request a new code")]
    CodeExpired,
    #[error("code delivery unavailable: {0}")]
    DispatchUnavailable(String),
    #[error("no reachable phone number to send a code to")]
    NoReachableTarget,
    #[error("no code has been requested")]
    NotDispatched,
    #[error("a code has already been sent; request a resend instead")]
    CodeAlreadySent,
    #[error("already verified")]
    AlreadyVerified,
    #[error("code cannot be empty")]
    EmptyCode,
}

/// Failures reported by a code-dispatch collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch service unavailable: {0}")]
    Unavailable(String),
    #[error("unknown dispatch: {0}")]
    UnknownDispatch(String),
}

/// Failures of client-local draft storage.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("draft storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize draft snapshot: {0}")]
    Serialise(serde_json::Error),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("draft storage unavailable: {0}")]
    Unavailable(String),
}
