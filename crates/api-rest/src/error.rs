use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use enrol_core::{EnrolError, FieldErrors, PersistenceError, VerificationError};
use serde::Serialize;

/// JSON error body: `{ "error": "...", "field_errors": { ... } }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<FieldErrors>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: message.into(),
                field_errors: None,
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn verification_status(err: &VerificationError) -> StatusCode {
    match err {
        VerificationError::CodeMismatch { .. }
        | VerificationError::EmptyCode
        | VerificationError::NoReachableTarget => StatusCode::UNPROCESSABLE_ENTITY,
        VerificationError::DispatchUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        VerificationError::TooManyAttempts
        | VerificationError::CodeExpired
        | VerificationError::NotDispatched
        | VerificationError::CodeAlreadySent
        | VerificationError::AlreadyVerified => StatusCode::CONFLICT,
    }
}

impl From<EnrolError> for ApiError {
    fn from(err: EnrolError) -> Self {
        let message = err.to_string();
        let (status, field_errors) = match err {
            EnrolError::StepBlocked { errors, .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, Some(errors))
            }
            EnrolError::InvalidInput(_)
            | EnrolError::UnknownConsentItem(_)
            | EnrolError::InvalidScanPayload(_) => (StatusCode::BAD_REQUEST, None),
            EnrolError::StepNotActive { .. }
            | EnrolError::AtFirstStep
            | EnrolError::AtFinalStep
            | EnrolError::NotComplete
            | EnrolError::RecordAlreadyExists(_) => (StatusCode::CONFLICT, None),
            EnrolError::Verification(ref v) => (verification_status(v), None),
            EnrolError::Persistence(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            EnrolError::RecordDirCreation(_)
            | EnrolError::FileWrite(_)
            | EnrolError::FileRead(_)
            | EnrolError::Serialization(_)
            | EnrolError::YamlSerialization(_)
            | EnrolError::YamlDeserialization(_) => {
                tracing::error!("enrolment error: {message}");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };
        Self {
            status,
            body: ErrorBody {
                error: message,
                field_errors,
            },
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        ApiError::from(EnrolError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
