//! # API REST
//!
//! REST surface for the enrolment workflow.
//!
//! Handles:
//! - HTTP endpoints with axum, one per step action (field change, next, previous, save draft)
//! - Verification dispatch and code submission for the identity-link and consent steps
//! - Starting and stopping the autosave task around the session lifecycle
//! - REST-specific concerns (JSON serialization, status codes, CORS)
//!
//! Business rules live in `enrol-core`; handlers only translate.

#![warn(rust_2018_idioms)]

mod error;
mod handlers;

pub use error::{ApiError, ErrorBody};

use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Router;
use enrol_core::{
    AutosaveTask, CoreConfig, EnrolResult, EnrollmentSession, PatientRecordSink, SharedSession,
};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::cors::CorsLayer;

/// Application state for the REST API server.
///
/// Holds the single live session, the record sink used on completion, and the autosave task
/// handle. The session sits behind a `std::sync::Mutex` that is never held across an await.
#[derive(Clone)]
pub struct AppState {
    cfg: Arc<CoreConfig>,
    session: SharedSession,
    sink: Arc<dyn PatientRecordSink>,
    autosave: Arc<AsyncMutex<Option<AutosaveTask>>>,
}

impl AppState {
    pub fn new(
        cfg: Arc<CoreConfig>,
        session: SharedSession,
        sink: Arc<dyn PatientRecordSink>,
    ) -> Self {
        Self {
            cfg,
            session,
            sink,
            autosave: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Runs `f` against the session under its lock.
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut EnrollmentSession) -> EnrolResult<T>,
    ) -> Result<T, ApiError> {
        let mut session = self.session.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut session).map_err(ApiError::from)
    }

    /// Runs `f` against the session on the blocking pool, for operations that touch storage.
    async fn with_session_blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut EnrollmentSession) -> EnrolResult<T> + Send + 'static,
    ) -> Result<T, ApiError> {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = session.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut session).map_err(ApiError::from)
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "session task failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "session task failed")
        })?
    }

    /// Starts autosave if it is not already running.
    pub async fn ensure_autosave(&self) {
        let mut slot = self.autosave.lock().await;
        if slot.as_ref().is_some_and(AutosaveTask::is_running) {
            return;
        }
        *slot = Some(AutosaveTask::start(
            self.session.clone(),
            self.cfg.autosave_interval(),
        ));
    }

    /// Stops autosave if it is running.
    pub async fn stop_autosave(&self) {
        let task = self.autosave.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

/// Builds the router with all enrolment routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/consent-catalogue", get(handlers::consent_catalogue))
        .route("/enrollment", get(handlers::get_enrollment))
        .route("/enrollment/demographics", put(handlers::put_demographics))
        .route("/enrollment/identity-link", put(handlers::put_identity_link))
        .route("/enrollment/identity-link/code", post(handlers::send_identity_code))
        .route("/enrollment/identity-link/verify", post(handlers::verify_identity_code))
        .route(
            "/enrollment/photo",
            put(handlers::put_photo).delete(handlers::delete_photo),
        )
        .route("/enrollment/emergency-contact", put(handlers::put_emergency_contact))
        .route("/enrollment/medical-history", put(handlers::put_medical_history))
        .route("/enrollment/consent/items/:item_id", put(handlers::put_consent))
        .route("/enrollment/consent/code", post(handlers::send_consent_code))
        .route("/enrollment/consent/verify", post(handlers::verify_consent_code))
        .route("/enrollment/next", post(handlers::next))
        .route("/enrollment/previous", post(handlers::previous))
        .route("/enrollment/save", post(handlers::save))
        .route("/enrollment/reset", post(handlers::reset))
        .route("/enrollment/complete", post(handlers::complete))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
