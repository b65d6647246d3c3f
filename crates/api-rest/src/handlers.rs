//! Route handlers.
//!
//! Every mutating handler returns the same [`EnrollmentRes`] so a client can re-render the
//! active step from any response.

use crate::{ApiError, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use enrol_core::{
    CaptureMethod, ConsentItem, Demographics, EmergencyContacts, EnrolResult, EnrollmentDraft,
    EnrollmentResult, EnrollmentSession, IdentityLinkMode, MedicalHistory, PhotoReference,
    SaveReceipt, StepView,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

/// The active step plus the full draft.
#[derive(Debug, Serialize)]
pub struct EnrollmentRes {
    pub view: StepView,
    pub draft: EnrollmentDraft,
    /// One-line non-blocking notice, e.g. a failed snapshot purge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl EnrollmentRes {
    fn of(session: &EnrollmentSession) -> Self {
        Self {
            view: session.view(),
            draft: session.draft().clone(),
            notice: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PhotoReq {
    pub handle: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    pub method: CaptureMethod,
}

#[derive(Debug, Deserialize)]
pub struct ConsentReq {
    pub granted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendCodeReq {
    #[serde(default)]
    pub resend: bool,
}

#[derive(Debug, Deserialize)]
pub struct VerifyCodeReq {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct CompleteRes {
    pub result: EnrollmentResult,
}

/// Applies an edit, starts autosave, and returns the refreshed enrolment.
async fn edit(
    state: &AppState,
    f: impl FnOnce(&mut EnrollmentSession) -> EnrolResult<()>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    let res = state.with_session(|session| {
        f(session)?;
        Ok(EnrollmentRes::of(session))
    })?;
    state.ensure_autosave().await;
    Ok(Json(res))
}

#[axum::debug_handler]
pub async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "Enrolment REST API is alive".into(),
    })
}

#[axum::debug_handler]
pub async fn consent_catalogue(State(state): State<AppState>) -> Json<Vec<ConsentItem>> {
    Json(state.cfg.consent_catalogue().items().to_vec())
}

#[axum::debug_handler]
pub async fn get_enrollment(
    State(state): State<AppState>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    let res = state.with_session(|session| Ok(EnrollmentRes::of(session)))?;
    Ok(Json(res))
}

#[axum::debug_handler]
pub async fn put_demographics(
    State(state): State<AppState>,
    Json(req): Json<Demographics>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.edit_demographics(req).map(drop)).await
}

#[axum::debug_handler]
pub async fn put_identity_link(
    State(state): State<AppState>,
    Json(req): Json<IdentityLinkMode>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.select_identity_link(req).map(drop)).await
}

#[axum::debug_handler]
pub async fn send_identity_code(
    State(state): State<AppState>,
    req: Option<Json<SendCodeReq>>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    let resend = req.map(|Json(r)| r.resend).unwrap_or_default();
    edit(&state, |s| s.send_identity_code(resend)).await
}

#[axum::debug_handler]
pub async fn verify_identity_code(
    State(state): State<AppState>,
    Json(req): Json<VerifyCodeReq>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.submit_identity_code(&req.code)).await
}

#[axum::debug_handler]
pub async fn put_photo(
    State(state): State<AppState>,
    Json(req): Json<PhotoReq>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    let reference = PhotoReference {
        handle: req.handle,
        media_type: req.media_type,
        size_bytes: req.size_bytes,
    };
    edit(&state, |s| s.attach_photo(reference, req.method).map(drop)).await
}

#[axum::debug_handler]
pub async fn delete_photo(
    State(state): State<AppState>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.remove_photo().map(drop)).await
}

#[axum::debug_handler]
pub async fn put_emergency_contact(
    State(state): State<AppState>,
    Json(req): Json<EmergencyContacts>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.edit_emergency_contacts(req).map(drop)).await
}

#[axum::debug_handler]
pub async fn put_medical_history(
    State(state): State<AppState>,
    Json(req): Json<MedicalHistory>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.edit_medical_history(req).map(drop)).await
}

#[axum::debug_handler]
pub async fn put_consent(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(req): Json<ConsentReq>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.set_consent(&item_id, req.granted).map(drop)).await
}

#[axum::debug_handler]
pub async fn send_consent_code(
    State(state): State<AppState>,
    req: Option<Json<SendCodeReq>>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    let resend = req.map(|Json(r)| r.resend).unwrap_or_default();
    edit(&state, |s| s.send_consent_code(resend)).await
}

#[axum::debug_handler]
pub async fn verify_consent_code(
    State(state): State<AppState>,
    Json(req): Json<VerifyCodeReq>,
) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.submit_consent_code(&req.code)).await
}

#[axum::debug_handler]
pub async fn next(State(state): State<AppState>) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.advance().map(drop)).await
}

#[axum::debug_handler]
pub async fn previous(State(state): State<AppState>) -> Result<Json<EnrollmentRes>, ApiError> {
    edit(&state, |s| s.retreat().map(drop)).await
}

#[axum::debug_handler]
pub async fn save(State(state): State<AppState>) -> Result<Json<SaveReceipt>, ApiError> {
    let receipt = state
        .with_session_blocking(|s| Ok(s.save_draft()?))
        .await?;
    Ok(Json(receipt))
}

#[axum::debug_handler]
pub async fn reset(State(state): State<AppState>) -> Result<Json<EnrollmentRes>, ApiError> {
    state.stop_autosave().await;
    let res = state
        .with_session_blocking(|s| {
            let notice = s.reset().err().map(|e| format!("stored draft not purged: {e}"));
            let mut res = EnrollmentRes::of(s);
            res.notice = notice;
            Ok(res)
        })
        .await?;
    Ok(Json(res))
}

#[axum::debug_handler]
pub async fn complete(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CompleteRes>), ApiError> {
    let sink = state.sink.clone();
    let result = state
        .with_session_blocking(move |s| s.finish(sink.as_ref()))
        .await?;
    state.stop_autosave().await;
    Ok((StatusCode::CREATED, Json(CompleteRes { result })))
}

#[cfg(test)]
mod tests {
    use crate::{router, AppState};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use enrol_core::{
        ConsentCatalogue, CoreConfig, DraftPersistence, EnrollmentSession, FixedCodeDispatcher,
        InMemoryDraftStorage, InMemoryRecordSink, VerificationPolicy,
    };
    use std::time::Duration;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    const DEV_CODE: &str = "246810";

    fn app() -> (Router, Arc<InMemoryRecordSink>) {
        app_with(CoreConfig::with_defaults(PathBuf::from("unused")))
    }

    fn app_with(cfg: CoreConfig) -> (Router, Arc<InMemoryRecordSink>) {
        let cfg = Arc::new(cfg);
        let session = EnrollmentSession::new(
            cfg.clone(),
            Arc::new(FixedCodeDispatcher::new(DEV_CODE)),
            DraftPersistence::new(Arc::new(InMemoryDraftStorage::new())),
        );
        let sink = Arc::new(InMemoryRecordSink::new());
        let state = AppState::new(cfg, Arc::new(Mutex::new(session)), sink.clone());
        (router(state), sink)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn demographics() -> Value {
        json!({
            "first_name": "Asha",
            "middle_name": "",
            "last_name": "Rao",
            "date_of_birth": "1990-04-12",
            "gender": "female",
            "phone": "+91 98765 43210",
            "email": null,
            "address": {
                "line1": "", "line2": "", "city": "Pune",
                "district": "", "state": "", "postal_code": ""
            }
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
    }

    #[tokio::test]
    async fn next_on_empty_draft_returns_field_errors() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::POST, "/enrollment/next", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["field_errors"]["demographics.first_name"].is_string());

        let (_, body) = call(&app, Method::GET, "/enrollment", None).await;
        assert_eq!(body["view"]["position"], json!(1));
    }

    #[tokio::test]
    async fn editing_an_inactive_step_conflicts() {
        let (app, _) = app();
        let (status, _) = call(
            &app,
            Method::PUT,
            "/enrollment/consent/items/registration",
            Some(json!({ "granted": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn full_enrolment_over_http() {
        let (app, sink) = app();

        let (status, body) =
            call(&app, Method::PUT, "/enrollment/demographics", Some(demographics())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["view"]["can_advance"], json!(true));
        call(&app, Method::POST, "/enrollment/next", None).await;

        let mode = json!({ "kind": "link_existing", "health_id": "12-3456-7890-1234" });
        call(&app, Method::PUT, "/enrollment/identity-link", Some(mode)).await;
        let (status, _) = call(&app, Method::POST, "/enrollment/identity-link/code", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(
            &app,
            Method::POST,
            "/enrollment/identity-link/verify",
            Some(json!({ "code": "000000" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, body) = call(
            &app,
            Method::POST,
            "/enrollment/identity-link/verify",
            Some(json!({ "code": DEV_CODE })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["draft"]["identity_link"]["issued_id"], json!("12-3456-7890-1234"));
        call(&app, Method::POST, "/enrollment/next", None).await;

        let photo = json!({ "handle": "abc123", "method": "camera" });
        call(&app, Method::PUT, "/enrollment/photo", Some(photo)).await;
        call(&app, Method::POST, "/enrollment/next", None).await;

        let contacts = json!({
            "primary": { "name": "Ravi Rao", "phone": "9876500000", "relationship": "Brother" },
            "has_secondary": false,
            "secondary": { "name": "", "phone": "", "relationship": "" }
        });
        call(&app, Method::PUT, "/enrollment/emergency-contact", Some(contacts)).await;
        call(&app, Method::POST, "/enrollment/next", None).await;
        let (_, body) = call(&app, Method::POST, "/enrollment/next", None).await;
        assert_eq!(body["view"]["position"], json!(6));

        for item in ["registration", "treatment"] {
            let uri = format!("/enrollment/consent/items/{item}");
            let (status, _) =
                call(&app, Method::PUT, &uri, Some(json!({ "granted": true }))).await;
            assert_eq!(status, StatusCode::OK);
        }
        call(&app, Method::POST, "/enrollment/consent/code", Some(json!({ "resend": false }))).await;
        call(
            &app,
            Method::POST,
            "/enrollment/consent/verify",
            Some(json!({ "code": DEV_CODE })),
        )
        .await;

        let (status, body) = call(&app, Method::POST, "/enrollment/next", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["view"]["position"], json!(7));
        let token = body["view"]["completion"]["patient_token"].clone();
        assert!(token.is_string());

        let (status, body) = call(&app, Method::POST, "/enrollment/complete", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["result"]["patient_token"], token);
        assert_eq!(sink.records().len(), 1);

        let (_, body) = call(&app, Method::GET, "/enrollment", None).await;
        assert_eq!(body["view"]["position"], json!(1));
    }

    #[tokio::test]
    async fn previous_at_first_step_conflicts() {
        let (app, _) = app();
        call(&app, Method::PUT, "/enrollment/demographics", Some(demographics())).await;
        let (status, body) = call(&app, Method::POST, "/enrollment/previous", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn save_returns_receipt_and_reset_clears() {
        let (app, _) = app();
        call(&app, Method::PUT, "/enrollment/demographics", Some(demographics())).await;

        let (status, body) = call(&app, Method::POST, "/enrollment/save", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["saved_at"].is_string());

        let (status, body) = call(&app, Method::POST, "/enrollment/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["draft"]["demographics"]["first_name"], json!(""));
    }

    #[tokio::test]
    async fn consent_item_named_like_an_action_reaches_the_item_route() {
        let catalogue =
            ConsentCatalogue::parse_yaml("- id: code\n  label: Code\n  required: true\n").unwrap();
        let cfg = CoreConfig::new(
            PathBuf::from("unused"),
            VerificationPolicy::default(),
            Duration::from_secs(30),
            catalogue,
        )
        .unwrap();
        let (app, _) = app_with(cfg);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/enrollment/consent/items/code",
            Some(json!({ "granted": true })),
        )
        .await;
        // Routed to the item handler, which refuses while step 1 is active.
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().is_some_and(|e| e.contains("not the active step")));
    }

    #[tokio::test]
    async fn catalogue_lists_items() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/consent-catalogue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().is_some_and(|items| !items.is_empty()));
    }
}
