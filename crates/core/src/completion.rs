//! Completion and token issuance.
//!
//! When the workflow enters the completion step the issuer mints a patient token and a compact
//! payload for rendering as a scannable code. Issuance is idempotent per draft: the token is
//! cached against the draft id and also stored in the draft itself, so neither re-entering the
//! step nor restoring a snapshot mints a second token.

use crate::constants::SCAN_PAYLOAD_PREFIX;
use crate::draft::EnrollmentDraft;
use crate::error::{EnrolError, EnrolResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use enrol_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

const SCAN_PAYLOAD_VERSION: u8 = 1;

/// The issued outcome of one enrolment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollmentResult {
    pub draft_id: ShardableUuid,
    pub patient_token: ShardableUuid,
    pub scan_payload: String,
    pub issued_at: DateTime<Utc>,
}

/// Decoded content of a scan payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanPayload {
    pub v: u8,
    pub token: String,
    pub name: String,
    pub dob: String,
    pub health_id: Option<String>,
}

pub fn encode_scan_payload(payload: &ScanPayload) -> EnrolResult<String> {
    let json = serde_json::to_vec(payload).map_err(EnrolError::Serialization)?;
    Ok(format!("{SCAN_PAYLOAD_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
}

pub fn decode_scan_payload(encoded: &str) -> EnrolResult<ScanPayload> {
    let body = encoded
        .trim()
        .strip_prefix(SCAN_PAYLOAD_PREFIX)
        .ok_or_else(|| EnrolError::InvalidScanPayload("missing prefix".into()))?;
    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| EnrolError::InvalidScanPayload(e.to_string()))?;
    let payload: ScanPayload = serde_json::from_slice(&json)
        .map_err(|e| EnrolError::InvalidScanPayload(e.to_string()))?;
    if payload.v != SCAN_PAYLOAD_VERSION {
        return Err(EnrolError::InvalidScanPayload(format!(
            "unsupported version {}",
            payload.v
        )));
    }
    Ok(payload)
}

/// Mints completion results, at most one patient token per draft.
///
/// Only the token and its issue time are fixed per draft. The scan payload is rebuilt from the
/// draft on every call, so a result issued after earlier steps were edited reflects the edits.
#[derive(Debug, Default)]
pub struct CompletionIssuer {
    issued: Mutex<HashMap<ShardableUuid, (ShardableUuid, DateTime<Utc>)>>,
}

impl CompletionIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(
        &self,
        draft: &EnrollmentDraft,
        now: DateTime<Utc>,
    ) -> EnrolResult<EnrollmentResult> {
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        let stored = draft
            .completion
            .as_ref()
            .filter(|result| result.draft_id == draft.draft_id)
            .map(|result| (result.patient_token.clone(), result.issued_at));

        let existing = stored.or_else(|| issued.get(&draft.draft_id).cloned());
        let (patient_token, issued_at) = match existing {
            Some(existing) => existing,
            None => {
                let token = ShardableUuid::new();
                tracing::info!(
                    draft_id = %draft.draft_id,
                    patient_token = %token,
                    "issued patient token"
                );
                (token, now)
            }
        };
        issued.insert(draft.draft_id.clone(), (patient_token.clone(), issued_at));

        let payload = ScanPayload {
            v: SCAN_PAYLOAD_VERSION,
            token: patient_token.to_string(),
            name: draft.demographics.display_name(),
            dob: draft.demographics.date_of_birth.trim().to_string(),
            health_id: draft.identity_link.issued_id.clone(),
        };
        Ok(EnrollmentResult {
            draft_id: draft.draft_id.clone(),
            patient_token,
            scan_payload: encode_scan_payload(&payload)?,
            issued_at,
        })
    }

    /// Drops a cached token once the enrolment has been handed off.
    pub fn forget(&self, draft_id: &ShardableUuid) {
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.remove(draft_id);
    }
}
