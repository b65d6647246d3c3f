//! The enrolment draft aggregate.
//!
//! [`EnrollmentDraft`] is the single mutable record of one enrolment session: every step's
//! data plus the workflow position. It is what the persistence manager snapshots and what the
//! completion step reads.
//!
//! ## Snapshot shape
//!
//! The draft is serialised as a whole. Every nested object is required and unknown fields
//! are rejected, so a snapshot either deserialises into a complete draft or fails, never into
//! a draft with a missing section.

use crate::completion::EnrollmentResult;
use crate::verification::VerificationState;
use chrono::{DateTime, Utc};
use enrol_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// STEPS
// ============================================================================

/// One stage of the linear enrolment sequence.
///
/// Serialised as its 1-based position, so a snapshot with an out-of-range position fails to
/// deserialise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Step {
    Demographics = 1,
    IdentityLink = 2,
    Photo = 3,
    EmergencyContact = 4,
    MedicalHistory = 5,
    Consent = 6,
    Completion = 7,
}

impl Step {
    /// All steps in workflow order.
    pub const ALL: [Step; 7] = [
        Step::Demographics,
        Step::IdentityLink,
        Step::Photo,
        Step::EmergencyContact,
        Step::MedicalHistory,
        Step::Consent,
        Step::Completion,
    ];

    pub const FIRST: Step = Step::Demographics;
    pub const LAST: Step = Step::Completion;

    pub fn position(self) -> u8 {
        self as u8
    }

    pub fn from_position(position: u8) -> Option<Step> {
        Self::ALL.get(usize::from(position).checked_sub(1)?).copied()
    }

    pub fn next(self) -> Option<Step> {
        Self::from_position(self.position() + 1)
    }

    pub fn previous(self) -> Option<Step> {
        Self::from_position(self.position().checked_sub(1)?)
    }

    /// Steps whose exit also requires a completed verification sub-protocol.
    pub fn requires_verification(self) -> bool {
        matches!(self, Step::IdentityLink | Step::Consent)
    }

    pub fn title(self) -> &'static str {
        match self {
            Step::Demographics => "Demographics",
            Step::IdentityLink => "Health ID",
            Step::Photo => "Photo",
            Step::EmergencyContact => "Emergency contact",
            Step::MedicalHistory => "Medical history",
            Step::Consent => "Consent",
            Step::Completion => "Completion",
        }
    }

    /// URL/CLI friendly name.
    pub fn slug(self) -> &'static str {
        match self {
            Step::Demographics => "demographics",
            Step::IdentityLink => "identity-link",
            Step::Photo => "photo",
            Step::EmergencyContact => "emergency-contact",
            Step::MedicalHistory => "medical-history",
            Step::Consent => "consent",
            Step::Completion => "completion",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.position(), self.title())
    }
}

impl TryFrom<u8> for Step {
    type Error = String;

    fn try_from(position: u8) -> Result<Self, Self::Error> {
        Step::from_position(position).ok_or_else(|| {
            format!(
                "step position must be between 1 and {}, got {}",
                Step::LAST.position(),
                position
            )
        })
    }
}

impl From<Step> for u8 {
    fn from(step: Step) -> u8 {
        step.position()
    }
}

// ============================================================================
// STEP SLICES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
    Undisclosed,
}

/// Postal address. Every field is optional free text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Address {
    pub line1: String,
    pub line2: String,
    pub city: String,
    pub district: String,
    pub state: String,
    pub postal_code: String,
}

/// Step 1: who the patient is and how to reach them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Demographics {
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    /// ISO 8601 date (YYYY-MM-DD) as entered.
    pub date_of_birth: String,
    pub gender: Option<Gender>,
    pub phone: String,
    pub email: Option<String>,
    pub address: Address,
}

impl Demographics {
    /// "Last, First" for display and scan payloads.
    pub fn display_name(&self) -> String {
        let first = self.first_name.trim();
        let last = self.last_name.trim();
        match (first.is_empty(), last.is_empty()) {
            (false, false) => format!("{last}, {first}"),
            (true, false) => last.to_string(),
            (false, true) => first.to_string(),
            (true, true) => String::new(),
        }
    }
}

/// How the patient's national health ID is handled.
///
/// Each variant carries exactly the fields it requires, so validation can match on it
/// exhaustively.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityLinkMode {
    /// Link an ID the patient already holds.
    LinkExisting { health_id: String },
    /// Register a new ID under the requested address.
    CreateNew { requested_address: String },
    /// Enrol without a health ID.
    Skip,
}

impl Default for IdentityLinkMode {
    fn default() -> Self {
        IdentityLinkMode::LinkExisting {
            health_id: String::new(),
        }
    }
}

impl IdentityLinkMode {
    /// The trimmed id-reference value, if the variant has one and it is filled in.
    pub fn reference(&self) -> Option<&str> {
        let value = match self {
            IdentityLinkMode::LinkExisting { health_id } => health_id,
            IdentityLinkMode::CreateNew { requested_address } => requested_address,
            IdentityLinkMode::Skip => return None,
        };
        Some(value.trim()).filter(|v| !v.is_empty())
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, IdentityLinkMode::Skip)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IdentityLinkMode::LinkExisting { .. } => "link_existing",
            IdentityLinkMode::CreateNew { .. } => "create_new",
            IdentityLinkMode::Skip => "skip",
        }
    }
}

/// Step 2: health-ID linking and its verification sub-state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityLink {
    pub mode: IdentityLinkMode,
    pub verification: VerificationState,
    /// Set once verification succeeds; always unset when `mode` is `Skip`.
    pub issued_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    Upload,
    Camera,
}

/// Opaque handle to a stored photo, supplied by the capture collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhotoReference {
    pub handle: String,
    pub media_type: Option<String>,
    pub size_bytes: u64,
}

/// Step 3: the patient photo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Photo {
    pub reference: PhotoReference,
    pub method: CaptureMethod,
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Contact {
    pub name: String,
    pub phone: String,
    pub relationship: String,
}

/// Step 4: emergency contacts.
///
/// The secondary contact is all-or-nothing: it is only checked when `has_secondary` is set,
/// and its entered values are kept when the flag is cleared.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmergencyContacts {
    pub primary: Contact,
    pub has_secondary: bool,
    pub secondary: Contact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
}

/// Step 5: optional clinical background. Nothing here blocks progress.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MedicalHistory {
    pub blood_group: Option<BloodGroup>,
    pub allergies: Vec<String>,
    pub chronic_conditions: Vec<String>,
    pub current_medications: Vec<String>,
    pub past_surgeries: String,
    pub family_history: String,
    pub notes: String,
}

/// Step 6: granted consent items and their confirmation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentRecord {
    pub granted: BTreeSet<String>,
    pub verification: VerificationState,
}

impl ConsentRecord {
    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verification.verified_at()
    }
}

// ============================================================================
// AGGREGATE
// ============================================================================

/// The in-progress enrolment record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollmentDraft {
    /// Identifies this draft instance; the completion result is cached against it.
    pub draft_id: ShardableUuid,
    pub position: Step,
    pub demographics: Demographics,
    pub identity_link: IdentityLink,
    pub photo: Option<Photo>,
    pub emergency_contact: EmergencyContacts,
    pub medical_history: MedicalHistory,
    pub consent: ConsentRecord,
    pub completion: Option<EnrollmentResult>,
    /// Last successful snapshot time, for staleness display.
    pub saved_at: Option<DateTime<Utc>>,
}

impl EnrollmentDraft {
    /// The empty draft at step 1.
    ///
    /// Session start, restore fallback and reset all build their draft here.
    pub fn empty() -> Self {
        Self {
            draft_id: ShardableUuid::new(),
            position: Step::FIRST,
            demographics: Demographics::default(),
            identity_link: IdentityLink::default(),
            photo: None,
            emergency_contact: EmergencyContacts::default(),
            medical_history: MedicalHistory::default(),
            consent: ConsentRecord::default(),
            completion: None,
            saved_at: None,
        }
    }

    /// True if nothing has been entered yet (ignoring identity and timestamps).
    pub fn is_blank(&self) -> bool {
        let empty = Self::empty();
        self.position == empty.position
            && self.demographics == empty.demographics
            && self.identity_link == empty.identity_link
            && self.photo.is_none()
            && self.emergency_contact == empty.emergency_contact
            && self.medical_history == empty.medical_history
            && self.consent == empty.consent
    }

    /// Checks cross-field invariants that serde cannot express.
    ///
    /// Used when hydrating from a snapshot: a draft that fails here is treated as malformed.
    pub fn check_structure(&self) -> Result<(), String> {
        if self.identity_link.mode.is_skip() && self.identity_link.issued_id.is_some() {
            return Err("identity link is skipped but an issued id is present".into());
        }
        if self.identity_link.issued_id.is_some() && !self.identity_link.verification.is_verified()
        {
            return Err("issued id present without a verified identity".into());
        }
        self.identity_link
            .verification
            .check_consistency()
            .map_err(|e| format!("identity_link.verification: {e}"))?;
        self.consent
            .verification
            .check_consistency()
            .map_err(|e| format!("consent.verification: {e}"))?;
        if let Some(completion) = &self.completion {
            if completion.draft_id != self.draft_id {
                return Err("completion result belongs to a different draft".into());
            }
        }
        Ok(())
    }
}

impl Default for EnrollmentDraft {
    fn default() -> Self {
        Self::empty()
    }
}
