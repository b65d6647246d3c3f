//! Validation rule set.
//!
//! One pure rule per step maps that step's slice of the draft to a [`FieldErrors`] map. An
//! empty map means the step's data is complete.
//!
//! Rules cover data only. Whether a step's verification sub-protocol has reached `Verified`
//! is checked by the workflow controller, so the two concerns can be tested separately.

use crate::consent::ConsentCatalogue;
use crate::draft::{Contact, Demographics, EmergencyContacts, EnrollmentDraft, IdentityLinkMode, Step};
use enrol_types::PhoneNumber;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Field-scoped error messages, keyed by a dotted field path (e.g. `demographics.phone`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.insert(field.into(), message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn extend(&mut self, other: FieldErrors) {
        self.0.extend(other.0);
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{field}: {message}")?;
            first = false;
        }
        Ok(())
    }
}

/// Validates the data of `step` within `draft`.
pub fn validate(step: Step, draft: &EnrollmentDraft, catalogue: &ConsentCatalogue) -> FieldErrors {
    match step {
        Step::Demographics => validate_demographics(&draft.demographics),
        Step::IdentityLink => validate_identity_link(&draft.identity_link.mode),
        Step::Photo => validate_photo(draft),
        Step::EmergencyContact => validate_emergency_contacts(&draft.emergency_contact),
        Step::MedicalHistory => FieldErrors::new(),
        Step::Consent => validate_consent(draft, catalogue),
        Step::Completion => FieldErrors::new(),
    }
}

fn require(errors: &mut FieldErrors, field: &str, value: &str, message: &str) {
    if value.trim().is_empty() {
        errors.insert(field, message);
    }
}

fn validate_demographics(demographics: &Demographics) -> FieldErrors {
    let mut errors = FieldErrors::new();
    require(
        &mut errors,
        "demographics.first_name",
        &demographics.first_name,
        "First name is required",
    );
    require(
        &mut errors,
        "demographics.last_name",
        &demographics.last_name,
        "Last name is required",
    );
    require(
        &mut errors,
        "demographics.date_of_birth",
        &demographics.date_of_birth,
        "Date of birth is required",
    );
    if demographics.gender.is_none() {
        errors.insert("demographics.gender", "Gender is required");
    }
    require(
        &mut errors,
        "demographics.phone",
        &demographics.phone,
        "Phone number is required",
    );
    if !errors.contains("demographics.phone") && PhoneNumber::parse(&demographics.phone).is_err() {
        errors.insert("demographics.phone", "Enter a valid phone number");
    }
    errors
}

fn validate_identity_link(mode: &IdentityLinkMode) -> FieldErrors {
    let mut errors = FieldErrors::new();
    match mode {
        IdentityLinkMode::Skip => {}
        IdentityLinkMode::LinkExisting { health_id } => require(
            &mut errors,
            "identity_link.health_id",
            health_id,
            "Health ID number is required to link an existing ID",
        ),
        IdentityLinkMode::CreateNew { requested_address } => require(
            &mut errors,
            "identity_link.requested_address",
            requested_address,
            "Choose an address for the new health ID",
        ),
    }
    errors
}

fn validate_photo(draft: &EnrollmentDraft) -> FieldErrors {
    let mut errors = FieldErrors::new();
    let present = draft
        .photo
        .as_ref()
        .is_some_and(|photo| !photo.reference.handle.trim().is_empty());
    if !present {
        errors.insert("photo", "A patient photo is required");
    }
    errors
}

fn validate_contact(errors: &mut FieldErrors, prefix: &str, contact: &Contact) {
    require(
        errors,
        &format!("{prefix}.name"),
        &contact.name,
        "Contact name is required",
    );
    require(
        errors,
        &format!("{prefix}.phone"),
        &contact.phone,
        "Contact phone is required",
    );
    require(
        errors,
        &format!("{prefix}.relationship"),
        &contact.relationship,
        "Relationship is required",
    );
}

fn validate_emergency_contacts(contacts: &EmergencyContacts) -> FieldErrors {
    let mut errors = FieldErrors::new();
    validate_contact(&mut errors, "emergency_contact.primary", &contacts.primary);
    if contacts.has_secondary {
        validate_contact(&mut errors, "emergency_contact.secondary", &contacts.secondary);
    }
    errors
}

fn validate_consent(draft: &EnrollmentDraft, catalogue: &ConsentCatalogue) -> FieldErrors {
    let mut errors = FieldErrors::new();
    for item in catalogue.required_items() {
        if !draft.consent.granted.contains(&item.id) {
            errors.insert(
                format!("consent.{}", item.id),
                format!("'{}' consent is required", item.label),
            );
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::{CaptureMethod, Gender, Photo, PhotoReference};
    use chrono::Utc;

    fn filled_demographics() -> Demographics {
        Demographics {
            first_name: "Asha".into(),
            last_name: "Rao".into(),
            date_of_birth: "1990-04-12".into(),
            gender: Some(Gender::Female),
            phone: "+91 98765 43210".into(),
            ..Default::default()
        }
    }

    fn contact(name: &str) -> Contact {
        Contact {
            name: name.into(),
            phone: "9876500000".into(),
            relationship: "Sibling".into(),
        }
    }

    #[test]
    fn demographics_lists_every_missing_required_field() {
        let draft = EnrollmentDraft::empty();
        let errors = validate(Step::Demographics, &draft, &ConsentCatalogue::default_catalogue());

        let fields: Vec<&str> = errors.fields().collect();
        assert_eq!(
            fields,
            vec![
                "demographics.date_of_birth",
                "demographics.first_name",
                "demographics.gender",
                "demographics.last_name",
                "demographics.phone",
            ]
        );
    }

    #[test]
    fn demographics_passes_without_optional_fields() {
        let mut draft = EnrollmentDraft::empty();
        draft.demographics = filled_demographics();
        let errors = validate(Step::Demographics, &draft, &ConsentCatalogue::default_catalogue());
        assert!(errors.is_empty(), "unexpected errors: {errors}");
    }

    #[test]
    fn demographics_treats_whitespace_as_empty() {
        let mut draft = EnrollmentDraft::empty();
        draft.demographics = filled_demographics();
        draft.demographics.phone = "   ".into();
        let errors = validate(Step::Demographics, &draft, &ConsentCatalogue::default_catalogue());
        assert!(errors.contains("demographics.phone"));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn demographics_rejects_unreachable_phone() {
        let mut draft = EnrollmentDraft::empty();
        draft.demographics = filled_demographics();
        draft.demographics.phone = "call me".into();
        let errors = validate(Step::Demographics, &draft, &ConsentCatalogue::default_catalogue());
        assert_eq!(errors.get("demographics.phone"), Some("Enter a valid phone number"));
    }

    #[test]
    fn identity_link_rules_follow_the_mode() {
        let catalogue = ConsentCatalogue::default_catalogue();
        let mut draft = EnrollmentDraft::empty();

        draft.identity_link.mode = IdentityLinkMode::Skip;
        assert!(validate(Step::IdentityLink, &draft, &catalogue).is_empty());

        draft.identity_link.mode = IdentityLinkMode::LinkExisting {
            health_id: String::new(),
        };
        assert!(validate(Step::IdentityLink, &draft, &catalogue).contains("identity_link.health_id"));

        draft.identity_link.mode = IdentityLinkMode::CreateNew {
            requested_address: String::new(),
        };
        assert!(validate(Step::IdentityLink, &draft, &catalogue)
            .contains("identity_link.requested_address"));

        draft.identity_link.mode = IdentityLinkMode::CreateNew {
            requested_address: "asha@abdm".into(),
        };
        assert!(validate(Step::IdentityLink, &draft, &catalogue).is_empty());
    }

    #[test]
    fn photo_requires_a_non_empty_handle() {
        let catalogue = ConsentCatalogue::default_catalogue();
        let mut draft = EnrollmentDraft::empty();
        assert!(validate(Step::Photo, &draft, &catalogue).contains("photo"));

        draft.photo = Some(Photo {
            reference: PhotoReference {
                handle: " ".into(),
                media_type: None,
                size_bytes: 0,
            },
            method: CaptureMethod::Camera,
            captured_at: Utc::now(),
        });
        assert!(validate(Step::Photo, &draft, &catalogue).contains("photo"));

        if let Some(photo) = draft.photo.as_mut() {
            photo.reference.handle = "abc123".into();
        }
        assert!(validate(Step::Photo, &draft, &catalogue).is_empty());
    }

    #[test]
    fn secondary_contact_is_all_or_nothing() {
        let catalogue = ConsentCatalogue::default_catalogue();
        let mut draft = EnrollmentDraft::empty();
        draft.emergency_contact.primary = contact("Ravi");
        assert!(validate(Step::EmergencyContact, &draft, &catalogue).is_empty());

        draft.emergency_contact.has_secondary = true;
        draft.emergency_contact.secondary.name = "Meera".into();
        let errors = validate(Step::EmergencyContact, &draft, &catalogue);
        assert!(errors.contains("emergency_contact.secondary.phone"));
        assert!(errors.contains("emergency_contact.secondary.relationship"));
        assert!(!errors.contains("emergency_contact.secondary.name"));

        draft.emergency_contact.secondary = contact("Meera");
        assert!(validate(Step::EmergencyContact, &draft, &catalogue).is_empty());
    }

    #[test]
    fn primary_contact_fields_are_required() {
        let draft = EnrollmentDraft::empty();
        let errors = validate(
            Step::EmergencyContact,
            &draft,
            &ConsentCatalogue::default_catalogue(),
        );
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn medical_history_never_blocks() {
        let draft = EnrollmentDraft::empty();
        assert!(validate(
            Step::MedicalHistory,
            &draft,
            &ConsentCatalogue::default_catalogue()
        )
        .is_empty());
    }

    #[test]
    fn consent_names_each_missing_required_item() {
        let catalogue = ConsentCatalogue::default_catalogue();
        let mut draft = EnrollmentDraft::empty();
        for item in catalogue.required_items() {
            draft.consent.granted.insert(item.id.clone());
        }
        assert!(validate(Step::Consent, &draft, &catalogue).is_empty());

        let missing = catalogue.required_items().next().unwrap().id.clone();
        draft.consent.granted.remove(&missing);
        let errors = validate(Step::Consent, &draft, &catalogue);
        assert_eq!(errors.len(), 1);
        assert!(errors.contains(&format!("consent.{missing}")));
    }

    #[test]
    fn optional_consent_items_are_not_required() {
        let catalogue = ConsentCatalogue::default_catalogue();
        let mut draft = EnrollmentDraft::empty();
        for item in catalogue.required_items() {
            draft.consent.granted.insert(item.id.clone());
        }
        assert!(catalogue.items().iter().any(|item| !item.required));
        assert!(validate(Step::Consent, &draft, &catalogue).is_empty());
    }

    #[test]
    fn field_errors_display_joins_entries() {
        let mut errors = FieldErrors::new();
        errors.insert("b", "second");
        errors.insert("a", "first");
        assert_eq!(errors.to_string(), "a: first; b: second");
    }
}
