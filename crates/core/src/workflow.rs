//! Step state machine.
//!
//! [`EnrollmentSession`] exclusively owns the draft for one enrolment. Every mutation goes
//! through it: per-step edits (accepted only for the active step), verification dispatch and
//! submission, and navigation. `advance()` is gated on the active step's validation rules and,
//! for the identity-link and consent steps, on a `Verified` sub-protocol.
//!
//! The session performs no background work. Autosave is driven from outside through
//! [`EnrollmentSession::autosave`], see [`crate::autosave`].

use crate::completion::{CompletionIssuer, EnrollmentResult};
use crate::config::CoreConfig;
use crate::draft::{
    CaptureMethod, Demographics, EmergencyContacts, EnrollmentDraft, IdentityLinkMode,
    MedicalHistory, Photo, PhotoReference, Step,
};
use crate::error::{EnrolError, EnrolResult, PersistenceError, VerificationError};
use crate::persistence::{DraftPersistence, RestoreOutcome, SaveReceipt};
use crate::sink::{EnrollmentRecord, PatientRecordSink};
use crate::validation::{validate, FieldErrors};
use crate::verification::{CodeDispatcher, VerificationPhase, VerificationState};
use chrono::{DateTime, Utc};
use enrol_types::PhoneNumber;
use serde::Serialize;
use std::sync::Arc;

/// How the session's draft was obtained at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    /// No snapshot; started from the empty draft.
    Fresh,
    /// Hydrated from the stored snapshot.
    Resumed { position: Step, clamped_from: Option<Step> },
    /// A snapshot existed but was unusable; started from the empty draft.
    Discarded { reason: String },
}

/// What a step surface needs to render the active step.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub step: Step,
    pub slug: &'static str,
    pub title: &'static str,
    pub position: u8,
    pub total_steps: u8,
    /// Live data errors for the active step.
    pub errors: FieldErrors,
    pub can_advance: bool,
    pub can_retreat: bool,
    pub identity_verification: VerificationPhase,
    pub consent_verification: VerificationPhase,
    pub saved_at: Option<DateTime<Utc>>,
    pub unsaved_changes: bool,
    pub completion: Option<EnrollmentResult>,
}

pub struct EnrollmentSession {
    cfg: Arc<CoreConfig>,
    draft: EnrollmentDraft,
    dispatcher: Arc<dyn CodeDispatcher>,
    persistence: DraftPersistence,
    issuer: CompletionIssuer,
    dirty: bool,
}

impl std::fmt::Debug for EnrollmentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentSession")
            .field("draft_id", &self.draft.draft_id)
            .field("position", &self.draft.position)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl EnrollmentSession {
    /// A session over the empty draft, ignoring any stored snapshot.
    pub fn new(
        cfg: Arc<CoreConfig>,
        dispatcher: Arc<dyn CodeDispatcher>,
        persistence: DraftPersistence,
    ) -> Self {
        Self {
            cfg,
            draft: EnrollmentDraft::empty(),
            dispatcher,
            persistence,
            issuer: CompletionIssuer::new(),
            dirty: false,
        }
    }

    /// Starts a session, hydrating from the stored snapshot when it is usable.
    ///
    /// A restored position that is no longer reachable through the gates of the earlier
    /// steps is pulled back to the first blocked step. Entered data is kept.
    pub fn start(
        cfg: Arc<CoreConfig>,
        dispatcher: Arc<dyn CodeDispatcher>,
        persistence: DraftPersistence,
    ) -> (Self, RestoreStatus) {
        let outcome = persistence.restore();
        let mut session = Self::new(cfg, dispatcher, persistence);

        let status = match outcome {
            RestoreOutcome::Empty => RestoreStatus::Fresh,
            RestoreOutcome::Discarded { reason } => RestoreStatus::Discarded { reason },
            RestoreOutcome::Restored(draft) => {
                session.draft = *draft;
                let clamped_from = session.clamp_position();
                if session.draft.position == Step::Completion && session.draft.completion.is_none()
                {
                    session.enter_completion();
                }
                RestoreStatus::Resumed {
                    position: session.draft.position,
                    clamped_from,
                }
            }
        };
        (session, status)
    }

    fn clamp_position(&mut self) -> Option<Step> {
        let restored = self.draft.position;
        let blocked = Step::ALL
            .into_iter()
            .take_while(|step| *step < restored)
            .find(|step| !self.gate(*step).is_empty())?;

        tracing::warn!(
            restored = restored.position(),
            clamped = blocked.position(),
            "restored position is not reachable; moving back to first blocked step"
        );
        self.draft.position = blocked;
        self.dirty = true;
        Some(restored)
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    pub fn draft(&self) -> &EnrollmentDraft {
        &self.draft
    }

    pub fn position(&self) -> Step {
        self.draft.position
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Data errors for the active step, for display while editing.
    pub fn live_errors(&self) -> FieldErrors {
        validate(
            self.draft.position,
            &self.draft,
            self.cfg.consent_catalogue(),
        )
    }

    /// Everything that blocks leaving `step`: its data errors plus, where the step requires
    /// one, an unverified sub-protocol.
    fn gate(&self, step: Step) -> FieldErrors {
        let mut errors = validate(step, &self.draft, self.cfg.consent_catalogue());
        match step {
            Step::IdentityLink
                if !self.draft.identity_link.mode.is_skip()
                    && !self.draft.identity_link.verification.is_verified() =>
            {
                errors.insert(
                    "identity_link.verification",
                    "Verify the health ID with the code sent to the patient's phone",
                );
            }
            Step::Consent if !self.draft.consent.verification.is_verified() => {
                errors.insert(
                    "consent.verification",
                    "Confirm consent with the code sent to the patient's phone",
                );
            }
            _ => {}
        }
        errors
    }

    pub fn can_advance(&self) -> bool {
        self.draft.position != Step::LAST && self.gate(self.draft.position).is_empty()
    }

    pub fn view(&self) -> StepView {
        let step = self.draft.position;
        StepView {
            step,
            slug: step.slug(),
            title: step.title(),
            position: step.position(),
            total_steps: Step::LAST.position(),
            errors: self.live_errors(),
            can_advance: self.can_advance(),
            can_retreat: step != Step::FIRST,
            identity_verification: self.draft.identity_link.verification.phase(),
            consent_verification: self.draft.consent.verification.phase(),
            saved_at: self.draft.saved_at,
            unsaved_changes: self.dirty,
            completion: self.draft.completion.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// Moves to the next step if the active step's gate is clear.
    ///
    /// On failure nothing changes and the blocking errors are returned in
    /// `EnrolError::StepBlocked`. Entering the completion step issues the patient token.
    pub fn advance(&mut self) -> EnrolResult<Step> {
        let current = self.draft.position;
        let next = current.next().ok_or(EnrolError::AtFinalStep)?;

        let errors = self.gate(current);
        if !errors.is_empty() {
            tracing::info!(step = current.position(), errors = errors.len(), "advance blocked");
            return Err(EnrolError::StepBlocked {
                step: current,
                errors,
            });
        }

        if next == Step::Completion {
            let result = self.issuer.issue(&self.draft, Utc::now())?;
            self.draft.completion = Some(result);
        }
        self.draft.position = next;
        self.dirty = true;
        tracing::info!(from = current.position(), to = next.position(), "step advanced");
        Ok(next)
    }

    fn enter_completion(&mut self) {
        match self.issuer.issue(&self.draft, Utc::now()) {
            Ok(result) => {
                self.draft.completion = Some(result);
                self.dirty = true;
            }
            Err(e) => tracing::warn!(error = %e, "failed to issue completion for restored draft"),
        }
    }

    /// Moves back one step. Entered data, including an issued completion, is kept.
    pub fn retreat(&mut self) -> EnrolResult<Step> {
        let current = self.draft.position;
        let previous = current.previous().ok_or(EnrolError::AtFirstStep)?;
        self.draft.position = previous;
        self.dirty = true;
        tracing::info!(from = current.position(), to = previous.position(), "step retreated");
        Ok(previous)
    }

    /// Returns to the empty draft at step 1 and purges the stored snapshot.
    ///
    /// The in-memory reset always happens; a purge failure is returned for reporting.
    pub fn reset(&mut self) -> Result<(), PersistenceError> {
        self.discard_draft();
        tracing::info!("enrolment reset");
        self.persistence.clear()
    }

    fn discard_draft(&mut self) {
        self.issuer.forget(&self.draft.draft_id);
        self.draft = EnrollmentDraft::empty();
        self.dirty = false;
    }

    // ------------------------------------------------------------------
    // Step edits
    // ------------------------------------------------------------------

    fn ensure_active(&self, step: Step) -> EnrolResult<()> {
        if self.draft.position == step {
            Ok(())
        } else {
            Err(EnrolError::StepNotActive {
                step,
                active: self.draft.position,
            })
        }
    }

    fn edited(&mut self) -> FieldErrors {
        self.dirty = true;
        self.live_errors()
    }

    pub fn edit_demographics(&mut self, demographics: Demographics) -> EnrolResult<FieldErrors> {
        self.ensure_active(Step::Demographics)?;
        self.draft.demographics = demographics;
        Ok(self.edited())
    }

    /// Sets the identity-link mode.
    ///
    /// Any change of mode or id reference restarts the identity verification and clears the
    /// issued id; re-selecting the current mode keeps a completed verification.
    pub fn select_identity_link(&mut self, mode: IdentityLinkMode) -> EnrolResult<FieldErrors> {
        self.ensure_active(Step::IdentityLink)?;
        if self.draft.identity_link.mode != mode {
            if self.draft.identity_link.verification.phase() != VerificationPhase::Idle {
                tracing::info!(mode = mode.kind(), "identity link changed; verification restarted");
            }
            self.draft.identity_link.verification.restart();
            self.draft.identity_link.issued_id = None;
            self.draft.identity_link.mode = mode;
        }
        Ok(self.edited())
    }

    pub fn attach_photo(
        &mut self,
        reference: PhotoReference,
        method: CaptureMethod,
    ) -> EnrolResult<FieldErrors> {
        self.ensure_active(Step::Photo)?;
        self.draft.photo = Some(Photo {
            reference,
            method,
            captured_at: Utc::now(),
        });
        Ok(self.edited())
    }

    pub fn remove_photo(&mut self) -> EnrolResult<FieldErrors> {
        self.ensure_active(Step::Photo)?;
        self.draft.photo = None;
        Ok(self.edited())
    }

    pub fn edit_emergency_contacts(
        &mut self,
        contacts: EmergencyContacts,
    ) -> EnrolResult<FieldErrors> {
        self.ensure_active(Step::EmergencyContact)?;
        self.draft.emergency_contact = contacts;
        Ok(self.edited())
    }

    pub fn edit_medical_history(&mut self, history: MedicalHistory) -> EnrolResult<FieldErrors> {
        self.ensure_active(Step::MedicalHistory)?;
        self.draft.medical_history = history;
        Ok(self.edited())
    }

    /// Grants or withdraws one catalogue item.
    pub fn set_consent(&mut self, item_id: &str, granted: bool) -> EnrolResult<FieldErrors> {
        self.ensure_active(Step::Consent)?;
        if !self.cfg.consent_catalogue().contains(item_id) {
            return Err(EnrolError::UnknownConsentItem(item_id.to_string()));
        }
        if granted {
            self.draft.consent.granted.insert(item_id.to_string());
        } else {
            self.draft.consent.granted.remove(item_id);
        }
        Ok(self.edited())
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    fn verification_target(&self) -> Result<PhoneNumber, VerificationError> {
        PhoneNumber::parse(&self.draft.demographics.phone)
            .map_err(|_| VerificationError::NoReachableTarget)
    }

    fn dispatch_into(
        state: &mut VerificationState,
        dispatcher: &dyn CodeDispatcher,
        target: PhoneNumber,
        resend: bool,
    ) -> EnrolResult<()> {
        state.dispatch(dispatcher, target, resend, Utc::now())?;
        Ok(())
    }

    pub fn send_identity_code(&mut self, resend: bool) -> EnrolResult<()> {
        self.ensure_active(Step::IdentityLink)?;
        if self.draft.identity_link.mode.is_skip() {
            return Err(EnrolError::InvalidInput(
                "identity linking is skipped; no code is needed".into(),
            ));
        }
        if self.draft.identity_link.mode.reference().is_none() {
            return Err(EnrolError::StepBlocked {
                step: Step::IdentityLink,
                errors: self.live_errors(),
            });
        }
        let target = self.verification_target()?;
        Self::dispatch_into(
            &mut self.draft.identity_link.verification,
            self.dispatcher.as_ref(),
            target,
            resend,
        )?;
        self.dirty = true;
        Ok(())
    }

    /// Submits a code for the identity link. On success the issued id is recorded.
    pub fn submit_identity_code(&mut self, code: &str) -> EnrolResult<()> {
        self.ensure_active(Step::IdentityLink)?;
        let result = self.draft.identity_link.verification.submit(
            self.dispatcher.as_ref(),
            code,
            self.cfg.verification_policy(),
            Utc::now(),
        );
        self.dirty = true;
        result?;

        self.draft.identity_link.issued_id = self
            .draft
            .identity_link
            .mode
            .reference()
            .map(str::to_string);
        tracing::info!(mode = self.draft.identity_link.mode.kind(), "identity link verified");
        Ok(())
    }

    pub fn send_consent_code(&mut self, resend: bool) -> EnrolResult<()> {
        self.ensure_active(Step::Consent)?;
        let target = self.verification_target()?;
        Self::dispatch_into(
            &mut self.draft.consent.verification,
            self.dispatcher.as_ref(),
            target,
            resend,
        )?;
        self.dirty = true;
        Ok(())
    }

    pub fn submit_consent_code(&mut self, code: &str) -> EnrolResult<()> {
        self.ensure_active(Step::Consent)?;
        let result = self.draft.consent.verification.submit(
            self.dispatcher.as_ref(),
            code,
            self.cfg.verification_policy(),
            Utc::now(),
        );
        self.dirty = true;
        result?;
        tracing::info!(granted = self.draft.consent.granted.len(), "consent verified");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Snapshots the draft now.
    ///
    /// A failed write leaves the in-memory draft authoritative and still marked unsaved.
    pub fn save_draft(&mut self) -> Result<SaveReceipt, PersistenceError> {
        match self.persistence.snapshot(&self.draft, Utc::now()) {
            Ok(receipt) => {
                self.draft.saved_at = Some(receipt.saved_at);
                self.dirty = false;
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(error = %e, "draft snapshot failed; continuing with in-memory draft");
                Err(e)
            }
        }
    }

    /// Snapshots only if something changed since the last successful save.
    pub fn autosave(&mut self) -> Option<Result<SaveReceipt, PersistenceError>> {
        if !self.dirty {
            return None;
        }
        Some(self.save_draft())
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Accepts the terminal result: hands the record to `sink`, deletes the snapshot and
    /// starts over with the empty draft.
    pub fn finish(&mut self, sink: &dyn PatientRecordSink) -> EnrolResult<EnrollmentResult> {
        if self.draft.position != Step::Completion {
            return Err(EnrolError::NotComplete);
        }
        let result = self.issuer.issue(&self.draft, Utc::now())?;
        self.draft.completion = Some(result.clone());

        let record = EnrollmentRecord {
            result: result.clone(),
            draft: self.draft.clone(),
        };
        sink.accept(&record)?;

        self.discard_draft();
        if let Err(e) = self.persistence.clear() {
            tracing::warn!(error = %e, "failed to clear draft snapshot after completion");
        }
        tracing::info!(patient_token = %result.patient_token, "enrolment completed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::ConsentCatalogue;
    use crate::dispatch::InMemoryCodeDispatcher;
    use crate::draft::{Contact, Gender};
    use crate::persistence::InMemoryDraftStorage;
    use crate::sink::InMemoryRecordSink;
    use crate::verification::DispatchId;
    use std::path::PathBuf;

    struct Harness {
        session: EnrollmentSession,
        dispatcher: Arc<InMemoryCodeDispatcher>,
        storage: Arc<InMemoryDraftStorage>,
    }

    fn harness() -> Harness {
        let dispatcher = Arc::new(InMemoryCodeDispatcher::new());
        let storage = Arc::new(InMemoryDraftStorage::new());
        let cfg = Arc::new(CoreConfig::with_defaults(PathBuf::from("unused")));
        let session = EnrollmentSession::new(
            cfg,
            dispatcher.clone(),
            DraftPersistence::new(storage.clone()),
        );
        Harness {
            session,
            dispatcher,
            storage,
        }
    }

    fn restart(h: &Harness) -> (EnrollmentSession, RestoreStatus) {
        EnrollmentSession::start(
            Arc::new(CoreConfig::with_defaults(PathBuf::from("unused"))),
            h.dispatcher.clone(),
            DraftPersistence::new(h.storage.clone()),
        )
    }

    fn demographics() -> Demographics {
        Demographics {
            first_name: "Asha".into(),
            last_name: "Rao".into(),
            date_of_birth: "1990-04-12".into(),
            gender: Some(Gender::Female),
            phone: "+91 98765 43210".into(),
            ..Default::default()
        }
    }

    fn contacts() -> EmergencyContacts {
        EmergencyContacts {
            primary: Contact {
                name: "Ravi Rao".into(),
                phone: "9876500000".into(),
                relationship: "Brother".into(),
            },
            ..Default::default()
        }
    }

    fn photo() -> PhotoReference {
        PhotoReference {
            handle: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08".into(),
            media_type: Some("image/png".into()),
            size_bytes: 1024,
        }
    }

    fn code_for(h: &Harness, state: &VerificationState) -> String {
        let id: &DispatchId = state.dispatch_id.as_ref().expect("code dispatched");
        h.dispatcher.peek_code(id).expect("code recorded")
    }

    fn wrong(code: &str) -> &'static str {
        if code == "000000" {
            "111111"
        } else {
            "000000"
        }
    }

    /// Drives the session to the consent step with identity linking skipped.
    fn to_consent(h: &mut Harness) {
        let s = &mut h.session;
        s.edit_demographics(demographics()).unwrap();
        s.advance().unwrap();
        s.select_identity_link(IdentityLinkMode::Skip).unwrap();
        s.advance().unwrap();
        s.attach_photo(photo(), CaptureMethod::Camera).unwrap();
        s.advance().unwrap();
        s.edit_emergency_contacts(contacts()).unwrap();
        s.advance().unwrap();
        s.advance().unwrap();
        assert_eq!(s.position(), Step::Consent);
    }

    fn grant_required(h: &mut Harness) {
        let required: Vec<String> = ConsentCatalogue::default_catalogue()
            .required_items()
            .map(|i| i.id.clone())
            .collect();
        for id in required {
            h.session.set_consent(&id, true).unwrap();
        }
    }

    fn verify_consent(h: &mut Harness) {
        h.session.send_consent_code(false).unwrap();
        let code = code_for(h, &h.session.draft.consent.verification);
        h.session.submit_consent_code(&code).unwrap();
    }

    fn state_in(phase: VerificationPhase) -> VerificationState {
        let now = Utc::now();
        match phase {
            VerificationPhase::Idle => VerificationState::default(),
            VerificationPhase::Verified => VerificationState {
                phase,
                dispatch_id: Some(DispatchId::new("d")),
                dispatched_at: Some(now),
                verified_at: Some(now),
                ..Default::default()
            },
            _ => VerificationState {
                phase,
                dispatch_id: Some(DispatchId::new("d")),
                dispatched_at: Some(now),
                ..Default::default()
            },
        }
    }

    const PHASES: [VerificationPhase; 4] = [
        VerificationPhase::Idle,
        VerificationPhase::CodeSent,
        VerificationPhase::Verified,
        VerificationPhase::Failed,
    ];

    #[test]
    fn identity_gate_requires_valid_data_and_verification() {
        for valid in [false, true] {
            for phase in PHASES {
                let mut h = harness();
                h.session.draft.position = Step::IdentityLink;
                h.session.draft.identity_link.mode = IdentityLinkMode::LinkExisting {
                    health_id: if valid { "12-3456-7890-1234".into() } else { String::new() },
                };
                h.session.draft.identity_link.verification = state_in(phase);

                let expected = valid && phase == VerificationPhase::Verified;
                let result = h.session.advance();
                assert_eq!(result.is_ok(), expected, "valid={valid} phase={phase}");
                let expected_position = if expected { Step::Photo } else { Step::IdentityLink };
                assert_eq!(h.session.position(), expected_position);
            }
        }
    }

    #[test]
    fn skipped_identity_needs_no_verification() {
        let mut h = harness();
        h.session.draft.position = Step::IdentityLink;
        h.session.draft.identity_link.mode = IdentityLinkMode::Skip;
        assert_eq!(h.session.advance().unwrap(), Step::Photo);
    }

    #[test]
    fn consent_gate_requires_valid_data_and_verification() {
        let required: Vec<String> = ConsentCatalogue::default_catalogue()
            .required_items()
            .map(|i| i.id.clone())
            .collect();
        for valid in [false, true] {
            for phase in PHASES {
                let mut h = harness();
                h.session.draft.position = Step::Consent;
                if valid {
                    h.session.draft.consent.granted.extend(required.iter().cloned());
                }
                h.session.draft.consent.verification = state_in(phase);

                let expected = valid && phase == VerificationPhase::Verified;
                let result = h.session.advance();
                assert_eq!(result.is_ok(), expected, "valid={valid} phase={phase}");
                let expected_position = if expected { Step::Completion } else { Step::Consent };
                assert_eq!(h.session.position(), expected_position);
            }
        }
    }

    #[test]
    fn blocked_advance_changes_nothing_and_repeats() {
        let mut h = harness();
        let before = h.session.draft.clone();

        for _ in 0..2 {
            match h.session.advance() {
                Err(EnrolError::StepBlocked { step, errors }) => {
                    assert_eq!(step, Step::Demographics);
                    assert!(errors.contains("demographics.first_name"));
                }
                other => panic!("expected StepBlocked, got {other:?}"),
            }
        }
        assert_eq!(h.session.draft, before);
        assert!(!h.session.is_dirty());
    }

    #[test]
    fn happy_path_issues_exactly_one_token() {
        let mut h = harness();
        to_consent(&mut h);
        grant_required(&mut h);
        verify_consent(&mut h);

        assert_eq!(h.session.advance().unwrap(), Step::Completion);
        let completion = h.session.draft().completion.clone().expect("token issued");
        assert!(!completion.patient_token.to_string().is_empty());
        assert!(matches!(h.session.advance(), Err(EnrolError::AtFinalStep)));

        let sink = InMemoryRecordSink::new();
        let result = h.session.finish(&sink).unwrap();
        assert_eq!(result, completion);
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].draft.demographics.first_name, "Asha");
    }

    #[test]
    fn blocked_consent_names_the_missing_item() {
        let mut h = harness();
        to_consent(&mut h);
        grant_required(&mut h);
        h.session.set_consent("treatment", false).unwrap();
        verify_consent(&mut h);

        match h.session.advance() {
            Err(EnrolError::StepBlocked { step, errors }) => {
                assert_eq!(step, Step::Consent);
                assert!(errors.contains("consent.treatment"));
            }
            other => panic!("expected StepBlocked, got {other:?}"),
        }
        assert_eq!(h.session.position(), Step::Consent);
        assert_eq!(h.session.position().position(), 6);
    }

    #[test]
    fn consent_code_mismatch_then_success() {
        let mut h = harness();
        to_consent(&mut h);
        h.session.send_consent_code(false).unwrap();
        let code = code_for(&h, &h.session.draft.consent.verification);

        let err = h.session.submit_consent_code(wrong(&code)).unwrap_err();
        assert!(matches!(
            err,
            EnrolError::Verification(VerificationError::CodeMismatch { .. })
        ));
        let state = &h.session.draft().consent.verification;
        assert_eq!(state.phase(), VerificationPhase::CodeSent);
        assert_eq!(state.attempts(), 1);

        h.session.submit_consent_code(&code).unwrap();
        assert_eq!(
            h.session.draft().consent.verification.phase(),
            VerificationPhase::Verified
        );
        assert!(h.session.draft().consent.verified_at().is_some());
    }

    #[test]
    fn reentering_completion_keeps_the_same_token() {
        let mut h = harness();
        to_consent(&mut h);
        grant_required(&mut h);
        verify_consent(&mut h);
        h.session.advance().unwrap();
        let first = h.session.draft().completion.clone().unwrap();

        assert_eq!(h.session.retreat().unwrap(), Step::Consent);
        h.session.advance().unwrap();
        assert_eq!(h.session.draft().completion.as_ref(), Some(&first));
    }

    #[test]
    fn reentered_completion_reflects_edited_demographics() {
        let mut h = harness();
        to_consent(&mut h);
        grant_required(&mut h);
        verify_consent(&mut h);
        h.session.advance().unwrap();
        let first = h.session.draft().completion.clone().unwrap();

        while h.session.position() != Step::Demographics {
            h.session.retreat().unwrap();
        }
        h.session
            .edit_demographics(Demographics {
                first_name: "Meera".into(),
                ..demographics()
            })
            .unwrap();
        while h.session.position() != Step::Completion {
            h.session.advance().unwrap();
        }

        let second = h.session.draft().completion.clone().unwrap();
        assert_eq!(second.patient_token, first.patient_token);
        let payload = crate::completion::decode_scan_payload(&second.scan_payload).unwrap();
        assert_eq!(payload.name, "Rao, Meera");

        let sink = InMemoryRecordSink::new();
        let result = h.session.finish(&sink).unwrap();
        assert_eq!(result.patient_token, first.patient_token);
        let record = &sink.records()[0];
        assert_eq!(record.result.scan_payload, second.scan_payload);
        assert_eq!(record.draft.completion.as_ref(), Some(&record.result));
    }

    #[test]
    fn retreat_keeps_data_and_stops_at_first_step() {
        let mut h = harness();
        h.session.edit_demographics(demographics()).unwrap();
        h.session.advance().unwrap();
        assert_eq!(h.session.retreat().unwrap(), Step::Demographics);
        assert_eq!(h.session.draft().demographics, demographics());
        assert!(matches!(h.session.retreat(), Err(EnrolError::AtFirstStep)));
    }

    #[test]
    fn edits_are_limited_to_the_active_step() {
        let mut h = harness();
        let err = h.session.edit_medical_history(MedicalHistory::default()).unwrap_err();
        assert!(matches!(
            err,
            EnrolError::StepNotActive {
                step: Step::MedicalHistory,
                active: Step::Demographics
            }
        ));
    }

    #[test]
    fn edits_return_live_errors() {
        let mut h = harness();
        let mut partial = demographics();
        partial.last_name.clear();
        let errors = h.session.edit_demographics(partial).unwrap();
        assert_eq!(errors.fields().collect::<Vec<_>>(), vec!["demographics.last_name"]);
        assert!(!h.session.can_advance());
    }

    #[test]
    fn unknown_consent_item_is_rejected() {
        let mut h = harness();
        h.session.draft.position = Step::Consent;
        assert!(matches!(
            h.session.set_consent("marketing", true),
            Err(EnrolError::UnknownConsentItem(_))
        ));
    }

    #[test]
    fn changing_identity_mode_restarts_verification() {
        let mut h = harness();
        h.session.edit_demographics(demographics()).unwrap();
        h.session.advance().unwrap();
        let mode = IdentityLinkMode::LinkExisting {
            health_id: "12-3456-7890-1234".into(),
        };
        h.session.select_identity_link(mode.clone()).unwrap();
        h.session.send_identity_code(false).unwrap();
        let code = code_for(&h, &h.session.draft.identity_link.verification);
        h.session.submit_identity_code(&code).unwrap();
        assert_eq!(
            h.session.draft().identity_link.issued_id.as_deref(),
            Some("12-3456-7890-1234")
        );

        // Re-selecting the same mode is not a restart.
        h.session.select_identity_link(mode).unwrap();
        assert!(h.session.draft().identity_link.verification.is_verified());

        h.session.select_identity_link(IdentityLinkMode::Skip).unwrap();
        let link = &h.session.draft().identity_link;
        assert_eq!(link.verification.phase(), VerificationPhase::Idle);
        assert!(link.issued_id.is_none());
        assert!(h.session.draft().check_structure().is_ok());
    }

    #[test]
    fn identity_code_needs_a_reachable_phone() {
        let mut h = harness();
        h.session.draft.position = Step::IdentityLink;
        h.session
            .select_identity_link(IdentityLinkMode::CreateNew {
                requested_address: "asha@abdm".into(),
            })
            .unwrap();
        let err = h.session.send_identity_code(false).unwrap_err();
        assert!(matches!(
            err,
            EnrolError::Verification(VerificationError::NoReachableTarget)
        ));
        assert_eq!(
            h.session.draft().identity_link.verification.phase(),
            VerificationPhase::Idle
        );
    }

    #[test]
    fn restore_resumes_at_the_saved_position() {
        let mut h = harness();
        h.session.edit_demographics(demographics()).unwrap();
        h.session.advance().unwrap();
        h.session.select_identity_link(IdentityLinkMode::Skip).unwrap();
        h.session.save_draft().unwrap();
        let saved = h.session.draft().clone();

        let (restored, status) = restart(&h);
        assert_eq!(
            status,
            RestoreStatus::Resumed {
                position: Step::IdentityLink,
                clamped_from: None
            }
        );
        assert_eq!(restored.draft(), &saved);
    }

    #[test]
    fn restore_clamps_unreachable_position() {
        let h = harness();
        let mut draft = EnrollmentDraft::empty();
        draft.position = Step::MedicalHistory;
        draft.demographics = demographics();
        DraftPersistence::new(h.storage.clone())
            .snapshot(&draft, Utc::now())
            .unwrap();

        let (restored, status) = restart(&h);
        assert_eq!(
            status,
            RestoreStatus::Resumed {
                position: Step::IdentityLink,
                clamped_from: Some(Step::MedicalHistory)
            }
        );
        assert_eq!(restored.draft().demographics, demographics());
    }

    #[test]
    fn code_sent_before_restart_needs_a_new_dispatch() {
        let mut h = harness();
        to_consent(&mut h);
        grant_required(&mut h);
        h.session.send_consent_code(false).unwrap();
        h.session.save_draft().unwrap();

        let fresh = Arc::new(InMemoryCodeDispatcher::new());
        let (mut restored, _) = EnrollmentSession::start(
            Arc::new(CoreConfig::with_defaults(PathBuf::from("unused"))),
            fresh.clone(),
            DraftPersistence::new(h.storage.clone()),
        );
        assert_eq!(
            restored.draft().consent.verification.phase(),
            VerificationPhase::CodeSent
        );

        let err = restored.submit_consent_code("123456").unwrap_err();
        assert!(matches!(
            err,
            EnrolError::Verification(VerificationError::CodeExpired)
        ));

        restored.send_consent_code(false).unwrap();
        let id = restored.draft().consent.verification.dispatch_id.clone().unwrap();
        let code = fresh.peek_code(&id).unwrap();
        restored.submit_consent_code(&code).unwrap();
        assert_eq!(restored.advance().unwrap(), Step::Completion);
    }

    #[test]
    fn corrupt_snapshot_starts_fresh() {
        let h = harness();
        h.storage
            .put_raw(crate::constants::DRAFT_SNAPSHOT_KEY, b"{\"schema_version\":1,\"dra");

        let (restored, status) = restart(&h);
        assert!(matches!(status, RestoreStatus::Discarded { .. }));
        assert_eq!(restored.position(), Step::Demographics);
        assert!(restored.draft().is_blank());
    }

    #[test]
    fn autosave_writes_only_when_dirty() {
        let mut h = harness();
        assert!(h.session.autosave().is_none());

        h.session.edit_demographics(demographics()).unwrap();
        assert!(h.session.autosave().unwrap().is_ok());
        assert!(h.session.draft().saved_at.is_some());
        assert!(h.session.autosave().is_none());
    }

    #[test]
    fn failed_save_keeps_working_in_memory() {
        let mut h = harness();
        h.storage.set_unavailable(true);
        h.session.edit_demographics(demographics()).unwrap();

        assert!(h.session.save_draft().is_err());
        assert!(h.session.is_dirty());
        assert!(h.session.draft().saved_at.is_none());
        assert_eq!(h.session.advance().unwrap(), Step::IdentityLink);
    }

    #[test]
    fn reset_returns_to_empty_and_purges_snapshot() {
        let mut h = harness();
        h.session.edit_demographics(demographics()).unwrap();
        h.session.advance().unwrap();
        h.session.save_draft().unwrap();

        h.session.reset().unwrap();
        assert_eq!(h.session.position(), Step::Demographics);
        assert!(h.session.draft().is_blank());
        let (_, status) = restart(&h);
        assert_eq!(status, RestoreStatus::Fresh);
    }

    #[test]
    fn finish_requires_completion_and_clears_snapshot() {
        let mut h = harness();
        let sink = InMemoryRecordSink::new();
        assert!(matches!(h.session.finish(&sink), Err(EnrolError::NotComplete)));

        to_consent(&mut h);
        grant_required(&mut h);
        verify_consent(&mut h);
        h.session.advance().unwrap();
        h.session.save_draft().unwrap();

        h.session.finish(&sink).unwrap();
        assert!(h.session.draft().is_blank());
        let (_, status) = restart(&h);
        assert_eq!(status, RestoreStatus::Fresh);
    }

    #[test]
    fn view_reports_gating_state() {
        let mut h = harness();
        let view = h.session.view();
        assert_eq!(view.position, 1);
        assert_eq!(view.total_steps, 7);
        assert!(!view.can_advance);
        assert!(!view.can_retreat);

        h.session.edit_demographics(demographics()).unwrap();
        let view = h.session.view();
        assert!(view.can_advance);
        assert!(view.errors.is_empty());
        assert!(view.unsaved_changes);
    }
}
