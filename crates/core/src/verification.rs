//! One-time-code verification sub-protocol.
//!
//! A [`VerificationState`] is embedded twice in the draft (identity link and consent). It moves
//! through `Idle -> CodeSent -> Verified`, with `Failed` reached after too many mismatches or an
//! expired code. `Verified` is a sink; only [`VerificationState::restart`] leaves it.
//!
//! The state never holds the true code. It keeps the opaque [`DispatchId`] returned by the
//! [`CodeDispatcher`] and relays candidates to it.

use crate::constants::{DEFAULT_CODE_TTL_SECS, DEFAULT_MAX_ATTEMPTS};
use crate::error::{DispatchError, EnrolError, EnrolResult, VerificationError};
use chrono::{DateTime, Utc};
use enrol_types::PhoneNumber;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPhase {
    #[default]
    Idle,
    CodeSent,
    Verified,
    Failed,
}

impl fmt::Display for VerificationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationPhase::Idle => "idle",
            VerificationPhase::CodeSent => "code_sent",
            VerificationPhase::Verified => "verified",
            VerificationPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Opaque handle for one code dispatch, issued by the dispatch collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchId(String);

impl DispatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sends one-time codes and checks candidates against them.
///
/// Implementations own the true code; the engine only ever sees the [`DispatchId`].
pub trait CodeDispatcher: Send + Sync {
    fn send_code(&self, target: &PhoneNumber) -> Result<DispatchId, DispatchError>;

    fn check_code(&self, dispatch: &DispatchId, candidate: &str) -> Result<bool, DispatchError>;
}

/// Attempt ceiling and code lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerificationPolicy {
    max_attempts: u32,
    code_ttl: Duration,
}

impl VerificationPolicy {
    /// # Errors
    ///
    /// Returns `EnrolError::InvalidInput` if `max_attempts` is zero or `code_ttl` is zero.
    pub fn new(max_attempts: u32, code_ttl: Duration) -> EnrolResult<Self> {
        if max_attempts == 0 {
            return Err(EnrolError::InvalidInput(
                "max_attempts must be at least 1".into(),
            ));
        }
        if code_ttl.is_zero() {
            return Err(EnrolError::InvalidInput(
                "code_ttl must be greater than zero".into(),
            ));
        }
        Ok(Self {
            max_attempts,
            code_ttl,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn code_ttl(&self) -> Duration {
        self.code_ttl
    }
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            code_ttl: Duration::from_secs(DEFAULT_CODE_TTL_SECS),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationState {
    pub(crate) phase: VerificationPhase,
    pub(crate) dispatch_id: Option<DispatchId>,
    pub(crate) target: Option<PhoneNumber>,
    pub(crate) attempts: u32,
    pub(crate) dispatched_at: Option<DateTime<Utc>>,
    pub(crate) verified_at: Option<DateTime<Utc>>,
}

impl VerificationState {
    pub fn phase(&self) -> VerificationPhase {
        self.phase
    }

    pub fn is_verified(&self) -> bool {
        self.phase == VerificationPhase::Verified
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn target(&self) -> Option<&PhoneNumber> {
        self.target.as_ref()
    }

    pub fn dispatched_at(&self) -> Option<DateTime<Utc>> {
        self.dispatched_at
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    pub fn remaining_attempts(&self, policy: &VerificationPolicy) -> u32 {
        match self.phase {
            VerificationPhase::CodeSent => policy.max_attempts.saturating_sub(self.attempts),
            _ => 0,
        }
    }

    /// Explicit user-initiated restart of the sub-flow; the only way out of `Verified`.
    pub fn restart(&mut self) {
        *self = Self::default();
    }

    /// Requests a code for `target`.
    ///
    /// A second dispatch while a code is outstanding needs `resend`. On success the attempt
    /// counter resets and any earlier dispatch is forgotten. On collaborator failure nothing
    /// changes.
    pub fn dispatch(
        &mut self,
        dispatcher: &dyn CodeDispatcher,
        target: PhoneNumber,
        resend: bool,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        match self.phase {
            VerificationPhase::Verified => return Err(VerificationError::AlreadyVerified),
            VerificationPhase::CodeSent if !resend => {
                return Err(VerificationError::CodeAlreadySent)
            }
            _ => {}
        }

        let dispatch_id = dispatcher.send_code(&target).map_err(|e| {
            tracing::warn!(target_phone = %target.masked(), error = %e, "code dispatch failed");
            VerificationError::DispatchUnavailable(e.to_string())
        })?;

        tracing::info!(target_phone = %target.masked(), resend, "verification code dispatched");
        *self = Self {
            phase: VerificationPhase::CodeSent,
            dispatch_id: Some(dispatch_id),
            target: Some(target),
            attempts: 0,
            dispatched_at: Some(now),
            verified_at: None,
        };
        Ok(())
    }

    /// Relays `candidate` to the dispatcher.
    ///
    /// Empty candidates and collaborator failures are rejected without counting an attempt. A
    /// dispatch the collaborator no longer knows is treated as expired. The attempt that reaches the policy ceiling reports `CodeMismatch { remaining: 0 }` and
    /// moves the phase to `Failed`.
    pub fn submit(
        &mut self,
        dispatcher: &dyn CodeDispatcher,
        candidate: &str,
        policy: &VerificationPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        match self.phase {
            VerificationPhase::Verified => return Err(VerificationError::AlreadyVerified),
            VerificationPhase::Idle => return Err(VerificationError::NotDispatched),
            VerificationPhase::Failed if self.attempts >= policy.max_attempts => {
                return Err(VerificationError::TooManyAttempts)
            }
            VerificationPhase::Failed => return Err(VerificationError::CodeExpired),
            VerificationPhase::CodeSent => {}
        }

        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Err(VerificationError::EmptyCode);
        }

        if self.is_expired(policy, now) {
            self.phase = VerificationPhase::Failed;
            tracing::info!("verification code expired");
            return Err(VerificationError::CodeExpired);
        }

        let Some(dispatch_id) = self.dispatch_id.as_ref() else {
            return Err(VerificationError::NotDispatched);
        };

        let matched = match dispatcher.check_code(dispatch_id, candidate) {
            Ok(matched) => matched,
            // The dispatcher no longer knows this code, e.g. after a restart.
            Err(DispatchError::UnknownDispatch(_)) => {
                self.phase = VerificationPhase::Failed;
                tracing::info!("verification code no longer known to dispatcher");
                return Err(VerificationError::CodeExpired);
            }
            Err(e) => return Err(VerificationError::DispatchUnavailable(e.to_string())),
        };

        if matched {
            self.phase = VerificationPhase::Verified;
            self.verified_at = Some(now);
            tracing::info!(attempts = self.attempts, "verification succeeded");
            return Ok(());
        }

        self.attempts += 1;
        let remaining = policy.max_attempts.saturating_sub(self.attempts);
        if remaining == 0 {
            self.phase = VerificationPhase::Failed;
            tracing::warn!(attempts = self.attempts, "verification attempt ceiling reached");
        }
        Err(VerificationError::CodeMismatch { remaining })
    }

    fn is_expired(&self, policy: &VerificationPolicy, now: DateTime<Utc>) -> bool {
        match self.dispatched_at {
            Some(dispatched_at) => {
                let elapsed = (now - dispatched_at).to_std().unwrap_or_default();
                elapsed > policy.code_ttl
            }
            None => false,
        }
    }

    /// Rejects field combinations no sequence of operations can produce.
    pub fn check_consistency(&self) -> Result<(), String> {
        match self.phase {
            VerificationPhase::Idle => {
                if self.dispatch_id.is_some() || self.dispatched_at.is_some() || self.attempts != 0
                {
                    return Err("idle state carries dispatch data".into());
                }
            }
            VerificationPhase::CodeSent | VerificationPhase::Failed => {
                if self.dispatch_id.is_none() || self.dispatched_at.is_none() {
                    return Err(format!("{} state has no dispatch", self.phase));
                }
            }
            VerificationPhase::Verified => {
                if self.verified_at.is_none() {
                    return Err("verified state has no verification time".into());
                }
            }
        }
        if self.phase != VerificationPhase::Verified && self.verified_at.is_some() {
            return Err(format!("{} state carries a verification time", self.phase));
        }
        Ok(())
    }
}
