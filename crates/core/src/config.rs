//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. Environment variables are read by the binaries only; the helpers
//! here take the raw optional values so they can be tested without touching the process
//! environment.

use crate::consent::ConsentCatalogue;
use crate::constants::{
    DEFAULT_AUTOSAVE_SECS, DEFAULT_CODE_TTL_SECS, DEFAULT_DATA_DIR, DEFAULT_MAX_ATTEMPTS,
    DRAFTS_DIR_NAME, PHOTOS_DIR_NAME, RECORDS_DIR_NAME,
};
use crate::error::{EnrolError, EnrolResult};
use crate::verification::VerificationPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    verification_policy: VerificationPolicy,
    autosave_interval: Duration,
    consent_catalogue: ConsentCatalogue,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns `EnrolError::InvalidInput` if the autosave interval is zero.
    pub fn new(
        data_dir: PathBuf,
        verification_policy: VerificationPolicy,
        autosave_interval: Duration,
        consent_catalogue: ConsentCatalogue,
    ) -> EnrolResult<Self> {
        if autosave_interval.is_zero() {
            return Err(EnrolError::InvalidInput(
                "autosave interval must be greater than zero".into(),
            ));
        }

        Ok(Self {
            data_dir,
            verification_policy,
            autosave_interval,
            consent_catalogue,
        })
    }

    /// Defaults rooted at `data_dir`.
    pub fn with_defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            verification_policy: VerificationPolicy::default(),
            autosave_interval: Duration::from_secs(DEFAULT_AUTOSAVE_SECS),
            consent_catalogue: ConsentCatalogue::default_catalogue(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn drafts_dir(&self) -> PathBuf {
        self.data_dir.join(DRAFTS_DIR_NAME)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join(RECORDS_DIR_NAME)
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.data_dir.join(PHOTOS_DIR_NAME)
    }

    pub fn verification_policy(&self) -> &VerificationPolicy {
        &self.verification_policy
    }

    pub fn autosave_interval(&self) -> Duration {
        self.autosave_interval
    }

    pub fn consent_catalogue(&self) -> &ConsentCatalogue {
        &self.consent_catalogue
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn positive_u64(name: &str, value: &str) -> EnrolResult<u64> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(EnrolError::InvalidInput(format!(
            "{name} must be a positive integer, got '{value}'"
        ))),
    }
}

/// Resolve the data directory from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns [`DEFAULT_DATA_DIR`].
pub fn data_dir_from_env_value(value: Option<String>) -> PathBuf {
    non_empty(value)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Parse the verification policy from optional attempt-ceiling and TTL values.
pub fn verification_policy_from_env_values(
    max_attempts: Option<String>,
    code_ttl_secs: Option<String>,
) -> EnrolResult<VerificationPolicy> {
    let max_attempts = match non_empty(max_attempts) {
        Some(v) => {
            let n = positive_u64("ENROL_OTP_MAX_ATTEMPTS", &v)?;
            u32::try_from(n).map_err(|_| {
                EnrolError::InvalidInput(format!("ENROL_OTP_MAX_ATTEMPTS is too large: {n}"))
            })?
        }
        None => DEFAULT_MAX_ATTEMPTS,
    };
    let code_ttl_secs = match non_empty(code_ttl_secs) {
        Some(v) => positive_u64("ENROL_OTP_TTL_SECS", &v)?,
        None => DEFAULT_CODE_TTL_SECS,
    };
    VerificationPolicy::new(max_attempts, Duration::from_secs(code_ttl_secs))
}

/// Parse the autosave interval from an optional number of seconds.
pub fn autosave_interval_from_env_value(value: Option<String>) -> EnrolResult<Duration> {
    let secs = match non_empty(value) {
        Some(v) => positive_u64("ENROL_AUTOSAVE_SECS", &v)?,
        None => DEFAULT_AUTOSAVE_SECS,
    };
    Ok(Duration::from_secs(secs))
}

/// Load the consent catalogue from an optional YAML path, falling back to the built-in one.
pub fn consent_catalogue_from_env_value(value: Option<String>) -> EnrolResult<ConsentCatalogue> {
    match non_empty(value) {
        Some(path) => ConsentCatalogue::load(Path::new(&path)),
        None => Ok(ConsentCatalogue::default_catalogue()),
    }
}
