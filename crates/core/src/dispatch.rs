//! Code-dispatch collaborators.
//!
//! Real SMS delivery is external. These implementations back tests, local development and the
//! terminal harness.

use crate::error::DispatchError;
use crate::verification::{CodeDispatcher, DispatchId};
use enrol_types::PhoneNumber;
use enrol_uuid::ShardableUuid;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;

const CODE_DIGITS: u32 = 6;

/// Holds one random six-digit code per dispatch in memory.
#[derive(Debug, Default)]
pub struct InMemoryCodeDispatcher {
    codes: Mutex<HashMap<DispatchId, String>>,
}

impl InMemoryCodeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The code behind `dispatch`, for tests and development tooling.
    pub fn peek_code(&self, dispatch: &DispatchId) -> Option<String> {
        let codes = self.codes.lock().unwrap_or_else(|p| p.into_inner());
        codes.get(dispatch).cloned()
    }

    fn generate_code() -> String {
        let upper = 10u32.pow(CODE_DIGITS);
        let value = rand::thread_rng().gen_range(0..upper);
        format!("{value:0width$}", width = CODE_DIGITS as usize)
    }
}

impl CodeDispatcher for InMemoryCodeDispatcher {
    fn send_code(&self, target: &PhoneNumber) -> Result<DispatchId, DispatchError> {
        let dispatch = DispatchId::new(ShardableUuid::new().to_string());
        let code = Self::generate_code();
        let mut codes = self.codes.lock().unwrap_or_else(|p| p.into_inner());
        codes.insert(dispatch.clone(), code);
        tracing::debug!(target_phone = %target.masked(), dispatch = %dispatch, "recorded code");
        Ok(dispatch)
    }

    fn check_code(&self, dispatch: &DispatchId, candidate: &str) -> Result<bool, DispatchError> {
        let codes = self.codes.lock().unwrap_or_else(|p| p.into_inner());
        match codes.get(dispatch) {
            Some(code) => Ok(code == candidate),
            None => Err(DispatchError::UnknownDispatch(dispatch.to_string())),
        }
    }
}

/// Development placeholder that accepts one configured code for every dispatch.
///
/// Stateless, so it works across separate processes sharing one persisted draft.
#[derive(Clone, Debug)]
pub struct FixedCodeDispatcher {
    code: String,
}

impl FixedCodeDispatcher {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

impl CodeDispatcher for FixedCodeDispatcher {
    fn send_code(&self, target: &PhoneNumber) -> Result<DispatchId, DispatchError> {
        let dispatch = DispatchId::new(ShardableUuid::new().to_string());
        tracing::info!(
            target_phone = %target.masked(),
            code = %self.code,
            "development dispatcher: code not sent, use the configured code"
        );
        Ok(dispatch)
    }

    fn check_code(&self, _dispatch: &DispatchId, candidate: &str) -> Result<bool, DispatchError> {
        Ok(candidate == self.code)
    }
}
