//! Patient-record sink.
//!
//! Accepting the completion step hands the finalised draft and its issued result to a sink.
//! What happens to the record after that (upload, indexing) belongs to the sink's owner.

use crate::completion::EnrollmentResult;
use crate::constants::ENROLLMENT_RECORD_FILENAME;
use crate::draft::EnrollmentDraft;
use crate::error::{EnrolError, EnrolResult};
use enrol_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A finalised enrolment as handed to the sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollmentRecord {
    pub result: EnrollmentResult,
    pub draft: EnrollmentDraft,
}

pub trait PatientRecordSink: Send + Sync {
    fn accept(&self, record: &EnrollmentRecord) -> EnrolResult<()>;
}

/// Writes each record to `<records>/<s1>/<s2>/<token>/enrollment.yaml`.
///
/// A record is written once; a second acceptance of the same token is refused.
#[derive(Debug)]
pub struct YamlRecordSink {
    records_dir: PathBuf,
}

impl YamlRecordSink {
    pub fn new(records_dir: &Path) -> Self {
        Self {
            records_dir: records_dir.to_path_buf(),
        }
    }

    pub fn record_path(&self, patient_token: &ShardableUuid) -> PathBuf {
        patient_token
            .sharded_dir(&self.records_dir)
            .join(ENROLLMENT_RECORD_FILENAME)
    }

    pub fn read(&self, patient_token: &ShardableUuid) -> EnrolResult<EnrollmentRecord> {
        let text = fs::read_to_string(self.record_path(patient_token)).map_err(EnrolError::FileRead)?;
        let deserializer = serde_yaml::Deserializer::from_str(&text);
        serde_path_to_error::deserialize(deserializer)
            .map_err(|e| EnrolError::YamlDeserialization(format!("{}: {}", e.path(), e.inner())))
    }
}

impl PatientRecordSink for YamlRecordSink {
    fn accept(&self, record: &EnrollmentRecord) -> EnrolResult<()> {
        let path = self.record_path(&record.result.patient_token);
        if path.exists() {
            return Err(EnrolError::RecordAlreadyExists(path));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(EnrolError::RecordDirCreation)?;
        }

        let yaml = serde_yaml::to_string(record).map_err(EnrolError::YamlSerialization)?;
        fs::write(&path, yaml).map_err(EnrolError::FileWrite)?;

        tracing::info!(
            patient_token = %record.result.patient_token,
            path = %path.display(),
            "enrolment record written"
        );
        Ok(())
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct InMemoryRecordSink {
    records: Mutex<Vec<EnrollmentRecord>>,
}

impl InMemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EnrollmentRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl PatientRecordSink for InMemoryRecordSink {
    fn accept(&self, record: &EnrollmentRecord) -> EnrolResult<()> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if records
            .iter()
            .any(|r| r.result.patient_token == record.result.patient_token)
        {
            return Err(EnrolError::InvalidInput(format!(
                "record for {} already accepted",
                record.result.patient_token
            )));
        }
        records.push(record.clone());
        Ok(())
    }
}
