use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::ModelParams;

/// One historical appointment as it appears in the source CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "PatientId")]
    pub patient_id: Option<f64>,
    #[serde(rename = "AppointmentID")]
    pub appointment_id: Option<i64>,
    #[serde(rename = "Gender")]
    pub gender: Option<String>,
    #[serde(rename = "ScheduledDay")]
    pub scheduled_day: Option<String>,
    #[serde(rename = "AppointmentDay")]
    pub appointment_day: Option<String>,
    #[serde(rename = "Age")]
    pub age: Option<i64>,
    #[serde(rename = "Neighbourhood")]
    pub neighbourhood: Option<String>,
    #[serde(rename = "Scholarship")]
    pub scholarship: Option<i64>,
    #[serde(rename = "Hipertension")]
    pub hipertension: Option<i64>,
    #[serde(rename = "Diabetes")]
    pub diabetes: Option<i64>,
    #[serde(rename = "Alcoholism")]
    pub alcoholism: Option<i64>,
    #[serde(rename = "Handcap")]
    pub handcap: Option<i64>,
    #[serde(rename = "SMS_received")]
    pub sms_received: Option<i64>,
    #[serde(rename = "No-show")]
    pub no_show: Option<String>,
}

/// Hashable identity of a raw record, used to drop exact duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    patient_id: Option<u64>,
    appointment_id: Option<i64>,
    gender: Option<String>,
    scheduled_day: Option<String>,
    appointment_day: Option<String>,
    age: Option<i64>,
    neighbourhood: Option<String>,
    flags: [Option<i64>; 6],
    no_show: Option<String>,
}

impl RawRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            patient_id: self.patient_id.map(f64::to_bits),
            appointment_id: self.appointment_id,
            gender: self.gender.clone(),
            scheduled_day: self.scheduled_day.clone(),
            appointment_day: self.appointment_day.clone(),
            age: self.age,
            neighbourhood: self.neighbourhood.clone(),
            flags: [
                self.scholarship,
                self.hipertension,
                self.diabetes,
                self.alcoholism,
                self.handcap,
                self.sms_received,
            ],
            no_show: self.no_show.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "M")]
    Male,
}

impl Gender {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "F" => Some(Gender::Female),
            "M" => Some(Gender::Male),
            _ => None,
        }
    }

    pub fn code(self) -> f64 {
        match self {
            Gender::Female => 0.0,
            Gender::Male => 1.0,
        }
    }
}

/// Appointment outcome. Serialized the way the `No-show` column spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "No")]
    Attended,
    #[serde(rename = "Yes")]
    NoShow,
}

impl Outcome {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "No" => Some(Outcome::Attended),
            "Yes" => Some(Outcome::NoShow),
            _ => None,
        }
    }

    /// Encoded class label. No-show is the positive class.
    pub fn label(self) -> usize {
        match self {
            Outcome::Attended => 0,
            Outcome::NoShow => 1,
        }
    }
}

/// A deduplicated, imputed, typed and age-filtered appointment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRecord {
    #[serde(rename = "PatientId")]
    pub patient_id: f64,
    #[serde(rename = "AppointmentID")]
    pub appointment_id: i64,
    #[serde(rename = "Gender")]
    pub gender: Gender,
    #[serde(rename = "ScheduledDay")]
    pub scheduled_day: NaiveDateTime,
    #[serde(rename = "AppointmentDay")]
    pub appointment_day: NaiveDateTime,
    #[serde(rename = "Age")]
    pub age: i64,
    #[serde(rename = "Neighbourhood")]
    pub neighbourhood: String,
    #[serde(rename = "Scholarship")]
    pub scholarship: i64,
    #[serde(rename = "Hipertension")]
    pub hipertension: i64,
    #[serde(rename = "Diabetes")]
    pub diabetes: i64,
    #[serde(rename = "Alcoholism")]
    pub alcoholism: i64,
    #[serde(rename = "Handcap")]
    pub handcap: i64,
    #[serde(rename = "SMS_received")]
    pub sms_received: i64,
    #[serde(rename = "No-show")]
    pub outcome: Outcome,
}

/// Parses the timestamp spellings found in the dataset and in requests.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Unknown,
    Running,
    Completed,
    Failed,
}

/// The singleton training status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub status: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineStatus {
    pub fn unknown() -> Self {
        Self {
            status: PipelineState::Unknown,
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn running(start_time: DateTime<Utc>) -> Self {
        Self {
            status: PipelineState::Running,
            start_time: Some(start_time),
            end_time: None,
            error: None,
        }
    }

    pub fn completed(self, end_time: DateTime<Utc>) -> Self {
        Self {
            status: PipelineState::Completed,
            end_time: Some(end_time),
            error: None,
            ..self
        }
    }

    pub fn failed(self, end_time: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: PipelineState::Failed,
            end_time: Some(end_time),
            error: Some(error.into()),
            ..self
        }
    }
}

/// Held-out evaluation of one tuned model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub best_params: ModelParams,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// `[[tn, fp], [fn, tp]]`, rows are true labels.
    pub confusion_matrix: [[u64; 2]; 2],
    pub cv_score: f64,
}

/// Every family's evaluation plus the winner, as stored in `model_evaluation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: Uuid,
    pub results: BTreeMap<String, EvaluationResult>,
    pub best_model: String,
    pub completed_at: DateTime<Utc>,
}

impl TrainingRun {
    pub fn best(&self) -> Option<&EvaluationResult> {
        self.results.get(&self.best_model)
    }
}
