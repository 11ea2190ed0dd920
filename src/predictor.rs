//! Inference over the current artifact bundle.
//!
//! The predictor never refits anything: a request is validated into the same
//! [`AppointmentFeatures`] the training side builds from cleaned records, then
//! pushed through the persisted [`TransformBundle`](crate::features::TransformBundle).

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result, ValidationErrors};
use crate::features::AppointmentFeatures;
use crate::models::{parse_timestamp, Gender};
use crate::registry::{ArtifactBundle, ArtifactRegistry};

/// Label of the "will attend" class.
const ATTENDED: usize = 0;

/// One appointment to score, using the dataset's column names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    #[serde(rename = "ScheduledDay")]
    pub scheduled_day: Option<String>,
    #[serde(rename = "AppointmentDay")]
    pub appointment_day: Option<String>,
    #[serde(rename = "Gender")]
    pub gender: Option<String>,
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
}

impl PredictionRequest {
    /// Checks every field and reports all problems at once.
    pub fn validate(&self) -> std::result::Result<AppointmentFeatures, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let scheduled_day = date_field(&mut errors, "ScheduledDay", &self.scheduled_day);
        let appointment_day = date_field(&mut errors, "AppointmentDay", &self.appointment_day);

        let gender = match self.gender.as_deref() {
            None => {
                errors.push("Gender", "This field is required.");
                None
            }
            Some(value) => {
                let parsed = Gender::parse(value);
                if parsed.is_none() {
                    errors.push("Gender", format!("\"{value}\" is not a valid choice."));
                }
                parsed
            }
        };

        let neighbourhood = match self.neighbourhood.as_deref().map(str::trim) {
            None => {
                errors.push("Neighbourhood", "This field is required.");
                None
            }
            Some("") => {
                errors.push("Neighbourhood", "This field may not be blank.");
                None
            }
            Some(value) => Some(value.to_string()),
        };

        let age = int_field(&mut errors, "Age", self.age, 0, 120);
        let scholarship = int_field(&mut errors, "Scholarship", self.scholarship, 0, 1);
        let hipertension = int_field(&mut errors, "Hipertension", self.hipertension, 0, 1);
        let diabetes = int_field(&mut errors, "Diabetes", self.diabetes, 0, 1);
        let alcoholism = int_field(&mut errors, "Alcoholism", self.alcoholism, 0, 1);
        let handcap = int_field(&mut errors, "Handcap", self.handcap, 0, 4);
        let sms_received = int_field(&mut errors, "SMS_received", self.sms_received, 0, 1);

        match (
            scheduled_day,
            appointment_day,
            gender,
            neighbourhood,
            age,
            scholarship,
            hipertension,
            diabetes,
            alcoholism,
            handcap,
            sms_received,
        ) {
            (
                Some(scheduled_day),
                Some(appointment_day),
                Some(gender),
                Some(neighbourhood),
                Some(age),
                Some(scholarship),
                Some(hipertension),
                Some(diabetes),
                Some(alcoholism),
                Some(handcap),
                Some(sms_received),
            ) if errors.is_empty() => Ok(AppointmentFeatures {
                scheduled_day: scheduled_day.date(),
                appointment_day: appointment_day.date(),
                gender,
                age,
                neighbourhood,
                scholarship,
                hipertension,
                diabetes,
                alcoholism,
                handcap,
                sms_received,
            }),
            _ => Err(errors),
        }
    }
}

fn date_field(
    errors: &mut ValidationErrors,
    field: &str,
    value: &Option<String>,
) -> Option<chrono::NaiveDateTime> {
    match value.as_deref() {
        None => {
            errors.push(field, "This field is required.");
            None
        }
        Some(raw) => {
            let parsed = parse_timestamp(raw);
            if parsed.is_none() {
                errors.push(field, "Datetime has wrong format.");
            }
            parsed
        }
    }
}

fn int_field(
    errors: &mut ValidationErrors,
    field: &str,
    value: Option<i64>,
    min: i64,
    max: i64,
) -> Option<i64> {
    match value {
        None => {
            errors.push(field, "This field is required.");
            None
        }
        Some(v) if v < min || v > max => {
            errors.push(field, format!("Ensure this value is between {min} and {max}."));
            None
        }
        Some(v) => Some(v),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionOutcome {
    pub will_attend: bool,
    /// Probability of attendance.
    pub probability: f64,
    pub probability_percentage: f64,
    pub prediction: String,
    /// `[p_attend, p_no_show]`.
    pub class_probabilities: [f64; 2],
    /// Encoded label: 0 attended, 1 no-show.
    pub raw_prediction: usize,
}

/// Scores requests against the registry's current bundle.
pub struct Predictor {
    registry: ArtifactRegistry,
    bundle: RwLock<Option<Arc<ArtifactBundle>>>,
    reload: Mutex<()>,
}

impl Predictor {
    pub fn new(registry: ArtifactRegistry) -> Self {
        Self {
            registry,
            bundle: RwLock::new(None),
            reload: Mutex::new(()),
        }
    }

    pub fn ready(&self) -> bool {
        self.bundle.read().is_some()
    }

    pub fn bundle(&self) -> Option<Arc<ArtifactBundle>> {
        self.bundle.read().clone()
    }

    /// Replaces the held bundle with the registry's current one. Any failure
    /// leaves the predictor empty. Returns readiness.
    pub fn load(&self) -> bool {
        let loaded = match self.registry.load_current() {
            Ok(Some(bundle)) => {
                info!(family = %bundle.family, run_id = %bundle.run_id, "model loaded");
                Some(Arc::new(bundle))
            }
            Ok(None) => {
                warn!(dir = %self.registry.dir().display(), "no current model artifacts");
                None
            }
            Err(e) => {
                error!(error = %e, "failed to load model artifacts");
                None
            }
        };
        let ready = loaded.is_some();
        *self.bundle.write() = loaded;
        ready
    }

    /// Reloads after a completed pipeline run.
    pub fn refresh(&self) -> bool {
        let _guard = self.reload.lock();
        self.load()
    }

    /// Current bundle, loading it once if absent. Concurrent callers wait on
    /// the reload lock and reuse whatever the first one loaded.
    fn ensure_loaded(&self) -> Option<Arc<ArtifactBundle>> {
        if let Some(bundle) = self.bundle() {
            return Some(bundle);
        }
        let _guard = self.reload.lock();
        if let Some(bundle) = self.bundle() {
            return Some(bundle);
        }
        debug!("model not loaded, attempting lazy reload");
        self.load();
        self.bundle()
    }

    pub fn predict(&self, request: &PredictionRequest) -> Result<PredictionOutcome> {
        let bundle = self.ensure_loaded().ok_or(Error::ModelNotReady)?;
        let input = request.validate().map_err(Error::Validation)?;
        Ok(score(&bundle, &input))
    }
}

fn score(bundle: &ArtifactBundle, input: &AppointmentFeatures) -> PredictionOutcome {
    let row = bundle.transforms.transform(input);
    let class_probabilities = bundle.model.predict_proba(&row);
    let probability = class_probabilities[ATTENDED];
    let will_attend = probability >= 0.5;
    PredictionOutcome {
        will_attend,
        probability,
        probability_percentage: (probability * 10_000.0).round() / 100.0,
        prediction: if will_attend { "Will Attend" } else { "No-Show" }.to_string(),
        class_probabilities,
        raw_prediction: bundle.model.predict(&row),
    }
}
