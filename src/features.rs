//! Feature engineering shared by training and inference.
//!
//! Training fits a [`TransformBundle`] once; inference only ever applies a
//! persisted bundle. Both sides go through [`TransformBundle::transform`], so
//! encoding, scaling and column order cannot drift apart.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cleaner::most_frequent;
use crate::config::FeatureConfig;
use crate::db::{self, collections, DocumentStore};
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::models::{CleanedRecord, Gender};

/// Canonical model input columns, in order.
pub const FEATURE_COLUMNS: [&str; 11] = [
    "Gender",
    "Age",
    "Neighbourhood",
    "Scholarship",
    "Hipertension",
    "Diabetes",
    "Alcoholism",
    "Handcap",
    "SMS_received",
    "waiting_time",
    "appointment_day_of_week",
];

pub const SCALED_COLUMNS: [&str; 3] = ["Age", "waiting_time", "appointment_day_of_week"];

pub const TARGET_COLUMN: &str = "No-show";

/// Typed input to the per-row transform, from either a cleaned record or a
/// validated prediction request.
#[derive(Debug, Clone, PartialEq)]
pub struct AppointmentFeatures {
    pub scheduled_day: NaiveDate,
    pub appointment_day: NaiveDate,
    pub gender: Gender,
    pub age: i64,
    pub neighbourhood: String,
    pub scholarship: i64,
    pub hipertension: i64,
    pub diabetes: i64,
    pub alcoholism: i64,
    pub handcap: i64,
    pub sms_received: i64,
}

impl From<&CleanedRecord> for AppointmentFeatures {
    fn from(record: &CleanedRecord) -> Self {
        Self {
            scheduled_day: record.scheduled_day.date(),
            appointment_day: record.appointment_day.date(),
            gender: record.gender,
            age: record.age,
            neighbourhood: record.neighbourhood.clone(),
            scholarship: record.scholarship,
            hipertension: record.hipertension,
            diabetes: record.diabetes,
            alcoholism: record.alcoholism,
            handcap: record.handcap,
            sms_received: record.sms_received,
        }
    }
}

impl AppointmentFeatures {
    /// Whole days from scheduling to the appointment, never negative.
    pub fn waiting_time(&self) -> i64 {
        (self.appointment_day - self.scheduled_day).num_days().max(0)
    }

    /// Monday is 0.
    pub fn appointment_day_of_week(&self) -> u32 {
        self.appointment_day.weekday().num_days_from_monday()
    }
}

/// Named numeric columns for one appointment.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub gender: f64,
    pub age: f64,
    pub neighbourhood: f64,
    pub scholarship: f64,
    pub hipertension: f64,
    pub diabetes: f64,
    pub alcoholism: f64,
    pub handcap: f64,
    pub sms_received: f64,
    pub waiting_time: f64,
    pub appointment_day_of_week: f64,
}

impl FeatureVector {
    fn derive(input: &AppointmentFeatures, neighbourhood: f64) -> Self {
        Self {
            gender: input.gender.code(),
            age: input.age as f64,
            neighbourhood,
            scholarship: input.scholarship as f64,
            hipertension: input.hipertension as f64,
            diabetes: input.diabetes as f64,
            alcoholism: input.alcoholism as f64,
            handcap: input.handcap as f64,
            sms_received: input.sms_received as f64,
            waiting_time: input.waiting_time() as f64,
            appointment_day_of_week: input.appointment_day_of_week() as f64,
        }
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        match column {
            "Gender" => Some(self.gender),
            "Age" => Some(self.age),
            "Neighbourhood" => Some(self.neighbourhood),
            "Scholarship" => Some(self.scholarship),
            "Hipertension" => Some(self.hipertension),
            "Diabetes" => Some(self.diabetes),
            "Alcoholism" => Some(self.alcoholism),
            "Handcap" => Some(self.handcap),
            "SMS_received" => Some(self.sms_received),
            "waiting_time" => Some(self.waiting_time),
            "appointment_day_of_week" => Some(self.appointment_day_of_week),
            _ => None,
        }
    }

    fn get_mut(&mut self, column: &str) -> Option<&mut f64> {
        match column {
            "Age" => Some(&mut self.age),
            "waiting_time" => Some(&mut self.waiting_time),
            "appointment_day_of_week" => Some(&mut self.appointment_day_of_week),
            _ => None,
        }
    }
}

/// Label encoding: sorted distinct values map to their index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    classes: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut classes: Vec<String> = values.into_iter().map(str::to_string).collect();
        classes.sort();
        classes.dedup();
        if classes.is_empty() {
            return Err(Error::fit("cannot fit a category encoder on no values"));
        }
        Ok(Self { classes })
    }

    pub fn encode(&self, value: &str) -> Result<usize> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(value))
            .map_err(|_| Error::UnseenCategory(value.to_string()))
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// Standardises named columns to zero mean and unit variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    columns: Vec<String>,
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    fn fit(columns: &[&str], vectors: &[FeatureVector]) -> Result<Self> {
        if vectors.is_empty() {
            return Err(Error::fit("cannot fit a scaler on no rows"));
        }
        let n = vectors.len() as f64;
        let mut mean = Vec::with_capacity(columns.len());
        let mut scale = Vec::with_capacity(columns.len());
        for column in columns {
            let values: Vec<f64> = vectors
                .iter()
                .map(|v| v.get(column).ok_or_else(|| Error::fit(format!("unknown column {column}"))))
                .collect::<Result<_>>()?;
            let m = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            mean.push(m);
            // constant columns are centred but not scaled
            scale.push(if std > 0.0 { std } else { 1.0 });
        }
        Ok(Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            mean,
            scale,
        })
    }

    fn apply(&self, vector: &mut FeatureVector) {
        for ((column, mean), scale) in self.columns.iter().zip(&self.mean).zip(&self.scale) {
            if let Some(value) = vector.get_mut(column) {
                *value = (*value - mean) / scale;
            }
        }
    }
}

/// Everything inference needs to rebuild a training row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformBundle {
    pub run_id: Uuid,
    pub encoder: CategoryEncoder,
    pub scaler: StandardScaler,
    /// Most frequent training neighbourhood, used for unseen values.
    pub fallback_category: String,
    pub fallback_code: usize,
    pub feature_order: Vec<String>,
}

impl TransformBundle {
    /// Encodes a neighbourhood, substituting the fallback code when unseen.
    pub fn encode_location(&self, value: &str) -> usize {
        match self.encoder.encode(value) {
            Ok(code) => code,
            Err(_) => {
                debug!(value, fallback = %self.fallback_category, "unseen neighbourhood");
                self.fallback_code
            }
        }
    }

    /// Dates to derived columns, encoding, then scaling.
    pub fn vectorize(&self, input: &AppointmentFeatures) -> FeatureVector {
        let code = self.encode_location(&input.neighbourhood);
        let mut vector = FeatureVector::derive(input, code as f64);
        self.scaler.apply(&mut vector);
        vector
    }

    /// Lays out a vector in the persisted column order. A column the vector
    /// does not know is filled with 0 and logged; it signals a bundle written
    /// by an incompatible version or a caller bug.
    pub fn assemble(&self, vector: &FeatureVector) -> Vec<f64> {
        self.feature_order
            .iter()
            .map(|column| match vector.get(column) {
                Some(value) => value,
                None => {
                    warn!(column = %column, "expected feature missing, defaulting to 0");
                    0.0
                }
            })
            .collect()
    }

    pub fn transform(&self, input: &AppointmentFeatures) -> Vec<f64> {
        self.assemble(&self.vectorize(input))
    }
}

/// Engineered training data after rebalancing.
#[derive(Debug, Clone)]
pub struct EngineeredDataset {
    pub feature_names: Vec<String>,
    pub x: Matrix,
    pub y: Vec<usize>,
}

impl EngineeredDataset {
    /// Row count per class label.
    pub fn class_distribution(&self) -> BTreeMap<usize, usize> {
        class_counts(&self.y)
    }
}

pub struct FeatureEngineer {
    config: FeatureConfig,
    transforms: Option<TransformBundle>,
}

impl FeatureEngineer {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            transforms: None,
        }
    }

    pub fn transforms(&self) -> Option<&TransformBundle> {
        self.transforms.as_ref()
    }

    pub fn fit_transform(&mut self, records: &[CleanedRecord], run_id: Uuid) -> Result<EngineeredDataset> {
        if records.is_empty() {
            return Err(Error::fit("no cleaned records to engineer"));
        }
        info!(records = records.len(), "starting feature engineering");

        let inputs: Vec<AppointmentFeatures> = records.iter().map(AppointmentFeatures::from).collect();
        let labels: Vec<usize> = records.iter().map(|r| r.outcome.label()).collect();

        let encoder = CategoryEncoder::fit(inputs.iter().map(|i| i.neighbourhood.as_str()))?;
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for input in &inputs {
            *counts.entry(input.neighbourhood.as_str()).or_insert(0) += 1;
        }
        let fallback_category = most_frequent(&counts)
            .map(|c| c.to_string())
            .ok_or_else(|| Error::fit("no neighbourhood values"))?;
        let fallback_code = encoder.encode(&fallback_category)?;

        let unscaled: Vec<FeatureVector> = inputs
            .iter()
            .map(|input| {
                let code = encoder.encode(&input.neighbourhood).unwrap_or(fallback_code);
                FeatureVector::derive(input, code as f64)
            })
            .collect();
        let scaler = StandardScaler::fit(&SCALED_COLUMNS, &unscaled)?;

        let transforms = TransformBundle {
            run_id,
            encoder,
            scaler,
            fallback_category,
            fallback_code,
            feature_order: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        };

        let mut x = Matrix::with_columns(transforms.feature_order.len());
        for input in &inputs {
            x.push_row(&transforms.transform(input))?;
        }

        info!(distribution = ?class_counts(&labels), "class distribution before rebalancing");
        let (x, y) = oversample_minority(x, labels, self.config.seed)?;
        info!(distribution = ?class_counts(&y), "class distribution after rebalancing");

        let dataset = EngineeredDataset {
            feature_names: transforms.feature_order.clone(),
            x,
            y,
        };
        self.transforms = Some(transforms);
        Ok(dataset)
    }

    /// Writes feature metadata and the engineered rows. Failures are logged
    /// and swallowed.
    pub async fn persist(&self, store: &dyn DocumentStore, dataset: &EngineeredDataset) {
        let metadata = json!({
            "feature_names": dataset.feature_names,
            "shape": [dataset.x.n_rows(), dataset.x.n_cols()],
            "target_distribution": dataset
                .class_distribution()
                .into_iter()
                .map(|(label, count)| (label.to_string(), json!(count)))
                .collect::<Map<String, Value>>(),
            "transforms": self.transforms,
        });
        let result = db::replace_all(store, collections::ENGINEERED_FEATURES_METADATA, vec![metadata], 1).await;
        if let Err(e) = result {
            error!(error = %e, "failed to persist feature metadata");
            return;
        }

        let rows: Vec<Value> = dataset
            .x
            .rows()
            .zip(&dataset.y)
            .map(|(row, label)| {
                let mut doc: Map<String, Value> = dataset
                    .feature_names
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|v| json!(v)))
                    .collect();
                doc.insert(TARGET_COLUMN.to_string(), json!(label));
                Value::Object(doc)
            })
            .collect();

        match db::replace_all(
            store,
            collections::ENGINEERED_DATASET,
            rows,
            self.config.persist_batch_size,
        )
        .await
        {
            Ok(inserted) => info!(inserted, "engineered dataset persisted"),
            Err(e) => error!(error = %e, "failed to persist engineered dataset"),
        }
    }
}

fn class_counts(labels: &[usize]) -> BTreeMap<usize, usize> {
    let mut counts = BTreeMap::new();
    for &label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

/// Draws minority rows with replacement until both classes are equal in size.
/// Drawn rows are appended after the originals.
fn oversample_minority(mut x: Matrix, mut y: Vec<usize>, seed: u64) -> Result<(Matrix, Vec<usize>)> {
    let counts = class_counts(&y);
    let negatives = counts.get(&0).copied().unwrap_or(0);
    let positives = counts.get(&1).copied().unwrap_or(0);
    if negatives == 0 || positives == 0 {
        return Err(Error::fit("both outcome classes are required for training"));
    }

    let minority = if positives < negatives { 1 } else { 0 };
    let deficit = negatives.abs_diff(positives);
    let pool: Vec<usize> = (0..y.len()).filter(|&i| y[i] == minority).collect();

    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..deficit {
        let source = pool[rng.random_range(0..pool.len())];
        let row = x.row(source).to_vec();
        x.push_row(&row)?;
        y.push(minority);
    }
    Ok((x, y))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::Outcome;

    pub(crate) fn record(
        id: i64,
        neighbourhood: &str,
        age: i64,
        scheduled: &str,
        appointment: &str,
        outcome: Outcome,
    ) -> CleanedRecord {
        CleanedRecord {
            patient_id: id as f64,
            appointment_id: id,
            gender: if id % 2 == 0 { Gender::Female } else { Gender::Male },
            scheduled_day: crate::models::parse_timestamp(scheduled).unwrap(),
            appointment_day: crate::models::parse_timestamp(appointment).unwrap(),
            age,
            neighbourhood: neighbourhood.to_string(),
            scholarship: 0,
            hipertension: (id % 4 == 0) as i64,
            diabetes: 0,
            alcoholism: 0,
            handcap: 0,
            sms_received: (id % 3 == 0) as i64,
            outcome,
        }
    }

    pub(crate) fn sample_records() -> Vec<CleanedRecord> {
        let places = ["CENTRO", "PRAIA", "CENTRO", "JARDIM"];
        (0..24)
            .map(|i| {
                let outcome = if i % 4 == 0 { Outcome::NoShow } else { Outcome::Attended };
                let appointment = format!("2016-05-{:02}T00:00:00Z", 2 + (i % 20));
                record(
                    i,
                    places[i as usize % places.len()],
                    20 + i * 2,
                    "2016-04-29T10:15:00Z",
                    &appointment,
                    outcome,
                )
            })
            .collect()
    }

    fn fitted() -> (FeatureEngineer, EngineeredDataset) {
        let mut engineer = FeatureEngineer::new(FeatureConfig::default());
        let dataset = engineer.fit_transform(&sample_records(), Uuid::new_v4()).unwrap();
        (engineer, dataset)
    }

    #[test]
    fn waiting_time_is_clamped_at_zero() {
        let rec = record(
            1,
            "CENTRO",
            30,
            "2016-05-10T09:00:00Z",
            "2016-05-03T00:00:00Z",
            Outcome::Attended,
        );
        let input = AppointmentFeatures::from(&rec);
        assert_eq!(input.waiting_time(), 0);

        let same_day = record(
            2,
            "CENTRO",
            30,
            "2016-05-03T17:45:00Z",
            "2016-05-03T00:00:00Z",
            Outcome::Attended,
        );
        assert_eq!(AppointmentFeatures::from(&same_day).waiting_time(), 0);
    }

    #[test]
    fn day_of_week_starts_on_monday() {
        // 2016-05-02 was a Monday
        let rec = record(1, "CENTRO", 30, "2016-04-29", "2016-05-02", Outcome::Attended);
        assert_eq!(AppointmentFeatures::from(&rec).appointment_day_of_week(), 0);
        let rec = record(1, "CENTRO", 30, "2016-04-29", "2016-05-08", Outcome::Attended);
        assert_eq!(AppointmentFeatures::from(&rec).appointment_day_of_week(), 6);
    }

    #[test]
    fn encoder_is_sorted_and_deterministic() {
        let encoder = CategoryEncoder::fit(["PRAIA", "CENTRO", "PRAIA", "JARDIM"]).unwrap();
        assert_eq!(encoder.classes(), ["CENTRO", "JARDIM", "PRAIA"]);
        assert_eq!(encoder.encode("PRAIA").unwrap(), 2);
        assert_eq!(encoder.encode("PRAIA").unwrap(), encoder.encode("PRAIA").unwrap());
        assert!(matches!(encoder.encode("ILHA"), Err(Error::UnseenCategory(_))));
        assert!(CategoryEncoder::fit(std::iter::empty()).is_err());
    }

    #[test]
    fn unseen_neighbourhood_uses_fallback() {
        let (engineer, _) = fitted();
        let transforms = engineer.transforms().unwrap();
        assert_eq!(transforms.fallback_category, "CENTRO");
        assert_eq!(transforms.encode_location("ILHA DO BOI"), transforms.fallback_code);
        assert_eq!(
            transforms.encode_location("ILHA DO BOI"),
            transforms.encoder.encode("CENTRO").unwrap()
        );
    }

    #[test]
    fn produces_canonical_column_order() {
        let (engineer, dataset) = fitted();
        let expected: Vec<String> = FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect();
        assert_eq!(dataset.feature_names, expected);
        assert_eq!(engineer.transforms().unwrap().feature_order, expected);
        assert_eq!(dataset.x.n_cols(), FEATURE_COLUMNS.len());
    }

    #[test]
    fn scaled_columns_are_standardised() {
        let records = sample_records();
        let mut engineer = FeatureEngineer::new(FeatureConfig::default());
        let dataset = engineer.fit_transform(&records, Uuid::new_v4()).unwrap();

        // the first rows are the originals, before any oversampled copies
        let age_col = FEATURE_COLUMNS.iter().position(|c| *c == "Age").unwrap();
        let ages: Vec<f64> = (0..records.len()).map(|r| dataset.x.get(r, age_col)).collect();
        let mean = ages.iter().sum::<f64>() / ages.len() as f64;
        let var = ages.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / ages.len() as f64;
        assert!(mean.abs() < 1e-9);
        assert!((var - 1.0).abs() < 1e-9);

        for r in 0..dataset.x.n_rows() {
            let wait = dataset.x.get(r, 9);
            assert!(wait.is_finite());
        }
    }

    #[test]
    fn rebalances_to_equal_classes() {
        let (_, dataset) = fitted();
        let distribution = dataset.class_distribution();
        // 6 no-shows and 18 attended before rebalancing
        assert_eq!(distribution.get(&0), Some(&18));
        assert_eq!(distribution.get(&1), Some(&18));
        assert_eq!(dataset.x.n_rows(), 36);
    }

    #[test]
    fn single_class_or_empty_input_fails() {
        let records: Vec<CleanedRecord> = sample_records()
            .into_iter()
            .filter(|r| r.outcome == Outcome::Attended)
            .collect();
        let mut engineer = FeatureEngineer::new(FeatureConfig::default());
        assert!(engineer.fit_transform(&records, Uuid::new_v4()).is_err());
        assert!(engineer.fit_transform(&[], Uuid::new_v4()).is_err());
        assert!(engineer.transforms().is_none());
    }

    #[test]
    fn transform_matches_training_rows() {
        let records = sample_records();
        let mut engineer = FeatureEngineer::new(FeatureConfig::default());
        let dataset = engineer.fit_transform(&records, Uuid::new_v4()).unwrap();
        let transforms = engineer.transforms().unwrap();

        for (i, record) in records.iter().enumerate() {
            let row = transforms.transform(&AppointmentFeatures::from(record));
            assert_eq!(row.as_slice(), dataset.x.row(i));
        }
    }

    #[test]
    fn unknown_persisted_column_defaults_to_zero() {
        let (engineer, _) = fitted();
        let mut transforms = engineer.transforms().unwrap().clone();
        transforms.feature_order.push("PatientLoyalty".to_string());
        let row = transforms.transform(&AppointmentFeatures::from(&sample_records()[0]));
        assert_eq!(row.len(), FEATURE_COLUMNS.len() + 1);
        assert_eq!(row[FEATURE_COLUMNS.len()], 0.0);
    }

    #[tokio::test]
    async fn persists_metadata_and_batched_rows() {
        let (engineer, dataset) = fitted();
        let store = MemoryStore::new();
        engineer.persist(&store, &dataset).await;

        assert_eq!(store.count(collections::ENGINEERED_DATASET), dataset.x.n_rows());
        let metadata = store
            .find(collections::ENGINEERED_FEATURES_METADATA, None)
            .await
            .unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0]["shape"], json!([36, 11]));
        assert_eq!(metadata[0]["target_distribution"]["1"], json!(18));
        assert_eq!(metadata[0]["feature_names"][10], json!("appointment_day_of_week"));
    }
}
