use std::collections::{BTreeMap, HashSet};

use tracing::{error, info};

use crate::config::{AgeFilterPolicy, CleaningConfig};
use crate::db::{self, collections, DocumentStore};
use crate::error::{Error, Result};
use crate::models::{parse_timestamp, CleanedRecord, Gender, Outcome, RawRecord};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleaningReport {
    pub input: usize,
    pub duplicates: usize,
    /// Cells filled per column.
    pub imputed: BTreeMap<&'static str, usize>,
    /// Rows whose gender, outcome or dates could not be interpreted.
    pub untyped: usize,
    pub out_of_range: usize,
    pub iqr_outliers: usize,
    pub age_bounds: Option<(f64, f64)>,
    pub output: usize,
}

#[derive(Debug, Clone)]
pub struct CleaningOutcome {
    pub records: Vec<CleanedRecord>,
    pub report: CleaningReport,
}

pub struct Cleaner {
    config: CleaningConfig,
}

impl Cleaner {
    pub fn new(config: CleaningConfig) -> Self {
        Self { config }
    }

    pub fn clean(&self, records: Vec<RawRecord>) -> Result<CleaningOutcome> {
        if records.is_empty() {
            return Err(Error::Dataset("no records to clean".to_string()));
        }

        let mut report = CleaningReport {
            input: records.len(),
            ..CleaningReport::default()
        };

        let mut records = drop_duplicates(records);
        report.duplicates = report.input - records.len();
        info!(removed = report.duplicates, "dropped duplicate records");

        impute(&mut records, &mut report)?;

        let before_typing = records.len();
        let typed: Vec<CleanedRecord> = records.into_iter().filter_map(into_cleaned).collect();
        report.untyped = before_typing - typed.len();
        if report.untyped > 0 {
            info!(removed = report.untyped, "dropped records with unreadable fields");
        }

        let before_range = typed.len();
        let (min_age, max_age) = (self.config.min_age, self.config.max_age);
        let in_range: Vec<CleanedRecord> = typed
            .into_iter()
            .filter(|r| r.age >= min_age && r.age <= max_age)
            .collect();
        report.out_of_range = before_range - in_range.len();
        info!(removed = report.out_of_range, min_age, max_age, "applied hard age bounds");

        let cleaned = match self.config.age_filter {
            AgeFilterPolicy::HardBoundsOnly => in_range,
            AgeFilterPolicy::HardBoundsAndIqr { multiplier } => {
                let ages: Vec<f64> = in_range.iter().map(|r| r.age as f64).collect();
                let Some((lower, upper)) = iqr_bounds(&ages, multiplier) else {
                    return Err(Error::Dataset(
                        "no records left after hard age bounds".to_string(),
                    ));
                };
                report.age_bounds = Some((lower, upper));
                let before = in_range.len();
                let kept: Vec<CleanedRecord> = in_range
                    .into_iter()
                    .filter(|r| (r.age as f64) >= lower && (r.age as f64) <= upper)
                    .collect();
                report.iqr_outliers = before - kept.len();
                info!(removed = report.iqr_outliers, lower, upper, "removed age outliers by IQR");
                kept
            }
        };

        report.output = cleaned.len();
        info!(records = report.output, "cleaning finished");
        Ok(CleaningOutcome {
            records: cleaned,
            report,
        })
    }

    /// Overwrites `cleaned_data`. Failures are logged and swallowed.
    pub async fn persist(&self, store: &dyn DocumentStore, records: &[CleanedRecord], batch_size: usize) {
        let docs = match records
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
        {
            Ok(docs) => docs,
            Err(e) => {
                error!(error = %e, "failed to serialize cleaned data");
                return;
            }
        };

        match db::replace_all(store, collections::CLEANED_DATA, docs, batch_size).await {
            Ok(inserted) => info!(inserted, "cleaned data persisted"),
            Err(e) => error!(error = %e, "failed to persist cleaned data"),
        }
    }
}

fn drop_duplicates(records: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.key()))
        .collect()
}

fn impute(records: &mut [RawRecord], report: &mut CleaningReport) -> Result<()> {
    let categorical: [(&'static str, fn(&mut RawRecord) -> &mut Option<String>); 5] = [
        ("Gender", |r| &mut r.gender),
        ("ScheduledDay", |r| &mut r.scheduled_day),
        ("AppointmentDay", |r| &mut r.appointment_day),
        ("Neighbourhood", |r| &mut r.neighbourhood),
        ("No-show", |r| &mut r.no_show),
    ];
    for (column, field) in categorical {
        let filled = impute_mode(records, column, field)?;
        if filled > 0 {
            report.imputed.insert(column, filled);
        }
    }

    let integer: [(&'static str, fn(&mut RawRecord) -> &mut Option<i64>); 8] = [
        ("AppointmentID", |r| &mut r.appointment_id),
        ("Age", |r| &mut r.age),
        ("Scholarship", |r| &mut r.scholarship),
        ("Hipertension", |r| &mut r.hipertension),
        ("Diabetes", |r| &mut r.diabetes),
        ("Alcoholism", |r| &mut r.alcoholism),
        ("Handcap", |r| &mut r.handcap),
        ("SMS_received", |r| &mut r.sms_received),
    ];
    for (column, field) in integer {
        let filled = impute_median(records, column, field, |v| v as f64, |m| m.round() as i64)?;
        if filled > 0 {
            report.imputed.insert(column, filled);
        }
    }

    let filled = impute_median(records, "PatientId", |r| &mut r.patient_id, |v| v, |m| m)?;
    if filled > 0 {
        report.imputed.insert("PatientId", filled);
    }

    if !report.imputed.is_empty() {
        info!(columns = ?report.imputed, "imputed missing values");
    }
    Ok(())
}

fn impute_mode(
    records: &mut [RawRecord],
    column: &str,
    field: fn(&mut RawRecord) -> &mut Option<String>,
) -> Result<usize> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut missing = 0usize;
    for record in records.iter_mut() {
        match field(record) {
            Some(value) => *counts.entry(value.clone()).or_insert(0) += 1,
            None => missing += 1,
        }
    }
    if missing == 0 {
        return Ok(0);
    }

    let fill = most_frequent(&counts)
        .ok_or_else(|| Error::Dataset(format!("column {column} has no values to impute from")))?
        .to_string();
    for record in records.iter_mut() {
        let slot = field(record);
        if slot.is_none() {
            *slot = Some(fill.clone());
        }
    }
    Ok(missing)
}

fn impute_median<T: Copy>(
    records: &mut [RawRecord],
    column: &str,
    field: fn(&mut RawRecord) -> &mut Option<T>,
    to_f64: fn(T) -> f64,
    from_f64: fn(f64) -> T,
) -> Result<usize> {
    let mut values = Vec::with_capacity(records.len());
    let mut missing = 0usize;
    for record in records.iter_mut() {
        match *field(record) {
            Some(value) => values.push(to_f64(value)),
            None => missing += 1,
        }
    }
    if missing == 0 {
        return Ok(0);
    }

    let fill = median(&mut values)
        .map(from_f64)
        .ok_or_else(|| Error::Dataset(format!("column {column} has no values to impute from")))?;
    for record in records.iter_mut() {
        let slot = field(record);
        if slot.is_none() {
            *slot = Some(fill);
        }
    }
    Ok(missing)
}

/// Most frequent key; ties go to the smallest key.
pub(crate) fn most_frequent<K: Ord>(counts: &BTreeMap<K, usize>) -> Option<&K> {
    let mut best: Option<(&K, usize)> = None;
    for (key, &count) in counts {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((key, count)),
        }
    }
    best.map(|(key, _)| key)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Quantile of sorted data with linear interpolation between ranks.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// `(Q1 - k*IQR, Q3 + k*IQR)`, or `None` for an empty column.
pub fn iqr_bounds(values: &[f64], multiplier: f64) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    Some((q1 - multiplier * iqr, q3 + multiplier * iqr))
}

fn into_cleaned(raw: RawRecord) -> Option<CleanedRecord> {
    Some(CleanedRecord {
        patient_id: raw.patient_id?,
        appointment_id: raw.appointment_id?,
        gender: Gender::parse(raw.gender.as_deref()?)?,
        scheduled_day: parse_timestamp(raw.scheduled_day.as_deref()?)?,
        appointment_day: parse_timestamp(raw.appointment_day.as_deref()?)?,
        age: raw.age?,
        neighbourhood: raw.neighbourhood?,
        scholarship: raw.scholarship?,
        hipertension: raw.hipertension?,
        diabetes: raw.diabetes?,
        alcoholism: raw.alcoholism?,
        handcap: raw.handcap?,
        sms_received: raw.sms_received?,
        outcome: Outcome::parse(raw.no_show.as_deref()?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::UnavailableStore;
    use crate::db::MemoryStore;

    fn raw(id: i64, age: Option<i64>, neighbourhood: Option<&str>) -> RawRecord {
        RawRecord {
            patient_id: Some(1000.0 + id as f64),
            appointment_id: Some(id),
            gender: Some(if id % 2 == 0 { "F" } else { "M" }.to_string()),
            scheduled_day: Some("2016-04-25T08:00:00Z".to_string()),
            appointment_day: Some("2016-04-29T00:00:00Z".to_string()),
            age,
            neighbourhood: neighbourhood.map(str::to_string),
            scholarship: Some(0),
            hipertension: Some(0),
            diabetes: Some(0),
            alcoholism: Some(0),
            handcap: Some(0),
            sms_received: Some(1),
            no_show: Some(if id % 3 == 0 { "Yes" } else { "No" }.to_string()),
        }
    }

    fn cleaner(policy: AgeFilterPolicy) -> Cleaner {
        Cleaner::new(CleaningConfig {
            age_filter: policy,
            ..CleaningConfig::default()
        })
    }

    #[test]
    fn drops_exact_duplicates_only() {
        let first = raw(1, Some(30), Some("CENTRO"));
        let near = raw(2, Some(30), Some("CENTRO"));
        let records = vec![first.clone(), first, near];

        let outcome = cleaner(AgeFilterPolicy::HardBoundsOnly).clean(records).unwrap();
        assert_eq!(outcome.report.duplicates, 1);
        assert_eq!(outcome.records.len(), 2);
    }

    #[test]
    fn imputes_median_and_mode() {
        let records = vec![
            raw(1, Some(10), Some("CENTRO")),
            raw(2, Some(20), Some("CENTRO")),
            raw(3, Some(31), Some("PRAIA")),
            raw(4, Some(40), None),
            raw(5, None, Some("PRAIA")),
        ];

        let outcome = cleaner(AgeFilterPolicy::HardBoundsOnly).clean(records).unwrap();
        let imputed = outcome.records.iter().find(|r| r.appointment_id == 5).unwrap();
        // median of 10, 20, 31, 40 is 25.5, rounded for an integer column
        assert_eq!(imputed.age, 26);
        let filled = outcome.records.iter().find(|r| r.appointment_id == 4).unwrap();
        // CENTRO and PRAIA tie; the smaller value wins
        assert_eq!(filled.neighbourhood, "CENTRO");
        assert_eq!(outcome.report.imputed.get("Age"), Some(&1));
        assert_eq!(outcome.report.imputed.get("Neighbourhood"), Some(&1));
    }

    #[test]
    fn column_without_values_cannot_be_imputed() {
        let records = vec![raw(1, None, Some("CENTRO")), raw(2, None, Some("CENTRO"))];
        let err = cleaner(AgeFilterPolicy::HardBoundsOnly).clean(records).unwrap_err();
        assert!(err.to_string().contains("Age"));
    }

    #[test]
    fn ages_respect_hard_and_iqr_bounds() {
        let mut records: Vec<RawRecord> = (0..40)
            .map(|i| raw(i, Some(20 + (i % 20)), Some("CENTRO")))
            .collect();
        records.push(raw(100, Some(-1), Some("CENTRO")));
        records.push(raw(101, Some(150), Some("CENTRO")));
        records.push(raw(102, Some(115), Some("CENTRO")));

        let outcome = cleaner(AgeFilterPolicy::default()).clean(records).unwrap();
        let (lower, upper) = outcome.report.age_bounds.unwrap();
        assert_eq!(outcome.report.out_of_range, 2);
        assert_eq!(outcome.report.iqr_outliers, 1);
        for record in &outcome.records {
            assert!((0..=120).contains(&record.age));
            let age = record.age as f64;
            assert!(age >= lower && age <= upper);
        }
    }

    #[test]
    fn hard_bounds_only_keeps_elderly_patients() {
        let mut records: Vec<RawRecord> = (0..40)
            .map(|i| raw(i, Some(20 + (i % 20)), Some("CENTRO")))
            .collect();
        records.push(raw(102, Some(115), Some("CENTRO")));

        let outcome = cleaner(AgeFilterPolicy::HardBoundsOnly).clean(records).unwrap();
        assert!(outcome.records.iter().any(|r| r.age == 115));
        assert_eq!(outcome.report.age_bounds, None);
    }

    #[test]
    fn unreadable_rows_are_dropped() {
        let mut bad_gender = raw(1, Some(30), Some("CENTRO"));
        bad_gender.gender = Some("X".to_string());
        let mut bad_date = raw(2, Some(30), Some("CENTRO"));
        bad_date.appointment_day = Some("someday".to_string());
        let records = vec![bad_gender, bad_date, raw(3, Some(30), Some("CENTRO"))];

        let outcome = cleaner(AgeFilterPolicy::HardBoundsOnly).clean(records).unwrap();
        assert_eq!(outcome.report.untyped, 2);
        assert_eq!(outcome.records.len(), 1);
    }

    #[test]
    fn iqr_bounds_use_interpolated_quartiles() {
        let (lower, upper) = iqr_bounds(&[1.0, 2.0, 3.0, 4.0], 1.5).unwrap();
        // q1 = 1.75, q3 = 3.25, iqr = 1.5
        assert!((lower - -0.5).abs() < 1e-12);
        assert!((upper - 5.5).abs() < 1e-12);
        assert_eq!(iqr_bounds(&[], 1.5), None);
    }

    #[tokio::test]
    async fn persist_overwrites_and_tolerates_failures() {
        let records = vec![raw(1, Some(30), Some("CENTRO")), raw(2, Some(40), Some("PRAIA"))];
        let cleaner = cleaner(AgeFilterPolicy::HardBoundsOnly);
        let outcome = cleaner.clean(records).unwrap();

        let store = MemoryStore::new();
        cleaner.persist(&store, &outcome.records, 1).await;
        cleaner.persist(&store, &outcome.records, 1).await;
        assert_eq!(store.count(collections::CLEANED_DATA), 2);

        cleaner.persist(&UnavailableStore, &outcome.records, 1).await;
    }
}
