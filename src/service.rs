//! Request surface over the predictor and the persisted pipeline documents.
//!
//! Every operation resolves to a JSON body plus an HTTP-style status code so a
//! transport (the `serve` command reads JSON lines) stays a thin shell.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task;
use tracing::{info, warn};

use crate::db::{collections, DocumentStore};
use crate::error::{Error, ValidationErrors};
use crate::models::{PipelineStatus, TrainingRun};
use crate::pipeline::StatusTracker;
use crate::predictor::{PredictionOutcome, PredictionRequest, Predictor};

pub const DEFAULT_SAMPLE_LIMIT: usize = 10;
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("invalid request: {0}")]
    InvalidFields(ValidationErrors),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("Model not ready. Training may still be running or has failed.")]
    Unavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) | ServiceError::InvalidFields(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Unavailable => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            ServiceError::InvalidFields(errors) => json!({ "error": "validation failed", "fields": errors }),
            other => json!({ "error": other.to_string() }),
        }
    }
}

impl From<Error> for ServiceError {
    fn from(err: Error) -> Self {
        match err {
            Error::ModelNotReady => ServiceError::Unavailable,
            Error::Validation(errors) => ServiceError::InvalidFields(errors),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// History entry written for each successful prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLog {
    pub request: PredictionRequest,
    pub outcome: PredictionOutcome,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrixView {
    pub confusion_matrix: [[u64; 2]; 2],
    pub model: String,
}

/// One line of the `serve` protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceRequest {
    Predict { body: Value },
    TrainStatus,
    ModelMetrics,
    ConfusionMatrix,
    CleanedSample { limit: Option<usize> },
    PredictionHistory { limit: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: Value,
}

impl ServiceResponse {
    fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status: 200, body },
            Err(e) => Self::error(&ServiceError::Internal(e.to_string())),
        }
    }

    fn error(err: &ServiceError) -> Self {
        Self {
            status: err.status_code(),
            body: err.body(),
        }
    }

    fn from_result<T: Serialize>(result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(value) => Self::ok(&value),
            Err(e) => Self::error(&e),
        }
    }
}

pub struct PredictionService {
    predictor: Arc<Predictor>,
    store: Arc<dyn DocumentStore>,
    status: StatusTracker,
}

impl PredictionService {
    pub fn new(predictor: Arc<Predictor>, store: Arc<dyn DocumentStore>) -> Self {
        let status = StatusTracker::new(Arc::clone(&store));
        Self {
            predictor,
            store,
            status,
        }
    }

    pub fn predictor(&self) -> Arc<Predictor> {
        Arc::clone(&self.predictor)
    }

    /// Loads the current bundle on the blocking pool. Returns readiness.
    pub async fn warm_up(&self) -> bool {
        let predictor = Arc::clone(&self.predictor);
        match task::spawn_blocking(move || predictor.load()).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "model load task failed");
                false
            }
        }
    }

    pub async fn handle(&self, request: ServiceRequest) -> ServiceResponse {
        match request {
            ServiceRequest::Predict { body } => ServiceResponse::from_result(self.predict(body).await),
            ServiceRequest::TrainStatus => ServiceResponse::ok(&self.train_status().await),
            ServiceRequest::ModelMetrics => ServiceResponse::from_result(self.model_metrics().await),
            ServiceRequest::ConfusionMatrix => {
                ServiceResponse::from_result(self.confusion_matrix().await)
            }
            ServiceRequest::CleanedSample { limit } => {
                ServiceResponse::from_result(self.cleaned_sample(limit).await)
            }
            ServiceRequest::PredictionHistory { limit } => {
                ServiceResponse::from_result(self.prediction_history(limit).await)
            }
        }
    }

    /// Parses one line of the `serve` protocol and handles it.
    pub async fn handle_line(&self, line: &str) -> ServiceResponse {
        match serde_json::from_str::<ServiceRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => ServiceResponse::error(&ServiceError::BadRequest(e.to_string())),
        }
    }

    pub async fn predict(&self, body: Value) -> Result<PredictionOutcome, ServiceError> {
        let request: PredictionRequest =
            serde_json::from_value(body).map_err(|e| ServiceError::BadRequest(e.to_string()))?;

        let predictor = Arc::clone(&self.predictor);
        let scored = request.clone();
        let outcome = task::spawn_blocking(move || predictor.predict(&scored))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))??;

        let model = self
            .predictor
            .bundle()
            .map(|b| b.family.to_string())
            .unwrap_or_default();
        info!(
            model = %model,
            will_attend = outcome.will_attend,
            probability = outcome.probability,
            "prediction served"
        );
        self.log_prediction(PredictionLog {
            request,
            outcome: outcome.clone(),
            model,
            timestamp: Utc::now(),
        })
        .await;
        Ok(outcome)
    }

    async fn log_prediction(&self, entry: PredictionLog) {
        let doc = match serde_json::to_value(&entry) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "failed to serialize prediction log");
                return;
            }
        };
        if let Err(e) = self.store.insert_many(collections::PREDICTIONS, vec![doc]).await {
            warn!(error = %e, "failed to record prediction");
        }
    }

    pub async fn train_status(&self) -> PipelineStatus {
        self.status.read().await
    }

    pub async fn model_metrics(&self) -> Result<TrainingRun, ServiceError> {
        let docs = self
            .store
            .find(collections::MODEL_EVALUATION, Some(1))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let doc = docs
            .into_iter()
            .next()
            .ok_or(ServiceError::NotFound("No metrics found"))?;
        serde_json::from_value(doc).map_err(|e| ServiceError::Internal(e.to_string()))
    }

    pub async fn confusion_matrix(&self) -> Result<ConfusionMatrixView, ServiceError> {
        let run = match self.model_metrics().await {
            Err(ServiceError::NotFound(_)) => return Err(ServiceError::NotFound("No confusion matrix found")),
            other => other?,
        };
        let best = run
            .best()
            .ok_or(ServiceError::NotFound("No confusion matrix found"))?;
        Ok(ConfusionMatrixView {
            confusion_matrix: best.confusion_matrix,
            model: run.best_model.clone(),
        })
    }

    pub async fn cleaned_sample(&self, limit: Option<usize>) -> Result<Vec<Value>, ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_SAMPLE_LIMIT);
        self.store
            .find(collections::CLEANED_DATA, Some(limit))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    /// Most recent first.
    pub async fn prediction_history(&self, limit: Option<usize>) -> Result<Vec<PredictionLog>, ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let docs = self
            .store
            .find_recent(collections::PREDICTIONS, limit)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(|e| ServiceError::Internal(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::UnavailableStore;
    use crate::db::MemoryStore;
    use crate::registry::tests::trained_bundle;
    use crate::registry::ArtifactRegistry;
    use crate::selection::ModelSelector;

    fn body(age: i64) -> Value {
        json!({
            "ScheduledDay": "2016-04-29T10:15:00Z",
            "AppointmentDay": "2016-05-20T00:00:00Z",
            "Gender": "M",
            "Age": age,
            "Neighbourhood": "PRAIA",
            "Scholarship": 0,
            "Hipertension": 0,
            "Diabetes": 1,
            "Alcoholism": 0,
            "Handcap": 0,
            "SMS_received": 1
        })
    }

    fn service(dir: &std::path::Path, store: Arc<dyn DocumentStore>) -> PredictionService {
        let predictor = Arc::new(Predictor::new(ArtifactRegistry::new(dir)));
        PredictionService::new(predictor, store)
    }

    fn ready_service(store: Arc<dyn DocumentStore>) -> (tempfile::TempDir, PredictionService) {
        let dir = tempfile::tempdir().unwrap();
        ArtifactRegistry::new(dir.path())
            .save(&trained_bundle(), "model")
            .unwrap();
        let svc = service(dir.path(), store);
        (dir, svc)
    }

    #[tokio::test]
    async fn not_ready_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), Arc::new(MemoryStore::new()));
        let response = svc.handle(ServiceRequest::Predict { body: body(40) }).await;
        assert_eq!(response.status, 503);
        assert!(response.body["error"].as_str().unwrap().contains("not ready"));
    }

    #[tokio::test]
    async fn invalid_fields_are_400_with_detail() {
        let (_dir, svc) = ready_service(Arc::new(MemoryStore::new()));
        let mut bad = body(40);
        bad["Gender"] = json!("Q");
        bad["Handcap"] = json!(9);

        let response = svc.handle(ServiceRequest::Predict { body: bad }).await;
        assert_eq!(response.status, 400);
        let fields: Vec<&str> = response.body["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, ["Gender", "Handcap"]);

        let response = svc.handle(ServiceRequest::Predict { body: json!({"Age": "old"}) }).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn predictions_are_logged_newest_first() {
        let memory = Arc::new(MemoryStore::new());
        let (_dir, svc) = ready_service(memory.clone());

        for age in [30, 60] {
            let response = svc.handle(ServiceRequest::Predict { body: body(age) }).await;
            assert_eq!(response.status, 200);
            assert!(response.body["willAttend"].is_boolean());
        }
        assert_eq!(memory.count(collections::PREDICTIONS), 2);

        let history = svc.prediction_history(Some(5)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].request.age, Some(60));
        assert!(!history[0].model.is_empty());
    }

    #[tokio::test]
    async fn logging_failures_do_not_fail_predictions() {
        let (_dir, svc) = ready_service(Arc::new(UnavailableStore));
        assert!(svc.predict(body(45)).await.is_ok());
    }

    #[tokio::test]
    async fn metrics_and_matrix_are_404_until_trained() {
        let memory = Arc::new(MemoryStore::new());
        let (_dir, svc) = ready_service(memory.clone());
        assert_eq!(svc.handle(ServiceRequest::ModelMetrics).await.status, 404);
        assert_eq!(svc.handle(ServiceRequest::ConfusionMatrix).await.status, 404);

        let mut engineer = crate::features::FeatureEngineer::new(Default::default());
        let dataset = engineer
            .fit_transform(&crate::features::tests::sample_records(), uuid::Uuid::new_v4())
            .unwrap();
        let selector = ModelSelector::new(crate::config::TrainingConfig::quick());
        let (_, run) = selector
            .select(&dataset, engineer.transforms().unwrap().clone())
            .unwrap();
        selector.persist(memory.as_ref(), &run).await;

        let metrics = svc.model_metrics().await.unwrap();
        assert_eq!(metrics.best_model, run.best_model);
        let matrix = svc.confusion_matrix().await.unwrap();
        assert_eq!(matrix.model, run.best_model);
        assert_eq!(matrix.confusion_matrix, run.best().unwrap().confusion_matrix);
    }

    #[tokio::test]
    async fn cleaned_sample_defaults_to_ten() {
        let memory = Arc::new(MemoryStore::new());
        let docs: Vec<Value> = (0..25).map(|i| json!({ "AppointmentID": i })).collect();
        memory.insert_many(collections::CLEANED_DATA, docs).await.unwrap();
        let (_dir, svc) = ready_service(memory);

        let sample = svc.cleaned_sample(None).await.unwrap();
        assert_eq!(sample.len(), 10);
        assert_eq!(sample[0]["AppointmentID"], 0);
        assert_eq!(svc.cleaned_sample(Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn warm_up_loads_saved_artifacts() {
        let empty = tempfile::tempdir().unwrap();
        let cold = service(empty.path(), Arc::new(MemoryStore::new()));
        assert!(!cold.warm_up().await);
        assert!(!cold.predictor().ready());

        let (_dir, svc) = ready_service(Arc::new(MemoryStore::new()));
        assert!(svc.warm_up().await);
        assert!(svc.predictor().ready());
    }

    #[tokio::test]
    async fn history_defaults_to_last_ten() {
        let (_dir, svc) = ready_service(Arc::new(MemoryStore::new()));
        for age in 20..32 {
            svc.predict(body(age)).await.unwrap();
        }

        let history = svc.prediction_history(None).await.unwrap();
        assert_eq!(history.len(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(DEFAULT_HISTORY_LIMIT, 10);
        assert_eq!(history[0].request.age, Some(31));
        assert_eq!(history[9].request.age, Some(22));
    }

    #[tokio::test]
    async fn status_and_protocol_lines() {
        let (_dir, svc) = ready_service(Arc::new(MemoryStore::new()));
        let response = svc.handle_line(r#"{"op":"train_status"}"#).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], "UNKNOWN");

        let response = svc.handle_line("not json").await;
        assert_eq!(response.status, 400);
        let response = svc
            .handle_line(r#"{"op":"cleaned_sample","limit":2}"#)
            .await;
        assert_eq!(response.status, 200);
    }
}
