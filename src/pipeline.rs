//! Training pipeline lifecycle: the stage sequence, the persisted status
//! document and the once-per-process background start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cleaner::Cleaner;
use crate::config::Config;
use crate::db::{collections, DocumentStore};
use crate::error::{Error, Result};
use crate::features::FeatureEngineer;
use crate::loader;
use crate::models::{PipelineState, PipelineStatus, TrainingRun};
use crate::predictor::Predictor;
use crate::registry::ArtifactRegistry;
use crate::selection::ModelSelector;

pub const STATUS_KEY: &str = "current_status";

/// Snapshot name prefix for saved artifacts.
pub const ARTIFACT_NAME: &str = "model";

/// Reads and writes the singleton status document.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn DocumentStore>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// The stored status, or UNKNOWN when it is missing or unreadable.
    pub async fn read(&self) -> PipelineStatus {
        match self.store.get(collections::PIPELINE_STATUS, STATUS_KEY).await {
            Ok(Some(doc)) => serde_json::from_value(doc).unwrap_or_else(|e| {
                warn!(error = %e, "unreadable pipeline status");
                PipelineStatus::unknown()
            }),
            Ok(None) => PipelineStatus::unknown(),
            Err(e) => {
                warn!(error = %e, "failed to read pipeline status");
                PipelineStatus::unknown()
            }
        }
    }

    pub async fn write(&self, status: &PipelineStatus) {
        let doc = match serde_json::to_value(status) {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "failed to serialize pipeline status");
                return;
            }
        };
        if let Err(e) = self.store.put(collections::PIPELINE_STATUS, STATUS_KEY, doc).await {
            error!(error = %e, status = ?status.status, "failed to write pipeline status");
        }
    }
}

/// Runs `f` on the blocking pool and tags any failure with `stage`.
async fn blocking<T, F>(stage: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| e.in_stage(stage)),
        Err(e) => Err(Error::fit(format!("worker task failed: {e}")).in_stage(stage)),
    }
}

/// Sequences load, clean, engineer, select and save.
pub struct Orchestrator {
    config: Config,
    store: Arc<dyn DocumentStore>,
    status: StatusTracker,
}

impl Orchestrator {
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        let status = StatusTracker::new(Arc::clone(&store));
        Self {
            config,
            store,
            status,
        }
    }

    /// One full run. The status document moves to RUNNING first and ends as
    /// COMPLETED or FAILED with the error message.
    pub async fn run(&self) -> Result<TrainingRun> {
        let started = PipelineStatus::running(Utc::now());
        self.status.write(&started).await;
        info!("pipeline started");

        match self.execute().await {
            Ok(run) => {
                self.status.write(&started.completed(Utc::now())).await;
                info!(best = %run.best_model, run_id = %run.run_id, "pipeline completed");
                Ok(run)
            }
            Err(e) => {
                error!(error = %e, "pipeline failed");
                self.status.write(&started.failed(Utc::now(), e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn execute(&self) -> Result<TrainingRun> {
        let store = self.store.as_ref();
        let run_id = Uuid::new_v4();

        let path = self.config.dataset_path.clone();
        let raw = blocking("load", move || loader::load(&path)).await?;

        let cleaner = Cleaner::new(self.config.cleaning.clone());
        let (cleaner, cleaned) = blocking("clean", move || {
            let outcome = cleaner.clean(raw)?;
            Ok((cleaner, outcome))
        })
        .await?;
        info!(report = ?cleaned.report, "cleaning finished");
        cleaner
            .persist(store, &cleaned.records, self.config.features.persist_batch_size)
            .await;

        let mut engineer = FeatureEngineer::new(self.config.features.clone());
        let records = cleaned.records;
        let (engineer, dataset) = blocking("features", move || {
            let dataset = engineer.fit_transform(&records, run_id)?;
            Ok((engineer, dataset))
        })
        .await?;
        engineer.persist(store, &dataset).await;

        let transforms = engineer
            .transforms()
            .cloned()
            .ok_or_else(|| Error::fit("feature engineering produced no transforms").in_stage("features"))?;
        let selector = ModelSelector::new(self.config.training.clone());
        let (selector, bundle, run) = blocking("train", move || {
            let (bundle, run) = selector.select(&dataset, transforms)?;
            Ok((selector, bundle, run))
        })
        .await?;
        selector.persist(store, &run).await;

        let registry = ArtifactRegistry::new(self.config.artifact_dir.clone());
        blocking("save", move || registry.save(&bundle, ARTIFACT_NAME)).await?;

        Ok(run)
    }
}

/// Starts the pipeline in the background at most once per process and
/// refreshes the predictor when a run completes.
pub struct PipelineSupervisor {
    orchestrator: Arc<Orchestrator>,
    predictor: Arc<Predictor>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<PipelineState>>>,
}

impl PipelineSupervisor {
    pub fn new(orchestrator: Arc<Orchestrator>, predictor: Arc<Predictor>) -> Self {
        Self {
            orchestrator,
            predictor,
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the run on the first call only; later calls return `false`.
    /// Must be called from within a tokio runtime.
    pub fn start_once(&self) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("pipeline already started in this process");
            return false;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let predictor = Arc::clone(&self.predictor);
        let handle = tokio::spawn(async move {
            match orchestrator.run().await {
                Ok(_) => {
                    let ready = task::spawn_blocking(move || predictor.refresh())
                        .await
                        .unwrap_or(false);
                    if !ready {
                        warn!("pipeline completed but the predictor could not load artifacts");
                    }
                    PipelineState::Completed
                }
                Err(_) => PipelineState::Failed,
            }
        });
        *self.handle.lock() = Some(handle);
        info!("background pipeline spawned");
        true
    }

    /// Waits for the spawned run. `None` if nothing was started or the
    /// run was already awaited.
    pub async fn wait(&self) -> Option<PipelineState> {
        let handle = self.handle.lock().take()?;
        match handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                error!(error = %e, "pipeline task aborted");
                Some(PipelineState::Failed)
            }
        }
    }
}
