//! Appointment no-show prediction: a batch training pipeline and an
//! inference service that share one persisted transform contract.

pub mod classifier;
pub mod cleaner;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod loader;
pub mod logging;
pub mod matrix;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod predictor;
pub mod registry;
pub mod report;
pub mod selection;
pub mod service;

pub use error::{Error, Result};
