use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("dataset not found at {}", .0.display())]
    DataNotFound(PathBuf),

    #[error("malformed dataset: {0}")]
    Dataset(String),

    #[error("unseen category '{0}'")]
    UnseenCategory(String),

    #[error("model not ready")]
    ModelNotReady,

    #[error("invalid input: {0}")]
    Validation(ValidationErrors),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("training error: {0}")]
    Fit(String),

    #[error("artifact registry error: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{stage} stage failed: {source}")]
    Pipeline {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn fit(message: impl Into<String>) -> Self {
        Error::Fit(message.into())
    }

    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            already @ Error::Pipeline { .. } => already,
            other => Error::Pipeline {
                stage,
                source: Box::new(other),
            },
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Dataset(err.to_string())
    }
}

/// A single rejected request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Field-level detail for a rejected prediction request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.field.as_str())
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_is_not_nested() {
        let err = Error::fit("empty input").in_stage("features").in_stage("pipeline");
        match err {
            Error::Pipeline { stage, .. } => assert_eq!(stage, "features"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn validation_errors_render_every_field() {
        let mut errors = ValidationErrors::default();
        errors.push("Age", "must be between 0 and 120");
        errors.push("Gender", "must be 'F' or 'M'");
        let message = Error::Validation(errors).to_string();
        assert!(message.contains("Age: must be between 0 and 120"));
        assert!(message.contains("Gender"));
    }
}
