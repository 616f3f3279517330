//! Error types shared across the analysis pipeline

use thiserror::Error;

/// Result type for analysis operations
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Failures reported by a graph-compute service.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputeError {
    /// A projection with this name is already held by the service
    #[error("Graph projection already exists: {0}")]
    GraphExists(String),

    #[error("Graph projection not found: {0}")]
    ProjectionNotFound(String),

    /// The algorithm itself failed (bad input graph, numeric failure, ...)
    #[error("Graph algorithm failed: {0}")]
    Algorithm(String),
}

/// Errors that can occur while loading, clustering or analysing the corpus
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Invalid mode/metric combination, empty selection, missing criteria
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Connection mutex poisoned by a panicking writer
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// NER backend failure
    #[error("Entity extraction failed: {0}")]
    Extraction(String),
}

impl AnalysisError {
    pub fn config(msg: impl Into<String>) -> Self {
        AnalysisError::Config(msg.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for AnalysisError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        AnalysisError::LockPoisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_error_is_transparent() {
        let err: AnalysisError = ComputeError::GraphExists("g".to_string()).into();
        assert_eq!(err.to_string(), "Graph projection already exists: g");
    }

    #[test]
    fn test_config_helper() {
        let err = AnalysisError::config("metric required");
        assert!(matches!(err, AnalysisError::Config(ref m) if m == "metric required"));
    }
}
