//! Entity-graph analysis of article corpora: entity-based document similarity,
//! community detection over projected graphs, and per-community statistics.

pub mod breakdown;
pub mod clustering;
pub mod community;
pub mod compute;
pub mod db;
pub mod error;
pub mod loader;
pub mod parser;
pub mod projection;
pub mod settings;
pub mod similarity;

pub use error::{AnalysisError, ComputeError, Result};
