//! Graph projections over a file selection
//!
//! Article mode projects stored similarity edges weighted by one metric; entity
//! mode projects co-occurrence edges summed over the selected files.

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::compute::{GraphCompute, NodeId, ProjectedNode, ProjectionHandle, ProjectionSpec};
use crate::db::{Database, NodeKind};
use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Jaccard,
}

impl DistanceMetric {
    /// Column of the `similarity` table holding this metric
    pub fn column(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosinus",
            DistanceMetric::Jaccard => "jaccard",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Jaccard => "jaccard",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cosine" | "cosinus" => Ok(DistanceMetric::Cosine),
            "jaccard" => Ok(DistanceMetric::Jaccard),
            other => Err(AnalysisError::config(format!("Unknown distance metric: {}", other))),
        }
    }
}

/// What gets clustered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AnalysisMode {
    Articles { metric: DistanceMetric },
    Entities,
}

impl AnalysisMode {
    /// Article mode needs a metric; entity mode ignores one.
    pub fn parse(mode: &str, metric: Option<&str>) -> Result<Self> {
        match mode.trim().to_lowercase().as_str() {
            "articles" | "article" => {
                let metric = metric.ok_or_else(|| {
                    AnalysisError::config("A distance metric is required for article clustering")
                })?;
                Ok(AnalysisMode::Articles { metric: DistanceMetric::parse(metric)? })
            }
            "entities" | "entity" => Ok(AnalysisMode::Entities),
            other => Err(AnalysisError::config(format!("Unknown analysis mode: {}", other))),
        }
    }

    pub fn node_kind(&self) -> NodeKind {
        match self {
            AnalysisMode::Articles { .. } => NodeKind::Article,
            AnalysisMode::Entities => NodeKind::Entity,
        }
    }

    pub fn metric(&self) -> Option<DistanceMetric> {
        match self {
            AnalysisMode::Articles { metric } => Some(*metric),
            AnalysisMode::Entities => None,
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisMode::Articles { metric } => write!(f, "articles/{}", metric.as_str()),
            AnalysisMode::Entities => write!(f, "entities"),
        }
    }
}

/// Deterministic name for one (selection, mode, metric) clustering.
/// Doubles as projection name and label key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClusterKey(String);

impl ClusterKey {
    pub fn derive(selections: &[String], mode: AnalysisMode) -> Self {
        let files: BTreeSet<&str> = selections.iter().map(|s| s.as_str()).collect();

        let mut hasher = Sha256::new();
        for file in &files {
            hasher.update(file.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());

        let prefix = match mode {
            AnalysisMode::Articles { metric } => format!("cluster_articles_{}", metric.as_str()),
            AnalysisMode::Entities => "cluster_entities".to_string(),
        };
        ClusterKey(format!("{}_{}", prefix, &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a create attempt stands
#[derive(Debug, Clone, Copy)]
enum ProjectionAttempt {
    First,
    AfterDrop,
}

pub struct GraphProjectionBuilder<'a> {
    db: &'a Database,
    compute: &'a dyn GraphCompute,
}

impl<'a> GraphProjectionBuilder<'a> {
    pub fn new(db: &'a Database, compute: &'a dyn GraphCompute) -> Self {
        Self { db, compute }
    }

    /// Project the selection for clustering.
    ///
    /// A selection without nodes is a configuration error. A failed create is
    /// followed by one drop of `graph_name` and a second create; a second
    /// failure is returned to the caller.
    pub fn create_projection(
        &self,
        selections: &[String],
        graph_name: &str,
        mode: AnalysisMode,
    ) -> Result<ProjectionHandle> {
        let spec = self.clustering_spec(selections, mode)?;
        if spec.nodes.is_empty() {
            return Err(AnalysisError::config(format!(
                "No {} nodes in selection [{}]; are the files loaded?",
                mode.node_kind().as_str(),
                selections.join(", ")
            )));
        }
        self.project_with_retry(graph_name, spec)
    }

    /// Project only nodes labelled under `key`, each carrying its community
    pub fn create_modularity_projection(
        &self,
        selections: &[String],
        graph_name: &str,
        key: &ClusterKey,
        mode: AnalysisMode,
    ) -> Result<ProjectionHandle> {
        let labelled = match mode {
            AnalysisMode::Articles { .. } => self.db.labelled_article_nodes(selections, key.as_str())?,
            AnalysisMode::Entities => self.db.labelled_entity_nodes(selections, key.as_str())?,
        };
        let ids: BTreeSet<i64> = labelled.iter().map(|(id, _)| *id).collect();

        let nodes = labelled
            .iter()
            .map(|&(id, community)| ProjectedNode { id: id as NodeId, community: Some(community) })
            .collect();
        let edges = self
            .edges(selections, mode)?
            .into_iter()
            .filter(|(s, t, _)| ids.contains(&(*s as i64)) && ids.contains(&(*t as i64)))
            .collect();

        self.project_with_retry(graph_name, ProjectionSpec { nodes, edges })
    }

    /// Release a projection. Never fails; the outcome is only logged.
    pub fn delete_projection(&self, graph_name: &str) {
        match self.compute.drop_projection(graph_name) {
            Ok(true) => debug!("[Projection] Dropped '{}'", graph_name),
            Ok(false) => debug!("[Projection] '{}' was not held", graph_name),
            Err(e) => warn!("[Projection] Failed to drop '{}': {}", graph_name, e),
        }
    }

    fn clustering_spec(&self, selections: &[String], mode: AnalysisMode) -> Result<ProjectionSpec> {
        let ids = match mode {
            AnalysisMode::Articles { .. } => self.db.article_ids(selections)?,
            AnalysisMode::Entities => self.db.entity_ids(selections)?,
        };
        let nodes = ids
            .into_iter()
            .map(|id| ProjectedNode { id: id as NodeId, community: None })
            .collect();
        let edges = self.edges(selections, mode)?;
        Ok(ProjectionSpec { nodes, edges })
    }

    fn edges(&self, selections: &[String], mode: AnalysisMode) -> Result<Vec<(NodeId, NodeId, f64)>> {
        let raw = match mode {
            AnalysisMode::Articles { metric } => self.db.similarity_edges(selections, metric)?,
            AnalysisMode::Entities => self.db.appearance_edges(selections)?,
        };
        Ok(raw
            .into_iter()
            .map(|(s, t, w)| (s as NodeId, t as NodeId, w))
            .collect())
    }

    fn project_with_retry(&self, graph_name: &str, spec: ProjectionSpec) -> Result<ProjectionHandle> {
        let mut attempt = ProjectionAttempt::First;
        loop {
            match (self.compute.project(graph_name, spec.clone()), attempt) {
                (Ok(handle), _) => {
                    info!(
                        "[Projection] Created '{}' ({} nodes, {} edges)",
                        handle.name, handle.node_count, handle.edge_count
                    );
                    return Ok(handle);
                }
                (Err(e), ProjectionAttempt::First) => {
                    warn!("[Projection] Create '{}' failed ({}), dropping and retrying", graph_name, e);
                    self.delete_projection(graph_name);
                    attempt = ProjectionAttempt::AfterDrop;
                }
                (Err(e), ProjectionAttempt::AfterDrop) => return Err(e.into()),
            }
        }
    }
}
