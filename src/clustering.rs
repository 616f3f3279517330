//! Community detection over a file selection
//!
//! Cluster keys name one (selection, mode, metric) combination. A key that already
//! has labels in storage is never recomputed; within a session, results are also
//! cached in memory until the selection or mode changes.
//!
//! Per key: uncached -> computing (project, Leiden, release) -> persisting -> cached.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};
use serde::Serialize;

use crate::compute::{GraphCompute, LeidenConfig};
use crate::db::{CommunityAssignment, Database};
use crate::error::{AnalysisError, Result};
use crate::projection::{AnalysisMode, ClusterKey, GraphProjectionBuilder};

/// Caller-owned context carried between clustering requests
#[derive(Debug, Default)]
pub struct AnalysisSession {
    last_selection: BTreeSet<String>,
    last_mode: Option<AnalysisMode>,
    cached: HashMap<ClusterKey, Vec<CommunityAssignment>>,
}

impl AnalysisSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        self.cached.clear();
    }

    /// Drop cached results when the selection or mode changed since the last request.
    /// Returns true when the cache was invalidated.
    pub fn refresh(&mut self, selections: &BTreeSet<String>, mode: AnalysisMode) -> bool {
        let selection_changed = self.last_selection.symmetric_difference(selections).next().is_some();
        let mode_changed = self.last_mode.map_or(false, |m| m != mode);

        self.last_selection = selections.clone();
        self.last_mode = Some(mode);

        if selection_changed || mode_changed {
            self.invalidate();
            true
        } else {
            false
        }
    }

    pub fn cached(&self, key: &ClusterKey) -> Option<&Vec<CommunityAssignment>> {
        self.cached.get(key)
    }
}

/// Result of a clustering request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringOutcome {
    pub key: ClusterKey,
    pub assignments: Vec<CommunityAssignment>,
    pub communities: usize,
    /// False when served from the session cache or stored labels
    pub recomputed: bool,
}

impl ClusteringOutcome {
    fn new(key: ClusterKey, assignments: Vec<CommunityAssignment>, recomputed: bool) -> Self {
        let communities = assignments
            .iter()
            .map(|a| a.community_id)
            .collect::<BTreeSet<_>>()
            .len();
        Self { key, assignments, communities, recomputed }
    }
}

pub struct ClusteringOrchestrator<'a> {
    db: &'a Database,
    compute: &'a dyn GraphCompute,
    config: LeidenConfig,
}

impl<'a> ClusteringOrchestrator<'a> {
    pub fn new(db: &'a Database, compute: &'a dyn GraphCompute, config: LeidenConfig) -> Self {
        Self { db, compute, config }
    }

    /// True iff no node of the mode's kind carries a label under `key`
    pub fn is_clustering_needed(&self, key: &ClusterKey, mode: AnalysisMode) -> Result<bool> {
        Ok(!self.db.has_community_labels(key.as_str(), mode.node_kind())?)
    }

    pub fn community_nodes(&self, key: &ClusterKey, mode: AnalysisMode) -> Result<Vec<CommunityAssignment>> {
        self.db.community_nodes(key.as_str(), mode.node_kind())
    }

    pub fn run(
        &self,
        session: &mut AnalysisSession,
        selections: &[String],
        mode: AnalysisMode,
    ) -> Result<ClusteringOutcome> {
        let selection: BTreeSet<String> = selections.iter().cloned().collect();
        if selection.is_empty() {
            return Err(AnalysisError::config("No files selected for clustering"));
        }
        let files: Vec<String> = selection.iter().cloned().collect();

        if session.refresh(&selection, mode) {
            debug!("[Clustering] Selection or mode changed, session cache cleared");
        }

        let key = ClusterKey::derive(&files, mode);
        if let Some(assignments) = session.cached(&key) {
            debug!("[Clustering] Session cache hit for {}", key);
            return Ok(ClusteringOutcome::new(key, assignments.clone(), false));
        }

        if !self.is_clustering_needed(&key, mode)? {
            let assignments = self.community_nodes(&key, mode)?;
            info!("[Clustering] {} already clustered ({} nodes), skipping", key, assignments.len());
            session.cached.insert(key.clone(), assignments.clone());
            return Ok(ClusteringOutcome::new(key, assignments, false));
        }

        info!("[Clustering] Clustering {} file(s) in {} mode as {}", files.len(), mode, key);
        let assignments = self.compute_communities(&files, &key, mode)?;

        self.db.write_community_labels(key.as_str(), mode.node_kind(), &assignments)?;
        let outcome = ClusteringOutcome::new(key, assignments, true);
        let run = self.db.record_clustering_run(
            outcome.key.as_str(),
            mode.node_kind(),
            &files,
            outcome.communities,
            outcome.assignments.len(),
        )?;
        info!(
            "[Clustering] Run {}: {} communities over {} nodes",
            run.id, outcome.communities, outcome.assignments.len()
        );

        session.cached.insert(outcome.key.clone(), outcome.assignments.clone());
        Ok(outcome)
    }

    /// Project, stream Leiden, release. The projection is released on failure too.
    fn compute_communities(
        &self,
        files: &[String],
        key: &ClusterKey,
        mode: AnalysisMode,
    ) -> Result<Vec<CommunityAssignment>> {
        let builder = GraphProjectionBuilder::new(self.db, self.compute);
        let handle = builder.create_projection(files, key.as_str(), mode)?;

        let streamed = self.compute.leiden_stream(&handle, &self.config);
        builder.delete_projection(&handle.name);

        let mut assignments: Vec<CommunityAssignment> = streamed?
            .into_iter()
            .map(|(node, community)| CommunityAssignment { node_id: node as i64, community_id: community })
            .collect();
        assignments.sort();
        Ok(assignments)
    }
}
