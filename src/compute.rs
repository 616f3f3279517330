//! Graph-compute service seam
//!
//! Named, weighted, undirected projections live inside a compute service for the
//! duration of one clustering or modularity computation. `InMemoryGraphEngine` is
//! the default service: it keeps projections in process and runs Leiden through
//! the `graphrs` crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;

/// Stable node identifier (article or entity row id)
pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedNode {
    pub id: NodeId,
    /// Existing community label, carried by modularity projections
    pub community: Option<i64>,
}

/// Nodes plus weighted undirected edges to project
#[derive(Debug, Clone, Default)]
pub struct ProjectionSpec {
    pub nodes: Vec<ProjectedNode>,
    pub edges: Vec<(NodeId, NodeId, f64)>,
}

/// A projection held by the compute service; release with `drop_projection`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionHandle {
    pub name: String,
    pub node_count: usize,
    pub edge_count: usize,
}

/// Quality function used by the Leiden algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityFunctionType {
    Modularity,
    /// Constant Potts Model
    CPM,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeidenConfig {
    pub quality_function: QualityFunctionType,
    /// Larger values produce smaller communities
    pub resolution: f64,
    /// Randomness in refinement
    pub theta: f64,
    pub gamma: f64,
    pub weighted: bool,
}

impl Default for LeidenConfig {
    fn default() -> Self {
        Self {
            quality_function: QualityFunctionType::CPM,
            resolution: 0.25,
            theta: 0.3,
            gamma: 0.05,
            weighted: true,
        }
    }
}

pub trait GraphCompute {
    /// Fails with `GraphExists` when `name` is already projected
    fn project(&self, name: &str, spec: ProjectionSpec) -> Result<ProjectionHandle, ComputeError>;

    /// Ok(false) when nothing was held under `name`
    fn drop_projection(&self, name: &str) -> Result<bool, ComputeError>;

    /// (node, community) for every projected node
    fn leiden_stream(
        &self,
        handle: &ProjectionHandle,
        config: &LeidenConfig,
    ) -> Result<Vec<(NodeId, i64)>, ComputeError>;

    /// (community, modularity contribution) using the communities carried by the nodes
    fn modularity_stream(&self, handle: &ProjectionHandle) -> Result<Vec<(i64, f64)>, ComputeError>;
}

#[derive(Debug, Clone)]
struct StoredProjection {
    nodes: Vec<ProjectedNode>,
    edges: Vec<(NodeId, NodeId, f64)>,
}

/// In-process compute service
#[derive(Default)]
pub struct InMemoryGraphEngine {
    projections: Mutex<HashMap<String, StoredProjection>>,
}

impl InMemoryGraphEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .projections
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn stored(&self, name: &str) -> Result<StoredProjection, ComputeError> {
        let projections = self
            .projections
            .lock()
            .map_err(|_| ComputeError::Algorithm("projection registry poisoned".to_string()))?;
        projections
            .get(name)
            .cloned()
            .ok_or_else(|| ComputeError::ProjectionNotFound(name.to_string()))
    }
}

impl GraphCompute for InMemoryGraphEngine {
    fn project(&self, name: &str, spec: ProjectionSpec) -> Result<ProjectionHandle, ComputeError> {
        let mut projections = self
            .projections
            .lock()
            .map_err(|_| ComputeError::Algorithm("projection registry poisoned".to_string()))?;
        if projections.contains_key(name) {
            return Err(ComputeError::GraphExists(name.to_string()));
        }

        // Undirected: keep one edge per unordered pair, drop self-loops
        let mut seen: HashSet<(NodeId, NodeId)> = HashSet::new();
        let mut edges = Vec::with_capacity(spec.edges.len());
        for (s, t, w) in spec.edges {
            if s == t {
                continue;
            }
            let pair = if s < t { (s, t) } else { (t, s) };
            if seen.insert(pair) {
                edges.push((pair.0, pair.1, w));
            }
        }

        let handle = ProjectionHandle {
            name: name.to_string(),
            node_count: spec.nodes.len(),
            edge_count: edges.len(),
        };
        projections.insert(name.to_string(), StoredProjection { nodes: spec.nodes, edges });
        debug!(
            "[Compute] Projected '{}' ({} nodes, {} edges)",
            name, handle.node_count, handle.edge_count
        );
        Ok(handle)
    }

    fn drop_projection(&self, name: &str) -> Result<bool, ComputeError> {
        let mut projections = self
            .projections
            .lock()
            .map_err(|_| ComputeError::Algorithm("projection registry poisoned".to_string()))?;
        Ok(projections.remove(name).is_some())
    }

    fn leiden_stream(
        &self,
        handle: &ProjectionHandle,
        config: &LeidenConfig,
    ) -> Result<Vec<(NodeId, i64)>, ComputeError> {
        let projection = self.stored(&handle.name)?;
        let groups = detect_communities(&projection.edges, config)?;

        let mut assignments: BTreeMap<NodeId, i64> = BTreeMap::new();
        let mut next_id = 0i64;
        for members in groups {
            for node in members {
                assignments.insert(node, next_id);
            }
            next_id += 1;
        }

        // Nodes without edges form their own communities
        let mut isolated: Vec<NodeId> = projection
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !assignments.contains_key(id))
            .collect();
        isolated.sort_unstable();
        isolated.dedup();
        for node in isolated {
            assignments.insert(node, next_id);
            next_id += 1;
        }

        Ok(assignments.into_iter().collect())
    }

    fn modularity_stream(&self, handle: &ProjectionHandle) -> Result<Vec<(i64, f64)>, ComputeError> {
        let projection = self.stored(&handle.name)?;

        let mut community_of: HashMap<NodeId, i64> = HashMap::new();
        for node in &projection.nodes {
            let community = node.community.ok_or_else(|| {
                ComputeError::Algorithm(format!("node {} carries no community", node.id))
            })?;
            community_of.insert(node.id, community);
        }

        Ok(community_modularity(&community_of, &projection.edges).into_iter().collect())
    }
}

/// Leiden through graphrs; communities sorted by their smallest member
fn detect_communities(
    edges: &[(NodeId, NodeId, f64)],
    config: &LeidenConfig,
) -> Result<Vec<Vec<NodeId>>, ComputeError> {
    use graphrs::algorithms::community::leiden::{leiden, QualityFunction};
    use graphrs::{Edge as GEdge, EdgeDedupeStrategy, Graph, GraphSpecs};

    if edges.is_empty() {
        return Ok(Vec::new());
    }

    let graph_edges: Vec<_> = edges
        .iter()
        .map(|(s, t, w)| GEdge::with_weight(*s, *t, *w))
        .collect();

    let mut specs = GraphSpecs::undirected_create_missing();
    specs.edge_dedupe_strategy = EdgeDedupeStrategy::KeepLast;

    let graph = Graph::<u64, ()>::new_from_nodes_and_edges(vec![], graph_edges, specs)
        .map_err(|e| ComputeError::Algorithm(format!("failed to build graph: {}", e.message)))?;

    let quality = match config.quality_function {
        QualityFunctionType::Modularity => QualityFunction::Modularity,
        QualityFunctionType::CPM => QualityFunction::CPM,
    };

    let raw: Vec<HashSet<u64>> = leiden(
        &graph,
        config.weighted,
        quality,
        Some(config.resolution),
        Some(config.theta),
        Some(config.gamma),
    )
    .map_err(|e| ComputeError::Algorithm(format!("leiden failed: {}", e.message)))?;

    let mut communities: Vec<Vec<NodeId>> = raw
        .into_iter()
        .filter(|members| !members.is_empty())
        .map(|members| {
            let mut v: Vec<NodeId> = members.into_iter().collect();
            v.sort_unstable();
            v
        })
        .collect();
    communities.sort_by_key(|members| members[0]);
    Ok(communities)
}

/// Per-community share of Newman modularity: `L_c/m - (d_c/2m)^2`,
/// where `L_c` is the internal edge weight and `d_c` the summed weighted degree.
pub fn community_modularity(
    community_of: &HashMap<NodeId, i64>,
    edges: &[(NodeId, NodeId, f64)],
) -> BTreeMap<i64, f64> {
    let mut internal: BTreeMap<i64, f64> = BTreeMap::new();
    let mut degree: BTreeMap<i64, f64> = BTreeMap::new();
    for &community in community_of.values() {
        internal.entry(community).or_insert(0.0);
        degree.entry(community).or_insert(0.0);
    }

    let mut total = 0.0;
    for &(s, t, w) in edges {
        let (Some(&cs), Some(&ct)) = (community_of.get(&s), community_of.get(&t)) else {
            continue;
        };
        total += w;
        *degree.entry(cs).or_insert(0.0) += w;
        *degree.entry(ct).or_insert(0.0) += w;
        if cs == ct {
            *internal.entry(cs).or_insert(0.0) += w;
        }
    }

    if total <= 0.0 {
        return internal.into_keys().map(|c| (c, 0.0)).collect();
    }

    internal
        .into_iter()
        .map(|(c, l)| {
            let d = degree.get(&c).copied().unwrap_or(0.0);
            (c, l / total - (d / (2.0 * total)).powi(2))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[NodeId]) -> Vec<ProjectedNode> {
        ids.iter().map(|&id| ProjectedNode { id, community: None }).collect()
    }

    #[test]
    fn test_duplicate_projection_conflicts() {
        let engine = InMemoryGraphEngine::new();
        engine.project("g", ProjectionSpec::default()).unwrap();
        let err = engine.project("g", ProjectionSpec::default()).unwrap_err();
        assert_eq!(err, ComputeError::GraphExists("g".to_string()));

        assert!(engine.drop_projection("g").unwrap());
        assert!(!engine.drop_projection("g").unwrap());
        assert!(engine.project("g", ProjectionSpec::default()).is_ok());
    }

    #[test]
    fn test_project_dedupes_undirected_edges() {
        let engine = InMemoryGraphEngine::new();
        let handle = engine
            .project(
                "g",
                ProjectionSpec {
                    nodes: nodes(&[1, 2]),
                    edges: vec![(1, 2, 1.0), (2, 1, 1.0), (1, 1, 5.0)],
                },
            )
            .unwrap();
        assert_eq!(handle.edge_count, 1);
    }

    #[test]
    fn test_leiden_unknown_projection() {
        let engine = InMemoryGraphEngine::new();
        let handle = ProjectionHandle { name: "missing".into(), node_count: 0, edge_count: 0 };
        let err = engine.leiden_stream(&handle, &LeidenConfig::default()).unwrap_err();
        assert!(matches!(err, ComputeError::ProjectionNotFound(_)));
    }

    #[test]
    fn test_leiden_assigns_every_node() {
        let engine = InMemoryGraphEngine::new();
        let spec = ProjectionSpec {
            nodes: nodes(&[1, 2, 3, 4, 5, 6, 7]),
            edges: vec![
                (1, 2, 1.0), (2, 3, 1.0), (1, 3, 1.0),
                (4, 5, 1.0), (5, 6, 1.0), (4, 6, 1.0),
                (3, 4, 0.1),
            ],
        };
        let handle = engine.project("g", spec).unwrap();
        let config = LeidenConfig { quality_function: QualityFunctionType::Modularity, resolution: 1.0, ..LeidenConfig::default() };
        let assignments = engine.leiden_stream(&handle, &config).unwrap();

        assert_eq!(assignments.len(), 7);
        let of: HashMap<_, _> = assignments.into_iter().collect();
        // 7 has no edges: its own community
        assert!(of.iter().all(|(&n, &c)| n == 7 || c != of[&7]));
        assert_eq!(of[&1], of[&2]);
        assert_eq!(of[&5], of[&6]);
    }

    #[test]
    fn test_community_modularity_two_cliques() {
        let community_of: HashMap<NodeId, i64> =
            [(1, 0), (2, 0), (3, 1), (4, 1)].into_iter().collect();
        let edges = vec![(1, 2, 1.0), (3, 4, 1.0)];
        let scores = community_modularity(&community_of, &edges);
        // each: 1/2 - (2/4)^2
        assert_eq!(scores.len(), 2);
        assert!((scores[&0] - 0.25).abs() < 1e-12);
        assert!((scores[&1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_modularity_requires_labels() {
        let engine = InMemoryGraphEngine::new();
        let handle = engine
            .project("m", ProjectionSpec { nodes: nodes(&[1]), edges: vec![] })
            .unwrap();
        assert!(matches!(engine.modularity_stream(&handle), Err(ComputeError::Algorithm(_))));
    }
}
