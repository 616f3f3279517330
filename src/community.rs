//! Per-community statistics over stored cluster labels

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};
use serde::Serialize;

use crate::compute::GraphCompute;
use crate::db::{Database, EntityCount, MatchesCriteria, TagCount};
use crate::error::Result;
use crate::projection::{AnalysisMode, ClusterKey, GraphProjectionBuilder};

const EPSILON: f64 = 1e-10;

/// How a tag spreads over communities.
/// Declaration order is the reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TagClass {
    /// Recurring, spread over several communities
    B,
    /// Recurring, confined to one community
    A,
    /// Everything else
    C,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagClassification {
    pub tag: String,
    pub n_appearances: usize,
    pub n_communities: usize,
    pub class: TagClass,
}

pub fn classify_tag(n_appearances: usize, n_communities: usize) -> TagClass {
    if n_appearances > 1 && n_communities > 1 {
        TagClass::B
    } else if n_appearances > 1 && n_communities == 1 {
        TagClass::A
    } else {
        TagClass::C
    }
}

/// Count tag appearances and the distinct communities behind them.
///
/// `rows` holds one entry per article: its tags and the communities it is tied
/// to. With `count_unlabelled` false, articles without a community are ignored.
pub fn tally_tags(rows: &[(Vec<String>, Vec<i64>)], count_unlabelled: bool) -> Vec<TagClassification> {
    let mut appearances: HashMap<&str, usize> = HashMap::new();
    let mut communities: HashMap<&str, BTreeSet<i64>> = HashMap::new();

    for (tags, labels) in rows {
        if labels.is_empty() && !count_unlabelled {
            continue;
        }
        let distinct: BTreeSet<&str> = tags.iter().map(|t| t.as_str()).collect();
        for tag in distinct {
            *appearances.entry(tag).or_insert(0) += 1;
            communities.entry(tag).or_default().extend(labels.iter().copied());
        }
    }

    let mut out: Vec<TagClassification> = appearances
        .into_iter()
        .map(|(tag, n_appearances)| {
            let n_communities = communities.get(tag).map_or(0, |c| c.len());
            TagClassification {
                tag: tag.to_string(),
                n_appearances,
                n_communities,
                class: classify_tag(n_appearances, n_communities),
            }
        })
        .collect();

    out.sort_by(|a, b| {
        a.class
            .cmp(&b.class)
            .then(b.n_appearances.cmp(&a.n_appearances))
            .then_with(|| a.tag.cmp(&b.tag))
    });
    out
}

/// `(m/(m+n+ε), n/(m+n+ε))`
pub fn matching_ratio(matching: u64, non_matching: u64) -> (f64, f64) {
    let total = matching as f64 + non_matching as f64 + EPSILON;
    (matching as f64 / total, non_matching as f64 / total)
}

pub struct CommunityAnalyzer<'a> {
    db: &'a Database,
    compute: &'a dyn GraphCompute,
}

impl<'a> CommunityAnalyzer<'a> {
    pub fn new(db: &'a Database, compute: &'a dyn GraphCompute) -> Self {
        Self { db, compute }
    }

    /// Modularity contribution of each community, over a projection of the
    /// labelled nodes in the selection
    pub fn modularity(
        &self,
        selections: &[String],
        key: &ClusterKey,
        mode: AnalysisMode,
    ) -> Result<BTreeMap<i64, f64>> {
        let builder = GraphProjectionBuilder::new(self.db, self.compute);
        let graph_name = format!("{}_modularity", key);
        let handle = builder.create_modularity_projection(selections, &graph_name, key, mode)?;

        let streamed = self.compute.modularity_stream(&handle);
        builder.delete_projection(&handle.name);

        let scores: BTreeMap<i64, f64> = streamed?.into_iter().collect();
        info!("[Community] Modularity for {} communities of {}", scores.len(), key);
        Ok(scores)
    }

    /// Entities of one community with their summed usage in the selection, most used first
    pub fn entities_in_community(
        &self,
        community_id: i64,
        selections: &[String],
        key: &ClusterKey,
        mode: AnalysisMode,
    ) -> Result<Vec<EntityCount>> {
        let mut totals: HashMap<_, u64> = HashMap::new();
        for (entity, count) in self.db.community_entity_counts(community_id, selections, key.as_str(), mode.node_kind())? {
            *totals.entry(entity).or_insert(0) += count;
        }

        let mut out: Vec<EntityCount> = totals
            .into_iter()
            .map(|(entity, count)| EntityCount { entity, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.entity.cmp(&b.entity)));
        Ok(out)
    }

    /// Tag frequencies over the selected articles of one community
    pub fn tags_in_community(
        &self,
        community_id: i64,
        selections: &[String],
        key: &ClusterKey,
        mode: AnalysisMode,
    ) -> Result<Vec<TagCount>> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for tags in self.db.community_article_tags(community_id, selections, key.as_str(), mode.node_kind())? {
            for tag in tags {
                *counts.entry(tag).or_insert(0) += 1;
            }
        }

        let mut out: Vec<TagCount> = counts
            .into_iter()
            .map(|(tag, count)| TagCount { tag, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        Ok(out)
    }

    /// Classify every tag in the selection as B, A or C (in that order).
    ///
    /// Article mode counts only labelled articles; entity mode counts every
    /// article that uses at least one entity, with the communities of its entities.
    pub fn tag_classification(
        &self,
        selections: &[String],
        key: &ClusterKey,
        mode: AnalysisMode,
    ) -> Result<Vec<TagClassification>> {
        let rows = self.db.tag_community_rows(selections, key.as_str(), mode.node_kind())?;
        let count_unlabelled = matches!(mode, AnalysisMode::Entities);
        let out = tally_tags(&rows, count_unlabelled);
        debug!("[Community] Classified {} tags over {} articles", out.len(), rows.len());
        Ok(out)
    }

    /// Share of a community's entity occurrences whose type the source files
    /// expect, against those they don't
    pub fn matching_entity_ratio(
        &self,
        criteria: &BTreeMap<String, MatchesCriteria>,
        community_id: i64,
        key: &ClusterKey,
        mode: AnalysisMode,
    ) -> Result<(f64, f64)> {
        let mut matching = 0u64;
        let mut non_matching = 0u64;

        for (filename, c) in criteria {
            matching += self.db.typed_entity_occurrences(
                community_id, key.as_str(), mode.node_kind(), filename, &c.matching,
            )?;
            non_matching += self.db.typed_entity_occurrences(
                community_id, key.as_str(), mode.node_kind(), filename, &c.non_matching,
            )?;
        }

        debug!(
            "[Community] Community {} of {}: {} matching, {} non-matching occurrences",
            community_id, key, matching, non_matching
        );
        Ok(matching_ratio(matching, non_matching))
    }

    /// (community_id, node_count), largest first
    pub fn cluster_size_distribution(&self, key: &ClusterKey, mode: AnalysisMode) -> Result<Vec<(i64, usize)>> {
        self.db.cluster_sizes(key.as_str(), mode.node_kind())
    }
}
