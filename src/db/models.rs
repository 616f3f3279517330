use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A named, typed mention extracted from article text.
///
/// Identity is `(name, type)`. Both parts are normalized once, when the entity
/// is built, so lookups downstream compare plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl Entity {
    pub fn new(name: &str, entity_type: &str) -> Self {
        Entity {
            name: normalize_label(name),
            entity_type: normalize_label(entity_type),
        }
    }

    /// `name(type)` form used in combined breakdowns
    pub fn display_label(&self) -> String {
        format!("{}({})", self.name, self.entity_type)
    }
}

/// Trim, collapse inner whitespace, lowercase
pub fn normalize_label(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Entity -> occurrence count for one document
pub type EntityProfile = HashMap<Entity, u32>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "leadContent")]
    pub lead_content: String,
    #[serde(rename = "recipeLabel")]
    pub recipe_label: String,
    pub tags: Vec<String>,
    // Not serialized: Entity keys don't map onto JSON object keys
    #[serde(skip)]
    pub entities: EntityProfile,
}

impl Document {
    pub fn add_entity(&mut self, entity: Entity, count: u32) {
        *self.entities.entry(entity).or_insert(0) += count;
    }
}

/// Similarity between two documents, stored once per unordered pair
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimilarityLink {
    pub url1: String,
    pub url2: String,
    pub cosinus: f64,
    pub jaccard: f64,
}

/// Co-occurrence weight between two entities; `entity1 < entity2`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntityLink {
    pub entity1: Entity,
    pub entity2: Entity,
    pub count: f64,
}

/// Which node table a community label refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Article,
    Entity,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Article => "article",
            NodeKind::Entity => "entity",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "article" => Some(NodeKind::Article),
            "entity" => Some(NodeKind::Entity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityAssignment {
    pub node_id: i64,
    pub community_id: i64,
}

/// Entity types a source file is expected (or not expected) to produce
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchesCriteria {
    #[serde(default)]
    pub matching: HashSet<String>,
    #[serde(default)]
    pub non_matching: HashSet<String>,
}

impl MatchesCriteria {
    pub fn new<I, J, S, T>(matching: I, non_matching: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        MatchesCriteria {
            matching: matching.into_iter().map(|s| normalize_label(s.as_ref())).collect(),
            non_matching: non_matching.into_iter().map(|s| normalize_label(s.as_ref())).collect(),
        }
    }

    /// Re-apply label normalization after deserializing from a config file
    pub fn normalized(self) -> Self {
        MatchesCriteria::new(self.matching, self.non_matching)
    }

    pub fn knows_type(&self, entity_type: &str) -> bool {
        self.matching.contains(entity_type) || self.non_matching.contains(entity_type)
    }
}

/// Summed usage of one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityCount {
    pub entity: Entity,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: u64,
}

/// Record of one computed clustering
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringRun {
    pub id: String,
    pub cluster_key: String,
    pub node_kind: NodeKind,
    pub communities: usize,
    pub nodes: usize,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_normalized_once() {
        let a = Entity::new("  New   York ", "LOC");
        let b = Entity::new("new york", "loc");
        assert_eq!(a, b);
        assert_eq!(a.display_label(), "new york(loc)");
    }

    #[test]
    fn test_add_entity_accumulates() {
        let mut doc = Document {
            url: "u".into(),
            title: String::new(),
            content: String::new(),
            lead_content: String::new(),
            recipe_label: String::new(),
            tags: vec![],
            entities: EntityProfile::new(),
        };
        doc.add_entity(Entity::new("salt", "ingredient"), 2);
        doc.add_entity(Entity::new("Salt", "ingredient"), 1);
        assert_eq!(doc.entities.len(), 1);
        assert_eq!(doc.entities[&Entity::new("salt", "ingredient")], 3);
    }

    #[test]
    fn test_node_kind_round_trip() {
        assert_eq!(NodeKind::from_str(NodeKind::Entity.as_str()), Some(NodeKind::Entity));
        assert_eq!(NodeKind::from_str("cluster"), None);
    }
}
