mod schema;
mod models;

pub use schema::{Database, LinkScope};
pub use models::{
    normalize_label, ClusteringRun, CommunityAssignment, Document, Entity, EntityCount,
    EntityLink, EntityProfile, MatchesCriteria, NodeKind, SimilarityLink, TagCount,
};
