//! Breakdowns of the entities linked to one entity name

use std::collections::HashMap;

use serde::Serialize;

use crate::db::{normalize_label, Database, Entity};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownRow {
    pub label: String,
    pub count: u64,
}

/// Linked-entity counts grouped three ways, each sorted by count descending
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedBreakdown {
    pub by_name: Vec<BreakdownRow>,
    pub by_type: Vec<BreakdownRow>,
    pub combined: Vec<BreakdownRow>,
}

fn top_n(counts: HashMap<String, u64>, limit: usize) -> Vec<BreakdownRow> {
    let mut rows: Vec<BreakdownRow> = counts
        .into_iter()
        .map(|(label, count)| BreakdownRow { label, count })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    rows.truncate(limit);
    rows
}

pub fn breakdown(linked: &HashMap<Entity, u64>, limit: usize) -> LinkedBreakdown {
    let mut by_name: HashMap<String, u64> = HashMap::new();
    let mut by_type: HashMap<String, u64> = HashMap::new();
    let mut combined: HashMap<String, u64> = HashMap::new();

    for (entity, &count) in linked {
        *by_name.entry(entity.name.clone()).or_insert(0) += count;
        *by_type.entry(entity.entity_type.clone()).or_insert(0) += count;
        *combined.entry(entity.display_label()).or_insert(0) += count;
    }

    LinkedBreakdown {
        by_name: top_n(by_name, limit),
        by_type: top_n(by_type, limit),
        combined: top_n(combined, limit),
    }
}

/// Entities co-occurring with `entity_name` in the selection, broken down.
/// The name is matched after the same normalization stored entities get.
pub fn linked_breakdown(db: &Database, entity_name: &str, files: &[String], limit: usize) -> Result<LinkedBreakdown> {
    let linked = db.linked_entities(&normalize_label(entity_name), files)?;
    Ok(breakdown(&linked, limit))
}
