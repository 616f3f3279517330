//! Document similarity from shared entities
//!
//! Cosine and the weighted Jaccard variant between entity-count profiles, plus
//! the pairwise link builders and entity co-occurrence weights used at load time.

use std::collections::{BTreeMap, HashMap};

use crate::db::{Document, Entity, EntityLink, EntityProfile, SimilarityLink};

const EPSILON: f64 = 1e-10;

/// Cosine similarity over the union of both profiles' entities.
/// Each vector is divided by (its L2 norm + 1e-10) before the dot product,
/// so an empty profile yields 0.0 instead of NaN.
pub fn cosine(a: &EntityProfile, b: &EntityProfile) -> f64 {
    let norm_a = a.values().map(|&v| (v as f64) * (v as f64)).sum::<f64>().sqrt() + EPSILON;
    let norm_b = b.values().map(|&v| (v as f64) * (v as f64)).sum::<f64>().sqrt() + EPSILON;

    // Entities missing from either side contribute 0 to the dot product
    let dot: f64 = a
        .iter()
        .filter_map(|(k, &va)| b.get(k).map(|&vb| (va as f64 / norm_a) * (vb as f64 / norm_b)))
        .sum();

    dot
}

/// Weighted Jaccard: `Σ_{k∈a∩b}(a[k]+b[k]) / (Σa + Σb + 1e-10)`.
///
/// Not the classical index and not symmetric in general when the profiles
/// have different key sets; callers rely on exactly this formula.
pub fn jaccard(a: &EntityProfile, b: &EntityProfile) -> f64 {
    let mut bottom: f64 = b.values().map(|&v| v as f64).sum();
    let mut top = 0.0;

    for (k, &va) in a {
        bottom += va as f64;
        if let Some(&vb) = b.get(k) {
            top += va as f64 + vb as f64;
        }
    }

    top / (bottom + EPSILON)
}

/// (jaccard, cosine) for one pair
pub fn calculate_distances(a: &EntityProfile, b: &EntityProfile) -> (f64, f64) {
    (jaccard(a, b), cosine(a, b))
}

fn link_if_related(url1: &str, a: &EntityProfile, url2: &str, b: &EntityProfile) -> Option<SimilarityLink> {
    let (jaccard, cosinus) = calculate_distances(a, b);
    if jaccard * cosinus > 0.0 {
        Some(SimilarityLink {
            url1: url1.to_string(),
            url2: url2.to_string(),
            cosinus,
            jaccard,
        })
    } else {
        None
    }
}

/// Links between every unordered pair of documents in one batch.
/// Pairs sharing a URL are skipped.
pub fn create_similarity_links(documents: &[Document]) -> Vec<SimilarityLink> {
    let mut links = Vec::new();

    for (i, first) in documents.iter().enumerate() {
        for second in &documents[i + 1..] {
            if first.url == second.url {
                continue;
            }
            if let Some(link) = link_if_related(&first.url, &first.entities, &second.url, &second.entities) {
                links.push(link);
            }
        }
    }

    links
}

/// Links from each new document to previously stored documents (URL-keyed profiles)
pub fn create_similarity_links_between_files(
    documents: &[Document],
    stored: &HashMap<String, EntityProfile>,
) -> Vec<SimilarityLink> {
    let mut stored_urls: Vec<&String> = stored.keys().collect();
    stored_urls.sort();

    let mut links = Vec::new();
    for doc in documents {
        for url in &stored_urls {
            if **url == doc.url {
                continue;
            }
            if let Some(link) = link_if_related(&doc.url, &doc.entities, url, &stored[*url]) {
                links.push(link);
            }
        }
    }

    links
}

/// Co-occurrence weights between every pair of distinct entities in one document.
/// Weight is the half-sum of the two counts.
pub fn entity_connections(document: &Document) -> Vec<EntityLink> {
    let mut entities: Vec<(&Entity, u32)> = document.entities.iter().map(|(e, &c)| (e, c)).collect();
    entities.sort_by(|a, b| a.0.cmp(b.0));

    let mut links = Vec::new();
    for (i, (first, count_a)) in entities.iter().enumerate() {
        for (second, count_b) in &entities[i + 1..] {
            links.push(EntityLink {
                entity1: (*first).clone(),
                entity2: (*second).clone(),
                count: (*count_a as f64 + *count_b as f64) / 2.0,
            });
        }
    }

    links
}

/// Sum of per-document co-occurrence weights across a batch, sorted by pair
pub fn aggregate_entity_links(documents: &[Document]) -> Vec<EntityLink> {
    let mut totals: BTreeMap<(Entity, Entity), f64> = BTreeMap::new();

    for doc in documents {
        for link in entity_connections(doc) {
            *totals.entry((link.entity1, link.entity2)).or_insert(0.0) += link.count;
        }
    }

    totals
        .into_iter()
        .map(|((entity1, entity2), count)| EntityLink { entity1, entity2, count })
        .collect()
}
