//! Ingestion of one source file: documents, similarity links (within the file
//! and against everything already stored) and entity co-occurrence weights.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Serialize;

use crate::db::{Database, Document, LinkScope, MatchesCriteria};
use crate::error::{AnalysisError, Result};
use crate::parser::{self, EntityExtractor};
use crate::similarity;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub filename: String,
    pub documents: usize,
    pub entities: usize,
    pub similarity_links: usize,
    pub cross_links: usize,
    pub entity_links: usize,
    /// Entity types produced by the file but absent from its criteria
    pub missing_types: Vec<String>,
}

/// Entity types present in `docs` that `criteria` classifies neither way
pub fn missing_entity_types(docs: &[Document], criteria: &MatchesCriteria) -> Vec<String> {
    docs.iter()
        .flat_map(|d| d.entities.keys())
        .map(|e| e.entity_type.as_str())
        .filter(|t| !criteria.knows_type(t))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(String::from)
        .collect()
}

pub struct Loader<'a> {
    db: &'a Database,
}

impl<'a> Loader<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Store a batch under `filename`, replacing whatever the file held before
    pub fn load_batch(
        &self,
        filename: &str,
        docs: &[Document],
        criteria: Option<&MatchesCriteria>,
    ) -> Result<LoadReport> {
        if self.db.count_articles(filename)? > 0 {
            info!("[Loader] {} already loaded, replacing", filename);
            self.db.delete_file(filename)?;
        }

        let documents = self.db.load_documents(filename, docs)?;

        let links = similarity::create_similarity_links(docs);
        let similarity_links = self.db.insert_similarity_links(filename, &links, LinkScope::SameFile)?;

        let stored = self.db.document_profiles(filename)?;
        let cross = similarity::create_similarity_links_between_files(docs, &stored);
        let cross_links = self.db.insert_similarity_links(filename, &cross, LinkScope::OtherFiles)?;

        let entity_links = similarity::aggregate_entity_links(docs);
        let entity_links = self.db.insert_entity_links(filename, &entity_links)?;

        let entities = docs
            .iter()
            .flat_map(|d| d.entities.keys())
            .collect::<BTreeSet<_>>()
            .len();

        let missing_types = match criteria {
            Some(c) => missing_entity_types(docs, c),
            None => Vec::new(),
        };
        if !missing_types.is_empty() {
            warn!(
                "[Loader] {} has entity types missing from its criteria: {}",
                filename,
                missing_types.join(", ")
            );
        }

        info!(
            "[Loader] {}: {} documents, {} entities, {} links, {} cross-file links, {} entity links",
            filename, documents, entities, similarity_links, cross_links, entity_links
        );

        Ok(LoadReport {
            filename: filename.to_string(),
            documents,
            entities,
            similarity_links,
            cross_links,
            entity_links,
            missing_types,
        })
    }

    /// Parse a source file, extract entities and store it under its file name
    pub fn load_file(
        &self,
        path: &Path,
        criteria: Option<&MatchesCriteria>,
        extractor: Option<&dyn EntityExtractor>,
    ) -> Result<LoadReport> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AnalysisError::config(format!("Not a file: {}", path.display())))?;

        let content = fs::read_to_string(path)?;
        let parsed = parser::parse_documents(&content)?;
        let docs = parser::annotate(parsed, extractor)?;
        self.load_batch(&filename, &docs, criteria)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Entity, EntityProfile};
    use crate::parser::GazetteerExtractor;
    use crate::projection::DistanceMetric;
    use std::io::Write;

    fn doc(url: &str, entities: &[(&str, &str, u32)]) -> Document {
        let mut d = Document {
            url: url.to_string(),
            title: String::new(),
            content: String::new(),
            lead_content: String::new(),
            recipe_label: String::new(),
            tags: vec![],
            entities: EntityProfile::new(),
        };
        for (n, t, c) in entities {
            d.add_entity(Entity::new(n, t), *c);
        }
        d
    }

    #[test]
    fn test_load_batch_links_within_and_across_files() {
        let db = Database::in_memory().unwrap();
        let loader = Loader::new(&db);

        let first = loader
            .load_batch(
                "a.json",
                &[doc("u1", &[("salt", "ing", 1), ("egg", "ing", 2)]), doc("u2", &[("salt", "ing", 3)])],
                None,
            )
            .unwrap();
        assert_eq!(first.documents, 2);
        assert_eq!(first.entities, 2);
        assert_eq!(first.similarity_links, 1);
        assert_eq!(first.cross_links, 0);
        assert_eq!(first.entity_links, 1);

        let second = loader.load_batch("b.json", &[doc("u3", &[("egg", "ing", 1)])], None).unwrap();
        assert_eq!(second.similarity_links, 0);
        assert_eq!(second.cross_links, 1);

        let all = vec!["a.json".to_string(), "b.json".to_string()];
        assert_eq!(db.similarity_edges(&all, DistanceMetric::Cosine).unwrap().len(), 2);
    }

    #[test]
    fn test_reload_replaces_file() {
        let db = Database::in_memory().unwrap();
        let loader = Loader::new(&db);
        loader.load_batch("a.json", &[doc("u1", &[("salt", "ing", 1)]), doc("u2", &[("salt", "ing", 1)])], None).unwrap();
        loader.load_batch("a.json", &[doc("u9", &[("egg", "ing", 1)])], None).unwrap();

        assert_eq!(db.count_articles("a.json").unwrap(), 1);
        assert_eq!(db.entity_names(&["a.json".to_string()]).unwrap(), vec!["egg".to_string()]);
    }

    #[test]
    fn test_missing_types_reported() {
        let db = Database::in_memory().unwrap();
        let loader = Loader::new(&db);
        let criteria = MatchesCriteria::new(["ing"], ["loc"]);
        let report = loader
            .load_batch("a.json", &[doc("u1", &[("salt", "ing", 1), ("bob", "per", 1), ("acme", "org", 1)])], Some(&criteria))
            .unwrap();
        assert_eq!(report.missing_types, vec!["org".to_string(), "per".to_string()]);
    }

    #[test]
    fn test_load_file_with_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pasta.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"[{{"resultData": {{"url": "p1", "recipeLabel": "pasta", "results": [
                {{"title": "t", "content": "Garlic and basil.", "leadContent": "Basil.", "tags": [{{"tag": "pasta"}}]}}
            ]}}}}]"#
        )
        .unwrap();

        let gazetteer = GazetteerExtractor::new(vec![
            ("garlic".into(), "ingredient".into()),
            ("basil".into(), "ingredient".into()),
        ])
        .unwrap();

        let db = Database::in_memory().unwrap();
        let report = Loader::new(&db).load_file(&path, None, Some(&gazetteer)).unwrap();
        assert_eq!(report.filename, "pasta.json");
        assert_eq!(report.documents, 1);
        assert_eq!(report.entities, 2);
        assert_eq!(db.list_files().unwrap(), vec!["pasta.json".to_string()]);
    }
}
