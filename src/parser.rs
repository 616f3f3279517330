//! Source file parsing and entity extraction
//!
//! A source file is a JSON array of scraped pages:
//! `[{"resultData": {"url", "recipeLabel", "results": [{"title", "content", "leadContent", "tags": [{"tag"}]}]}}]`.
//! Every result becomes one document. Results may carry pre-tagged `entities`;
//! otherwise an `EntityExtractor` runs over the lead content and the content.

use std::collections::BTreeMap;

use log::{debug, info};
use regex::Regex;
use serde::Deserialize;

use crate::db::{Document, Entity, EntityProfile};
use crate::error::{AnalysisError, Result};

/// Labels never kept as entities
const IGNORED_LABELS: &[&str] = &["date", "time"];

#[derive(Debug, Deserialize)]
struct SourceRecord {
    #[serde(rename = "resultData")]
    result_data: ResultData,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    url: String,
    #[serde(rename = "recipeLabel", default)]
    recipe_label: String,
    #[serde(default)]
    results: Vec<ResultEntry>,
}

#[derive(Debug, Deserialize)]
struct ResultEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(rename = "leadContent", default)]
    lead_content: String,
    #[serde(default)]
    tags: Vec<TagRow>,
    #[serde(default)]
    entities: Option<Vec<TaggedEntity>>,
}

#[derive(Debug, Deserialize)]
struct TagRow {
    tag: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TaggedEntity {
    name: String,
    #[serde(alias = "type")]
    label: String,
}

/// A parsed document, with its pre-tagged mentions when the source had them
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub document: Document,
    pub mentions: Option<Vec<(String, String)>>,
}

/// Named-entity recognizer: text in, `(name, label)` mentions out
pub trait EntityExtractor {
    fn extract(&self, text: &str) -> Result<Vec<(String, String)>>;
}

pub fn parse_documents(content: &str) -> Result<Vec<ParsedDocument>> {
    let records: Vec<SourceRecord> = serde_json::from_str(content)?;
    let mut out = Vec::new();

    for record in records {
        let data = record.result_data;
        for (index, entry) in data.results.into_iter().enumerate() {
            // Several results on one page share its URL
            let url = if index == 0 {
                data.url.clone()
            } else {
                format!("{}#{}", data.url, index)
            };
            let mentions = entry
                .entities
                .map(|list| list.into_iter().map(|e| (e.name, e.label)).collect());

            out.push(ParsedDocument {
                document: Document {
                    url,
                    title: entry.title,
                    content: entry.content,
                    lead_content: entry.lead_content,
                    recipe_label: data.recipe_label.clone(),
                    tags: entry.tags.into_iter().map(|t| t.tag).collect(),
                    entities: EntityProfile::new(),
                },
                mentions,
            });
        }
    }

    info!("[Parser] Parsed {} documents", out.len());
    Ok(out)
}

/// Keep mentions whose name is longer than two characters and whose label
/// is not a date or time
pub fn filter_entities(mentions: Vec<(String, String)>) -> Vec<(String, String)> {
    mentions
        .into_iter()
        .filter(|(name, label)| {
            name.trim().chars().count() > 2
                && !IGNORED_LABELS.contains(&label.trim().to_lowercase().as_str())
        })
        .collect()
}

/// Mentions from the lead content followed by those from the content
pub fn extract_mentions(doc: &Document, extractor: &dyn EntityExtractor) -> Result<Vec<(String, String)>> {
    let mut mentions = filter_entities(extractor.extract(&doc.lead_content)?);
    mentions.extend(filter_entities(extractor.extract(&doc.content)?));
    Ok(mentions)
}

/// Fill in each document's entity profile from its pre-tagged mentions or,
/// failing that, from the extractor
pub fn annotate(parsed: Vec<ParsedDocument>, extractor: Option<&dyn EntityExtractor>) -> Result<Vec<Document>> {
    let mut out = Vec::with_capacity(parsed.len());

    for ParsedDocument { mut document, mentions } in parsed {
        let mentions = match (mentions, extractor) {
            (Some(tagged), _) => filter_entities(tagged),
            (None, Some(extractor)) => extract_mentions(&document, extractor)?,
            (None, None) => {
                return Err(AnalysisError::Extraction(format!(
                    "{} has no tagged entities and no extractor is configured",
                    document.url
                )))
            }
        };
        for (name, label) in mentions {
            document.add_entity(Entity::new(&name, &label), 1);
        }
        debug!("[Parser] {}: {} distinct entities", document.url, document.entities.len());
        out.push(document);
    }

    Ok(out)
}

/// Dictionary-based extractor: case-insensitive whole-word matches of known names
pub struct GazetteerExtractor {
    pattern: Option<Regex>,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GazetteerFile {
    /// label -> names
    entities: BTreeMap<String, Vec<String>>,
}

impl GazetteerExtractor {
    pub fn new(entries: Vec<(String, String)>) -> Result<Self> {
        let labels: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(name, label)| (name.to_lowercase(), label))
            .collect();

        // Longest names first so "new york city" wins over "new york"
        let mut names: Vec<&String> = labels.keys().collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let pattern = if names.is_empty() {
            None
        } else {
            let alternation = names.iter().map(|n| regex::escape(n)).collect::<Vec<_>>().join("|");
            let re = Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))
                .map_err(|e| AnalysisError::config(format!("Invalid gazetteer: {}", e)))?;
            Some(re)
        };

        Ok(Self { pattern, labels })
    }

    /// `[entities] label = ["name", ...]`
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: GazetteerFile = toml::from_str(content)?;
        let entries = file
            .entities
            .into_iter()
            .flat_map(|(label, names)| names.into_iter().map(move |n| (n, label.clone())))
            .collect();
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl EntityExtractor for GazetteerExtractor {
    fn extract(&self, text: &str) -> Result<Vec<(String, String)>> {
        let Some(pattern) = &self.pattern else {
            return Ok(Vec::new());
        };
        Ok(pattern
            .find_iter(text)
            .filter_map(|m| {
                let name = m.as_str().to_lowercase();
                self.labels.get(&name).map(|label| (name, label.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"[
        {"resultData": {"url": "https://example.org/a", "recipeLabel": "soups", "results": [
            {"title": "Chicken soup", "content": "Boil the chicken.", "leadContent": "Warm.", "tags": [{"tag": "chicken"}, {"tag": "soup"}],
             "entities": [{"name": "chicken", "label": "ing"}, {"name": "chicken", "label": "ing"}, {"name": "monday", "label": "date"}, {"name": "ox", "label": "ing"}]},
            {"title": "Variant", "content": "", "leadContent": "", "tags": []}
        ]}}
    ]"#;

    #[test]
    fn test_parse_documents() {
        let parsed = parse_documents(SOURCE).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].document.url, "https://example.org/a");
        assert_eq!(parsed[1].document.url, "https://example.org/a#1");
        assert_eq!(parsed[0].document.recipe_label, "soups");
        assert_eq!(parsed[0].document.tags, vec!["chicken".to_string(), "soup".to_string()]);
        assert!(parsed[1].mentions.is_none());
    }

    #[test]
    fn test_filter_entities() {
        let kept = filter_entities(vec![
            ("Paris".into(), "LOC".into()),
            ("ox".into(), "ing".into()),
            ("Monday".into(), "DATE".into()),
            ("noon".into(), "time".into()),
        ]);
        assert_eq!(kept, vec![("Paris".to_string(), "LOC".to_string())]);
    }

    #[test]
    fn test_annotate_pretagged_counts_mentions() {
        let parsed = parse_documents(SOURCE).unwrap();
        let gazetteer = GazetteerExtractor::new(vec![]).unwrap();
        let docs = annotate(parsed, Some(&gazetteer)).unwrap();
        assert_eq!(docs[0].entities.len(), 1);
        assert_eq!(docs[0].entities[&Entity::new("chicken", "ing")], 2);
        assert!(docs[1].entities.is_empty());
    }

    #[test]
    fn test_annotate_without_extractor_fails() {
        let parsed = parse_documents(SOURCE).unwrap();
        assert!(matches!(annotate(parsed, None), Err(AnalysisError::Extraction(_))));
    }

    #[test]
    fn test_gazetteer_extractor() {
        let gazetteer = GazetteerExtractor::from_toml_str(
            "[entities]\ningredient = [\"olive oil\", \"oil\", \"garlic\"]\nlocation = [\"Naples\"]\n",
        )
        .unwrap();
        assert_eq!(gazetteer.len(), 4);

        let found = gazetteer.extract("Fry garlic in Olive Oil, as they do in naples. Garlicky!").unwrap();
        assert_eq!(
            found,
            vec![
                ("garlic".to_string(), "ingredient".to_string()),
                ("olive oil".to_string(), "ingredient".to_string()),
                ("naples".to_string(), "location".to_string()),
            ]
        );
    }

    #[test]
    fn test_extract_mentions_covers_lead_and_content() {
        let gazetteer = GazetteerExtractor::new(vec![("basil".into(), "ingredient".into())]).unwrap();
        let doc = Document {
            url: "u".into(),
            title: String::new(),
            content: "More basil.".into(),
            lead_content: "Basil first.".into(),
            recipe_label: String::new(),
            tags: vec![],
            entities: EntityProfile::new(),
        };
        assert_eq!(extract_mentions(&doc, &gazetteer).unwrap().len(), 2);
    }
}
