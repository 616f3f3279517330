//! Settings storage and per-file criteria
//!
//! Settings live in a JSON file in the app data directory. Matches criteria sit
//! next to the source files they describe: `recipes.json` is described by
//! `recipes.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::compute::{LeidenConfig, QualityFunctionType};
use crate::db::MatchesCriteria;
use crate::error::{AnalysisError, Result};

/// Overrides the configured database path
pub const DB_ENV_VAR: &str = "NERLENS_DB";

const APP_DIR: &str = "nerlens";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub custom_db_path: Option<String>,
    /// Directory holding the `<source>.toml` criteria files
    #[serde(default)]
    pub criteria_dir: Option<String>,
    #[serde(default)]
    pub leiden: LeidenConfig,
    /// Rows shown per linked-entity breakdown
    #[serde(default = "default_breakdown_limit")]
    pub breakdown_limit: usize,
}

fn default_breakdown_limit() -> usize {
    20
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            custom_db_path: None,
            criteria_dir: None,
            leiden: LeidenConfig::default(),
            breakdown_limit: default_breakdown_limit(),
        }
    }
}

/// `~/.local/share/nerlens` (platform equivalent), falling back to the working directory
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_settings_path() -> PathBuf {
    app_data_dir().join("settings.json")
}

impl Settings {
    /// Load settings from disk, or defaults when the file is missing or unreadable
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Settings::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("[Settings] Ignoring malformed {}: {}", path.display(), e);
                Settings::default()
            }),
            Err(e) => {
                warn!("[Settings] Could not read {}: {}", path.display(), e);
                Settings::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Environment override, then the configured path, then the app data directory
    pub fn db_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var(DB_ENV_VAR) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        match &self.custom_db_path {
            Some(path) => PathBuf::from(path),
            None => app_data_dir().join("nerlens.db"),
        }
    }

    pub fn criteria_dir(&self) -> PathBuf {
        self.criteria_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn set_quality_function(&mut self, name: &str) -> Result<()> {
        self.leiden.quality_function = match name.to_lowercase().as_str() {
            "modularity" => QualityFunctionType::Modularity,
            "cpm" => QualityFunctionType::CPM,
            other => return Err(AnalysisError::config(format!("Unknown quality function: {}", other))),
        };
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CriteriaFile {
    matches: MatchesCriteria,
}

/// Criteria file name for a source file: `.json` becomes `.toml`
pub fn criteria_file_name(source: &str) -> String {
    match source.strip_suffix(".json") {
        Some(stem) => format!("{}.toml", stem),
        None => format!("{}.toml", source),
    }
}

pub fn parse_matches_criteria(content: &str) -> Result<MatchesCriteria> {
    let file: CriteriaFile = toml::from_str(content)?;
    Ok(file.matches.normalized())
}

/// Criteria for one source file, or `None` when it has no criteria file.
/// Unreadable or malformed files are errors.
pub fn find_file_criteria(dir: &Path, source: &str) -> Result<Option<MatchesCriteria>> {
    let path = dir.join(criteria_file_name(source));
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let criteria = parse_matches_criteria(&content)?;
    debug!(
        "[Settings] {}: {} matching, {} non-matching types",
        source,
        criteria.matching.len(),
        criteria.non_matching.len()
    );
    Ok(Some(criteria))
}

/// Criteria for one source file; a missing file is a configuration error
pub fn load_file_criteria(dir: &Path, source: &str) -> Result<MatchesCriteria> {
    find_file_criteria(dir, source)?.ok_or_else(|| {
        AnalysisError::config(format!(
            "No criteria file for {} (expected {})",
            source,
            dir.join(criteria_file_name(source)).display()
        ))
    })
}

/// Criteria for every selected source file, keyed by file name
pub fn load_matches_criteria(dir: &Path, selections: &[String]) -> Result<BTreeMap<String, MatchesCriteria>> {
    selections
        .iter()
        .map(|source| load_file_criteria(dir, source).map(|c| (source.clone(), c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.custom_db_path = Some("/tmp/x.db".to_string());
        settings.set_quality_function("modularity").unwrap();
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.leiden.quality_function, QualityFunctionType::Modularity);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"leiden": {"resolution": 1.5}}"#).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded.leiden.resolution, 1.5);
        assert_eq!(loaded.leiden.theta, 0.3);
        assert_eq!(loaded.breakdown_limit, 20);
        assert!(loaded.custom_db_path.is_none());
    }

    #[test]
    fn test_malformed_settings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn test_unknown_quality_function() {
        let mut settings = Settings::default();
        assert!(matches!(settings.set_quality_function("surprise"), Err(AnalysisError::Config(_))));
    }

    #[test]
    fn test_criteria_file_name() {
        assert_eq!(criteria_file_name("recipes.json"), "recipes.toml");
        assert_eq!(criteria_file_name("recipes"), "recipes.toml");
    }

    #[test]
    fn test_load_matches_criteria() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("recipes.toml"),
            "[matches]\nmatching = [\"Ingredient\", \"FOOD\"]\nnon_matching = [\"loc\"]\n",
        )
        .unwrap();

        let all = load_matches_criteria(dir.path(), &["recipes.json".to_string()]).unwrap();
        let criteria = &all["recipes.json"];
        assert!(criteria.matching.contains("ingredient"));
        assert!(criteria.matching.contains("food"));
        assert!(criteria.non_matching.contains("loc"));

        let err = load_matches_criteria(dir.path(), &["travel.json".to_string()]).unwrap_err();
        assert!(matches!(err, AnalysisError::Config(_)));
    }

    #[test]
    fn test_find_file_criteria_missing_vs_malformed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_file_criteria(dir.path(), "recipes.json").unwrap().is_none());

        fs::write(dir.path().join("recipes.toml"), "[matches\nmatching = 3").unwrap();
        let err = find_file_criteria(dir.path(), "recipes.json").unwrap_err();
        assert!(matches!(err, AnalysisError::Toml(_)));
    }
}
