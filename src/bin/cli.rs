//! nerlens CLI - load article files, cluster them and inspect communities
//!
//! Usage: nerlens-cli [OPTIONS] <COMMAND>
//!
//! Supports JSON output for scripting.

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use log::info;
use nerlens_lib::breakdown::linked_breakdown;
use nerlens_lib::clustering::{AnalysisSession, ClusteringOrchestrator, ClusteringOutcome};
use nerlens_lib::community::CommunityAnalyzer;
use nerlens_lib::compute::InMemoryGraphEngine;
use nerlens_lib::db::Database;
use nerlens_lib::loader::Loader;
use nerlens_lib::parser::{EntityExtractor, GazetteerExtractor};
use nerlens_lib::projection::{AnalysisMode, ClusterKey};
use nerlens_lib::settings::{self, Settings};
use nerlens_lib::{AnalysisError, Result};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

// ============================================================================
// Main CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "nerlens-cli")]
#[command(version, about = "Entity graph analysis CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path (default: settings, then app data directory)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Settings file (default: app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Only warnings and errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Detailed logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// File selection plus clustering mode
#[derive(Args, Clone)]
struct Selection {
    /// Source files to analyse (comma separated)
    #[arg(long, value_delimiter = ',', required = true)]
    files: Vec<String>,

    /// articles | entities
    #[arg(long, default_value = "articles")]
    mode: String,

    /// cosine | jaccard (article mode)
    #[arg(long)]
    metric: Option<String>,
}

impl Selection {
    fn mode(&self) -> Result<AnalysisMode> {
        AnalysisMode::parse(&self.mode, self.metric.as_deref())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded source files
    Files,
    /// Load a source JSON file
    Load {
        path: PathBuf,
        /// Directory with <file>.toml matches criteria
        #[arg(long)]
        criteria_dir: Option<PathBuf>,
        /// TOML gazetteer used for results without tagged entities
        #[arg(long)]
        gazetteer: Option<PathBuf>,
    },
    /// Delete a loaded file and everything derived from it
    Delete { filename: String },
    /// Entity names used in the selected files
    Entities {
        #[arg(long, value_delimiter = ',', required = true)]
        files: Vec<String>,
    },
    /// Entities co-occurring with an entity, by name, type and both
    Linked {
        entity: String,
        #[arg(long, value_delimiter = ',', required = true)]
        files: Vec<String>,
        #[arg(long, short)]
        limit: Option<usize>,
    },
    /// Cluster the selection (no-op when already clustered)
    Cluster {
        #[command(flatten)]
        selection: Selection,
    },
    /// Community size distribution
    Sizes {
        #[command(flatten)]
        selection: Selection,
    },
    /// Modularity per community
    Modularity {
        #[command(flatten)]
        selection: Selection,
    },
    /// A/B/C tag classification
    Tags {
        #[command(flatten)]
        selection: Selection,
    },
    /// Entities of one community
    CommunityEntities {
        community: i64,
        #[command(flatten)]
        selection: Selection,
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },
    /// Tags of one community
    CommunityTags {
        community: i64,
        #[command(flatten)]
        selection: Selection,
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },
    /// Matching vs non-matching entity share of one community
    Ratio {
        community: i64,
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        criteria_dir: Option<PathBuf>,
    },
    /// Past clustering runs
    Runs,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(level));

    if let Err(e) = run_cli(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn run_cli(cli: Cli) -> Result<()> {
    // Completions need no database
    if let Commands::Completions { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "nerlens-cli", &mut std::io::stdout());
        return Ok(());
    }

    let settings_path = cli.config.clone().unwrap_or_else(settings::default_settings_path);
    let settings = Settings::load(&settings_path);

    let db_path = cli.db.clone().map(PathBuf::from).unwrap_or_else(|| settings.db_path());
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    info!("[CLI] Using database {}", db_path.display());
    let db = Database::new(&db_path)?;
    let engine = InMemoryGraphEngine::new();
    let json = cli.json;

    match cli.command {
        Commands::Files => handle_files(&db, json),
        Commands::Load { path, criteria_dir, gazetteer } => {
            handle_load(&db, &settings, path, criteria_dir, gazetteer, json)
        }
        Commands::Delete { filename } => {
            let deleted = db.delete_file(&filename)?;
            if json {
                print_json(&serde_json::json!({ "filename": filename, "deleted": deleted }))
            } else {
                println!("Deleted {} articles from {}", deleted, filename);
                Ok(())
            }
        }
        Commands::Entities { files } => {
            let names = db.entity_names(&files)?;
            if json {
                return print_json(&names);
            }
            for name in &names {
                println!("{}", name);
            }
            eprintln!("{} entities", names.len());
            Ok(())
        }
        Commands::Linked { entity, files, limit } => {
            let limit = limit.unwrap_or(settings.breakdown_limit);
            let out = linked_breakdown(&db, &entity, &files, limit)?;
            if json {
                return print_json(&out);
            }
            for (title, rows) in [("By name", &out.by_name), ("By type", &out.by_type), ("Combined", &out.combined)] {
                println!("{}:", title);
                for row in rows {
                    println!("  {:>6}  {}", row.count, row.label);
                }
            }
            Ok(())
        }
        Commands::Cluster { selection } => {
            let outcome = ensure_clustered(&db, &engine, &settings, &selection)?;
            if json {
                return print_json(&outcome);
            }
            println!(
                "{}: {} communities over {} nodes{}",
                outcome.key,
                outcome.communities,
                outcome.assignments.len(),
                if outcome.recomputed { "" } else { " (cached)" }
            );
            Ok(())
        }
        Commands::Sizes { selection } => {
            let (key, mode) = clustered_key(&db, &engine, &settings, &selection)?;
            let sizes = CommunityAnalyzer::new(&db, &engine).cluster_size_distribution(&key, mode)?;
            if json {
                return print_json(&sizes);
            }
            for (community, count) in &sizes {
                println!("{:>6}  community {}", count, community);
            }
            Ok(())
        }
        Commands::Modularity { selection } => {
            let (key, mode) = clustered_key(&db, &engine, &settings, &selection)?;
            let scores = CommunityAnalyzer::new(&db, &engine).modularity(&selection.files, &key, mode)?;
            if json {
                return print_json(&scores);
            }
            for (community, score) in &scores {
                println!("community {:>4}  {:.4}", community, score);
            }
            println!("total          {:.4}", scores.values().sum::<f64>());
            Ok(())
        }
        Commands::Tags { selection } => {
            let (key, mode) = clustered_key(&db, &engine, &settings, &selection)?;
            let tags = CommunityAnalyzer::new(&db, &engine).tag_classification(&selection.files, &key, mode)?;
            if json {
                return print_json(&tags);
            }
            for t in &tags {
                println!("{:?}  {:<30} appearances={} communities={}", t.class, t.tag, t.n_appearances, t.n_communities);
            }
            Ok(())
        }
        Commands::CommunityEntities { community, selection, limit } => {
            let (key, mode) = clustered_key(&db, &engine, &settings, &selection)?;
            let mut entities = CommunityAnalyzer::new(&db, &engine).entities_in_community(community, &selection.files, &key, mode)?;
            entities.truncate(limit);
            if json {
                return print_json(&entities);
            }
            for e in &entities {
                println!("{:>6}  {}", e.count, e.entity.display_label());
            }
            Ok(())
        }
        Commands::CommunityTags { community, selection, limit } => {
            let (key, mode) = clustered_key(&db, &engine, &settings, &selection)?;
            let mut tags = CommunityAnalyzer::new(&db, &engine).tags_in_community(community, &selection.files, &key, mode)?;
            tags.truncate(limit);
            if json {
                return print_json(&tags);
            }
            for t in &tags {
                println!("{:>6}  {}", t.count, t.tag);
            }
            Ok(())
        }
        Commands::Ratio { community, selection, criteria_dir } => {
            let (key, mode) = clustered_key(&db, &engine, &settings, &selection)?;
            let dir = criteria_dir.unwrap_or_else(|| settings.criteria_dir());
            let criteria = settings::load_matches_criteria(&dir, &selection.files)?;
            let (matching, non_matching) =
                CommunityAnalyzer::new(&db, &engine).matching_entity_ratio(&criteria, community, &key, mode)?;
            if json {
                return print_json(&serde_json::json!({ "matching": matching, "nonMatching": non_matching }));
            }
            println!("matching      {:.3}", matching);
            println!("non-matching  {:.3}", non_matching);
            Ok(())
        }
        Commands::Runs => {
            let runs = db.clustering_runs()?;
            if json {
                return print_json(&runs);
            }
            for run in &runs {
                let when = chrono::DateTime::from_timestamp_millis(run.created_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{} {} {} {} communities / {} nodes",
                    &run.id[..8.min(run.id.len())],
                    when,
                    run.cluster_key,
                    run.communities,
                    run.nodes
                );
            }
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn handle_files(db: &Database, json: bool) -> Result<()> {
    let files = db.list_files()?;
    if json {
        let mut rows = Vec::with_capacity(files.len());
        for f in &files {
            rows.push(serde_json::json!({ "filename": f, "articles": db.count_articles(f)? }));
        }
        return print_json(&rows);
    }
    for f in &files {
        println!("{:>6}  {}", db.count_articles(f)?, f);
    }
    Ok(())
}

fn handle_load(
    db: &Database,
    settings: &Settings,
    path: PathBuf,
    criteria_dir: Option<PathBuf>,
    gazetteer: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| AnalysisError::config(format!("Not a file: {}", path.display())))?;

    // Criteria are optional at load time; they only drive the missing-type report
    let dir = criteria_dir.unwrap_or_else(|| path.parent().map(PathBuf::from).unwrap_or_else(|| settings.criteria_dir()));
    let criteria = settings::find_file_criteria(&dir, &filename)?;

    let extractor = match gazetteer {
        Some(p) => Some(GazetteerExtractor::from_toml_str(&fs::read_to_string(p)?)?),
        None => None,
    };
    let extractor_ref = extractor.as_ref().map(|e| e as &dyn EntityExtractor);

    let report = Loader::new(db).load_file(&path, criteria.as_ref(), extractor_ref)?;
    if json {
        return print_json(&report);
    }
    println!(
        "Loaded {}: {} documents, {} entities, {} links ({} cross-file), {} entity links",
        report.filename,
        report.documents,
        report.entities,
        report.similarity_links + report.cross_links,
        report.cross_links,
        report.entity_links
    );
    if !report.missing_types.is_empty() {
        println!("Entity types missing from criteria: {}", report.missing_types.join(", "));
    }
    Ok(())
}

fn ensure_clustered(
    db: &Database,
    engine: &InMemoryGraphEngine,
    settings: &Settings,
    selection: &Selection,
) -> Result<ClusteringOutcome> {
    let mode = selection.mode()?;
    let orchestrator = ClusteringOrchestrator::new(db, engine, settings.leiden.clone());
    orchestrator.run(&mut AnalysisSession::new(), &selection.files, mode)
}

/// Cluster if needed and return the key the statistics are read under
fn clustered_key(
    db: &Database,
    engine: &InMemoryGraphEngine,
    settings: &Settings,
    selection: &Selection,
) -> Result<(ClusterKey, AnalysisMode)> {
    let mode = selection.mode()?;
    let outcome = ensure_clustered(db, engine, settings, selection)?;
    Ok((outcome.key, mode))
}
