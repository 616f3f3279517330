use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use log::{debug, error, info};

use super::models::{
    ClusteringRun, CommunityAssignment, Document, Entity, EntityLink, EntityProfile, NodeKind,
    SimilarityLink,
};
use crate::error::{AnalysisError, Result};
use crate::projection::DistanceMetric;

/// Which stored articles the targets of a batch of similarity links live in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkScope {
    /// Both ends were loaded from the same file
    SameFile,
    /// Targets are previously stored articles from any other file
    OtherFiles,
}

pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(&path)?;
        let db = Database { conn: Mutex::new(conn), path: path_str };
        db.init()?;
        db.verify_connectivity();
        Ok(db)
    }

    pub fn get_path(&self) -> String {
        self.path.clone()
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn: Mutex::new(conn), path: ":memory:".to_string() };
        db.init()?;
        Ok(db)
    }

    /// Log (but don't fail on) an unusable store; operations will error when invoked.
    pub fn verify_connectivity(&self) -> bool {
        let check = self.conn.lock().map_err(|_| "connection lock poisoned".to_string()).and_then(|conn| {
            conn.query_row("SELECT COUNT(*) FROM articles", [], |row| row.get::<_, i64>(0))
                .map_err(|e| e.to_string())
        });
        match check {
            Ok(articles) => {
                info!("[Database] Connected to {} ({} articles)", self.path, articles);
                true
            }
            Err(e) => {
                error!("[Database] Connection check failed for {}: {}", self.path, e);
                false
            }
        }
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock()?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                filename TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                lead_content TEXT NOT NULL,
                recipe_label TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',  -- JSON array, order preserved
                UNIQUE (url, filename)
            );

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                UNIQUE (name, type)
            );

            -- entity -> article usage
            CREATE TABLE IF NOT EXISTS used_in (
                entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                count INTEGER NOT NULL,
                PRIMARY KEY (entity_id, article_id)
            );

            CREATE TABLE IF NOT EXISTS similarity (
                source_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                target_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                cosinus REAL NOT NULL,
                jaccard REAL NOT NULL,
                PRIMARY KEY (source_id, target_id),
                CHECK (source_id < target_id)
            );

            -- entity <-> entity co-occurrence, one row per contributing file
            CREATE TABLE IF NOT EXISTS appearance (
                entity1_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                entity2_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                count REAL NOT NULL,
                PRIMARY KEY (entity1_id, entity2_id, filename),
                CHECK (entity1_id < entity2_id)
            );

            -- community ids written under an externally chosen key
            CREATE TABLE IF NOT EXISTS community_labels (
                cluster_key TEXT NOT NULL,
                node_kind TEXT NOT NULL,
                node_id INTEGER NOT NULL,
                community_id INTEGER NOT NULL,
                PRIMARY KEY (cluster_key, node_kind, node_id)
            );

            CREATE TABLE IF NOT EXISTS clustering_runs (
                id TEXT PRIMARY KEY,
                cluster_key TEXT NOT NULL,
                node_kind TEXT NOT NULL,
                files TEXT NOT NULL,  -- JSON array of the selection
                communities INTEGER NOT NULL,
                nodes INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_articles_filename ON articles(filename);
            CREATE INDEX IF NOT EXISTS idx_used_in_article ON used_in(article_id);
            CREATE INDEX IF NOT EXISTS idx_similarity_target ON similarity(target_id);
            CREATE INDEX IF NOT EXISTS idx_appearance_filename ON appearance(filename);
            CREATE INDEX IF NOT EXISTS idx_labels_community ON community_labels(cluster_key, node_kind, community_id);
            "
        )?;

        Ok(())
    }

    // ==================== Files ====================

    pub fn list_files(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT filename FROM articles ORDER BY filename")?;
        let files = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(files)
    }

    pub fn count_articles(&self, filename: &str) -> Result<usize> {
        let conn = self.conn.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM articles WHERE filename = ?1",
            params![filename],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Remove a file's articles with their edges, co-occurrence counts and any
    /// clustering that included the file. Entities left unused go too.
    pub fn delete_file(&self, filename: &str) -> Result<usize> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;

        let dropped_keys = invalidate_clusterings_for_file(&tx, filename)?;
        tx.execute("DELETE FROM appearance WHERE filename = ?1", params![filename])?;
        let deleted = tx.execute("DELETE FROM articles WHERE filename = ?1", params![filename])?;
        tx.execute(
            "DELETE FROM entities WHERE id NOT IN (SELECT DISTINCT entity_id FROM used_in)",
            [],
        )?;
        tx.commit()?;

        info!(
            "[Database] Deleted {} articles from {} ({} clusterings invalidated)",
            deleted, filename, dropped_keys
        );
        Ok(deleted)
    }

    // ==================== Loading ====================

    /// Upsert articles, their entities and usage counts in one transaction
    pub fn load_documents(&self, filename: &str, docs: &[Document]) -> Result<usize> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        {
            let mut upsert_article = tx.prepare(
                "INSERT INTO articles (url, filename, title, content, lead_content, recipe_label, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(url, filename) DO UPDATE SET
                    title = excluded.title,
                    content = excluded.content,
                    lead_content = excluded.lead_content,
                    recipe_label = excluded.recipe_label,
                    tags = excluded.tags
                 RETURNING id",
            )?;
            let mut upsert_entity = tx.prepare(
                "INSERT INTO entities (name, type) VALUES (?1, ?2)
                 ON CONFLICT(name, type) DO UPDATE SET name = excluded.name
                 RETURNING id",
            )?;
            let mut clear_usage = tx.prepare("DELETE FROM used_in WHERE article_id = ?1")?;
            let mut insert_usage = tx.prepare(
                "INSERT INTO used_in (entity_id, article_id, count) VALUES (?1, ?2, ?3)",
            )?;

            for doc in docs {
                let tags = serde_json::to_string(&doc.tags)?;
                let article_id: i64 = upsert_article.query_row(
                    params![doc.url, filename, doc.title, doc.content, doc.lead_content, doc.recipe_label, tags],
                    |row| row.get(0),
                )?;
                clear_usage.execute(params![article_id])?;

                for (entity, count) in &doc.entities {
                    let entity_id: i64 = upsert_entity
                        .query_row(params![entity.name, entity.entity_type], |row| row.get(0))?;
                    insert_usage.execute(params![entity_id, article_id, count])?;
                }
            }
        }
        tx.commit()?;

        debug!("[Database] Loaded {} documents into {}", docs.len(), filename);
        Ok(docs.len())
    }

    pub fn insert_similarity_links(
        &self,
        filename: &str,
        links: &[SimilarityLink],
        scope: LinkScope,
    ) -> Result<usize> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut source_stmt =
                tx.prepare("SELECT id FROM articles WHERE url = ?1 AND filename = ?2")?;
            let mut target_stmt = tx.prepare(match scope {
                LinkScope::SameFile => "SELECT id FROM articles WHERE url = ?1 AND filename = ?2",
                LinkScope::OtherFiles => "SELECT id FROM articles WHERE url = ?1 AND filename <> ?2",
            })?;
            let mut insert = tx.prepare(
                "INSERT INTO similarity (source_id, target_id, cosinus, jaccard) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_id, target_id) DO UPDATE SET
                    cosinus = excluded.cosinus,
                    jaccard = excluded.jaccard",
            )?;

            for link in links {
                let sources = source_stmt
                    .query_map(params![link.url1, filename], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let targets = target_stmt
                    .query_map(params![link.url2, filename], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                for &source in &sources {
                    for &target in &targets {
                        if source == target {
                            continue;
                        }
                        let (lo, hi) = if source < target { (source, target) } else { (target, source) };
                        written += insert.execute(params![lo, hi, link.cosinus, link.jaccard])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Store a file's co-occurrence weights under that file's name
    pub fn insert_entity_links(&self, filename: &str, links: &[EntityLink]) -> Result<usize> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut entity_stmt = tx.prepare("SELECT id FROM entities WHERE name = ?1 AND type = ?2")?;
            let mut insert = tx.prepare(
                "INSERT INTO appearance (entity1_id, entity2_id, filename, count) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity1_id, entity2_id, filename) DO UPDATE SET count = excluded.count",
            )?;

            for link in links {
                let first: Option<i64> = entity_stmt
                    .query_row(params![link.entity1.name, link.entity1.entity_type], |row| row.get(0))
                    .optional()?;
                let second: Option<i64> = entity_stmt
                    .query_row(params![link.entity2.name, link.entity2.entity_type], |row| row.get(0))
                    .optional()?;

                if let (Some(a), Some(b)) = (first, second) {
                    if a == b {
                        continue;
                    }
                    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                    written += insert.execute(params![lo, hi, filename, link.count])?;
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    // ==================== Lookups ====================

    /// Entity profiles of stored articles outside `exclude_filename`, keyed by URL.
    /// When a URL is stored under several files the oldest article wins.
    pub fn document_profiles(&self, exclude_filename: &str) -> Result<HashMap<String, EntityProfile>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.url, e.name, e.type, u.count
             FROM articles a
             JOIN used_in u ON u.article_id = a.id
             JOIN entities e ON e.id = u.entity_id
             WHERE a.filename <> ?1
             ORDER BY a.id",
        )?;
        let rows = stmt.query_map(params![exclude_filename], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
            ))
        })?;

        let mut owner: HashMap<String, i64> = HashMap::new();
        let mut profiles: HashMap<String, EntityProfile> = HashMap::new();
        for row in rows {
            let (article_id, url, name, entity_type, count) = row?;
            let owner_id = *owner.entry(url.clone()).or_insert(article_id);
            if owner_id != article_id {
                continue;
            }
            profiles
                .entry(url)
                .or_default()
                .insert(Entity { name, entity_type }, count);
        }
        Ok(profiles)
    }

    /// Distinct entity names used in the selected files
    pub fn entity_names(&self, files: &[String]) -> Result<Vec<String>> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT DISTINCT e.name
             FROM entities e
             JOIN used_in u ON u.entity_id = e.id
             JOIN articles a ON a.id = u.article_id
             WHERE a.filename IN ({})
             ORDER BY e.name",
            in_list(1, files.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let names = stmt
            .query_map(params_from_iter(text_values(files)), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Distinct entity types used in the selected files
    pub fn entity_types(&self, files: &[String]) -> Result<BTreeSet<String>> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT DISTINCT e.type
             FROM entities e
             JOIN used_in u ON u.entity_id = e.id
             JOIN articles a ON a.id = u.article_id
             WHERE a.filename IN ({})",
            in_list(1, files.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let types = stmt
            .query_map(params_from_iter(text_values(files)), |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(types)
    }

    /// Summed usage of every other entity sharing an article with `entity_name`
    pub fn linked_entities(&self, entity_name: &str, files: &[String]) -> Result<HashMap<Entity, u64>> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT e1.name, e1.type, SUM(u1.count)
             FROM entities e
             JOIN used_in u ON u.entity_id = e.id
             JOIN articles a ON a.id = u.article_id
             JOIN used_in u1 ON u1.article_id = a.id
             JOIN entities e1 ON e1.id = u1.entity_id
             WHERE e.name = ?1 AND e1.name <> e.name AND a.filename IN ({})
             GROUP BY e1.id",
            in_list(2, files.len())
        );
        let mut values = vec![Value::Text(entity_name.to_string())];
        values.extend(text_values(files));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                Entity { name: row.get(0)?, entity_type: row.get(1)? },
                row.get::<_, i64>(2)? as u64,
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    // ==================== Projection sources ====================

    pub fn article_ids(&self, files: &[String]) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM articles WHERE filename IN ({}) ORDER BY id",
            in_list(1, files.len())
        );
        self.query_ids(&sql, text_values(files))
    }

    pub fn entity_ids(&self, files: &[String]) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT DISTINCT u.entity_id
             FROM used_in u JOIN articles a ON a.id = u.article_id
             WHERE a.filename IN ({})
             ORDER BY u.entity_id",
            in_list(1, files.len())
        );
        self.query_ids(&sql, text_values(files))
    }

    /// Similarity edges with both ends inside the selection, weighted by `metric`
    pub fn similarity_edges(&self, files: &[String], metric: DistanceMetric) -> Result<Vec<(i64, i64, f64)>> {
        let n = files.len();
        let sql = format!(
            "SELECT s.source_id, s.target_id, s.{metric}
             FROM similarity s
             JOIN articles src ON src.id = s.source_id
             JOIN articles tgt ON tgt.id = s.target_id
             WHERE src.filename IN ({src}) AND tgt.filename IN ({tgt})
               AND s.source_id < s.target_id
             ORDER BY s.source_id, s.target_id",
            metric = metric.column(),
            src = in_list(1, n),
            tgt = in_list(n + 1, n),
        );
        let mut values = text_values(files);
        values.extend(text_values(files));
        self.query_edges(&sql, values)
    }

    /// Co-occurrence edges weighted by the per-file counts summed over the selection
    pub fn appearance_edges(&self, files: &[String]) -> Result<Vec<(i64, i64, f64)>> {
        let sql = format!(
            "SELECT entity1_id, entity2_id, SUM(COALESCE(count, 0)) AS total
             FROM appearance
             WHERE filename IN ({})
             GROUP BY entity1_id, entity2_id
             HAVING total > 0
             ORDER BY entity1_id, entity2_id",
            in_list(1, files.len())
        );
        self.query_edges(&sql, text_values(files))
    }

    /// Articles in the selection carrying a label under `key`, with that label
    pub fn labelled_article_nodes(&self, files: &[String], key: &str) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT a.id, l.community_id
             FROM articles a
             JOIN community_labels l
               ON l.node_id = a.id AND l.node_kind = 'article' AND l.cluster_key = ?1
             WHERE a.filename IN ({})
             ORDER BY a.id",
            in_list(2, files.len())
        );
        self.query_pairs(&sql, keyed_values(key, files))
    }

    pub fn labelled_entity_nodes(&self, files: &[String], key: &str) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT DISTINCT l.node_id, l.community_id
             FROM community_labels l
             JOIN used_in u ON u.entity_id = l.node_id
             JOIN articles a ON a.id = u.article_id
             WHERE l.node_kind = 'entity' AND l.cluster_key = ?1 AND a.filename IN ({})
             ORDER BY l.node_id",
            in_list(2, files.len())
        );
        self.query_pairs(&sql, keyed_values(key, files))
    }

    // ==================== Community labels ====================

    pub fn has_community_labels(&self, key: &str, kind: NodeKind) -> Result<bool> {
        let conn = self.conn.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM community_labels WHERE cluster_key = ?1 AND node_kind = ?2 LIMIT 1",
                params![key, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Replace every label stored under `key` for this node kind
    pub fn write_community_labels(
        &self,
        key: &str,
        kind: NodeKind,
        assignments: &[CommunityAssignment],
    ) -> Result<usize> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM community_labels WHERE cluster_key = ?1 AND node_kind = ?2",
            params![key, kind.as_str()],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO community_labels (cluster_key, node_kind, node_id, community_id)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for a in assignments {
                insert.execute(params![key, kind.as_str(), a.node_id, a.community_id])?;
            }
        }
        tx.commit()?;
        Ok(assignments.len())
    }

    pub fn community_nodes(&self, key: &str, kind: NodeKind) -> Result<Vec<CommunityAssignment>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, community_id FROM community_labels
             WHERE cluster_key = ?1 AND node_kind = ?2
             ORDER BY node_id",
        )?;
        let rows = stmt
            .query_map(params![key, kind.as_str()], |row| {
                Ok(CommunityAssignment { node_id: row.get(0)?, community_id: row.get(1)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// (community_id, node count), largest first
    pub fn cluster_sizes(&self, key: &str, kind: NodeKind) -> Result<Vec<(i64, usize)>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT community_id, COUNT(*) AS n FROM community_labels
             WHERE cluster_key = ?1 AND node_kind = ?2
             GROUP BY community_id
             ORDER BY n DESC, community_id ASC",
        )?;
        let rows = stmt
            .query_map(params![key, kind.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_clustering_run(
        &self,
        key: &str,
        kind: NodeKind,
        files: &[String],
        communities: usize,
        nodes: usize,
    ) -> Result<ClusteringRun> {
        let run = ClusteringRun {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_key: key.to_string(),
            node_kind: kind,
            communities,
            nodes,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO clustering_runs (id, cluster_key, node_kind, files, communities, nodes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id,
                run.cluster_key,
                kind.as_str(),
                serde_json::to_string(files)?,
                run.communities as i64,
                run.nodes as i64,
                run.created_at,
            ],
        )?;
        Ok(run)
    }

    /// Most recent first
    pub fn clustering_runs(&self) -> Result<Vec<ClusteringRun>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, cluster_key, node_kind, communities, nodes, created_at
             FROM clustering_runs ORDER BY created_at DESC, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(2)?;
                Ok(ClusteringRun {
                    id: row.get(0)?,
                    cluster_key: row.get(1)?,
                    node_kind: NodeKind::from_str(&kind).unwrap_or(NodeKind::Article),
                    communities: row.get::<_, i64>(3)? as usize,
                    nodes: row.get::<_, i64>(4)? as usize,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ==================== Community statistics ====================

    /// (entity, summed usage within the selected files) for the entities of one community
    pub fn community_entity_counts(
        &self,
        community_id: i64,
        files: &[String],
        key: &str,
        kind: NodeKind,
    ) -> Result<Vec<(Entity, u64)>> {
        let label_join = match kind {
            NodeKind::Article => "l.node_id = a.id AND l.node_kind = 'article'",
            NodeKind::Entity => "l.node_id = e.id AND l.node_kind = 'entity'",
        };
        let sql = format!(
            "SELECT e.name, e.type, SUM(u.count)
             FROM used_in u
             JOIN articles a ON a.id = u.article_id
             JOIN entities e ON e.id = u.entity_id
             JOIN community_labels l ON {join}
             WHERE l.cluster_key = ?1 AND l.community_id = ?2 AND a.filename IN ({files})
             GROUP BY e.id",
            join = label_join,
            files = in_list(3, files.len()),
        );
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(community_values(key, community_id, files)), |row| {
                Ok((
                    Entity { name: row.get(0)?, entity_type: row.get(1)? },
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Tag lists of the selected articles belonging to (or reachable from) one community
    pub fn community_article_tags(
        &self,
        community_id: i64,
        files: &[String],
        key: &str,
        kind: NodeKind,
    ) -> Result<Vec<Vec<String>>> {
        let sql = match kind {
            NodeKind::Article => format!(
                "SELECT a.tags
                 FROM community_labels l
                 JOIN articles a ON a.id = l.node_id
                 WHERE l.cluster_key = ?1 AND l.node_kind = 'article' AND l.community_id = ?2
                   AND a.filename IN ({})",
                in_list(3, files.len())
            ),
            NodeKind::Entity => format!(
                "SELECT a.tags FROM articles a
                 WHERE a.filename IN ({})
                   AND a.id IN (
                    SELECT DISTINCT u.article_id
                    FROM community_labels l
                    JOIN used_in u ON u.entity_id = l.node_id
                    WHERE l.cluster_key = ?1 AND l.node_kind = 'entity' AND l.community_id = ?2
                 )",
                in_list(3, files.len())
            ),
        };
        let raw = {
            let conn = self.conn.lock()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(community_values(key, community_id, files)), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        raw.iter()
            .map(|tags| serde_json::from_str::<Vec<String>>(tags).map_err(AnalysisError::from))
            .collect()
    }

    /// Per article in the selection: its tags and the communities it is tied to.
    /// Article mode yields the article's own label (if any); entity mode yields
    /// the distinct labels of the entities used in it, and skips articles
    /// without entities.
    pub fn tag_community_rows(&self, files: &[String], key: &str, kind: NodeKind) -> Result<Vec<(Vec<String>, Vec<i64>)>> {
        let sql = match kind {
            NodeKind::Article => format!(
                "SELECT a.id, a.tags, l.community_id
                 FROM articles a
                 LEFT JOIN community_labels l
                   ON l.node_id = a.id AND l.node_kind = 'article' AND l.cluster_key = ?1
                 WHERE a.filename IN ({})
                 ORDER BY a.id",
                in_list(2, files.len())
            ),
            NodeKind::Entity => format!(
                "SELECT a.id, a.tags, l.community_id
                 FROM articles a
                 JOIN used_in u ON u.article_id = a.id
                 LEFT JOIN community_labels l
                   ON l.node_id = u.entity_id AND l.node_kind = 'entity' AND l.cluster_key = ?1
                 WHERE a.filename IN ({})
                 ORDER BY a.id",
                in_list(2, files.len())
            ),
        };

        let raw = {
            let conn = self.conn.lock()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(keyed_values(key, files)), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<i64>>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        // Rows arrive grouped by article id
        let mut out: Vec<(Vec<String>, Vec<i64>)> = Vec::new();
        let mut current: Option<i64> = None;
        for (article_id, tags, community) in raw {
            if current != Some(article_id) {
                current = Some(article_id);
                out.push((serde_json::from_str(&tags)?, Vec::new()));
            }
            if let (Some(c), Some(last)) = (community, out.last_mut()) {
                if !last.1.contains(&c) {
                    last.1.push(c);
                }
            }
        }
        Ok(out)
    }

    /// Summed usage counts, within one file, of community entities whose type is in `types`
    pub fn typed_entity_occurrences(
        &self,
        community_id: i64,
        key: &str,
        kind: NodeKind,
        filename: &str,
        types: &HashSet<String>,
    ) -> Result<u64> {
        if types.is_empty() {
            return Ok(0);
        }
        let mut types: Vec<String> = types.iter().cloned().collect();
        types.sort();

        let join = match kind {
            NodeKind::Article => "l.node_id = a.id AND l.node_kind = 'article'",
            NodeKind::Entity => "l.node_id = e.id AND l.node_kind = 'entity'",
        };
        let sql = format!(
            "SELECT COALESCE(SUM(u.count), 0)
             FROM used_in u
             JOIN articles a ON a.id = u.article_id
             JOIN entities e ON e.id = u.entity_id
             JOIN community_labels l ON {join}
             WHERE l.cluster_key = ?1 AND l.community_id = ?2 AND a.filename = ?3
               AND e.type IN ({types})",
            join = join,
            types = in_list(4, types.len()),
        );
        let mut values = vec![
            Value::Text(key.to_string()),
            Value::Integer(community_id),
            Value::Text(filename.to_string()),
        ];
        values.extend(text_values(&types));

        let conn = self.conn.lock()?;
        let total: i64 = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(total as u64)
    }

    // ==================== Helpers ====================

    fn query_ids(&self, sql: &str, values: Vec<Value>) -> Result<Vec<i64>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn query_pairs(&self, sql: &str, values: Vec<Value>) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let pairs = stmt
            .query_map(params_from_iter(values), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(i64, i64)>>>()?;
        Ok(pairs)
    }

    fn query_edges(&self, sql: &str, values: Vec<Value>) -> Result<Vec<(i64, i64, f64)>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let edges = stmt
            .query_map(params_from_iter(values), |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<(i64, i64, f64)>>>()?;
        Ok(edges)
    }
}

/// Drop labels and run records of every clustering whose selection included `filename`
fn invalidate_clusterings_for_file(tx: &Transaction, filename: &str) -> Result<usize> {
    let runs = {
        let mut stmt = tx.prepare("SELECT cluster_key, files FROM clustering_runs")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut keys: BTreeSet<String> = BTreeSet::new();
    for (key, files) in runs {
        let files: Vec<String> = serde_json::from_str(&files)?;
        if files.iter().any(|f| f == filename) {
            keys.insert(key);
        }
    }

    for key in &keys {
        tx.execute("DELETE FROM community_labels WHERE cluster_key = ?1", params![key])?;
        tx.execute("DELETE FROM clustering_runs WHERE cluster_key = ?1", params![key])?;
    }
    Ok(keys.len())
}

/// `?start, ?start+1, ...` for a dynamic IN list
fn in_list(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn text_values(items: &[String]) -> Vec<Value> {
    items.iter().map(|s| Value::Text(s.clone())).collect()
}

fn community_values(key: &str, community_id: i64, files: &[String]) -> Vec<Value> {
    let mut values = vec![Value::Text(key.to_string()), Value::Integer(community_id)];
    values.extend(text_values(files));
    values
}

fn keyed_values(key: &str, files: &[String]) -> Vec<Value> {
    let mut values = vec![Value::Text(key.to_string())];
    values.extend(text_values(files));
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, tags: &[&str], entities: &[(&str, &str, u32)]) -> Document {
        let mut d = Document {
            url: url.to_string(),
            title: format!("Title {}", url),
            content: String::new(),
            lead_content: String::new(),
            recipe_label: "recipes".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            entities: EntityProfile::new(),
        };
        for (name, t, c) in entities {
            d.add_entity(Entity::new(name, t), *c);
        }
        d
    }

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_and_list_files() {
        let db = Database::in_memory().unwrap();
        db.load_documents("a.json", &[doc("u1", &["soup"], &[("salt", "ing", 2)])]).unwrap();
        db.load_documents("b.json", &[doc("u2", &[], &[("salt", "ing", 1)])]).unwrap();

        assert_eq!(db.list_files().unwrap(), files(&["a.json", "b.json"]));
        assert_eq!(db.count_articles("a.json").unwrap(), 1);
        assert_eq!(db.entity_names(&files(&["a.json", "b.json"])).unwrap(), vec!["salt".to_string()]);
    }

    #[test]
    fn test_reload_replaces_usage() {
        let db = Database::in_memory().unwrap();
        db.load_documents("a.json", &[doc("u1", &[], &[("salt", "ing", 2), ("egg", "ing", 1)])]).unwrap();
        db.load_documents("a.json", &[doc("u1", &[], &[("salt", "ing", 5)])]).unwrap();

        let profiles = db.document_profiles("other.json").unwrap();
        let profile = &profiles["u1"];
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[&Entity::new("salt", "ing")], 5);
    }

    #[test]
    fn test_similarity_edges_respect_selection_and_order() {
        let db = Database::in_memory().unwrap();
        db.load_documents("a.json", &[doc("u1", &[], &[]), doc("u2", &[], &[])]).unwrap();
        db.load_documents("b.json", &[doc("u3", &[], &[])]).unwrap();

        let within = vec![SimilarityLink { url1: "u2".into(), url2: "u1".into(), cosinus: 0.5, jaccard: 0.25 }];
        assert_eq!(db.insert_similarity_links("a.json", &within, LinkScope::SameFile).unwrap(), 1);
        let cross = vec![SimilarityLink { url1: "u3".into(), url2: "u1".into(), cosinus: 0.9, jaccard: 0.4 }];
        assert_eq!(db.insert_similarity_links("b.json", &cross, LinkScope::OtherFiles).unwrap(), 1);

        let only_a = db.similarity_edges(&files(&["a.json"]), DistanceMetric::Jaccard).unwrap();
        assert_eq!(only_a.len(), 1);
        assert!(only_a[0].0 < only_a[0].1);
        assert!((only_a[0].2 - 0.25).abs() < 1e-12);

        let both = db.similarity_edges(&files(&["a.json", "b.json"]), DistanceMetric::Cosine).unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn test_appearance_edges_sum_selected_files() {
        let db = Database::in_memory().unwrap();
        db.load_documents("a.json", &[doc("u1", &[], &[("salt", "ing", 1), ("egg", "ing", 1)])]).unwrap();
        db.load_documents("b.json", &[doc("u2", &[], &[("salt", "ing", 1), ("egg", "ing", 1)])]).unwrap();

        let link = EntityLink { entity1: Entity::new("egg", "ing"), entity2: Entity::new("salt", "ing"), count: 1.5 };
        db.insert_entity_links("a.json", &[link.clone()]).unwrap();
        db.insert_entity_links("b.json", &[EntityLink { count: 2.0, ..link }]).unwrap();

        let one = db.appearance_edges(&files(&["a.json"])).unwrap();
        assert_eq!(one.len(), 1);
        assert!((one[0].2 - 1.5).abs() < 1e-12);

        let both = db.appearance_edges(&files(&["a.json", "b.json"])).unwrap();
        assert!((both[0].2 - 3.5).abs() < 1e-12);

        assert!(db.appearance_edges(&files(&["c.json"])).unwrap().is_empty());
    }

    #[test]
    fn test_labels_round_trip_and_sizes() {
        let db = Database::in_memory().unwrap();
        let assignments = vec![
            CommunityAssignment { node_id: 1, community_id: 7 },
            CommunityAssignment { node_id: 2, community_id: 7 },
            CommunityAssignment { node_id: 3, community_id: 2 },
        ];
        assert!(!db.has_community_labels("k", NodeKind::Article).unwrap());
        db.write_community_labels("k", NodeKind::Article, &assignments).unwrap();
        assert!(db.has_community_labels("k", NodeKind::Article).unwrap());
        assert!(!db.has_community_labels("k", NodeKind::Entity).unwrap());

        assert_eq!(db.community_nodes("k", NodeKind::Article).unwrap(), assignments);
        assert_eq!(db.cluster_sizes("k", NodeKind::Article).unwrap(), vec![(7, 2), (2, 1)]);
    }

    #[test]
    fn test_delete_file_invalidates_clusterings() {
        let db = Database::in_memory().unwrap();
        db.load_documents("a.json", &[doc("u1", &[], &[("salt", "ing", 1)])]).unwrap();
        db.load_documents("b.json", &[doc("u2", &[], &[("egg", "ing", 1)])]).unwrap();
        let ids = db.article_ids(&files(&["a.json", "b.json"])).unwrap();
        let labels: Vec<_> = ids.iter().map(|&id| CommunityAssignment { node_id: id, community_id: 0 }).collect();
        db.write_community_labels("k", NodeKind::Article, &labels).unwrap();
        db.record_clustering_run("k", NodeKind::Article, &files(&["a.json", "b.json"]), 1, 2).unwrap();

        assert_eq!(db.delete_file("a.json").unwrap(), 1);
        assert!(!db.has_community_labels("k", NodeKind::Article).unwrap());
        assert!(db.clustering_runs().unwrap().is_empty());
        assert_eq!(db.list_files().unwrap(), files(&["b.json"]));
        // salt was only used by the deleted file
        assert_eq!(db.entity_names(&files(&["a.json", "b.json"])).unwrap(), vec!["egg".to_string()]);
    }

    #[test]
    fn test_linked_entities() {
        let db = Database::in_memory().unwrap();
        db.load_documents(
            "a.json",
            &[
                doc("u1", &[], &[("salt", "ing", 1), ("egg", "ing", 2)]),
                doc("u2", &[], &[("salt", "ing", 1), ("egg", "ing", 3), ("paris", "loc", 1)]),
                doc("u3", &[], &[("paris", "loc", 4)]),
            ],
        )
        .unwrap();

        let linked = db.linked_entities("salt", &files(&["a.json"])).unwrap();
        assert_eq!(linked[&Entity::new("egg", "ing")], 5);
        assert_eq!(linked[&Entity::new("paris", "loc")], 1);
        assert!(!linked.contains_key(&Entity::new("salt", "ing")));
    }

    #[test]
    fn test_entity_community_stats_stay_in_selection() {
        let db = Database::in_memory().unwrap();
        db.load_documents("a.json", &[doc("u1", &["soup"], &[("salt", "ing", 1)])]).unwrap();
        db.load_documents("b.json", &[doc("u2", &["cake"], &[("salt", "ing", 100)])]).unwrap();

        let selection = files(&["a.json"]);
        let ids = db.entity_ids(&selection).unwrap();
        let labels: Vec<_> = ids.iter().map(|&id| CommunityAssignment { node_id: id, community_id: 0 }).collect();
        db.write_community_labels("k", NodeKind::Entity, &labels).unwrap();

        let counts = db.community_entity_counts(0, &selection, "k", NodeKind::Entity).unwrap();
        assert_eq!(counts, vec![(Entity::new("salt", "ing"), 1)]);

        let tags = db.community_article_tags(0, &selection, "k", NodeKind::Entity).unwrap();
        assert_eq!(tags, vec![vec!["soup".to_string()]]);

        let both = files(&["a.json", "b.json"]);
        assert_eq!(db.community_entity_counts(0, &both, "k", NodeKind::Entity).unwrap()[0].1, 101);
    }

    #[test]
    fn test_entity_tag_rows_skip_articles_without_entities() {
        let db = Database::in_memory().unwrap();
        db.load_documents(
            "a.json",
            &[doc("u1", &["soup"], &[("salt", "ing", 1)]), doc("u2", &["soup"], &[])],
        )
        .unwrap();
        let ids = db.entity_ids(&files(&["a.json"])).unwrap();
        db.write_community_labels("k", NodeKind::Entity, &[CommunityAssignment { node_id: ids[0], community_id: 3 }])
            .unwrap();

        let rows = db.tag_community_rows(&files(&["a.json"]), "k", NodeKind::Entity).unwrap();
        assert_eq!(rows, vec![(vec!["soup".to_string()], vec![3])]);
    }
}
