use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result};
use std::path::Path;
use std::sync::Mutex;

use super::models::{ClusterJob, ClusterNode, JobStatus, Point};
use crate::config::PointFilter;
use crate::embedding::{self, cosine_distance};

/// Single source of truth for points, clusters, memberships and jobs.
///
/// One connection behind a mutex, the same shape the serving layer uses:
/// builds are serialized per job by the worker pool, so contention stays low.
pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

/// Insert payload for one tree node. Everything except `visible` (always
/// false at creation) and `created_at` (stamped here).
pub struct NewCluster<'a> {
    pub parent_cluster_id: Option<i64>,
    pub title: Option<&'a str>,
    pub summary: Option<&'a str>,
    pub depth: u32,
    pub filters: &'a str,
    pub config: &'a str,
    pub job_id: i64,
    pub centre: Option<&'a [u8]>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(&path)?;
        let db = Database {
            conn: Mutex::new(conn),
            path: path_str,
        };
        db.init()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Mutex::new(conn),
            path: ":memory:".to_string(),
        };
        db.init()?;
        Ok(db)
    }

    pub fn get_path(&self) -> String {
        self.path.clone()
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        // Semantic ordering happens in SQL: cosine distance between two
        // little-endian f32 blobs, NULL when either side is NULL.
        conn.create_scalar_function(
            "vec_distance",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let a: Option<Vec<u8>> = ctx.get(0)?;
                let b: Option<Vec<u8>> = ctx.get(1)?;
                Ok(match (a, b) {
                    (Some(a), Some(b)) => {
                        let va = embedding::blob_to_vec(&a);
                        let vb = embedding::blob_to_vec(&b);
                        Some(cosine_distance(&va, &vb) as f64)
                    }
                    _ => None,
                })
            },
        )?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS points (
                point_id INTEGER PRIMARY KEY,
                text TEXT NOT NULL,
                member_id INTEGER,
                house TEXT,
                date TEXT,                -- YYYY-MM-DD
                embedding BLOB,           -- f32 little-endian
                embedding_f16 BLOB        -- f16 little-endian, the store image
            );

            CREATE TABLE IF NOT EXISTS clusters (
                cluster_id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_cluster_id INTEGER REFERENCES clusters(cluster_id),
                title TEXT,
                summary TEXT,
                depth INTEGER NOT NULL,
                filters TEXT NOT NULL,    -- canonical JSON, shared by the tree
                config TEXT NOT NULL,     -- canonical JSON, shared by the tree
                job_id INTEGER NOT NULL,
                visible INTEGER NOT NULL DEFAULT 0,
                centre BLOB,              -- representative vector, f32 LE
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cluster_points (
                cluster_id INTEGER NOT NULL,
                point_id INTEGER NOT NULL,
                PRIMARY KEY (cluster_id, point_id)
            );

            CREATE TABLE IF NOT EXISTS cluster_jobs (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,
                params TEXT NOT NULL,     -- canonical (filters, config) JSON
                error TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_points_date ON points(date);
            CREATE INDEX IF NOT EXISTS idx_points_member ON points(member_id);
            CREATE INDEX IF NOT EXISTS idx_clusters_job ON clusters(job_id);
            CREATE INDEX IF NOT EXISTS idx_clusters_parent ON clusters(parent_cluster_id);
            CREATE INDEX IF NOT EXISTS idx_cluster_points_point ON cluster_points(point_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON cluster_jobs(status);

            PRAGMA foreign_keys = ON;
            ",
        )?;

        Ok(())
    }

    // ==================== Points ====================

    /// Insert a point. `embedding` is stored both full-precision and as its
    /// f16 image; a point without a vector never reaches a store.
    pub fn insert_point(&self, point: &Point, vector: Option<&[f32]>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let blob = vector.map(embedding::vec_to_blob);
        let blob_f16 = vector.map(embedding::vec_to_f16_blob);
        conn.execute(
            "INSERT INTO points (point_id, text, member_id, house, date, embedding, embedding_f16)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                point.point_id,
                point.text,
                point.member_id,
                point.house,
                point.date,
                blob,
                blob_f16
            ],
        )?;
        Ok(())
    }

    /// WHERE tail + positional params for a filter. Base conditions require
    /// a stored f16 vector and a resolvable attribution.
    fn filter_where(filter: &PointFilter, require_full_vector: bool) -> (String, Vec<Value>) {
        let mut sql =
            String::from(" WHERE p.embedding_f16 IS NOT NULL AND p.member_id IS NOT NULL");
        if require_full_vector {
            sql.push_str(" AND p.embedding IS NOT NULL");
        }
        let mut params: Vec<Value> = Vec::new();

        if let Some(house) = &filter.house {
            sql.push_str(" AND p.house = ?");
            params.push(Value::from(house.clone()));
        }
        if let Some(start) = &filter.start_date {
            sql.push_str(" AND p.date >= ?");
            params.push(Value::from(start.clone()));
        }
        if let Some(end) = &filter.end_date {
            sql.push_str(" AND p.date <= ?");
            params.push(Value::from(end.clone()));
        }
        if let Some(ids) = &filter.member_ids {
            let placeholders = vec!["?"; ids.len()].join(",");
            sql.push_str(&format!(" AND p.member_id IN ({})", placeholders));
            params.extend(ids.iter().map(|id| Value::from(*id)));
        }

        (sql, params)
    }

    pub fn count_candidates(&self, filter: &PointFilter) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let (where_sql, params) = Self::filter_where(filter, false);
        let sql = format!("SELECT COUNT(*) FROM points p{}", where_sql);
        conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
    }

    /// Dimensionality probe: f16 byte length of the first matching vector.
    pub fn candidate_dims(&self, filter: &PointFilter) -> Result<Option<usize>> {
        let conn = self.conn.lock().unwrap();
        let (where_sql, params) = Self::filter_where(filter, false);
        let sql = format!(
            "SELECT length(p.embedding_f16) FROM points p{} ORDER BY p.point_id ASC LIMIT 1",
            where_sql
        );
        let bytes: Option<i64> = conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
            .optional()?;
        Ok(bytes.map(|b| b as usize / 2))
    }

    /// One keyset batch of (point_id, f16 blob) rows after `last_id`,
    /// ascending by point id. Streaming the export in bounded batches keeps
    /// peak memory flat regardless of N.
    pub fn candidates_after(
        &self,
        filter: &PointFilter,
        last_id: i64,
        batch: usize,
    ) -> Result<Vec<(i64, Vec<u8>)>> {
        let conn = self.conn.lock().unwrap();
        let (where_sql, mut params) = Self::filter_where(filter, false);
        let sql = format!(
            "SELECT p.point_id, p.embedding_f16 FROM points p{} AND p.point_id > ? \
             ORDER BY p.point_id ASC LIMIT ?",
            where_sql
        );
        params.push(Value::from(last_id));
        params.push(Value::from(batch as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        rows.collect()
    }

    /// Search-mode variant: also returns the full-precision blob used for
    /// ranking against the query embedding.
    pub fn search_candidates_after(
        &self,
        filter: &PointFilter,
        last_id: i64,
        batch: usize,
    ) -> Result<Vec<(i64, Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock().unwrap();
        let (where_sql, mut params) = Self::filter_where(filter, true);
        let sql = format!(
            "SELECT p.point_id, p.embedding, p.embedding_f16 FROM points p{} AND p.point_id > ? \
             ORDER BY p.point_id ASC LIMIT ?",
            where_sql
        );
        params.push(Value::from(last_id));
        params.push(Value::from(batch as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        rows.collect()
    }

    /// Texts for a bounded id sample (labelling input). Order follows ids.
    pub fn point_texts(&self, ids: &[i64]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT point_id, text FROM points WHERE point_id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<Value> = ids.iter().map(|id| Value::from(*id)).collect();
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut by_id = std::collections::HashMap::new();
        for row in rows {
            let (id, text) = row?;
            by_id.insert(id, text);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    // ==================== Clusters ====================

    pub fn insert_cluster(&self, cluster: &NewCluster) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO clusters
                 (parent_cluster_id, title, summary, depth, filters, config, job_id, visible, centre, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
            params![
                cluster.parent_cluster_id,
                cluster.title,
                cluster.summary,
                cluster.depth,
                cluster.filters,
                cluster.config,
                cluster.job_id,
                cluster.centre,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_cluster_points(&self, cluster_id: i64, point_ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO cluster_points (cluster_id, point_id) VALUES (?1, ?2)",
            )?;
            for point_id in point_ids {
                stmt.execute(params![cluster_id, point_id])?;
            }
        }
        tx.commit()
    }

    fn cluster_from_row(row: &rusqlite::Row) -> Result<ClusterNode> {
        Ok(ClusterNode {
            cluster_id: row.get(0)?,
            parent_cluster_id: row.get(1)?,
            title: row.get(2)?,
            summary: row.get(3)?,
            depth: row.get(4)?,
            filters: row.get(5)?,
            config: row.get(6)?,
            job_id: row.get(7)?,
            visible: row.get::<_, i64>(8)? != 0,
            centre: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    const CLUSTER_COLS: &'static str = "cluster_id, parent_cluster_id, title, summary, depth, \
         filters, config, job_id, visible, centre, created_at";

    /// Read-path lookup: invisible clusters do not exist to callers.
    pub fn get_visible_cluster(&self, cluster_id: i64) -> Result<Option<ClusterNode>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM clusters WHERE cluster_id = ?1 AND visible = 1",
            Self::CLUSTER_COLS
        );
        conn.query_row(&sql, params![cluster_id], Self::cluster_from_row)
            .optional()
    }

    /// Visible children of a node, stable ascending id order.
    pub fn cluster_children(&self, parent_id: i64) -> Result<Vec<ClusterNode>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM clusters WHERE parent_cluster_id = ?1 AND visible = 1 \
             ORDER BY cluster_id ASC",
            Self::CLUSTER_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![parent_id], Self::cluster_from_row)?;
        rows.collect()
    }

    /// Job bookkeeping view: every node the job wrote, hidden or not.
    pub fn clusters_for_job(&self, job_id: i64) -> Result<Vec<ClusterNode>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM clusters WHERE job_id = ?1 ORDER BY cluster_id ASC",
            Self::CLUSTER_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_id], Self::cluster_from_row)?;
        rows.collect()
    }

    pub fn cluster_point_ids(&self, cluster_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT point_id FROM cluster_points WHERE cluster_id = ?1 ORDER BY point_id ASC",
        )?;
        let rows = stmt.query_map(params![cluster_id], |row| row.get(0))?;
        rows.collect()
    }

    pub fn count_cluster_points(&self, cluster_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM cluster_points WHERE cluster_id = ?1",
            params![cluster_id],
            |row| row.get(0),
        )
    }

    // ==================== Pagination queries ====================

    fn point_from_row(row: &rusqlite::Row) -> Result<Point> {
        Ok(Point {
            point_id: row.get(0)?,
            text: row.get(1)?,
            member_id: row.get(2)?,
            house: row.get(3)?,
            date: row.get(4)?,
        })
    }

    /// Chronological page: point id ascending. `before` pages come back
    /// descending (SQL order); the caller re-reverses for presentation.
    pub fn page_points_chrono(
        &self,
        cluster_id: i64,
        limit: i64,
        after_id: Option<i64>,
        before_id: Option<i64>,
    ) -> Result<Vec<Point>> {
        let conn = self.conn.lock().unwrap();
        let base = "SELECT p.point_id, p.text, p.member_id, p.house, p.date
             FROM cluster_points cp
             JOIN points p ON p.point_id = cp.point_id
             WHERE cp.cluster_id = ?1";

        let (sql, anchor) = match (after_id, before_id) {
            (Some(after), None) => (
                format!("{} AND p.point_id > ?2 ORDER BY p.point_id ASC LIMIT ?3", base),
                Some(after),
            ),
            (None, Some(before)) => (
                format!("{} AND p.point_id < ?2 ORDER BY p.point_id DESC LIMIT ?3", base),
                Some(before),
            ),
            _ => (format!("{} ORDER BY p.point_id ASC LIMIT ?2", base), None),
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = match anchor {
            Some(anchor) => {
                stmt.query_map(params![cluster_id, anchor, limit], Self::point_from_row)?
            }
            None => stmt.query_map(params![cluster_id, limit], Self::point_from_row)?,
        };
        rows.collect()
    }

    /// Semantic page: (distance to the cluster centre, point id) ascending,
    /// anchored by strict row-value comparison so ties on distance break by
    /// id. `before` pages come back descending, caller re-reverses.
    pub fn page_points_semantic(
        &self,
        cluster_id: i64,
        limit: i64,
        after_id: Option<i64>,
        before_id: Option<i64>,
    ) -> Result<Vec<Point>> {
        let conn = self.conn.lock().unwrap();
        let base = "SELECT p.point_id, p.text, p.member_id, p.house, p.date
             FROM cluster_points cp
             JOIN points p ON p.point_id = cp.point_id
             JOIN clusters c ON c.cluster_id = cp.cluster_id
             WHERE cp.cluster_id = ?1
               AND p.embedding IS NOT NULL
               AND c.centre IS NOT NULL";
        let anchor_sub = "(SELECT vec_distance(p2.embedding, c2.centre), p2.point_id
                  FROM points p2, clusters c2
                  WHERE p2.point_id = ?2 AND c2.cluster_id = ?1)";

        let (sql, anchor) = match (after_id, before_id) {
            (Some(after), None) => (
                format!(
                    "{base} AND (vec_distance(p.embedding, c.centre), p.point_id) > {anchor_sub}
                     ORDER BY vec_distance(p.embedding, c.centre) ASC, p.point_id ASC LIMIT ?3"
                ),
                Some(after),
            ),
            (None, Some(before)) => (
                format!(
                    "{base} AND (vec_distance(p.embedding, c.centre), p.point_id) < {anchor_sub}
                     ORDER BY vec_distance(p.embedding, c.centre) DESC, p.point_id DESC LIMIT ?3"
                ),
                Some(before),
            ),
            _ => (
                format!(
                    "{base} ORDER BY vec_distance(p.embedding, c.centre) ASC, p.point_id ASC LIMIT ?2"
                ),
                None,
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = match anchor {
            Some(anchor) => {
                stmt.query_map(params![cluster_id, anchor, limit], Self::point_from_row)?
            }
            None => stmt.query_map(params![cluster_id, limit], Self::point_from_row)?,
        };
        rows.collect()
    }

    // ==================== Jobs ====================

    pub fn create_job(&self, params_json: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO cluster_jobs (status, params, created_at) VALUES ('queued', ?1, ?2)",
            params![params_json, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Dedup insert: reuse an identical in-flight (filters, config) pair or
    /// queue a fresh job, in one transaction so concurrent submitters cannot
    /// both win. Returns (job_id, created).
    pub fn create_job_if_absent(&self, params_json: &str) -> Result<(i64, bool)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT job_id FROM cluster_jobs
                 WHERE params = ?1 AND status IN ('queued', 'running')
                 ORDER BY job_id ASC LIMIT 1",
                params![params_json],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(job_id) = existing {
            tx.commit()?;
            return Ok((job_id, false));
        }
        let now = chrono::Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO cluster_jobs (status, params, created_at) VALUES ('queued', ?1, ?2)",
            params![params_json, now],
        )?;
        let job_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((job_id, true))
    }

    /// Dedup lookup: an identical in-flight (filters, config) pair.
    pub fn find_active_job(&self, params_json: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT job_id FROM cluster_jobs
             WHERE params = ?1 AND status IN ('queued', 'running')
             ORDER BY job_id ASC LIMIT 1",
            params![params_json],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<ClusterJob>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT job_id, status, params, error, created_at, started_at, finished_at
             FROM cluster_jobs WHERE job_id = ?1",
            params![job_id],
            |row| {
                let status_str: String = row.get(1)?;
                let status = JobStatus::from_str(&status_str).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        format!("unknown job status: {}", status_str).into(),
                    )
                })?;
                Ok(ClusterJob {
                    job_id: row.get(0)?,
                    status,
                    params: row.get(2)?,
                    error: row.get(3)?,
                    created_at: row.get(4)?,
                    started_at: row.get(5)?,
                    finished_at: row.get(6)?,
                })
            },
        )
        .optional()
    }

    pub fn set_job_running(&self, job_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE cluster_jobs SET status = 'running', started_at = ?2 WHERE job_id = ?1",
            params![job_id, now],
        )?;
        Ok(())
    }

    pub fn set_job_failed(&self, job_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE cluster_jobs SET status = 'failed', error = ?2, finished_at = ?3
             WHERE job_id = ?1",
            params![job_id, error, now],
        )?;
        Ok(())
    }

    /// Atomic commit: every node the job wrote becomes visible and the job
    /// is marked complete, in one transaction.
    pub fn finalise_job(&self, job_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE clusters SET visible = 1 WHERE job_id = ?1",
            params![job_id],
        )?;
        tx.execute(
            "UPDATE cluster_jobs SET status = 'complete', finished_at = ?2 WHERE job_id = ?1",
            params![job_id, now],
        )?;
        tx.commit()
    }

    /// Root of a committed tree, if the job produced one.
    pub fn find_root_cluster(&self, job_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT cluster_id FROM clusters
             WHERE job_id = ?1 AND parent_cluster_id IS NULL AND depth = 0 AND visible = 1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()
    }

    /// Jobs abandoned by a previous process (queued or running at startup).
    pub fn in_flight_job_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT job_id FROM cluster_jobs WHERE status IN ('queued', 'running')
             ORDER BY job_id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    /// Delete a job together with its clusters and memberships.
    pub fn delete_job_cascade(&self, job_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM cluster_points WHERE cluster_id IN
                 (SELECT cluster_id FROM clusters WHERE job_id = ?1)",
            params![job_id],
        )?;
        tx.execute("DELETE FROM clusters WHERE job_id = ?1", params![job_id])?;
        tx.execute("DELETE FROM cluster_jobs WHERE job_id = ?1", params![job_id])?;
        tx.commit()
    }
}
