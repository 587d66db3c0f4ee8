// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Database module for analysis runs, failure analyses and fingerprints

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::output::FailureAnalysis;
use crate::{AnalyserError, Result};

/// Database manager (thread-safe wrapper)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// One analysed report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: String,
    /// Where the report came from (path or upload name)
    pub source: String,
    /// `api` or `ui`
    pub kind: String,
    pub total_failures: i64,
    pub unique_failures: i64,
    /// Failures answered from earlier runs without an LLM call
    pub reused: i64,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A stored analysis of one distinct failure within a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredAnalysis {
    pub id: String,
    pub run_id: String,
    pub fingerprint: String,
    #[serde(flatten)]
    pub analysis: FailureAnalysis,
    /// Times the failure appeared in this run
    pub occurrences: i64,
    /// Copied from an earlier run rather than freshly generated
    pub reused: bool,
    pub created_at: DateTime<Utc>,
}

/// Cross-run history of a failure fingerprint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub analysis_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: i64,
}

/// Database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub run_count: i64,
    pub analysis_count: i64,
    pub distinct_failures: i64,
    pub total_occurrences: i64,
}

const ANALYSIS_COLUMNS: &str = "id, run_id, fingerprint, feature_name, scenario_name, step_details, \
     error_message, detailed_reason, squad_name, possible_causes, recommended_fixes, file_path, \
     line_number, error_category, occurrences, reused, created_at";

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_analysis(row: &Row<'_>) -> rusqlite::Result<StoredAnalysis> {
    let causes: String = row.get(9)?;
    let fixes: String = row.get(10)?;
    let created: String = row.get(16)?;

    Ok(StoredAnalysis {
        id: row.get(0)?,
        run_id: row.get(1)?,
        fingerprint: row.get(2)?,
        analysis: FailureAnalysis {
            feature_name: row.get(3)?,
            scenario_name: row.get(4)?,
            step_details: row.get(5)?,
            error_message: row.get(6)?,
            detailed_reason: row.get(7)?,
            squad_name: row.get(8)?,
            possible_causes: serde_json::from_str(&causes).unwrap_or_default(),
            recommended_fixes: serde_json::from_str(&fixes).unwrap_or_default(),
            file_path: row.get(11)?,
            line_number: row.get(12)?,
            error_category: row.get(13)?,
        },
        occurrences: row.get(14)?,
        reused: row.get(15)?,
        created_at: parse_time(&created),
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let created: String = row.get(7)?;
    Ok(RunRecord {
        id: row.get(0)?,
        source: row.get(1)?,
        kind: row.get(2)?,
        total_failures: row.get(3)?,
        unique_failures: row.get(4)?,
        reused: row.get(5)?,
        error_count: row.get(6)?,
        created_at: parse_time(&created),
    })
}

impl Database {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| AnalyserError::Config("Database lock poisoned".to_string()))
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                kind TEXT NOT NULL,
                total_failures INTEGER NOT NULL DEFAULT 0,
                unique_failures INTEGER NOT NULL DEFAULT 0,
                reused INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analyses (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id),
                fingerprint TEXT NOT NULL,
                feature_name TEXT NOT NULL,
                scenario_name TEXT NOT NULL,
                step_details TEXT NOT NULL,
                error_message TEXT NOT NULL,
                detailed_reason TEXT NOT NULL,
                squad_name TEXT NOT NULL DEFAULT '',
                possible_causes TEXT NOT NULL DEFAULT '[]',
                recommended_fixes TEXT NOT NULL DEFAULT '[]',
                file_path TEXT NOT NULL DEFAULT '',
                line_number TEXT NOT NULL DEFAULT '',
                error_category TEXT,
                occurrences INTEGER NOT NULL DEFAULT 1,
                reused INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fingerprints (
                fingerprint TEXT PRIMARY KEY,
                analysis_id TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                occurrences INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_analyses_run ON analyses(run_id);
            CREATE INDEX IF NOT EXISTS idx_analyses_fingerprint ON analyses(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_analyses_feature ON analyses(feature_name);
        "#)?;
        Ok(())
    }

    /// Insert or replace a run
    pub fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        write_run(&conn, run)
    }

    /// Insert an analysis. Fails if the id is already taken.
    pub fn insert_analysis(&self, stored: &StoredAnalysis) -> Result<()> {
        let conn = self.lock_conn()?;
        write_analysis(&conn, stored)
    }

    /// Count a sighting of a fingerprint. The first sighting pins the analysis it maps to.
    pub fn record_occurrence(&self, fingerprint: &str, analysis_id: &str, count: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        write_occurrence(&conn, fingerprint, analysis_id, count)
    }

    /// Store a run with its analyses and fingerprint sightings in one transaction.
    ///
    /// Nothing is written if any insert fails.
    pub fn store_run(&self, run: &RunRecord, analyses: &[StoredAnalysis]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        write_run(&tx, run)?;
        for stored in analyses {
            write_analysis(&tx, stored)?;
            write_occurrence(&tx, &stored.fingerprint, &stored.id, stored.occurrences)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fingerprint history, if the failure has been seen before
    pub fn get_fingerprint(&self, fingerprint: &str) -> Result<Option<FingerprintRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                "SELECT fingerprint, analysis_id, first_seen, last_seen, occurrences FROM fingerprints WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    let first: String = row.get(2)?;
                    let last: String = row.get(3)?;
                    Ok(FingerprintRecord {
                        fingerprint: row.get(0)?,
                        analysis_id: row.get(1)?,
                        first_seen: parse_time(&first),
                        last_seen: parse_time(&last),
                        occurrences: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// The analysis a fingerprint was first answered with
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<StoredAnalysis>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM analyses WHERE id = (SELECT analysis_id FROM fingerprints WHERE fingerprint = ?1)",
            ANALYSIS_COLUMNS
        );
        let found = conn.query_row(&sql, params![fingerprint], row_to_analysis).optional()?;
        Ok(found)
    }

    fn query_analyses(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<StoredAnalysis>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, row_to_analysis)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent analyses across all runs
    pub fn get_recent_results(&self, limit: usize) -> Result<Vec<StoredAnalysis>> {
        self.query_analyses(
            &format!("SELECT {} FROM analyses ORDER BY created_at DESC, rowid DESC LIMIT ?1", ANALYSIS_COLUMNS),
            params![limit as i64],
        )
    }

    /// Analyses belonging to one run, in insertion order
    pub fn get_run_results(&self, run_id: &str) -> Result<Vec<StoredAnalysis>> {
        self.query_analyses(
            &format!("SELECT {} FROM analyses WHERE run_id = ?1 ORDER BY rowid", ANALYSIS_COLUMNS),
            params![run_id],
        )
    }

    /// Analyses of the latest run, or empty when nothing was stored yet
    pub fn get_latest_run_results(&self) -> Result<Vec<StoredAnalysis>> {
        match self.get_runs(1)?.into_iter().next() {
            Some(run) => self.get_run_results(&run.id),
            None => Ok(Vec::new()),
        }
    }

    /// Search by feature, scenario, step or error text
    pub fn search_results(&self, query: &str, limit: usize) -> Result<Vec<StoredAnalysis>> {
        let pattern = format!("%{}%", query);
        self.query_analyses(
            &format!(
                r#"SELECT {} FROM analyses
                   WHERE feature_name LIKE ?1 OR scenario_name LIKE ?1 OR step_details LIKE ?1 OR error_message LIKE ?1
                   ORDER BY created_at DESC, rowid DESC LIMIT ?2"#,
                ANALYSIS_COLUMNS
            ),
            params![pattern, limit as i64],
        )
    }

    /// Get all analyses
    pub fn get_all_results(&self) -> Result<Vec<StoredAnalysis>> {
        self.query_analyses(&format!("SELECT {} FROM analyses ORDER BY rowid", ANALYSIS_COLUMNS), [])
    }

    /// Most recent runs first
    pub fn get_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, source, kind, total_failures, unique_failures, reused, error_count, created_at
               FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1"#,
        )?;
        let runs = stmt
            .query_map(params![limit as i64], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DbStats> {
        let conn = self.lock_conn()?;
        let run_count: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        let analysis_count: i64 = conn.query_row("SELECT COUNT(*) FROM analyses", [], |row| row.get(0))?;
        let (distinct_failures, total_occurrences): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(occurrences), 0) FROM fingerprints",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DbStats {
            run_count,
            analysis_count,
            distinct_failures,
            total_occurrences,
        })
    }

    /// Vacuum database
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("VACUUM", [])?;
        Ok(())
    }
}

fn write_run(conn: &Connection, run: &RunRecord) -> Result<()> {
    conn.execute(
        r#"INSERT OR REPLACE INTO runs (id, source, kind, total_failures, unique_failures, reused, error_count, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        params![
            run.id,
            run.source,
            run.kind,
            run.total_failures,
            run.unique_failures,
            run.reused,
            run.error_count,
            timestamp(&run.created_at),
        ],
    )?;
    Ok(())
}

fn write_analysis(conn: &Connection, stored: &StoredAnalysis) -> Result<()> {
    let a = &stored.analysis;
    conn.execute(
        &format!(
            "INSERT INTO analyses ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            ANALYSIS_COLUMNS
        ),
        params![
            stored.id,
            stored.run_id,
            stored.fingerprint,
            a.feature_name,
            a.scenario_name,
            a.step_details,
            a.error_message,
            a.detailed_reason,
            a.squad_name,
            serde_json::to_string(&a.possible_causes)?,
            serde_json::to_string(&a.recommended_fixes)?,
            a.file_path,
            a.line_number,
            a.error_category,
            stored.occurrences,
            stored.reused,
            timestamp(&stored.created_at),
        ],
    )?;
    Ok(())
}

fn write_occurrence(conn: &Connection, fingerprint: &str, analysis_id: &str, count: i64) -> Result<()> {
    let now = timestamp(&Utc::now());
    conn.execute(
        r#"INSERT INTO fingerprints (fingerprint, analysis_id, first_seen, last_seen, occurrences)
           VALUES (?1, ?2, ?3, ?3, ?4)
           ON CONFLICT(fingerprint) DO UPDATE SET
               last_seen = excluded.last_seen,
               occurrences = occurrences + excluded.occurrences"#,
        params![fingerprint, analysis_id, now, count],
    )?;
    Ok(())
}

/// Generate a new UUID for records
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(feature: &str, step: &str) -> FailureAnalysis {
        FailureAnalysis {
            detailed_reason: "reason".to_string(),
            error_message: "TimeoutError: waited 30000ms".to_string(),
            squad_name: "core".to_string(),
            possible_causes: vec!["slow backend".to_string()],
            recommended_fixes: vec!["raise timeout".to_string(), "mock backend".to_string()],
            feature_name: feature.to_string(),
            scenario_name: "scenario".to_string(),
            step_details: step.to_string(),
            file_path: "src/steps.ts".to_string(),
            line_number: "7".to_string(),
            error_category: Some("Script Issue".to_string()),
        }
    }

    fn run(id: &str) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            source: "report.json".to_string(),
            kind: "api".to_string(),
            total_failures: 2,
            unique_failures: 1,
            reused: 0,
            error_count: 0,
            created_at: Utc::now(),
        }
    }

    fn stored(run_id: &str, fp: &str, a: FailureAnalysis) -> StoredAnalysis {
        StoredAnalysis {
            id: new_id(),
            run_id: run_id.to_string(),
            fingerprint: fp.to_string(),
            analysis: a,
            occurrences: 2,
            reused: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn analyses_round_trip_through_sqlite() {
        let db = Database::in_memory().unwrap();
        db.insert_run(&run("r1")).unwrap();
        let s = stored("r1", "fp1", analysis("Login", "I sign in"));
        db.insert_analysis(&s).unwrap();

        let results = db.get_run_results("r1").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].analysis, s.analysis);
        assert_eq!(results[0].occurrences, 2);
        assert!(!results[0].reused);
    }

    #[test]
    fn fingerprint_keeps_first_analysis_and_accumulates() {
        let db = Database::in_memory().unwrap();
        db.record_occurrence("fp", "a1", 2).unwrap();
        db.record_occurrence("fp", "a2", 3).unwrap();

        let record = db.get_fingerprint("fp").unwrap().unwrap();
        assert_eq!(record.analysis_id, "a1");
        assert_eq!(record.occurrences, 5);
        assert!(record.last_seen >= record.first_seen);
        assert!(db.get_fingerprint("other").unwrap().is_none());
    }

    #[test]
    fn find_by_fingerprint_resolves_stored_analysis() {
        let db = Database::in_memory().unwrap();
        db.insert_run(&run("r1")).unwrap();
        let s = stored("r1", "fp1", analysis("Login", "I sign in"));
        db.insert_analysis(&s).unwrap();
        db.record_occurrence("fp1", &s.id, 1).unwrap();

        let found = db.find_by_fingerprint("fp1").unwrap().unwrap();
        assert_eq!(found.id, s.id);
        assert!(db.find_by_fingerprint("nope").unwrap().is_none());
    }

    #[test]
    fn search_matches_step_and_error_text() {
        let db = Database::in_memory().unwrap();
        db.insert_run(&run("r1")).unwrap();
        db.insert_analysis(&stored("r1", "a", analysis("Login", "I sign in"))).unwrap();
        db.insert_analysis(&stored("r1", "b", analysis("Cart", "I add an item"))).unwrap();

        assert_eq!(db.search_results("sign", 10).unwrap().len(), 1);
        assert_eq!(db.search_results("TimeoutError", 10).unwrap().len(), 2);
        assert_eq!(db.search_results("TimeoutError", 1).unwrap().len(), 1);
    }

    #[test]
    fn stats_and_latest_run() {
        let db = Database::in_memory().unwrap();
        assert!(db.get_latest_run_results().unwrap().is_empty());

        db.insert_run(&run("r1")).unwrap();
        db.insert_analysis(&stored("r1", "a", analysis("Login", "I sign in"))).unwrap();
        db.record_occurrence("a", "x", 4).unwrap();

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.run_count, 1);
        assert_eq!(stats.analysis_count, 1);
        assert_eq!(stats.distinct_failures, 1);
        assert_eq!(stats.total_occurrences, 4);
        assert_eq!(db.get_latest_run_results().unwrap().len(), 1);
    }

    #[test]
    fn store_run_writes_everything() {
        let db = Database::in_memory().unwrap();
        let analyses = vec![
            stored("r1", "fp1", analysis("Login", "I sign in")),
            stored("r1", "fp2", analysis("Cart", "I add an item")),
        ];
        db.store_run(&run("r1"), &analyses).unwrap();

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.run_count, 1);
        assert_eq!(stats.analysis_count, 2);
        assert_eq!(stats.distinct_failures, 2);
        assert_eq!(db.find_by_fingerprint("fp2").unwrap().unwrap().id, analyses[1].id);
    }

    #[test]
    fn store_run_rolls_back_on_failure() {
        let db = Database::in_memory().unwrap();
        let first = stored("r1", "fp1", analysis("Login", "I sign in"));
        let mut clash = stored("r1", "fp2", analysis("Cart", "I add an item"));
        clash.id = first.id.clone();

        assert!(db.store_run(&run("r1"), &[first, clash]).is_err());

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.run_count, 0);
        assert_eq!(stats.analysis_count, 0);
        assert_eq!(stats.distinct_failures, 0);
        assert!(db.find_by_fingerprint("fp1").unwrap().is_none());
    }
}
