#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use caselink_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AutoLinkageError, AutoResult, EngineConfig,
    LinkageErrorCode, LinkageOutcome, LinkageResult, ManualResult, ManualVerdict, ResultCategory,
    Run, RunId, RunInput, RunStatistics,
};
use rusqlite::{params, Connection, OptionalExtension};

mod reconcile;
mod statistics;

pub use reconcile::{ReconcileOutcome, RefreshReport, ResetReport, SubmitReport};
pub use statistics::{SubmissionOutcome, SubmissionPlan};

const RESULTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RESULTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS runs (
  run_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  component TEXT NOT NULL,
  build TEXT NOT NULL,
  product TEXT NOT NULL,
  version TEXT NOT NULL,
  arch TEXT NOT NULL,
  run_type TEXT NOT NULL,
  framework TEXT NOT NULL,
  project TEXT NOT NULL,
  run_date TEXT NOT NULL,
  ci_url TEXT NOT NULL DEFAULT '',
  description TEXT,
  tags_json TEXT NOT NULL DEFAULT '[]',
  properties_json TEXT NOT NULL DEFAULT '{}',
  submit_date TEXT,
  external_id TEXT,
  created_at TEXT NOT NULL,
  auto_passed INTEGER,
  auto_failed INTEGER,
  auto_skipped INTEGER,
  auto_ignored INTEGER,
  auto_missing INTEGER,
  auto_invalid INTEGER,
  auto_unknown_issue INTEGER,
  auto_nolinkage INTEGER,
  manual_passed INTEGER,
  manual_failed INTEGER,
  manual_skipped INTEGER,
  manual_incomplete INTEGER,
  UNIQUE (name, run_date)
);

CREATE TABLE IF NOT EXISTS auto_results (
  run_id INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  case_id TEXT NOT NULL,
  time REAL NOT NULL CHECK (time >= 0.0),
  skip TEXT,
  failure TEXT,
  output TEXT,
  source TEXT,
  category TEXT NOT NULL CHECK (
    category IN ('passed', 'failed', 'skipped', 'ignored', 'missing', 'invalid')
  ),
  comment TEXT,
  linkage_error TEXT CHECK (
    linkage_error IN ('no-linkage', 'lookup-failed') OR linkage_error IS NULL
  ),
  PRIMARY KEY (run_id, case_id)
);

CREATE TABLE IF NOT EXISTS manual_results (
  run_id INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  work_item_id TEXT NOT NULL,
  time REAL NOT NULL DEFAULT 0.0,
  comment TEXT,
  result TEXT NOT NULL CHECK (result IN ('passed', 'failed', 'skipped', 'incomplete')),
  overridden INTEGER NOT NULL DEFAULT 0 CHECK (overridden IN (0, 1)),
  PRIMARY KEY (run_id, work_item_id)
);

CREATE TABLE IF NOT EXISTS linkage_results (
  run_id INTEGER NOT NULL,
  work_item_id TEXT NOT NULL,
  case_id TEXT NOT NULL,
  result TEXT CHECK (
    result IN ('passed', 'failed', 'skipped', 'ignored') OR result IS NULL
  ),
  error TEXT CHECK (
    error IN ('unknown-issue', 'missing', 'ignore-listed') OR error IS NULL
  ),
  detail TEXT,
  PRIMARY KEY (run_id, work_item_id, case_id),
  FOREIGN KEY (run_id, work_item_id)
    REFERENCES manual_results(run_id, work_item_id) ON DELETE CASCADE,
  FOREIGN KEY (run_id, case_id)
    REFERENCES auto_results(run_id, case_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_linkage_results_case
  ON linkage_results(run_id, case_id);
CREATE INDEX IF NOT EXISTS idx_auto_results_linkage_error
  ON auto_results(run_id, linkage_error);
";

const RUN_COLUMNS: &str = "run_id, name, component, build, product, version, arch, run_type,
    framework, project, run_date, ci_url, description, tags_json, properties_json,
    submit_date, external_id,
    auto_passed, auto_failed, auto_skipped, auto_ignored, auto_missing, auto_invalid,
    auto_unknown_issue, auto_nolinkage,
    manual_passed, manual_failed, manual_skipped, manual_incomplete";

const AUTO_COLUMNS: &str =
    "run_id, case_id, time, skip, failure, output, source, category, comment, linkage_error";

const MANUAL_COLUMNS: &str = "run_id, work_item_id, time, comment, result, overridden";

const LINKAGE_COLUMNS: &str = "run_id, work_item_id, case_id, result, error, detail";

pub struct SqliteResultStore {
    conn: Connection,
    config: EngineConfig,
}

impl SqliteResultStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &Path, config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid engine configuration: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RESULTS_V1)
            .context("failed to apply results schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RESULTS_MIGRATION_VERSION, now],
            )
            .context("failed to register results schema migration")?;

        Ok(())
    }

    pub fn create_run(&self, input: &RunInput) -> Result<Run> {
        input
            .validate()
            .map_err(|err| anyhow!("run validation failed: {err}"))?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO runs(
                    name, component, build, product, version, arch, run_type,
                    framework, project, run_date, ci_url, description,
                    tags_json, properties_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    input.name,
                    input.component,
                    input.build,
                    input.product,
                    input.version,
                    input.arch,
                    input.run_type,
                    input.framework,
                    input.project,
                    format_rfc3339(input.date).map_err(|err| anyhow!(err.to_string()))?,
                    input.ci_url,
                    input.description,
                    serde_json::to_string(&input.tags).context("failed to serialize tags")?,
                    serde_json::to_string(&input.properties)
                        .context("failed to serialize properties")?,
                    now,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert run {} (name and date must be unique)",
                    input.name
                )
            })?;

        let run_id = self.conn.last_insert_rowid();
        tracing::info!(run_id, name = %input.name, "run created");
        self.get_run(run_id)?
            .ok_or_else(|| anyhow!("run {run_id} vanished after insert"))
    }

    pub fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;
        let run = stmt
            .query_row(params![run_id], parse_run_row)
            .optional()?;
        Ok(run)
    }

    pub fn list_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY run_date DESC, run_id DESC"
        ))?;
        let rows = stmt.query_map([], parse_run_row)?;
        collect_rows(rows)
    }

    /// Deletes a run together with every result it owns.
    pub fn delete_run(&mut self, run_id: RunId) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start run delete transaction")?;
        // Linkage rows reference both result tables; drop them first so the
        // cascade order does not matter.
        tx.execute(
            "DELETE FROM linkage_results WHERE run_id = ?1",
            params![run_id],
        )?;
        tx.execute("DELETE FROM manual_results WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM auto_results WHERE run_id = ?1", params![run_id])?;
        let deleted = tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        tx.commit().context("failed to commit run delete")?;

        if deleted > 0 {
            tracing::info!(run_id, "run deleted");
        }
        Ok(deleted > 0)
    }

    pub fn get_auto_result(&self, run_id: RunId, case_id: &str) -> Result<Option<AutoResult>> {
        query_auto_result(&self.conn, run_id, case_id)
    }

    pub fn list_auto_results(&self, run_id: RunId) -> Result<Vec<AutoResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AUTO_COLUMNS} FROM auto_results WHERE run_id = ?1 ORDER BY case_id ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], parse_auto_row)?;
        collect_rows(rows)
    }

    pub fn get_manual_result(
        &self,
        run_id: RunId,
        work_item_id: &str,
    ) -> Result<Option<ManualResult>> {
        query_manual_result(&self.conn, run_id, work_item_id)
    }

    pub fn list_manual_results(&self, run_id: RunId) -> Result<Vec<ManualResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MANUAL_COLUMNS} FROM manual_results WHERE run_id = ?1 ORDER BY work_item_id ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], parse_manual_row)?;
        collect_rows(rows)
    }

    pub fn list_linkage_results(&self, run_id: RunId) -> Result<Vec<LinkageResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINKAGE_COLUMNS} FROM linkage_results
             WHERE run_id = ?1
             ORDER BY work_item_id ASC, case_id ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], parse_linkage_row)?;
        collect_rows(rows)
    }

    /// LinkageResult rows of a run that carry an error code.
    pub fn list_linkage_errors(&self, run_id: RunId) -> Result<Vec<LinkageResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINKAGE_COLUMNS} FROM linkage_results
             WHERE run_id = ?1 AND error IS NOT NULL
             ORDER BY error ASC, case_id ASC, work_item_id ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], parse_linkage_row)?;
        collect_rows(rows)
    }

    fn require_run(&self, run_id: RunId) -> Result<()> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM runs WHERE run_id = ?1",
                params![run_id],
                |_| Ok(()),
            )
            .optional()?;
        exists.ok_or_else(|| anyhow!("run {run_id} not found"))
    }

    fn manual_work_item_ids(&self, run_id: RunId) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT work_item_id FROM manual_results WHERE run_id = ?1")?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn query_auto_result(conn: &Connection, run_id: RunId, case_id: &str) -> Result<Option<AutoResult>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {AUTO_COLUMNS} FROM auto_results WHERE run_id = ?1 AND case_id = ?2"
    ))?;
    let row = stmt
        .query_row(params![run_id, case_id], parse_auto_row)
        .optional()?;
    Ok(row)
}

fn query_manual_result(
    conn: &Connection,
    run_id: RunId,
    work_item_id: &str,
) -> Result<Option<ManualResult>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MANUAL_COLUMNS} FROM manual_results WHERE run_id = ?1 AND work_item_id = ?2"
    ))?;
    let row = stmt
        .query_row(params![run_id, work_item_id], parse_manual_row)
        .optional()?;
    Ok(row)
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let date_raw: String = row.get(10)?;
    let tags_raw: String = row.get(13)?;
    let properties_raw: String = row.get(14)?;
    let submit_raw: Option<String> = row.get(15)?;

    let date = parse_rfc3339_utc(&date_raw).map_err(|err| invalid_column(10, err))?;
    let tags: Vec<String> =
        serde_json::from_str(&tags_raw).map_err(|err| invalid_column(13, err))?;
    let properties: BTreeMap<String, String> =
        serde_json::from_str(&properties_raw).map_err(|err| invalid_column(14, err))?;
    let submit_date = submit_raw
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()
        .map_err(|err| invalid_column(15, err))?;

    let mut counts = [None::<i64>; 12];
    for (offset, slot) in counts.iter_mut().enumerate() {
        *slot = row.get(17 + offset)?;
    }
    let statistics = if counts.iter().all(Option::is_some) {
        let mut values = [0_u64; 12];
        for (offset, (value, raw)) in values.iter_mut().zip(counts).enumerate() {
            let raw = raw.unwrap_or_default();
            *value = u64::try_from(raw).map_err(|_| {
                invalid_column(17 + offset, format!("negative statistic: {raw}"))
            })?;
        }
        Some(RunStatistics {
            auto_passed: values[0],
            auto_failed: values[1],
            auto_skipped: values[2],
            auto_ignored: values[3],
            auto_missing: values[4],
            auto_invalid: values[5],
            auto_unknown_issue: values[6],
            auto_nolinkage: values[7],
            manual_passed: values[8],
            manual_failed: values[9],
            manual_skipped: values[10],
            manual_incomplete: values[11],
        })
    } else {
        None
    };

    Ok(Run {
        run_id: row.get(0)?,
        name: row.get(1)?,
        component: row.get(2)?,
        build: row.get(3)?,
        product: row.get(4)?,
        version: row.get(5)?,
        arch: row.get(6)?,
        run_type: row.get(7)?,
        framework: row.get(8)?,
        project: row.get(9)?,
        date,
        ci_url: row.get(11)?,
        description: row.get(12)?,
        tags,
        properties,
        submit_date,
        external_id: row.get(16)?,
        statistics,
    })
}

fn parse_auto_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutoResult> {
    let category_raw: String = row.get(7)?;
    let linkage_error_raw: Option<String> = row.get(9)?;

    let category = ResultCategory::parse(&category_raw)
        .ok_or_else(|| invalid_column(7, format!("invalid category: {category_raw}")))?;
    let linkage_error = linkage_error_raw
        .as_deref()
        .map(|raw| {
            AutoLinkageError::parse(raw)
                .ok_or_else(|| invalid_column(9, format!("invalid linkage_error: {raw}")))
        })
        .transpose()?;

    Ok(AutoResult {
        run_id: row.get(0)?,
        case_id: row.get(1)?,
        time: row.get(2)?,
        skip: row.get(3)?,
        failure: row.get(4)?,
        output: row.get(5)?,
        source: row.get(6)?,
        category,
        comment: row.get(8)?,
        linkage_error,
    })
}

fn parse_manual_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManualResult> {
    let result_raw: String = row.get(4)?;
    let result = ManualVerdict::parse(&result_raw)
        .ok_or_else(|| invalid_column(4, format!("invalid result: {result_raw}")))?;

    Ok(ManualResult {
        run_id: row.get(0)?,
        work_item_id: row.get(1)?,
        time: row.get(2)?,
        comment: row.get(3)?,
        result,
        overridden: row.get::<_, i64>(5)? == 1,
    })
}

fn parse_linkage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LinkageResult> {
    let (result, error) = parse_linkage_outcome(row, 3, 4)?;

    Ok(LinkageResult {
        run_id: row.get(0)?,
        work_item_id: row.get(1)?,
        case_id: row.get(2)?,
        result,
        error,
        detail: row.get(5)?,
    })
}

fn parse_linkage_outcome(
    row: &rusqlite::Row<'_>,
    result_index: usize,
    error_index: usize,
) -> rusqlite::Result<(Option<LinkageOutcome>, Option<LinkageErrorCode>)> {
    let result_raw: Option<String> = row.get(result_index)?;
    let error_raw: Option<String> = row.get(error_index)?;

    let result = result_raw
        .as_deref()
        .map(|raw| {
            LinkageOutcome::parse(raw)
                .ok_or_else(|| invalid_column(result_index, format!("invalid result: {raw}")))
        })
        .transpose()?;
    let error = error_raw
        .as_deref()
        .map(|raw| {
            LinkageErrorCode::parse(raw)
                .ok_or_else(|| invalid_column(error_index, format!("invalid error: {raw}")))
        })
        .transpose()?;

    Ok((result, error))
}

fn invalid_column(index: usize, message: impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::manual_let_else,
        clippy::float_cmp,
        clippy::too_many_lines
    )]

    use super::*;
    use caselink_core::{
        aggregate_manual_result, AutoCaseLinks, AutoResultInput, BlockingExclude, GraphSnapshot,
        LinkageDirectory, LinkageError, LinkageGraph, LookupError, SubmissionBatch, SubmissionResult,
        SubmissionSink, WorkItemLinks, NO_LINKAGE_DATA,
    };
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteResultStore {
        let store = must(SqliteResultStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_graph() -> LinkageGraph {
        let snapshot: GraphSnapshot = match serde_json::from_value(json!({
            "work_items": [
                {"id": "WI-1", "title": "basic", "type": "testcase", "automation": "automated"},
                {"id": "WI-2", "title": "pause", "type": "testcase", "automation": "automated"},
                {"id": "WI-4", "title": "misc", "type": "testcase", "automation": "automated"}
            ],
            "auto_cases": [
                {"id": "a.b.c"},
                {"id": "suite.pause.one"},
                {"id": "suite.pause.two"},
                {"id": "x"}
            ],
            "patterns": [
                {"id": "P-1", "work_item_id": "WI-1", "pattern": "a.b"},
                {"id": "P-2", "work_item_id": "WI-2", "pattern": "suite.pause"},
                {"id": "P-4", "work_item_id": "WI-4", "pattern": "x"}
            ],
            "bugs": [
                {"id": "BZ-1", "work_items": ["WI-2"]}
            ],
            "failure_signatures": [
                {"id": "F-1", "regex": "boom", "classification": "bug-attributed",
                 "bug_id": "BZ-1", "scope_pattern": "suite.pause"}
            ]
        })) {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("test failure: {err}"),
        };
        match LinkageGraph::from_snapshot(snapshot) {
            Ok(graph) => graph,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_run(store: &SqliteResultStore, name: &str) -> RunId {
        let date = match parse_rfc3339_utc("2026-03-01T10:00:00Z") {
            Ok(date) => date,
            Err(err) => panic!("test failure: {err}"),
        };
        let run = must(store.create_run(&RunInput {
            name: name.to_string(),
            component: "libvirt".to_string(),
            build: "libvirt-10.0.0-1".to_string(),
            product: "rhel".to_string(),
            version: "9.4".to_string(),
            arch: "x86_64".to_string(),
            run_type: "acceptance".to_string(),
            framework: "avocado".to_string(),
            project: "virt".to_string(),
            date,
            ci_url: "https://ci.example.test/job/1".to_string(),
            description: None,
            tags: vec!["nightly".to_string()],
            properties: BTreeMap::from([("host".to_string(), "lab-3".to_string())]),
        }));
        run.run_id
    }

    fn passed(case_id: &str, time: f64) -> AutoResultInput {
        AutoResultInput {
            case_id: case_id.to_string(),
            time,
            skip: None,
            failure: None,
            output: Some("ok".to_string()),
            source: None,
        }
    }

    fn failed(case_id: &str, time: f64, failure: &str) -> AutoResultInput {
        AutoResultInput {
            case_id: case_id.to_string(),
            time,
            skip: None,
            failure: Some(failure.to_string()),
            output: None,
            source: Some("job.log".to_string()),
        }
    }

    fn skipped(case_id: &str, reason: &str) -> AutoResultInput {
        AutoResultInput {
            case_id: case_id.to_string(),
            time: 0.0,
            skip: Some(reason.to_string()),
            failure: None,
            output: None,
            source: None,
        }
    }

    struct FailingDirectory;

    impl LinkageDirectory for FailingDirectory {
        fn lookup_auto_case(&self, _case_id: &str) -> Result<AutoCaseLinks, LookupError> {
            Err(LookupError::Transient("directory offline".to_string()))
        }

        fn lookup_work_item(&self, _work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
            Err(LookupError::Transient("directory offline".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Vec<SubmissionBatch>,
        reject: bool,
    }

    impl SubmissionSink for RecordingSink {
        fn submit(&mut self, batch: &SubmissionBatch) -> Result<String, LinkageError> {
            if self.reject {
                return Err(LinkageError::Validation("downstream refused".to_string()));
            }
            self.batches.push(batch.clone());
            Ok(format!("EXT-{}", self.batches.len()))
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());

        let count: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(count, 1);
    }

    #[test]
    fn create_run_rejects_duplicate_name_and_date() {
        let store = fixture_store();
        let run_id = fixture_run(&store, "nightly");

        let run = must(store.get_run(run_id)).unwrap_or_else(|| panic!("run missing"));
        assert_eq!(run.tags, ["nightly"]);
        assert_eq!(run.properties.get("host").map(String::as_str), Some("lab-3"));
        assert_eq!(run.statistics, None);
        assert_eq!(run.submit_date, None);

        let date = run.date;
        let duplicate = store.create_run(&RunInput {
            name: run.name.clone(),
            component: run.component.clone(),
            build: run.build.clone(),
            product: run.product.clone(),
            version: run.version.clone(),
            arch: run.arch.clone(),
            run_type: run.run_type.clone(),
            framework: run.framework.clone(),
            project: run.project.clone(),
            date,
            ci_url: String::new(),
            description: None,
            tags: Vec::new(),
            properties: BTreeMap::new(),
        });
        assert!(duplicate.is_err());
        assert_eq!(must(store.list_runs()).len(), 1);
    }

    #[test]
    fn passed_result_links_its_work_item() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "passed");

        let report = must(store.submit_auto_result(run_id, &passed("a.b.c", 1.5), false, &graph));
        assert_eq!(
            report.reconcile,
            ReconcileOutcome::Reconciled {
                case_id: "a.b.c".to_string(),
                work_items: vec!["WI-1".to_string()],
            }
        );
        assert_eq!(report.auto_result.category, ResultCategory::Passed);
        assert_eq!(report.auto_result.comment.as_deref(), Some("Passed: \"WI-1\""));
        assert_eq!(report.auto_result.linkage_error, None);

        let linkage = must(store.list_linkage_results(run_id));
        assert_eq!(linkage.len(), 1);
        assert_eq!(linkage[0].work_item_id, "WI-1");
        assert_eq!(linkage[0].result, Some(LinkageOutcome::Passed));
        assert_eq!(linkage[0].error, None);

        let manual = must(store.get_manual_result(run_id, "WI-1"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Passed);
        assert_eq!(manual.time, 1.5);
        assert_eq!(manual.comment.as_deref(), Some("Passed: \"a.b.c\""));
        assert!(!manual.overridden);
    }

    #[test]
    fn first_result_creates_missing_placeholders_for_siblings() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "placeholders");

        must(store.submit_auto_result(run_id, &passed("suite.pause.one", 2.0), false, &graph));

        let sibling = must(store.get_auto_result(run_id, "suite.pause.two"))
            .unwrap_or_else(|| panic!("placeholder missing"));
        assert_eq!(sibling.category, ResultCategory::Missing);
        assert_eq!(sibling.time, 0.0);
        assert_eq!(sibling.comment.as_deref(), Some("Blocking with missing: WI-2"));

        let manual = must(store.get_manual_result(run_id, "WI-2"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Incomplete);
        assert_eq!(
            manual.comment.as_deref(),
            Some("Blocking with missing: suite.pause.two\nPassed: \"suite.pause.one\"")
        );

        // Missing is excluded by default; a forced submission also ignores it.
        assert!(must(store.blocking_errors(run_id, &store.default_blocking_exclude())).is_empty());
        let strict = BlockingExclude::Codes(BTreeSet::new());
        assert_eq!(
            must(store.blocking_errors(run_id, &strict)),
            ["auto case suite.pause.two is blocking WI-2 with error missing"]
        );
    }

    #[test]
    fn failed_sibling_beats_passed_and_fills_placeholder() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "failed");

        must(store.submit_auto_result(run_id, &passed("suite.pause.one", 2.0), false, &graph));
        // The placeholder is not a reported result, so no replace flag is needed.
        let report = must(store.submit_auto_result(
            run_id,
            &failed("suite.pause.two", 3.0, "guest boom at resume"),
            false,
            &graph,
        ));
        assert_eq!(report.auto_result.category, ResultCategory::Failed);
        assert_eq!(
            report.auto_result.comment.as_deref(),
            Some("Failed: \"WI-2\" with detail: bug-attributed bug BZ-1")
        );

        let manual = must(store.get_manual_result(run_id, "WI-2"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Failed);
        assert_eq!(manual.time, 5.0);
        assert_eq!(
            manual.comment.as_deref(),
            Some(
                "Failed: \"suite.pause.two\" with detail: bug-attributed bug BZ-1\n\
                 Passed: \"suite.pause.one\""
            )
        );
        assert!(must(store.list_linkage_errors(run_id)).is_empty());
    }

    #[test]
    fn unclassified_failure_blocks_submission_until_forced() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "unknown");

        must(store.submit_auto_result(run_id, &failed("x", 4.0, "segfault"), false, &graph));

        let errors = must(store.list_linkage_errors(run_id));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, Some(LinkageErrorCode::UnknownIssue));
        assert_eq!(errors[0].result, None);

        let manual = must(store.get_manual_result(run_id, "WI-4"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Incomplete);
        assert_eq!(manual.comment.as_deref(), Some("Blocking with unknown-issue: x"));

        match must(store.prepare_submission(run_id, false)) {
            SubmissionPlan::Blocked { errors, .. } => {
                assert_eq!(errors, ["auto case x is blocking WI-4 with error unknown-issue"]);
            }
            SubmissionPlan::Ready { .. } => panic!("expected blocked submission"),
        }

        match must(store.prepare_submission(run_id, true)) {
            SubmissionPlan::Ready { batch } => {
                assert!(!batch.resubmit);
                assert_eq!(batch.records.len(), 1);
                assert_eq!(batch.records[0].work_item_id, "WI-4");
                assert_eq!(batch.records[0].result, SubmissionResult::Blocked);
            }
            SubmissionPlan::Blocked { errors, .. } => panic!("unexpected block: {errors:?}"),
        }
    }

    #[test]
    fn ignore_listed_sibling_does_not_block_when_missing_is_excluded() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "ignored");

        must(store.submit_auto_result(
            run_id,
            &skipped("suite.pause.one", "BLACKLISTED"),
            false,
            &graph,
        ));

        let manual = must(store.get_manual_result(run_id, "WI-2"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Incomplete);

        let exclude = store.default_blocking_exclude();
        assert!(must(store.blocking_errors(run_id, &exclude)).is_empty());
        assert_eq!(
            must(store.blocking_errors(run_id, &BlockingExclude::Codes(BTreeSet::new()))),
            ["auto case suite.pause.two is blocking WI-2 with error missing"]
        );
    }

    #[test]
    fn run_without_linkage_blocks_even_when_forced() {
        let store = fixture_store();
        let run_id = fixture_run(&store, "empty");

        assert_eq!(
            must(store.blocking_errors(run_id, &BlockingExclude::All)),
            [NO_LINKAGE_DATA]
        );
        assert!(matches!(
            must(store.prepare_submission(run_id, true)),
            SubmissionPlan::Blocked { .. }
        ));
    }

    #[test]
    fn reconcile_twice_writes_identical_rows() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "idempotent");

        must(store.submit_auto_result(run_id, &passed("suite.pause.one", 2.0), false, &graph));
        must(store.submit_auto_result(run_id, &failed("x", 1.0, "segfault"), false, &graph));
        let linkage = must(store.list_linkage_results(run_id));
        let manual = must(store.list_manual_results(run_id));
        let auto = must(store.list_auto_results(run_id));

        for case_id in ["suite.pause.one", "suite.pause.two", "x"] {
            let outcome = must(store.reconcile(run_id, case_id, &graph));
            assert!(outcome.is_reconciled());
        }

        assert_eq!(must(store.list_linkage_results(run_id)), linkage);
        assert_eq!(must(store.list_manual_results(run_id)), manual);
        assert_eq!(must(store.list_auto_results(run_id)), auto);
    }

    #[test]
    fn lookup_failure_leaves_result_pending_until_retry() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "pending");

        must(store.submit_auto_result(run_id, &passed("x", 1.0), false, &graph));
        let report = must(store.submit_auto_result(
            run_id,
            &passed("a.b.c", 1.0),
            false,
            &FailingDirectory,
        ));
        match &report.reconcile {
            ReconcileOutcome::Pending {
                error, retryable, ..
            } => {
                assert_eq!(*error, AutoLinkageError::LookupFailed);
                assert!(*retryable);
            }
            ReconcileOutcome::Reconciled { .. } => panic!("expected pending outcome"),
        }
        assert_eq!(
            report.auto_result.linkage_error,
            Some(AutoLinkageError::LookupFailed)
        );
        assert_eq!(must(store.get_manual_result(run_id, "WI-1")), None);
        assert_eq!(
            must(store.blocking_errors(run_id, &store.default_blocking_exclude())),
            ["auto case a.b.c is unreconciled with error lookup-failed"]
        );

        let retried = must(store.reconcile(run_id, "a.b.c", &graph));
        assert!(retried.is_reconciled());
        let auto = must(store.get_auto_result(run_id, "a.b.c"))
            .unwrap_or_else(|| panic!("auto result missing"));
        assert_eq!(auto.linkage_error, None);
        assert!(must(store.blocking_errors(run_id, &store.default_blocking_exclude())).is_empty());
    }

    #[test]
    fn unknown_case_is_recorded_without_linkage() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "unlinked");

        let report = must(store.submit_auto_result(run_id, &passed("nope.case", 1.0), false, &graph));
        match report.reconcile {
            ReconcileOutcome::Pending {
                error, retryable, ..
            } => {
                assert_eq!(error, AutoLinkageError::NoLinkage);
                assert!(!retryable);
            }
            ReconcileOutcome::Reconciled { .. } => panic!("expected pending outcome"),
        }
        assert!(must(store.list_linkage_results(run_id)).is_empty());
    }

    #[test]
    fn reported_result_requires_replace() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "replace");

        must(store.submit_auto_result(run_id, &passed("a.b.c", 1.0), false, &graph));
        assert!(store
            .submit_auto_result(run_id, &passed("a.b.c", 9.0), false, &graph)
            .is_err());

        let report = must(store.submit_auto_result(
            run_id,
            &skipped("a.b.c", "BLACKLISTED: flaky on this arch"),
            true,
            &graph,
        ));
        assert_eq!(report.auto_result.category, ResultCategory::Ignored);

        let manual = must(store.get_manual_result(run_id, "WI-1"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Skipped);
        assert_eq!(manual.comment.as_deref(), Some("Ignored: \"a.b.c\""));
    }

    #[test]
    fn invalid_submission_is_rejected_before_write() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "invalid");

        let mut input = passed("a.b.c", 1.0);
        input.failure = Some("boom".to_string());
        assert!(store.submit_auto_result(run_id, &input, false, &graph).is_err());
        assert!(store
            .submit_auto_result(run_id, &passed("a.b.c", -1.0), false, &graph)
            .is_err());
        assert!(must(store.list_auto_results(run_id)).is_empty());

        assert!(store.update_auto_result(run_id, &passed("x", 1.0), &graph).is_err());
    }

    #[test]
    fn update_moves_result_between_categories() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "update");

        must(store.submit_auto_result(run_id, &failed("x", 1.0, "segfault"), false, &graph));
        let report = must(store.update_auto_result(run_id, &passed("x", 2.5), &graph));
        assert_eq!(report.auto_result.category, ResultCategory::Passed);

        let manual = must(store.get_manual_result(run_id, "WI-4"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Passed);
        assert_eq!(manual.time, 2.5);
        assert!(must(store.list_linkage_errors(run_id)).is_empty());
    }

    #[test]
    fn override_is_kept_across_recompute_until_cleared() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "override");

        must(store.submit_auto_result(run_id, &failed("x", 1.0, "segfault"), false, &graph));
        let pinned = must(store.override_manual_result(
            run_id,
            "WI-4",
            ManualVerdict::Passed,
            Some("verified by hand"),
        ));
        assert!(pinned.overridden);

        must(store.submit_auto_result(run_id, &failed("x", 4.0, "another crash"), true, &graph));
        let manual = must(store.get_manual_result(run_id, "WI-4"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert_eq!(manual.result, ManualVerdict::Passed);
        assert_eq!(manual.comment.as_deref(), Some("verified by hand"));
        assert_eq!(manual.time, 4.0);
        assert!(must(store.blocking_errors(run_id, &store.default_blocking_exclude())).is_empty());

        let cleared = must(store.clear_override(run_id, "WI-4"))
            .unwrap_or_else(|| panic!("manual result missing"));
        assert!(!cleared.overridden);
        assert_eq!(cleared.result, ManualVerdict::Incomplete);
        assert_eq!(cleared.comment.as_deref(), Some("Blocking with unknown-issue: x"));

        assert!(store
            .override_manual_result(run_id, "WI-9", ManualVerdict::Failed, None)
            .is_err());
    }

    #[test]
    fn deleting_last_auto_result_removes_manual_result() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "delete");

        must(store.submit_auto_result(run_id, &passed("a.b.c", 1.0), false, &graph));
        must(store.submit_auto_result(run_id, &passed("x", 1.0), false, &graph));

        let touched = must(store.delete_auto_result(run_id, "a.b.c"));
        assert_eq!(touched, ["WI-1"]);
        assert_eq!(must(store.get_manual_result(run_id, "WI-1")), None);
        assert!(must(store.get_manual_result(run_id, "WI-4")).is_some());
        assert_eq!(must(store.list_linkage_results(run_id)).len(), 1);

        assert!(store.delete_auto_result(run_id, "a.b.c").is_err());
    }

    #[test]
    fn reset_then_refresh_rebuilds_linkage() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "refresh");

        must(store.submit_auto_result(run_id, &passed("a.b.c", 1.0), false, &graph));
        must(store.submit_auto_result(run_id, &passed("suite.pause.one", 2.0), false, &graph));
        let linkage = must(store.list_linkage_results(run_id));
        let manual = must(store.list_manual_results(run_id));

        let reset = must(store.reset_run(run_id));
        assert_eq!(reset.linkage_results_deleted, 3);
        assert_eq!(reset.manual_results_deleted, 2);
        assert!(must(store.list_linkage_results(run_id)).is_empty());
        assert_eq!(must(store.list_auto_results(run_id)).len(), 3);

        let report = must(store.refresh_run(run_id, &graph));
        assert_eq!(report.contract_version, "refresh_report.v1");
        assert_eq!(report.auto_results, 3);
        assert_eq!(report.recategorized, 0);
        assert_eq!(report.reconciled, 3);
        assert!(report.pending.is_empty());
        assert_eq!(report.statistics.auto_passed, 2);
        assert_eq!(report.statistics.auto_missing, 1);
        assert_eq!(report.statistics.manual_passed, 1);
        assert_eq!(report.statistics.manual_incomplete, 1);

        assert_eq!(must(store.list_linkage_results(run_id)), linkage);
        assert_eq!(must(store.list_manual_results(run_id)), manual);

        let run = must(store.get_run(run_id)).unwrap_or_else(|| panic!("run missing"));
        assert_eq!(run.statistics, Some(report.statistics));
    }

    #[test]
    fn refresh_rederives_categories_from_raw_fields() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "rederive");

        must(store.submit_auto_result(
            run_id,
            &skipped("a.b.c", "BLACKLISTED"),
            false,
            &graph,
        ));
        if let Err(err) = store.connection().execute(
            "UPDATE auto_results SET category = 'skipped' WHERE case_id = 'a.b.c'",
            [],
        ) {
            panic!("test failure: {err}");
        }

        let report = must(store.refresh_run(run_id, &graph));
        assert_eq!(report.recategorized, 1);
        assert_eq!(report.statistics.auto_ignored, 1);
        assert_eq!(report.statistics.auto_skipped, 0);

        let linkage = must(store.list_linkage_results(run_id));
        assert_eq!(linkage[0].result, Some(LinkageOutcome::Ignored));
        assert_eq!(linkage[0].error, Some(LinkageErrorCode::IgnoreListed));
    }

    #[test]
    fn refresh_runs_lookups_across_workers() {
        let config = EngineConfig {
            refresh_lookup_workers: 3,
            ..EngineConfig::default()
        };
        let mut store = must(SqliteResultStore::open_with_config(
            Path::new(":memory:"),
            config,
        ));
        must(store.migrate());
        let run_id = fixture_run(&store, "workers");

        for (index, case_id) in ["a.b.c", "suite.pause.one", "x", "nope.one", "nope.two"]
            .into_iter()
            .enumerate()
        {
            let time = f64::from(u32::try_from(index).unwrap_or_default());
            must(store.submit_auto_result(run_id, &passed(case_id, time), false, &FailingDirectory));
        }

        let report = must(store.refresh_run(run_id, &fixture_graph()));
        assert_eq!(report.auto_results, 5);
        assert_eq!(report.reconciled, 3);
        assert_eq!(report.pending.len(), 2);
        assert_eq!(report.statistics.auto_nolinkage, 2);
        // The placeholder for suite.pause.two is created during the refresh.
        assert_eq!(must(store.list_auto_results(run_id)).len(), 6);
    }

    #[test]
    fn statistics_count_unknown_issue_and_missing_linkage() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "statistics");

        must(store.submit_auto_result(run_id, &failed("x", 1.0, "segfault"), false, &graph));
        must(store.submit_auto_result(run_id, &passed("a.b.c", 1.0), false, &graph));
        must(store.submit_auto_result(run_id, &passed("nope.case", 1.0), false, &graph));

        let statistics = must(store.refresh_statistics(run_id));
        assert_eq!(
            statistics,
            RunStatistics {
                auto_passed: 2,
                auto_failed: 1,
                auto_unknown_issue: 1,
                auto_nolinkage: 1,
                manual_passed: 1,
                manual_incomplete: 1,
                ..RunStatistics::default()
            }
        );
    }

    #[test]
    fn submission_stamps_run_and_flags_resubmit() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "submit");
        must(store.submit_auto_result(run_id, &passed("a.b.c", 1.0), false, &graph));
        must(store.submit_auto_result(run_id, &skipped("x", "not supported"), false, &graph));

        let mut sink = RecordingSink::default();
        let first = must(store.submit_run(run_id, false, &mut sink));
        assert_eq!(
            first,
            SubmissionOutcome::Submitted {
                run_id,
                external_id: "EXT-1".to_string(),
                records: 1,
                resubmit: false,
            }
        );
        // Skipped work items are not sent.
        assert_eq!(sink.batches[0].records[0].work_item_id, "WI-1");
        assert_eq!(sink.batches[0].records[0].result, SubmissionResult::Passed);

        let run = must(store.get_run(run_id)).unwrap_or_else(|| panic!("run missing"));
        assert!(run.submit_date.is_some());
        assert_eq!(run.external_id.as_deref(), Some("EXT-1"));

        let second = must(store.submit_run(run_id, false, &mut sink));
        assert!(matches!(
            second,
            SubmissionOutcome::Submitted { resubmit: true, ref external_id, .. } if external_id == "EXT-2"
        ));
    }

    #[test]
    fn rejected_submission_leaves_run_unsubmitted() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "rejected");
        must(store.submit_auto_result(run_id, &passed("a.b.c", 1.0), false, &graph));

        let mut sink = RecordingSink {
            reject: true,
            ..RecordingSink::default()
        };
        assert!(store.submit_run(run_id, false, &mut sink).is_err());

        let run = must(store.get_run(run_id)).unwrap_or_else(|| panic!("run missing"));
        assert_eq!(run.submit_date, None);
        assert_eq!(run.external_id, None);
    }

    #[test]
    fn delete_run_removes_every_result() {
        let mut store = fixture_store();
        let graph = fixture_graph();
        let run_id = fixture_run(&store, "doomed");
        must(store.submit_auto_result(run_id, &passed("suite.pause.one", 1.0), false, &graph));

        assert!(must(store.delete_run(run_id)));
        assert!(!must(store.delete_run(run_id)));
        assert_eq!(must(store.get_run(run_id)), None);
        assert!(must(store.list_auto_results(run_id)).is_empty());
        assert!(must(store.list_manual_results(run_id)).is_empty());
    }

    const CASES: [&str; 4] = ["a.b.c", "suite.pause.one", "suite.pause.two", "x"];

    fn submission(case: usize, kind: u8, time: f64) -> AutoResultInput {
        let case_id = CASES[case % CASES.len()];
        match kind % 4 {
            0 => passed(case_id, time),
            1 => failed(case_id, time, "boom"),
            2 => failed(case_id, time, "segfault"),
            _ => skipped(case_id, "BLACKLISTED"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn manual_results_always_match_their_linkage_rows(
            steps in prop::collection::vec((0_usize..4, 0_u8..4, 0_u32..100), 1..10),
        ) {
            let mut store = fixture_store();
            let graph = fixture_graph();
            let run_id = fixture_run(&store, "property");

            for (case, kind, time) in steps {
                let input = submission(case, kind, f64::from(time));
                must(store.submit_auto_result(run_id, &input, true, &graph));
            }

            let linkage = must(store.list_linkage_results(run_id));
            let auto = must(store.list_auto_results(run_id))
                .into_iter()
                .map(|result| (result.case_id.clone(), result))
                .collect::<BTreeMap<_, _>>();

            for manual in must(store.list_manual_results(run_id)) {
                let rows = linkage
                    .iter()
                    .filter(|row| row.work_item_id == manual.work_item_id)
                    .collect::<Vec<_>>();
                prop_assert!(!rows.is_empty());

                let outcomes = rows.iter().map(|row| row.result).collect::<Vec<_>>();
                prop_assert_eq!(manual.result, aggregate_manual_result(&outcomes));

                let time = rows
                    .iter()
                    .filter_map(|row| auto.get(&row.case_id))
                    .map(|result| result.time)
                    .sum::<f64>();
                prop_assert_eq!(manual.time, time);
            }

            let repeat = linkage.clone();
            for case_id in auto.keys() {
                must(store.reconcile(run_id, case_id, &graph));
            }
            prop_assert_eq!(must(store.list_linkage_results(run_id)), repeat);
        }
    }
}
