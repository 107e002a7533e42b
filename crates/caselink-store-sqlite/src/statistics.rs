//! Run-level aggregation: denormalized statistics, blocking errors and
//! submission gating.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use caselink_core::{
    evaluate_blocking_errors, format_rfc3339, now_utc, BlockingExclude, LinkageErrorCode,
    ManualVerdict, ResultCategory, Run, RunId, RunStatistics, SubmissionBatch, SubmissionSink,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::{collect_rows, SqliteResultStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SubmissionPlan {
    Blocked { run_id: RunId, errors: Vec<String> },
    Ready { batch: SubmissionBatch },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SubmissionOutcome {
    Blocked {
        run_id: RunId,
        errors: Vec<String>,
    },
    Submitted {
        run_id: RunId,
        external_id: String,
        records: usize,
        resubmit: bool,
    },
}

impl SqliteResultStore {
    /// Recomputes the denormalized counters of a run from scratch.
    pub fn refresh_statistics(&self, run_id: RunId) -> Result<RunStatistics> {
        self.require_run(run_id)?;

        let auto_counts = self.grouped_counts(
            "SELECT category, COUNT(*) FROM auto_results WHERE run_id = ?1 GROUP BY category",
            run_id,
        )?;
        let manual_counts = self.grouped_counts(
            "SELECT result, COUNT(*) FROM manual_results WHERE run_id = ?1 GROUP BY result",
            run_id,
        )?;
        let auto_unknown_issue = self.count(
            "SELECT COUNT(DISTINCT l.case_id)
             FROM linkage_results l
             JOIN auto_results a ON a.run_id = l.run_id AND a.case_id = l.case_id
             WHERE l.run_id = ?1 AND l.error = ?2 AND a.category = ?3",
            params![
                run_id,
                LinkageErrorCode::UnknownIssue.as_str(),
                ResultCategory::Failed.as_str()
            ],
        )?;
        let auto_nolinkage = self.count(
            "SELECT COUNT(*) FROM auto_results WHERE run_id = ?1 AND linkage_error IS NOT NULL",
            params![run_id],
        )?;

        let auto = |category: ResultCategory| {
            auto_counts.get(category.as_str()).copied().unwrap_or(0)
        };
        let manual = |verdict: ManualVerdict| {
            manual_counts.get(verdict.as_str()).copied().unwrap_or(0)
        };

        let statistics = RunStatistics {
            auto_passed: auto(ResultCategory::Passed),
            auto_failed: auto(ResultCategory::Failed),
            auto_skipped: auto(ResultCategory::Skipped),
            auto_ignored: auto(ResultCategory::Ignored),
            auto_missing: auto(ResultCategory::Missing),
            auto_invalid: auto(ResultCategory::Invalid),
            auto_unknown_issue,
            auto_nolinkage,
            manual_passed: manual(ManualVerdict::Passed),
            manual_failed: manual(ManualVerdict::Failed),
            manual_skipped: manual(ManualVerdict::Skipped),
            manual_incomplete: manual(ManualVerdict::Incomplete),
        };

        let as_sql = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);
        self.conn
            .execute(
                "UPDATE runs SET
                   auto_passed = ?2, auto_failed = ?3, auto_skipped = ?4, auto_ignored = ?5,
                   auto_missing = ?6, auto_invalid = ?7, auto_unknown_issue = ?8,
                   auto_nolinkage = ?9, manual_passed = ?10, manual_failed = ?11,
                   manual_skipped = ?12, manual_incomplete = ?13
                 WHERE run_id = ?1",
                params![
                    run_id,
                    as_sql(statistics.auto_passed),
                    as_sql(statistics.auto_failed),
                    as_sql(statistics.auto_skipped),
                    as_sql(statistics.auto_ignored),
                    as_sql(statistics.auto_missing),
                    as_sql(statistics.auto_invalid),
                    as_sql(statistics.auto_unknown_issue),
                    as_sql(statistics.auto_nolinkage),
                    as_sql(statistics.manual_passed),
                    as_sql(statistics.manual_failed),
                    as_sql(statistics.manual_skipped),
                    as_sql(statistics.manual_incomplete),
                ],
            )
            .context("failed to store run statistics")?;

        Ok(statistics)
    }

    /// Exclusion used when a caller does not name one.
    #[must_use]
    pub fn default_blocking_exclude(&self) -> BlockingExclude {
        BlockingExclude::Codes(self.config.blocking_exclude())
    }

    /// Reasons the run may not be submitted yet. Read-only.
    pub fn blocking_errors(&self, run_id: RunId, exclude: &BlockingExclude) -> Result<Vec<String>> {
        self.require_run(run_id)?;
        let linkage = self.list_linkage_results(run_id)?;
        let manual = self.list_manual_results(run_id)?;
        let auto = self.list_auto_results(run_id)?;
        Ok(evaluate_blocking_errors(&linkage, &manual, &auto, exclude))
    }

    /// Builds the submission batch for a run, or reports why it is blocked.
    ///
    /// `forced` excludes every error code; a run without linkage data still
    /// blocks.
    pub fn prepare_submission(&self, run_id: RunId, forced: bool) -> Result<SubmissionPlan> {
        let run = self
            .get_run(run_id)?
            .ok_or_else(|| anyhow!("run {run_id} not found"))?;
        let exclude = if forced {
            BlockingExclude::All
        } else {
            self.default_blocking_exclude()
        };

        let errors = self.blocking_errors(run_id, &exclude)?;
        if !errors.is_empty() {
            tracing::warn!(run_id, forced, errors = errors.len(), "submission blocked");
            return Ok(SubmissionPlan::Blocked { run_id, errors });
        }

        let manual = self.list_manual_results(run_id)?;
        Ok(SubmissionPlan::Ready {
            batch: SubmissionBatch::build(run, &manual),
        })
    }

    /// Stamps a run as submitted. A later submission overwrites both values.
    pub fn mark_submitted(&self, run_id: RunId, external_id: &str) -> Result<Run> {
        let now = format_rfc3339(now_utc())?;
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET submit_date = ?2, external_id = ?3 WHERE run_id = ?1",
                params![run_id, now, external_id],
            )
            .context("failed to mark run submitted")?;
        if updated == 0 {
            return Err(anyhow!("run {run_id} not found"));
        }

        tracing::info!(run_id, external_id, "run submitted");
        self.get_run(run_id)?
            .ok_or_else(|| anyhow!("run {run_id} vanished after submission"))
    }

    /// Prepares, delivers and stamps a run in one step.
    pub fn submit_run(
        &self,
        run_id: RunId,
        forced: bool,
        sink: &mut dyn SubmissionSink,
    ) -> Result<SubmissionOutcome> {
        let batch = match self.prepare_submission(run_id, forced)? {
            SubmissionPlan::Blocked { run_id, errors } => {
                return Ok(SubmissionOutcome::Blocked { run_id, errors });
            }
            SubmissionPlan::Ready { batch } => batch,
        };

        let external_id = sink
            .submit(&batch)
            .map_err(|err| anyhow!("submission sink rejected run {run_id}: {err}"))?;
        self.mark_submitted(run_id, &external_id)?;

        Ok(SubmissionOutcome::Submitted {
            run_id,
            external_id,
            records: batch.records.len(),
            resubmit: batch.resubmit,
        })
    }

    fn grouped_counts(&self, sql: &str, run_id: RunId) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for (key, raw) in collect_rows(rows)? {
            let count =
                u64::try_from(raw).with_context(|| format!("invalid count for {key}: {raw}"))?;
            counts.insert(key, count);
        }
        Ok(counts)
    }

    fn count(&self, sql: &str, params: impl rusqlite::Params) -> Result<u64> {
        let raw: i64 = self.conn.query_row(sql, params, |row| row.get(0))?;
        u64::try_from(raw).with_context(|| format!("invalid count: {raw}"))
    }
}
