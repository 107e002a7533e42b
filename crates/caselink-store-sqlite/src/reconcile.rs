//! Reconciliation writes: AutoResult submission, LinkageResult upserts and
//! ManualResult recomputation.
//!
//! Directory lookups always happen before a transaction is opened. Every write
//! for one AutoResult then runs inside a single `BEGIN IMMEDIATE` transaction,
//! which holds the database write lock across the LinkageResult upserts and
//! the recomputation of each touched ManualResult.

use std::collections::BTreeSet;
use std::thread;

use anyhow::{anyhow, Context, Result};
use caselink_core::{
    aggregate_manual_result, derive_category, plan_reconciliation, render_comment,
    AutoLinkageError, AutoResult, AutoResultInput, CommentLine, LinkageDirectory, LinkageErrorCode,
    LinkageOutcome, LookupError, ManualResult, ManualVerdict, ReconcilePlan, ResultCategory,
    RunId, RunStatistics,
};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::{
    bool_to_sql, collect_rows, parse_linkage_outcome, query_manual_result, SqliteResultStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ReconcileOutcome {
    /// The full target set was written.
    Reconciled {
        case_id: String,
        work_items: Vec<String>,
    },
    /// The directory did not answer; nothing was written and the AutoResult
    /// carries `error` until a later reconcile succeeds.
    Pending {
        case_id: String,
        error: AutoLinkageError,
        message: String,
        retryable: bool,
    },
}

impl ReconcileOutcome {
    #[must_use]
    pub fn is_reconciled(&self) -> bool {
        matches!(self, Self::Reconciled { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReport {
    pub auto_result: AutoResult,
    pub reconcile: ReconcileOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshReport {
    pub contract_version: String,
    pub run_id: RunId,
    pub auto_results: usize,
    pub recategorized: usize,
    pub reconciled: usize,
    pub pending: Vec<ReconcileOutcome>,
    pub statistics: RunStatistics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetReport {
    pub run_id: RunId,
    pub linkage_results_deleted: usize,
    pub manual_results_deleted: usize,
}

impl SqliteResultStore {
    /// Records a reported AutoResult and reconciles it.
    ///
    /// A case that already has a reported (non-missing) result is rejected
    /// unless `replace` is set; a missing placeholder is filled in place.
    pub fn submit_auto_result<D>(
        &mut self,
        run_id: RunId,
        input: &AutoResultInput,
        replace: bool,
        directory: &D,
    ) -> Result<SubmitReport>
    where
        D: LinkageDirectory + ?Sized,
    {
        input
            .validate()
            .map_err(|err| anyhow!("auto result validation failed: {err}"))?;
        self.require_run(run_id)?;

        if let Some(existing) = self.get_auto_result(run_id, &input.case_id)? {
            if existing.category != ResultCategory::Missing && !replace {
                return Err(anyhow!(
                    "auto result {} already reported in run {run_id} as {}; pass replace to overwrite",
                    input.case_id,
                    existing.category.as_str()
                ));
            }
        }

        self.write_auto_result(run_id, input, directory)
    }

    /// Rewrites the raw fields of an existing AutoResult, re-derives its
    /// category and reconciles it.
    pub fn update_auto_result<D>(
        &mut self,
        run_id: RunId,
        input: &AutoResultInput,
        directory: &D,
    ) -> Result<SubmitReport>
    where
        D: LinkageDirectory + ?Sized,
    {
        input
            .validate()
            .map_err(|err| anyhow!("auto result validation failed: {err}"))?;
        if self.get_auto_result(run_id, &input.case_id)?.is_none() {
            return Err(anyhow!(
                "auto result {} not found in run {run_id}",
                input.case_id
            ));
        }

        self.write_auto_result(run_id, input, directory)
    }

    /// Deletes an AutoResult, its LinkageResult rows, and recomputes every
    /// ManualResult it contributed to. Returns the touched WorkItem ids.
    pub fn delete_auto_result(&mut self, run_id: RunId, case_id: &str) -> Result<Vec<String>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start auto result delete transaction")?;

        let touched = linked_work_items(&tx, run_id, case_id)?;
        let deleted = tx
            .execute(
                "DELETE FROM auto_results WHERE run_id = ?1 AND case_id = ?2",
                params![run_id, case_id],
            )
            .context("failed to delete auto result")?;
        if deleted == 0 {
            return Err(anyhow!("auto result {case_id} not found in run {run_id}"));
        }

        for work_item_id in &touched {
            recompute_manual_result(&tx, run_id, work_item_id)?;
        }
        tx.commit().context("failed to commit auto result delete")?;

        tracing::info!(run_id, case_id, touched = touched.len(), "auto result deleted");
        Ok(touched)
    }

    /// Reconciles one AutoResult against the directory.
    ///
    /// Safe to repeat: a second call with an unchanged directory rewrites the
    /// same rows.
    pub fn reconcile<D>(
        &mut self,
        run_id: RunId,
        case_id: &str,
        directory: &D,
    ) -> Result<ReconcileOutcome>
    where
        D: LinkageDirectory + ?Sized,
    {
        let auto = self
            .get_auto_result(run_id, case_id)?
            .ok_or_else(|| anyhow!("auto result {case_id} not found in run {run_id}"))?;
        let existing_manual = self.manual_work_item_ids(run_id)?;

        match plan_reconciliation(&auto, &existing_manual, directory) {
            Ok(plan) => self.apply_plan(run_id, &plan),
            Err(err) => self.record_lookup_failure(run_id, case_id, &err),
        }
    }

    /// Re-derives and re-reconciles every AutoResult of a run, then refreshes
    /// the run statistics.
    ///
    /// Directory lookups run on up to `refresh_lookup_workers` scoped threads;
    /// the resulting writes are applied one AutoResult at a time.
    pub fn refresh_run<D>(&mut self, run_id: RunId, directory: &D) -> Result<RefreshReport>
    where
        D: LinkageDirectory + Sync + ?Sized,
    {
        self.require_run(run_id)?;
        let recategorized = self.rederive_categories(run_id)?;
        let autos = self.list_auto_results(run_id)?;
        let existing_manual = self.manual_work_item_ids(run_id)?;
        let workers = self.config.refresh_lookup_workers;

        let plans = plan_in_parallel(&autos, &existing_manual, directory, workers)?;

        let mut reconciled = 0_usize;
        let mut pending = Vec::new();
        for (auto, plan) in autos.iter().zip(plans) {
            let outcome = match plan {
                Ok(plan) => self.apply_plan(run_id, &plan)?,
                Err(err) => self.record_lookup_failure(run_id, &auto.case_id, &err)?,
            };
            if outcome.is_reconciled() {
                reconciled += 1;
            } else {
                pending.push(outcome);
            }
        }

        let statistics = self.refresh_statistics(run_id)?;
        tracing::info!(
            run_id,
            auto_results = autos.len(),
            recategorized,
            reconciled,
            pending = pending.len(),
            "run refreshed"
        );

        Ok(RefreshReport {
            contract_version: "refresh_report.v1".to_string(),
            run_id,
            auto_results: autos.len(),
            recategorized,
            reconciled,
            pending,
            statistics,
        })
    }

    /// Drops every LinkageResult and ManualResult of a run; AutoResults stay.
    pub fn reset_run(&mut self, run_id: RunId) -> Result<ResetReport> {
        self.require_run(run_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reset transaction")?;
        let linkage_results_deleted = tx
            .execute("DELETE FROM linkage_results WHERE run_id = ?1", params![run_id])
            .context("failed to delete linkage results")?;
        let manual_results_deleted = tx
            .execute("DELETE FROM manual_results WHERE run_id = ?1", params![run_id])
            .context("failed to delete manual results")?;
        tx.execute(
            "UPDATE auto_results SET comment = NULL WHERE run_id = ?1",
            params![run_id],
        )
        .context("failed to clear auto result comments")?;
        tx.commit().context("failed to commit reset")?;

        tracing::info!(
            run_id,
            linkage_results_deleted,
            manual_results_deleted,
            "run reset"
        );
        Ok(ResetReport {
            run_id,
            linkage_results_deleted,
            manual_results_deleted,
        })
    }

    /// Pins a ManualResult verdict. Recomputation keeps the pinned result and
    /// comment but still refreshes the time.
    pub fn override_manual_result(
        &mut self,
        run_id: RunId,
        work_item_id: &str,
        result: ManualVerdict,
        comment: Option<&str>,
    ) -> Result<ManualResult> {
        let updated = self
            .conn
            .execute(
                "UPDATE manual_results SET result = ?3, comment = ?4, overridden = ?5
                 WHERE run_id = ?1 AND work_item_id = ?2",
                params![run_id, work_item_id, result.as_str(), comment, bool_to_sql(true)],
            )
            .context("failed to override manual result")?;
        if updated == 0 {
            return Err(anyhow!(
                "manual result {work_item_id} not found in run {run_id}"
            ));
        }

        tracing::info!(run_id, work_item_id, result = result.as_str(), "manual result overridden");
        query_manual_result(&self.conn, run_id, work_item_id)?
            .ok_or_else(|| anyhow!("manual result {work_item_id} vanished after override"))
    }

    /// Returns a ManualResult to engine control and recomputes it.
    pub fn clear_override(&mut self, run_id: RunId, work_item_id: &str) -> Result<Option<ManualResult>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start clear-override transaction")?;
        let updated = tx
            .execute(
                "UPDATE manual_results SET overridden = 0 WHERE run_id = ?1 AND work_item_id = ?2",
                params![run_id, work_item_id],
            )
            .context("failed to clear override")?;
        if updated == 0 {
            return Err(anyhow!(
                "manual result {work_item_id} not found in run {run_id}"
            ));
        }
        recompute_manual_result(&tx, run_id, work_item_id)?;
        tx.commit().context("failed to commit clear-override")?;

        query_manual_result(&self.conn, run_id, work_item_id)
    }

    fn write_auto_result<D>(
        &mut self,
        run_id: RunId,
        input: &AutoResultInput,
        directory: &D,
    ) -> Result<SubmitReport>
    where
        D: LinkageDirectory + ?Sized,
    {
        let category = derive_category(&input.raw_fields(), &self.config.ignore_token);
        self.conn
            .execute(
                "INSERT INTO auto_results(run_id, case_id, time, skip, failure, output, source, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(run_id, case_id) DO UPDATE SET
                   time = excluded.time,
                   skip = excluded.skip,
                   failure = excluded.failure,
                   output = excluded.output,
                   source = excluded.source,
                   category = excluded.category",
                params![
                    run_id,
                    input.case_id,
                    input.time,
                    input.skip,
                    input.failure,
                    input.output,
                    input.source,
                    category.as_str(),
                ],
            )
            .context("failed to write auto result")?;
        tracing::debug!(run_id, case_id = %input.case_id, category = category.as_str(), "auto result recorded");

        let reconcile = self.reconcile(run_id, &input.case_id, directory)?;
        let auto_result = self
            .get_auto_result(run_id, &input.case_id)?
            .ok_or_else(|| anyhow!("auto result {} vanished after write", input.case_id))?;

        Ok(SubmitReport {
            auto_result,
            reconcile,
        })
    }

    fn rederive_categories(&mut self, run_id: RunId) -> Result<usize> {
        let autos = self.list_auto_results(run_id)?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start re-derivation transaction")?;
        let mut changed = 0_usize;
        for auto in &autos {
            let category = derive_category(&auto.raw_fields(), &self.config.ignore_token);
            if category != auto.category {
                tx.execute(
                    "UPDATE auto_results SET category = ?3 WHERE run_id = ?1 AND case_id = ?2",
                    params![run_id, auto.case_id, category.as_str()],
                )
                .context("failed to update auto result category")?;
                changed += 1;
            }
        }
        tx.commit().context("failed to commit re-derivation")?;
        Ok(changed)
    }

    fn record_lookup_failure(
        &self,
        run_id: RunId,
        case_id: &str,
        err: &LookupError,
    ) -> Result<ReconcileOutcome> {
        let code = err.code();
        tracing::warn!(run_id, case_id, error = %err, code = code.as_str(), "linkage lookup failed");
        self.conn
            .execute(
                "UPDATE auto_results SET linkage_error = ?3 WHERE run_id = ?1 AND case_id = ?2",
                params![run_id, case_id, code.as_str()],
            )
            .context("failed to record linkage error")?;

        Ok(ReconcileOutcome::Pending {
            case_id: case_id.to_string(),
            error: code,
            message: err.to_string(),
            retryable: err.is_retryable(),
        })
    }

    fn apply_plan(&mut self, run_id: RunId, plan: &ReconcilePlan) -> Result<ReconcileOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reconcile transaction")?;

        let mut touched = linked_work_items(&tx, run_id, &plan.case_id)?
            .into_iter()
            .collect::<BTreeSet<_>>();
        for stale in touched.iter().filter(|id| !plan.targets.contains_key(*id)) {
            tx.execute(
                "DELETE FROM linkage_results WHERE run_id = ?1 AND work_item_id = ?2 AND case_id = ?3",
                params![run_id, stale, plan.case_id],
            )
            .context("failed to delete stale linkage result")?;
        }

        let mut affected_cases = BTreeSet::from([plan.case_id.clone()]);
        for (work_item_id, target) in &plan.targets {
            let created = tx
                .execute(
                    "INSERT OR IGNORE INTO manual_results(run_id, work_item_id, result)
                     VALUES (?1, ?2, 'incomplete')",
                    params![run_id, work_item_id],
                )
                .context("failed to create manual result")?
                == 1;

            if created {
                for sibling in plan.placeholders.get(work_item_id).into_iter().flatten() {
                    if insert_missing_placeholder(&tx, run_id, work_item_id, sibling)? {
                        affected_cases.insert(sibling.clone());
                    }
                }
            }

            tx.execute(
                "INSERT INTO linkage_results(run_id, work_item_id, case_id, result, error, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id, work_item_id, case_id) DO UPDATE SET
                   result = excluded.result,
                   error = excluded.error,
                   detail = excluded.detail",
                params![
                    run_id,
                    work_item_id,
                    plan.case_id,
                    target.result.map(LinkageOutcome::as_str),
                    target.error.map(LinkageErrorCode::as_str),
                    target.detail,
                ],
            )
            .context("failed to upsert linkage result")?;
            touched.insert(work_item_id.clone());
        }

        for work_item_id in &touched {
            recompute_manual_result(&tx, run_id, work_item_id)?;
        }
        for case_id in &affected_cases {
            refresh_auto_comment(&tx, run_id, case_id)?;
        }
        tx.execute(
            "UPDATE auto_results SET linkage_error = NULL WHERE run_id = ?1 AND case_id = ?2",
            params![run_id, plan.case_id],
        )
        .context("failed to clear linkage error")?;
        tx.commit().context("failed to commit reconcile")?;

        let work_items = plan.targets.keys().cloned().collect::<Vec<_>>();
        tracing::debug!(
            run_id,
            case_id = %plan.case_id,
            work_items = work_items.len(),
            placeholders = affected_cases.len() - 1,
            "auto result reconciled"
        );
        Ok(ReconcileOutcome::Reconciled {
            case_id: plan.case_id.clone(),
            work_items,
        })
    }
}

fn plan_in_parallel<D>(
    autos: &[AutoResult],
    existing_manual: &BTreeSet<String>,
    directory: &D,
    workers: usize,
) -> Result<Vec<Result<ReconcilePlan, LookupError>>>
where
    D: LinkageDirectory + Sync + ?Sized,
{
    if autos.is_empty() {
        return Ok(Vec::new());
    }
    let chunk_size = autos.len().div_ceil(workers.max(1));

    thread::scope(|scope| {
        let handles = autos
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|auto| plan_reconciliation(auto, existing_manual, directory))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut plans = Vec::with_capacity(autos.len());
        for handle in handles {
            let chunk = handle
                .join()
                .map_err(|_| anyhow!("linkage lookup worker panicked"))?;
            plans.extend(chunk);
        }
        Ok(plans)
    })
}

fn linked_work_items(conn: &Connection, run_id: RunId, case_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT work_item_id FROM linkage_results
         WHERE run_id = ?1 AND case_id = ?2
         ORDER BY work_item_id ASC",
    )?;
    let rows = stmt.query_map(params![run_id, case_id], |row| row.get::<_, String>(0))?;
    collect_rows(rows)
}

/// Creates a `missing` AutoResult and its LinkageResult for a case that has
/// not reported yet. Returns false when the case already has an AutoResult.
fn insert_missing_placeholder(
    conn: &Connection,
    run_id: RunId,
    work_item_id: &str,
    case_id: &str,
) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO auto_results(run_id, case_id, time, category)
             VALUES (?1, ?2, 0.0, ?3)",
            params![run_id, case_id, ResultCategory::Missing.as_str()],
        )
        .context("failed to insert missing placeholder")?;
    if inserted == 0 {
        return Ok(false);
    }

    conn.execute(
        "INSERT OR IGNORE INTO linkage_results(run_id, work_item_id, case_id, result, error)
         VALUES (?1, ?2, ?3, NULL, ?4)",
        params![run_id, work_item_id, case_id, LinkageErrorCode::Missing.as_str()],
    )
    .context("failed to insert missing linkage placeholder")?;
    Ok(true)
}

struct ManualRow {
    case_id: String,
    result: Option<LinkageOutcome>,
    error: Option<LinkageErrorCode>,
    detail: Option<String>,
    time: f64,
}

/// Rebuilds one ManualResult from its full LinkageResult set. A ManualResult
/// left with no rows is deleted.
fn recompute_manual_result(conn: &Connection, run_id: RunId, work_item_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT l.case_id, l.result, l.error, l.detail, a.time
         FROM linkage_results l
         JOIN auto_results a ON a.run_id = l.run_id AND a.case_id = l.case_id
         WHERE l.run_id = ?1 AND l.work_item_id = ?2
         ORDER BY l.case_id ASC",
    )?;
    let rows = stmt.query_map(params![run_id, work_item_id], |row| {
        let (result, error) = parse_linkage_outcome(row, 1, 2)?;
        Ok(ManualRow {
            case_id: row.get(0)?,
            result,
            error,
            detail: row.get(3)?,
            time: row.get(4)?,
        })
    })?;
    let rows = collect_rows(rows)?;

    if rows.is_empty() {
        conn.execute(
            "DELETE FROM manual_results WHERE run_id = ?1 AND work_item_id = ?2",
            params![run_id, work_item_id],
        )
        .context("failed to delete empty manual result")?;
        tracing::debug!(run_id, work_item_id, "manual result removed with its last linkage");
        return Ok(());
    }

    let outcomes = rows.iter().map(|row| row.result).collect::<Vec<_>>();
    let verdict = aggregate_manual_result(&outcomes);
    let time = rows.iter().map(|row| row.time).sum::<f64>();
    let lines = rows
        .iter()
        .map(|row| CommentLine {
            subject: &row.case_id,
            result: row.result,
            error: row.error,
            detail: row.detail.as_deref(),
        })
        .collect::<Vec<_>>();
    let comment = render_comment(&lines);

    conn.execute(
        "UPDATE manual_results SET
           time = ?3,
           result = CASE WHEN overridden = 1 THEN result ELSE ?4 END,
           comment = CASE WHEN overridden = 1 THEN comment ELSE ?5 END
         WHERE run_id = ?1 AND work_item_id = ?2",
        params![run_id, work_item_id, time, verdict.as_str(), comment],
    )
    .context("failed to update manual result")?;
    Ok(())
}

fn refresh_auto_comment(conn: &Connection, run_id: RunId, case_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT work_item_id, result, error, detail FROM linkage_results
         WHERE run_id = ?1 AND case_id = ?2",
    )?;
    let rows = stmt.query_map(params![run_id, case_id], |row| {
        let (result, error) = parse_linkage_outcome(row, 1, 2)?;
        Ok((
            row.get::<_, String>(0)?,
            result,
            error,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;
    let rows = collect_rows(rows)?;

    let lines = rows
        .iter()
        .map(|(work_item_id, result, error, detail)| CommentLine {
            subject: work_item_id,
            result: *result,
            error: *error,
            detail: detail.as_deref(),
        })
        .collect::<Vec<_>>();
    let comment = Some(render_comment(&lines)).filter(|comment| !comment.is_empty());

    conn.execute(
        "UPDATE auto_results SET comment = ?3 WHERE run_id = ?1 AND case_id = ?2",
        params![run_id, case_id, comment],
    )
    .context("failed to update auto result comment")?;
    Ok(())
}
