//! Reconciliation of automated test results against manually tracked work items.
//!
//! The crate is pure: it owns the record vocabulary, the pattern and failure
//! matchers, the result derivation, the linkage planner, the ManualResult
//! precedence table, the blocking-error evaluation, and the in-memory
//! linkage graph with its consistency checker. Persistence lives in
//! `caselink-store-sqlite`.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod aggregate;
pub mod config;
pub mod consistency;
pub mod derive;
pub mod directory;
pub mod failure;
pub mod graph;
pub mod linkage;
pub mod pattern;

pub use aggregate::{
    aggregate_manual_result, evaluate_blocking_errors, precedence_rule, render_comment,
    BlockingExclude, CommentLine, PrecedenceRule, NO_LINKAGE_DATA,
};
pub use config::EngineConfig;
pub use consistency::{ConsistencyReport, ConsistencyTag, EntityRef};
pub use derive::{derive_category, validate_raw_fields, RawResultFields};
pub use directory::{
    AutoCaseLinks, LinkageDirectory, LookupError, ScopedLookup, TimeoutDirectory, WorkItemLinks,
    DEFAULT_MAX_IN_FLIGHT,
};
pub use failure::{
    classify_failure, FailureClassification, FailureSignature, SignatureClass, SignatureMatch,
};
pub use graph::{
    AutoCase, AutomationFlag, Bug, GraphSnapshot, LinkageGraph, Pattern, WorkItem,
};
pub use linkage::{compute_linkage_targets, plan_reconciliation, LinkageTarget, ReconcilePlan};
pub use pattern::pattern_matches;

pub type RunId = i64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LinkageError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("lookup error: {0}")]
    Lookup(#[from] LookupError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("graph error: {0}")]
    Graph(String),
}

/// Coarse outcome of one AutoResult, derived from its raw fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultCategory {
    Passed,
    Failed,
    Skipped,
    Ignored,
    Missing,
    Invalid,
}

impl ResultCategory {
    pub const ALL: [Self; 6] = [
        Self::Passed,
        Self::Failed,
        Self::Skipped,
        Self::Ignored,
        Self::Missing,
        Self::Invalid,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Ignored => "ignored",
            Self::Missing => "missing",
            Self::Invalid => "invalid",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "ignored" => Some(Self::Ignored),
            "missing" => Some(Self::Missing),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// Result carried by one LinkageResult row. `None` on the row means unresolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkageOutcome {
    Passed,
    Failed,
    Skipped,
    Ignored,
}

impl LinkageOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Ignored => "ignored",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }

    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::Passed => "Passed",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
            Self::Ignored => "Ignored",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LinkageErrorCode {
    UnknownIssue,
    Missing,
    IgnoreListed,
}

impl LinkageErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownIssue => "unknown-issue",
            Self::Missing => "missing",
            Self::IgnoreListed => "ignore-listed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown-issue" => Some(Self::UnknownIssue),
            "missing" => Some(Self::Missing),
            "ignore-listed" => Some(Self::IgnoreListed),
            _ => None,
        }
    }
}

impl Display for LinkageErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ManualVerdict {
    Passed,
    Failed,
    Skipped,
    Incomplete,
}

impl ManualVerdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Incomplete => "incomplete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "incomplete" => Some(Self::Incomplete),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Incomplete)
    }
}

/// Error code recorded on an AutoResult whose directory lookup did not complete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AutoLinkageError {
    NoLinkage,
    LookupFailed,
}

impl AutoLinkageError {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoLinkage => "no-linkage",
            Self::LookupFailed => "lookup-failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no-linkage" => Some(Self::NoLinkage),
            "lookup-failed" => Some(Self::LookupFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoResultInput {
    pub case_id: String,
    pub time: f64,
    pub skip: Option<String>,
    pub failure: Option<String>,
    pub output: Option<String>,
    pub source: Option<String>,
}

impl AutoResultInput {
    /// Validates a submission before it reaches the store.
    ///
    /// # Errors
    /// Returns [`LinkageError::Validation`] for an empty case id, a negative
    /// or non-finite duration, or conflicting raw fields.
    pub fn validate(&self) -> Result<(), LinkageError> {
        if self.case_id.trim().is_empty() {
            return Err(LinkageError::Validation(
                "case_id MUST be provided".to_string(),
            ));
        }

        if !self.time.is_finite() || self.time < 0.0 {
            return Err(LinkageError::Validation(
                "time MUST be a finite value >= 0".to_string(),
            ));
        }

        validate_raw_fields(&self.raw_fields())
    }

    #[must_use]
    pub fn raw_fields(&self) -> RawResultFields<'_> {
        RawResultFields {
            skip: self.skip.as_deref(),
            failure: self.failure.as_deref(),
            output: self.output.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoResult {
    pub run_id: RunId,
    pub case_id: String,
    pub time: f64,
    pub skip: Option<String>,
    pub failure: Option<String>,
    pub output: Option<String>,
    pub source: Option<String>,
    pub category: ResultCategory,
    pub comment: Option<String>,
    pub linkage_error: Option<AutoLinkageError>,
}

impl AutoResult {
    #[must_use]
    pub fn raw_fields(&self) -> RawResultFields<'_> {
        RawResultFields {
            skip: self.skip.as_deref(),
            failure: self.failure.as_deref(),
            output: self.output.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualResult {
    pub run_id: RunId,
    pub work_item_id: String,
    pub time: f64,
    pub comment: Option<String>,
    pub result: ManualVerdict,
    pub overridden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkageResult {
    pub run_id: RunId,
    pub work_item_id: String,
    pub case_id: String,
    pub result: Option<LinkageOutcome>,
    pub error: Option<LinkageErrorCode>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunInput {
    pub name: String,
    pub component: String,
    pub build: String,
    pub product: String,
    pub version: String,
    pub arch: String,
    pub run_type: String,
    pub framework: String,
    pub project: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub ci_url: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

impl RunInput {
    /// Validates run metadata before insert.
    ///
    /// # Errors
    /// Returns [`LinkageError::Validation`] when a required field is blank or
    /// the date is not UTC.
    pub fn validate(&self) -> Result<(), LinkageError> {
        for (name, value) in [
            ("name", &self.name),
            ("component", &self.component),
            ("build", &self.build),
            ("product", &self.product),
            ("version", &self.version),
            ("arch", &self.arch),
            ("run_type", &self.run_type),
            ("framework", &self.framework),
            ("project", &self.project),
        ] {
            if value.trim().is_empty() {
                return Err(LinkageError::Validation(format!(
                    "{name} MUST be provided for every run"
                )));
            }
        }

        if self.date.offset() != UtcOffset::UTC {
            return Err(LinkageError::Validation(
                "date MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunStatistics {
    pub auto_passed: u64,
    pub auto_failed: u64,
    pub auto_skipped: u64,
    pub auto_ignored: u64,
    pub auto_missing: u64,
    pub auto_invalid: u64,
    pub auto_unknown_issue: u64,
    pub auto_nolinkage: u64,
    pub manual_passed: u64,
    pub manual_failed: u64,
    pub manual_skipped: u64,
    pub manual_incomplete: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: RunId,
    pub name: String,
    pub component: String,
    pub build: String,
    pub product: String,
    pub version: String,
    pub arch: String,
    pub run_type: String,
    pub framework: String,
    pub project: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub ci_url: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub properties: BTreeMap<String, String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submit_date: Option<OffsetDateTime>,
    pub external_id: Option<String>,
    pub statistics: Option<RunStatistics>,
}

/// Result value accepted by the external requirement system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionResult {
    Passed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionRecord {
    pub work_item_id: String,
    pub result: SubmissionResult,
    pub duration: f64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionBatch {
    pub contract_version: String,
    pub run: Run,
    pub resubmit: bool,
    pub records: Vec<SubmissionRecord>,
}

impl SubmissionBatch {
    /// Builds the submission payload for a run.
    ///
    /// Skipped work items are not reported; anything not passed or failed
    /// goes out as blocked.
    #[must_use]
    pub fn build(run: Run, manual_results: &[ManualResult]) -> Self {
        let records = manual_results
            .iter()
            .filter(|item| item.result != ManualVerdict::Skipped)
            .map(|item| SubmissionRecord {
                work_item_id: item.work_item_id.clone(),
                result: match item.result {
                    ManualVerdict::Passed => SubmissionResult::Passed,
                    ManualVerdict::Failed => SubmissionResult::Failed,
                    ManualVerdict::Skipped | ManualVerdict::Incomplete => {
                        SubmissionResult::Blocked
                    }
                },
                duration: item.time,
                comment: item.comment.clone(),
            })
            .collect();

        Self {
            contract_version: "submission_batch.v1".to_string(),
            resubmit: run.submit_date.is_some(),
            run,
            records,
        }
    }
}

/// Downstream consumer of a qualified run.
pub trait SubmissionSink {
    /// Delivers the batch and returns the identifier assigned downstream.
    ///
    /// # Errors
    /// Returns an error when delivery fails; the run is then left unsubmitted.
    fn submit(&mut self, batch: &SubmissionBatch) -> Result<String, LinkageError>;
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LinkageError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LinkageError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LinkageError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LinkageError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LinkageError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LinkageError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LinkageError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
