//! ManualResult precedence, comment rendering and run-level blocking errors.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{AutoResult, LinkageErrorCode, LinkageOutcome, LinkageResult, ManualResult, ManualVerdict};

/// Blocking message for a run that has no LinkageResult rows at all.
pub const NO_LINKAGE_DATA: &str = "no linkage data";

/// One row of the ManualResult precedence table, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PrecedenceRule {
    AnyFailed,
    AnyUnresolved,
    PassedWithIgnored,
    SkippedOrIgnored,
    Fallback,
}

const PRECEDENCE: [PrecedenceRule; 5] = [
    PrecedenceRule::AnyFailed,
    PrecedenceRule::AnyUnresolved,
    PrecedenceRule::PassedWithIgnored,
    PrecedenceRule::SkippedOrIgnored,
    PrecedenceRule::Fallback,
];

impl PrecedenceRule {
    fn applies(self, results: &[Option<LinkageOutcome>]) -> bool {
        match self {
            Self::AnyFailed => results.contains(&Some(LinkageOutcome::Failed)),
            Self::AnyUnresolved => results.contains(&None),
            Self::PassedWithIgnored => {
                results.iter().all(|result| {
                    matches!(
                        result,
                        Some(LinkageOutcome::Passed | LinkageOutcome::Ignored)
                    )
                }) && results.contains(&Some(LinkageOutcome::Passed))
            }
            Self::SkippedOrIgnored => results.iter().all(|result| {
                matches!(
                    result,
                    Some(LinkageOutcome::Skipped | LinkageOutcome::Ignored)
                )
            }),
            Self::Fallback => true,
        }
    }

    #[must_use]
    pub fn verdict(self) -> ManualVerdict {
        match self {
            Self::AnyFailed => ManualVerdict::Failed,
            Self::PassedWithIgnored => ManualVerdict::Passed,
            Self::SkippedOrIgnored => ManualVerdict::Skipped,
            Self::AnyUnresolved | Self::Fallback => ManualVerdict::Incomplete,
        }
    }
}

/// First rule of the precedence table that matches `results`.
#[must_use]
pub fn precedence_rule(results: &[Option<LinkageOutcome>]) -> Option<PrecedenceRule> {
    PRECEDENCE.into_iter().find(|rule| rule.applies(results))
}

/// Resolves a ManualResult verdict from the full set of its LinkageResult outcomes.
#[must_use]
pub fn aggregate_manual_result(results: &[Option<LinkageOutcome>]) -> ManualVerdict {
    if let Some(rule) = precedence_rule(results) {
        return rule.verdict();
    }

    tracing::error!(
        rows = results.len(),
        "linkage results matched no precedence rule; defaulting to incomplete"
    );
    ManualVerdict::Incomplete
}

/// One line of a human-readable result comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentLine<'a> {
    /// The other endpoint: AutoCase id on a ManualResult, WorkItem id on an AutoResult.
    pub subject: &'a str,
    pub result: Option<LinkageOutcome>,
    pub error: Option<LinkageErrorCode>,
    pub detail: Option<&'a str>,
}

impl CommentLine<'_> {
    fn render(&self) -> String {
        match (self.result, self.detail.filter(|detail| !detail.is_empty())) {
            (Some(result), Some(detail)) => {
                format!("{}: \"{}\" with detail: {}", result.title(), self.subject, detail)
            }
            (Some(result), None) => format!("{}: \"{}\"", result.title(), self.subject),
            (None, _) => format!(
                "Blocking with {}: {}",
                self.error.map_or("unresolved", LinkageErrorCode::as_str),
                self.subject
            ),
        }
    }
}

/// Renders one sorted line per LinkageResult, joined by newlines.
#[must_use]
pub fn render_comment(lines: &[CommentLine<'_>]) -> String {
    let mut rendered = lines.iter().map(CommentLine::render).collect::<Vec<_>>();
    rendered.sort();
    rendered.join("\n")
}

/// Error codes a caller chooses not to block on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockingExclude {
    /// Forced submission: only a run without linkage data still blocks.
    All,
    Codes(BTreeSet<String>),
}

impl BlockingExclude {
    fn excludes(&self, code: &str) -> bool {
        match self {
            Self::All => true,
            Self::Codes(codes) => codes.contains(code),
        }
    }
}

/// Lists the reasons a run may not be submitted downstream.
///
/// A LinkageResult blocks when it has no result, carries an error that is
/// not excluded, and its ManualResult has no terminal verdict. An AutoResult blocks when its
/// directory lookup never completed and that code is not excluded.
#[must_use]
pub fn evaluate_blocking_errors(
    linkage: &[LinkageResult],
    manual: &[ManualResult],
    auto: &[AutoResult],
    exclude: &BlockingExclude,
) -> Vec<String> {
    if linkage.is_empty() {
        return vec![NO_LINKAGE_DATA.to_string()];
    }

    let verdicts = manual
        .iter()
        .map(|item| (item.work_item_id.as_str(), item.result))
        .collect::<BTreeMap<_, _>>();

    let mut ordered = linkage.iter().collect::<Vec<_>>();
    ordered.sort();

    let mut errors = Vec::new();
    for row in ordered {
        if row.result.is_some() {
            continue;
        }
        let Some(error) = row.error else {
            continue;
        };
        if exclude.excludes(error.as_str()) {
            continue;
        }
        let terminal = verdicts
            .get(row.work_item_id.as_str())
            .is_some_and(|verdict| verdict.is_terminal());
        if terminal {
            continue;
        }
        errors.push(format!(
            "auto case {} is blocking {} with error {}",
            row.case_id, row.work_item_id, error
        ));
    }

    let mut pending = auto
        .iter()
        .filter_map(|result| result.linkage_error.map(|code| (result.case_id.as_str(), code)))
        .filter(|(_, code)| !exclude.excludes(code.as_str()))
        .collect::<Vec<_>>();
    pending.sort_unstable();
    errors.extend(pending.into_iter().map(|(case_id, code)| {
        format!("auto case {case_id} is unreconciled with error {}", code.as_str())
    }));

    errors
}
