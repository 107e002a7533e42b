//! Target LinkageResult sets for one AutoResult.
//!
//! Planning is pure with respect to the store: it consults the directory
//! through a per-call [`ScopedLookup`] and returns everything the store needs
//! to write, so a failed lookup leaves nothing half-applied.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::directory::{AutoCaseLinks, LinkageDirectory, LookupError, ScopedLookup};
use crate::failure::{classify_failure, FailureClassification, SignatureClass, SignatureMatch};
use crate::{AutoResult, LinkageErrorCode, LinkageOutcome, ResultCategory};

const INVALID_DETAIL: &str = "invalid result fields";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkageTarget {
    pub work_item_id: String,
    pub result: Option<LinkageOutcome>,
    pub error: Option<LinkageErrorCode>,
    pub detail: Option<String>,
}

impl LinkageTarget {
    fn uniform(
        work_item_id: &str,
        result: Option<LinkageOutcome>,
        error: Option<LinkageErrorCode>,
        detail: Option<&str>,
    ) -> Self {
        Self {
            work_item_id: work_item_id.to_string(),
            result,
            error,
            detail: detail.map(ToString::to_string),
        }
    }
}

/// Computes the LinkageResult rows one AutoResult should own, keyed by WorkItem.
///
/// # Errors
/// Returns [`LookupError::MalformedRecord`] when an applicable failure
/// signature carries a regex that does not compile.
pub fn compute_linkage_targets(
    category: ResultCategory,
    case_id: &str,
    failure: Option<&str>,
    links: &AutoCaseLinks,
) -> Result<BTreeMap<String, LinkageTarget>, LookupError> {
    let linked = links
        .work_item_ids
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>();

    let (result, error, detail) = match category {
        ResultCategory::Failed => {
            return classified_targets(case_id, failure.unwrap_or_default(), links, &linked);
        }
        ResultCategory::Passed => (Some(LinkageOutcome::Passed), None, None),
        ResultCategory::Skipped => (Some(LinkageOutcome::Skipped), None, None),
        ResultCategory::Ignored => (
            Some(LinkageOutcome::Ignored),
            Some(LinkageErrorCode::IgnoreListed),
            None,
        ),
        ResultCategory::Missing => (None, Some(LinkageErrorCode::Missing), None),
        ResultCategory::Invalid => (
            None,
            Some(LinkageErrorCode::UnknownIssue),
            Some(INVALID_DETAIL),
        ),
    };

    Ok(linked
        .into_iter()
        .map(|work_item_id| {
            (
                work_item_id.to_string(),
                LinkageTarget::uniform(work_item_id, result, error, detail),
            )
        })
        .collect())
}

#[derive(Default)]
struct Disposition {
    failed: bool,
    details: BTreeSet<String>,
}

impl Disposition {
    fn absorb(&mut self, hit: &SignatureMatch) {
        self.failed |= hit.classification == SignatureClass::BugAttributed;
        self.details.insert(hit.detail.clone());
    }

    fn into_target(self, work_item_id: &str) -> LinkageTarget {
        let (result, error) = if self.failed {
            (LinkageOutcome::Failed, None)
        } else {
            (LinkageOutcome::Ignored, Some(LinkageErrorCode::IgnoreListed))
        };
        LinkageTarget {
            work_item_id: work_item_id.to_string(),
            result: Some(result),
            error,
            detail: Some(self.details.into_iter().collect::<Vec<_>>().join("; ")),
        }
    }
}

fn classified_targets(
    case_id: &str,
    failure: &str,
    links: &AutoCaseLinks,
    linked: &BTreeSet<&str>,
) -> Result<BTreeMap<String, LinkageTarget>, LookupError> {
    let matches = match classify_failure(case_id, failure, &links.signatures)? {
        FailureClassification::Unclassified => {
            return Ok(linked
                .iter()
                .map(|work_item_id| {
                    (
                        (*work_item_id).to_string(),
                        LinkageTarget::uniform(
                            work_item_id,
                            None,
                            Some(LinkageErrorCode::UnknownIssue),
                            None,
                        ),
                    )
                })
                .collect());
        }
        FailureClassification::Known(matches) => matches,
    };

    let mut per_item: BTreeMap<String, Disposition> = BTreeMap::new();
    let mut overall = Disposition::default();
    for hit in &matches {
        overall.absorb(hit);
        let covered = if hit.work_items.is_empty() {
            linked.iter().map(|item| (*item).to_string()).collect()
        } else {
            hit.work_items.clone()
        };
        for work_item_id in covered {
            per_item.entry(work_item_id).or_default().absorb(hit);
        }
    }

    for work_item_id in linked {
        if !per_item.contains_key(*work_item_id) {
            per_item.insert(
                (*work_item_id).to_string(),
                Disposition {
                    failed: overall.failed,
                    details: overall.details.clone(),
                },
            );
        }
    }

    Ok(per_item
        .into_iter()
        .map(|(work_item_id, disposition)| {
            let target = disposition.into_target(&work_item_id);
            (work_item_id, target)
        })
        .collect())
}

/// Everything needed to reconcile one AutoResult in a single write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub case_id: String,
    pub targets: BTreeMap<String, LinkageTarget>,
    /// For each targeted WorkItem without a ManualResult yet, the other
    /// AutoCases linked to it. The store fills in `missing` placeholders for
    /// those that have not reported.
    pub placeholders: BTreeMap<String, Vec<String>>,
}

/// Resolves the directory view of `auto` and plans its LinkageResult rows.
///
/// `existing_manual` lists the WorkItems that already have a ManualResult in
/// the run. A WorkItem the directory does not know contributes no
/// placeholders; any other lookup failure aborts the whole plan.
///
/// # Errors
/// Returns the [`LookupError`] of the first lookup that did not complete.
pub fn plan_reconciliation<D>(
    auto: &AutoResult,
    existing_manual: &BTreeSet<String>,
    directory: &D,
) -> Result<ReconcilePlan, LookupError>
where
    D: LinkageDirectory + ?Sized,
{
    let scoped = ScopedLookup::new(directory);
    let links = scoped.lookup_auto_case(&auto.case_id)?;
    let targets = compute_linkage_targets(
        auto.category,
        &auto.case_id,
        auto.failure.as_deref(),
        &links,
    )?;

    let mut placeholders = BTreeMap::new();
    for work_item_id in targets.keys() {
        if existing_manual.contains(work_item_id) {
            continue;
        }
        let siblings = match scoped.lookup_work_item(work_item_id) {
            Ok(found) => found
                .auto_case_ids
                .into_iter()
                .filter(|case_id| case_id != &auto.case_id)
                .collect(),
            Err(LookupError::NotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        placeholders.insert(work_item_id.clone(), siblings);
    }

    Ok(ReconcilePlan {
        case_id: auto.case_id.clone(),
        targets,
        placeholders,
    })
}
