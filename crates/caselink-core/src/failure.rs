//! Classification of failure messages against the known-failure library.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::directory::LookupError;
use crate::pattern::pattern_matches;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureClass {
    BugAttributed,
    IgnoreListed,
}

impl SignatureClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BugAttributed => "bug-attributed",
            Self::IgnoreListed => "ignore-listed",
        }
    }
}

/// A known failure: a regex over failure text, scoped to an AutoCase pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureSignature {
    pub id: String,
    pub regex: String,
    pub classification: SignatureClass,
    pub bug_id: Option<String>,
    pub scope_pattern: String,
    /// WorkItems this signature speaks for, already resolved through its bug.
    /// Empty means every WorkItem linked to the failing AutoCase.
    #[serde(default)]
    pub work_items: Vec<String>,
    pub description: Option<String>,
}

impl FailureSignature {
    /// Compiles the signature regex.
    ///
    /// # Errors
    /// Returns [`LookupError::MalformedRecord`] when the regex does not compile.
    pub fn compile(&self) -> Result<Regex, LookupError> {
        Regex::new(&self.regex).map_err(|_| LookupError::MalformedRecord {
            entity: "failure_signature".to_string(),
            id: self.id.clone(),
            field: "regex".to_string(),
        })
    }

    #[must_use]
    pub fn in_scope(&self, case_id: &str) -> bool {
        pattern_matches(&self.scope_pattern, case_id)
    }

    /// True when the AutoCase is in scope and the regex finds a match anywhere
    /// in the failure text.
    ///
    /// # Errors
    /// Returns [`LookupError::MalformedRecord`] when the regex does not compile.
    pub fn applies(&self, case_id: &str, failure: &str) -> Result<bool, LookupError> {
        if !self.in_scope(case_id) {
            return Ok(false);
        }
        Ok(self.compile()?.is_match(failure))
    }

    fn detail(&self) -> String {
        let bug = self
            .bug_id
            .as_deref()
            .map_or_else(|| "no bug".to_string(), |bug| format!("bug {bug}"));
        match self.description.as_deref() {
            Some(description) if !description.is_empty() => {
                format!("{} {}: {}", self.classification.as_str(), bug, description)
            }
            _ => format!("{} {}", self.classification.as_str(), bug),
        }
    }
}

/// One applicable signature for a given failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureMatch {
    pub signature_id: String,
    pub classification: SignatureClass,
    pub bug_id: Option<String>,
    pub work_items: BTreeSet<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "matches")]
pub enum FailureClassification {
    Known(Vec<SignatureMatch>),
    Unclassified,
}

/// Matches a failure message against every signature in scope for `case_id`.
///
/// The regex uses search semantics. All applicable signatures are returned, in
/// signature-id order.
///
/// # Errors
/// Returns [`LookupError::MalformedRecord`] when any in-scope signature carries
/// a regex that does not compile, so a bad record never yields a partial
/// classification.
pub fn classify_failure(
    case_id: &str,
    failure: &str,
    signatures: &[FailureSignature],
) -> Result<FailureClassification, LookupError> {
    let mut ordered = signatures
        .iter()
        .filter(|signature| signature.in_scope(case_id))
        .collect::<Vec<_>>();
    ordered.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));

    let mut matches = Vec::new();
    for signature in ordered {
        if signature.applies(case_id, failure)? {
            matches.push(SignatureMatch {
                signature_id: signature.id.clone(),
                classification: signature.classification,
                bug_id: signature.bug_id.clone(),
                work_items: signature.work_items.iter().cloned().collect(),
                detail: signature.detail(),
            });
        }
    }

    if matches.is_empty() {
        Ok(FailureClassification::Unclassified)
    } else {
        Ok(FailureClassification::Known(matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(id: &str, regex: &str, classification: SignatureClass) -> FailureSignature {
        FailureSignature {
            id: id.to_string(),
            regex: regex.to_string(),
            classification,
            bug_id: Some("BZ-1".to_string()),
            scope_pattern: "virsh..start".to_string(),
            work_items: vec!["WI-1".to_string()],
            description: Some("guest fails to boot".to_string()),
        }
    }

    #[test]
    fn regex_uses_search_semantics() {
        let signatures = [signature("s1", "timed? ?out", SignatureClass::BugAttributed)];
        let result = classify_failure("virsh.domain.start", "operation timed out after 30s", &signatures);
        match result {
            Ok(FailureClassification::Known(matches)) => {
                assert_eq!(matches.len(), 1);
                assert_eq!(matches[0].detail, "bug-attributed bug BZ-1: guest fails to boot");
            }
            other => panic!("expected known failure, got {other:?}"),
        }
    }

    #[test]
    fn out_of_scope_signatures_do_not_apply() {
        let signatures = [signature("s1", "boom", SignatureClass::BugAttributed)];
        let result = classify_failure("virsh.domain.destroy", "boom", &signatures);
        assert_eq!(result, Ok(FailureClassification::Unclassified));
    }

    #[test]
    fn every_applicable_signature_contributes() {
        let signatures = [
            signature("s2", "boom", SignatureClass::IgnoreListed),
            signature("s1", "bo+m", SignatureClass::BugAttributed),
        ];
        let result = classify_failure("virsh.start", "boom", &signatures);
        match result {
            Ok(FailureClassification::Known(matches)) => {
                let ids = matches
                    .iter()
                    .map(|item| item.signature_id.as_str())
                    .collect::<Vec<_>>();
                assert_eq!(ids, ["s1", "s2"]);
            }
            other => panic!("expected known failure, got {other:?}"),
        }
    }

    #[test]
    fn malformed_regex_is_a_lookup_error() {
        let signatures = [signature("bad", "(unclosed", SignatureClass::BugAttributed)];
        let result = classify_failure("virsh.start", "boom", &signatures);
        assert!(matches!(
            result,
            Err(LookupError::MalformedRecord { ref field, .. }) if field == "regex"
        ));
    }
}
