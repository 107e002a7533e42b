//! Derivation of a [`ResultCategory`] from the raw fields of an AutoResult.

use crate::{LinkageError, ResultCategory};

/// The three mutually exclusive raw fields reported by a test framework.
///
/// Empty strings are treated as absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawResultFields<'a> {
    pub skip: Option<&'a str>,
    pub failure: Option<&'a str>,
    pub output: Option<&'a str>,
}

impl RawResultFields<'_> {
    fn populated(&self) -> usize {
        [self.skip, self.failure, self.output]
            .into_iter()
            .filter(|field| present(*field).is_some())
            .count()
    }
}

/// Rejects raw fields that populate more than one of skip/failure/output.
///
/// # Errors
/// Returns [`LinkageError::Validation`] naming the conflicting fields.
pub fn validate_raw_fields(fields: &RawResultFields<'_>) -> Result<(), LinkageError> {
    if fields.populated() <= 1 {
        return Ok(());
    }

    let names = [
        ("skip", fields.skip),
        ("failure", fields.failure),
        ("output", fields.output),
    ]
    .into_iter()
    .filter(|(_, value)| present(*value).is_some())
    .map(|(name, _)| name)
    .collect::<Vec<_>>();

    Err(LinkageError::Validation(format!(
        "at most one of skip/failure/output may be set, got {}",
        names.join("+")
    )))
}

/// Derives the category of an AutoResult. Pure; never consults the linkage graph.
#[must_use]
pub fn derive_category(fields: &RawResultFields<'_>, ignore_token: &str) -> ResultCategory {
    if fields.populated() > 1 {
        return ResultCategory::Invalid;
    }

    if let Some(skip) = present(fields.skip) {
        if !ignore_token.is_empty() && skip.contains(ignore_token) {
            return ResultCategory::Ignored;
        }
        return ResultCategory::Skipped;
    }

    if present(fields.failure).is_some() {
        return ResultCategory::Failed;
    }

    if present(fields.output).is_some() {
        return ResultCategory::Passed;
    }

    ResultCategory::Missing
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|inner| !inner.is_empty())
}
