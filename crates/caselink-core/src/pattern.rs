//! Dotted-identifier pattern matching.
//!
//! A pattern is a list of segment groups separated by `..`, where `..` stands
//! for any run of segments (possibly none). Each group is located greedily by
//! the first occurrence of its head segment; the scan never backtracks.

use std::collections::VecDeque;

pub const GROUP_SEPARATOR: &str = "..";
pub const SEGMENT_SEPARATOR: char = '.';

/// Returns true when `candidate` matches `pattern`.
///
/// Leading tokens before the first group and trailing tokens after the last
/// group are allowed. A pattern with no segments matches nothing.
#[must_use]
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    let groups = segment_groups(pattern);
    if groups.is_empty() {
        return false;
    }

    let mut tokens: VecDeque<&str> = candidate.split(SEGMENT_SEPARATOR).collect();

    for group in &groups {
        loop {
            if tokens.len() < group.len() {
                return false;
            }

            if group_matches_front(group, &tokens) {
                tokens.drain(..group.len());
                break;
            }

            let _ = tokens.pop_front();
        }
    }

    true
}

fn segment_groups(pattern: &str) -> Vec<Vec<&str>> {
    pattern
        .split(GROUP_SEPARATOR)
        .map(|group| group.trim_matches(SEGMENT_SEPARATOR))
        .filter(|group| !group.is_empty())
        .map(|group| group.split(SEGMENT_SEPARATOR).collect())
        .collect()
}

fn group_matches_front(group: &[&str], tokens: &VecDeque<&str>) -> bool {
    group
        .iter()
        .zip(tokens.iter())
        .all(|(expected, actual)| expected == actual)
}
