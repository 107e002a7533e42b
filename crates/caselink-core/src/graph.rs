//! In-memory arena of linkage-directory entities.
//!
//! Entities are addressed by their string ids and relations are kept as
//! explicit id-to-id edge sets, so the consistency checker can walk the graph
//! without holding references into it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consistency::{ConsistencyTag, EntityRef};
use crate::directory::{AutoCaseLinks, LinkageDirectory, LookupError, WorkItemLinks};
use crate::failure::{FailureSignature, SignatureClass};
use crate::pattern::pattern_matches;
use crate::LinkageError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AutomationFlag {
    Automated,
    NotAutomated,
    ManualOnly,
    Updating,
}

impl AutomationFlag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automated => "automated",
            Self::NotAutomated => "not-automated",
            Self::ManualOnly => "manual-only",
            Self::Updating => "updating",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "automated" => Some(Self::Automated),
            "not-automated" | "notautomated" => Some(Self::NotAutomated),
            "manual-only" | "manualonly" => Some(Self::ManualOnly),
            "updating" => Some(Self::Updating),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub item_type: String,
    pub automation: AutomationFlag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoCase {
    pub id: String,
    pub archs: Vec<String>,
    pub framework: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pattern {
    pub id: String,
    pub work_item_id: String,
    pub pattern: String,
    pub framework: Option<String>,
    /// WorkItem title as recorded when the pattern was written.
    pub title: Option<String>,
}

impl Pattern {
    #[must_use]
    pub fn matches(&self, case: &AutoCase) -> bool {
        if let (Some(lhs), Some(rhs)) = (self.framework.as_deref(), case.framework.as_deref()) {
            if lhs != rhs {
                return false;
            }
        }
        pattern_matches(&self.pattern, &case.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bug {
    pub id: String,
    pub work_items: Vec<String>,
}

/// On-disk form of the graph. Every field is optional so that missing data is
/// reported as a malformed record instead of a decoding failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub work_items: Vec<WorkItemRecord>,
    #[serde(default)]
    pub auto_cases: Vec<AutoCaseRecord>,
    #[serde(default)]
    pub patterns: Vec<PatternRecord>,
    #[serde(default)]
    pub failure_signatures: Vec<SignatureRecord>,
    #[serde(default)]
    pub bugs: Vec<BugRecord>,
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<ConsistencyTag>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkItemRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub automation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AutoCaseRecord {
    pub id: Option<String>,
    #[serde(default)]
    pub archs: Vec<String>,
    pub framework: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PatternRecord {
    pub id: Option<String>,
    pub work_item_id: Option<String>,
    pub pattern: Option<String>,
    pub framework: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SignatureRecord {
    pub id: Option<String>,
    pub regex: Option<String>,
    pub classification: Option<SignatureClass>,
    pub bug_id: Option<String>,
    pub scope_pattern: Option<String>,
    #[serde(default)]
    pub work_items: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BugRecord {
    pub id: Option<String>,
    #[serde(default)]
    pub work_items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkageGraph {
    pub(crate) work_items: BTreeMap<String, WorkItem>,
    pub(crate) auto_cases: BTreeMap<String, AutoCase>,
    pub(crate) patterns: BTreeMap<String, Pattern>,
    pub(crate) signatures: BTreeMap<String, FailureSignature>,
    pub(crate) bugs: BTreeMap<String, Bug>,
    pub(crate) case_patterns: BTreeMap<String, BTreeSet<String>>,
    pub(crate) pattern_cases: BTreeMap<String, BTreeSet<String>>,
    pub(crate) work_item_patterns: BTreeMap<String, BTreeSet<String>>,
    pub(crate) tags: BTreeMap<EntityRef, BTreeSet<ConsistencyTag>>,
}

impl LinkageGraph {
    /// Builds the arena from a decoded snapshot.
    ///
    /// # Errors
    /// Returns [`LookupError::MalformedRecord`] for the first record lacking
    /// a required field, and [`LinkageError::Graph`] for duplicate ids or
    /// unparseable tag keys.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, LinkageError> {
        let mut graph = Self::default();

        for (index, record) in snapshot.work_items.into_iter().enumerate() {
            let id = required("work_item", &index.to_string(), "id", record.id)?;
            let automation = match record.automation.as_deref() {
                None => AutomationFlag::NotAutomated,
                Some(raw) => AutomationFlag::parse(raw).ok_or_else(|| {
                    malformed("work_item", &id, "automation")
                })?,
            };
            let item = WorkItem {
                title: record.title.unwrap_or_default(),
                item_type: record.item_type.unwrap_or_default(),
                automation,
                id: id.clone(),
            };
            insert_unique(&mut graph.work_items, id, item, "work_item")?;
        }

        for (index, record) in snapshot.auto_cases.into_iter().enumerate() {
            let id = required("auto_case", &index.to_string(), "id", record.id)?;
            let case = AutoCase {
                id: id.clone(),
                archs: record.archs,
                framework: record.framework,
            };
            insert_unique(&mut graph.auto_cases, id, case, "auto_case")?;
        }

        for (index, record) in snapshot.patterns.into_iter().enumerate() {
            let id = required("pattern", &index.to_string(), "id", record.id)?;
            let pattern = Pattern {
                work_item_id: required("pattern", &id, "work_item_id", record.work_item_id)?,
                pattern: required("pattern", &id, "pattern", record.pattern)?,
                framework: record.framework,
                title: record.title,
                id: id.clone(),
            };
            insert_unique(&mut graph.patterns, id, pattern, "pattern")?;
        }

        for (index, record) in snapshot.bugs.into_iter().enumerate() {
            let id = required("bug", &index.to_string(), "id", record.id)?;
            let bug = Bug {
                id: id.clone(),
                work_items: record.work_items,
            };
            insert_unique(&mut graph.bugs, id, bug, "bug")?;
        }

        for (index, record) in snapshot.failure_signatures.into_iter().enumerate() {
            let id = required("failure_signature", &index.to_string(), "id", record.id)?;
            let signature = FailureSignature {
                regex: required("failure_signature", &id, "regex", record.regex)?,
                classification: required(
                    "failure_signature",
                    &id,
                    "classification",
                    record.classification,
                )?,
                scope_pattern: required(
                    "failure_signature",
                    &id,
                    "scope_pattern",
                    record.scope_pattern,
                )?,
                bug_id: record.bug_id,
                work_items: record.work_items,
                description: record.description,
                id: id.clone(),
            };
            insert_unique(&mut graph.signatures, id, signature, "failure_signature")?;
        }

        graph.rebuild_edges();

        for (raw, tags) in snapshot.tags {
            let entity = raw.parse::<EntityRef>()?;
            if !tags.is_empty() {
                graph.tags.insert(entity, tags.into_iter().collect());
            }
        }

        Ok(graph)
    }

    /// Reads a JSON snapshot from disk.
    ///
    /// # Errors
    /// Returns [`LinkageError::Graph`] on I/O or JSON errors and propagates
    /// [`Self::from_snapshot`] failures.
    pub fn load(path: &Path) -> Result<Self, LinkageError> {
        let body = std::fs::read_to_string(path).map_err(|err| {
            LinkageError::Graph(format!("failed to read {}: {err}", path.display()))
        })?;
        let snapshot: GraphSnapshot = serde_json::from_str(&body).map_err(|err| {
            LinkageError::Graph(format!("invalid graph snapshot {}: {err}", path.display()))
        })?;
        Self::from_snapshot(snapshot)
    }

    /// Writes the graph, including consistency tags, back as a JSON snapshot.
    ///
    /// # Errors
    /// Returns [`LinkageError::Graph`] on serialization or I/O errors.
    pub fn save(&self, path: &Path) -> Result<(), LinkageError> {
        let body = serde_json::to_string_pretty(&self.to_snapshot())
            .map_err(|err| LinkageError::Graph(format!("failed to encode snapshot: {err}")))?;
        std::fs::write(path, body).map_err(|err| {
            LinkageError::Graph(format!("failed to write {}: {err}", path.display()))
        })
    }

    #[must_use]
    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            work_items: self
                .work_items
                .values()
                .map(|item| WorkItemRecord {
                    id: Some(item.id.clone()),
                    title: Some(item.title.clone()),
                    item_type: Some(item.item_type.clone()),
                    automation: Some(item.automation.as_str().to_string()),
                })
                .collect(),
            auto_cases: self
                .auto_cases
                .values()
                .map(|case| AutoCaseRecord {
                    id: Some(case.id.clone()),
                    archs: case.archs.clone(),
                    framework: case.framework.clone(),
                })
                .collect(),
            patterns: self
                .patterns
                .values()
                .map(|pattern| PatternRecord {
                    id: Some(pattern.id.clone()),
                    work_item_id: Some(pattern.work_item_id.clone()),
                    pattern: Some(pattern.pattern.clone()),
                    framework: pattern.framework.clone(),
                    title: pattern.title.clone(),
                })
                .collect(),
            failure_signatures: self
                .signatures
                .values()
                .map(|signature| SignatureRecord {
                    id: Some(signature.id.clone()),
                    regex: Some(signature.regex.clone()),
                    classification: Some(signature.classification),
                    bug_id: signature.bug_id.clone(),
                    scope_pattern: Some(signature.scope_pattern.clone()),
                    work_items: signature.work_items.clone(),
                    description: signature.description.clone(),
                })
                .collect(),
            bugs: self
                .bugs
                .values()
                .map(|bug| BugRecord {
                    id: Some(bug.id.clone()),
                    work_items: bug.work_items.clone(),
                })
                .collect(),
            tags: self
                .tags
                .iter()
                .map(|(entity, tags)| (entity.to_string(), tags.iter().copied().collect()))
                .collect(),
        }
    }

    #[must_use]
    pub fn work_item(&self, id: &str) -> Option<&WorkItem> {
        self.work_items.get(id)
    }

    #[must_use]
    pub fn auto_case(&self, id: &str) -> Option<&AutoCase> {
        self.auto_cases.get(id)
    }

    #[must_use]
    pub fn pattern(&self, id: &str) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    /// Patterns matching an AutoCase, by pattern id.
    #[must_use]
    pub fn patterns_for_case(&self, case_id: &str) -> Vec<&Pattern> {
        self.case_patterns
            .get(case_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.patterns.get(id))
            .collect()
    }

    #[must_use]
    pub fn cases_for_pattern(&self, pattern_id: &str) -> Vec<&str> {
        self.pattern_cases
            .get(pattern_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    #[must_use]
    pub fn patterns_for_work_item(&self, work_item_id: &str) -> Vec<&Pattern> {
        self.work_item_patterns
            .get(work_item_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.patterns.get(id))
            .collect()
    }

    #[must_use]
    pub fn tags_for(&self, entity: &EntityRef) -> BTreeSet<ConsistencyTag> {
        self.tags.get(entity).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn tagged_entities(&self) -> &BTreeMap<EntityRef, BTreeSet<ConsistencyTag>> {
        &self.tags
    }

    pub(crate) fn insert_work_item(&mut self, item: WorkItem) -> Option<WorkItem> {
        self.work_items.insert(item.id.clone(), item)
    }

    pub(crate) fn remove_work_item(&mut self, id: &str) -> Option<WorkItem> {
        self.work_items.remove(id)
    }

    pub(crate) fn insert_auto_case(&mut self, case: AutoCase) -> Option<AutoCase> {
        let id = case.id.clone();
        let previous = self.auto_cases.insert(id.clone(), case);
        self.unlink_case(&id);
        self.link_case(&id);
        previous
    }

    pub(crate) fn remove_auto_case(&mut self, id: &str) -> Option<AutoCase> {
        self.unlink_case(id);
        self.case_patterns.remove(id);
        self.auto_cases.remove(id)
    }

    pub(crate) fn insert_pattern(&mut self, pattern: Pattern) -> Option<Pattern> {
        let id = pattern.id.clone();
        let previous = self.remove_pattern(&id);
        self.work_item_patterns
            .entry(pattern.work_item_id.clone())
            .or_default()
            .insert(id.clone());
        self.patterns.insert(id.clone(), pattern);
        self.link_pattern(&id);
        previous
    }

    pub(crate) fn remove_pattern(&mut self, id: &str) -> Option<Pattern> {
        let previous = self.patterns.remove(id)?;
        if let Some(cases) = self.pattern_cases.remove(id) {
            for case_id in cases {
                if let Some(patterns) = self.case_patterns.get_mut(&case_id) {
                    patterns.remove(id);
                }
            }
        }
        if let Some(patterns) = self.work_item_patterns.get_mut(&previous.work_item_id) {
            patterns.remove(id);
            if patterns.is_empty() {
                self.work_item_patterns.remove(&previous.work_item_id);
            }
        }
        Some(previous)
    }

    pub(crate) fn set_tags(&mut self, entity: EntityRef, tags: BTreeSet<ConsistencyTag>) {
        if tags.is_empty() {
            self.tags.remove(&entity);
        } else {
            self.tags.insert(entity, tags);
        }
    }

    fn rebuild_edges(&mut self) {
        self.case_patterns.clear();
        self.pattern_cases.clear();
        self.work_item_patterns.clear();

        for pattern in self.patterns.values() {
            self.work_item_patterns
                .entry(pattern.work_item_id.clone())
                .or_default()
                .insert(pattern.id.clone());
            for case in self.auto_cases.values() {
                if pattern.matches(case) {
                    self.pattern_cases
                        .entry(pattern.id.clone())
                        .or_default()
                        .insert(case.id.clone());
                    self.case_patterns
                        .entry(case.id.clone())
                        .or_default()
                        .insert(pattern.id.clone());
                }
            }
        }
    }

    fn link_case(&mut self, case_id: &str) {
        let Some(case) = self.auto_cases.get(case_id) else {
            return;
        };
        let matched = self
            .patterns
            .values()
            .filter(|pattern| pattern.matches(case))
            .map(|pattern| pattern.id.clone())
            .collect::<BTreeSet<_>>();
        for pattern_id in &matched {
            self.pattern_cases
                .entry(pattern_id.clone())
                .or_default()
                .insert(case_id.to_string());
        }
        if !matched.is_empty() {
            self.case_patterns.insert(case_id.to_string(), matched);
        }
    }

    fn unlink_case(&mut self, case_id: &str) {
        if let Some(patterns) = self.case_patterns.remove(case_id) {
            for pattern_id in patterns {
                if let Some(cases) = self.pattern_cases.get_mut(&pattern_id) {
                    cases.remove(case_id);
                }
            }
        }
    }

    fn link_pattern(&mut self, pattern_id: &str) {
        let Some(pattern) = self.patterns.get(pattern_id) else {
            return;
        };
        let matched = self
            .auto_cases
            .values()
            .filter(|case| pattern.matches(case))
            .map(|case| case.id.clone())
            .collect::<BTreeSet<_>>();
        for case_id in &matched {
            self.case_patterns
                .entry(case_id.clone())
                .or_default()
                .insert(pattern_id.to_string());
        }
        if !matched.is_empty() {
            self.pattern_cases.insert(pattern_id.to_string(), matched);
        }
    }

    fn signature_work_items(&self, signature: &FailureSignature) -> Vec<String> {
        let mut items = signature
            .work_items
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>();
        if let Some(bug) = signature
            .bug_id
            .as_deref()
            .and_then(|bug_id| self.bugs.get(bug_id))
        {
            items.extend(bug.work_items.iter().cloned());
        }
        items.into_iter().collect()
    }
}

impl LinkageDirectory for LinkageGraph {
    fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError> {
        if !self.auto_cases.contains_key(case_id) {
            return Err(LookupError::NotFound {
                entity: "auto_case".to_string(),
                id: case_id.to_string(),
            });
        }

        let work_item_ids = self
            .patterns_for_case(case_id)
            .into_iter()
            .map(|pattern| pattern.work_item_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let signatures = self
            .signatures
            .values()
            .filter(|signature| signature.in_scope(case_id))
            .map(|signature| FailureSignature {
                work_items: self.signature_work_items(signature),
                ..signature.clone()
            })
            .collect();

        Ok(AutoCaseLinks {
            case_id: case_id.to_string(),
            work_item_ids,
            signatures,
        })
    }

    fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
        let patterns = self.work_item_patterns.get(work_item_id);
        if !self.work_items.contains_key(work_item_id) && patterns.is_none() {
            return Err(LookupError::NotFound {
                entity: "work_item".to_string(),
                id: work_item_id.to_string(),
            });
        }

        let auto_case_ids = patterns
            .into_iter()
            .flatten()
            .filter_map(|pattern_id| self.pattern_cases.get(pattern_id))
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(WorkItemLinks {
            work_item_id: work_item_id.to_string(),
            auto_case_ids,
        })
    }
}

fn required<T>(entity: &str, id: &str, field: &str, value: Option<T>) -> Result<T, LookupError> {
    value.ok_or_else(|| malformed(entity, id, field))
}

fn malformed(entity: &str, id: &str, field: &str) -> LookupError {
    LookupError::MalformedRecord {
        entity: entity.to_string(),
        id: id.to_string(),
        field: field.to_string(),
    }
}

fn insert_unique<T>(
    map: &mut BTreeMap<String, T>,
    id: String,
    value: T,
    entity: &str,
) -> Result<(), LinkageError> {
    if map.contains_key(&id) {
        return Err(LinkageError::Graph(format!("duplicate {entity} id {id}")));
    }
    map.insert(id, value);
    Ok(())
}
