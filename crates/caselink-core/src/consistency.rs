//! Depth-bounded structural checks over the [`LinkageGraph`].
//!
//! Each check recomputes only the tag set of the entity it runs on. Related
//! entities are re-checked level by level while depth remains, and an entity
//! is checked at most once per pass, so cycles between WorkItems, Patterns and
//! AutoCases always terminate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::graph::{AutoCase, AutomationFlag, LinkageGraph, Pattern, WorkItem};
use crate::LinkageError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyTag {
    DuplicateTitle,
    MultiPattern,
    AutomationInconsistency,
    TitleInconsistency,
    NoWorkitem,
    MultipleWorkitem,
    PatternInvalid,
    PatternDuplicate,
}

impl ConsistencyTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateTitle => "DUPLICATE_TITLE",
            Self::MultiPattern => "MULTI_PATTERN",
            Self::AutomationInconsistency => "AUTOMATION_INCONSISTENCY",
            Self::TitleInconsistency => "TITLE_INCONSISTENCY",
            Self::NoWorkitem => "NO_WORKITEM",
            Self::MultipleWorkitem => "MULTIPLE_WORKITEM",
            Self::PatternInvalid => "PATTERN_INVALID",
            Self::PatternDuplicate => "PATTERN_DUPLICATE",
        }
    }
}

/// Address of one graph entity, written as `kind:id`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntityRef {
    WorkItem(String),
    AutoCase(String),
    Pattern(String),
}

impl EntityRef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::WorkItem(id) | Self::AutoCase(id) | Self::Pattern(id) => id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkItem(_) => "work_item",
            Self::AutoCase(_) => "auto_case",
            Self::Pattern(_) => "pattern",
        }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl FromStr for EntityRef {
    type Err = LinkageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((kind, id)) = value.split_once(':') else {
            return Err(LinkageError::Graph(format!(
                "entity reference {value:?} MUST look like kind:id"
            )));
        };
        if id.is_empty() {
            return Err(LinkageError::Graph(format!(
                "entity reference {value:?} has an empty id"
            )));
        }
        match kind {
            "work_item" => Ok(Self::WorkItem(id.to_string())),
            "auto_case" => Ok(Self::AutoCase(id.to_string())),
            "pattern" => Ok(Self::Pattern(id.to_string())),
            other => Err(LinkageError::Graph(format!(
                "unknown entity kind {other:?}; expected work_item, auto_case or pattern"
            ))),
        }
    }
}

impl From<EntityRef> for String {
    fn from(value: EntityRef) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for EntityRef {
    type Error = LinkageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub contract_version: String,
    pub root: Option<EntityRef>,
    pub depth: u32,
    /// Entities re-checked, in visit order.
    pub visited: Vec<EntityRef>,
    /// Current tags of every visited entity that carries at least one.
    pub tags: BTreeMap<EntityRef, BTreeSet<ConsistencyTag>>,
}

impl ConsistencyReport {
    fn new(root: Option<EntityRef>, depth: u32) -> Self {
        Self {
            contract_version: "consistency_report.v1".to_string(),
            root,
            depth,
            visited: Vec::new(),
            tags: BTreeMap::new(),
        }
    }
}

impl LinkageGraph {
    /// Re-checks `entity`, then its structural neighbours up to `depth` hops.
    ///
    /// `depth == 0` recomputes the entity alone.
    pub fn check_consistency(&mut self, entity: &EntityRef, depth: u32) -> ConsistencyReport {
        self.propagate(entity.clone(), Vec::new(), depth)
    }

    /// Re-checks every entity in the graph without cascading.
    pub fn check_all(&mut self) -> ConsistencyReport {
        let mut report = ConsistencyReport::new(None, 0);

        let mut entities = self
            .work_items
            .keys()
            .cloned()
            .map(EntityRef::WorkItem)
            .collect::<Vec<_>>();
        entities.extend(self.auto_cases.keys().cloned().map(EntityRef::AutoCase));
        entities.extend(self.patterns.keys().cloned().map(EntityRef::Pattern));

        self.tags.retain(|entity, _| entities.contains(entity));

        for entity in entities {
            self.recheck(&entity, &mut report);
        }
        report
    }

    pub fn upsert_work_item(&mut self, item: WorkItem, depth: u32) -> ConsistencyReport {
        let entity = EntityRef::WorkItem(item.id.clone());
        let stale = self.related(&entity);
        self.insert_work_item(item);
        self.propagate(entity, stale, depth)
    }

    /// # Errors
    /// Returns [`LinkageError::Graph`] when no such WorkItem exists.
    pub fn delete_work_item(
        &mut self,
        id: &str,
        depth: u32,
    ) -> Result<ConsistencyReport, LinkageError> {
        let entity = EntityRef::WorkItem(id.to_string());
        let stale = self.related(&entity);
        self.remove_work_item(id)
            .ok_or_else(|| LinkageError::Graph(format!("work item {id} not found")))?;
        Ok(self.propagate(entity, stale, depth))
    }

    pub fn upsert_auto_case(&mut self, case: AutoCase, depth: u32) -> ConsistencyReport {
        let entity = EntityRef::AutoCase(case.id.clone());
        let stale = self.related(&entity);
        self.insert_auto_case(case);
        self.propagate(entity, stale, depth)
    }

    /// # Errors
    /// Returns [`LinkageError::Graph`] when no such AutoCase exists.
    pub fn delete_auto_case(
        &mut self,
        id: &str,
        depth: u32,
    ) -> Result<ConsistencyReport, LinkageError> {
        let entity = EntityRef::AutoCase(id.to_string());
        let stale = self.related(&entity);
        self.remove_auto_case(id)
            .ok_or_else(|| LinkageError::Graph(format!("auto case {id} not found")))?;
        Ok(self.propagate(entity, stale, depth))
    }

    /// # Errors
    /// Returns [`LinkageError::Validation`] when the pattern string or work item
    /// id is blank.
    pub fn upsert_pattern(
        &mut self,
        pattern: Pattern,
        depth: u32,
    ) -> Result<ConsistencyReport, LinkageError> {
        if pattern.pattern.trim().is_empty() {
            return Err(LinkageError::Validation(
                "pattern string MUST be provided".to_string(),
            ));
        }
        if pattern.work_item_id.trim().is_empty() {
            return Err(LinkageError::Validation(
                "pattern work_item_id MUST be provided".to_string(),
            ));
        }

        let entity = EntityRef::Pattern(pattern.id.clone());
        let stale = self.related(&entity);
        self.insert_pattern(pattern);
        Ok(self.propagate(entity, stale, depth))
    }

    /// # Errors
    /// Returns [`LinkageError::Graph`] when no such Pattern exists.
    pub fn delete_pattern(
        &mut self,
        id: &str,
        depth: u32,
    ) -> Result<ConsistencyReport, LinkageError> {
        let entity = EntityRef::Pattern(id.to_string());
        let stale = self.related(&entity);
        self.remove_pattern(id)
            .ok_or_else(|| LinkageError::Graph(format!("pattern {id} not found")))?;
        Ok(self.propagate(entity, stale, depth))
    }

    /// Breadth-first re-check. `stale` holds neighbours captured before a
    /// mutation; they join the first cascade level.
    fn propagate(
        &mut self,
        root: EntityRef,
        stale: Vec<EntityRef>,
        depth: u32,
    ) -> ConsistencyReport {
        let mut report = ConsistencyReport::new(Some(root.clone()), depth);
        let mut seen = BTreeSet::new();
        let mut frontier = vec![root];
        let mut pending_stale = Some(stale);
        let mut remaining = depth;

        loop {
            let mut next = Vec::new();
            for entity in frontier {
                if !seen.insert(entity.clone()) {
                    continue;
                }
                self.recheck(&entity, &mut report);
                if remaining > 0 {
                    next.extend(self.related(&entity));
                }
            }

            if remaining == 0 {
                break;
            }
            if let Some(stale) = pending_stale.take() {
                next.extend(stale);
            }
            next.retain(|entity| !seen.contains(entity));
            if next.is_empty() {
                break;
            }
            remaining -= 1;
            frontier = next;
        }

        report
    }

    fn recheck(&mut self, entity: &EntityRef, report: &mut ConsistencyReport) {
        let tags = match entity {
            EntityRef::WorkItem(id) => self.work_item_tags(id),
            EntityRef::AutoCase(id) => self.auto_case_tags(id),
            EntityRef::Pattern(id) => self.pattern_tags(id),
        };

        if !tags.is_empty() {
            tracing::debug!(
                entity = %entity,
                tags = ?tags.iter().map(|tag| tag.as_str()).collect::<Vec<_>>(),
                "consistency tags raised"
            );
            report.tags.insert(entity.clone(), tags.clone());
        }
        report.visited.push(entity.clone());
        self.set_tags(entity.clone(), tags);
    }

    fn work_item_tags(&self, id: &str) -> BTreeSet<ConsistencyTag> {
        let mut tags = BTreeSet::new();
        let Some(item) = self.work_items.get(id) else {
            return tags;
        };

        if !item.title.is_empty()
            && self
                .work_items
                .values()
                .any(|other| other.id != item.id && other.title == item.title)
        {
            tags.insert(ConsistencyTag::DuplicateTitle);
        }

        let patterns = self.patterns_for_work_item(id);
        if patterns.len() > 1 {
            tags.insert(ConsistencyTag::MultiPattern);
        }

        let inconsistent = match item.automation {
            AutomationFlag::Automated => patterns.is_empty(),
            AutomationFlag::NotAutomated | AutomationFlag::ManualOnly => !patterns.is_empty(),
            AutomationFlag::Updating => false,
        };
        if inconsistent {
            tags.insert(ConsistencyTag::AutomationInconsistency);
        }

        if patterns
            .iter()
            .any(|pattern| pattern.title.as_deref().is_some_and(|title| title != item.title))
        {
            tags.insert(ConsistencyTag::TitleInconsistency);
        }

        tags
    }

    fn auto_case_tags(&self, id: &str) -> BTreeSet<ConsistencyTag> {
        let mut tags = BTreeSet::new();
        if !self.auto_cases.contains_key(id) {
            return tags;
        }

        match self.patterns_for_case(id).len() {
            0 => {
                tags.insert(ConsistencyTag::NoWorkitem);
            }
            1 => {}
            _ => {
                tags.insert(ConsistencyTag::MultipleWorkitem);
            }
        }
        tags
    }

    fn pattern_tags(&self, id: &str) -> BTreeSet<ConsistencyTag> {
        let mut tags = BTreeSet::new();
        let Some(pattern) = self.patterns.get(id) else {
            return tags;
        };

        if self.cases_for_pattern(id).is_empty() {
            tags.insert(ConsistencyTag::PatternInvalid);
        }
        if self
            .patterns
            .values()
            .any(|other| other.id != pattern.id && other.pattern == pattern.pattern)
        {
            tags.insert(ConsistencyTag::PatternDuplicate);
        }
        tags
    }

    /// Structural neighbours of an entity in the current graph.
    fn related(&self, entity: &EntityRef) -> Vec<EntityRef> {
        match entity {
            EntityRef::WorkItem(id) => {
                let mut related = self
                    .patterns_for_work_item(id)
                    .into_iter()
                    .map(|pattern| EntityRef::Pattern(pattern.id.clone()))
                    .collect::<Vec<_>>();
                if let Some(item) = self.work_items.get(id).filter(|item| !item.title.is_empty())
                {
                    related.extend(
                        self.work_items
                            .values()
                            .filter(|other| other.id != item.id && other.title == item.title)
                            .map(|other| EntityRef::WorkItem(other.id.clone())),
                    );
                }
                related
            }
            EntityRef::AutoCase(id) => self
                .patterns_for_case(id)
                .into_iter()
                .map(|pattern| EntityRef::Pattern(pattern.id.clone()))
                .collect(),
            EntityRef::Pattern(id) => {
                let Some(pattern) = self.patterns.get(id) else {
                    return Vec::new();
                };
                let mut related = vec![EntityRef::WorkItem(pattern.work_item_id.clone())];
                related.extend(
                    self.cases_for_pattern(id)
                        .into_iter()
                        .map(|case_id| EntityRef::AutoCase(case_id.to_string())),
                );
                related.extend(
                    self.patterns
                        .values()
                        .filter(|other| other.id != pattern.id && other.pattern == pattern.pattern)
                        .map(|other| EntityRef::Pattern(other.id.clone())),
                );
                related
            }
        }
    }
}
