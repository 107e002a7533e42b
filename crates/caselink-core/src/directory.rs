//! Read-only access to the external linkage directory.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::FailureSignature;
use crate::AutoLinkageError;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LookupError {
    #[error("{entity} {id} not found in linkage directory")]
    NotFound { entity: String, id: String },
    #[error("transient directory failure: {0}")]
    Transient(String),
    #[error("directory lookup for {id} timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },
    #[error("malformed {entity} record {id}: missing or invalid field {field}")]
    MalformedRecord {
        entity: String,
        id: String,
        field: String,
    },
}

impl LookupError {
    /// Error code recorded on the AutoResult whose reconciliation this failure blocked.
    #[must_use]
    pub fn code(&self) -> AutoLinkageError {
        match self {
            Self::NotFound { .. } => AutoLinkageError::NoLinkage,
            Self::Transient(_) | Self::Timeout { .. } | Self::MalformedRecord { .. } => {
                AutoLinkageError::LookupFailed
            }
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

/// Directory view of one AutoCase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AutoCaseLinks {
    pub case_id: String,
    pub work_item_ids: Vec<String>,
    pub signatures: Vec<FailureSignature>,
}

/// Directory view of one WorkItem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WorkItemLinks {
    pub work_item_id: String,
    pub auto_case_ids: Vec<String>,
}

pub trait LinkageDirectory {
    /// Resolves the WorkItems and failure signatures linked to an AutoCase.
    ///
    /// # Errors
    /// Returns [`LookupError`] when the AutoCase is unknown or the directory
    /// cannot answer.
    fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError>;

    /// Resolves the AutoCases linked to a WorkItem.
    ///
    /// # Errors
    /// Returns [`LookupError`] when the WorkItem is unknown or the directory
    /// cannot answer.
    fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError>;
}

impl<D: LinkageDirectory + ?Sized> LinkageDirectory for &D {
    fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError> {
        (**self).lookup_auto_case(case_id)
    }

    fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
        (**self).lookup_work_item(work_item_id)
    }
}

impl<D: LinkageDirectory + ?Sized> LinkageDirectory for Arc<D> {
    fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError> {
        (**self).lookup_auto_case(case_id)
    }

    fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
        (**self).lookup_work_item(work_item_id)
    }
}

/// Fetch-and-discard cache for the lifetime of one reconciliation call.
///
/// Only successful answers are cached; nothing survives the call.
pub struct ScopedLookup<'a, D: LinkageDirectory + ?Sized> {
    directory: &'a D,
    auto_cases: RefCell<BTreeMap<String, AutoCaseLinks>>,
    work_items: RefCell<BTreeMap<String, WorkItemLinks>>,
}

impl<'a, D: LinkageDirectory + ?Sized> ScopedLookup<'a, D> {
    pub fn new(directory: &'a D) -> Self {
        Self {
            directory,
            auto_cases: RefCell::new(BTreeMap::new()),
            work_items: RefCell::new(BTreeMap::new()),
        }
    }
}

impl<D: LinkageDirectory + ?Sized> LinkageDirectory for ScopedLookup<'_, D> {
    fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError> {
        if let Some(hit) = self.auto_cases.borrow().get(case_id) {
            return Ok(hit.clone());
        }
        let links = self.directory.lookup_auto_case(case_id)?;
        self.auto_cases
            .borrow_mut()
            .insert(case_id.to_string(), links.clone());
        Ok(links)
    }

    fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
        if let Some(hit) = self.work_items.borrow().get(work_item_id) {
            return Ok(hit.clone());
        }
        let links = self.directory.lookup_work_item(work_item_id)?;
        self.work_items
            .borrow_mut()
            .insert(work_item_id.to_string(), links.clone());
        Ok(links)
    }
}

/// Bounds every lookup of an inner directory by a wall-clock timeout.
///
/// A lookup that overruns is reported as [`LookupError::Timeout`] while its
/// worker thread keeps running until the inner directory answers. Workers
/// still running count against `max_in_flight`; once the cap is reached new
/// lookups fail fast as [`LookupError::Transient`] instead of spawning.
/// Clones share the cap.
#[derive(Debug)]
pub struct TimeoutDirectory<D> {
    inner: Arc<D>,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

impl<D> Clone for TimeoutDirectory<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            timeout: self.timeout,
            in_flight: Arc::clone(&self.in_flight),
            max_in_flight: self.max_in_flight,
        }
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<D> TimeoutDirectory<D>
where
    D: LinkageDirectory + Send + Sync + 'static,
{
    pub fn new(inner: Arc<D>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Lookup workers that have not returned yet, abandoned ones included.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn bounded<T, F>(&self, id: &str, lookup: F) -> Result<T, LookupError>
    where
        T: Send + 'static,
        F: FnOnce(&D) -> Result<T, LookupError> + Send + 'static,
    {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) >= self.max_in_flight {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(id, max_in_flight = self.max_in_flight, "directory lookup rejected");
            return Err(LookupError::Transient(format!(
                "{} directory lookups still running; not starting one for {id}",
                self.max_in_flight
            )));
        }
        let guard = InFlight(Arc::clone(&self.in_flight));

        let (sender, receiver) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("caselink-lookup".to_string())
            .spawn(move || {
                let _guard = guard;
                let _ = sender.send(lookup(inner.as_ref()));
            });

        if let Err(err) = spawned {
            return Err(LookupError::Transient(format!(
                "failed to spawn lookup worker: {err}"
            )));
        }

        match receiver.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(id, timeout_ms = self.timeout_ms(), "directory lookup timed out");
                Err(LookupError::Timeout {
                    id: id.to_string(),
                    timeout_ms: self.timeout_ms(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(LookupError::Transient(format!(
                "lookup worker for {id} exited without answering"
            ))),
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl<D> LinkageDirectory for TimeoutDirectory<D>
where
    D: LinkageDirectory + Send + Sync + 'static,
{
    fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError> {
        let owned = case_id.to_string();
        self.bounded(case_id, move |inner| inner.lookup_auto_case(&owned))
    }

    fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
        let owned = work_item_id.to_string();
        self.bounded(work_item_id, move |inner| inner.lookup_work_item(&owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingDirectory {
        calls: Cell<usize>,
    }

    impl LinkageDirectory for CountingDirectory {
        fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError> {
            self.calls.set(self.calls.get() + 1);
            Ok(AutoCaseLinks {
                case_id: case_id.to_string(),
                work_item_ids: vec!["WI-1".to_string()],
                signatures: Vec::new(),
            })
        }

        fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
            Err(LookupError::NotFound {
                entity: "work_item".to_string(),
                id: work_item_id.to_string(),
            })
        }
    }

    struct SlowDirectory;

    impl LinkageDirectory for SlowDirectory {
        fn lookup_auto_case(&self, case_id: &str) -> Result<AutoCaseLinks, LookupError> {
            thread::sleep(Duration::from_millis(500));
            Ok(AutoCaseLinks {
                case_id: case_id.to_string(),
                ..AutoCaseLinks::default()
            })
        }

        fn lookup_work_item(&self, work_item_id: &str) -> Result<WorkItemLinks, LookupError> {
            Ok(WorkItemLinks {
                work_item_id: work_item_id.to_string(),
                auto_case_ids: Vec::new(),
            })
        }
    }

    #[test]
    fn scoped_lookup_fetches_each_case_once() {
        let directory = CountingDirectory {
            calls: Cell::new(0),
        };
        let scoped = ScopedLookup::new(&directory);
        for _ in 0..3 {
            assert!(scoped.lookup_auto_case("a.b").is_ok());
        }
        assert_eq!(directory.calls.get(), 1);
        assert!(scoped.lookup_work_item("WI-9").is_err());
    }

    #[test]
    fn timeout_directory_reports_overruns() {
        let directory = TimeoutDirectory::new(Arc::new(SlowDirectory), Duration::from_millis(20));
        let result = directory.lookup_auto_case("a.b");
        assert_eq!(
            result,
            Err(LookupError::Timeout {
                id: "a.b".to_string(),
                timeout_ms: 20,
            })
        );
        assert!(directory.lookup_work_item("WI-1").is_ok());
    }

    #[test]
    fn abandoned_lookups_count_against_the_cap() {
        let directory = TimeoutDirectory::new(Arc::new(SlowDirectory), Duration::from_millis(20))
            .with_max_in_flight(1);

        assert!(matches!(
            directory.lookup_auto_case("a.b"),
            Err(LookupError::Timeout { .. })
        ));
        assert_eq!(directory.in_flight(), 1);

        let rejected = directory.clone().lookup_work_item("WI-1");
        assert!(matches!(rejected, Err(LookupError::Transient(_))), "{rejected:?}");

        for _ in 0..50 {
            if directory.in_flight() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(directory.in_flight(), 0);
        assert!(directory.lookup_work_item("WI-1").is_ok());
    }

    #[test]
    fn error_codes_separate_not_found_from_failures() {
        let not_found = LookupError::NotFound {
            entity: "auto_case".to_string(),
            id: "x".to_string(),
        };
        assert_eq!(not_found.code(), AutoLinkageError::NoLinkage);
        assert!(!not_found.is_retryable());
        assert!(LookupError::Transient("503".to_string()).is_retryable());
    }
}
