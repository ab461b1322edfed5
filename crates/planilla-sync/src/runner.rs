//! Bounded fan-out over work items with a single retry pass.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use planilla_adapters::{FetchError, ParseError, ReportFetcher};
use planilla_core::{EmploymentStatus, Institution, NormalizedReport, WorkItem};
use planilla_storage::{SnapshotRef, SnapshotWriter};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns one work item into a published snapshot.
///
/// The runner may abandon `fetch` on cancellation but always lets a started
/// `publish` finish.
#[async_trait]
pub trait WorkItemProcessor: Send + Sync {
    async fn fetch(&self, item: &WorkItem) -> Result<NormalizedReport, FetchError>;

    async fn publish(
        &self,
        item: &WorkItem,
        report: NormalizedReport,
    ) -> Result<SnapshotRef, FetchError>;
}

/// Download, normalize and publish.
pub struct HarvestProcessor {
    fetcher: ReportFetcher,
    writer: Arc<SnapshotWriter>,
}

impl HarvestProcessor {
    pub fn new(fetcher: ReportFetcher, writer: Arc<SnapshotWriter>) -> Self {
        Self { fetcher, writer }
    }
}

#[async_trait]
impl WorkItemProcessor for HarvestProcessor {
    async fn fetch(&self, item: &WorkItem) -> Result<NormalizedReport, FetchError> {
        self.fetcher.fetch(item).await
    }

    async fn publish(
        &self,
        item: &WorkItem,
        report: NormalizedReport,
    ) -> Result<SnapshotRef, FetchError> {
        self.writer
            .write(item, &report)
            .await
            .map_err(|err| FetchError::new(item.clone(), ParseError::Snapshot(format!("{err:#}"))))
    }
}

/// Failures collected by concurrent workers.
#[derive(Debug, Default)]
pub struct FailureSet {
    inner: Mutex<Vec<FetchError>>,
}

impl FailureSet {
    pub fn record(&self, failure: FetchError) {
        self.lock().push(failure);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<FetchError> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FetchError>> {
        // A poisoned list is still a valid list.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    FirstPass,
    Retried,
    StillFailing,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub institution: Institution,
    pub status: EmploymentStatus,
    pub outcome: ItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotRef>,
}

impl ItemReport {
    fn new(item: WorkItem, outcome: ItemOutcome) -> Self {
        Self {
            institution: item.institution,
            status: item.status,
            outcome,
            cause: None,
            snapshot: None,
        }
    }

    pub fn work_item(&self) -> WorkItem {
        WorkItem::new(self.institution.clone(), self.status)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub first_pass: usize,
    pub retried_ok: usize,
    pub still_failing: usize,
    pub cancelled: usize,
    /// Set when the run deadline fired before every item finished.
    pub timed_out: bool,
    pub items: Vec<ItemReport>,
}

impl RunReport {
    pub fn snapshots(&self) -> impl Iterator<Item = &SnapshotRef> {
        self.items.iter().filter_map(|i| i.snapshot.as_ref())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| i.outcome == ItemOutcome::StillFailing)
    }
}

struct PassResult {
    published: Vec<(WorkItem, SnapshotRef)>,
    cancelled: Vec<WorkItem>,
}

pub struct BatchRunner {
    processor: Arc<dyn WorkItemProcessor>,
    workers: usize,
}

impl BatchRunner {
    pub fn new(processor: Arc<dyn WorkItemProcessor>, workers: usize) -> Self {
        Self {
            processor,
            workers: workers.max(1),
        }
    }

    /// Process every (institution, status) pair, then retry the failures
    /// once. Cancelling `cancel` stops outstanding items; snapshots already
    /// published stay published.
    pub async fn run(
        &self,
        institutions: &BTreeSet<Institution>,
        statuses: &[EmploymentStatus],
        cancel: &CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        let items = WorkItem::cartesian(institutions, statuses);
        let attempted = items.len();
        info!(attempted, workers = self.workers, "starting batch");

        let failures = FailureSet::default();
        let mut report_items = Vec::with_capacity(attempted);

        let first = self.pass(items, cancel, &failures).await;
        let first_pass = first.published.len();
        report_items.extend(first.published.into_iter().map(|(item, snapshot)| {
            let mut entry = ItemReport::new(item, ItemOutcome::FirstPass);
            entry.snapshot = Some(snapshot);
            entry
        }));
        let mut cancelled = first.cancelled;

        let mut retried_ok = 0;
        let mut remaining = failures.drain();
        if !remaining.is_empty() && !cancel.is_cancelled() {
            info!(count = remaining.len(), "retrying failed items");
            let retry_items = remaining.drain(..).map(|f| f.item).collect();
            let retry = self.pass(retry_items, cancel, &failures).await;
            retried_ok = retry.published.len();
            report_items.extend(retry.published.into_iter().map(|(item, snapshot)| {
                let mut entry = ItemReport::new(item, ItemOutcome::Retried);
                entry.snapshot = Some(snapshot);
                entry
            }));
            cancelled.extend(retry.cancelled);
            remaining = failures.drain();
        }

        let still_failing = remaining.len();
        for failure in remaining {
            warn!(item = %failure.item, error = %failure.cause, "item still failing after retry");
            let mut entry = ItemReport::new(failure.item, ItemOutcome::StillFailing);
            entry.cause = Some(failure.cause.to_string());
            report_items.push(entry);
        }
        let cancelled_count = cancelled.len();
        report_items.extend(
            cancelled
                .into_iter()
                .map(|item| ItemReport::new(item, ItemOutcome::Cancelled)),
        );
        report_items.sort_by(|a, b| {
            (&a.institution, a.status).cmp(&(&b.institution, b.status))
        });

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            attempted,
            first_pass,
            retried_ok,
            still_failing,
            cancelled: cancelled_count,
            timed_out: cancel.is_cancelled(),
            items: report_items,
        };
        info!(
            attempted = report.attempted,
            first_pass = report.first_pass,
            retried_ok = report.retried_ok,
            still_failing = report.still_failing,
            cancelled = report.cancelled,
            "batch finished"
        );
        report
    }

    async fn pass(
        &self,
        items: Vec<WorkItem>,
        cancel: &CancellationToken,
        failures: &FailureSet,
    ) -> PassResult {
        let results: Vec<(WorkItem, Option<Result<SnapshotRef, FetchError>>)> =
            stream::iter(items)
                .map(|item| {
                    let processor = Arc::clone(&self.processor);
                    let cancel = cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return (item, None);
                        }
                        let fetched = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            result = processor.fetch(&item) => Some(result),
                        };
                        let report = match fetched {
                            None => return (item, None),
                            Some(Err(failure)) => return (item, Some(Err(failure))),
                            Some(Ok(report)) => report,
                        };
                        // Nothing is published once the deadline has fired,
                        // and a publish in flight is never dropped.
                        if cancel.is_cancelled() {
                            return (item, None);
                        }
                        let result = processor.publish(&item, report).await;
                        (item, Some(result))
                    }
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

        let mut published = Vec::new();
        let mut cancelled = Vec::new();
        for (item, result) in results {
            match result {
                Some(Ok(snapshot)) => {
                    debug!(item = %item, file = %snapshot.file_name, rows = snapshot.rows, "item published");
                    published.push((item, snapshot));
                }
                Some(Err(failure)) => {
                    warn!(item = %failure.item, error = %failure.cause, "item failed");
                    failures.record(failure);
                }
                None => cancelled.push(item),
            }
        }
        PassResult {
            published,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Script {
        Ok,
        FailOnce,
        FailAlways,
        Hang,
        SlowPublish,
    }

    struct ScriptedProcessor {
        scripts: HashMap<WorkItem, Script>,
        calls: Mutex<HashMap<WorkItem, usize>>,
        total: AtomicUsize,
        published: AtomicUsize,
    }

    impl ScriptedProcessor {
        fn new(scripts: HashMap<WorkItem, Script>) -> Self {
            Self {
                scripts,
                calls: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
                published: AtomicUsize::new(0),
            }
        }

        fn calls_for(&self, item: &WorkItem) -> usize {
            self.calls.lock().unwrap().get(item).copied().unwrap_or(0)
        }
    }

    fn snapshot_for(item: &WorkItem) -> SnapshotRef {
        let file_name = format!("{}_{}.parquet", item.institution, item.status);
        SnapshotRef {
            path: PathBuf::from("/staging").join(&file_name),
            file_name,
            rows: 1,
            bytes: 10,
            sha256: "00".repeat(32),
        }
    }

    fn failure(item: &WorkItem) -> FetchError {
        FetchError::new(
            item.clone(),
            ParseError::NonNumeric {
                sheet: "Hoja1".to_string(),
                row: 1,
                column: "salario",
                value: "N/D".to_string(),
            },
        )
    }

    fn empty_report() -> NormalizedReport {
        NormalizedReport {
            archivo: "Planilla".to_string(),
            fecha_consulta: Utc::now(),
            fecha_actualizacion: Utc::now().naive_utc(),
            records: Vec::new(),
        }
    }

    #[async_trait]
    impl WorkItemProcessor for ScriptedProcessor {
        async fn fetch(&self, item: &WorkItem) -> Result<NormalizedReport, FetchError> {
            self.total.fetch_add(1, Ordering::SeqCst);
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(item.clone()).or_insert(0);
                *n += 1;
                *n
            };
            match self.scripts.get(item).unwrap_or(&Script::Ok) {
                Script::Ok | Script::SlowPublish => Ok(empty_report()),
                Script::FailOnce if call == 1 => Err(failure(item)),
                Script::FailOnce => Ok(empty_report()),
                Script::FailAlways => Err(failure(item)),
                Script::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn publish(
            &self,
            item: &WorkItem,
            _report: NormalizedReport,
        ) -> Result<SnapshotRef, FetchError> {
            if matches!(self.scripts.get(item), Some(Script::SlowPublish)) {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(snapshot_for(item))
        }
    }

    fn institutions(names: &[&str]) -> BTreeSet<Institution> {
        names.iter().map(|n| Institution::new(*n)).collect()
    }

    fn item(name: &str, status: EmploymentStatus) -> WorkItem {
        WorkItem::new(Institution::new(name), status)
    }

    #[tokio::test]
    async fn one_retry_pass_recovers_transient_failures() {
        let flaky = item("A", EmploymentStatus::Eventual);
        let broken_a = item("A", EmploymentStatus::PorAsignar);
        let broken_b = item("B", EmploymentStatus::Permanente);
        let processor = Arc::new(ScriptedProcessor::new(HashMap::from([
            (flaky.clone(), Script::FailOnce),
            (broken_a.clone(), Script::FailAlways),
            (broken_b.clone(), Script::FailAlways),
        ])));
        let runner = BatchRunner::new(processor.clone(), 3);

        let report = runner
            .run(
                &institutions(&["A", "B"]),
                &EmploymentStatus::ALL,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.attempted, 14);
        assert_eq!(report.first_pass, 11);
        assert_eq!(report.retried_ok, 1);
        assert_eq!(report.still_failing, 2);
        assert_eq!(report.cancelled, 0);
        assert!(!report.timed_out);
        assert_eq!(report.items.len(), 14);
        assert_eq!(report.snapshots().count(), 12);

        // exactly one retry, never a second
        assert_eq!(processor.calls_for(&flaky), 2);
        assert_eq!(processor.calls_for(&broken_a), 2);
        assert_eq!(processor.total.load(Ordering::SeqCst), 17);

        let failing: Vec<_> = report.failures().map(ItemReport::work_item).collect();
        assert_eq!(failing, vec![broken_a, broken_b]);
        assert!(report
            .failures()
            .all(|f| f.cause.as_deref().is_some_and(|c| c.contains("salario"))));
    }

    #[tokio::test]
    async fn duplicate_institutions_are_processed_once() {
        let processor = Arc::new(ScriptedProcessor::new(HashMap::new()));
        let runner = BatchRunner::new(processor.clone(), 2);
        let report = runner
            .run(
                &institutions(&["A", "A"]),
                &[EmploymentStatus::Eventual, EmploymentStatus::Eventual],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.attempted, 1);
        assert_eq!(processor.total.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_outstanding_items_and_skips_retry() {
        let hung = item("A", EmploymentStatus::Permanente);
        let broken = item("A", EmploymentStatus::Eventual);
        let processor = Arc::new(ScriptedProcessor::new(HashMap::from([
            (hung.clone(), Script::Hang),
            (broken.clone(), Script::FailAlways),
        ])));
        let runner = BatchRunner::new(processor.clone(), 7);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = runner
            .run(&institutions(&["A"]), &EmploymentStatus::ALL, &cancel)
            .await;

        assert!(report.timed_out);
        assert_eq!(report.first_pass, 5);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.still_failing, 1);
        assert_eq!(report.retried_ok, 0);
        assert_eq!(processor.calls_for(&broken), 1);
    }

    #[tokio::test]
    async fn publish_in_flight_completes_when_the_deadline_fires() {
        let slow = item("A", EmploymentStatus::Permanente);
        let processor = Arc::new(ScriptedProcessor::new(HashMap::from([(
            slow.clone(),
            Script::SlowPublish,
        )])));
        let runner = BatchRunner::new(processor.clone(), 1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = runner
            .run(&institutions(&["A"]), &[EmploymentStatus::Permanente], &cancel)
            .await;

        assert!(report.timed_out);
        assert_eq!(report.first_pass, 1);
        assert_eq!(report.cancelled, 0);
        assert_eq!(processor.published.load(Ordering::SeqCst), 1);
        assert_eq!(report.items[0].outcome, ItemOutcome::FirstPass);
        assert_eq!(report.items[0].snapshot, Some(snapshot_for(&slow)));
    }

    #[tokio::test]
    async fn nothing_is_published_after_cancellation() {
        let processor = Arc::new(ScriptedProcessor::new(HashMap::new()));
        let runner = BatchRunner::new(processor.clone(), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner
            .run(&institutions(&["A"]), &EmploymentStatus::ALL, &cancel)
            .await;

        assert_eq!(report.cancelled, 7);
        assert_eq!(processor.published.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_set_drains() {
        let set = FailureSet::default();
        set.record(failure(&item("A", EmploymentStatus::Eventual)));
        set.record(failure(&item("B", EmploymentStatus::Eventual)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.drain().len(), 2);
        assert!(set.is_empty());
    }
}
