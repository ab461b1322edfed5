//! Sync orchestration: update gate, catalog refresh, batch harvest and
//! checkpoint commit.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use planilla_adapters::{
    read_institutions, read_update_timestamp, HttpPortalClient, PortalClient, PortalEndpoints,
    ReportFetcher, DEFAULT_INDEX_URL, DEFAULT_REPORT_URL,
};
use planilla_core::{EmploymentStatus, Institution};
use planilla_storage::{
    CatalogStore, CheckpointStore, HttpClientConfig, HttpFetcher, SnapshotWriter,
};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod runner;

pub use runner::{
    BatchRunner, FailureSet, HarvestProcessor, ItemOutcome, ItemReport, RunReport,
    WorkItemProcessor,
};

pub const CRATE_NAME: &str = "planilla-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub index_url: String,
    pub report_url: String,
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub catalog_path: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub workers: usize,
    pub requests_per_second: Option<u32>,
    pub insecure_tls: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("PLANILLA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let path_or = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(default))
        };

        Self {
            index_url: lookup("PLANILLA_INDEX_URL")
                .unwrap_or_else(|| DEFAULT_INDEX_URL.to_string()),
            report_url: lookup("PLANILLA_REPORT_URL")
                .unwrap_or_else(|| DEFAULT_REPORT_URL.to_string()),
            staging_dir: path_or("PLANILLA_STAGING_DIR", "staging"),
            checkpoint_path: path_or("PLANILLA_CHECKPOINT_PATH", "last_updated_date.txt"),
            catalog_path: path_or("PLANILLA_CATALOG_PATH", "lista_instituciones.csv"),
            reports_dir: path_or("PLANILLA_REPORTS_DIR", "reports"),
            user_agent: lookup("PLANILLA_USER_AGENT")
                .unwrap_or_else(|| "planilla-bot/0.1".to_string()),
            http_timeout_secs: parsed(&lookup, "PLANILLA_HTTP_TIMEOUT_SECS").unwrap_or(60),
            run_timeout_secs: parsed(&lookup, "PLANILLA_RUN_TIMEOUT_SECS").unwrap_or(4 * 60 * 60),
            workers: parsed::<usize>(&lookup, "PLANILLA_WORKERS").unwrap_or(4).max(1),
            requests_per_second: parsed::<u32>(&lookup, "PLANILLA_REQUESTS_PER_SEC").filter(|n| *n > 0),
            insecure_tls: lookup("PLANILLA_INSECURE_TLS")
                .map(|v| flag(&v))
                .unwrap_or(false),
            scheduler_enabled: lookup("PLANILLA_SCHEDULER_ENABLED")
                .map(|v| flag(&v))
                .unwrap_or(false),
            sync_cron: lookup("PLANILLA_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            data_dir,
        }
    }

    pub fn endpoints(&self) -> PortalEndpoints {
        PortalEndpoints {
            index_url: self.index_url.clone(),
            report_url: self.report_url.clone(),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_concurrency: self.workers,
            requests_per_second: self.requests_per_second,
            accept_invalid_certs: self.insecure_tls,
            ..Default::default()
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateDecision {
    pub proceed: bool,
    pub candidate: NaiveDateTime,
    pub previous: Option<NaiveDateTime>,
}

/// Decides whether the portal has published data newer than the checkpoint.
pub struct UpdateOracle {
    client: Arc<dyn PortalClient>,
    checkpoint: CheckpointStore,
}

impl UpdateOracle {
    pub fn new(client: Arc<dyn PortalClient>, checkpoint: CheckpointStore) -> Self {
        Self { client, checkpoint }
    }

    pub async fn should_run(&self) -> Result<UpdateDecision> {
        let candidate = read_update_timestamp(self.client.as_ref())
            .await
            .context("reading portal update stamp")?;
        let previous = self.checkpoint.load().await?;
        let proceed = previous.map_or(true, |prev| candidate > prev);
        Ok(UpdateDecision {
            proceed,
            candidate,
            previous,
        })
    }

    /// Store `candidate` if it is strictly later than the current checkpoint.
    pub async fn commit(&self, candidate: NaiveDateTime) -> Result<bool> {
        if let Some(previous) = self.checkpoint.load().await? {
            if candidate <= previous {
                info!(checkpoint = %previous, %candidate, "checkpoint already current");
                return Ok(false);
            }
        }
        self.checkpoint.store(candidate).await?;
        info!(checkpoint = %candidate, "checkpoint advanced");
        Ok(true)
    }
}

/// Refreshes the persisted institution catalog from the live portal list.
pub struct CatalogResolver {
    client: Arc<dyn PortalClient>,
    catalog: CatalogStore,
}

impl CatalogResolver {
    pub fn new(client: Arc<dyn PortalClient>, catalog: CatalogStore) -> Self {
        Self { client, catalog }
    }

    pub async fn resolve(&self) -> Result<BTreeSet<Institution>> {
        let live = read_institutions(self.client.as_ref())
            .await
            .context("reading institution list")?;
        let listed = live.len();
        let merged = self.catalog.merge(live).await?;
        info!(listed, catalog = merged.len(), "institution catalog refreshed");
        Ok(merged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub forced: bool,
    pub decision: UpdateDecision,
    pub checkpoint_committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

impl SyncRunSummary {
    pub fn skipped(&self) -> bool {
        self.report.is_none()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    oracle: UpdateOracle,
    resolver: CatalogResolver,
    runner: BatchRunner,
    running: tokio::sync::Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config()).context("building http client")?;
        let client: Arc<dyn PortalClient> =
            Arc::new(HttpPortalClient::new(Arc::new(http), config.endpoints()));
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: SyncConfig, client: Arc<dyn PortalClient>) -> Self {
        let writer = Arc::new(SnapshotWriter::new(config.staging_dir.clone()));
        let processor = Arc::new(HarvestProcessor::new(
            ReportFetcher::new(Arc::clone(&client)),
            writer,
        ));
        Self::with_parts(config, client, processor)
    }

    pub fn with_parts(
        config: SyncConfig,
        client: Arc<dyn PortalClient>,
        processor: Arc<dyn WorkItemProcessor>,
    ) -> Self {
        Self {
            oracle: UpdateOracle::new(
                Arc::clone(&client),
                CheckpointStore::new(config.checkpoint_path.clone()),
            ),
            resolver: CatalogResolver::new(client, CatalogStore::new(config.catalog_path.clone())),
            runner: BatchRunner::new(processor, config.workers),
            running: tokio::sync::Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn check(&self) -> Result<UpdateDecision> {
        self.oracle.should_run().await
    }

    pub async fn refresh_catalog(&self) -> Result<BTreeSet<Institution>> {
        self.resolver.resolve().await
    }

    /// One gated harvest. With `force`, the run proceeds even when the portal
    /// stamp has not moved past the checkpoint.
    pub async fn run_once(&self, force: bool) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, force)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid, force: bool) -> Result<SyncRunSummary> {
        let _running = self.running.lock().await;
        let started_at = Utc::now();

        let decision = self.oracle.should_run().await?;
        if !decision.proceed && !force {
            info!(
                candidate = %decision.candidate,
                previous = ?decision.previous,
                "portal data unchanged; nothing to do"
            );
            return Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                forced: false,
                decision,
                checkpoint_committed: false,
                report: None,
                report_path: None,
            });
        }
        info!(candidate = %decision.candidate, previous = ?decision.previous, force, "starting harvest");

        let institutions = self.resolver.resolve().await?;

        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            let timeout = self.config.run_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(?timeout, "run timeout reached; cancelling outstanding items");
                cancel.cancel();
            })
        };
        let report = self
            .runner
            .run(&institutions, &EmploymentStatus::ALL, &cancel)
            .await;
        deadline.abort();

        let checkpoint_committed = if report.timed_out {
            warn!("run did not complete; checkpoint left unchanged");
            false
        } else {
            self.oracle.commit(decision.candidate).await?
        };

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            forced: force,
            decision,
            checkpoint_committed,
            report: Some(report),
            report_path: None,
        };
        summary.report_path = Some(write_run_report(&self.config.reports_dir, &summary).await?);
        Ok(summary)
    }

    /// Cron-driven harvest, or `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if pipeline.running.try_lock().is_err() {
                    warn!("previous sync still running; skipping scheduled trigger");
                    return;
                }
                match pipeline.run_once(false).await {
                    Ok(summary) if summary.skipped() => {}
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                    Err(err) => error!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Persist `<reports>/<run-id>/run_report.json`.
pub async fn write_run_report(reports_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("run_report.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_sync_once_from_env(force: bool) -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once(force).await
}
