//! Registry sync pipeline: fetch, reconcile, resolve and upsert.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use lcr_adapters::{normalize, OpenDataApiConfig, OpenDataApiSource, RegistrySource};
use lcr_core::{LicenseStatusColor, NormalizedRecord};
use lcr_storage::{
    BackoffPolicy, CompanyStore, FetchError, HttpClientConfig, HttpFetcher, PgStore, UpsertOutcome,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
pub mod dedup;
mod dimensions;
mod report;
#[cfg(test)]
mod testing;
mod writer;

pub use config::{SyncConfig, DEFAULT_API_BASE_URL, DEFAULT_DATASET_ID, DEFAULT_PAGE_SIZE, DEFAULT_SYNC_CRON};
pub use dimensions::{DimensionResolver, ResolverStats};
pub use report::{brief_markdown, write_reports};
pub use writer::UpsertWriter;

pub const CRATE_NAME: &str = "lcr-sync";

/// Per-run cap on recorded write failures; the error count is not capped.
pub const MAX_REPORTED_FAILURES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Counting,
    Fetching,
    NormalizingAndGrouping,
    Selecting,
    ResolvingAndWriting,
    Done,
    Aborted,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("target store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
    #[error("registry unavailable before any page arrived: {0}")]
    SourceUnavailable(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFailure {
    pub global_id: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub expected_total: Option<u64>,
    pub received_records: usize,
    pub malformed_records: usize,
    pub pages: usize,
    pub fetch_complete: bool,
    pub company_groups: usize,
    /// Normalized records that entered grouping.
    pub candidates: usize,
    pub loaded: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_ungeocoded: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub snapshot_digest: String,
    pub status_colors: BTreeMap<LicenseStatusColor, usize>,
    pub failures: Vec<WriteFailure>,
}

impl SyncRunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            elapsed_ms: 0,
            expected_total: None,
            received_records: 0,
            malformed_records: 0,
            pages: 0,
            fetch_complete: true,
            company_groups: 0,
            candidates: 0,
            loaded: 0,
            inserted: 0,
            updated: 0,
            skipped_ungeocoded: 0,
            errors: 0,
            cancelled: false,
            snapshot_digest: String::new(),
            status_colors: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    /// `(expected, received)` when fewer records arrived than the count probe announced.
    pub fn count_mismatch(&self) -> Option<(u64, usize)> {
        let expected = self.expected_total?;
        ((self.received_records as u64) < expected).then_some((expected, self.received_records))
    }

    fn record_failure(&mut self, global_id: i64, err: &anyhow::Error) {
        let message = format!("{err:#}");
        self.errors += 1;
        warn!(global_id, error = %message, "company write failed");
        if self.failures.len() < MAX_REPORTED_FAILURES {
            self.failures.push(WriteFailure { global_id, message });
        }
    }
}

/// SHA-256 over the sorted content hashes of every normalized record in the run.
pub fn snapshot_digest<'a>(records: impl IntoIterator<Item = &'a NormalizedRecord>) -> String {
    let mut hashes = records
        .into_iter()
        .map(|r| r.content_hash.as_str())
        .collect::<Vec<_>>();
    hashes.sort_unstable();
    let mut hasher = Sha256::new();
    for hash in hashes {
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Arc<dyn RegistrySource>,
    store: Arc<dyn CompanyStore>,
    phase: watch::Sender<RunPhase>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn RegistrySource>,
        store: Arc<dyn CompanyStore>,
    ) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            config,
            source,
            store,
            phase,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CompanyStore> {
        &self.store
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
    }

    /// One full re-ingestion. Only an unreachable store or a failed first page
    /// abort the run; everything else ends in a summary.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<SyncRunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        let result = self.run_inner(run_id, cancel).instrument(span).await;
        if result.is_err() {
            self.enter(RunPhase::Aborted);
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary, RunError> {
        let clock = Instant::now();
        let mut summary = SyncRunSummary::new(run_id, Utc::now());

        self.store.ping().await.map_err(|err| {
            error!(error = ?err, "target store unreachable; aborting run");
            RunError::StoreUnavailable(err)
        })?;

        self.enter(RunPhase::Counting);
        summary.expected_total = self.source.count(run_id).await;
        info!(expected_total = ?summary.expected_total, "count probe finished");

        self.enter(RunPhase::Fetching);
        let raw = self.fetch_all(run_id, cancel, &mut summary).await?;

        self.enter(RunPhase::NormalizingAndGrouping);
        let normalized = raw.iter().map(normalize).collect::<Vec<_>>();
        summary.candidates = normalized.len();
        summary.snapshot_digest = snapshot_digest(&normalized);
        let grouped = dedup::group_by_company(normalized);

        self.enter(RunPhase::Selecting);
        let reconciled = dedup::reconcile_groups(grouped);
        summary.company_groups = reconciled.company_groups;
        info!(
            candidates = summary.candidates,
            company_groups = reconciled.company_groups,
            superseded = reconciled.superseded,
            "canonical records selected"
        );

        self.enter(RunPhase::ResolvingAndWriting);
        self.write_all(&reconciled.canonical, cancel, &mut summary).await;

        summary.finished_at = Utc::now();
        summary.elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.enter(RunPhase::Done);

        if let Some((expected, received)) = summary.count_mismatch() {
            warn!(expected, received, "fewer records fetched than the count probe announced");
        }
        info!(
            loaded = summary.loaded,
            inserted = summary.inserted,
            updated = summary.updated,
            errors = summary.errors,
            skipped_ungeocoded = summary.skipped_ungeocoded,
            fetch_complete = summary.fetch_complete,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "sync run finished"
        );

        if let Some(reports_dir) = &self.config.reports_dir {
            match write_reports(reports_dir, &summary).await {
                Ok(dir) => info!(dir = %dir.display(), "run reports written"),
                Err(err) => warn!(error = ?err, "writing run reports failed"),
            }
        }

        Ok(summary)
    }

    async fn fetch_all(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
        summary: &mut SyncRunSummary,
    ) -> Result<Vec<lcr_core::RawRecord>, RunError> {
        let page_size = self.config.page_size;
        let mut offset = 0usize;
        let mut records = Vec::new();

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let page = match self.source.fetch_page(run_id, offset, page_size).await {
                Ok(page) => page,
                Err(err) if summary.pages == 0 => {
                    error!(offset, error = %err, "first page failed; aborting run");
                    return Err(RunError::SourceUnavailable(err));
                }
                Err(err) => {
                    warn!(offset, error = %err, "page fetch failed; keeping partial data");
                    summary.fetch_complete = false;
                    break;
                }
            };

            summary.pages += 1;
            summary.received_records += page.received;
            summary.malformed_records += page.malformed;
            if page.malformed > 0 {
                warn!(offset, malformed = page.malformed, "dropped rows without a usable global_id");
            }
            let last = page.is_last(page_size);
            records.extend(page.records);
            if last {
                break;
            }
            offset += page.received;

            tokio::select! {
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(self.config.page_pause()) => {}
            }
        }

        info!(
            pages = summary.pages,
            received = summary.received_records,
            malformed = summary.malformed_records,
            "fetch finished"
        );
        Ok(records)
    }

    async fn write_all(
        &self,
        canonical: &[NormalizedRecord],
        cancel: &CancellationToken,
        summary: &mut SyncRunSummary,
    ) {
        let store = self.store.as_ref();
        let writer = UpsertWriter::new(store, self.config.require_coordinates);
        let mut resolver = DimensionResolver::new(store);
        let today = Local::now().date_naive();

        for record in canonical {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if !writer.accepts(record) {
                summary.skipped_ungeocoded += 1;
                continue;
            }
            let ids = match resolver.resolve_all(record).await {
                Ok(ids) => ids,
                Err(err) => {
                    summary.record_failure(record.global_id, &err);
                    continue;
                }
            };
            match writer.write(record, ids).await {
                Ok(outcome) => tally_write(summary, outcome, record.license_expire, today),
                Err(err) => summary.record_failure(record.global_id, &err),
            }
        }

        let stats = resolver.stats();
        info!(
            created = stats.created,
            lookups = stats.lookups,
            cache_hits = stats.cache_hits,
            "reference rows resolved"
        );
    }
}

fn tally_write(
    summary: &mut SyncRunSummary,
    outcome: UpsertOutcome,
    expire: Option<NaiveDate>,
    today: NaiveDate,
) {
    summary.loaded += 1;
    match outcome {
        UpsertOutcome::Inserted => summary.inserted += 1,
        UpsertOutcome::Updated => summary.updated += 1,
    }
    *summary
        .status_colors
        .entry(LicenseStatusColor::classify(expire, today))
        .or_default() += 1;
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub phase: RunPhase,
    pub running: bool,
    pub last_summary: Option<SyncRunSummary>,
}

/// At-most-one-run wrapper shared by the scheduler, the CLI and the web trigger.
pub struct SyncRunner {
    pipeline: SyncPipeline,
    run_lock: Mutex<()>,
    running: AtomicBool,
    last: RwLock<Option<SyncRunSummary>>,
    shutdown: CancellationToken,
}

/// Clears the running flag however the run ends.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncRunner {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline,
            run_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            last: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    pub async fn trigger(&self) -> Result<SyncRunSummary, RunError> {
        let _guard = self.run_lock.try_lock().map_err(|_| RunError::AlreadyRunning)?;
        let _running = RunningFlag::raise(&self.running);
        let cancel = self.shutdown.child_token();
        let summary = self.pipeline.run_once(&cancel).await?;
        *self.last.write().await = Some(summary.clone());
        Ok(summary)
    }

    /// Never touches the run lock, so polling cannot block a trigger.
    pub async fn status(&self) -> RunnerStatus {
        let last_summary = self.last.read().await.clone();
        RunnerStatus {
            phase: self.pipeline.phase(),
            running: self.running.load(Ordering::SeqCst),
            last_summary,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn ping_store(&self) -> Result<()> {
        self.pipeline.store.ping().await
    }

    /// Stops the current run at its next page or write boundary and every later one.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub fn runner_from_config(config: SyncConfig) -> Result<SyncRunner> {
    if !config.has_api_key() {
        warn!("LCR_API_KEY is empty; the registry will likely reject requests");
    }
    let store = PgStore::connect_lazy(&config.database_url)?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        trust_env_proxy: false,
        backoff: BackoffPolicy {
            max_retries: config.http_max_retries,
            ..BackoffPolicy::default()
        },
    })?;
    let source = OpenDataApiSource::new(
        OpenDataApiConfig {
            base_url: config.api_base_url.clone(),
            dataset_id: config.dataset_id,
            api_key: config.api_key.clone(),
        },
        http,
    );
    Ok(SyncRunner::new(SyncPipeline::new(
        config,
        Arc::new(source),
        Arc::new(store),
    )))
}

pub async fn build_scheduler(runner: Arc<SyncRunner>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            match runner.trigger().await {
                Ok(summary) => info!(run_id = %summary.run_id, loaded = summary.loaded, "scheduled sync finished"),
                Err(RunError::AlreadyRunning) => warn!("scheduled sync skipped; a run is already in progress"),
                Err(err) => error!(error = %err, "scheduled sync aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(runner: Arc<SyncRunner>) -> Result<Option<JobScheduler>> {
    let config = runner.pipeline().config();
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let cron = config.sync_cron.clone();
    build_scheduler(runner, &cron).await.map(Some)
}
