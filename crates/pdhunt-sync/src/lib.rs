//! Run orchestration: ingest, score, persist, discover, report, notify.

mod config;
mod dedup;
mod notify;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pdhunt_adapters::{adapter_for_source, AdapterContext, Board, BoardAdapter, SearchQuery, SourceAdapter};
use pdhunt_core::{normalize_text, sha256_hex, PiRecord, PipelineError, PostingDraft};
use pdhunt_discovery::{AcademicGraph, Discovery, SemanticScholarClient, SemanticScholarConfig, SkippedSeed};
use pdhunt_matching::Scorer;
use pdhunt_report::{build_report, render_text_summary, write_workbook, ReportSnapshot};
use pdhunt_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JobStore, PiFilter, PostingFilter, SourceRunRecord,
    SourceRunStatus, UpsertOutcome,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{AppConfig, SearchProfile, SeedPi, SmtpSettings, SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::{DedupConfig, DedupEngine, DuplicateMatch};
pub use notify::{Notifier, SmtpNotifier};

pub const CRATE_NAME: &str = "pdhunt-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    /// Ingest and report.
    Daily,
    /// Ingest, PI discovery and report.
    Weekly,
    /// Report from what is already stored.
    ExportOnly,
}

impl RunMode {
    fn ingests(self) -> bool {
        !matches!(self, RunMode::ExportOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: RunMode,
    pub notify: bool,
}

impl RunOptions {
    pub fn new(mode: RunMode) -> Self {
        Self { mode, notify: false }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryOutcome {
    pub candidates: usize,
    pub stored: usize,
    pub skipped_seeds: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchOutcome {
    pub checked: usize,
    /// PI names whose lab page content differs from the previous check.
    pub changed: Vec<String>,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_ok: usize,
    pub sources_partial: usize,
    pub sources_failed: usize,
    pub found: usize,
    pub duplicates_collapsed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub discovery: Option<DiscoveryOutcome>,
    pub watchlist: Option<WatchOutcome>,
    pub report_path: PathBuf,
    pub text_summary: String,
    pub notified: bool,
}

struct SourceHarvest {
    source_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    /// Everything parsed before any failure.
    drafts: Vec<PostingDraft>,
    error: Option<String>,
}

impl SourceHarvest {
    fn status(&self) -> SourceRunStatus {
        match (&self.error, self.drafts.is_empty()) {
            (None, _) => SourceRunStatus::Succeeded,
            (Some(_), true) => SourceRunStatus::Failed,
            (Some(_), false) => SourceRunStatus::Partial,
        }
    }
}

pub struct Pipeline {
    config: AppConfig,
    store: JobStore,
    http: HttpFetcher,
    scorer: Scorer,
    dedup: DedupEngine,
    adapters: Vec<(SourceConfig, Box<dyn SourceAdapter>)>,
    graph: Option<Arc<dyn AcademicGraph>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Pipeline {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = JobStore::open(&config.sync.db_path)
            .await
            .with_context(|| format!("opening store at {}", config.sync.db_path.display()))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.sync.http_timeout_secs),
            user_agent: Some(config.sync.user_agent.clone()),
            backoff: BackoffPolicy::no_retries(),
            token_bucket: None,
        })?;
        let scorer = Scorer::new(&config.profile.keywords, config.tiers.clone()).context("compiling keyword profile")?;

        let mut adapters = Vec::new();
        for source in config.enabled_sources() {
            let adapter: Box<dyn SourceAdapter> = match &source.base_url {
                Some(base) => {
                    let board = Board::from_source_id(&source.source_id)
                        .with_context(|| format!("no adapter registered for {}", source.source_id))?;
                    Box::new(BoardAdapter::with_base_url(board, base.clone()))
                }
                None => adapter_for_source(&source.source_id)
                    .with_context(|| format!("no adapter registered for {}", source.source_id))?,
            };
            adapters.push((source.clone(), adapter));
        }

        Ok(Self {
            config,
            store,
            http,
            scorer,
            dedup: DedupEngine::default(),
            adapters,
            graph: None,
            notifier: None,
        })
    }

    /// Replace the registry-built adapters.
    pub fn with_adapters(mut self, adapters: Vec<(SourceConfig, Box<dyn SourceAdapter>)>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_graph(mut self, graph: Arc<dyn AcademicGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, mode = ?options.mode);
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, options: RunOptions) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();

        // Notification settings are checked before any network traffic.
        let notifier = if options.notify {
            Some(self.resolve_notifier()?)
        } else {
            None
        };

        let mut summary = RunSummary {
            run_id,
            mode: options.mode,
            started_at,
            finished_at: started_at,
            sources_ok: 0,
            sources_partial: 0,
            sources_failed: 0,
            found: 0,
            duplicates_collapsed: 0,
            inserted: 0,
            updated: 0,
            discovery: None,
            watchlist: None,
            report_path: PathBuf::new(),
            text_summary: String::new(),
            notified: false,
        };

        if options.mode.ingests() {
            let harvests = self.ingest(run_id).await;
            self.score_and_persist(run_id, harvests, &mut summary).await?;
        }

        if options.mode == RunMode::Weekly {
            summary.discovery = Some(self.discover(run_id).await?);
            summary.watchlist = Some(self.check_watchlist(run_id).await?);
        }

        let report_started = options.mode.ingests().then_some(started_at);
        let lab_pages_changed = summary
            .watchlist
            .as_ref()
            .map(|w| w.changed.clone())
            .unwrap_or_default();
        let (path, text) = self.report(run_id, report_started, lab_pages_changed).await?;
        summary.report_path = path;
        summary.text_summary = text;

        if let Some(notifier) = notifier {
            let subject = format!("Postdoc search report {}", Utc::now().format("%Y-%m-%d"));
            notifier
                .notify(&subject, &summary.text_summary, Some(&summary.report_path))
                .await?;
            summary.notified = true;
        }

        summary.finished_at = Utc::now();
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            sources_failed = summary.sources_failed,
            report = %summary.report_path.display(),
            "run complete"
        );
        Ok(summary)
    }

    fn resolve_notifier(&self) -> Result<Arc<dyn Notifier>, PipelineError> {
        match &self.notifier {
            Some(notifier) => Ok(notifier.clone()),
            None => Ok(Arc::new(SmtpNotifier::from_settings(&self.config.sync.smtp)?)),
        }
    }

    /// Sources run one after another; a failing source is recorded and skipped.
    async fn ingest(&self, run_id: Uuid) -> Vec<SourceHarvest> {
        let mut harvests = Vec::with_capacity(self.adapters.len());
        for (source, adapter) in &self.adapters {
            let started_at = Utc::now();
            let ctx = AdapterContext {
                run_id,
                fetched_at: started_at,
            };
            let span = info_span!("ingest_source", source_id = %source.source_id);
            let (drafts, error) = self.harvest_source(source, adapter.as_ref(), &ctx).instrument(span).await;
            if let Some(reason) = &error {
                if drafts.is_empty() {
                    warn!(source_id = %source.source_id, %reason, "source unavailable; continuing");
                } else {
                    warn!(
                        source_id = %source.source_id,
                        kept = drafts.len(),
                        %reason,
                        "source failed part-way; keeping harvested pages"
                    );
                }
            }
            harvests.push(SourceHarvest {
                source_id: source.source_id.clone(),
                started_at,
                finished_at: Utc::now(),
                drafts,
                error,
            });
        }
        harvests
    }

    async fn harvest_source(
        &self,
        source: &SourceConfig,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
    ) -> (Vec<PostingDraft>, Option<String>) {
        let mut drafts = Vec::new();
        for keywords in &source.queries {
            for page in 1..=source.max_pages.max(1) {
                let query = SearchQuery {
                    keywords: keywords.clone(),
                    location: source.location.clone(),
                    page: Some(page),
                };
                let batch = match adapter.fetch_listing(&self.http, ctx, &query).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        let reason = err.into_pipeline_error(&source.source_id).to_string();
                        return (drafts, Some(format!("'{keywords}' page {page}: {reason}")));
                    }
                };
                let exhausted = batch.is_empty();
                drafts.extend(batch);
                if exhausted {
                    break;
                }
            }
        }
        info!(found = drafts.len(), "source harvested");
        (drafts, None)
    }

    async fn score_and_persist(
        &self,
        run_id: Uuid,
        harvests: Vec<SourceHarvest>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let mut all_drafts = Vec::new();
        let mut found: BTreeMap<String, usize> = BTreeMap::new();
        for harvest in &harvests {
            found.insert(harvest.source_id.clone(), harvest.drafts.len());
            all_drafts.extend(harvest.drafts.iter().cloned());
        }
        summary.found = all_drafts.len();

        let (unique, collapsed) = self.dedup.apply(all_drafts);
        for m in &collapsed {
            info!(kept = %m.kept_source, dropped = %m.dropped_source, title = %m.title, "duplicate collapsed");
        }
        summary.duplicates_collapsed = collapsed.len();

        let mut inserted: BTreeMap<String, usize> = BTreeMap::new();
        for posting in self.scorer.score_all(unique) {
            match self.store.upsert_posting(&posting).await? {
                UpsertOutcome::Inserted => {
                    summary.inserted += 1;
                    *inserted.entry(posting.source_id.clone()).or_default() += 1;
                }
                UpsertOutcome::Updated => summary.updated += 1,
            }
        }

        for harvest in harvests {
            let status = harvest.status();
            match status {
                SourceRunStatus::Succeeded => summary.sources_ok += 1,
                SourceRunStatus::Partial => summary.sources_partial += 1,
                SourceRunStatus::Failed => summary.sources_failed += 1,
            }
            let record = SourceRunRecord {
                run_id,
                status,
                found: found.get(&harvest.source_id).copied().unwrap_or(0) as u32,
                inserted: inserted.get(&harvest.source_id).copied().unwrap_or(0) as u32,
                error: harvest.error,
                started_at: harvest.started_at,
                finished_at: harvest.finished_at,
                source_id: harvest.source_id,
            };
            self.store.record_source_run(&record).await?;
        }
        Ok(())
    }

    async fn discover(&self, run_id: Uuid) -> Result<DiscoveryOutcome, PipelineError> {
        let now = Utc::now();
        let mut seeds = Vec::new();
        for seed in &self.config.profile.seeds {
            let stored = self.store.upsert_pi(&PiRecord::seed(&seed.id, &seed.name, now)).await?;
            seeds.push(stored);
        }
        if seeds.is_empty() {
            warn!("no seed PIs configured; discovery skipped");
            return Ok(DiscoveryOutcome::default());
        }

        let graph: Arc<dyn AcademicGraph> = match &self.graph {
            Some(graph) => graph.clone(),
            None => {
                let config = SemanticScholarConfig {
                    api_key: self.config.sync.semantic_scholar_api_key.clone(),
                    user_agent: Some(self.config.sync.user_agent.clone()),
                    timeout: Duration::from_secs(self.config.sync.http_timeout_secs),
                    ..SemanticScholarConfig::default()
                };
                Arc::new(SemanticScholarClient::new(config, run_id)?)
            }
        };

        let profile = &self.config.profile;
        let discovery = Discovery::new(graph.as_ref(), &self.config.tiers, profile.recommender, profile.discovery);
        let seeds = discovery.profile_seeds(&seeds, now).await;
        let mut stored_seeds = Vec::with_capacity(seeds.len());
        for seed in &seeds {
            stored_seeds.push(self.store.upsert_pi(seed).await?);
        }
        let seeds = stored_seeds;
        let report = discovery
            .run(&seeds, now)
            .instrument(info_span!("discovery", seeds = seeds.len()))
            .await;

        let mut stored = 0;
        for candidate in &report.candidates {
            self.store.upsert_pi(candidate).await?;
            stored += 1;
        }
        Ok(DiscoveryOutcome {
            candidates: report.candidates.len(),
            stored,
            skipped_seeds: report
                .skipped_seeds
                .into_iter()
                .map(|SkippedSeed { external_id, .. }| external_id)
                .collect(),
        })
    }

    /// Fetch each watched lab page once and compare it with the last check.
    /// The first check of a page only records its baseline.
    async fn check_watchlist(&self, run_id: Uuid) -> Result<WatchOutcome, PipelineError> {
        let mut outcome = WatchOutcome::default();
        for entry in self.store.list_watchlist().await? {
            let Some(lab_url) = entry.lab_url.as_deref() else {
                continue;
            };
            let response = match self.http.fetch_bytes(run_id, "watchlist", lab_url).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(pi = %entry.pi_name, url = lab_url, error = %err, "lab page unavailable");
                    outcome.failed += 1;
                    continue;
                }
            };
            let hash = sha256_hex(normalize_text(&response.text()).as_bytes());
            outcome.checked += 1;
            if entry.last_content_hash.as_deref().is_some_and(|previous| previous != hash) {
                info!(pi = %entry.pi_name, url = lab_url, "lab page changed");
                outcome.changed.push(entry.pi_name.clone());
            }
            self.store.record_watch_check(&entry.pi_name, &hash, Utc::now()).await?;
        }
        Ok(outcome)
    }

    async fn report(
        &self,
        run_id: Uuid,
        run_started_at: Option<DateTime<Utc>>,
        lab_pages_changed: Vec<String>,
    ) -> Result<(PathBuf, String), PipelineError> {
        let snapshot = ReportSnapshot {
            postings: self.store.list_postings(&PostingFilter::default()).await?,
            recommended_pis: self
                .store
                .list_pis(&PiFilter {
                    recommended_only: true,
                    ..PiFilter::default()
                })
                .await?,
            source_runs: self.store.source_runs(run_id).await?,
            run_started_at,
            lab_pages_changed,
        };
        let report = build_report(&snapshot, Utc::now());
        let dir = self.config.sync.report_dir.clone();
        let (path, report) =
            tokio::task::spawn_blocking(move || write_workbook(&report, &dir).map(|path| (path, report)))
                .await
                .map_err(|err| PipelineError::Report(format!("report writer panicked: {err}")))??;
        Ok((path, render_text_summary(&report)))
    }
}

/// Cron-driven daily and weekly runs on a shared pipeline.
pub async fn build_scheduler(pipeline: Arc<Pipeline>, notify: bool) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let jobs = [
        (pipeline.config.sync.daily_cron.clone(), RunMode::Daily),
        (pipeline.config.sync.weekly_cron.clone(), RunMode::Weekly),
    ];
    for (cron, mode) in jobs {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run(RunOptions { mode, notify }).await {
                    Ok(summary) => info!(run_id = %summary.run_id, ?mode, "scheduled run finished"),
                    Err(err) => error!(?mode, error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

pub async fn pipeline_from_env() -> Result<Pipeline> {
    let config = AppConfig::load(SyncConfig::from_env())?;
    Pipeline::new(config).await
}
