//! Run orchestration: collect, extract, price, evaluate, notify, report.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dealscout_adapters::{Collector, DeliveryService, Extractor, PricingService};
use dealscout_core::{Listing, MarketQuote, RawRecord, RejectReason, ScoredListing};
use dealscout_storage::{AlertStore, RawArchive, RunLock, StoreError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod evaluator;
pub mod notifier;

pub use config::{
    build_config, ConfigError, DeliveryKind, ExtractorKind, LlmSettings, PipelineConfig,
    PricingKind, ScoringConfig, SourceRegistry,
};
pub use evaluator::evaluate;
pub use notifier::{DeliveryResult, Notification, Notifier};

pub const CRATE_NAME: &str = "dealscout-pipeline";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Sent,
    PartiallySent,
    /// Nothing qualified; no digest was sent.
    Empty,
    SourceUnavailable,
    DeliveryFailed,
    Unrecorded,
    /// Another run held the lock; this one did nothing.
    RunInProgress,
}

impl RunOutcome {
    fn from_delivery(result: &DeliveryResult) -> Self {
        match result {
            DeliveryResult::Empty => Self::Empty,
            DeliveryResult::Delivered { .. } => Self::Sent,
            DeliveryResult::Partial { .. } => Self::PartiallySent,
            DeliveryResult::Failed { .. } => Self::DeliveryFailed,
            DeliveryResult::Unrecorded { .. } => Self::Unrecorded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub sources: usize,
    pub collected: usize,
    pub archived: usize,
    pub extracted: usize,
    pub extraction_failures: usize,
    pub duplicates: usize,
    pub rejections: BTreeMap<RejectReason, usize>,
    pub accepted: usize,
    pub active_alerts_at_start: usize,
    pub delivery: Option<DeliveryResult>,
    pub error: Option<String>,
    pub digest: Vec<ScoredListing>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    fn started(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            outcome: RunOutcome::Empty,
            sources: 0,
            collected: 0,
            archived: 0,
            extracted: 0,
            extraction_failures: 0,
            duplicates: 0,
            rejections: BTreeMap::new(),
            accepted: 0,
            active_alerts_at_start: 0,
            delivery: None,
            error: None,
            digest: Vec::new(),
            reports_dir: None,
        }
    }

    pub fn rejected(&self, reason: RejectReason) -> usize {
        self.rejections.get(&reason).copied().unwrap_or(0)
    }
}

/// Everything a run talks to. Injected so tests can substitute fakes.
pub struct Collaborators {
    pub collectors: Vec<Box<dyn Collector>>,
    pub extractor: Arc<dyn Extractor>,
    pub pricing: Arc<dyn PricingService>,
    pub delivery: Arc<dyn DeliveryService>,
    pub store: Arc<dyn AlertStore>,
}

pub struct Pipeline {
    config: PipelineConfig,
    collectors: Vec<Box<dyn Collector>>,
    extractor: Arc<dyn Extractor>,
    pricing: Arc<dyn PricingService>,
    store: Arc<dyn AlertStore>,
    notifier: Notifier,
    archive: Option<RawArchive>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, parts: Collaborators) -> Self {
        let archive = config
            .archive_raw
            .then(|| RawArchive::new(config.artifacts_dir.clone()));
        Self {
            notifier: Notifier::new(parts.delivery, parts.store.clone()),
            collectors: parts.collectors,
            extractor: parts.extractor,
            pricing: parts.pricing,
            store: parts.store,
            archive,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_once_at(Utc::now()).await
    }

    /// One full run with `now` as the snapshot instant and alert timestamp.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run(run_id, now).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<RunSummary> {
        let mut summary = RunSummary::started(run_id, now);

        let _lock = match RunLock::acquire(&self.config.lock_path, self.config.lock_stale_after).await {
            Ok(lock) => lock,
            Err(StoreError::LockHeld { path }) => {
                warn!(lock = %path.display(), "another run is in progress; skipping");
                return Ok(skipped(summary));
            }
            Err(err) => return Err(err).context("acquiring run lock"),
        };
        let _claim = match self.store.claim_run().await.context("claiming alert history")? {
            Some(claim) => claim,
            None => {
                warn!("alert history is claimed by a run on another host; skipping");
                return Ok(skipped(summary));
            }
        };

        let history = self
            .store
            .snapshot(now, self.config.alert_retention)
            .await
            .context("loading alert history")?;
        summary.active_alerts_at_start = history.active_count();
        summary.sources = self.collectors.len();
        info!(
            sources = summary.sources,
            active_alerts = summary.active_alerts_at_start,
            "run started"
        );

        let records = match self.collect_all().await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "collection failed; aborting run");
                summary.outcome = RunOutcome::SourceUnavailable;
                summary.error = Some(err.to_string());
                return self.finish(summary).await;
            }
        };
        summary.collected = records.len();

        if let Some(archive) = &self.archive {
            summary.archived = self.archive_all(archive, &records).await;
        }

        let listings = self.extract_all(records, &mut summary).await;
        let priced = self.price_all(listings).await;

        let mut accepted = Vec::new();
        for (listing, quote) in priced {
            let source_id = listing.source_id.clone();
            match evaluate(listing, quote.as_ref(), &history, &self.config.scoring) {
                Ok(scored) => accepted.push(scored),
                Err(rejection) => {
                    debug!(source_id = %source_id, reason = %rejection, "listing rejected");
                    *summary.rejections.entry(rejection.reason()).or_default() += 1;
                }
            }
        }
        summary.accepted = accepted.len();

        let notification = self.notifier.notify(accepted, now).await;
        summary.outcome = RunOutcome::from_delivery(&notification.result);
        summary.digest = notification.digest.entries().to_vec();
        if let DeliveryResult::Failed { reason } | DeliveryResult::Unrecorded { reason, .. } =
            &notification.result
        {
            summary.error = Some(reason.clone());
        }
        summary.delivery = Some(notification.result);

        self.finish(summary).await
    }

    async fn finish(&self, mut summary: RunSummary) -> Result<RunSummary> {
        summary.finished_at = Utc::now();
        match write_reports(&self.config.reports_dir, &summary).await {
            Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => error!(error = ?err, "failed to write run reports"),
        }
        info!(
            outcome = ?summary.outcome,
            collected = summary.collected,
            extracted = summary.extracted,
            extraction_failures = summary.extraction_failures,
            accepted = summary.accepted,
            "run finished"
        );
        Ok(summary)
    }

    /// Any failing source fails the whole collection.
    async fn collect_all(&self) -> Result<Vec<RawRecord>, dealscout_adapters::CollectError> {
        let mut records = Vec::new();
        for collector in &self.collectors {
            let batch = collector.collect().await?;
            info!(source_id = collector.source_id(), records = batch.len(), "source collected");
            records.extend(batch);
        }
        Ok(records)
    }

    async fn archive_all(&self, archive: &RawArchive, records: &[RawRecord]) -> usize {
        let mut archived = 0;
        for record in records {
            match archive.store(record).await {
                Ok(_) => archived += 1,
                Err(err) => warn!(
                    locator = record.locator(),
                    error = ?err,
                    "failed to archive raw record"
                ),
            }
        }
        archived
    }

    /// Extracts with bounded concurrency, skipping failures and repeated ids.
    async fn extract_all(&self, records: Vec<RawRecord>, summary: &mut RunSummary) -> Vec<Listing> {
        let results: Vec<_> = stream::iter(records.into_iter().map(|record| {
            let extractor = Arc::clone(&self.extractor);
            async move {
                let result = extractor.extract(&record).await;
                (record, result)
            }
        }))
        .buffered(self.config.max_concurrency.max(1))
        .collect()
        .await;

        let mut seen = HashSet::new();
        let mut listings = Vec::with_capacity(results.len());
        for (record, result) in results {
            match result {
                Ok(listing) => {
                    if seen.insert(listing.source_id.clone()) {
                        listings.push(listing);
                    } else {
                        summary.duplicates += 1;
                    }
                }
                Err(failure) => {
                    warn!(
                        source = record.source(),
                        locator = record.locator(),
                        content_hash = record.content_hash(),
                        error = %failure,
                        "extraction failed; skipping record"
                    );
                    summary.extraction_failures += 1;
                }
            }
        }
        summary.extracted = listings.len();
        listings
    }

    async fn price_all(&self, listings: Vec<Listing>) -> Vec<(Listing, Option<MarketQuote>)> {
        stream::iter(listings.into_iter().map(|listing| {
            let pricing = Arc::clone(&self.pricing);
            async move {
                let quote = match pricing.quote(&listing).await {
                    Ok(quote) => quote,
                    Err(err) => {
                        warn!(source_id = %listing.source_id, error = %err, "pricing lookup failed");
                        None
                    }
                };
                (listing, quote)
            }
        }))
        .buffered(self.config.max_concurrency.max(1))
        .collect()
        .await
    }
}

fn skipped(mut summary: RunSummary) -> RunSummary {
    summary.outcome = RunOutcome::RunInProgress;
    summary.finished_at = Utc::now();
    summary
}

/// Writes `run_summary.json` and, when anything qualified, `digest.md`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    if !summary.digest.is_empty() {
        let digest = dealscout_core::Digest::assemble(summary.digest.clone(), summary.started_at);
        fs::write(dir.join("digest.md"), digest.render_markdown())
            .await
            .context("writing digest.md")?;
    }
    Ok(dir)
}

/// Deletes alert records older than the retention window. Returns the count removed.
pub async fn prune_expired(
    store: &dyn AlertStore,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - retention;
    let removed = store
        .prune_older_than(cutoff)
        .await
        .context("pruning alert records")?;
    info!(removed, cutoff = %cutoff.to_rfc3339(), "pruned expired alert records");
    Ok(removed)
}

/// Cron-driven runs. Overlapping triggers are skipped by the run lock.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().scheduler_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    outcome = ?summary.outcome,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = ?err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_results_map_to_outcomes() {
        assert_eq!(RunOutcome::from_delivery(&DeliveryResult::Empty), RunOutcome::Empty);
        assert_eq!(
            RunOutcome::from_delivery(&DeliveryResult::Delivered { recorded: 2 }),
            RunOutcome::Sent
        );
        assert_eq!(
            RunOutcome::from_delivery(&DeliveryResult::Partial {
                recorded: 1,
                unconfirmed: vec!["x".into()]
            }),
            RunOutcome::PartiallySent
        );
        assert_eq!(
            RunOutcome::from_delivery(&DeliveryResult::Failed { reason: "down".into() }),
            RunOutcome::DeliveryFailed
        );
    }

    #[test]
    fn summary_serializes_rejection_counts_by_reason() {
        let mut summary = RunSummary::started(Uuid::nil(), Utc::now());
        summary.rejections.insert(RejectReason::AlreadyAlerted, 2);
        let json = serde_json::to_value(&summary).expect("json");
        assert_eq!(json["rejections"]["already_alerted"], 2);
        assert_eq!(json["outcome"], "empty");
    }
}
