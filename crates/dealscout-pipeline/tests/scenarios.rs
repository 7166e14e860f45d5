use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dealscout_adapters::{
    CollectError, Collector, DeliveryError, DeliveryReceipt, DeliveryService, FieldMap,
    FieldMapExtractor, PricingError, PricingService, RecipientReceipt, StaticPricing,
};
use dealscout_core::{AlertRecord, Digest, Listing, MarketQuote, RawRecord, RejectReason};
use dealscout_pipeline::{build_scheduler, Collaborators, Pipeline, PipelineConfig, RunOutcome};
use dealscout_storage::{AlertStore, MemoryAlertStore, RunClaim, StoreError};
use rust_decimal::Decimal;
use serde_json::json;
use tempfile::tempdir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).single().expect("ts")
}

struct VecCollector {
    records: Vec<RawRecord>,
    fail: bool,
}

#[async_trait]
impl Collector for VecCollector {
    fn source_id(&self) -> &str {
        "shop"
    }

    async fn collect(&self) -> Result<Vec<RawRecord>, CollectError> {
        if self.fail {
            return Err(CollectError::unavailable("shop", "connection refused"));
        }
        Ok(self.records.clone())
    }
}

fn record(sku: &str, price: &str) -> RawRecord {
    RawRecord::new(
        "shop",
        format!("fixture#{sku}"),
        "application/json",
        json!({"sku": sku, "title": format!("Item {sku}"), "price": price}).to_string(),
        t0(),
    )
}

fn extractor() -> FieldMapExtractor {
    FieldMapExtractor::new(
        FieldMap {
            sku: "sku".into(),
            title: "title".into(),
            price: "price".into(),
            currency: None,
            url: None,
            url_template: None,
            brand: None,
            availability: None,
        },
        "USD",
    )
}

fn prices(entries: &[(&str, i64)]) -> StaticPricing {
    StaticPricing::new(
        entries
            .iter()
            .map(|(id, p)| (format!("shop:{id}"), MarketQuote::new(Decimal::new(*p, 0))))
            .collect::<HashMap<_, _>>(),
    )
}

#[derive(Clone, Copy)]
enum Mode {
    ConfirmAll,
    Fail,
    DropEntry(&'static str),
}

struct RecordingDelivery {
    mode: Mutex<Mode>,
    sent: Mutex<Vec<Vec<String>>>,
}

impl RecordingDelivery {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    fn sent(&self) -> Vec<Vec<String>> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl DeliveryService for RecordingDelivery {
    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, DeliveryError> {
        self.sent
            .lock()
            .expect("sent lock")
            .push(digest.source_ids().map(str::to_string).collect());
        let mode = *self.mode.lock().expect("mode lock");
        match mode {
            Mode::ConfirmAll => Ok(DeliveryReceipt {
                recipients: vec![RecipientReceipt::confirmed("sub@example.com", digest)],
            }),
            Mode::Fail => Err(DeliveryError::Transport("503 from mail relay".into())),
            Mode::DropEntry(id) => {
                let mut receipt = RecipientReceipt::confirmed("sub@example.com", digest);
                receipt.confirmed.remove(id);
                Ok(DeliveryReceipt {
                    recipients: vec![receipt],
                })
            }
        }
    }
}

struct FlakyPricing;

#[async_trait]
impl PricingService for FlakyPricing {
    async fn quote(&self, listing: &Listing) -> Result<Option<MarketQuote>, PricingError> {
        if listing.source_id == "shop:X1" {
            Ok(Some(MarketQuote::new(Decimal::new(25, 0))))
        } else {
            Err(PricingError::Service("timeout".into()))
        }
    }
}

struct Harness {
    config: PipelineConfig,
    store: Arc<MemoryAlertStore>,
    delivery: Arc<RecordingDelivery>,
}

impl Harness {
    fn new(root: &Path, mode: Mode) -> Self {
        Self {
            config: PipelineConfig::for_workspace(root).expect("config"),
            store: Arc::new(MemoryAlertStore::new()),
            delivery: RecordingDelivery::new(mode),
        }
    }

    fn pipeline(&self, records: Vec<RawRecord>, pricing: Arc<dyn PricingService>) -> Pipeline {
        self.pipeline_with(records, pricing, false)
    }

    fn pipeline_with(
        &self,
        records: Vec<RawRecord>,
        pricing: Arc<dyn PricingService>,
        fail_collect: bool,
    ) -> Pipeline {
        Pipeline::new(
            self.config.clone(),
            Collaborators {
                collectors: vec![Box::new(VecCollector {
                    records,
                    fail: fail_collect,
                })],
                extractor: Arc::new(extractor()),
                pricing,
                delivery: self.delivery.clone(),
                store: self.store.clone(),
            },
        )
    }
}

fn standard_records() -> Vec<RawRecord> {
    vec![record("X2", "20.00"), record("X1", "10.00")]
}

fn standard_prices() -> Arc<dyn PricingService> {
    Arc::new(prices(&[("X1", 25), ("X2", 25)]))
}

#[tokio::test]
async fn scenario_a_discounted_listing_is_sent_first() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);

    let summary = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Sent);
    let ids: Vec<_> = summary.digest.iter().map(|e| e.listing.source_id.as_str()).collect();
    assert_eq!(ids, vec!["shop:X1", "shop:X2"]);
    assert_eq!(summary.digest[0].score.value(), Decimal::new(6, 1));
    assert!(summary
        .digest
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
    assert_eq!(
        h.store.get("shop:X1").await.expect("get"),
        Some(AlertRecord::new("shop:X1", t0()))
    );
}

#[tokio::test]
async fn scenario_b_unexpired_alert_suppresses_listing() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);
    h.store
        .put_many(&[AlertRecord::new("shop:X1", t0() - Duration::days(3))])
        .await
        .expect("seed");

    let summary = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.rejected(RejectReason::AlreadyAlerted), 1);
    assert_eq!(h.delivery.sent(), vec![vec!["shop:X2".to_string()]]);
}

#[tokio::test]
async fn scenario_c_missing_price_is_rejected_and_run_continues() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);
    let pricing: Arc<dyn PricingService> = Arc::new(prices(&[("X1", 25)]));

    let summary = h
        .pipeline(vec![record("X1", "10"), record("X3", "5")], pricing)
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Sent);
    assert_eq!(summary.rejected(RejectReason::PricingUnavailable), 1);
    assert_eq!(summary.accepted, 1);
}

#[tokio::test]
async fn pricing_transport_errors_are_item_rejections() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);

    let summary = h
        .pipeline(standard_records(), Arc::new(FlakyPricing))
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Sent);
    assert_eq!(summary.rejected(RejectReason::PricingUnavailable), 1);
}

#[tokio::test]
async fn scenario_d_failed_delivery_records_nothing_and_next_run_resends() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::Fail);

    let failed = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");
    assert_eq!(failed.outcome, RunOutcome::DeliveryFailed);
    assert!(failed.error.is_some());
    assert!(h.store.load_all().await.expect("load").is_empty());

    h.delivery.set_mode(Mode::ConfirmAll);
    let retried = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0() + Duration::hours(1))
        .await
        .expect("run");
    assert_eq!(retried.outcome, RunOutcome::Sent);
    assert_eq!(retried.accepted, 2);
}

#[tokio::test]
async fn second_run_on_identical_data_sends_nothing() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);

    let first = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("first");
    assert_eq!(first.outcome, RunOutcome::Sent);

    let second = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0() + Duration::days(1))
        .await
        .expect("second");
    assert_eq!(second.outcome, RunOutcome::Empty);
    assert!(second.digest.is_empty());
    assert_eq!(second.rejected(RejectReason::AlreadyAlerted), 2);
    assert_eq!(h.delivery.sent().len(), 1);
}

#[tokio::test]
async fn expired_alerts_no_longer_suppress() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);

    h.pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("first");
    let later = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0() + Duration::days(31))
        .await
        .expect("later");

    assert_eq!(later.outcome, RunOutcome::Sent);
    assert_eq!(later.accepted, 2);
}

#[tokio::test]
async fn partial_delivery_records_only_confirmed_entries() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::DropEntry("shop:X2"));

    let summary = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");
    assert_eq!(summary.outcome, RunOutcome::PartiallySent);
    assert!(h.store.get("shop:X2").await.expect("get").is_none());

    h.delivery.set_mode(Mode::ConfirmAll);
    h.pipeline(standard_records(), standard_prices())
        .run_once_at(t0() + Duration::hours(2))
        .await
        .expect("rerun");
    assert_eq!(h.delivery.sent().last(), Some(&vec!["shop:X2".to_string()]));
}

#[tokio::test]
async fn unreachable_source_aborts_without_sending() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);

    let summary = h
        .pipeline_with(standard_records(), standard_prices(), true)
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::SourceUnavailable);
    assert!(h.delivery.sent().is_empty());
    assert!(h.store.load_all().await.expect("load").is_empty());
}

#[tokio::test]
async fn extraction_failures_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);
    let records = vec![
        record("X1", "10"),
        record("X9", "not a price"),
        RawRecord::new("shop", "fixture#bad", "application/json", "{oops", t0()),
    ];

    let summary = h
        .pipeline(records, standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.extraction_failures, 2);
    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.outcome, RunOutcome::Sent);
}

#[tokio::test]
async fn repeated_source_ids_within_a_run_are_collapsed() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);

    let summary = h
        .pipeline(
            vec![record("X1", "10"), record("X1", "10"), record("X2", "20")],
            standard_prices(),
        )
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.digest.len(), 2);
}

#[tokio::test]
async fn held_run_lock_skips_the_run() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);
    let lock_path = h.config.lock_path.clone();
    std::fs::create_dir_all(lock_path.parent().expect("parent")).expect("mkdir");
    std::fs::write(
        &lock_path,
        format!("pid={} started_at={}\n", std::process::id(), Utc::now().to_rfc3339()),
    )
    .expect("lock");

    let summary = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::RunInProgress);
    assert!(h.delivery.sent().is_empty());
    assert!(lock_path.exists(), "a skipped run must not remove another run's lock");
}

#[tokio::test]
async fn run_writes_reports_and_releases_lock() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);

    let summary = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");

    let reports = Path::new(summary.reports_dir.as_deref().expect("reports dir")).to_path_buf();
    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(reports.join("run_summary.json")).expect("summary"))
            .expect("json");
    assert_eq!(json["outcome"], "sent");
    assert!(reports.join("digest.md").exists());
    assert!(!h.config.lock_path.exists());
}

#[tokio::test]
async fn raw_records_are_archived_when_enabled() {
    let dir = tempdir().expect("tempdir");
    let mut h = Harness::new(dir.path(), Mode::ConfirmAll);
    h.config.archive_raw = true;

    let summary = h
        .pipeline(standard_records(), standard_prices())
        .run_once_at(t0())
        .await
        .expect("run");

    assert_eq!(summary.archived, 2);
    assert!(h.config.artifacts_dir.join("20260302").join("shop").is_dir());
}

#[tokio::test]
async fn abandoned_lock_from_a_killed_run_is_taken_over() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);
    let lock_path = h.config.lock_path.clone();
    std::fs::create_dir_all(lock_path.parent().expect("parent")).expect("mkdir");
    std::fs::write(
        &lock_path,
        format!("pid=999999 started_at={}\n", (Utc::now() - Duration::days(2)).to_rfc3339()),
    )
    .expect("lock");

    let mut outcomes = Vec::new();
    for day in 0..3 {
        let summary = h
            .pipeline(standard_records(), standard_prices())
            .run_once_at(t0() + Duration::days(day))
            .await
            .expect("run");
        outcomes.push(summary.outcome);
    }

    assert_eq!(
        outcomes,
        vec![RunOutcome::Sent, RunOutcome::Empty, RunOutcome::Empty]
    );
    assert!(!lock_path.exists());
}

/// Memory store whose history is always claimed by some other host.
struct ClaimedElsewhere(MemoryAlertStore);

#[async_trait]
impl AlertStore for ClaimedElsewhere {
    async fn get(&self, source_id: &str) -> Result<Option<AlertRecord>, StoreError> {
        self.0.get(source_id).await
    }

    async fn put_many(&self, records: &[AlertRecord]) -> Result<usize, StoreError> {
        self.0.put_many(records).await
    }

    async fn load_all(&self) -> Result<Vec<AlertRecord>, StoreError> {
        self.0.load_all().await
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StoreError> {
        self.0.list_older_than(cutoff).await
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.0.prune_older_than(cutoff).await
    }

    async fn claim_run(&self) -> Result<Option<RunClaim>, StoreError> {
        Ok(None)
    }
}

#[tokio::test]
async fn history_claimed_by_another_host_skips_the_run() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);
    let store = Arc::new(ClaimedElsewhere(MemoryAlertStore::new()));
    let pipeline = Pipeline::new(
        h.config.clone(),
        Collaborators {
            collectors: vec![Box::new(VecCollector {
                records: standard_records(),
                fail: false,
            })],
            extractor: Arc::new(extractor()),
            pricing: standard_prices(),
            delivery: h.delivery.clone(),
            store: store.clone(),
        },
    );

    let summary = pipeline.run_once_at(t0()).await.expect("run");

    assert_eq!(summary.outcome, RunOutcome::RunInProgress);
    assert!(h.delivery.sent().is_empty());
    assert!(store.load_all().await.expect("load").is_empty());
    assert!(!h.config.lock_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_accepts_the_configured_cron() {
    let dir = tempdir().expect("tempdir");
    let h = Harness::new(dir.path(), Mode::ConfirmAll);
    let pipeline = Arc::new(h.pipeline(standard_records(), standard_prices()));

    build_scheduler(pipeline).await.expect("scheduler");
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_rejects_a_malformed_cron() {
    let dir = tempdir().expect("tempdir");
    let mut h = Harness::new(dir.path(), Mode::ConfirmAll);
    h.config.scheduler_cron = "every day at seven please ok".into();
    let pipeline = Arc::new(h.pipeline(standard_records(), standard_prices()));

    assert!(build_scheduler(pipeline).await.is_err());
}
