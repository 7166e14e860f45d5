//! Collaborator contracts for the DealScout pipeline plus their concrete
//! clients: collectors, extractors, pricing lookups and digest delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dealscout_core::{Digest, Listing, MarketQuote, RawRecord};
use dealscout_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod clean;
mod collector;
mod delivery;
mod extract;
mod pricing;

pub use clean::{LlmNameCleaner, MAX_CLEAN_NAME_CHARS};
pub use collector::{FixtureCollector, SearchApiCollector, SearchApiOptions};
pub use delivery::{MarkdownFileDelivery, SendGridDelivery};
pub use extract::{
    html_to_text, parse_price, strip_code_fences, validate_candidate, FieldMap,
    FieldMapExtractor, ListingCandidate, LlmExtractor, LlmExtractorConfig,
};
pub use pricing::{KeepaPricing, StaticPricing};

pub const CRATE_NAME: &str = "dealscout-adapters";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },
}

impl CollectError {
    pub fn unavailable(source_id: &str, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Per-record extraction failure. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("required field `{0}` is missing or blank")]
    MissingField(&'static str),
    #[error("price `{0}` is not a positive decimal")]
    InvalidPrice(String),
    #[error("currency `{0}` is not a 3-letter code")]
    InvalidCurrency(String),
    #[error("payload is malformed: {0}")]
    Malformed(String),
    #[error("extraction service failed: {0}")]
    Service(String),
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("pricing service failed: {0}")]
    Service(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no recipients configured")]
    NoRecipients,
    #[error("delivery transport failed: {0}")]
    Transport(String),
}

/// Produces the raw candidate listings for one run.
#[async_trait]
pub trait Collector: Send + Sync {
    fn source_id(&self) -> &str;

    async fn collect(&self) -> Result<Vec<RawRecord>, CollectError>;
}

/// Turns one raw record into a validated [`Listing`].
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, record: &RawRecord) -> Result<Listing, ExtractionFailure>;
}

/// Looks up the current marketplace price. `Ok(None)` means "not found".
#[async_trait]
pub trait PricingService: Send + Sync {
    async fn quote(&self, listing: &Listing) -> Result<Option<MarketQuote>, PricingError>;
}

/// Rewrites a retailer title into a shorter marketplace search name.
#[async_trait]
pub trait NameCleaner: Send + Sync {
    async fn clean(&self, title: &str) -> Result<String, PricingError>;
}

/// Transmits a digest and reports which entries each recipient confirmed.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, DeliveryError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecipientReceipt {
    pub recipient: String,
    pub confirmed: BTreeSet<String>,
    pub error: Option<String>,
}

impl RecipientReceipt {
    pub fn confirmed(recipient: impl Into<String>, digest: &Digest) -> Self {
        Self {
            recipient: recipient.into(),
            confirmed: digest.source_ids().map(str::to_string).collect(),
            error: None,
        }
    }

    pub fn failed(recipient: impl Into<String>, error: impl ToString) -> Self {
        Self {
            recipient: recipient.into(),
            confirmed: BTreeSet::new(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub recipients: Vec<RecipientReceipt>,
}

impl DeliveryReceipt {
    /// Entries confirmed by every recipient. Empty when there are no recipients.
    pub fn confirmed_by_all(&self) -> BTreeSet<String> {
        let mut iter = self.recipients.iter();
        let Some(first) = iter.next() else {
            return BTreeSet::new();
        };
        iter.fold(first.confirmed.clone(), |acc, r| {
            acc.intersection(&r.confirmed).cloned().collect()
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecipientReceipt> {
        self.recipients.iter().filter(|r| r.error.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    SearchApi,
    Fixture,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Name of the env var holding the API key, never the key itself.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_records: Option<usize>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// CSS selector for one product on an HTML page.
    #[serde(default)]
    pub item_selector: Option<String>,
}

pub fn collector_for_source(
    source: &SourceConfig,
    http: Arc<HttpFetcher>,
    workspace_root: &Path,
) -> anyhow::Result<Box<dyn Collector>> {
    match source.kind {
        SourceKind::SearchApi => {
            let url = source
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("source {} has no url", source.source_id))?;
            let api_key = source
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            let defaults = SearchApiOptions::default();
            let options = SearchApiOptions {
                query: source.query.clone().unwrap_or(defaults.query),
                sort: source.sort.clone().or(defaults.sort),
                page_size: source.page_size.unwrap_or(defaults.page_size),
                max_records: source.max_records.unwrap_or(defaults.max_records),
                headers: source.headers.clone(),
            };
            Ok(Box::new(SearchApiCollector::new(
                &source.source_id,
                url,
                api_key,
                options,
                http,
            )))
        }
        SourceKind::Fixture => {
            let path = source
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("source {} has no path", source.source_id))?;
            let path = if path.is_absolute() {
                path
            } else {
                workspace_root.join(path)
            };
            let collector = FixtureCollector::new(&source.source_id, path);
            let collector = match source.item_selector.as_deref() {
                Some(css) => collector
                    .with_item_selector(css)
                    .with_context(|| format!("source {}", source.source_id))?,
                None => collector,
            };
            Ok(Box::new(collector))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dealscout_core::{DealScore, ScoredListing};
    use rust_decimal::Decimal;

    fn digest(ids: &[&str]) -> Digest {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).single().expect("ts");
        let entries = ids
            .iter()
            .map(|id| ScoredListing {
                listing: Listing {
                    source_id: (*id).to_string(),
                    title: (*id).to_string(),
                    source_price: Decimal::ONE,
                    market_price: Some(Decimal::TWO),
                    currency: "USD".into(),
                    extracted_at: at,
                    url: None,
                    brand: None,
                    in_stock: None,
                },
                score: DealScore::clamped(Decimal::new(5, 1)),
                market_reference: None,
            })
            .collect();
        Digest::assemble(entries, at)
    }

    #[test]
    fn confirmation_requires_every_recipient() {
        let d = digest(&["a", "b", "c"]);
        let mut partial = RecipientReceipt::confirmed("two@example.com", &d);
        partial.confirmed.remove("b");
        let receipt = DeliveryReceipt {
            recipients: vec![RecipientReceipt::confirmed("one@example.com", &d), partial],
        };
        let confirmed: Vec<_> = receipt.confirmed_by_all().into_iter().collect();
        assert_eq!(confirmed, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn a_failed_recipient_confirms_nothing() {
        let d = digest(&["a"]);
        let receipt = DeliveryReceipt {
            recipients: vec![
                RecipientReceipt::confirmed("one@example.com", &d),
                RecipientReceipt::failed("two@example.com", "bounced"),
            ],
        };
        assert!(receipt.confirmed_by_all().is_empty());
        assert_eq!(receipt.failures().count(), 1);
    }

    #[test]
    fn empty_receipt_confirms_nothing() {
        assert!(DeliveryReceipt::default().confirmed_by_all().is_empty());
    }

    #[test]
    fn source_config_parses_from_yaml_shape() {
        let json = serde_json::json!({
            "source_id": "costco",
            "enabled": true,
            "kind": "search_api",
            "url": "https://search.example.com/api",
            "api_key_env": "COSTCO_SEARCH_API_KEY",
            "page_size": 24
        });
        let cfg: SourceConfig = serde_json::from_value(json).expect("config");
        assert_eq!(cfg.kind, SourceKind::SearchApi);
        assert_eq!(cfg.page_size, Some(24));
        assert!(cfg.headers.is_empty());
    }

    #[test]
    fn fixture_source_with_bad_selector_fails_to_build() {
        let source: SourceConfig = serde_json::from_value(serde_json::json!({
            "source_id": "weekly",
            "enabled": true,
            "kind": "fixture",
            "path": "fixtures/weekly.html",
            "item_selector": "li[data-sku"
        }))
        .expect("config");
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("fetcher"));

        let err = collector_for_source(&source, http, Path::new("/tmp"))
            .err()
            .expect("bad selector");
        assert!(format!("{err:#}").contains("weekly"));
    }
}
