use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dealscout_core::{Listing, MarketQuote};
use dealscout_storage::HttpFetcher;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{NameCleaner, PricingError, PricingService};

const MAX_TERM_CHARS: usize = 100;
/// Amazon US marketplace.
const KEEPA_DOMAIN: &str = "1";
/// `csv` index of the Amazon "new" price history.
const NEW_PRICE_SERIES: usize = 1;
/// `csv` index of the sales rank history.
const SALES_RANK_SERIES: usize = 3;

#[derive(Debug, Deserialize)]
struct KeepaResponse {
    #[serde(default)]
    products: Vec<KeepaProduct>,
}

#[derive(Debug, Deserialize)]
struct KeepaProduct {
    #[serde(default)]
    asin: Option<String>,
    #[serde(default)]
    csv: Vec<Option<Vec<i64>>>,
    #[serde(default, rename = "fbaFees")]
    fba_fees: Option<KeepaFees>,
    #[serde(default, rename = "offerCountFBA")]
    offer_count_fba: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct KeepaFees {
    #[serde(default, rename = "pickAndPackFee")]
    pick_and_pack_fee: Option<i64>,
    #[serde(default, rename = "storageFee")]
    storage_fee: Option<i64>,
}

fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

impl KeepaProduct {
    /// Values of a `csv` series; entries alternate `time, value` and
    /// non-positive values mark gaps.
    fn series(&self, index: usize) -> impl Iterator<Item = i64> + '_ {
        self.csv
            .get(index)
            .and_then(Option::as_ref)
            .into_iter()
            .flat_map(|series| series.iter().skip(1).step_by(2).copied())
    }

    fn latest_price(&self) -> Option<Decimal> {
        self.series(NEW_PRICE_SERIES)
            .filter(|p| *p > 0)
            .last()
            .map(cents)
    }

    fn price_history(&self) -> Vec<Decimal> {
        self.series(NEW_PRICE_SERIES)
            .filter(|p| *p > 0)
            .map(cents)
            .collect()
    }

    /// Only the newest rank counts; a gap there means "unranked".
    fn sales_rank(&self) -> Option<u64> {
        self.series(SALES_RANK_SERIES)
            .last()
            .and_then(|rank| u64::try_from(rank).ok())
            .filter(|rank| *rank > 0)
    }

    fn offer_count(&self) -> Option<u32> {
        self.offer_count_fba.and_then(|n| u32::try_from(n).ok())
    }

    fn quote(&self) -> Option<MarketQuote> {
        Some(MarketQuote {
            price: self.latest_price()?,
            fees: self.fees(),
            reference: self.asin.clone(),
            sales_rank: self.sales_rank(),
            offer_count: self.offer_count(),
            price_history: self.price_history(),
        })
    }

    fn fees(&self) -> Decimal {
        self.fba_fees
            .as_ref()
            .map(|f| {
                let total = f.pick_and_pack_fee.unwrap_or(0).max(0) + f.storage_fee.unwrap_or(0).max(0);
                cents(total)
            })
            .unwrap_or(Decimal::ZERO)
    }
}

/// Search term for a title: brand prefixed when missing, commas removed,
/// capped in length.
pub(crate) fn search_term(title: &str, brand: Option<&str>) -> String {
    let joined = match brand {
        Some(brand) if !title.to_lowercase().contains(&brand.to_lowercase()) => {
            format!("{brand} {title}")
        }
        _ => title.to_string(),
    };
    let cleaned = joined.replace(',', "");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    cleaned.chars().take(MAX_TERM_CHARS).collect()
}

/// Keepa product-search pricing client.
pub struct KeepaPricing {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
    cleaner: Option<Arc<dyn NameCleaner>>,
}

impl KeepaPricing {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.keepa.com";

    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            cleaner: None,
        }
    }

    /// Searches with cleaned names; a failed cleaning falls back to the raw title.
    pub fn with_name_cleaner(mut self, cleaner: Arc<dyn NameCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    async fn search_title(&self, listing: &Listing) -> String {
        let Some(cleaner) = &self.cleaner else {
            return listing.title.clone();
        };
        match cleaner.clean(&listing.title).await {
            Ok(name) => name,
            Err(err) => {
                warn!(
                    source_id = %listing.source_id,
                    error = %err,
                    "name cleaning failed; searching with the raw title"
                );
                listing.title.clone()
            }
        }
    }
}

#[async_trait]
impl PricingService for KeepaPricing {
    async fn quote(&self, listing: &Listing) -> Result<Option<MarketQuote>, PricingError> {
        let title = self.search_title(listing).await;
        let term = search_term(&title, listing.brand.as_deref());
        let url = format!("{}/product", self.base_url.trim_end_matches('/'));
        let query = [
            ("key", self.api_key.clone()),
            ("domain", KEEPA_DOMAIN.to_string()),
            ("type", "search".to_string()),
            ("term", term.clone()),
            ("stats", "90".to_string()),
        ];
        let resp: KeepaResponse = self
            .http
            .get_json("keepa", &url, &query, &[])
            .await
            .map_err(|e| PricingError::Service(e.to_string()))?;

        let quote = resp.products.iter().find_map(KeepaProduct::quote);
        debug!(
            source_id = %listing.source_id,
            term = %term,
            found = quote.is_some(),
            "keepa lookup"
        );
        Ok(quote)
    }
}

/// Fixed quotes keyed by `source_id`, for offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    quotes: HashMap<String, MarketQuote>,
}

impl StaticPricing {
    pub fn new(quotes: HashMap<String, MarketQuote>) -> Self {
        Self { quotes }
    }

    /// Accepts either `{"id": {"price": "25.00", ...}}` or `{"id": 25.0}`.
    pub async fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading static prices {}", path.display()))?;
        let raw: HashMap<String, JsonValue> = serde_json::from_str(&text)
            .with_context(|| format!("parsing static prices {}", path.display()))?;
        let mut quotes = HashMap::with_capacity(raw.len());
        for (id, value) in raw {
            let quote = match value {
                JsonValue::Object(_) => serde_json::from_value::<MarketQuote>(value)
                    .with_context(|| format!("static price for {id}"))?,
                other => MarketQuote::new(
                    crate::parse_price(&other).map_err(|e| anyhow::anyhow!("static price for {id}: {e}"))?,
                ),
            };
            quotes.insert(id, quote);
        }
        Ok(Self { quotes })
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

#[async_trait]
impl PricingService for StaticPricing {
    async fn quote(&self, listing: &Listing) -> Result<Option<MarketQuote>, PricingError> {
        Ok(self.quotes.get(&listing.source_id).cloned())
    }
}
