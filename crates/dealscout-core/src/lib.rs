//! Core domain model for the DealScout alert pipeline.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

pub const CRATE_NAME: &str = "dealscout-core";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Opaque upstream payload captured by a collector. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    source: String,
    locator: String,
    content_type: String,
    payload: String,
    content_hash: String,
    collected_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(
        source: impl Into<String>,
        locator: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<String>,
        collected_at: DateTime<Utc>,
    ) -> Self {
        let payload = payload.into();
        Self {
            source: source.into(),
            locator: locator.into(),
            content_type: content_type.into(),
            content_hash: sha256_hex(payload.as_bytes()),
            payload,
            collected_at,
        }
    }

    /// Upstream source identifier, e.g. `costco`.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// URL or page cursor the payload came from.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn collected_at(&self) -> DateTime<Utc> {
        self.collected_at
    }

    pub fn is_html(&self) -> bool {
        self.content_type.starts_with("text/html")
    }
}

/// Structured product offer produced by an extractor.
///
/// `source_id` is the dedup key: two listings sharing it are the same opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub source_id: String,
    pub title: String,
    pub source_price: Decimal,
    pub market_price: Option<Decimal>,
    pub currency: String,
    pub extracted_at: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub in_stock: Option<bool>,
}

impl Listing {
    pub fn compose_source_id(source: &str, sku: &str) -> String {
        format!("{}:{}", source.trim(), sku.trim())
    }
}

/// Marketplace price answer for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub price: Decimal,
    /// Fulfillment fees reported alongside the price; zero when unknown.
    #[serde(default)]
    pub fees: Decimal,
    #[serde(default)]
    pub reference: Option<String>,
    /// Marketplace sales rank; lower sells faster.
    #[serde(default)]
    pub sales_rank: Option<u64>,
    /// Number of sellers fulfilled by the marketplace.
    #[serde(default)]
    pub offer_count: Option<u32>,
    /// Past prices, oldest first.
    #[serde(default)]
    pub price_history: Vec<Decimal>,
}

impl MarketQuote {
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            fees: Decimal::ZERO,
            reference: None,
            sales_rank: None,
            offer_count: None,
            price_history: Vec::new(),
        }
    }

    /// Relative distance of `price` from the historical mean, or `None`
    /// with fewer than `min_points` positive history entries.
    pub fn price_deviation(&self, min_points: usize) -> Option<Decimal> {
        let history: Vec<Decimal> = self
            .price_history
            .iter()
            .copied()
            .filter(|p| *p > Decimal::ZERO)
            .collect();
        if history.is_empty() || history.len() < min_points {
            return None;
        }
        let mean = history.iter().sum::<Decimal>() / Decimal::from(history.len());
        Some(((self.price - mean) / mean).abs())
    }
}

/// Normalized discount measure, always within `[DealScore::MIN, DealScore::MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DealScore(Decimal);

impl DealScore {
    pub const MIN: Decimal = Decimal::ZERO;
    pub const MAX: Decimal = Decimal::ONE;

    pub fn clamped(value: Decimal) -> Self {
        Self(value.clamp(Self::MIN, Self::MAX))
    }

    pub fn value(self) -> Decimal {
        self.0
    }
}

impl fmt::Display for DealScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.round_dp(4).normalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredListing {
    pub listing: Listing,
    pub score: DealScore,
    pub market_reference: Option<String>,
}

/// Proof that an opportunity was delivered. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub source_id: String,
    pub alerted_at: DateTime<Utc>,
}

impl AlertRecord {
    pub fn new(source_id: impl Into<String>, alerted_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            alerted_at,
        }
    }

    pub fn is_expired(&self, as_of: DateTime<Utc>, retention: Duration) -> bool {
        self.alerted_at + retention <= as_of
    }
}

/// Point-in-time view of alert state, taken once at run start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertHistory {
    as_of: DateTime<Utc>,
    retention: Duration,
    latest: HashMap<String, DateTime<Utc>>,
}

impl AlertHistory {
    pub fn empty(as_of: DateTime<Utc>, retention: Duration) -> Self {
        Self {
            as_of,
            retention,
            latest: HashMap::new(),
        }
    }

    pub fn from_records(
        records: impl IntoIterator<Item = AlertRecord>,
        as_of: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for record in records {
            latest
                .entry(record.source_id)
                .and_modify(|at| *at = (*at).max(record.alerted_at))
                .or_insert(record.alerted_at);
        }
        Self {
            as_of,
            retention,
            latest,
        }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Timestamp of the unexpired alert for `source_id`, if any.
    pub fn active_alert(&self, source_id: &str) -> Option<DateTime<Utc>> {
        self.latest
            .get(source_id)
            .copied()
            .filter(|at| *at + self.retention > self.as_of)
    }

    pub fn is_alerted(&self, source_id: &str) -> bool {
        self.active_alert(source_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.latest
            .keys()
            .filter(|id| self.is_alerted(id))
            .count()
    }
}

/// Why a listing did not make it into the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    PricingUnavailable,
    NotDiscounted {
        source_price: Decimal,
        market_price: Decimal,
    },
    BelowThreshold {
        score: DealScore,
        threshold: Decimal,
    },
    LowProfit {
        profit: Decimal,
        min_profit: Decimal,
    },
    SlowSeller {
        sales_rank: Option<u64>,
        max_sales_rank: u64,
    },
    FewOffers {
        offer_count: Option<u32>,
        min_offer_count: u32,
    },
    VolatilePrice {
        deviation: Decimal,
        max_deviation: Decimal,
    },
    AlreadyAlerted {
        alerted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PricingUnavailable,
    NotDiscounted,
    BelowThreshold,
    LowProfit,
    SlowSeller,
    FewOffers,
    VolatilePrice,
    AlreadyAlerted,
}

impl Rejection {
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::PricingUnavailable => RejectReason::PricingUnavailable,
            Self::NotDiscounted { .. } => RejectReason::NotDiscounted,
            Self::BelowThreshold { .. } => RejectReason::BelowThreshold,
            Self::LowProfit { .. } => RejectReason::LowProfit,
            Self::SlowSeller { .. } => RejectReason::SlowSeller,
            Self::FewOffers { .. } => RejectReason::FewOffers,
            Self::VolatilePrice { .. } => RejectReason::VolatilePrice,
            Self::AlreadyAlerted { .. } => RejectReason::AlreadyAlerted,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PricingUnavailable => write!(f, "pricing unavailable"),
            Self::NotDiscounted {
                source_price,
                market_price,
            } => write!(f, "source price {source_price} is not below market {market_price}"),
            Self::BelowThreshold { score, threshold } => {
                write!(f, "score {score} below threshold {threshold}")
            }
            Self::LowProfit { profit, min_profit } => {
                write!(f, "profit {profit} below minimum {min_profit}")
            }
            Self::SlowSeller {
                sales_rank: Some(rank),
                max_sales_rank,
            } => write!(f, "sales rank {rank} above {max_sales_rank}"),
            Self::SlowSeller { sales_rank: None, .. } => write!(f, "no sales rank reported"),
            Self::FewOffers {
                offer_count,
                min_offer_count,
            } => write!(
                f,
                "{} offers, need {min_offer_count}",
                offer_count.unwrap_or(0)
            ),
            Self::VolatilePrice {
                deviation,
                max_deviation,
            } => write!(f, "price deviates {deviation} from its average (max {max_deviation})"),
            Self::AlreadyAlerted { alerted_at } => {
                write!(f, "already alerted at {}", alerted_at.to_rfc3339())
            }
        }
    }
}

/// Ordered batch of qualifying listings for one run.
///
/// Entries are sorted by descending score, ties broken by `source_id` ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    entries: Vec<ScoredListing>,
}

impl Digest {
    pub fn assemble(mut entries: Vec<ScoredListing>, generated_at: DateTime<Utc>) -> Self {
        entries.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.listing.source_id.cmp(&b.listing.source_id))
        });
        Self {
            generated_at,
            entries,
        }
    }

    pub fn entries(&self) -> &[ScoredListing] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.listing.source_id.as_str())
    }

    pub fn subject(&self) -> String {
        format!(
            "DealScout digest {}: {} deal{}",
            self.generated_at.format("%Y-%m-%d"),
            self.len(),
            if self.len() == 1 { "" } else { "s" }
        )
    }

    pub fn render_text(&self) -> String {
        let mut out = format!("{}\n\n", self.subject());
        for (idx, entry) in self.entries.iter().enumerate() {
            let listing = &entry.listing;
            let market = listing
                .market_price
                .map(|p| p.round_dp(2).to_string())
                .unwrap_or_else(|| "?".to_string());
            out.push_str(&format!(
                "{}. {} [{}]\n   buy {} {} | market {} {} | score {}\n",
                idx + 1,
                listing.title,
                listing.source_id,
                listing.currency,
                listing.source_price.round_dp(2),
                listing.currency,
                market,
                entry.score,
            ));
            if let Some(url) = &listing.url {
                out.push_str(&format!("   {url}\n"));
            }
        }
        out
    }

    pub fn render_markdown(&self) -> String {
        let mut lines = vec![format!("# {}", self.subject()), String::new()];
        lines.push("| # | Title | Source ID | Buy | Market | Score |".to_string());
        lines.push("|---|---|---|---|---|---|".to_string());
        for (idx, entry) in self.entries.iter().enumerate() {
            let listing = &entry.listing;
            let title = match &listing.url {
                Some(url) => format!("[{}]({url})", listing.title),
                None => listing.title.clone(),
            };
            lines.push(format!(
                "| {} | {} | `{}` | {} {} | {} | {} |",
                idx + 1,
                title,
                listing.source_id,
                listing.currency,
                listing.source_price.round_dp(2),
                listing
                    .market_price
                    .map(|p| p.round_dp(2).to_string())
                    .unwrap_or_default(),
                entry.score,
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}
