use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use chrono::Duration;
use dealscout_adapters::SourceConfig;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

fn invalid(var: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidEnvVar {
        var: var.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Fields,
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingKind {
    Keepa,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    SendGrid,
    Outbox,
}

/// Deal-scoring assumptions. The defaults give the plain
/// `(market - source) / market` score with every market-signal filter off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringConfig {
    pub min_deal_score: Decimal,
    /// Fraction of the market price kept by the marketplace.
    pub referral_fee_rate: Decimal,
    /// Subtract the quote's fulfillment fees from net proceeds.
    pub apply_quote_fees: bool,
    /// Absolute floor on `net - source`. Zero disables it.
    pub min_profit: Decimal,
    /// Reject when the quote's sales rank is above this, or missing.
    pub max_sales_rank: Option<u64>,
    /// Reject when fewer sellers than this are reported.
    pub min_offer_count: Option<u32>,
    /// Reject when the price is further than this fraction from its
    /// historical mean. Needs enough history to apply.
    pub max_price_deviation: Option<Decimal>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_deal_score: Decimal::new(2, 1),
            referral_fee_rate: Decimal::ZERO,
            apply_quote_fees: false,
            min_profit: Decimal::ZERO,
            max_sales_rank: None,
            min_offer_count: None,
            max_price_deviation: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SendGridSettings {
    pub api_key: String,
    pub base_url: String,
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub sources_path: PathBuf,
    pub alerts_path: PathBuf,
    pub database_url: Option<String>,
    pub lock_path: PathBuf,
    /// A run lock older than this is treated as abandoned.
    pub lock_stale_after: Duration,
    pub reports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub archive_raw: bool,
    pub scoring: ScoringConfig,
    pub alert_retention: Duration,
    pub max_concurrency: usize,
    pub default_currency: String,
    pub extractor: ExtractorKind,
    pub llm: Option<LlmSettings>,
    /// Rewrite listing titles with the LLM before marketplace search.
    pub clean_names: bool,
    pub pricing: PricingKind,
    pub keepa_api_key: Option<String>,
    pub keepa_base_url: String,
    pub static_prices_path: PathBuf,
    pub delivery: DeliveryKind,
    pub sendgrid: Option<SendGridSettings>,
    pub outbox_dir: PathBuf,
    pub scheduler_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    /// Reads the process environment. The binary loads `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        build_config(|key| std::env::var(key))
    }

    /// Defaults rooted at `workspace_root`, with offline collaborators.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = workspace_root.into().display().to_string();
        build_config(|key| match key {
            "DEALSCOUT_WORKSPACE_ROOT" => Ok(root.clone()),
            _ => Err(std::env::VarError::NotPresent),
        })
    }
}

/// Builds configuration from an env-var lookup so tests never touch the
/// process environment.
pub fn build_config<F>(lookup: F) -> Result<PipelineConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let or_default = |var: &str, default: &str| -> String {
        lookup(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    };
    let optional = |var: &str| -> Option<String> {
        lookup(var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let require = |var: &str| -> Result<String, ConfigError> {
        optional(var).ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))
    };
    let parse_bool = |var: &str, default: bool| -> Result<bool, ConfigError> {
        match optional(var) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(var, format!("`{raw}` is not a boolean"))),
            },
        }
    };
    let parse_decimal = |var: &str, default: &str| -> Result<Decimal, ConfigError> {
        let raw = or_default(var, default);
        Decimal::from_str(raw.trim()).map_err(|e| invalid(var, e))
    };
    let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
        or_default(var, default)
            .trim()
            .parse::<u64>()
            .map_err(|e| invalid(var, e))
    };
    let optional_u64 = |var: &str| -> Result<Option<u64>, ConfigError> {
        optional(var)
            .map(|raw| raw.parse::<u64>().map_err(|e| invalid(var, e)))
            .transpose()
    };

    let workspace_root = PathBuf::from(or_default("DEALSCOUT_WORKSPACE_ROOT", "."));
    let resolve = |var: &str, default: &str| -> PathBuf {
        let path = PathBuf::from(or_default(var, default));
        if path.is_absolute() {
            path
        } else {
            workspace_root.join(path)
        }
    };

    let min_deal_score = parse_decimal("DEALSCOUT_MIN_DEAL_SCORE", "0.2")?;
    if min_deal_score < Decimal::ZERO || min_deal_score > Decimal::ONE {
        return Err(invalid("DEALSCOUT_MIN_DEAL_SCORE", "must be within [0, 1]"));
    }
    let referral_fee_rate = parse_decimal("DEALSCOUT_REFERRAL_FEE_RATE", "0")?;
    if referral_fee_rate < Decimal::ZERO || referral_fee_rate >= Decimal::ONE {
        return Err(invalid("DEALSCOUT_REFERRAL_FEE_RATE", "must be within [0, 1)"));
    }
    let min_profit = parse_decimal("DEALSCOUT_MIN_PROFIT", "0")?;
    if min_profit < Decimal::ZERO {
        return Err(invalid("DEALSCOUT_MIN_PROFIT", "must not be negative"));
    }
    let min_offer_count = optional_u64("DEALSCOUT_MIN_OFFER_COUNT")?
        .map(|n| u32::try_from(n).map_err(|e| invalid("DEALSCOUT_MIN_OFFER_COUNT", e)))
        .transpose()?;
    let max_price_deviation = optional("DEALSCOUT_MAX_PRICE_DEVIATION")
        .map(|raw| Decimal::from_str(&raw).map_err(|e| invalid("DEALSCOUT_MAX_PRICE_DEVIATION", e)))
        .transpose()?;
    if max_price_deviation.is_some_and(|d| d <= Decimal::ZERO) {
        return Err(invalid("DEALSCOUT_MAX_PRICE_DEVIATION", "must be positive"));
    }
    let scoring = ScoringConfig {
        min_deal_score,
        referral_fee_rate,
        apply_quote_fees: parse_bool("DEALSCOUT_APPLY_QUOTE_FEES", false)?,
        min_profit,
        max_sales_rank: optional_u64("DEALSCOUT_MAX_SALES_RANK")?,
        min_offer_count,
        max_price_deviation,
    };

    let retention_days = parse_u64("DEALSCOUT_ALERT_RETENTION_DAYS", "30")?;
    if retention_days == 0 || retention_days > 3650 {
        return Err(invalid("DEALSCOUT_ALERT_RETENTION_DAYS", "must be between 1 and 3650"));
    }
    let lock_stale_minutes = parse_u64("DEALSCOUT_LOCK_STALE_MINUTES", "360")?;
    if lock_stale_minutes == 0 {
        return Err(invalid("DEALSCOUT_LOCK_STALE_MINUTES", "must be at least 1"));
    }
    let max_concurrency = parse_u64("DEALSCOUT_MAX_CONCURRENCY", "4")?;
    if max_concurrency == 0 {
        return Err(invalid("DEALSCOUT_MAX_CONCURRENCY", "must be at least 1"));
    }

    let default_currency = or_default("DEALSCOUT_DEFAULT_CURRENCY", "USD");
    if default_currency.len() != 3 || !default_currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid("DEALSCOUT_DEFAULT_CURRENCY", "must be a 3-letter code"));
    }

    let extractor = match or_default("DEALSCOUT_EXTRACTOR", "fields").as_str() {
        "fields" => ExtractorKind::Fields,
        "llm" => ExtractorKind::Llm,
        other => return Err(invalid("DEALSCOUT_EXTRACTOR", format!("unknown extractor `{other}`"))),
    };
    let clean_names = parse_bool("DEALSCOUT_CLEAN_NAMES", false)?;
    let llm = if extractor == ExtractorKind::Llm || clean_names {
        Some(LlmSettings {
            api_key: require("OPENAI_API_KEY")?,
            model: or_default("DEALSCOUT_LLM_MODEL", "gpt-4o-mini"),
            base_url: or_default("DEALSCOUT_LLM_BASE_URL", "https://api.openai.com"),
        })
    } else {
        None
    };

    let pricing = match or_default("DEALSCOUT_PRICING", "static").as_str() {
        "keepa" => PricingKind::Keepa,
        "static" => PricingKind::Static,
        other => return Err(invalid("DEALSCOUT_PRICING", format!("unknown pricing service `{other}`"))),
    };
    let keepa_api_key = match pricing {
        PricingKind::Keepa => Some(require("KEEPA_API_KEY")?),
        PricingKind::Static => optional("KEEPA_API_KEY"),
    };

    let delivery = match or_default("DEALSCOUT_DELIVERY", "outbox").as_str() {
        "sendgrid" => DeliveryKind::SendGrid,
        "outbox" => DeliveryKind::Outbox,
        other => return Err(invalid("DEALSCOUT_DELIVERY", format!("unknown delivery service `{other}`"))),
    };
    let sendgrid = match delivery {
        DeliveryKind::SendGrid => {
            let to: Vec<String> = require("DEALSCOUT_EMAIL_TO")?
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if to.is_empty() {
                return Err(invalid("DEALSCOUT_EMAIL_TO", "no recipients listed"));
            }
            Some(SendGridSettings {
                api_key: require("SENDGRID_API_KEY")?,
                base_url: or_default("DEALSCOUT_SENDGRID_BASE_URL", "https://api.sendgrid.com"),
                from: require("DEALSCOUT_EMAIL_FROM")?,
                to,
            })
        }
        DeliveryKind::Outbox => None,
    };

    let scheduler_cron = or_default("DEALSCOUT_SCHEDULER_CRON", "0 0 7 * * *");
    if scheduler_cron.split_whitespace().count() < 6 {
        return Err(invalid(
            "DEALSCOUT_SCHEDULER_CRON",
            "expected a 6-field cron expression (sec min hour dom mon dow)",
        ));
    }

    Ok(PipelineConfig {
        sources_path: resolve("DEALSCOUT_SOURCES_PATH", "sources.yaml"),
        alerts_path: resolve("DEALSCOUT_ALERTS_PATH", "state/alerts.json"),
        database_url: optional("DEALSCOUT_DATABASE_URL"),
        lock_path: resolve("DEALSCOUT_LOCK_PATH", "state/dealscout.lock"),
        lock_stale_after: Duration::minutes(lock_stale_minutes as i64),
        reports_dir: resolve("DEALSCOUT_REPORTS_DIR", "reports"),
        artifacts_dir: resolve("DEALSCOUT_ARTIFACTS_DIR", "artifacts"),
        archive_raw: parse_bool("DEALSCOUT_ARCHIVE_RAW", false)?,
        scoring,
        alert_retention: Duration::days(retention_days as i64),
        max_concurrency: max_concurrency as usize,
        default_currency: default_currency.to_ascii_uppercase(),
        extractor,
        llm,
        clean_names,
        pricing,
        keepa_api_key,
        keepa_base_url: or_default("DEALSCOUT_KEEPA_BASE_URL", "https://api.keepa.com"),
        static_prices_path: resolve("DEALSCOUT_STATIC_PRICES_PATH", "fixtures/prices.json"),
        delivery,
        sendgrid,
        outbox_dir: resolve("DEALSCOUT_OUTBOX_DIR", "outbox"),
        scheduler_cron,
        user_agent: or_default("DEALSCOUT_USER_AGENT", "dealscout/0.1"),
        http_timeout_secs: parse_u64("DEALSCOUT_HTTP_TIMEOUT_SECS", "20")?,
        workspace_root,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}
