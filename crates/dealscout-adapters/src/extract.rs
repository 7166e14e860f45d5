use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealscout_core::{Listing, RawRecord};
use dealscout_storage::HttpFetcher;
use rust_decimal::Decimal;
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::{ExtractionFailure, Extractor};

/// Loosely-typed extraction output. Nothing here is trusted until it passes
/// [`validate_candidate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingCandidate {
    #[serde(default, alias = "costco_sku", alias = "item_number")]
    pub sku: Option<JsonValue>,
    #[serde(default, alias = "name")]
    pub title: Option<String>,
    #[serde(default, alias = "costco_price")]
    pub price: Option<JsonValue>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, alias = "costco_url")]
    pub url: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub in_stock: Option<bool>,
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => non_blank(Some(s)),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses `12.99`, `"12.99"` or `"$1,299.00"` into a strictly positive decimal.
pub fn parse_price(value: &JsonValue) -> Result<Decimal, ExtractionFailure> {
    let raw = match value {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        other => return Err(ExtractionFailure::InvalidPrice(other.to_string())),
    };
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    let price = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|_| ExtractionFailure::InvalidPrice(raw.clone()))?;
    if price <= Decimal::ZERO {
        return Err(ExtractionFailure::InvalidPrice(raw));
    }
    Ok(price.normalize())
}

fn normalize_currency(value: Option<&str>, default: &str) -> Result<String, ExtractionFailure> {
    let code = non_blank(value).unwrap_or_else(|| default.to_string());
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(ExtractionFailure::InvalidCurrency(code))
    }
}

fn absolute_http_url(value: Option<&str>) -> Option<String> {
    non_blank(value).filter(|u| u.starts_with("https://") || u.starts_with("http://"))
}

/// The single gate every extractor output passes through.
pub fn validate_candidate(
    candidate: ListingCandidate,
    source: &str,
    extracted_at: DateTime<Utc>,
    default_currency: &str,
) -> Result<Listing, ExtractionFailure> {
    let sku = candidate
        .sku
        .as_ref()
        .and_then(scalar_to_string)
        .ok_or(ExtractionFailure::MissingField("sku"))?;
    let title = non_blank(candidate.title.as_deref()).ok_or(ExtractionFailure::MissingField("title"))?;
    let price = candidate
        .price
        .as_ref()
        .ok_or(ExtractionFailure::MissingField("price"))
        .and_then(parse_price)?;
    let currency = normalize_currency(candidate.currency.as_deref(), default_currency)?;

    Ok(Listing {
        source_id: Listing::compose_source_id(source, &sku),
        title,
        source_price: price,
        market_price: None,
        currency,
        extracted_at,
        url: absolute_http_url(candidate.url.as_deref()),
        brand: non_blank(candidate.brand.as_deref()),
        in_stock: candidate.in_stock,
    })
}

/// JSON keys read by [`FieldMapExtractor`]. Defaults match the Costco search API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMap {
    pub sku: String,
    pub title: String,
    pub price: String,
    pub currency: Option<String>,
    pub url: Option<String>,
    /// Used when `url` is absent; `{sku}` is substituted.
    pub url_template: Option<String>,
    pub brand: Option<String>,
    pub availability: Option<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            sku: "item_number".into(),
            title: "item_product_name".into(),
            price: "item_location_pricing_salePrice".into(),
            currency: None,
            url: None,
            url_template: Some("https://www.costco.com/p/-/{sku}".into()),
            brand: Some("Brand_attr".into()),
            availability: Some("item_location_availability".into()),
        }
    }
}

fn first_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Array(items) => items.iter().find_map(scalar_to_string),
        other => scalar_to_string(other),
    }
}

fn availability(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => Some(s.trim().eq_ignore_ascii_case("in stock")),
        _ => None,
    }
}

/// Deterministic extractor for payloads that are already structured JSON.
#[derive(Debug, Clone)]
pub struct FieldMapExtractor {
    fields: FieldMap,
    default_currency: String,
}

impl FieldMapExtractor {
    pub fn new(fields: FieldMap, default_currency: impl Into<String>) -> Self {
        Self {
            fields,
            default_currency: default_currency.into(),
        }
    }

    fn candidate_from(&self, doc: &Map<String, JsonValue>) -> ListingCandidate {
        let get = |key: &Option<String>| key.as_deref().and_then(|k| doc.get(k));
        let sku = doc.get(&self.fields.sku).cloned();
        let url = get(&self.fields.url)
            .and_then(scalar_to_string)
            .or_else(|| {
                let sku = sku.as_ref().and_then(scalar_to_string)?;
                self.fields
                    .url_template
                    .as_deref()
                    .map(|t| t.replace("{sku}", &sku))
            });
        ListingCandidate {
            sku,
            title: doc.get(&self.fields.title).and_then(scalar_to_string),
            price: doc.get(&self.fields.price).cloned(),
            currency: get(&self.fields.currency).and_then(scalar_to_string),
            url,
            brand: get(&self.fields.brand).and_then(first_string),
            in_stock: get(&self.fields.availability).and_then(availability),
        }
    }
}

#[async_trait]
impl Extractor for FieldMapExtractor {
    async fn extract(&self, record: &RawRecord) -> Result<Listing, ExtractionFailure> {
        let value: JsonValue = serde_json::from_str(record.payload())
            .map_err(|e| ExtractionFailure::Malformed(e.to_string()))?;
        let JsonValue::Object(doc) = value else {
            return Err(ExtractionFailure::Malformed("expected a JSON object".into()));
        };
        let candidate = self.candidate_from(&doc);
        validate_candidate(candidate, record.source(), Utc::now(), &self.default_currency)
    }
}

/// Visible text of an HTML document, skipping script and style bodies.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    parts.join(" ")
}

/// Body of the first markdown code fence in `reply`, or the trimmed reply
/// when there is none. Prose before or after the fence is dropped.
pub fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[open + 3..];
    let body = match after.strip_prefix("json") {
        Some(rest) => rest,
        None => {
            // other language tags only count when they end the opening line
            let tag_len = after
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(after.len());
            match after[tag_len..].strip_prefix('\n') {
                Some(rest) if tag_len > 0 => rest,
                _ => after,
            }
        }
    };
    let end = body.find("```").unwrap_or(body.len());
    body[..end].trim()
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[derive(Debug, Clone)]
pub struct LlmExtractorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub default_currency: String,
    pub max_input_chars: usize,
}

impl LlmExtractorConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".into(),
            default_currency: "USD".into(),
            max_input_chars: 100_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Posts a chat-completions request and returns the first choice's content.
pub(crate) async fn complete_chat(
    http: &HttpFetcher,
    base_url: &str,
    api_key: &str,
    body: &JsonValue,
) -> Result<String, String> {
    let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
    let resp = http
        .post_json("openai", &url, Some(api_key), body)
        .await
        .map_err(|e| e.to_string())?;
    let completion: ChatCompletion = resp.json().map_err(|e| e.to_string())?;
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| "completion had no content".to_string())
}

const SYSTEM_PROMPT: &str = "You extract retail product offers into JSON. Reply with one JSON object only.";

fn user_prompt(input: &str) -> String {
    format!(
        "Extract the single product offer described below; the input holds one product.\n\
         Reply with a JSON object with keys: sku (retailer item number), title, \
         price (number, no currency symbol), currency (ISO 4217 code), url, brand, \
         in_stock (boolean). Use null for anything not present.\n\n{input}"
    )
}

/// Extractor backed by an OpenAI-compatible chat-completions endpoint.
pub struct LlmExtractor {
    config: LlmExtractorConfig,
    http: Arc<HttpFetcher>,
}

impl LlmExtractor {
    pub fn new(config: LlmExtractorConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn prepare_input(&self, record: &RawRecord) -> String {
        let text = if record.is_html() {
            html_to_text(record.payload())
        } else {
            record.payload().to_string()
        };
        truncate_chars(&text, self.config.max_input_chars).to_string()
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, record: &RawRecord) -> Result<Listing, ExtractionFailure> {
        let input = self.prepare_input(record);
        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(&input)},
            ],
        });
        let content = complete_chat(
            &self.http,
            &self.config.base_url,
            &self.config.api_key,
            &body,
        )
        .await
        .map_err(ExtractionFailure::Service)?;

        debug!(
            locator = record.locator(),
            reply_len = content.len(),
            "extraction reply received"
        );
        let candidate: ListingCandidate = serde_json::from_str(strip_code_fences(&content))
            .map_err(|e| ExtractionFailure::Malformed(e.to_string()))?;
        validate_candidate(
            candidate,
            record.source(),
            Utc::now(),
            &self.config.default_currency,
        )
    }
}
