use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dealscout_core::RawRecord;
use dealscout_storage::HttpFetcher;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{CollectError, Collector};

const JSON: &str = "application/json";

#[derive(Debug, Clone)]
pub struct SearchApiOptions {
    pub query: String,
    pub sort: Option<String>,
    pub page_size: usize,
    pub max_records: usize,
    pub headers: BTreeMap<String, String>,
}

impl Default for SearchApiOptions {
    fn default() -> Self {
        Self {
            query: "OFF".to_string(),
            sort: Some("item_page_views desc".to_string()),
            page_size: 24,
            max_records: 100,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    response: SearchDocs,
}

#[derive(Debug, Deserialize)]
struct SearchDocs {
    #[serde(default)]
    docs: Vec<JsonValue>,
    #[serde(default, rename = "numFound")]
    num_found: Option<u64>,
}

/// Pages through a `start`/`rows` JSON search endpoint, one record per document.
pub struct SearchApiCollector {
    source_id: String,
    url: String,
    api_key: Option<String>,
    options: SearchApiOptions,
    http: Arc<HttpFetcher>,
}

impl SearchApiCollector {
    pub fn new(
        source_id: &str,
        url: impl Into<String>,
        api_key: Option<String>,
        options: SearchApiOptions,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            url: url.into(),
            api_key,
            options,
            http,
        }
    }
}

#[async_trait]
impl Collector for SearchApiCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn collect(&self) -> Result<Vec<RawRecord>, CollectError> {
        let page_size = self.options.page_size.max(1);
        let max_records = self.options.max_records;
        let mut headers: Vec<(&str, String)> = self
            .options
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        headers.push(("Accept", JSON.to_string()));
        if let Some(key) = &self.api_key {
            headers.push(("x-api-key", key.clone()));
        }

        let mut records = Vec::new();
        let mut start = 0usize;
        while start < max_records {
            let rows = page_size.min(max_records - start);
            let mut query = vec![
                ("q", self.options.query.clone()),
                ("start", start.to_string()),
                ("rows", rows.to_string()),
            ];
            if let Some(sort) = &self.options.sort {
                query.push(("sort", sort.clone()));
            }

            let page: SearchEnvelope = self
                .http
                .get_json(&self.source_id, &self.url, &query, &headers)
                .await
                .map_err(|err| CollectError::unavailable(&self.source_id, err))?;

            let collected_at = Utc::now();
            let fetched = page.response.docs.len();
            debug!(
                source_id = %self.source_id,
                start,
                fetched,
                num_found = ?page.response.num_found,
                "fetched search page"
            );
            for (idx, doc) in page.response.docs.into_iter().enumerate() {
                records.push(RawRecord::new(
                    self.source_id.as_str(),
                    format!("{}?start={}#{}", self.url, start, idx),
                    JSON,
                    doc.to_string(),
                    collected_at,
                ));
            }

            if fetched < rows {
                break;
            }
            start += rows;
        }

        info!(source_id = %self.source_id, records = records.len(), "collected search results");
        Ok(records)
    }
}

/// Reads documents from a file on disk.
///
/// JSON files may hold a bare array or a search-API envelope. An `.html`
/// file becomes one record per element matching the item selector, or a
/// single record when no selector is set.
pub struct FixtureCollector {
    source_id: String,
    path: PathBuf,
    item_selector: Option<Selector>,
}

impl FixtureCollector {
    pub fn new(source_id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.to_string(),
            path: path.into(),
            item_selector: None,
        }
    }

    /// Splits HTML pages into one record per element matching `css`.
    pub fn with_item_selector(mut self, css: &str) -> anyhow::Result<Self> {
        let selector = Selector::parse(css)
            .map_err(|err| anyhow::anyhow!("invalid item selector `{css}`: {err}"))?;
        self.item_selector = Some(selector);
        Ok(self)
    }
}

/// Outer HTML of every element matching `selector`, in document order.
fn split_items(html: &str, selector: &Selector) -> Vec<String> {
    Html::parse_document(html)
        .select(selector)
        .map(|item| item.html())
        .collect()
}

#[async_trait]
impl Collector for FixtureCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn collect(&self) -> Result<Vec<RawRecord>, CollectError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            CollectError::unavailable(&self.source_id, format!("{}: {err}", self.path.display()))
        })?;
        let collected_at = Utc::now();
        let locator = self.path.display().to_string();

        let is_html = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"));
        if is_html {
            let Some(selector) = &self.item_selector else {
                return Ok(vec![RawRecord::new(
                    self.source_id.as_str(),
                    locator,
                    "text/html",
                    text,
                    collected_at,
                )]);
            };
            let items = split_items(&text, selector);
            debug!(source_id = %self.source_id, items = items.len(), "split html page");
            return Ok(items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| {
                    RawRecord::new(
                        self.source_id.as_str(),
                        format!("{locator}#{idx}"),
                        "text/html",
                        item,
                        collected_at,
                    )
                })
                .collect());
        }

        let value: JsonValue = serde_json::from_str(&text).map_err(|err| {
            CollectError::unavailable(&self.source_id, format!("{locator}: {err}"))
        })?;
        let docs = match value {
            JsonValue::Array(docs) => docs,
            other => serde_json::from_value::<SearchEnvelope>(other)
                .map(|env| env.response.docs)
                .map_err(|err| CollectError::unavailable(&self.source_id, format!("{locator}: {err}")))?,
        };

        Ok(docs
            .into_iter()
            .enumerate()
            .map(|(idx, doc)| {
                RawRecord::new(
                    self.source_id.as_str(),
                    format!("{locator}#{idx}"),
                    JSON,
                    doc.to_string(),
                    collected_at,
                )
            })
            .collect())
    }
}
