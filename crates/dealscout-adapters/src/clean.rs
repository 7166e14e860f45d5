use std::sync::Arc;

use async_trait::async_trait;
use dealscout_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::json;

use crate::extract::{complete_chat, strip_code_fences, truncate_chars};
use crate::{NameCleaner, PricingError};

pub const MAX_CLEAN_NAME_CHARS: usize = 60;

const SYSTEM_PROMPT: &str =
    "You optimize retail product names for marketplace search. Reply with one JSON object only.";

fn user_prompt(title: &str) -> String {
    format!(
        "Clean this retail product name for a marketplace search.\n\
         Rules: remove retailer pack sizes (5-pack, 8-count); remove specifications \
         after commas; keep brand, core product name and one key differentiator; \
         at most {MAX_CLEAN_NAME_CHARS} characters.\n\
         Example: \"Crest Pro Health Advanced Toothpaste, 5.9 oz, 5-pack\" becomes \
         \"Crest Pro Health Advanced Toothpaste\".\n\
         Reply as {{\"name\": \"...\"}}.\n\nProduct: {title}"
    )
}

#[derive(Debug, Deserialize)]
struct CleanedName {
    name: String,
}

/// Shortens listing titles through an OpenAI-compatible chat endpoint.
pub struct LlmNameCleaner {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmNameCleaner {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl NameCleaner for LlmNameCleaner {
    async fn clean(&self, title: &str) -> Result<String, PricingError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(title)},
            ],
        });
        let content = complete_chat(&self.http, &self.base_url, &self.api_key, &body)
            .await
            .map_err(PricingError::Service)?;
        let cleaned: CleanedName = serde_json::from_str(strip_code_fences(&content))
            .map_err(|e| PricingError::Service(format!("unreadable cleaned name: {e}")))?;
        let name = truncate_chars(cleaned.name.trim(), MAX_CLEAN_NAME_CHARS).trim();
        if name.is_empty() {
            return Err(PricingError::Service("cleaned name is blank".into()));
        }
        Ok(name.to_string())
    }
}
