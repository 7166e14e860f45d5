//! Builds concrete collaborators from [`PipelineConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dealscout_adapters::{
    collector_for_source, Collector, DeliveryService, Extractor, FieldMap, FieldMapExtractor,
    KeepaPricing, LlmExtractor, LlmExtractorConfig, LlmNameCleaner, MarkdownFileDelivery,
    PricingService, SendGridDelivery, StaticPricing,
};
use dealscout_pipeline::{
    Collaborators, DeliveryKind, ExtractorKind, Pipeline, PipelineConfig, PricingKind,
    SourceRegistry,
};
use dealscout_storage::{
    AlertStore, HttpClientConfig, HttpFetcher, JsonFileAlertStore, PgAlertStore,
    TokenBucketConfig,
};
use tracing::info;

const KEEPA_REQUEST_INTERVAL: Duration = Duration::from_millis(1100);

fn http_config(config: &PipelineConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        per_service_concurrency: config.max_concurrency,
        ..Default::default()
    }
}

pub async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn AlertStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgAlertStore::connect(url, 5)
                .await
                .context("connecting to alert database")?;
            store.migrate().await.context("running alert migrations")?;
            info!("using postgres alert store");
            Ok(Arc::new(store))
        }
        None => {
            info!(path = %config.alerts_path.display(), "using json alert store");
            Ok(Arc::new(JsonFileAlertStore::new(config.alerts_path.clone())))
        }
    }
}

async fn collectors(config: &PipelineConfig, http: &Arc<HttpFetcher>) -> Result<Vec<Box<dyn Collector>>> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let collectors = registry
        .enabled()
        .map(|source| collector_for_source(source, http.clone(), &config.workspace_root))
        .collect::<Result<Vec<_>>>()?;
    if collectors.is_empty() {
        anyhow::bail!("no enabled sources in {}", config.sources_path.display());
    }
    Ok(collectors)
}

fn extractor(config: &PipelineConfig, http: &Arc<HttpFetcher>) -> Result<Arc<dyn Extractor>> {
    Ok(match config.extractor {
        ExtractorKind::Fields => Arc::new(FieldMapExtractor::new(
            FieldMap::default(),
            config.default_currency.clone(),
        )),
        ExtractorKind::Llm => {
            let llm = config
                .llm
                .as_ref()
                .context("llm extractor selected without llm settings")?;
            Arc::new(LlmExtractor::new(
                LlmExtractorConfig {
                    base_url: llm.base_url.clone(),
                    model: llm.model.clone(),
                    default_currency: config.default_currency.clone(),
                    ..LlmExtractorConfig::new(llm.api_key.clone())
                },
                http.clone(),
            ))
        }
    })
}

async fn pricing(config: &PipelineConfig, http: &Arc<HttpFetcher>) -> Result<Arc<dyn PricingService>> {
    Ok(match config.pricing {
        PricingKind::Keepa => {
            let key = config
                .keepa_api_key
                .clone()
                .context("keepa pricing selected without KEEPA_API_KEY")?;
            let keepa_http = HttpFetcher::new(HttpClientConfig {
                per_service_concurrency: 1,
                token_bucket: Some(TokenBucketConfig::one_per(KEEPA_REQUEST_INTERVAL)),
                ..http_config(config)
            })?;
            let keepa = KeepaPricing::new(Arc::new(keepa_http), config.keepa_base_url.clone(), key);
            if !config.clean_names {
                Arc::new(keepa)
            } else {
                let llm = config
                    .llm
                    .as_ref()
                    .context("name cleaning enabled without llm settings")?;
                info!(model = %llm.model, "cleaning listing names before keepa search");
                Arc::new(keepa.with_name_cleaner(Arc::new(LlmNameCleaner::new(
                    http.clone(),
                    llm.base_url.clone(),
                    llm.api_key.clone(),
                    llm.model.clone(),
                ))))
            }
        }
        PricingKind::Static => Arc::new(
            StaticPricing::from_json_file(&config.static_prices_path).await?,
        ),
    })
}

fn delivery(config: &PipelineConfig, http: &Arc<HttpFetcher>) -> Result<Arc<dyn DeliveryService>> {
    Ok(match config.delivery {
        DeliveryKind::SendGrid => {
            let sg = config
                .sendgrid
                .as_ref()
                .context("sendgrid delivery selected without sendgrid settings")?;
            Arc::new(SendGridDelivery::new(
                http.clone(),
                sg.base_url.clone(),
                sg.api_key.clone(),
                sg.from.clone(),
                sg.to.clone(),
            ))
        }
        DeliveryKind::Outbox => Arc::new(MarkdownFileDelivery::new(config.outbox_dir.clone())),
    })
}

pub async fn build_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    let http = Arc::new(HttpFetcher::new(http_config(&config))?);
    let parts = Collaborators {
        collectors: collectors(&config, &http).await?,
        extractor: extractor(&config, &http)?,
        pricing: pricing(&config, &http).await?,
        delivery: delivery(&config, &http)?,
        store: open_store(&config).await?,
    };
    Ok(Pipeline::new(config, parts))
}
