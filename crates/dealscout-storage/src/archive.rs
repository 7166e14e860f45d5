//! Immutable, content-addressed archive of collected raw payloads.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dealscout_core::RawRecord;
use tokio::fs;

use crate::write_atomic;

#[derive(Debug, Clone)]
pub struct ArchivedRecord {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn extension_for(content_type: &str) -> &'static str {
        let mime = content_type.split(';').next().unwrap_or_default().trim();
        match mime {
            "text/html" => "html",
            "application/json" => "json",
            "text/plain" => "txt",
            _ => "bin",
        }
    }

    pub fn relative_path(
        &self,
        collected_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = collected_at.format("%Y%m%d").to_string();
        PathBuf::from(stamp)
            .join(source)
            .join(format!("{content_hash}.{extension}"))
    }

    /// Writes a record under its content-hash path unless that path already
    /// holds it. Identical payloads collected twice share one file.
    pub async fn store(&self, record: &RawRecord) -> anyhow::Result<ArchivedRecord> {
        let relative_path = self.relative_path(
            record.collected_at(),
            record.source(),
            record.content_hash(),
            Self::extension_for(record.content_type()),
        );
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, record.payload().as_bytes())
                .await
                .with_context(|| format!("archiving {}", record.locator()))?;
        }

        Ok(ArchivedRecord {
            content_hash: record.content_hash().to_string(),
            relative_path,
            absolute_path,
            byte_size: record.payload().len(),
            deduplicated,
        })
    }
}
