use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dealscout_core::Digest;
use dealscout_storage::HttpFetcher;
use serde_json::json;
use tracing::{info, warn};

use crate::{DeliveryError, DeliveryReceipt, DeliveryService, RecipientReceipt};

/// SendGrid v3 mail client. One request per recipient so a bounce only
/// affects that recipient's confirmation.
pub struct SendGridDelivery {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
    from: String,
    recipients: Vec<String>,
}

impl SendGridDelivery {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.sendgrid.com";

    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            recipients,
        }
    }
}

#[async_trait]
impl DeliveryService for SendGridDelivery {
    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, DeliveryError> {
        if self.recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }
        let url = format!("{}/v3/mail/send", self.base_url.trim_end_matches('/'));
        let subject = digest.subject();
        let body = digest.render_text();

        let mut receipt = DeliveryReceipt::default();
        for recipient in &self.recipients {
            let payload = json!({
                "personalizations": [{"to": [{"email": recipient}]}],
                "from": {"email": self.from},
                "subject": subject,
                "content": [{"type": "text/plain", "value": body}],
            });
            match self
                .http
                .post_json("sendgrid", &url, Some(&self.api_key), &payload)
                .await
            {
                Ok(_) => {
                    info!(recipient = %recipient, entries = digest.len(), "digest sent");
                    receipt
                        .recipients
                        .push(RecipientReceipt::confirmed(recipient.as_str(), digest));
                }
                Err(err) => {
                    warn!(recipient = %recipient, error = %err, "digest delivery failed");
                    receipt
                        .recipients
                        .push(RecipientReceipt::failed(recipient.as_str(), err));
                }
            }
        }
        Ok(receipt)
    }
}

/// Writes each digest as a markdown file into an outbox directory.
#[derive(Debug, Clone)]
pub struct MarkdownFileDelivery {
    outbox_dir: PathBuf,
}

impl MarkdownFileDelivery {
    pub fn new(outbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
        }
    }

    fn file_name(digest: &Digest) -> String {
        format!("digest-{}.md", digest.generated_at.format("%Y%m%dT%H%M%SZ"))
    }
}

#[async_trait]
impl DeliveryService for MarkdownFileDelivery {
    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, DeliveryError> {
        let transport = |e: std::io::Error| DeliveryError::Transport(e.to_string());
        tokio::fs::create_dir_all(&self.outbox_dir)
            .await
            .map_err(transport)?;
        let path = self.outbox_dir.join(Self::file_name(digest));
        tokio::fs::write(&path, digest.render_markdown())
            .await
            .map_err(transport)?;
        info!(path = %path.display(), entries = digest.len(), "digest written to outbox");

        Ok(DeliveryReceipt {
            recipients: vec![RecipientReceipt::confirmed(path.display().to_string(), digest)],
        })
    }
}
