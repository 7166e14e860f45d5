use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealscout_adapters::DeliveryService;
use dealscout_core::{AlertRecord, Digest, ScoredListing};
use dealscout_storage::AlertStore;
use serde::Serialize;
use tracing::{error, info, warn};

/// What happened to one run's digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryResult {
    /// Nothing qualified, so nothing was sent.
    Empty,
    Delivered { recorded: usize },
    /// Only the confirmed entries were recorded.
    Partial {
        recorded: usize,
        unconfirmed: Vec<String>,
    },
    /// Nothing confirmed; no alert records were written.
    Failed { reason: String },
    /// Delivery confirmed but the alert write failed. These entries may be
    /// sent again next run.
    Unrecorded {
        confirmed: Vec<String>,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub digest: Digest,
    pub result: DeliveryResult,
}

/// Batches accepted listings into a digest, sends it, and records what the
/// delivery service confirmed.
pub struct Notifier {
    delivery: Arc<dyn DeliveryService>,
    store: Arc<dyn AlertStore>,
}

impl Notifier {
    pub fn new(delivery: Arc<dyn DeliveryService>, store: Arc<dyn AlertStore>) -> Self {
        Self { delivery, store }
    }

    pub async fn notify(&self, accepted: Vec<ScoredListing>, now: DateTime<Utc>) -> Notification {
        let digest = Digest::assemble(accepted, now);
        if digest.is_empty() {
            info!("no qualifying listings; digest not sent");
            return Notification {
                digest,
                result: DeliveryResult::Empty,
            };
        }

        let receipt = match self.delivery.deliver(&digest).await {
            Ok(receipt) => receipt,
            Err(err) => {
                error!(error = %err, entries = digest.len(), "digest delivery failed");
                return Notification {
                    result: DeliveryResult::Failed {
                        reason: err.to_string(),
                    },
                    digest,
                };
            }
        };

        let in_digest: BTreeSet<&str> = digest.source_ids().collect();
        let confirmed: Vec<String> = receipt
            .confirmed_by_all()
            .into_iter()
            .filter(|id| in_digest.contains(id.as_str()))
            .collect();

        if confirmed.is_empty() {
            let reason = receipt
                .failures()
                .filter_map(|r| r.error.as_deref().map(|e| format!("{}: {e}", r.recipient)))
                .collect::<Vec<_>>()
                .join("; ");
            let reason = if reason.is_empty() {
                "delivery service confirmed no entries".to_string()
            } else {
                reason
            };
            error!(entries = digest.len(), reason = %reason, "digest delivery failed");
            return Notification {
                digest,
                result: DeliveryResult::Failed { reason },
            };
        }

        let records: Vec<AlertRecord> = confirmed
            .iter()
            .map(|id| AlertRecord::new(id.clone(), now))
            .collect();
        if let Err(err) = self.store.put_many(&records).await {
            error!(error = %err, confirmed = confirmed.len(), "delivered digest but failed to record alerts");
            return Notification {
                digest,
                result: DeliveryResult::Unrecorded {
                    confirmed,
                    reason: err.to_string(),
                },
            };
        }

        let unconfirmed: Vec<String> = digest
            .source_ids()
            .filter(|id| !confirmed.iter().any(|c| c == id))
            .map(str::to_string)
            .collect();
        let result = if unconfirmed.is_empty() {
            info!(recorded = records.len(), "digest delivered");
            DeliveryResult::Delivered {
                recorded: records.len(),
            }
        } else {
            warn!(
                recorded = records.len(),
                unconfirmed = unconfirmed.len(),
                "digest partially delivered"
            );
            DeliveryResult::Partial {
                recorded: records.len(),
                unconfirmed,
            }
        };
        Notification { digest, result }
    }
}
