//! Background delivery of committed outbox rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::signature::{NONCE_HEADER, PayloadSigner, SIGNATURE_HEADER};
use crate::store::SqliteStore;
use crate::store::webhooks;
use crate::types::WebhookDelivery;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_POLL: Duration = Duration::from_secs(60);
const BATCH_SIZE: usize = 50;
const RETRY_BASE_SECS: i64 = 30;
const MAX_BACKOFF_SECS: i64 = 3600;

pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

/// Handle used to wake the worker after a transaction with deliveries commits.
#[derive(Clone, Default)]
pub struct DeliveryQueue {
    notify: Arc<Notify>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

pub struct DeliveryWorker {
    store: Arc<SqliteStore>,
    signer: Arc<dyn PayloadSigner>,
    client: reqwest::Client,
    max_attempts: u32,
    queue: DeliveryQueue,
}

/// Delay before retry number `attempts + 1`: 30s doubling, capped at an hour.
fn backoff(attempts: i64) -> chrono::Duration {
    let exp = u32::try_from(attempts.clamp(0, 16)).unwrap_or(16);
    let secs = RETRY_BASE_SECS
        .saturating_mul(2i64.saturating_pow(exp))
        .min(MAX_BACKOFF_SECS);
    chrono::Duration::seconds(secs)
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<SqliteStore>,
        signer: Arc<dyn PayloadSigner>,
        max_attempts: u32,
        queue: DeliveryQueue,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self {
            store,
            signer,
            client,
            max_attempts,
            queue,
        })
    }

    /// Runs until `shutdown` fires. Wakes on [`DeliveryQueue::wake`], on the
    /// next pending retry, or on an idle poll.
    pub fn spawn(self, mut shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(max_attempts = self.max_attempts, "webhook delivery worker started");
            loop {
                match self.run_once().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(attempted = n, "webhook delivery pass"),
                    Err(e) => tracing::warn!("webhook delivery pass failed: {e}"),
                }

                let sleep = self.until_next_due().await;
                tokio::select! {
                    _ = self.queue.notify.notified() => {}
                    _ = tokio::time::sleep(sleep) => {}
                    _ = &mut shutdown => break,
                }
            }
            tracing::info!("webhook delivery worker stopped");
        })
    }

    async fn until_next_due(&self) -> Duration {
        let store = Arc::clone(&self.store);
        let max_attempts = self.max_attempts;
        let next = tokio::task::spawn_blocking(move || {
            webhooks::next_due_at(&store.connection(), max_attempts)
        })
        .await;
        match next {
            Ok(Ok(Some(at))) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(IDLE_POLL),
            _ => IDLE_POLL,
        }
    }

    /// Attempts every due delivery once. Returns how many were attempted.
    pub async fn run_once(&self) -> Result<usize> {
        let store = Arc::clone(&self.store);
        let max_attempts = self.max_attempts;
        let due = tokio::task::spawn_blocking(move || {
            webhooks::due_deliveries(&store.connection(), &Utc::now(), max_attempts, BATCH_SIZE)
        })
        .await
        .map_err(|e| Error::Batch(format!("delivery task failed: {e}")))??;

        let attempted = due.len();
        for delivery in due {
            let status = self.deliver(&delivery).await;
            let delivered = status.is_some_and(|s| (200..300).contains(&s));
            if delivered {
                tracing::debug!(delivery = delivery.id, url = %delivery.url, "webhook delivered");
            } else {
                tracing::warn!(
                    delivery = delivery.id,
                    url = %delivery.url,
                    status = ?status,
                    attempt = delivery.attempts + 1,
                    "webhook delivery failed"
                );
            }

            let store = Arc::clone(&self.store);
            let retry_at = Utc::now() + backoff(delivery.attempts);
            tokio::task::spawn_blocking(move || {
                webhooks::record_attempt(&store.connection(), delivery.id, status, delivered, &retry_at)
            })
            .await
            .map_err(|e| Error::Batch(format!("delivery task failed: {e}")))??;
        }
        Ok(attempted)
    }

    /// Posts one delivery. `None` means no HTTP response was received.
    async fn deliver(&self, delivery: &WebhookDelivery) -> Option<u16> {
        let signed = self.signer.sign(delivery.payload.as_bytes());
        let result = self
            .client
            .post(&delivery.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, &delivery.event)
            .header(DELIVERY_HEADER, &delivery.uuid)
            .header(NONCE_HEADER, signed.nonce)
            .header(SIGNATURE_HEADER, signed.signature)
            .body(delivery.payload.clone())
            .send()
            .await;
        match result {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) => {
                tracing::debug!(delivery = delivery.id, "webhook transport error: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::HmacSigner;
    use crate::store::webhooks::NewDelivery;
    use crate::types::{Cursor, WebhookKind};

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(0).num_seconds(), 30);
        assert_eq!(backoff(1).num_seconds(), 60);
        assert_eq!(backoff(3).num_seconds(), 240);
        assert_eq!(backoff(40).num_seconds(), MAX_BACKOFF_SECS);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_records_failed_attempt() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let store = Arc::new(store);
        {
            let conn = store.connection();
            webhooks::enqueue_delivery(
                &conn,
                &NewDelivery {
                    uuid: "0000-test",
                    kind: WebhookKind::LegacyUser,
                    subscription_id: 1,
                    event: "ticket:create",
                    url: "http://127.0.0.1:1/hook",
                    query: None,
                    payload: "{}",
                },
            )
            .unwrap();
        }

        let worker = DeliveryWorker::new(
            Arc::clone(&store),
            Arc::new(HmacSigner::new(b"test-key")),
            5,
            DeliveryQueue::new(),
        )
        .unwrap();
        assert_eq!(worker.run_once().await.unwrap(), 1);
        // The retry is scheduled in the future, so nothing is due now.
        assert_eq!(worker.run_once().await.unwrap(), 0);

        let rows = webhooks::list_deliveries(
            &store.connection(),
            WebhookKind::LegacyUser,
            1,
            &Cursor::default(),
        )
        .unwrap();
        assert_eq!(rows[0].attempts, 1);
        assert!(rows[0].delivered_at.is_none());
        assert!(rows[0].response_status.is_none());
    }
}
