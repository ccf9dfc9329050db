//! Webhook delivery engine.
//!
//! Fan-out is concurrent and isolated: one subscriber's failure never blocks
//! or fails another's delivery, and `notify_all` never errors — every
//! per-subscriber outcome is captured and recorded on the subscription row.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::error::{DeliveryOutcome, FailureReason};
use crate::signing::{compute_signature, SIGNATURE_HEADER};
use crate::store::Store;
use crate::types::WebhookEvent;

/// Total time budget per delivery attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Connection-establishment budget per delivery attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 3;

/// Delay before retry number `retry` (1-based): 0s, 2s, 4s.
fn retry_delay(retry: u32) -> Duration {
    if retry <= 1 {
        Duration::ZERO
    } else {
        Duration::from_secs(1 << (retry - 1))
    }
}

#[derive(Clone)]
pub struct DeliveryEngine {
    client: reqwest::Client,
    store: Store,
}

impl DeliveryEngine {
    pub fn new(store: Store) -> Self {
        // Static configuration; the builder only fails when the TLS backend
        // cannot initialize, which is unrecoverable at this layer. A default
        // client is not an acceptable fallback: it has no timeouts.
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("failed to construct delivery HTTP client");
        Self { client, store }
    }

    /// The delivery HTTP client, shared with the challenge verifier so both
    /// paths use one connection pool.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Deliver `event` to every enabled subscription, concurrently.
    ///
    /// No-op when there are no enabled subscriptions. Returns the per-URL
    /// outcomes; callers that fire-and-forget may ignore them.
    pub async fn notify_all(&self, event: &WebhookEvent) -> Vec<(String, DeliveryOutcome)> {
        let subscriptions = match self.store.subscriptions(true).await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(error = %e, "failed to load webhook subscriptions");
                return Vec::new();
            }
        };
        if subscriptions.is_empty() {
            tracing::debug!("no active webhook subscriptions");
            return Vec::new();
        }

        // One canonical encoding for the whole fan-out; every subscriber's
        // HMAC signs these exact bytes.
        let payload = match serde_json::to_vec(event) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode webhook payload");
                return Vec::new();
            }
        };

        tracing::info!(subscribers = subscriptions.len(), "notifying webhook subscribers");

        let mut tasks = JoinSet::new();
        for sub in subscriptions {
            let engine = self.clone();
            let payload = payload.clone();
            tasks.spawn(async move {
                let outcome = engine
                    .deliver(&sub.callback_url, &sub.secret, &payload)
                    .await;
                (sub.callback_url, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(outcome) = joined {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Deliver one signed payload to one subscriber, with bounded retries.
    ///
    /// Every attempt's outcome is recorded on the subscription row. A 200
    /// stops the sequence; anything else retries up to [`MAX_RETRIES`] times
    /// with 0s/2s/4s delays and then gives up silently.
    pub async fn deliver(
        &self,
        callback_url: &str,
        secret: &str,
        payload: &[u8],
    ) -> DeliveryOutcome {
        let signature = compute_signature(secret.as_bytes(), payload);
        let mut last_failure = FailureReason::Network;

        for attempt in 1..=(1 + MAX_RETRIES) {
            if attempt > 1 {
                sleep(retry_delay(attempt - 1)).await;
            }

            match self.attempt(callback_url, &signature, payload).await {
                Ok(()) => {
                    tracing::info!(url = callback_url, attempt, "webhook delivered");
                    if let Err(e) = self.store.record_delivery_success(callback_url).await {
                        tracing::error!(url = callback_url, error = %e, "failed to record delivery success");
                    }
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(reason) => {
                    tracing::warn!(url = callback_url, attempt, reason = %reason, "webhook delivery failed");
                    if let Err(e) = self.store.record_delivery_failure(callback_url).await {
                        tracing::error!(url = callback_url, error = %e, "failed to record delivery failure");
                    }
                    last_failure = reason;
                }
            }
        }

        DeliveryOutcome::Exhausted {
            attempts: 1 + MAX_RETRIES,
            last_failure,
        }
    }

    async fn attempt(
        &self,
        callback_url: &str,
        signature: &str,
        payload: &[u8],
    ) -> Result<(), FailureReason> {
        let response = self
            .client
            .post(callback_url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(payload.to_vec())
            .send()
            .await;

        match response {
            // Exactly 200, not any 2xx: the subscriber contract requires it.
            Ok(resp) if resp.status() == StatusCode::OK => Ok(()),
            Ok(resp) => Err(FailureReason::Status(resp.status().as_u16())),
            Err(e) if e.is_timeout() => Err(FailureReason::Timeout),
            Err(_) => Err(FailureReason::Network),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_is_zero_two_four() {
        let delays: Vec<u64> = (1..=MAX_RETRIES)
            .map(|r| retry_delay(r).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 2, 4]);
    }
}
