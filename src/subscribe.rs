//! Subscription lifecycle: allow-list gate, challenge, persistence.

use std::sync::Arc;

use crate::challenge::verify_endpoint;
use crate::config::Config;
use crate::delivery::DeliveryEngine;
use crate::error::{DeliveryOutcome, SubscribeError};
use crate::signing::generate_token;
use crate::store::Store;
use crate::types::{now_millis, SubscriptionId, WebhookEvent};

/// Returned to a successful subscriber.
///
/// The only place the secret is ever handed out; listing operations
/// withhold it.
#[derive(Debug, Clone)]
pub struct SubscriptionReceipt {
    pub id: SubscriptionId,
    pub callback_url: String,
    pub secret: String,
}

pub struct SubscriptionService {
    config: Arc<Config>,
    store: Store,
    engine: DeliveryEngine,
}

impl SubscriptionService {
    pub fn new(config: Arc<Config>, store: Store, engine: DeliveryEngine) -> Self {
        Self {
            config,
            store,
            engine,
        }
    }

    /// Subscribe a callback URL, in strict order:
    ///
    /// 1. the URL's host must be on the configured allow-list — checked
    ///    before any network call is made to the URL;
    /// 2. a secret is generated server-side when the caller supplies none;
    /// 3. the endpoint must pass challenge verification;
    /// 4. the subscription row is inserted (duplicate URL rejected).
    ///
    /// Nothing is persisted unless every step succeeds.
    pub async fn subscribe(
        &self,
        callback_url: &str,
        secret: Option<String>,
    ) -> Result<SubscriptionReceipt, SubscribeError> {
        match self.config.allow_list().permits_url(callback_url) {
            Some(true) => {}
            Some(false) => {
                tracing::warn!(url = callback_url, "subscribe rejected: host not allow-listed");
                return Err(SubscribeError::UrlNotAllowed(callback_url.to_string()));
            }
            None => return Err(SubscribeError::InvalidUrl(callback_url.to_string())),
        }

        let secret = secret.unwrap_or_else(generate_token);

        tracing::info!(url = callback_url, "sending webhook challenge");
        verify_endpoint(self.engine.client(), callback_url)
            .await
            .map_err(SubscribeError::ChallengeFailed)?;

        let id = self.store.add_subscription(callback_url, &secret).await?;
        tracing::info!(url = callback_url, "webhook subscription created");

        Ok(SubscriptionReceipt {
            id,
            callback_url: callback_url.to_string(),
            secret,
        })
    }

    /// Remove a subscription by callback URL.
    pub async fn unsubscribe(&self, callback_url: &str) -> Result<(), SubscribeError> {
        self.store.remove_subscription(callback_url).await?;
        tracing::info!(url = callback_url, "webhook unsubscribed");
        Ok(())
    }

    /// Send a `test` event through the normal signed-delivery path without
    /// creating a subscription. Delivery outcomes are returned, not raised.
    pub async fn send_test(
        &self,
        callback_url: &str,
        secret: Option<String>,
    ) -> Result<DeliveryOutcome, SubscribeError> {
        let secret = secret.unwrap_or_else(|| "test_secret".to_string());
        let event = WebhookEvent::Test {
            message: "This is a test webhook from signal-relay".to_string(),
            timestamp: now_millis(),
        };
        let payload = serde_json::to_vec(&event)
            .map_err(|e| SubscribeError::Store(crate::error::StoreError::Serde(e)))?;
        Ok(self.engine.deliver(callback_url, &secret, &payload).await)
    }
}
