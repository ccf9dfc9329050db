//! Outbound message sending through the upstream JSON-RPC endpoint.

use std::sync::Arc;

use serde_json::json;

use crate::config::Config;
use crate::error::SendError;
use crate::store::Store;
use crate::types::{now_millis, NewMessage, Recipient};

/// Request timeout for the RPC endpoint; generous because attachment
/// uploads can be slow.
const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Sends messages on behalf of the relay's own account and records them in
/// the local store so outbound traffic shows up in conversation history.
pub struct SignalClient {
    config: Arc<Config>,
    client: reqwest::Client,
    store: Store,
}

impl SignalClient {
    pub fn new(config: Arc<Config>, store: Store) -> Self {
        // A default client would have no timeout at all; refuse to start
        // without one.
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("failed to construct send HTTP client");
        Self {
            config,
            client,
            store,
        }
    }

    /// Send a message, optionally with one base64-encoded attachment.
    ///
    /// The send succeeds or fails on the upstream's answer alone: recording
    /// the sent message locally is best-effort, and a storage failure is
    /// logged without turning a delivered message into an error.
    pub async fn send(
        &self,
        recipient: &Recipient,
        message: &str,
        attachment: Option<&str>,
    ) -> Result<serde_json::Value, SendError> {
        let mut params = json!({
            "message": message,
        });
        match recipient {
            Recipient::Direct(number) => {
                params["recipient"] = json!([number]);
            }
            Recipient::Group(group_id) => {
                params["groupId"] = json!(group_id);
            }
        }
        if let Some(data) = attachment {
            params["attachments"] = json!([data]);
        }

        let request = json!({
            "jsonrpc": "2.0",
            "method": "send",
            "params": params,
            "id": 1,
        });

        tracing::info!(recipient = recipient.id(), "sending message");
        let response = self
            .client
            .post(self.config.rpc_url())
            .json(&request)
            .send()
            .await?;
        let body: serde_json::Value = response.json().await.map_err(|_| SendError::BadResponse)?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(SendError::Rpc(message));
        }

        self.record_sent(recipient, message).await;
        Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Record an outbound message under the relay's own number. Failures are
    /// logged, never raised.
    async fn record_sent(&self, recipient: &Recipient, message: &str) {
        let (group_id, group_name, recipient_number) = match recipient {
            Recipient::Direct(number) => (None, None, Some(number.clone())),
            Recipient::Group(group_id) => {
                let name = self.group_display_name(group_id).await;
                (Some(group_id.clone()), name, None)
            }
        };

        let record = NewMessage {
            sender_number: self.config.account_number().to_string(),
            sender_name: "Me".to_string(),
            timestamp: now_millis(),
            message_body: message.to_string(),
            attachments: Vec::new(),
            raw_data: None,
            group_id,
            group_name,
            recipient_number,
        };

        if let Err(e) = self.store.insert_message(&record).await {
            tracing::error!(error = %e, "failed to record sent message");
        }
    }

    /// Look up a group's display name from conversation history, if known.
    async fn group_display_name(&self, group_id: &str) -> Option<String> {
        match self.store.conversations().await {
            Ok(conversations) => conversations
                .into_iter()
                .find(|c| c.group_id.as_deref() == Some(group_id))
                .and_then(|c| c.display_name),
            Err(e) => {
                tracing::warn!(error = %e, "failed to look up group name");
                None
            }
        }
    }
}
