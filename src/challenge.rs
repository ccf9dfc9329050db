//! One-shot challenge verification of a candidate callback URL.
//!
//! Run during subscription creation, before anything is persisted: the
//! endpoint must prove it is live and actually parses payloads by echoing a
//! server-issued random token.

use std::time::Duration;

use crate::error::ChallengeError;
use crate::signing::generate_token;
use crate::types::WebhookEvent;

const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(5);

/// POST a `{event: "challenge", challenge: <token>}` body to `callback_url`
/// and require an HTTP 200 whose JSON `challenge` field equals the token.
///
/// Any deviation — non-200, unparseable body, wrong token, timeout,
/// transport error — fails verification.
pub async fn verify_endpoint(
    client: &reqwest::Client,
    callback_url: &str,
) -> Result<(), ChallengeError> {
    let token = generate_token();
    let event = WebhookEvent::Challenge {
        challenge: token.clone(),
    };

    let response = client
        .post(callback_url)
        .timeout(CHALLENGE_TIMEOUT)
        .json(&event)
        .send()
        .await
        .map_err(ChallengeError::Transport)?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(ChallengeError::Status(status.as_u16()));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|_| ChallengeError::BadBody)?;
    if body.get("challenge").and_then(|v| v.as_str()) == Some(token.as_str()) {
        Ok(())
    } else {
        Err(ChallengeError::Mismatch)
    }
}
