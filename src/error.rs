use std::fmt;

/// Errors raised by the SQLite-backed stores.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    Io(std::io::Error),

    /// A subscription for this callback URL already exists.
    AlreadyExists(String),

    /// No row matched the given key.
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::AlreadyExists(url) => write!(f, "subscription already exists: {url}"),
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Why a challenge verification of a candidate callback URL failed.
#[derive(Debug)]
pub enum ChallengeError {
    /// Request could not be sent or timed out.
    Transport(reqwest::Error),

    /// Endpoint answered with a non-200 status.
    Status(u16),

    /// Response body was not parseable JSON.
    BadBody,

    /// Response did not echo the token we sent.
    Mismatch,
}

impl fmt::Display for ChallengeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeError::Transport(e) => write!(f, "challenge request failed: {e}"),
            ChallengeError::Status(code) => write!(f, "challenge returned status {code}"),
            ChallengeError::BadBody => write!(f, "challenge response was not valid JSON"),
            ChallengeError::Mismatch => write!(f, "challenge token was not echoed back"),
        }
    }
}

impl std::error::Error for ChallengeError {}

/// Errors surfaced synchronously to the subscribe/unsubscribe caller.
///
/// These are policy rejections: they are never retried by the relay.
#[derive(Debug)]
pub enum SubscribeError {
    /// Callback URL could not be parsed.
    InvalidUrl(String),

    /// Callback host is not on the configured allow-list.
    /// Rejected before any network call is made to the URL.
    UrlNotAllowed(String),

    /// Endpoint failed challenge verification.
    ChallengeFailed(ChallengeError),

    /// A subscription for this callback URL already exists.
    Duplicate(String),

    /// No subscription exists for this callback URL.
    NotFound(String),

    Store(StoreError),
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeError::InvalidUrl(url) => write!(f, "invalid callback URL: {url}"),
            SubscribeError::UrlNotAllowed(url) => {
                write!(f, "callback URL host is not allow-listed: {url}")
            }
            SubscribeError::ChallengeFailed(e) => write!(f, "webhook challenge failed: {e}"),
            SubscribeError::Duplicate(url) => write!(f, "subscription already exists for {url}"),
            SubscribeError::NotFound(url) => write!(f, "no subscription found for {url}"),
            SubscribeError::Store(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for SubscribeError {}

impl From<StoreError> for SubscribeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists(url) => SubscribeError::Duplicate(url),
            StoreError::NotFound(url) => SubscribeError::NotFound(url),
            other => SubscribeError::Store(other),
        }
    }
}

/// Errors from the outbound send collaborator.
#[derive(Debug)]
pub enum SendError {
    Http(reqwest::Error),

    /// The upstream answered with a JSON-RPC error object.
    Rpc(String),

    /// The upstream response was not a JSON-RPC response.
    BadResponse,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Http(e) => write!(f, "send request failed: {e}"),
            SendError::Rpc(msg) => write!(f, "signal API error: {msg}"),
            SendError::BadResponse => write!(f, "malformed response from signal API"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        SendError::Http(e)
    }
}

/// Reasons why a single HTTP delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Network,

    /// Endpoint answered with a status other than 200.
    Status(u16),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "request timed out"),
            FailureReason::Network => write!(f, "network error"),
            FailureReason::Status(code) => write!(f, "endpoint returned status {code}"),
        }
    }
}

/// Final outcome of delivering one payload to one subscriber.
///
/// Outcomes are captured, never propagated: a fan-out records them on the
/// subscription rows and otherwise discards them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        /// Total attempts made, including the successful one.
        attempts: u32,
    },
    Exhausted {
        /// Total attempts made before giving up.
        attempts: u32,
        last_failure: FailureReason,
    },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}
