//! Long-lived SSE listener against the upstream events endpoint.
//!
//! The listener holds exactly one upstream connection at a time, reconnects
//! after a fixed delay whenever the stream ends or errors, and stops cleanly
//! when asked — shutdown interrupts both an in-flight stream and the
//! reconnect wait.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config::Config;
use crate::delivery::DeliveryEngine;
use crate::ingest;
use crate::store::Store;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Cap on a single buffered event line; anything longer is discarded up to
/// the next newline so a misbehaving upstream cannot exhaust memory.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Handle to the background ingestion task.
pub struct Listener {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Spawn the ingestion loop on the current runtime.
    pub fn spawn(config: Arc<Config>, store: Store, engine: DeliveryEngine) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run(config, store, engine, rx));
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Request shutdown and wait for the loop to exit.
    ///
    /// Idempotent; completes promptly even mid-stream or mid-backoff.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "listener task panicked");
            }
        }
    }
}

async fn run(
    config: Arc<Config>,
    store: Store,
    engine: DeliveryEngine,
    mut shutdown: watch::Receiver<bool>,
) {
    // A dedicated client without a request timeout: the event stream is
    // expected to stay open indefinitely.
    let client = reqwest::Client::new();
    let events_url = config.events_url();

    loop {
        if *shutdown.borrow() {
            break;
        }

        tracing::info!(url = %events_url, "connecting to event stream");
        let connect = client
            .get(&events_url)
            .header("Accept", "text/event-stream")
            .send();

        let response = tokio::select! {
            _ = shutdown.changed() => break,
            resp = connect => resp,
        };

        match response {
            Ok(resp) if resp.status().is_success() => {
                consume_stream(resp, &store, &engine, &mut shutdown).await;
                if *shutdown.borrow() {
                    break;
                }
                tracing::warn!("event stream closed; reconnecting");
            }
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "event stream request rejected");
            }
            Err(e) => {
                tracing::error!(error = %e, "event stream connection failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }

    tracing::info!("event listener stopped");
}

/// Read SSE frames off an open response until the stream ends, errors, or
/// shutdown is signalled. Each `data:` line is decoded as JSON and handed to
/// ingestion; undecodable lines are logged and skipped.
///
/// The buffer holds raw bytes and only complete lines are interpreted, so a
/// multi-byte character split across two network chunks survives intact.
async fn consume_stream(
    response: reqwest::Response,
    store: &Store,
    engine: &DeliveryEngine,
    shutdown: &mut watch::Receiver<bool>,
) {
    tracing::info!("event stream connected");
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut discarding = false;

    loop {
        let chunk = tokio::select! {
            _ = shutdown.changed() => return,
            chunk = stream.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::error!(error = %e, "event stream read error");
                return;
            }
            None => return,
        };

        buffer.extend_from_slice(&bytes);

        // Complete lines only; a partial line stays buffered for the next
        // chunk.
        let mut consumed = 0;
        while let Some(pos) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let line = &buffer[consumed..consumed + pos];
            consumed += pos + 1;

            if discarding {
                discarding = false;
                continue;
            }
            handle_line(line, store, engine).await;
        }
        buffer.drain(..consumed);

        if buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = buffer.len(),
                "oversized event line; discarding until next newline"
            );
            buffer.clear();
            discarding = true;
        }
    }
}

async fn handle_line(line: &[u8], store: &Store, engine: &DeliveryEngine) {
    let Some(data) = line.strip_prefix(b"data:") else {
        return;
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return;
    }

    // serde_json tolerates the surrounding whitespace, including a trailing
    // carriage return.
    match serde_json::from_slice::<serde_json::Value>(data) {
        Ok(value) => ingest::process_event(store, engine, value).await,
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable event frame");
        }
    }
}
