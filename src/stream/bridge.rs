//! Bridged transport: HTTP streaming endpoint
//!
//! `GET <url>?user_id=<owner>` returns a long-lived body of newline-delimited
//! envelopes. The body is read chunk by chunk and split on `\n`; partial lines
//! are carried over to the next chunk. When the stream ends or errors the
//! connection is re-established with capped exponential backoff until the
//! subscription is closed.

use super::backoff::ReconnectBackoff;
use super::envelope::decode_line;
use super::StreamError;
use crate::types::PipelineEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome of one connection
enum Session {
    /// Stream ended or failed; reconnect
    Disconnected,
    /// Sink closed or subscription stopped; exit
    Stopped,
}

/// Forward bridged envelopes for `owner_id` into `sink` until stopped
///
/// Arguments:
/// - `client`: shared HTTP client
/// - `url`: bridged endpoint (without the owner parameter)
/// - `owner_id`: owner filter; cross-owner messages are dropped
/// - `sink`: canonical event channel
/// - `gate`: cleared by `unsubscribe`; nothing is sent once it is false
pub async fn run_bridge(
    client: reqwest::Client,
    url: String,
    owner_id: String,
    sink: mpsc::Sender<PipelineEvent>,
    gate: Arc<AtomicBool>,
) {
    log::info!("🌉 Bridged stream starting");
    log::info!("   ├─ Endpoint: {}", url);
    log::info!("   └─ Owner: {}", owner_id);

    let mut backoff = ReconnectBackoff::default();

    while gate.load(Ordering::SeqCst) && !sink.is_closed() {
        match stream_once(&client, &url, &owner_id, &sink, &gate, &mut backoff).await {
            Ok(Session::Stopped) => break,
            Ok(Session::Disconnected) => {
                log::warn!("⚠️  Bridged stream ended, reconnecting");
            }
            Err(e) => {
                log::warn!("⚠️  Bridged stream error (subscription kept): {}", e);
            }
        }

        if !gate.load(Ordering::SeqCst) {
            break;
        }
        backoff.sleep().await;
    }

    log::info!("✅ Bridged stream stopped");
}

async fn stream_once(
    client: &reqwest::Client,
    url: &str,
    owner_id: &str,
    sink: &mpsc::Sender<PipelineEvent>,
    gate: &AtomicBool,
    backoff: &mut ReconnectBackoff,
) -> Result<Session, StreamError> {
    let mut response = client
        .get(url)
        .query(&[("user_id", owner_id)])
        .header("Accept", "text/event-stream, application/x-ndjson")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(StreamError::Status(status.as_u16()));
    }

    log::info!("🔗 Bridged stream connected ({})", status);
    backoff.reset();

    let mut lines = LineBuffer::default();
    while let Some(chunk) = response.chunk().await? {
        for line in lines.push(&chunk) {
            if forward_line(&line, owner_id, sink, gate).await.is_err() {
                return Ok(Session::Stopped);
            }
        }
    }

    if let Some(line) = lines.finish() {
        if forward_line(&line, owner_id, sink, gate).await.is_err() {
            return Ok(Session::Stopped);
        }
    }

    Ok(Session::Disconnected)
}

/// Raw body bytes split on `\n`. A line is only decoded once its newline has
/// arrived, so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk; returns the lines it completed
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Trailing line without a newline, if any
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.bytes);
        let line = String::from_utf8_lossy(&rest).into_owned();
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// Decode and forward one line. `Err` means delivery must stop.
pub(crate) async fn forward_line(
    line: &str,
    owner_id: &str,
    sink: &mpsc::Sender<PipelineEvent>,
    gate: &AtomicBool,
) -> Result<(), ()> {
    let event = match decode_line(line).and_then(|env| match env {
        Some(env) => env.into_event(),
        None => Ok(None),
    }) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(()),
        Err(e) => {
            log::debug!("Dropping bridged message: {}", e);
            return Ok(());
        }
    };

    if event.owner_id() != owner_id {
        log::debug!("Dropping cross-owner message for {}", event.owner_id());
        return Ok(());
    }

    if !gate.load(Ordering::SeqCst) {
        return Err(());
    }
    sink.send(event).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"data: {"type":"transaction","payload":{"id":"t1","user_id":"u1","amount":10,"category":"dining","transaction_date":"2024-01-01"}}"#;
    const OTHER_OWNER: &str = r#"data: {"type":"transaction","payload":{"id":"t2","user_id":"u2","amount":10,"category":"dining","transaction_date":"2024-01-01"}}"#;

    #[tokio::test]
    async fn test_forward_drops_malformed_and_cross_owner() {
        let (tx, mut rx) = mpsc::channel(8);
        let gate = AtomicBool::new(true);

        assert!(forward_line("data: {broken", "u1", &tx, &gate).await.is_ok());
        assert!(forward_line(OTHER_OWNER, "u1", &tx, &gate).await.is_ok());
        assert!(forward_line(VALID, "u1", &tx, &gate).await.is_ok());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.owner_id(), "u1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_character_split_across_chunks_is_kept() {
        let line = "data: {\"merchant\":\"Café ₹\"}\n";
        let split = line.find('₹').unwrap() + 1;
        let (head, tail) = line.as_bytes().split_at(split);

        let mut lines = LineBuffer::default();
        assert!(lines.push(head).is_empty());
        assert_eq!(lines.push(tail), vec![line.to_string()]);
        assert!(lines.finish().is_none());
    }

    #[test]
    fn test_trailing_line_without_newline() {
        let mut lines = LineBuffer::default();
        assert_eq!(lines.push(b"first\nsec"), vec!["first\n".to_string()]);
        assert!(lines.push(b"ond").is_empty());
        assert_eq!(lines.finish().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_closed_gate_stops_delivery() {
        let (tx, mut rx) = mpsc::channel(8);
        let gate = AtomicBool::new(false);

        assert!(forward_line(VALID, "u1", &tx, &gate).await.is_err());
        assert!(rx.try_recv().is_err());
    }
}
