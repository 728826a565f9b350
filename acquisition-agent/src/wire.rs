//! Newline-delimited JSON over TCP
//!
//! The work queue is a listener that accepts any number of coordinator
//! connections and funnels every line into one channel. Replies go out on a
//! fresh connection per message, best-effort and never retried.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Upper bound for connecting to and writing a reply endpoint
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Send one JSON message to `host:port` as a single line
pub async fn send_json<T: Serialize>(host: &str, port: u16, message: &T) -> Result<()> {
    let mut payload = serde_json::to_vec(message).context("Failed to serialize reply")?;
    payload.push(b'\n');

    let mut stream = timeout(REPLY_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("Connecting to {}:{} timed out", host, port))?
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

    timeout(REPLY_TIMEOUT, stream.write_all(&payload))
        .await
        .with_context(|| format!("Writing to {}:{} timed out", host, port))?
        .with_context(|| format!("Failed to write to {}:{}", host, port))?;

    if let Err(e) = stream.shutdown().await {
        debug!("Reply stream shutdown error for {}:{}: {}", host, port, e);
    }

    Ok(())
}

/// Accept connections on `listener` and forward each non-empty line to `tx`.
///
/// The task ends once the receiving side is dropped.
pub fn spawn_line_listener(listener: TcpListener, tx: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Work queue accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if tx.is_closed() {
                break;
            }

            debug!("Work queue connection from {}", peer);
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            if tx.send(line.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Work queue read error from {}: {}", peer, e);
                            break;
                        }
                    }
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lines_reach_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        spawn_line_listener(listener, tx);

        send_json("127.0.0.1", addr.port(), &json!({"order": "update"}))
            .await
            .unwrap();

        let line = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(line, r#"{"order":"update"}"#);
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(send_json("127.0.0.1", port, &json!({})).await.is_err());
    }
}
