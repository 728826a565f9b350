//! Centralized log sink
//!
//! Every component reports INFO/ERROR events to one sink process which
//! appends formatted lines to a log file. Transport is one UDP datagram per
//! event. Producers only push onto a bounded in-process queue and never wait;
//! one task per client drains it to the socket. Delivery is best-effort (at
//! most once): a full queue or a failed send drops the event.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 65_507;
const CLIENT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Error,
}

/// `LOG` request as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRequest {
    pub req: String,
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub process: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

impl LogRequest {
    pub fn info(process: &str, message: impl Into<String>) -> Self {
        Self {
            req: "LOG".to_string(),
            level: LogLevel::Info,
            process: process.to_string(),
            message: message.into(),
            method: None,
            filename: None,
            lineno: None,
            funname: None,
            line: None,
        }
    }

    pub fn error(process: &str, message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            level: LogLevel::Error,
            filename: Some(location.filename.to_string()),
            lineno: Some(location.lineno),
            funname: Some(location.funname.to_string()),
            ..Self::info(process, message)
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.line = Some(line.into());
        self
    }
}

/// Where an error was reported from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub filename: &'static str,
    pub lineno: u32,
    pub funname: &'static str,
}

/// Report an error to the log sink with the caller's source location
#[macro_export]
macro_rules! log_error {
    ($client:expr, $process:expr, $err:expr) => {
        $client.error(
            $process,
            &$err,
            $crate::log_sink::SourceLocation {
                filename: file!(),
                lineno: line!(),
                funname: module_path!(),
            },
        )
    };
}

/// Render one log file line (without the trailing newline)
pub fn format_entry(request: &LogRequest, timestamp: &str) -> String {
    match request.level {
        LogLevel::Info => match &request.method {
            Some(method) => format!(
                "{} [{}][{}][INFO] : {}",
                timestamp, request.process, method, request.message
            ),
            None => format!("{} [{}][INFO] : {}", timestamp, request.process, request.message),
        },
        LogLevel::Error => {
            let mut entry = format!(
                "{} [{}][ERROR][{}][{}][{}] : {}",
                timestamp,
                request.process,
                request.filename.as_deref().unwrap_or("?"),
                request.lineno.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
                request.funname.as_deref().unwrap_or("?"),
                request.message
            );
            if let Some(line) = &request.line {
                entry.push_str(" :: ");
                entry.push_str(line);
            }
            entry
        }
    }
}

fn now_stamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// The sink service: one bound socket, one log file
pub struct LogSink {
    socket: UdpSocket,
    log_file: PathBuf,
}

impl LogSink {
    pub async fn bind(address: SocketAddr, log_file: impl AsRef<Path>) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("Failed to bind log sink on {}", address))?;

        Ok(Self {
            socket,
            log_file: log_file.as_ref().to_path_buf(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop; a bad datagram or a failed write never ends it
    pub async fn run(self) {
        info!("Log sink listening on {:?}, writing {}", self.socket.local_addr().ok(), self.log_file.display());

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Log sink receive error: {}", e);
                    continue;
                }
            };

            let entry = match serde_json::from_slice::<LogRequest>(&buf[..len]) {
                Ok(request) if request.req == "LOG" => format_entry(&request, &now_stamp()),
                Ok(request) => {
                    debug!("Ignoring non-LOG request '{}' from {}", request.req, peer);
                    continue;
                }
                Err(e) => {
                    let own = LogRequest::error(
                        "log-sink",
                        format!("undecodable log request from {}: {}", peer, e),
                        SourceLocation {
                            filename: file!(),
                            lineno: line!(),
                            funname: module_path!(),
                        },
                    );
                    format_entry(&own, &now_stamp())
                }
            };

            if let Err(e) = self.append(&entry).await {
                error!("Log sink failed to write {}: {:#}", self.log_file.display(), e);
            }
        }
    }

    async fn append(&self, entry: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

/// Fire-and-forget client of the log sink.
///
/// Every event is mirrored to the local `tracing` subscriber as well.
#[derive(Clone)]
pub struct LogClient {
    queue: Option<mpsc::Sender<Vec<u8>>>,
}

impl LogClient {
    /// Bind a local socket and start the task that forwards queued events to `sink`
    pub async fn connect(sink: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if sink.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local)
            .await
            .context("Failed to bind log client socket")?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = socket.send_to(&payload, sink).await {
                    debug!("Log event to {} dropped: {}", sink, e);
                }
            }
        });

        Ok(Self { queue: Some(tx) })
    }

    /// Client that only writes to the local subscriber
    pub fn local_only() -> Self {
        Self { queue: None }
    }

    pub fn info(&self, process: &str, message: impl Into<String>) {
        let request = LogRequest::info(process, message);
        info!(process = %request.process, "{}", request.message);
        self.send(&request);
    }

    /// Prefer the [`log_error!`](crate::log_error) macro, which fills in `location`
    pub fn error(&self, process: &str, err: &dyn std::fmt::Display, location: SourceLocation) {
        let request = LogRequest::error(process, err.to_string(), location).with_line(format!("{:#}", err));
        error!(
            process = %request.process,
            file = location.filename,
            line = location.lineno,
            "{}",
            request.message
        );
        self.send(&request);
    }

    pub fn send(&self, request: &LogRequest) {
        let Some(queue) = &self.queue else {
            return;
        };
        match serde_json::to_vec(request) {
            Ok(payload) => {
                if let Err(e) = queue.try_send(payload) {
                    debug!("Log event dropped: {}", e);
                }
            }
            Err(e) => debug!("Log event not serializable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn location() -> SourceLocation {
        SourceLocation {
            filename: "src/worker.rs",
            lineno: 12,
            funname: "acquisition_agent::worker",
        }
    }

    #[test]
    fn test_info_format() {
        let request = LogRequest::info("dispatcher", "SYNCING Therm1");
        assert_eq!(
            format_entry(&request, "2024-01-01 00:00:00.000"),
            "2024-01-01 00:00:00.000 [dispatcher][INFO] : SYNCING Therm1"
        );

        let request = request.with_method("syncInst");
        assert_eq!(
            format_entry(&request, "T"),
            "T [dispatcher][syncInst][INFO] : SYNCING Therm1"
        );
    }

    #[test]
    fn test_error_format() {
        let request = LogRequest::error("worker", "read failed", location());
        assert_eq!(
            format_entry(&request, "T"),
            "T [worker][ERROR][src/worker.rs][12][acquisition_agent::worker] : read failed"
        );

        let request = request.with_line("read failed: connection refused");
        assert!(format_entry(&request, "T").ends_with(" :: read failed: connection refused"));
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(LogRequest::info("p", "m")).unwrap();
        assert_eq!(value, serde_json::json!({"req": "LOG", "type": "INFO", "process": "p", "message": "m"}));
    }

    async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
        for _ in 0..50 {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                let lines: Vec<String> = content.lines().map(String::from).collect();
                if lines.len() >= count {
                    return lines;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_sink_survives_bad_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("agent.log");

        let sink = LogSink::bind("127.0.0.1:0".parse().unwrap(), &log_file).await.unwrap();
        let addr = sink.local_addr().unwrap();
        tokio::spawn(sink.run());

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"{not json", addr).await.unwrap();
        let lines = wait_for_lines(&log_file, 1).await;
        assert!(lines[0].contains("[log-sink][ERROR]"));

        let client = LogClient::connect(addr).await.unwrap();
        client.info("dispatcher", "still alive");
        let lines = wait_for_lines(&log_file, 2).await;
        assert!(lines[1].ends_with("[dispatcher][INFO] : still alive"));

        let err = anyhow::anyhow!("refused").context("connecting instrument");
        crate::log_error!(client, "worker", err);
        let lines = wait_for_lines(&log_file, 3).await;
        assert!(lines[2].contains("[worker][ERROR]["));
        assert!(lines[2].contains("log_sink.rs]["));
        assert!(lines[2].ends_with(" :: connecting instrument: refused"));
    }

    #[tokio::test]
    async fn test_burst_right_after_connect_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("burst.log");

        let sink = LogSink::bind("127.0.0.1:0".parse().unwrap(), &log_file).await.unwrap();
        let addr = sink.local_addr().unwrap();
        tokio::spawn(sink.run());

        // No yield between connect and the first events
        let client = LogClient::connect(addr).await.unwrap();
        for n in 0..5 {
            client.info("worker", format!("event {}", n));
        }

        let lines = wait_for_lines(&log_file, 5).await;
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("[worker][INFO] : event 0"));
        assert!(lines[4].ends_with("[worker][INFO] : event 4"));
    }

    #[tokio::test]
    async fn test_local_only_client_sends_nothing() {
        let client = LogClient::local_only();
        client.info("main", "quiet");
        crate::log_error!(client, "main", anyhow::anyhow!("still quiet"));
        assert!(client.queue.is_none());
    }
}
