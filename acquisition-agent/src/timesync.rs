//! Opportunistic clock synchronization against a time server
//!
//! The SNTP query and the local clock read run side by side under one
//! overall timeout. Any failure degrades to the "N/A" sentinel: callers
//! treat clock sync as best-effort and carry on.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TimeSyncConfig;
use crate::protocol::NtpRequest;

/// Seconds between 1900-01-01 (NTP era 0) and the Unix epoch
const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;

const SNTP_PACKET_LEN: usize = 48;

/// Local time and measured offset, as reported in machine details
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInfo {
    pub local_time: String,
    /// Server minus local clock, in seconds
    #[serde(serialize_with = "serialize_difference")]
    pub server_difference: Option<f64>,
}

impl TimeInfo {
    pub fn unavailable() -> Self {
        Self {
            local_time: Utc::now().to_rfc3339(),
            server_difference: None,
        }
    }
}

fn serialize_difference<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(seconds) => serializer.serialize_f64(*seconds),
        None => serializer.serialize_str("N/A"),
    }
}

/// One SNTP exchange
#[derive(Debug, Clone, Copy)]
pub struct SntpSample {
    pub offset: f64,
    pub delay: f64,
}

fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn read_ntp_timestamp(bytes: &[u8]) -> f64 {
    let seconds = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64;
    let fraction = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as f64;
    seconds + fraction / 4_294_967_296.0 - NTP_UNIX_OFFSET
}

/// Encode a Unix timestamp as a 64-bit NTP timestamp
pub fn write_ntp_timestamp(epoch_seconds: f64, out: &mut [u8]) {
    let ntp = epoch_seconds + NTP_UNIX_OFFSET;
    let seconds = ntp.trunc() as u32;
    let fraction = (ntp.fract() * 4_294_967_296.0) as u32;
    out[0..4].copy_from_slice(&seconds.to_be_bytes());
    out[4..8].copy_from_slice(&fraction.to_be_bytes());
}

/// Query an SNTP server (`host:port`)
pub async fn query_sntp(server: &str) -> Result<SntpSample> {
    let addr = tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("Failed to resolve time server {}", server))?
        .next()
        .ok_or_else(|| anyhow!("Time server {} did not resolve", server))?;

    let local: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local).await.context("Failed to bind SNTP socket")?;
    socket.connect(addr).await.context("Failed to connect SNTP socket")?;

    // LI = 0, VN = 3, Mode = 3 (client)
    let mut request = [0u8; SNTP_PACKET_LEN];
    request[0] = 0x1B;

    let t1 = epoch_now();
    write_ntp_timestamp(t1, &mut request[40..48]);
    socket.send(&request).await.context("Failed to send SNTP request")?;

    let mut reply = [0u8; SNTP_PACKET_LEN];
    let len = socket.recv(&mut reply).await.context("Failed to receive SNTP reply")?;
    let t4 = epoch_now();

    if len < SNTP_PACKET_LEN {
        bail!("Short SNTP reply ({} bytes)", len);
    }
    let mode = reply[0] & 0x07;
    if mode != 4 && mode != 5 {
        bail!("Unexpected SNTP mode {}", mode);
    }
    if reply[1] == 0 {
        bail!("Time server sent a kiss-of-death reply");
    }

    let t2 = read_ntp_timestamp(&reply[32..40]);
    let t3 = read_ntp_timestamp(&reply[40..48]);

    Ok(SntpSample {
        offset: ((t2 - t1) + (t3 - t4)) / 2.0,
        delay: (t4 - t1) - (t3 - t2),
    })
}

async fn read_local_clock() -> DateTime<Utc> {
    Utc::now()
}

/// Measure the offset to the time server and, when asked, correct the
/// local clock.
pub async fn time_info(config: &TimeSyncConfig, request: Option<&NtpRequest>) -> TimeInfo {
    let server = request
        .and_then(|r| r.server.clone())
        .unwrap_or_else(|| config.server.clone());
    let apply = config.apply || request.map_or(false, |r| r.apply);
    let limit = Duration::from_secs(config.timeout_secs.max(1));

    let (sample, local) = match timeout(limit, async { tokio::join!(query_sntp(&server), read_local_clock()) }).await {
        Ok((Ok(sample), local)) => (Some(sample), local),
        Ok((Err(e), local)) => {
            warn!("Time sync against {} failed: {:#}", server, e);
            (None, local)
        }
        Err(_) => {
            warn!("Time sync against {} timed out after {:?}", server, limit);
            (None, read_local_clock().await)
        }
    };

    if let Some(sample) = &sample {
        debug!("Clock offset to {}: {:.3}s (delay {:.3}s)", server, sample.offset, sample.delay);
        if apply && sample.offset.abs() >= config.min_offset_secs {
            let applied = apply_offset(sample.offset).await;
            info!("Clock correction of {:.3}s applied: {}", sample.offset, applied);
        }
    }

    TimeInfo {
        local_time: local.to_rfc3339(),
        server_difference: sample.map(|s| s.offset),
    }
}

/// Shift the system clock by `offset_seconds`; `false` when it could not
/// be set.
pub async fn apply_offset(offset_seconds: f64) -> bool {
    if !offset_seconds.is_finite() {
        return false;
    }
    let target = Utc::now() + chrono::Duration::milliseconds((offset_seconds * 1000.0).round() as i64);
    set_system_clock(target).await
}

#[cfg(unix)]
async fn set_system_clock(target: DateTime<Utc>) -> bool {
    let stamp = format!("@{}.{:03}", target.timestamp(), target.timestamp_subsec_millis());

    match tokio::process::Command::new("date")
        .args(["-u", "-s", &stamp])
        .output()
        .await
    {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            warn!("Clock set failed: {}", String::from_utf8_lossy(&output.stderr).trim());
            false
        }
        Err(e) => {
            warn!("Failed to execute date: {}", e);
            false
        }
    }
}

#[cfg(windows)]
async fn set_system_clock(target: DateTime<Utc>) -> bool {
    use chrono::{Datelike, Timelike};
    use winapi::um::minwinbase::SYSTEMTIME;
    use winapi::um::sysinfoapi::SetSystemTime;

    let system_time = SYSTEMTIME {
        wYear: target.year() as u16,
        wMonth: target.month() as u16,
        wDayOfWeek: target.weekday().num_days_from_sunday() as u16,
        wDay: target.day() as u16,
        wHour: target.hour() as u16,
        wMinute: target.minute() as u16,
        wSecond: target.second() as u16,
        wMilliseconds: target.timestamp_subsec_millis().min(999) as u16,
    };

    // SAFETY: SYSTEMTIME is fully initialized and outlives the call
    let ok = unsafe { SetSystemTime(&system_time) } != 0;
    if !ok {
        warn!("SetSystemTime failed");
    }
    ok
}

#[cfg(not(any(unix, windows)))]
async fn set_system_clock(_target: DateTime<Utc>) -> bool {
    warn!("Clock setting is not supported on this platform");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every request with a server clock `skew` seconds ahead
    async fn spawn_mock_server(skew: f64) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 48];
            loop {
                let Ok((_, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let mut reply = [0u8; 48];
                reply[0] = 0x1C; // VN 3, mode 4 (server)
                reply[1] = 2;
                let now = epoch_now() + skew;
                write_ntp_timestamp(now, &mut reply[32..40]);
                write_ntp_timestamp(now, &mut reply[40..48]);
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr
    }

    #[test]
    fn test_ntp_timestamp_encoding() {
        let mut buf = [0u8; 8];
        write_ntp_timestamp(1_700_000_000.25, &mut buf);
        let decoded = read_ntp_timestamp(&buf);
        assert!((decoded - 1_700_000_000.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_offset_measured() {
        let addr = spawn_mock_server(10.0).await;
        let sample = query_sntp(&addr.to_string()).await.unwrap();
        assert!((sample.offset - 10.0).abs() < 0.5, "offset {}", sample.offset);
        assert!(sample.delay < 1.0);
    }

    #[tokio::test]
    async fn test_unresponsive_server_yields_sentinel() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TimeSyncConfig {
            server: silent.local_addr().unwrap().to_string(),
            timeout_secs: 1,
            ..TimeSyncConfig::default()
        };

        let info = time_info(&config, None).await;
        assert!(info.server_difference.is_none());
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["serverDifference"], "N/A");
        assert!(!value["localTime"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_overrides_server() {
        let addr = spawn_mock_server(-3.0).await;
        let config = TimeSyncConfig {
            server: "127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..TimeSyncConfig::default()
        };
        let request = NtpRequest {
            server: Some(addr.to_string()),
            apply: false,
        };

        let info = time_info(&config, Some(&request)).await;
        let difference = info.server_difference.unwrap();
        assert!((difference + 3.0).abs() < 0.5);
    }
}
