//! Peripheral variant: poll the device, stage what it said, sync the stage

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::debug;

use super::{WorkerContext, PROCESS};
use crate::error::AgentError;
use crate::log_error;
use crate::parsing;
use crate::protocol::{Directive, DirectiveKind};
use crate::readers::{self, SerialSettings};
use crate::staging;
use crate::sync::{DirectorySync, SyncRequest};

fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Poll, stage, then sync whatever the instrument has staged so far.
///
/// A failed poll does not skip the sync: files staged by earlier polls are
/// still pushed. Every failure ends up in the returned list.
pub(super) async fn acquire<S: DirectorySync>(ctx: &WorkerContext<S>, directive: &Directive) -> Vec<String> {
    let mut errors = Vec::new();
    if let Err(e) = capture(ctx, directive).await {
        log_error!(ctx.log, PROCESS, e);
        errors.push(format!("{:#}", e));
    }

    let dir = staging::instrument_dir(&ctx.temp_dir, &directive.server, &directive.instrument);
    if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        debug!("Nothing staged for {}", directive.instrument);
        return errors;
    }

    let synced = ctx
        .sync
        .sync(&SyncRequest::for_directive(directive, dir))
        .await
        .with_context(|| format!("sync of {} failed", directive.instrument));
    if let Err(e) = synced {
        log_error!(ctx.log, PROCESS, e);
        errors.push(format!("{:#}", e));
    }
    errors
}

async fn capture<S>(ctx: &WorkerContext<S>, directive: &Directive) -> Result<()> {
    let remarks = directive.peripheral_config()?;

    let start = epoch_now();
    let outcome = match directive.kind {
        DirectiveKind::TcpPeripheral => {
            let port = remarks.port.ok_or(AgentError::MissingPeripheralField("port"))?;
            readers::read_tcp(port, remarks.poll_interval, &remarks.command).await
        }
        DirectiveKind::SerialPeripheral => {
            let settings = SerialSettings::from_config(&remarks)?;
            readers::read_serial(settings, remarks.poll_interval, &remarks.command).await
        }
        DirectiveKind::DirectorySync => bail!("directive {} is not a peripheral", directive.metaid),
    };
    let end = epoch_now();

    if !outcome.is_ok() {
        return Err(AgentError::Read(outcome.error).into());
    }
    debug!("{} answered {} bytes", directive.instrument, outcome.reply.len());

    let file = staging::staging_file(
        &ctx.temp_dir,
        &directive.server,
        &directive.instrument,
        &directive.meta_name,
        Utc::now(),
    );

    match &remarks.parse {
        Some(parse) => {
            let terminator = match directive.kind {
                DirectiveKind::SerialPeripheral => parse.terminator.as_str(),
                _ => "\n",
            };
            let lines = parsing::split_lines(&outcome.reply, terminator);
            let records = parsing::format_records(&lines, &directive.channels, parse, start, end);
            staging::append_records(&file, &records).await?;
        }
        None => staging::append_raw(&file, &outcome.reply).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::LogClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct CountingSync {
        calls: AtomicUsize,
    }

    impl DirectorySync for CountingSync {
        async fn sync(&self, _request: &SyncRequest) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(temp_dir: &std::path::Path) -> WorkerContext<CountingSync> {
        WorkerContext {
            temp_dir: temp_dir.to_path_buf(),
            sync: Arc::new(CountingSync::default()),
            log: LogClient::local_only(),
            timeout: Duration::from_secs(5),
            pool: Arc::new(Semaphore::new(1)),
        }
    }

    async fn instrument(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 64];
                let _ = tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buf)).await;
                let _ = stream.write_all(response).await;
            }
        });
        port
    }

    async fn dead_port() -> u16 {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        closed.local_addr().unwrap().port()
    }

    fn directive(port: u16, parse: Option<serde_json::Value>) -> Directive {
        let mut remarks = serde_json::json!({"port": port, "pollInterval": 2});
        if let Some(parse) = parse {
            remarks["parse"] = parse;
        }
        serde_json::from_value(serde_json::json!({
            "server": "10.0.0.2",
            "sendBackPort": 9,
            "type": 1,
            "instrument": "Therm1",
            "metaid": 42,
            "metaName": "therm",
            "remarks": remarks,
            "channels": [{"name": "t", "min": 0, "max": 4}, {"name": "h", "min": 5, "max": 6}],
        }))
        .unwrap()
    }

    async fn staged(root: &std::path::Path) -> String {
        let dir = root.join("10.0.0.2").join("Therm1");
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        tokio::fs::read_to_string(entry.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_raw_capture_staged_verbatim() {
        let temp = tempfile::tempdir().unwrap();
        let port = instrument(b"T=21.4 H=40\n").await;
        let ctx = context(temp.path());

        assert!(acquire(&ctx, &directive(port, None)).await.is_empty());
        assert_eq!(staged(temp.path()).await, "T=21.4 H=40\n");
        assert_eq!(ctx.sync.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parsed_capture_with_timestamps() {
        let temp = tempfile::tempdir().unwrap();
        let port = instrument(b"12.5,7\r\n").await;
        let parse = serde_json::json!({"separator": ";"});

        assert!(acquire(&context(temp.path()), &directive(port, Some(parse))).await.is_empty());
        let content = staged(temp.path()).await;
        let fields: Vec<&str> = content.trim_end().split(';').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(&fields[1..], ["12.5", "7"]);
    }

    #[tokio::test]
    async fn test_missing_remarks_and_read_failure() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path());
        let mut bare = directive(1, None);
        bare.remarks = None;
        let errors = acquire(&ctx, &bare).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("remarks"));

        let errors = acquire(&ctx, &directive(dead_port().await, None)).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("peripheral read failed"));

        // Nothing staged yet, so nothing to sync
        assert_eq!(ctx.sync.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_read_still_syncs_earlier_captures() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path());
        let port = instrument(b"T=19.0\n").await;
        assert!(acquire(&ctx, &directive(port, None)).await.is_empty());

        let errors = acquire(&ctx, &directive(dead_port().await, None)).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("peripheral read failed"));
        assert_eq!(ctx.sync.calls.load(Ordering::SeqCst), 2);
        assert_eq!(staged(temp.path()).await, "T=19.0\n");
    }
}
