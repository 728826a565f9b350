//! Acquisition workers
//!
//! One task per granted directive. The task owns the instrument [`Lease`]
//! for its whole lifetime and always ends the same way: lease released,
//! then exactly one `METASYNCOVER` sent to the coordinator, whatever
//! happened in between (error, panic, timeout).

mod peripheral;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::error::AgentError;
use crate::log_error;
use crate::log_sink::LogClient;
use crate::protocol::{CompletionMessage, Directive, DirectiveKind, Reply};
use crate::registry::Lease;
use crate::sync::{DirectorySync, SyncRequest};
use crate::wire;

const PROCESS: &str = "worker";

/// Shared by every worker spawned from one dispatcher
pub struct WorkerContext<S> {
    pub temp_dir: PathBuf,
    pub sync: Arc<S>,
    pub log: LogClient,
    pub timeout: Duration,
    pub pool: Arc<Semaphore>,
}

impl<S> Clone for WorkerContext<S> {
    fn clone(&self) -> Self {
        Self {
            temp_dir: self.temp_dir.clone(),
            sync: Arc::clone(&self.sync),
            log: self.log.clone(),
            timeout: self.timeout,
            pool: Arc::clone(&self.pool),
        }
    }
}

/// Start a worker in the background; the dispatcher does not wait for it
pub fn spawn<S: DirectorySync>(ctx: WorkerContext<S>, lease: Lease, directive: Directive) -> JoinHandle<()> {
    tokio::spawn(run(ctx, lease, directive))
}

/// Run one directive to completion
pub async fn run<S: DirectorySync>(ctx: WorkerContext<S>, lease: Lease, directive: Directive) {
    // Pool slot; a closed pool only means no limit left to enforce
    let _permit = ctx.pool.clone().acquire_owned().await.ok();
    debug!("Worker started for {} ({})", directive.instrument, lease.metaid());

    let directive = Arc::new(directive);
    let body = {
        let ctx = ctx.clone();
        let directive = Arc::clone(&directive);
        tokio::spawn(async move {
            match directive.kind {
                DirectiveKind::DirectorySync => sync_instrument(&ctx, &directive)
                    .await
                    .err()
                    .map(|e| format!("{:#}", e))
                    .into_iter()
                    .collect(),
                DirectiveKind::TcpPeripheral | DirectiveKind::SerialPeripheral => {
                    peripheral::acquire(&ctx, &directive).await
                }
            }
        })
    };
    let abort = body.abort_handle();

    let errors = match timeout(ctx.timeout, body).await {
        Ok(Ok(errors)) => errors,
        Ok(Err(join_error)) => {
            let err = anyhow::anyhow!("worker aborted: {}", join_error);
            log_error!(ctx.log, PROCESS, err);
            vec![err.to_string()]
        }
        Err(_) => {
            abort.abort();
            let err = AgentError::WorkerTimeout(ctx.timeout.as_secs());
            log_error!(ctx.log, PROCESS, err);
            vec![err.to_string()]
        }
    };

    drop(lease);

    let completion = Reply::MetaSyncOver(CompletionMessage::for_directive(&directive, errors));
    if let Err(e) = wire::send_json(&directive.server, directive.send_back_port, &completion).await {
        log_error!(ctx.log, PROCESS, e);
    }
}

/// Directory-sync variant: push the directory named in `remarks` as is
async fn sync_instrument<S: DirectorySync>(ctx: &WorkerContext<S>, directive: &Directive) -> Result<()> {
    ctx.log.info(PROCESS, format!("SYNCING {}", directive.instrument));

    let result = async {
        let source = directive.directory_source()?;
        let request = SyncRequest::for_source(directive, &source);
        ctx.sync
            .sync(&request)
            .await
            .with_context(|| format!("sync of {} failed", directive.instrument))
    }
    .await;

    if let Err(e) = &result {
        log_error!(ctx.log, PROCESS, e);
    }
    result
}
