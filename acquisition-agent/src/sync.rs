//! Directory sync collaborator
//!
//! Uploading staged files to the coordinator's storage is delegated to an
//! external command. The command line is a template, e.g.
//! `rsync -az {dir}/ {backupUser}@{server}:{database}/{instrument}/`.
//! Directory-sync directives may also narrow the upload with `{extension}`
//! and `{pattern}`, e.g. `--include=*{pattern}*.{extension}`.

use anyhow::{anyhow, bail, Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::protocol::{Directive, DirectorySource};

/// Everything a sync backend needs to push one directory
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub dir: PathBuf,
    pub server: String,
    pub database: String,
    pub instrument: String,
    pub backup_port: Option<u16>,
    pub backup_user: String,
    pub backup_pass: String,
    pub meta_name: String,
    pub server_db: Option<String>,
    /// File filters; empty for staging directories
    pub extension: String,
    pub pattern: String,
}

impl SyncRequest {
    pub fn for_directive(directive: &Directive, dir: PathBuf) -> Self {
        Self {
            dir,
            server: directive.server.clone(),
            database: directive.database.clone(),
            instrument: directive.instrument.clone(),
            backup_port: directive.backup_port,
            backup_user: directive.backup_user.clone(),
            backup_pass: directive.backup_pass.clone(),
            meta_name: directive.meta_name.clone(),
            server_db: directive.server_db.clone(),
            extension: String::new(),
            pattern: String::new(),
        }
    }

    /// Request for a type 0 directive's own directory and filters
    pub fn for_source(directive: &Directive, source: &DirectorySource) -> Self {
        Self {
            extension: source.extension.clone(),
            pattern: source.pattern.clone(),
            ..Self::for_directive(directive, PathBuf::from(&source.path))
        }
    }
}

/// Pushes a local directory to the coordinator's storage backend
pub trait DirectorySync: Send + Sync + 'static {
    fn sync(&self, request: &SyncRequest) -> impl Future<Output = Result<()>> + Send;
}

/// Runs the configured command template; a missing template makes every
/// sync a no-op.
#[derive(Debug, Clone)]
pub struct CommandSync {
    template: Option<Vec<String>>,
    timeout: Duration,
}

impl CommandSync {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let template = match config.command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => {
                let words = shell_words::split(cmd)
                    .with_context(|| format!("Invalid sync command template: {}", cmd))?;
                Some(words)
            }
            _ => None,
        };

        Ok(Self {
            template,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Substitute placeholders argument by argument
    fn render(template: &[String], request: &SyncRequest) -> Vec<String> {
        let backup_port = request.backup_port.map(|p| p.to_string()).unwrap_or_default();
        let server_db = request.server_db.clone().unwrap_or_default();
        let dir = request.dir.display().to_string();

        template
            .iter()
            .map(|arg| {
                arg.replace("{dir}", &dir)
                    .replace("{server}", &request.server)
                    .replace("{database}", &request.database)
                    .replace("{instrument}", &request.instrument)
                    .replace("{metaName}", &request.meta_name)
                    .replace("{backupPort}", &backup_port)
                    .replace("{backupUser}", &request.backup_user)
                    .replace("{serverDB}", &server_db)
                    .replace("{extension}", &request.extension)
                    .replace("{pattern}", &request.pattern)
            })
            .collect()
    }
}

impl DirectorySync for CommandSync {
    async fn sync(&self, request: &SyncRequest) -> Result<()> {
        let Some(template) = &self.template else {
            debug!("No sync command configured, skipping {}", request.dir.display());
            return Ok(());
        };

        let args = Self::render(template, request);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("Sync command template is empty"))?;

        info!("Syncing {} with {}", request.dir.display(), program);

        let output = tokio::time::timeout(
            self.timeout,
            AsyncCommand::new(program)
                .args(rest)
                .env("SYNC_PASSWORD", &request.backup_pass)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .context("Sync command timed out")?
        .with_context(|| format!("Failed to execute sync command {}", program))?;

        if !output.status.success() {
            bail!(
                "Sync command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}
