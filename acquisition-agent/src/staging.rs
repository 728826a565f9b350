//! Staging files written by peripheral workers before a directory sync
//!
//! Layout: `<temp>/<server>/<instrument>/<metaName>_<YYYYMMDD>_<HH>.tmp`.
//! Files are appended to, so several polls accumulate until the next sync.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Make a wire-provided name safe to use as one path component
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Directory holding one instrument's staging files
pub fn instrument_dir(temp_root: &Path, server: &str, instrument: &str) -> PathBuf {
    temp_root
        .join(sanitize_component(server))
        .join(sanitize_component(instrument))
}

/// Staging file for the hour containing `at`
pub fn staging_file(
    temp_root: &Path,
    server: &str,
    instrument: &str,
    meta_name: &str,
    at: DateTime<Utc>,
) -> PathBuf {
    let file_name = format!(
        "{}_{}_{}.tmp",
        sanitize_component(meta_name),
        at.format("%Y%m%d"),
        at.format("%H")
    );
    instrument_dir(temp_root, server, instrument).join(file_name)
}

/// Append raw text to a staging file, creating directories as needed
pub async fn append_raw(path: &Path, data: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create staging directory {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open staging file {}", path.display()))?;

    file.write_all(data.as_bytes())
        .await
        .with_context(|| format!("Failed to write staging file {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

/// Append one line per record
pub async fn append_records(path: &Path, records: &[String]) -> Result<()> {
    let mut block = String::new();
    for record in records {
        block.push_str(record);
        block.push('\n');
    }
    append_raw(path, &block).await
}
