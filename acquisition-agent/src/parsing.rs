//! Field extraction and timestamp synthesis for captured instrument text

use chrono::{DateTime, Utc};

use crate::protocol::{Channel, ParseInfo};

/// Split a capture into lines, trimming `\r` and dropping empty lines
pub fn split_lines<'a>(raw: &'a str, terminator: &str) -> Vec<&'a str> {
    let terminator = if terminator.is_empty() { "\n" } else { terminator };
    raw.split(terminator)
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Extract every channel's `[min, max)` character range from `line`.
///
/// Channels whose range is empty or runs past the end of the line are left
/// out of the result.
pub fn extract_channels(line: &str, channels: &[Channel]) -> Vec<String> {
    let char_count = line.chars().count();

    channels
        .iter()
        .filter(|c| c.min < c.max && c.max <= char_count)
        .map(|c| {
            line.chars()
                .skip(c.min)
                .take(c.max - c.min)
                .collect::<String>()
                .trim()
                .to_string()
        })
        .collect()
}

/// Evenly spaced timestamps over `[start, end]`, one per line
pub fn synthesize_timestamps(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Render an epoch timestamp the way staging files carry it
pub fn format_timestamp(epoch_seconds: f64) -> String {
    let millis = (epoch_seconds * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| epoch_seconds.to_string())
}

/// Reassemble captured lines into staging records.
///
/// `start`/`end` are the read instants in epoch seconds; they are only used
/// when the instrument does not timestamp its own lines.
pub fn format_records(
    lines: &[&str],
    channels: &[Channel],
    parse: &ParseInfo,
    start: f64,
    end: f64,
) -> Vec<String> {
    let timestamps = if parse.time_provided {
        Vec::new()
    } else {
        synthesize_timestamps(start, end, lines.len())
    };

    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let mut fields = Vec::with_capacity(channels.len() + 1);
            if let Some(t) = timestamps.get(i) {
                fields.push(format_timestamp(*t));
            }
            fields.extend(extract_channels(line, channels));
            fields.join(&parse.separator)
        })
        .collect()
}
