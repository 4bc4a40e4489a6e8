use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::{domain::MediaItem, Result};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs/attempt records).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

// ============== Text Helpers ==============

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

/// Keep only characters that are safe in a file name.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}

// ============== Scratch Files ==============

/// Temporary on-disk copy of a media item; removed when dropped.
///
/// Removal runs on every exit path, including a cancelled delivery future.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Write `item` into `dir` under a unique name.
    pub async fn write(dir: &Path, tag: &str, item: &MediaItem) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let name = format!(
            "{}-{}-{nanos}-{}",
            sanitize_filename(tag),
            std::process::id(),
            sanitize_filename(&item.filename)
        );
        let path = dir.join(name);
        // Guard exists before the write so a partial file is removed too.
        let guard = Self { path };
        tokio::fs::write(&guard.path, &item.data).await?;
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "scratch file cleanup failed"),
        }
    }
}
