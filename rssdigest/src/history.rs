//! Small JSON state files kept next to the log: ids already digested, and
//! the last few digests sent out.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// How long a processed id is remembered
pub const PROCESSED_RETENTION_HOURS: i64 = 48;

/// Number of recent digests kept for deduplication
pub const DIGEST_HISTORY_LIMIT: usize = 10;

async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            error!(path = %path.display(), "ignoring unreadable state file: {}", e);
            T::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            error!(path = %path.display(), "failed to read state file: {}", e);
            T::default()
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Seconds-since-epoch encoded in a FreshRSS entry id.
///
/// Entry ids are microsecond timestamps; the first ten digits are the seconds.
pub fn entry_timestamp(id: i64) -> i64 {
    let digits = id.unsigned_abs().to_string();
    digits[..digits.len().min(10)].parse().unwrap_or(0)
}

/// Ids of entries that already went into a digest
pub struct ProcessedIds {
    path: PathBuf,
}

impl ProcessedIds {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> HashSet<i64> {
        read_json::<Vec<i64>>(&self.path).await.into_iter().collect()
    }

    /// Merge `ids` into the file, dropping anything older than the retention window.
    /// Returns the number of ids kept.
    pub async fn record(&self, ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - Duration::hours(PROCESSED_RETENTION_HOURS)).timestamp();

        let mut all = self.load().await;
        all.extend(ids.iter().copied());

        let mut kept: Vec<i64> = all
            .into_iter()
            .filter(|id| entry_timestamp(*id) >= cutoff)
            .collect();
        kept.sort_unstable();

        write_json(&self.path, &kept).await?;
        info!(
            "Updated processed ids file with {} entries: {}",
            kept.len(),
            self.path.display()
        );
        Ok(kept.len())
    }
}

/// Most recent digests, newest first
pub struct DigestHistory {
    path: PathBuf,
    limit: usize,
}

impl DigestHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            limit: DIGEST_HISTORY_LIMIT,
        }
    }

    pub async fn load(&self) -> Vec<String> {
        read_json(&self.path).await
    }

    pub async fn push(&self, digest: &str) -> Result<usize> {
        let mut history = self.load().await;
        history.insert(0, digest.to_string());
        history.truncate(self.limit);
        write_json(&self.path, &history).await?;
        info!("Saved digest to history. Total history entries: {}", history.len());
        Ok(history.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_at(ts: DateTime<Utc>, micros: i64) -> i64 {
        ts.timestamp() * 1_000_000 + micros
    }

    #[test]
    fn timestamp_from_id() {
        assert_eq!(entry_timestamp(1_700_000_000_123_456), 1_700_000_000);
        assert_eq!(entry_timestamp(42), 42);
        assert_eq!(entry_timestamp(i64::MIN), 9_223_372_036);
    }

    #[tokio::test]
    async fn record_merges_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProcessedIds::new(dir.path().join("state").join("processed.json"));
        let now = Utc::now();

        let old = id_at(now - Duration::hours(72), 1);
        let recent = id_at(now - Duration::hours(1), 2);
        assert_eq!(store.record(&[old, recent], now).await.unwrap(), 1);

        let fresh = id_at(now, 3);
        assert_eq!(store.record(&[fresh, recent], now).await.unwrap(), 2);

        let loaded = store.load().await;
        assert!(loaded.contains(&recent));
        assert!(loaded.contains(&fresh));
        assert!(!loaded.contains(&old));
    }

    #[tokio::test]
    async fn corrupt_or_missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");
        assert!(ProcessedIds::new(&path).load().await.is_empty());

        std::fs::write(&path, "{not json").unwrap();
        assert!(ProcessedIds::new(&path).load().await.is_empty());
        assert!(DigestHistory::new(&path).load().await.is_empty());
    }

    #[tokio::test]
    async fn history_keeps_newest_first_and_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let history = DigestHistory::new(dir.path().join("history.json"));

        for i in 0..(DIGEST_HISTORY_LIMIT + 3) {
            history.push(&format!("digest {}", i)).await.unwrap();
        }

        let loaded = history.load().await;
        assert_eq!(loaded.len(), DIGEST_HISTORY_LIMIT);
        assert_eq!(loaded[0], format!("digest {}", DIGEST_HISTORY_LIMIT + 2));
    }
}
