//! Replication status log
//!
//! Records one entry per completed (or failed) snapshot build, per stream,
//! as JSON files on disk. Used by operators to inspect replication progress
//! and by the server's `status` subcommand.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// One completed snapshot build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub stream: String,
    /// Base changelist the diff was applied against (0 for a full build).
    pub base: u64,
    /// Target changelist of the snapshot.
    pub target: u64,
    /// Timestamp when the build finished (Unix seconds).
    pub timestamp: i64,
    /// Files written into the snapshot tree.
    pub files: u64,
    /// Content bytes streamed from the version-control server.
    pub bytes: u64,
    /// Duration of the build in milliseconds.
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Manages the on-disk status log. One file per build, named
/// `{base}_{target}.json`, under a per-stream directory.
pub struct StatusLog {
    dir: PathBuf,
}

impl StatusLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn stream_dir(&self, stream: &str) -> PathBuf {
        self.dir.join(stream)
    }

    /// Append a build record.
    pub fn append(&self, record: &BuildRecord) -> Result<()> {
        let dir = self.stream_dir(&record.stream);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}_{}.json", record.base, record.target));
        let data = serde_json::to_string_pretty(record)?;
        fs::write(&path, data)?;
        Ok(())
    }

    /// Records whose target falls in `[from, to]`, ascending by target.
    pub fn query(&self, stream: &str, from: u64, to: u64) -> Result<Vec<BuildRecord>> {
        let dir = self.stream_dir(stream);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(data) = fs::read_to_string(&path) {
                    if let Ok(record) = serde_json::from_str::<BuildRecord>(&data) {
                        if record.target >= from && record.target <= to {
                            records.push(record);
                        }
                    }
                }
            }
        }
        records.sort_by_key(|r| r.target);
        Ok(records)
    }

    /// All records for a stream.
    pub fn all(&self, stream: &str) -> Result<Vec<BuildRecord>> {
        self.query(stream, 0, u64::MAX)
    }

    /// The most recent record for a stream.
    pub fn latest(&self, stream: &str) -> Result<Option<BuildRecord>> {
        Ok(self.all(stream)?.into_iter().last())
    }

    /// Remove records whose target is below `change`. Returns how many.
    pub fn cleanup_before(&self, stream: &str, change: u64) -> Result<u64> {
        let dir = self.stream_dir(stream);
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0u64;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(data) = fs::read_to_string(&path) {
                    if let Ok(record) = serde_json::from_str::<BuildRecord>(&data) {
                        if record.target < change {
                            fs::remove_file(&path)?;
                            removed += 1;
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Format a build record for human-readable display.
pub fn format_record(record: &BuildRecord) -> String {
    let date = chrono::DateTime::from_timestamp(record.timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| record.timestamp.to_string());

    let status = if record.success { "OK" } else { "FAILED" };

    format!(
        "[{}] {} @{}..@{} | {} files, {} bytes | {}ms | {}{}",
        date,
        record.stream,
        record.base,
        record.target,
        record.files,
        record.bytes,
        record.duration_ms,
        status,
        record
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(base: u64, target: u64, success: bool) -> BuildRecord {
        BuildRecord {
            stream: "main".to_string(),
            base,
            target,
            timestamp: 1_700_000_000 + target as i64,
            files: 3,
            bytes: 4096,
            duration_ms: 120,
            success,
            error: if success { None } else { Some("boom".to_string()) },
        }
    }

    #[test]
    fn test_append_query_latest() {
        let tmp = TempDir::new().unwrap();
        let log = StatusLog::new(tmp.path());

        log.append(&record(0, 10, true)).unwrap();
        log.append(&record(10, 20, true)).unwrap();
        log.append(&record(20, 30, false)).unwrap();

        assert_eq!(log.all("main").unwrap().len(), 3);
        assert_eq!(log.query("main", 15, 25).unwrap().len(), 1);
        assert!(log.all("other").unwrap().is_empty());

        let latest = log.latest("main").unwrap().unwrap();
        assert_eq!(latest.target, 30);
        assert!(!latest.success);
    }

    #[test]
    fn test_cleanup_before() {
        let tmp = TempDir::new().unwrap();
        let log = StatusLog::new(tmp.path());
        for target in [10, 20, 30] {
            log.append(&record(target - 10, target, true)).unwrap();
        }
        let removed = log.cleanup_before("main", 25).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(log.all("main").unwrap().len(), 1);
    }

    #[test]
    fn test_format_record() {
        let formatted = format_record(&record(0, 10, false));
        assert!(formatted.contains("main"));
        assert!(formatted.contains("@0..@10"));
        assert!(formatted.contains("FAILED"));
        assert!(formatted.contains("boom"));
    }
}
