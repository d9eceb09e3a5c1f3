//! Bridge configuration, sync state and the sync log.
//!
//! All three live as JSON next to the stores:
//! - `bridge-config.json`: tunables, defaults when absent
//! - `bridge-state.json`: what the last sync left behind
//! - `sync-log/*.json`: one entry per fetch or push

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::id::HgId;

/// Bridge configuration stored at `repo/bridge-config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Concurrent file-chain decoders per bundle.
    pub worker_threads: usize,
    /// Skip (and report) entries with modes the bridge cannot represent.
    pub skip_unsupported_modes: bool,
    /// Extra attempts at the mapping append after objects are written.
    pub index_write_retries: u32,
    /// Extra discovery rounds after a transport failure.
    pub transport_retries: u32,
    /// Upper bound on translating one batch, in seconds.
    pub batch_timeout_secs: u64,
    /// Check every decoded revision against its declared node id.
    pub verify_hashes: bool,
    /// Entries in the file node -> blob cache.
    pub blob_cache_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            skip_unsupported_modes: false,
            index_write_retries: 3,
            transport_retries: 2,
            batch_timeout_secs: 3600,
            verify_hashes: true,
            blob_cache_size: 4096,
        }
    }
}

impl BridgeConfig {
    /// Load config from a repository path.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join("bridge-config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save config to a repository path.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        write_json(&repo_path.join("bridge-config.json"), self)
    }
}

/// Sync state persisted in the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeState {
    /// URL/path of the remote.
    pub remote_url: String,
    /// Remote heads known locally, sent as the common set on fetch.
    pub hg_heads: Vec<HgId>,
    /// Whether a sync is in progress (a crash leaves this set).
    pub sync_in_progress: bool,
    /// Changesets fetched in total.
    pub total_fetched: u64,
    /// Changesets pushed in total.
    pub total_pushed: u64,
    /// Timestamp of the last successful sync (Unix seconds).
    pub last_sync_timestamp: i64,
}

impl BridgeState {
    /// Load state from a repository path.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let state_path = Self::state_file_path(repo_path);
        if !state_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&state_path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save state to a repository path.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        write_json(&Self::state_file_path(repo_path), self)
    }

    /// Mark a sync as started.
    pub fn begin_sync(&mut self, repo_path: &Path, remote_url: &str) -> Result<()> {
        self.sync_in_progress = true;
        self.remote_url = remote_url.to_string();
        self.save(repo_path)
    }

    /// Mark a sync as finished, successful or not.
    pub fn end_sync(&mut self, repo_path: &Path, success: bool) -> Result<()> {
        self.sync_in_progress = false;
        if success {
            self.last_sync_timestamp = chrono::Utc::now().timestamp();
        }
        self.save(repo_path)
    }

    /// Merge new heads into the known set.
    pub fn add_heads(&mut self, heads: impl IntoIterator<Item = HgId>) {
        for head in heads {
            if !self.hg_heads.contains(&head) {
                self.hg_heads.push(head);
            }
        }
    }

    fn state_file_path(repo_path: &Path) -> PathBuf {
        repo_path.join("bridge-state.json")
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_string_pretty(value)?;
    fs::write(&tmp_path, &data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Direction of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Fetch,
    Push,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Fetch => f.pad("fetch"),
            SyncDirection::Push => f.pad("push"),
        }
    }
}

/// One fetch or push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: String,
    pub direction: SyncDirection,
    /// Timestamp when the sync finished (Unix milliseconds).
    pub timestamp_ms: i64,
    /// Changesets translated.
    pub changesets: u64,
    /// Git objects and hg revisions written.
    pub objects: u64,
    /// Entries skipped for unsupported modes.
    pub skipped: u64,
    pub duration_ms: u64,
    pub success: bool,
    /// Error kind and message if the sync failed.
    pub error: Option<String>,
}

impl SyncLogEntry {
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            changesets: 0,
            objects: 0,
            skipped: 0,
            duration_ms: 0,
            success: false,
            error: None,
        }
    }
}

/// Manages the sync log for a repository.
pub struct SyncLog {
    log_dir: PathBuf,
}

impl SyncLog {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            log_dir: repo_path.join("sync-log"),
        }
    }

    /// Append a log entry.
    pub fn append(&self, entry: &SyncLogEntry) -> Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        let filename = format!("{:013}_{}.json", entry.timestamp_ms, entry.id);
        let data = serde_json::to_string_pretty(entry)?;
        fs::write(self.log_dir.join(filename), data)?;
        Ok(())
    }

    fn read_entries(&self) -> Result<Vec<(PathBuf, SyncLogEntry)>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(data) = fs::read_to_string(&path) {
                    if let Ok(log_entry) = serde_json::from_str::<SyncLogEntry>(&data) {
                        entries.push((path, log_entry));
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.1.timestamp_ms.cmp(&b.1.timestamp_ms).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    /// All entries, oldest first.
    pub fn all(&self) -> Result<Vec<SyncLogEntry>> {
        Ok(self.read_entries()?.into_iter().map(|(_, e)| e).collect())
    }

    pub fn latest(&self) -> Result<Option<SyncLogEntry>> {
        Ok(self.all()?.into_iter().last())
    }

    /// Remove entries older than a timestamp (Unix milliseconds).
    pub fn cleanup_before(&self, timestamp_ms: i64) -> Result<u64> {
        let mut removed = 0u64;
        for (path, entry) in self.read_entries()? {
            if entry.timestamp_ms < timestamp_ms {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
