//! On-disk bridge repository
//!
//! Layout:
//!
//! ```text
//! <root>/uuid
//! <root>/git/objects/      git loose objects
//! <root>/hg/objects/       full hg texts
//! <root>/mapping.log       correspondence log
//! <root>/bridge-config.json
//! <root>/bridge-state.json
//! <root>/sync-log/
//! ```
//!
//! Opening creates whatever is missing. Dropping the handle closes it.

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::batch::BatchBuffer;
use crate::dag::{BlobCache, DagTranslator};
use crate::error::Result;
use crate::hg_store::{DiskSourceStore, SourceStore};
use crate::mapping::CorrespondenceStore;
use crate::storage::{LooseObjectStore, TargetStore};
use crate::sync::{BridgeConfig, BridgeState, SyncLog};
use crate::tree::ModePolicy;

/// Handle on every store of one bridge
pub struct BridgeRepository {
    root: PathBuf,
    uuid: String,
    target: Arc<dyn TargetStore>,
    source: Arc<dyn SourceStore>,
    mapping: CorrespondenceStore,
    cache: BlobCache,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    sync_log: SyncLog,
}

impl BridgeRepository {
    /// Open (or create) a repository at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let root = path.to_path_buf();
        fs::create_dir_all(&root)?;

        let uuid_path = root.join("uuid");
        let uuid = if uuid_path.exists() {
            fs::read_to_string(&uuid_path)?.trim().to_string()
        } else {
            let u = uuid::Uuid::new_v4().to_string();
            fs::write(&uuid_path, &u)?;
            u
        };

        let config = BridgeConfig::load(&root)?;
        let state = BridgeState::load(&root)?;
        if state.sync_in_progress {
            tracing::warn!(
                remote = %state.remote_url,
                "previous sync did not finish; its uncommitted work is ignored"
            );
        }

        let target = LooseObjectStore::open(root.join("git").join("objects"))?;
        let source = DiskSourceStore::open(root.join("hg").join("objects"))?;
        let mapping = CorrespondenceStore::open(root.join("mapping.log"))?;
        tracing::info!(
            path = %root.display(),
            mappings = mapping.len(),
            "opened bridge repository"
        );

        Ok(Self {
            cache: BlobCache::new(config.blob_cache_size),
            sync_log: SyncLog::new(&root),
            root,
            uuid,
            target: Arc::new(target),
            source: Arc::new(source),
            mapping,
            config,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Replace the configuration and save it
    pub fn set_config(&mut self, config: BridgeConfig) -> Result<()> {
        config.save(&self.root)?;
        self.config = config;
        Ok(())
    }

    pub fn target(&self) -> &dyn TargetStore {
        self.target.as_ref()
    }

    pub fn source(&self) -> &dyn SourceStore {
        self.source.as_ref()
    }

    pub fn mapping(&self) -> &CorrespondenceStore {
        &self.mapping
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    pub fn sync_log(&self) -> &SyncLog {
        &self.sync_log
    }

    pub fn policy(&self) -> ModePolicy {
        ModePolicy::from_config(self.config.skip_unsupported_modes)
    }

    /// Snapshot of the sync state
    pub fn state(&self) -> BridgeState {
        self.state.lock().clone()
    }

    /// Modify the sync state and save it
    pub fn update_state<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BridgeState),
    {
        let mut state = self.state.lock();
        f(&mut state);
        state.save(&self.root)
    }

    pub(crate) fn begin_sync(&self, remote_url: &str) -> Result<()> {
        self.state.lock().begin_sync(&self.root, remote_url)
    }

    pub(crate) fn end_sync(&self, success: bool) -> Result<()> {
        self.state.lock().end_sync(&self.root, success)
    }

    /// Translator over this repository's stores, staging into `batch`
    pub fn translator<'a>(&'a self, batch: &'a BatchBuffer) -> DagTranslator<'a> {
        DagTranslator::new(
            batch,
            &self.mapping,
            self.source.as_ref(),
            self.target.as_ref(),
            self.policy(),
            &self.cache,
        )
    }
}
