//! Remote collaborators
//!
//! The orchestrator only ever talks to a [`Remote`]: it asks for heads,
//! fetches a bundle relative to a common set, and hands over pushed bundles.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::bundle::Bundle;
use crate::error::{BridgeError, Result};
use crate::id::HgId;

/// The other side of a sync
#[async_trait]
pub trait Remote: Send + Sync {
    /// Where the remote lives, for state and logs
    fn url(&self) -> String;

    /// Current changeset heads
    async fn heads(&self) -> Result<Vec<HgId>>;

    /// Bundle with everything reachable from `heads` and not from `common`.
    /// A remote may send more than that; already mapped revisions are
    /// skipped on arrival.
    async fn fetch(&self, common: &[HgId], heads: &[HgId]) -> Result<Bytes>;

    /// Deliver a bundle
    async fn push(&self, bundle: Bytes) -> Result<()>;
}

/// Changesets of a bundle that are not a parent of another changeset in it
pub fn bundle_heads(data: Bytes) -> Result<Vec<HgId>> {
    let bundle = Bundle::parse(data)?;
    let mut ids = Vec::with_capacity(bundle.changesets.len());
    let mut parents = HashSet::new();
    for record in bundle.changesets.records() {
        let record = record?;
        ids.push(record.id);
        parents.insert(record.p1);
        parents.insert(record.p2);
    }
    Ok(ids.into_iter().filter(|id| !parents.contains(id)).collect())
}

/// Remote backed by a bundle file, with pushes written to an outbox
pub struct BundleFileRemote {
    bundle: Option<PathBuf>,
    outbox: Option<PathBuf>,
}

impl BundleFileRemote {
    /// Serve fetches from a bundle file
    pub fn new(bundle: impl AsRef<Path>) -> Self {
        Self {
            bundle: Some(bundle.as_ref().to_path_buf()),
            outbox: None,
        }
    }

    /// Accept pushes into a directory
    pub fn outbox(outbox: impl AsRef<Path>) -> Self {
        Self {
            bundle: None,
            outbox: Some(outbox.as_ref().to_path_buf()),
        }
    }

    pub fn with_outbox(mut self, outbox: impl AsRef<Path>) -> Self {
        self.outbox = Some(outbox.as_ref().to_path_buf());
        self
    }

    async fn read(&self) -> Result<Option<Bytes>> {
        let Some(path) = &self.bundle else {
            return Ok(None);
        };
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| BridgeError::Transport(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(Some(Bytes::from(data)))
    }
}

#[async_trait]
impl Remote for BundleFileRemote {
    fn url(&self) -> String {
        match (&self.bundle, &self.outbox) {
            (Some(path), _) | (None, Some(path)) => format!("bundle://{}", path.display()),
            (None, None) => "bundle://".to_string(),
        }
    }

    async fn heads(&self) -> Result<Vec<HgId>> {
        match self.read().await? {
            Some(data) => bundle_heads(data),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch(&self, _common: &[HgId], _heads: &[HgId]) -> Result<Bytes> {
        self.read()
            .await?
            .ok_or_else(|| BridgeError::Transport("remote has no bundle to serve".to_string()))
    }

    async fn push(&self, bundle: Bytes) -> Result<()> {
        let outbox = self
            .outbox
            .as_ref()
            .ok_or_else(|| BridgeError::Transport("remote does not accept pushes".to_string()))?;
        tokio::fs::create_dir_all(outbox).await?;
        let name = format!(
            "{}-{}.hgb",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            uuid::Uuid::new_v4()
        );
        let path = outbox.join(name);
        tokio::fs::write(&path, &bundle)
            .await
            .map_err(|e| {
                BridgeError::Transport(format!("cannot write {}: {}", path.display(), e))
            })?;
        tracing::info!(path = %path.display(), bytes = bundle.len(), "bundle pushed");
        Ok(())
    }
}

/// In-memory remote for tests
///
/// Serves one bundle, records pushes, and can be told to fail the next
/// `n` calls with a transport error.
#[derive(Default)]
pub struct MemoryRemote {
    bundle: Mutex<Option<Bytes>>,
    pushed: Mutex<Vec<Bytes>>,
    failures: AtomicU32,
    fetches: AtomicU32,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serving(bundle: Bytes) -> Self {
        let remote = Self::default();
        remote.serve(bundle);
        remote
    }

    /// Replace the served bundle
    pub fn serve(&self, bundle: Bytes) {
        *self.bundle.lock() = Some(bundle);
    }

    /// Fail the next `n` calls
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Bundles received so far
    pub fn pushed(&self) -> Vec<Bytes> {
        self.pushed.lock().clone()
    }

    /// Number of successful fetches
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check(&self, call: &str) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BridgeError::Transport(format!("injected failure in {}", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl Remote for MemoryRemote {
    fn url(&self) -> String {
        "memory://".to_string()
    }

    async fn heads(&self) -> Result<Vec<HgId>> {
        self.check("heads")?;
        match self.bundle.lock().clone() {
            Some(data) => bundle_heads(data),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch(&self, _common: &[HgId], _heads: &[HgId]) -> Result<Bytes> {
        self.check("fetch")?;
        let data = self
            .bundle
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::Transport("nothing to fetch".to_string()))?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn push(&self, bundle: Bytes) -> Result<()> {
        self.check("push")?;
        self.pushed.lock().push(bundle);
        Ok(())
    }
}
