//! Source revision store
//!
//! Full texts of hg revisions (changesets, manifests and files) with their
//! parents, keyed by node id. Delta chains are rebuilt on decode and never
//! stored: every revision is kept whole.
//!
//! ## On-disk format
//!
//! `hg/objects/xx/yyyy…`, each file zstd-compressed `<p1 20><p2 20><text>`.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::bundle::{BaseResolver, FullRevision};
use crate::error::{BridgeError, Result};
use crate::id::{HgId, ID_LEN};
use crate::storage::write_durable;

/// Persistent store of full hg revisions
pub trait SourceStore: Send + Sync {
    fn put(&self, revision: &FullRevision) -> Result<()>;

    fn get(&self, id: &HgId) -> Result<Option<FullRevision>>;

    fn contains(&self, id: &HgId) -> Result<bool>;

    /// Get a revision that must exist
    fn require(&self, id: &HgId) -> Result<FullRevision> {
        self.get(id)?
            .ok_or_else(|| BridgeError::NotFound(format!("hg revision {}", id)))
    }
}

/// In-memory source store
#[derive(Default)]
pub struct MemorySourceStore {
    revisions: RwLock<HashMap<HgId, FullRevision>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revisions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.read().is_empty()
    }
}

impl SourceStore for MemorySourceStore {
    fn put(&self, revision: &FullRevision) -> Result<()> {
        self.revisions
            .write()
            .entry(revision.id)
            .or_insert_with(|| revision.clone());
        Ok(())
    }

    fn get(&self, id: &HgId) -> Result<Option<FullRevision>> {
        Ok(self.revisions.read().get(id).cloned())
    }

    fn contains(&self, id: &HgId) -> Result<bool> {
        Ok(self.revisions.read().contains_key(id))
    }
}

impl BaseResolver for MemorySourceStore {
    fn full_text(&self, id: &HgId) -> Result<Option<Bytes>> {
        Ok(self.get(id)?.map(|revision| revision.text))
    }
}

/// zstd-compressed revisions, one file per node
pub struct DiskSourceStore {
    root: PathBuf,
    level: i32,
}

impl DiskSourceStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, level: 3 })
    }

    fn revision_path(&self, id: &HgId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl SourceStore for DiskSourceStore {
    fn put(&self, revision: &FullRevision) -> Result<()> {
        let path = self.revision_path(&revision.id);
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut payload = Vec::with_capacity(2 * ID_LEN + revision.text.len());
        payload.extend_from_slice(revision.p1.as_bytes());
        payload.extend_from_slice(revision.p2.as_bytes());
        payload.extend_from_slice(&revision.text);
        let compressed = zstd::encode_all(&payload[..], self.level)?;

        write_durable(&path, &compressed)
    }

    fn get(&self, id: &HgId) -> Result<Option<FullRevision>> {
        let data = match fs::read(self.revision_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload = zstd::decode_all(&data[..])?;
        if payload.len() < 2 * ID_LEN {
            return Err(BridgeError::malformed("revision", id, "truncated parents"));
        }
        let payload = Bytes::from(payload);
        Ok(Some(FullRevision {
            id: *id,
            p1: HgId::from_slice(&payload[..ID_LEN])?,
            p2: HgId::from_slice(&payload[ID_LEN..2 * ID_LEN])?,
            text: payload.slice(2 * ID_LEN..),
        }))
    }

    fn contains(&self, id: &HgId) -> Result<bool> {
        Ok(self.revision_path(id).exists())
    }
}

impl BaseResolver for DiskSourceStore {
    fn full_text(&self, id: &HgId) -> Result<Option<Bytes>> {
        Ok(self.get(id)?.map(|revision| revision.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemorySourceStore::new();
        let revision = FullRevision::new(HgId::NULL, HgId::NULL, "text\n");
        store.put(&revision).unwrap();
        assert!(store.contains(&revision.id).unwrap());
        assert_eq!(store.require(&revision.id).unwrap(), revision);
        assert_eq!(
            store.full_text(&revision.id).unwrap().unwrap().as_ref(),
            b"text\n"
        );
        assert!(store.require(&HgId::new([1u8; 20])).is_err());
    }

    #[test]
    fn test_disk_store_persists() {
        let dir = TempDir::new().unwrap();
        let root = FullRevision::new(HgId::NULL, HgId::NULL, "a\n");
        let child = FullRevision::new(root.id, HgId::NULL, "a\nb\n");
        {
            let store = DiskSourceStore::open(dir.path()).unwrap();
            store.put(&root).unwrap();
            store.put(&child).unwrap();
        }
        let store = DiskSourceStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&child.id).unwrap(), Some(child));
        assert_eq!(store.get(&HgId::new([2u8; 20])).unwrap(), None);
    }
}
