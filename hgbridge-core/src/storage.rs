//! Target object store
//!
//! Content-addressed git objects. Two backends: an in-memory map for tests
//! and tooling, and the loose-object layout git itself reads
//! (`objects/xx/yyyy…`, zlib-compressed `"<kind> <len>\0<body>"`).

use bytes::Bytes;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::id::GitId;
use crate::object::{Commit, ObjectKind, RawObject, Tree};

/// Git object store interface
///
/// Stores are called from blocking worker threads; every method is
/// synchronous and must be safe to call concurrently.
pub trait TargetStore: Send + Sync {
    /// Store an encoded object body, returning its id
    fn put_raw(&self, kind: ObjectKind, body: Bytes) -> Result<GitId>;

    /// Get an object's kind and body
    fn get(&self, id: &GitId) -> Result<(ObjectKind, Bytes)>;

    /// Check if an object exists
    fn contains(&self, id: &GitId) -> Result<bool>;

    fn put_blob(&self, data: Bytes) -> Result<GitId> {
        self.put_raw(ObjectKind::Blob, data)
    }

    fn put_tree(&self, tree: &Tree) -> Result<GitId> {
        self.put_raw(ObjectKind::Tree, Bytes::from(tree.to_bytes()))
    }

    fn put_commit(&self, commit: &Commit) -> Result<GitId> {
        self.put_raw(ObjectKind::Commit, Bytes::from(commit.to_bytes()))
    }

    fn put_object(&self, object: &RawObject) -> Result<GitId> {
        self.put_raw(object.kind, object.body.clone())
    }

    /// Get an object, requiring a given kind
    fn get_kind(&self, id: &GitId, expected: ObjectKind) -> Result<Bytes> {
        let (kind, body) = self.get(id)?;
        if kind != expected {
            return Err(BridgeError::malformed(
                expected.as_str(),
                id,
                format!("object is a {}", kind),
            ));
        }
        Ok(body)
    }

    fn get_tree(&self, id: &GitId) -> Result<Tree> {
        Tree::parse(&self.get_kind(id, ObjectKind::Tree)?, id)
    }

    fn get_commit(&self, id: &GitId) -> Result<Commit> {
        Commit::parse(&self.get_kind(id, ObjectKind::Commit)?, id)
    }
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryTargetStore {
    objects: RwLock<HashMap<GitId, (ObjectKind, Bytes)>>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl TargetStore for MemoryTargetStore {
    fn put_raw(&self, kind: ObjectKind, body: Bytes) -> Result<GitId> {
        let id = kind.hash(&body);
        self.objects.write().entry(id).or_insert((kind, body));
        Ok(id)
    }

    fn get(&self, id: &GitId) -> Result<(ObjectKind, Bytes)> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("git object {}", id)))
    }

    fn contains(&self, id: &GitId) -> Result<bool> {
        Ok(self.objects.read().contains_key(id))
    }
}

/// Write a file whole and durably: temp file, fsync, rename, then fsync
/// the directory so the new name survives a crash.
pub(crate) fn write_durable(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Loose-object store in git's on-disk layout
pub struct LooseObjectStore {
    root: PathBuf,
}

impl LooseObjectStore {
    /// Open or create a store rooted at an `objects` directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, id: &GitId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn encode(kind: ObjectKind, body: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(format!("{} {}\0", kind, body.len()).as_bytes())?;
        encoder.write_all(body)?;
        Ok(encoder.finish()?)
    }

    fn decode(id: &GitId, data: &[u8]) -> Result<(ObjectKind, Bytes)> {
        let mut raw = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut raw)?;

        let malformed = |message: &str| BridgeError::malformed("loose", id, message);
        let nul = raw
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| malformed("missing header terminator"))?;
        let header = &raw[..nul];
        let space = header
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| malformed("missing size in header"))?;
        let kind = ObjectKind::parse(&header[..space]).ok_or_else(|| malformed("unknown kind"))?;
        let size: usize = std::str::from_utf8(&header[space + 1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed("invalid size"))?;
        let body = Bytes::from(raw).slice(nul + 1..);
        if body.len() != size {
            return Err(malformed("size does not match header"));
        }
        Ok((kind, body))
    }
}

impl TargetStore for LooseObjectStore {
    fn put_raw(&self, kind: ObjectKind, body: Bytes) -> Result<GitId> {
        let id = kind.hash(&body);
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_durable(&path, &Self::encode(kind, &body)?)?;
        Ok(id)
    }

    fn get(&self, id: &GitId) -> Result<(ObjectKind, Bytes)> {
        let data = match fs::read(self.object_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BridgeError::NotFound(format!("git object {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        Self::decode(id, &data)
    }

    fn contains(&self, id: &GitId) -> Result<bool> {
        Ok(self.object_path(id).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EMPTY_TREE;
    use tempfile::TempDir;

    #[test]
    fn test_write_durable_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("object");
        write_durable(&path, b"first").unwrap();
        write_durable(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let missing_dir = dir.path().join("absent/object");
        assert!(matches!(write_durable(&missing_dir, b"x"), Err(BridgeError::Io(_))));
    }

    fn exercise(store: &dyn TargetStore) {
        let blob = store.put_blob(Bytes::from_static(b"hello\n")).unwrap();
        assert_eq!(blob.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert!(store.contains(&blob).unwrap());

        let (kind, body) = store.get(&blob).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(body.as_ref(), b"hello\n");

        // Writing the same object twice is a no-op
        assert_eq!(store.put_blob(Bytes::from_static(b"hello\n")).unwrap(), blob);

        let tree = store.put_tree(&Tree::default()).unwrap();
        assert_eq!(tree, EMPTY_TREE);
        assert!(store.get_tree(&tree).unwrap().is_empty());
        assert!(store.get_commit(&tree).is_err());

        let missing = GitId::new([7u8; 20]);
        assert!(!store.contains(&missing).unwrap());
        assert!(matches!(store.get(&missing), Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTargetStore::new();
        exercise(&store);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_loose_store() {
        let dir = TempDir::new().unwrap();
        let store = LooseObjectStore::open(dir.path().join("objects")).unwrap();
        exercise(&store);

        let blob = GitId::from_hex("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        assert!(
            dir.path()
                .join("objects/ce/013625030ba8dba906f756967f9e9ca394464a")
                .exists()
        );

        // Writes leave no temp files behind
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("objects/ce"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);

        // Reopening sees the same objects
        let reopened = LooseObjectStore::open(dir.path().join("objects")).unwrap();
        assert!(reopened.contains(&blob).unwrap());
    }
}
