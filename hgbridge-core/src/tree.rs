//! Manifest <-> tree translation
//!
//! A manifest is flat (`dir/sub/file -> node, flags`); git wants one tree
//! object per directory. Going forward, paths are grouped into nested
//! directories and every tree is emitted children first. Going back, trees
//! are walked depth first and flattened.
//!
//! File contents are never read here: translation of individual file ids
//! goes through the [`FileNodes`] seam.

use std::collections::BTreeMap;

use crate::error::{BridgeError, Result};
use crate::id::{GitId, HgId};
use crate::manifest::{FileFlags, Manifest, ManifestEntry};
use crate::object::{EntryMode, RawObject, Tree, TreeEntry};
use crate::storage::TargetStore;

/// Translation of individual file ids between both sides
pub trait FileNodes {
    /// Git blob id holding the content of a file node
    fn blob_for(&self, path: &[u8], node: &HgId) -> Result<GitId>;

    /// File node for a blob at a path, creating a new file revision if no
    /// existing one matches
    fn node_for(&mut self, path: &[u8], blob: &GitId) -> Result<HgId>;
}

/// What to do with entries whose mode cannot be represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModePolicy {
    #[default]
    Strict,
    SkipAndReport,
}

impl ModePolicy {
    pub fn from_config(skip_unsupported_modes: bool) -> Self {
        if skip_unsupported_modes {
            ModePolicy::SkipAndReport
        } else {
            ModePolicy::Strict
        }
    }

    /// Fail under `Strict`; record and continue otherwise
    fn handle(&self, err: BridgeError, path: &[u8], skipped: &mut Vec<SkippedEntry>) -> Result<()> {
        match (self, err) {
            (ModePolicy::SkipAndReport, err @ BridgeError::UnsupportedMode { .. }) => {
                tracing::warn!(path = %String::from_utf8_lossy(path), "skipping entry: {}", err);
                skipped.push(SkippedEntry {
                    path: path.to_vec(),
                    reason: err.to_string(),
                });
                Ok(())
            }
            (_, err) => Err(err),
        }
    }
}

/// An entry left out under [`ModePolicy::SkipAndReport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: Vec<u8>,
    pub reason: String,
}

/// Result of translating a manifest
#[derive(Debug, Clone)]
pub struct TreeBuild {
    pub root: GitId,
    /// Every tree object, children before parents, root last
    pub objects: Vec<RawObject>,
    pub skipped: Vec<SkippedEntry>,
}

/// Result of translating a tree
#[derive(Debug, Clone)]
pub struct ManifestBuild {
    pub manifest: Manifest,
    pub skipped: Vec<SkippedEntry>,
}

fn flags_to_mode(flags: FileFlags, manifest: &HgId, path: &[u8]) -> Result<EntryMode> {
    if flags.contains(FileFlags::EXECUTABLE | FileFlags::SYMLINK) {
        return Err(BridgeError::UnsupportedMode {
            object: manifest.to_hex(),
            path: String::from_utf8_lossy(path).into_owned(),
            mode: "flags xl".to_string(),
        });
    }
    Ok(if flags.contains(FileFlags::SYMLINK) {
        EntryMode::Symlink
    } else if flags.contains(FileFlags::EXECUTABLE) {
        EntryMode::Executable
    } else {
        EntryMode::Regular
    })
}

fn mode_to_flags(mode: EntryMode) -> FileFlags {
    match mode {
        EntryMode::Executable => FileFlags::EXECUTABLE,
        EntryMode::Symlink => FileFlags::SYMLINK,
        _ => FileFlags::empty(),
    }
}

/// Directory being assembled from manifest paths
#[derive(Default)]
struct DirBuilder {
    files: BTreeMap<Vec<u8>, (EntryMode, GitId)>,
    dirs: BTreeMap<Vec<u8>, DirBuilder>,
}

impl DirBuilder {
    fn insert(&mut self, path: &[u8], mode: EntryMode, blob: GitId, manifest: &HgId) -> Result<()> {
        let conflict = || {
            BridgeError::malformed(
                "manifest",
                manifest,
                format!("{} is both a file and a directory", String::from_utf8_lossy(path)),
            )
        };
        let mut dir = self;
        let mut components = path.split(|b| *b == b'/').peekable();
        while let Some(component) = components.next() {
            if component.is_empty() {
                return Err(BridgeError::malformed(
                    "manifest",
                    manifest,
                    format!("empty component in {}", String::from_utf8_lossy(path)),
                ));
            }
            if components.peek().is_none() {
                if dir.dirs.contains_key(component) {
                    return Err(conflict());
                }
                dir.files.insert(component.to_vec(), (mode, blob));
                return Ok(());
            }
            if dir.files.contains_key(component) {
                return Err(conflict());
            }
            dir = dir.dirs.entry(component.to_vec()).or_default();
        }
        Ok(())
    }

    /// Emit this directory and everything below it, children first
    fn write(self, objects: &mut Vec<RawObject>) -> GitId {
        let mut entries: Vec<TreeEntry> = self
            .files
            .into_iter()
            .map(|(name, (mode, id))| TreeEntry::new(name, mode, id))
            .collect();
        for (name, dir) in self.dirs {
            let id = dir.write(objects);
            entries.push(TreeEntry::new(name, EntryMode::Tree, id));
        }
        let object = RawObject::tree(&Tree::new(entries));
        let id = object.id;
        objects.push(object);
        id
    }
}

/// Convert a manifest into git trees. `id` names the manifest in errors.
pub fn manifest_to_tree(
    manifest: &Manifest,
    id: &HgId,
    files: &dyn FileNodes,
    policy: ModePolicy,
) -> Result<TreeBuild> {
    let mut root = DirBuilder::default();
    let mut skipped = Vec::new();

    for (path, entry) in manifest.iter() {
        let mode = match flags_to_mode(entry.flags, id, path) {
            Ok(mode) => mode,
            Err(err) => {
                policy.handle(err, path, &mut skipped)?;
                continue;
            }
        };
        let blob = files.blob_for(path, &entry.node)?;
        root.insert(path, mode, blob, id)?;
    }

    let mut objects = Vec::new();
    let root = root.write(&mut objects);
    Ok(TreeBuild {
        root,
        objects,
        skipped,
    })
}

/// Flatten a git tree into a manifest
pub fn tree_to_manifest(
    root: &GitId,
    store: &dyn TargetStore,
    files: &mut dyn FileNodes,
    policy: ModePolicy,
) -> Result<ManifestBuild> {
    let mut manifest = Manifest::new();
    let mut skipped = Vec::new();
    let mut pending = vec![(Vec::new(), *root)];

    while let Some((prefix, tree_id)) = pending.pop() {
        let tree = store.get_tree(&tree_id)?;
        for entry in tree.entries() {
            let mut path = prefix.clone();
            if !path.is_empty() {
                path.push(b'/');
            }
            path.extend_from_slice(&entry.name);

            if entry.mode.is_tree() {
                pending.push((path, entry.id));
                continue;
            }
            if let Err(err) = entry.mode.check(&tree_id, &path) {
                policy.handle(err, &path, &mut skipped)?;
                continue;
            }
            let node = files.node_for(&path, &entry.id)?;
            manifest.insert(path, ManifestEntry::new(node, mode_to_flags(entry.mode)));
        }
    }

    Ok(ManifestBuild { manifest, skipped })
}
