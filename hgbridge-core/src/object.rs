//! Git object model: blobs, trees and commits
//!
//! Objects are identified by `sha1("<kind> <len>\0" + body)`. Only the
//! body is kept here; the header is added when hashing or writing loose
//! objects.

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

use crate::error::{BridgeError, Result};
use crate::id::{GitId, ID_LEN};

/// Kind of a git object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"blob" => Some(ObjectKind::Blob),
            b"tree" => Some(ObjectKind::Tree),
            b"commit" => Some(ObjectKind::Commit),
            _ => None,
        }
    }

    /// Id of a body of this kind
    pub fn hash(&self, body: &[u8]) -> GitId {
        GitId::hash(self.as_str(), body)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryMode {
    Regular,
    Executable,
    Symlink,
    Tree,
    /// Anything else found in a parsed tree (gitlinks, legacy `100664`)
    Unsupported(u32),
}

impl EntryMode {
    pub fn from_octal(mode: u32) -> Self {
        match mode {
            0o100644 => EntryMode::Regular,
            0o100755 => EntryMode::Executable,
            0o120000 => EntryMode::Symlink,
            0o40000 => EntryMode::Tree,
            other => EntryMode::Unsupported(other),
        }
    }

    pub fn as_octal(&self) -> u32 {
        match self {
            EntryMode::Regular => 0o100644,
            EntryMode::Executable => 0o100755,
            EntryMode::Symlink => 0o120000,
            EntryMode::Tree => 0o40000,
            EntryMode::Unsupported(mode) => *mode,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, EntryMode::Tree)
    }

    /// Reject modes the bridge cannot represent
    pub fn check(&self, object: &GitId, path: &[u8]) -> Result<()> {
        match self {
            EntryMode::Unsupported(mode) => Err(BridgeError::UnsupportedMode {
                object: object.to_hex(),
                path: String::from_utf8_lossy(path).into_owned(),
                mode: format!("{:o}", mode),
            }),
            _ => Ok(()),
        }
    }
}

/// A single tree entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: Vec<u8>,
    pub mode: EntryMode,
    pub id: GitId,
}

impl TreeEntry {
    pub fn new(name: impl Into<Vec<u8>>, mode: EntryMode, id: GitId) -> Self {
        Self {
            name: name.into(),
            mode,
            id,
        }
    }
}

/// Git's entry order: sub-tree names compare as if suffixed with `/`
fn entry_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    let a_key = a.name.iter().chain(a.mode.is_tree().then_some(&b'/'));
    let b_key = b.name.iter().chain(b.mode.is_tree().then_some(&b'/'));
    a_key.cmp(b_key)
}

/// A git tree, entries kept in canonical order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(entry_order);
        Self { entries }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 48);
        for entry in &self.entries {
            out.extend_from_slice(format!("{:o} ", entry.mode.as_octal()).as_bytes());
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }

    pub fn id(&self) -> GitId {
        ObjectKind::Tree.hash(&self.to_bytes())
    }

    /// Parse a tree body. Unknown modes are kept as
    /// [`EntryMode::Unsupported`] so callers decide what to do with them.
    pub fn parse(body: &[u8], id: &GitId) -> Result<Self> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            let rest = &body[pos..];
            let space = rest
                .iter()
                .position(|b| *b == b' ')
                .ok_or_else(|| BridgeError::malformed("tree", id, "entry without mode"))?;
            let mode = std::str::from_utf8(&rest[..space])
                .ok()
                .and_then(|m| u32::from_str_radix(m, 8).ok())
                .ok_or_else(|| BridgeError::malformed("tree", id, "invalid mode"))?;
            let nul = rest[space + 1..]
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| BridgeError::malformed("tree", id, "unterminated entry name"))?;
            let name = &rest[space + 1..space + 1 + nul];
            let id_start = space + 2 + nul;
            let raw_id = rest
                .get(id_start..id_start + ID_LEN)
                .ok_or_else(|| BridgeError::malformed("tree", id, "truncated entry id"))?;
            if name.is_empty() || name.contains(&b'/') {
                return Err(BridgeError::malformed(
                    "tree",
                    id,
                    format!("invalid entry name {:?}", String::from_utf8_lossy(name)),
                ));
            }
            entries.push(TreeEntry {
                name: name.to_vec(),
                mode: EntryMode::from_octal(mode),
                id: GitId::from_slice(raw_id)?,
            });
            pos += id_start + ID_LEN;
        }
        Ok(Self { entries })
    }
}

/// A git commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: GitId,
    pub parents: Vec<GitId>,
    /// `Name <email> <time> <+HHMM>`
    pub author: Vec<u8>,
    pub committer: Vec<u8>,
    pub message: Vec<u8>,
}

impl Commit {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.message.len());
        out.extend_from_slice(format!("tree {}\n", self.tree).as_bytes());
        for parent in &self.parents {
            out.extend_from_slice(format!("parent {}\n", parent).as_bytes());
        }
        out.extend_from_slice(b"author ");
        out.extend_from_slice(&self.author);
        out.extend_from_slice(b"\ncommitter ");
        out.extend_from_slice(&self.committer);
        out.extend_from_slice(b"\n\n");
        out.extend_from_slice(&self.message);
        out
    }

    pub fn id(&self) -> GitId {
        ObjectKind::Commit.hash(&self.to_bytes())
    }

    /// Parse a commit body. Headers other than tree, parent, author and
    /// committer (and their continuation lines) are ignored.
    pub fn parse(body: &[u8], id: &GitId) -> Result<Self> {
        let split = body
            .windows(2)
            .position(|w| w == b"\n\n")
            .ok_or_else(|| BridgeError::malformed("commit", id, "missing message separator"))?;
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;

        for line in body[..split].split(|b| *b == b'\n') {
            let Some(space) = line.iter().position(|b| *b == b' ') else {
                return Err(BridgeError::malformed("commit", id, "header without value"));
            };
            let (key, value) = (&line[..space], &line[space + 1..]);
            match key {
                b"tree" => tree = Some(parse_header_id(value, id)?),
                b"parent" => parents.push(parse_header_id(value, id)?),
                b"author" => author = Some(value.to_vec()),
                b"committer" => committer = Some(value.to_vec()),
                _ => {}
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| BridgeError::malformed("commit", id, "missing tree"))?,
            parents,
            author: author.ok_or_else(|| BridgeError::malformed("commit", id, "missing author"))?,
            committer: committer
                .ok_or_else(|| BridgeError::malformed("commit", id, "missing committer"))?,
            message: body[split + 2..].to_vec(),
        })
    }
}

fn parse_header_id(value: &[u8], commit: &GitId) -> Result<GitId> {
    std::str::from_utf8(value)
        .map_err(|_| BridgeError::malformed("commit", commit, "non-ascii id"))
        .and_then(GitId::from_hex)
}

/// An encoded object ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub id: GitId,
    pub kind: ObjectKind,
    pub body: Bytes,
}

impl RawObject {
    pub fn new(kind: ObjectKind, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            id: kind.hash(&body),
            kind,
            body,
        }
    }

    pub fn tree(tree: &Tree) -> Self {
        Self::new(ObjectKind::Tree, tree.to_bytes())
    }

    pub fn commit(commit: &Commit) -> Self {
        Self::new(ObjectKind::Commit, commit.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EMPTY_TREE;

    fn id(byte: u8) -> GitId {
        GitId::new([byte; 20])
    }

    #[test]
    fn test_empty_tree_id() {
        assert_eq!(Tree::default().id(), EMPTY_TREE);
    }

    #[test]
    fn test_subtree_sorts_with_trailing_slash() {
        // "foo.c" < "foo/" because '.' (0x2e) < '/' (0x2f), but "foo" as a
        // file would sort before "foo.c".
        let tree = Tree::new(vec![
            TreeEntry::new("foo", EntryMode::Tree, id(1)),
            TreeEntry::new("foo.c", EntryMode::Regular, id(2)),
            TreeEntry::new("bar", EntryMode::Executable, id(3)),
        ]);
        let names: Vec<_> = tree.entries().iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![&b"bar"[..], b"foo.c", b"foo"]);
    }

    #[test]
    fn test_tree_roundtrip_and_known_hash() {
        let blob = ObjectKind::Blob.hash(b"hello\n");
        assert_eq!(blob.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        let tree = Tree::new(vec![TreeEntry::new("hello.txt", EntryMode::Regular, blob)]);
        let parsed = Tree::parse(&tree.to_bytes(), &tree.id()).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_unknown_mode_is_kept_then_rejected() {
        let tree = Tree::new(vec![TreeEntry::new(
            "module",
            EntryMode::from_octal(0o160000),
            id(4),
        )]);
        let parsed = Tree::parse(&tree.to_bytes(), &tree.id()).unwrap();
        let mode = parsed.entries()[0].mode;
        assert_eq!(mode, EntryMode::Unsupported(0o160000));
        let err = mode.check(&tree.id(), b"module").unwrap_err();
        assert_eq!(err.kind(), "UnsupportedModeError");
    }

    #[test]
    fn test_commit_roundtrip() {
        let commit = Commit {
            tree: EMPTY_TREE,
            parents: vec![id(1), id(2)],
            author: b"A U Thor <a@example.com> 1 +0000".to_vec(),
            committer: b"C O Mitter <c@example.com> 2 -0130".to_vec(),
            message: b"subject\n\nbody\n".to_vec(),
        };
        let parsed = Commit::parse(&commit.to_bytes(), &commit.id()).unwrap();
        assert_eq!(parsed, commit);
    }

    #[test]
    fn test_commit_ignores_extra_headers() {
        let body = format!(
            "tree {}\nauthor a <> 0 +0000\ncommitter a <> 0 +0000\nencoding latin1\n\nmsg",
            EMPTY_TREE
        );
        let parsed = Commit::parse(body.as_bytes(), &GitId::NULL).unwrap();
        assert!(parsed.parents.is_empty());
        assert_eq!(parsed.message, b"msg");
    }
}
