//! Flat manifests: path -> (file node, flags)
//!
//! ## Format
//!
//! One line per path, sorted by raw path bytes:
//! `<path>\0<40 hex file node><flags>\n` where flags are empty (regular),
//! `x` (executable) or `l` (symlink).

use bitflags::bitflags;
use std::collections::BTreeMap;

use crate::error::{BridgeError, Result};
use crate::id::{HEX_LEN, HgId};

bitflags! {
    /// Per-path flags of a manifest entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileFlags: u8 {
        const EXECUTABLE = 0b01;
        const SYMLINK = 0b10;
    }
}

impl FileFlags {
    /// Parse the flag suffix of a manifest line
    pub fn parse(raw: &[u8], object: &HgId, path: &[u8]) -> Result<Self> {
        let mut flags = FileFlags::empty();
        for byte in raw {
            match byte {
                b'x' => flags |= FileFlags::EXECUTABLE,
                b'l' => flags |= FileFlags::SYMLINK,
                other => {
                    return Err(BridgeError::UnsupportedMode {
                        object: object.to_hex(),
                        path: String::from_utf8_lossy(path).into_owned(),
                        mode: format!("flag {:?}", *other as char),
                    });
                }
            }
        }
        Ok(flags)
    }

    /// Manifest suffix for these flags
    pub fn as_suffix(&self) -> &'static str {
        match (self.contains(FileFlags::EXECUTABLE), self.contains(FileFlags::SYMLINK)) {
            (false, false) => "",
            (true, false) => "x",
            (false, true) => "l",
            (true, true) => "xl",
        }
    }
}

/// A single manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManifestEntry {
    pub node: HgId,
    pub flags: FileFlags,
}

impl ManifestEntry {
    pub fn new(node: HgId, flags: FileFlags) -> Self {
        Self { node, flags }
    }
}

/// Flat path -> entry mapping, kept in canonical (byte) order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<Vec<u8>, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<Vec<u8>>, entry: ManifestEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn remove(&mut self, path: &[u8]) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &[u8]) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &ManifestEntry)> {
        self.entries.iter()
    }

    /// Parse manifest text. `id` names the manifest in errors.
    pub fn parse(text: &[u8], id: &HgId) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut previous: Option<&[u8]> = None;
        for line in text.split_inclusive(|b| *b == b'\n') {
            let line = line
                .strip_suffix(b"\n")
                .ok_or_else(|| BridgeError::malformed("manifest", id, "missing trailing newline"))?;
            let nul = line
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| {
                    BridgeError::malformed("manifest", id, "line without path separator")
                })?;
            let (path, rest) = (&line[..nul], &line[nul + 1..]);
            if path.is_empty() {
                return Err(BridgeError::malformed("manifest", id, "empty path"));
            }
            if rest.len() < HEX_LEN {
                return Err(BridgeError::malformed(
                    "manifest",
                    id,
                    format!("short node for {}", String::from_utf8_lossy(path)),
                ));
            }
            let hex = std::str::from_utf8(&rest[..HEX_LEN])
                .map_err(|_| BridgeError::malformed("manifest", id, "non-ascii node"))?;
            let node = HgId::from_hex(hex)?;
            let flags = FileFlags::parse(&rest[HEX_LEN..], id, path)?;
            if previous.is_some_and(|prev| prev >= path) {
                return Err(BridgeError::malformed(
                    "manifest",
                    id,
                    format!("path {} out of order", String::from_utf8_lossy(path)),
                ));
            }
            previous = Some(path);
            entries.insert(path.to_vec(), ManifestEntry { node, flags });
        }
        Ok(Self { entries })
    }

    /// Canonical manifest text
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 64);
        for (path, entry) in &self.entries {
            out.extend_from_slice(path);
            out.push(0);
            out.extend_from_slice(entry.node.to_hex().as_bytes());
            out.extend_from_slice(entry.flags.as_suffix().as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Paths added, removed or changed between `self` and `other`, sorted
    pub fn changed_paths(&self, other: &Manifest) -> Vec<Vec<u8>> {
        let mut changed: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|(path, entry)| other.entries.get(*path) != Some(*entry))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            other
                .entries
                .keys()
                .filter(|path| !self.entries.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        changed
    }
}

impl FromIterator<(Vec<u8>, ManifestEntry)> for Manifest {
    fn from_iter<T: IntoIterator<Item = (Vec<u8>, ManifestEntry)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> HgId {
        HgId::new([byte; 20])
    }

    #[test]
    fn test_manifest_roundtrip() {
        let mut manifest = Manifest::new();
        manifest.insert(b"bin/run".to_vec(), ManifestEntry::new(node(1), FileFlags::EXECUTABLE));
        manifest.insert(b"README".to_vec(), ManifestEntry::new(node(2), FileFlags::empty()));
        manifest.insert(b"link".to_vec(), ManifestEntry::new(node(3), FileFlags::SYMLINK));

        let text = manifest.to_bytes();
        let expected = format!(
            "README\0{}\nbin/run\0{}x\nlink\0{}l\n",
            node(2),
            node(1),
            node(3)
        );
        assert_eq!(text, expected.as_bytes());
        assert_eq!(Manifest::parse(&text, &HgId::NULL).unwrap(), manifest);
    }

    #[test]
    fn test_unknown_flag_is_unsupported_mode() {
        let text = format!("file\0{}z\n", node(1));
        let err = Manifest::parse(text.as_bytes(), &node(9)).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedModeError");
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(Manifest::parse(b"no-separator\n", &HgId::NULL).is_err());
        let unterminated = format!("file\0{}", node(1));
        assert!(Manifest::parse(unterminated.as_bytes(), &HgId::NULL).is_err());
        let unsorted = format!("b\0{}\na\0{}\n", node(1), node(2));
        assert!(Manifest::parse(unsorted.as_bytes(), &HgId::NULL).is_err());
    }

    #[test]
    fn test_changed_paths() {
        let mut old = Manifest::new();
        old.insert(b"keep".to_vec(), ManifestEntry::new(node(1), FileFlags::empty()));
        old.insert(b"gone".to_vec(), ManifestEntry::new(node(2), FileFlags::empty()));
        old.insert(b"chmod".to_vec(), ManifestEntry::new(node(3), FileFlags::empty()));

        let mut new = old.clone();
        new.remove(b"gone");
        new.insert(b"added".to_vec(), ManifestEntry::new(node(4), FileFlags::empty()));
        new.insert(b"chmod".to_vec(), ManifestEntry::new(node(3), FileFlags::EXECUTABLE));

        assert_eq!(
            new.changed_paths(&old),
            vec![b"added".to_vec(), b"chmod".to_vec(), b"gone".to_vec()]
        );
    }
}
