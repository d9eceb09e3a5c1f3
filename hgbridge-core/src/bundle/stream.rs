//! Bundle stream framing
//!
//! ## Format
//!
//! ```text
//! header:  "HGB" <version u8>
//! group:   <kind u8> <name_len u32 BE> <name> <count u32 BE> <record>*
//! record:  <id 20> <p1 20> <p2 20> <base 20> <patch_len u32 BE> <patch>
//! end:     <kind 0>
//! ```
//!
//! A stream carries one changeset group, one manifest group, then one file
//! group per path. Null ids are twenty zero bytes.

use bytes::{BufMut, Bytes, BytesMut};

use super::chain::{BaseResolver, ChainDecoder};
use crate::error::{BridgeError, Result};
use crate::id::{HgId, ID_LEN};

/// Magic bytes opening every bundle stream
pub const BUNDLE_MAGIC: &[u8; 3] = b"HGB";

/// Current stream format version
pub const BUNDLE_VERSION: u8 = 1;

/// Fixed part of a revision record (four ids and the patch length)
pub const RECORD_HEADER_LEN: usize = 4 * ID_LEN + 4;

/// Kind of content carried by a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Changeset,
    Manifest,
    File,
}

impl GroupKind {
    pub fn as_u8(self) -> u8 {
        match self {
            GroupKind::Changeset => 1,
            GroupKind::Manifest => 2,
            GroupKind::File => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Option<Self>> {
        match value {
            0 => Ok(None),
            1 => Ok(Some(GroupKind::Changeset)),
            2 => Ok(Some(GroupKind::Manifest)),
            3 => Ok(Some(GroupKind::File)),
            other => Err(BridgeError::MalformedBundle(format!(
                "unknown group kind {}",
                other
            ))),
        }
    }
}

/// One revision as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRecord {
    pub id: HgId,
    pub p1: HgId,
    pub p2: HgId,
    /// Revision the patch applies to; null means the empty text
    pub base: HgId,
    pub patch: Bytes,
}

/// A group of records, parsed lazily
#[derive(Debug, Clone)]
pub struct Group {
    pub kind: GroupKind,
    /// File path for file groups, empty otherwise
    pub name: Vec<u8>,
    count: u32,
    data: Bytes,
}

impl Group {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate raw records
    pub fn records(&self) -> RecordIter {
        RecordIter {
            data: self.data.clone(),
            pos: 0,
            remaining: self.count,
        }
    }

    /// Decode the group into full texts, one revision at a time
    pub fn decode<'a>(&self, resolver: &'a dyn BaseResolver, verify: bool) -> ChainDecoder<'a> {
        ChainDecoder::new(self.records(), resolver, verify)
    }

    /// Path of a file group as text
    pub fn path(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Iterator over the records of a group
#[derive(Debug, Clone)]
pub struct RecordIter {
    data: Bytes,
    pos: usize,
    remaining: u32,
}

impl Iterator for RecordIter {
    type Item = Result<RevisionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match read_record(&self.data, self.pos) {
            Ok((record, next)) => {
                self.pos = next;
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| BridgeError::MalformedBundle(format!("truncated length at byte {}", pos)))
}

fn read_id(data: &[u8], pos: usize) -> Result<HgId> {
    let slice = data
        .get(pos..pos + ID_LEN)
        .ok_or_else(|| BridgeError::MalformedBundle(format!("truncated id at byte {}", pos)))?;
    HgId::from_slice(slice)
}

fn read_record(data: &Bytes, pos: usize) -> Result<(RevisionRecord, usize)> {
    let id = read_id(data, pos)?;
    let p1 = read_id(data, pos + ID_LEN)?;
    let p2 = read_id(data, pos + 2 * ID_LEN)?;
    let base = read_id(data, pos + 3 * ID_LEN)?;
    let patch_len = read_u32(data, pos + 4 * ID_LEN)? as usize;
    let start = pos + RECORD_HEADER_LEN;
    let end = start
        .checked_add(patch_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            BridgeError::MalformedBundle(format!(
                "patch of revision {} runs past end of stream",
                id
            ))
        })?;
    let record = RevisionRecord {
        id,
        p1,
        p2,
        base,
        patch: data.slice(start..end),
    };
    Ok((record, end))
}

/// Reader splitting a stream into groups
pub struct BundleReader {
    data: Bytes,
    pos: usize,
    done: bool,
}

impl BundleReader {
    /// Validate the header and position at the first group
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 || &data[..3] != BUNDLE_MAGIC {
            return Err(BridgeError::MalformedBundle("missing bundle header".to_string()));
        }
        if data[3] != BUNDLE_VERSION {
            return Err(BridgeError::MalformedBundle(format!(
                "unsupported bundle version {}",
                data[3]
            )));
        }
        Ok(Self {
            data,
            pos: 4,
            done: false,
        })
    }

    fn next_group(&mut self) -> Result<Option<Group>> {
        let kind_byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| {
                BridgeError::MalformedBundle("missing end-of-stream marker".to_string())
            })?;
        self.pos += 1;
        let Some(kind) = GroupKind::from_u8(kind_byte)? else {
            return Ok(None);
        };

        let name_len = read_u32(&self.data, self.pos)? as usize;
        self.pos += 4;
        let name = self
            .data
            .get(self.pos..self.pos + name_len)
            .ok_or_else(|| BridgeError::MalformedBundle("truncated group name".to_string()))?
            .to_vec();
        self.pos += name_len;

        let count = read_u32(&self.data, self.pos)?;
        self.pos += 4;

        // Walk the records once to find where the group ends.
        let start = self.pos;
        let mut end = start;
        for _ in 0..count {
            let (_, next) = read_record(&self.data, end)?;
            end = next;
        }
        self.pos = end;

        Ok(Some(Group {
            kind,
            name,
            count,
            data: self.data.slice(start..end),
        }))
    }
}

impl Iterator for BundleReader {
    type Item = Result<Group>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_group() {
            Ok(Some(group)) => Some(Ok(group)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A complete bundle split into its three sections
#[derive(Debug, Clone)]
pub struct Bundle {
    pub changesets: Group,
    pub manifests: Group,
    pub files: Vec<Group>,
}

impl Bundle {
    /// Split a stream, enforcing the changeset, manifest, files order
    pub fn parse(data: Bytes) -> Result<Self> {
        let mut groups = BundleReader::new(data)?;
        let changesets = expect_group(groups.next(), GroupKind::Changeset)?;
        let manifests = expect_group(groups.next(), GroupKind::Manifest)?;
        let mut files = Vec::new();
        for group in groups {
            let group = group?;
            if group.kind != GroupKind::File {
                return Err(BridgeError::MalformedBundle(format!(
                    "unexpected {:?} group after manifests",
                    group.kind
                )));
            }
            files.push(group);
        }
        Ok(Self {
            changesets,
            manifests,
            files,
        })
    }

    /// Number of revisions across all groups
    pub fn revision_count(&self) -> usize {
        self.changesets.len()
            + self.manifests.len()
            + self.files.iter().map(Group::len).sum::<usize>()
    }
}

fn expect_group(group: Option<Result<Group>>, kind: GroupKind) -> Result<Group> {
    match group {
        Some(Ok(group)) if group.kind == kind => Ok(group),
        Some(Ok(group)) => Err(BridgeError::MalformedBundle(format!(
            "expected {:?} group, found {:?}",
            kind, group.kind
        ))),
        Some(Err(e)) => Err(e),
        None => Err(BridgeError::MalformedBundle(format!("missing {:?} group", kind))),
    }
}

/// Incremental writer for bundle streams
pub struct BundleWriter {
    buf: BytesMut,
}

impl BundleWriter {
    pub fn new() -> Self {
        let mut buf = BytesMut::new();
        buf.put_slice(BUNDLE_MAGIC);
        buf.put_u8(BUNDLE_VERSION);
        Self { buf }
    }

    /// Append a group of already-encoded records
    pub fn write_group(&mut self, kind: GroupKind, name: &[u8], records: &[RevisionRecord]) {
        self.buf.put_u8(kind.as_u8());
        self.buf.put_u32(name.len() as u32);
        self.buf.put_slice(name);
        self.buf.put_u32(records.len() as u32);
        for record in records {
            self.buf.put_slice(record.id.as_bytes());
            self.buf.put_slice(record.p1.as_bytes());
            self.buf.put_slice(record.p2.as_bytes());
            self.buf.put_slice(record.base.as_bytes());
            self.buf.put_u32(record.patch.len() as u32);
            self.buf.put_slice(&record.patch);
        }
    }

    /// Write the end-of-stream marker
    pub fn finish(mut self) -> Bytes {
        self.buf.put_u8(0);
        self.buf.freeze()
    }
}

impl Default for BundleWriter {
    fn default() -> Self {
        Self::new()
    }
}
