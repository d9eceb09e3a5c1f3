//! Correspondence store: bidirectional hg <-> git commit mapping
//!
//! ## Log format
//!
//! `mapping.log` is append-only, a sequence of fixed 41-byte records:
//!
//! ```text
//! <hg id 20> <git id 20> <flags u8>
//! ```
//!
//! Flag bit 0 marks a synthetic entry (an hg changeset that stands in for
//! part of a git commit; forward-only). Bit 1 marks the last record of a
//! batch. A batch becomes visible only once its end marker is on disk:
//! records after the last marker are a torn write and are cut off on open.
//!
//! The bidirectional index lives in memory and is rebuilt from the log.

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::id::{GitId, HEX_LEN, HgId, ID_LEN};

/// Size of one log record
pub const RECORD_LEN: usize = 2 * ID_LEN + 1;

/// Shortest accepted abbreviated id
pub const MIN_ABBREV: usize = 3;

bitflags! {
    /// Per-record flags in the log
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        const SYNTHETIC = 0b01;
        const BATCH_END = 0b10;
    }
}

/// One correspondence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingEntry {
    pub hg: HgId,
    pub git: GitId,
    pub synthetic: bool,
}

impl MappingEntry {
    pub fn real(hg: HgId, git: GitId) -> Self {
        Self {
            hg,
            git,
            synthetic: false,
        }
    }

    pub fn synthetic(hg: HgId, git: GitId) -> Self {
        Self {
            hg,
            git,
            synthetic: true,
        }
    }

    fn encode(&self, batch_end: bool, out: &mut Vec<u8>) {
        let mut flags = RecordFlags::empty();
        flags.set(RecordFlags::SYNTHETIC, self.synthetic);
        flags.set(RecordFlags::BATCH_END, batch_end);
        out.extend_from_slice(self.hg.as_bytes());
        out.extend_from_slice(self.git.as_bytes());
        out.push(flags.bits());
    }

    fn decode(record: &[u8]) -> Result<(Self, RecordFlags)> {
        let flags = RecordFlags::from_bits(record[2 * ID_LEN]).ok_or_else(|| {
            BridgeError::malformed(
                "mapping record",
                "log",
                format!("unknown flags {:#x}", record[2 * ID_LEN]),
            )
        })?;
        let entry = Self {
            hg: HgId::from_slice(&record[..ID_LEN])?,
            git: GitId::from_slice(&record[ID_LEN..2 * ID_LEN])?,
            synthetic: flags.contains(RecordFlags::SYNTHETIC),
        };
        Ok((entry, flags))
    }
}

/// Outcome of recording an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New,
    /// The same entry was already present
    Existing,
}

#[derive(Debug, Clone, Copy)]
struct Target {
    git: GitId,
    synthetic: bool,
}

#[derive(Debug, Default)]
struct Index {
    forward: HashMap<HgId, Target>,
    /// Real entries only
    reverse: HashMap<GitId, HgId>,
}

impl Index {
    fn insert(&mut self, entry: &MappingEntry) {
        self.forward.entry(entry.hg).or_insert(Target {
            git: entry.git,
            synthetic: entry.synthetic,
        });
        if !entry.synthetic {
            self.reverse.entry(entry.git).or_insert(entry.hg);
        }
    }

    fn forward(&self, hg: &HgId) -> Option<Target> {
        self.forward.get(hg).copied()
    }
}

/// Classify an entry against one or more index layers
fn check(layers: &[&Index], entry: &MappingEntry) -> Result<Recorded> {
    let conflict = |existing: String| BridgeError::Conflict {
        hg: entry.hg,
        git: entry.git,
        existing,
    };

    if let Some(target) = layers.iter().find_map(|index| index.forward(&entry.hg)) {
        if target.git != entry.git || target.synthetic != entry.synthetic {
            return Err(conflict(format!(
                "{} {} -> {}",
                if target.synthetic { "synthetic" } else { "real" },
                entry.hg,
                target.git
            )));
        }
        return Ok(Recorded::Existing);
    }
    if !entry.synthetic {
        if let Some(hg) = layers.iter().find_map(|index| index.reverse.get(&entry.git)) {
            if *hg != entry.hg {
                return Err(conflict(format!("{} -> {}", hg, entry.git)));
            }
        }
    }
    Ok(Recorded::New)
}

/// Entries staged by a batch but not yet in the log
pub(crate) struct PendingIndex(Index);

impl PendingIndex {
    pub(crate) fn new() -> Self {
        PendingIndex(Index::default())
    }

    pub(crate) fn insert(&mut self, entry: &MappingEntry) {
        self.0.insert(entry);
    }

    pub(crate) fn lookup_forward(&self, hg: &HgId) -> Option<GitId> {
        self.0.forward(hg).map(|t| t.git)
    }

    pub(crate) fn lookup_reverse(&self, git: &GitId) -> Option<HgId> {
        self.0.reverse.get(git).copied()
    }

    /// `None` when the id is not staged at all
    pub(crate) fn is_synthetic(&self, hg: &HgId) -> Option<bool> {
        self.0.forward(hg).map(|t| t.synthetic)
    }
}

/// Result of a full-log consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub records: usize,
    pub real: usize,
    pub synthetic: usize,
    /// hg ids recorded with more than one target
    pub forward_conflicts: Vec<(HgId, GitId, GitId)>,
    /// git ids recorded for more than one real hg id
    pub reverse_conflicts: Vec<(GitId, HgId, HgId)>,
    /// Synthetic entries whose git commit has no real counterpart
    pub dangling_synthetic: Vec<MappingEntry>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.forward_conflicts.is_empty()
            && self.reverse_conflicts.is_empty()
            && self.dangling_synthetic.is_empty()
    }
}

/// Persistent bidirectional mapping
pub struct CorrespondenceStore {
    path: PathBuf,
    log: Mutex<File>,
    index: RwLock<Index>,
}

impl CorrespondenceStore {
    /// Open or create the log, dropping any torn tail
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let entries = read_committed(&data)?;
        let committed_len = (entries.len() * RECORD_LEN) as u64;

        if committed_len < data.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = data.len() as u64 - committed_len,
                "discarding uncommitted mapping records"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(committed_len)?;
            file.sync_all()?;
        }

        let mut index = Index::default();
        for entry in &entries {
            index.insert(entry);
        }
        tracing::debug!(path = %path.display(), records = entries.len(), "opened mapping log");

        let log = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            log: Mutex::new(log),
            index: RwLock::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Git counterpart of an hg changeset, synthetic entries included
    pub fn lookup_forward(&self, hg: &HgId) -> Option<GitId> {
        self.index.read().forward(hg).map(|t| t.git)
    }

    /// hg counterpart of a git commit, real entries only
    pub fn lookup_reverse(&self, git: &GitId) -> Option<HgId> {
        self.index.read().reverse.get(git).copied()
    }

    pub fn contains_forward(&self, hg: &HgId) -> bool {
        self.index.read().forward.contains_key(hg)
    }

    pub fn contains_reverse(&self, git: &GitId) -> bool {
        self.index.read().reverse.contains_key(git)
    }

    /// Whether an hg id is recorded as synthetic
    pub fn is_synthetic(&self, hg: &HgId) -> bool {
        self.index.read().forward(hg).is_some_and(|t| t.synthetic)
    }

    /// Bulk forward lookup under a single read lock
    pub fn lookup_many_forward(&self, ids: &[HgId]) -> Vec<Option<GitId>> {
        let index = self.index.read();
        ids.iter().map(|id| index.forward(id).map(|t| t.git)).collect()
    }

    /// Number of hg ids with a counterpart
    pub fn len(&self) -> usize {
        self.index.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classify an entry against the store and a caller's pending layer
    pub(crate) fn check_pending(
        &self,
        pending: &PendingIndex,
        entry: &MappingEntry,
    ) -> Result<Recorded> {
        let index = self.index.read();
        check(&[&pending.0, &index], entry)
    }

    /// Record a real entry as its own batch
    pub fn record(&self, hg: HgId, git: GitId) -> Result<Recorded> {
        let written = self.append_batch(&[MappingEntry::real(hg, git)])?;
        Ok(if written == 0 {
            Recorded::Existing
        } else {
            Recorded::New
        })
    }

    /// Record a forward-only synthetic entry as its own batch
    pub fn record_synthetic(&self, hg: HgId, git: GitId) -> Result<Recorded> {
        let written = self.append_batch(&[MappingEntry::synthetic(hg, git)])?;
        Ok(if written == 0 {
            Recorded::Existing
        } else {
            Recorded::New
        })
    }

    /// Append entries atomically. Entries already present are skipped; any
    /// conflict rejects the whole batch before anything is written. Returns
    /// the number of records written.
    pub fn append_batch(&self, entries: &[MappingEntry]) -> Result<usize> {
        self.append_batch_with(entries, |log, buf| log.write_all(buf))
    }

    /// [`append_batch`](Self::append_batch) with the raw write supplied by
    /// the caller. A failed write or sync cuts the log back to its previous
    /// length so later records stay aligned.
    pub(crate) fn append_batch_with<W>(&self, entries: &[MappingEntry], write: W) -> Result<usize>
    where
        W: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
    {
        let mut log = self.log.lock();
        let mut staged = Index::default();
        let mut fresh = Vec::new();
        {
            let index = self.index.read();
            for entry in entries {
                if check(&[&staged, &index], entry)? == Recorded::New {
                    staged.insert(entry);
                    fresh.push(*entry);
                }
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::with_capacity(fresh.len() * RECORD_LEN);
        for (i, entry) in fresh.iter().enumerate() {
            entry.encode(i + 1 == fresh.len(), &mut buf);
        }
        let committed_len = log.metadata()?.len();
        if let Err(err) = write(&mut *log, &buf[..]).and_then(|()| log.sync_data()) {
            tracing::warn!(committed_len, "mapping append failed, truncating: {}", err);
            log.set_len(committed_len)?;
            log.sync_data()?;
            return Err(err.into());
        }

        let mut index = self.index.write();
        for entry in &fresh {
            index.insert(entry);
        }
        tracing::debug!(records = fresh.len(), "appended mapping batch");
        Ok(fresh.len())
    }

    /// Resolve an abbreviated hg id to the unique recorded id
    pub fn resolve_abbrev(&self, prefix: &str) -> Result<HgId> {
        let index = self.index.read();
        resolve_prefix(prefix, index.forward.keys(), HgId::to_hex, HgId::from_hex)
    }

    /// Resolve an abbreviated git id among commits with a real counterpart
    pub fn resolve_git_abbrev(&self, prefix: &str) -> Result<GitId> {
        let index = self.index.read();
        resolve_prefix(prefix, index.reverse.keys(), GitId::to_hex, GitId::from_hex)
    }

    /// Check injectivity over the whole committed log
    pub fn audit(&self) -> Result<AuditReport> {
        let _guard = self.log.lock();
        let entries = read_committed(&fs::read(&self.path)?)?;

        let mut report = AuditReport {
            records: entries.len(),
            ..AuditReport::default()
        };
        let mut forward: HashMap<HgId, GitId> = HashMap::new();
        let mut reverse: HashMap<GitId, HgId> = HashMap::new();

        for entry in &entries {
            if entry.synthetic {
                report.synthetic += 1;
            } else {
                report.real += 1;
            }
            let first = *forward.entry(entry.hg).or_insert(entry.git);
            if first != entry.git {
                report.forward_conflicts.push((entry.hg, first, entry.git));
            }
            if !entry.synthetic {
                let first = *reverse.entry(entry.git).or_insert(entry.hg);
                if first != entry.hg {
                    report.reverse_conflicts.push((entry.git, first, entry.hg));
                }
            }
        }
        report.dangling_synthetic = entries
            .iter()
            .filter(|e| e.synthetic && !reverse.contains_key(&e.git))
            .copied()
            .collect();

        Ok(report)
    }
}

/// Decode the records up to and including the last batch-end marker
fn read_committed(data: &[u8]) -> Result<Vec<MappingEntry>> {
    let mut entries = Vec::with_capacity(data.len() / RECORD_LEN);
    let mut committed = 0;
    for record in data.chunks_exact(RECORD_LEN) {
        let (entry, flags) = MappingEntry::decode(record)?;
        entries.push(entry);
        if flags.contains(RecordFlags::BATCH_END) {
            committed = entries.len();
        }
    }
    entries.truncate(committed);
    Ok(entries)
}

fn resolve_prefix<'a, T: Copy + 'a>(
    prefix: &str,
    candidates: impl Iterator<Item = &'a T>,
    to_hex: fn(&T) -> String,
    from_hex: fn(&str) -> Result<T>,
) -> Result<T> {
    let prefix = prefix.to_ascii_lowercase();
    if prefix.len() == HEX_LEN {
        return from_hex(&prefix);
    }
    if prefix.len() < MIN_ABBREV
        || prefix.len() > HEX_LEN
        || !prefix.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(BridgeError::InvalidId(prefix));
    }
    let mut found = None;
    for candidate in candidates {
        if to_hex(candidate).starts_with(&prefix) {
            if found.is_some() {
                return Err(BridgeError::AmbiguousId(prefix));
            }
            found = Some(*candidate);
        }
    }
    found.ok_or(BridgeError::NotFound(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hg(byte: u8) -> HgId {
        HgId::new([byte; 20])
    }

    fn git(byte: u8) -> GitId {
        GitId::new([byte; 20])
    }

    #[test]
    fn test_record_and_lookup() {
        let dir = TempDir::new().unwrap();
        let store = CorrespondenceStore::open(dir.path().join("mapping.log")).unwrap();
        assert_eq!(store.record(hg(1), git(1)).unwrap(), Recorded::New);
        assert_eq!(store.record(hg(1), git(1)).unwrap(), Recorded::Existing);
        assert_eq!(store.lookup_forward(&hg(1)), Some(git(1)));
        assert_eq!(store.lookup_reverse(&git(1)), Some(hg(1)));
        assert!(store.contains_forward(&hg(1)));
        assert!(!store.contains_reverse(&git(2)));
        assert_eq!(
            store.lookup_many_forward(&[hg(1), hg(2)]),
            vec![Some(git(1)), None]
        );
    }

    #[test]
    fn test_conflicts_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CorrespondenceStore::open(dir.path().join("mapping.log")).unwrap();
        store.record(hg(1), git(1)).unwrap();

        let err = store.record(hg(1), git(2)).unwrap_err();
        assert_eq!(err.kind(), "ConflictError");
        let err = store.record(hg(2), git(1)).unwrap_err();
        assert_eq!(err.kind(), "ConflictError");

        // A conflicting batch writes nothing
        let err = store
            .append_batch(&[MappingEntry::real(hg(3), git(3)), MappingEntry::real(hg(4), git(3))])
            .unwrap_err();
        assert_eq!(err.kind(), "ConflictError");
        assert!(!store.contains_forward(&hg(3)));
    }

    #[test]
    fn test_synthetic_entries_are_forward_only() {
        let dir = TempDir::new().unwrap();
        let store = CorrespondenceStore::open(dir.path().join("mapping.log")).unwrap();
        store.record_synthetic(hg(1), git(9)).unwrap();
        store.record_synthetic(hg(2), git(9)).unwrap();
        store.record(hg(3), git(9)).unwrap();

        assert_eq!(store.lookup_forward(&hg(1)), Some(git(9)));
        assert!(store.is_synthetic(&hg(2)));
        assert_eq!(store.lookup_reverse(&git(9)), Some(hg(3)));
        assert!(store.audit().unwrap().is_clean());
    }

    #[test]
    fn test_dangling_synthetic_reported() {
        let dir = TempDir::new().unwrap();
        let store = CorrespondenceStore::open(dir.path().join("mapping.log")).unwrap();
        store.record_synthetic(hg(1), git(9)).unwrap();
        let report = store.audit().unwrap();
        assert_eq!(report.synthetic, 1);
        assert_eq!(report.dangling_synthetic, vec![MappingEntry::synthetic(hg(1), git(9))]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_reopen_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mapping.log");
        {
            let store = CorrespondenceStore::open(&path).unwrap();
            store
                .append_batch(&[
                    MappingEntry::real(hg(1), git(1)),
                    MappingEntry::real(hg(2), git(2)),
                ])
                .unwrap();
        }
        // A batch whose end marker never made it, plus half a record
        let mut tail = Vec::new();
        MappingEntry::real(hg(3), git(3)).encode(false, &mut tail);
        tail.extend_from_slice(&[0u8; 10]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&tail).unwrap();
        drop(file);

        let store = CorrespondenceStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.contains_forward(&hg(3)));
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * RECORD_LEN as u64);

        // The log stays appendable after truncation
        store.record(hg(3), git(3)).unwrap();
        drop(store);
        let store = CorrespondenceStore::open(&path).unwrap();
        assert_eq!(store.lookup_forward(&hg(3)), Some(git(3)));
    }

    #[test]
    fn test_short_write_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mapping.log");
        let store = CorrespondenceStore::open(&path).unwrap();
        store.record(hg(1), git(1)).unwrap();

        let err = store
            .append_batch_with(&[MappingEntry::real(hg(2), git(2))], |log, buf| {
                log.write_all(&buf[..20])?;
                Err(std::io::Error::other("no space left on device"))
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(!store.contains_forward(&hg(2)));
        assert_eq!(fs::metadata(&path).unwrap().len(), RECORD_LEN as u64);

        // The retry lands on a record boundary
        store.append_batch(&[MappingEntry::real(hg(2), git(2))]).unwrap();
        drop(store);
        let store = CorrespondenceStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup_forward(&hg(2)), Some(git(2)));
        assert!(store.audit().unwrap().is_clean());
    }

    #[test]
    fn test_resolve_abbrev() {
        let dir = TempDir::new().unwrap();
        let store = CorrespondenceStore::open(dir.path().join("mapping.log")).unwrap();
        let a = HgId::from_hex("abcdef0000000000000000000000000000000000").unwrap();
        let b = HgId::from_hex("abcd120000000000000000000000000000000000").unwrap();
        store.record(a, git(1)).unwrap();
        store.record(b, git(2)).unwrap();

        assert_eq!(store.resolve_abbrev("abcde").unwrap(), a);
        assert_eq!(store.resolve_abbrev("ABCD1").unwrap(), b);
        assert_eq!(store.resolve_abbrev("abc").unwrap_err().kind(), "AmbiguousIdError");
        assert_eq!(store.resolve_abbrev("ab").unwrap_err().kind(), "InvalidIdError");
        assert_eq!(store.resolve_abbrev("fff").unwrap_err().kind(), "NotFoundError");
        assert_eq!(store.resolve_git_abbrev(&git(2).to_hex()[..6]).unwrap(), git(2));
    }
}
