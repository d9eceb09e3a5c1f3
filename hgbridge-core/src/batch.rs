//! Batch buffer: everything a fetch or push produces before the commit point
//!
//! Translation never writes to the stores directly. Git objects, hg texts
//! and mapping entries are staged here and become durable in a fixed order:
//! git objects, then hg texts, then the mapping log append. The append is
//! the commit point; objects written before a failed append are inert.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::bundle::{BaseResolver, FullRevision};
use crate::error::{BridgeError, Result};
use crate::hg_store::SourceStore;
use crate::id::{GitId, HgId};
use crate::mapping::{CorrespondenceStore, MappingEntry, PendingIndex, Recorded};
use crate::object::{ObjectKind, RawObject};
use crate::storage::TargetStore;

/// What an hg revision is, for grouping on the way out
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RevisionKind {
    Changeset,
    Manifest,
    File(Vec<u8>),
}

/// Staged hg revisions grouped by kind, in staging order
#[derive(Debug, Clone, Default)]
pub struct Outgoing {
    pub changesets: Vec<FullRevision>,
    pub manifests: Vec<FullRevision>,
    pub files: BTreeMap<Vec<u8>, Vec<FullRevision>>,
}

#[derive(Default)]
struct ObjectLayer {
    by_id: HashMap<GitId, RawObject>,
    order: Vec<GitId>,
}

/// Texts are keyed by node; placement is keyed by kind and node, so one
/// file node shared by several paths goes out under each of them.
#[derive(Default)]
struct RevisionLayer {
    by_id: HashMap<HgId, FullRevision>,
    placed: HashSet<(RevisionKind, HgId)>,
    order: Vec<(RevisionKind, HgId)>,
}

struct MappingLayer {
    pending: PendingIndex,
    entries: Vec<MappingEntry>,
}

/// Counts of what a commit wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub objects: usize,
    pub revisions: usize,
    pub mappings: usize,
}

/// Pending work of one fetch or push
pub struct BatchBuffer {
    objects: RwLock<ObjectLayer>,
    revisions: RwLock<RevisionLayer>,
    mapping: RwLock<MappingLayer>,
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(ObjectLayer::default()),
            revisions: RwLock::new(RevisionLayer::default()),
            mapping: RwLock::new(MappingLayer {
                pending: PendingIndex::new(),
                entries: Vec::new(),
            }),
        }
    }

    pub fn put_object(&self, object: RawObject) -> GitId {
        let id = object.id;
        let mut layer = self.objects.write();
        if !layer.by_id.contains_key(&id) {
            layer.order.push(id);
            layer.by_id.insert(id, object);
        }
        id
    }

    pub fn get_object(&self, id: &GitId) -> Option<RawObject> {
        self.objects.read().by_id.get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().order.len()
    }

    pub fn put_revision(&self, kind: RevisionKind, revision: FullRevision) {
        let mut layer = self.revisions.write();
        if layer.placed.insert((kind.clone(), revision.id)) {
            layer.order.push((kind, revision.id));
        }
        layer.by_id.entry(revision.id).or_insert(revision);
    }

    pub fn revision(&self, id: &HgId) -> Option<FullRevision> {
        self.revisions.read().by_id.get(id).cloned()
    }

    pub fn revision_count(&self) -> usize {
        self.revisions.read().by_id.len()
    }

    /// Staged revision, falling back to the source store
    pub fn revision_or_stored(&self, id: &HgId, source: &dyn SourceStore) -> Result<FullRevision> {
        match self.revision(id) {
            Some(revision) => Ok(revision),
            None => source.require(id),
        }
    }

    /// Staged revisions grouped for bundle encoding
    pub fn outgoing(&self) -> Outgoing {
        let layer = self.revisions.read();
        let mut outgoing = Outgoing::default();
        for (kind, id) in &layer.order {
            let Some(revision) = layer.by_id.get(id).cloned() else {
                continue;
            };
            match kind {
                RevisionKind::Changeset => outgoing.changesets.push(revision),
                RevisionKind::Manifest => outgoing.manifests.push(revision),
                RevisionKind::File(path) => {
                    outgoing.files.entry(path.clone()).or_default().push(revision)
                }
            }
        }
        outgoing
    }

    /// Stage a mapping entry, checking it against the store and the batch
    pub fn stage(&self, mapping: &CorrespondenceStore, entry: MappingEntry) -> Result<Recorded> {
        let mut layer = self.mapping.write();
        let recorded = mapping.check_pending(&layer.pending, &entry)?;
        if recorded == Recorded::New {
            layer.pending.insert(&entry);
            layer.entries.push(entry);
        }
        Ok(recorded)
    }

    pub fn lookup_forward(&self, mapping: &CorrespondenceStore, hg: &HgId) -> Option<GitId> {
        self.mapping
            .read()
            .pending
            .lookup_forward(hg)
            .or_else(|| mapping.lookup_forward(hg))
    }

    pub fn lookup_reverse(&self, mapping: &CorrespondenceStore, git: &GitId) -> Option<HgId> {
        self.mapping
            .read()
            .pending
            .lookup_reverse(git)
            .or_else(|| mapping.lookup_reverse(git))
    }

    /// Whether an hg id is staged or recorded as synthetic
    pub fn is_synthetic(&self, mapping: &CorrespondenceStore, hg: &HgId) -> bool {
        self.mapping
            .read()
            .pending
            .is_synthetic(hg)
            .unwrap_or_else(|| mapping.is_synthetic(hg))
    }

    pub fn staged_entries(&self) -> Vec<MappingEntry> {
        self.mapping.read().entries.clone()
    }

    /// Write git objects, then hg texts. Nothing becomes visible yet.
    pub fn write_objects(
        &self,
        target: &dyn TargetStore,
        source: &dyn SourceStore,
    ) -> Result<usize> {
        let objects = self.objects.read();
        for id in &objects.order {
            if let Some(object) = objects.by_id.get(id) {
                target.put_object(object)?;
            }
        }
        let revisions = self.revisions.read();
        let mut written = HashSet::with_capacity(revisions.by_id.len());
        for (_, id) in &revisions.order {
            if !written.insert(*id) {
                continue;
            }
            if let Some(revision) = revisions.by_id.get(id) {
                source.put(revision)?;
            }
        }
        Ok(objects.order.len() + written.len())
    }

    /// Append the staged entries to the mapping log: the commit point
    pub fn write_index(&self, mapping: &CorrespondenceStore) -> Result<usize> {
        mapping.append_batch(&self.mapping.read().entries)
    }

    /// Write everything, retrying the index append `retries` times
    pub fn commit(
        &self,
        target: &dyn TargetStore,
        source: &dyn SourceStore,
        mapping: &CorrespondenceStore,
        retries: u32,
    ) -> Result<CommitSummary> {
        self.commit_with(target, source, retries, |entries| mapping.append_batch(entries))
    }

    pub(crate) fn commit_with<F>(
        &self,
        target: &dyn TargetStore,
        source: &dyn SourceStore,
        retries: u32,
        mut write_index: F,
    ) -> Result<CommitSummary>
    where
        F: FnMut(&[MappingEntry]) -> Result<usize>,
    {
        let written = self.write_objects(target, source)?;
        let entries = self.staged_entries();

        let mut attempt = 0;
        let mappings = loop {
            match write_index(&entries) {
                Ok(count) => break count,
                Err(err) if attempt < retries => {
                    attempt += 1;
                    tracing::warn!(attempt, "mapping append failed, retrying: {}", err);
                }
                Err(err) => {
                    return Err(BridgeError::PartialCommit {
                        objects: written,
                        source: Box::new(err),
                    });
                }
            }
        };

        Ok(CommitSummary {
            objects: self.object_count(),
            revisions: self.revision_count(),
            mappings,
        })
    }

    /// Read view over staged hg texts backed by a source store
    pub fn texts<'a>(&'a self, source: &'a dyn SourceStore) -> StagedTexts<'a> {
        StagedTexts { batch: self, source }
    }

    /// Object store view: writes stay in the batch, reads fall through
    pub fn objects<'a>(&'a self, target: &'a dyn TargetStore) -> StagedObjects<'a> {
        StagedObjects { batch: self, target }
    }
}

/// Staged and stored hg texts, for delta bases and translation
pub struct StagedTexts<'a> {
    batch: &'a BatchBuffer,
    source: &'a dyn SourceStore,
}

impl StagedTexts<'_> {
    pub fn revision(&self, id: &HgId) -> Result<Option<FullRevision>> {
        match self.batch.revision(id) {
            Some(revision) => Ok(Some(revision)),
            None => self.source.get(id),
        }
    }
}

impl BaseResolver for StagedTexts<'_> {
    fn full_text(&self, id: &HgId) -> Result<Option<Bytes>> {
        Ok(self.revision(id)?.map(|revision| revision.text))
    }
}

/// Target store view layering the batch over the real store
pub struct StagedObjects<'a> {
    batch: &'a BatchBuffer,
    target: &'a dyn TargetStore,
}

impl TargetStore for StagedObjects<'_> {
    fn put_raw(&self, kind: ObjectKind, body: Bytes) -> Result<GitId> {
        Ok(self.batch.put_object(RawObject::new(kind, body)))
    }

    fn get(&self, id: &GitId) -> Result<(ObjectKind, Bytes)> {
        match self.batch.get_object(id) {
            Some(object) => Ok((object.kind, object.body)),
            None => self.target.get(id),
        }
    }

    fn contains(&self, id: &GitId) -> Result<bool> {
        Ok(self.batch.get_object(id).is_some() || self.target.contains(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hg_store::MemorySourceStore;
    use crate::storage::MemoryTargetStore;
    use tempfile::TempDir;

    fn setup() -> (TempDir, MemoryTargetStore, MemorySourceStore, CorrespondenceStore) {
        let dir = TempDir::new().unwrap();
        let mapping = CorrespondenceStore::open(dir.path().join("mapping.log")).unwrap();
        (dir, MemoryTargetStore::new(), MemorySourceStore::new(), mapping)
    }

    #[test]
    fn test_nothing_visible_before_commit() {
        let (_dir, target, source, mapping) = setup();
        let batch = BatchBuffer::new();
        let blob = batch.put_object(RawObject::new(ObjectKind::Blob, "data"));
        let revision = FullRevision::new(HgId::NULL, HgId::NULL, "text");
        batch.put_revision(RevisionKind::Changeset, revision.clone());
        batch.stage(&mapping, MappingEntry::real(revision.id, blob)).unwrap();

        assert_eq!(batch.lookup_forward(&mapping, &revision.id), Some(blob));
        assert!(!target.contains(&blob).unwrap());
        assert!(!mapping.contains_forward(&revision.id));

        let summary = batch.commit(&target, &source, &mapping, 0).unwrap();
        assert_eq!(summary.mappings, 1);
        assert!(target.contains(&blob).unwrap());
        assert!(source.contains(&revision.id).unwrap());
        assert_eq!(mapping.lookup_reverse(&blob), Some(revision.id));
    }

    #[test]
    fn test_staging_detects_conflicts_within_batch() {
        let (_dir, _target, _source, mapping) = setup();
        let batch = BatchBuffer::new();
        let git = GitId::new([1u8; 20]);
        batch
            .stage(&mapping, MappingEntry::real(HgId::new([1u8; 20]), git))
            .unwrap();
        let err = batch
            .stage(&mapping, MappingEntry::real(HgId::new([2u8; 20]), git))
            .unwrap_err();
        assert_eq!(err.kind(), "ConflictError");
    }

    #[test]
    fn test_index_failure_is_partial_commit() {
        let (_dir, target, source, mapping) = setup();
        let batch = BatchBuffer::new();
        let blob = batch.put_object(RawObject::new(ObjectKind::Blob, "x"));
        batch
            .stage(&mapping, MappingEntry::real(HgId::new([1u8; 20]), blob))
            .unwrap();

        let err = batch
            .commit_with(&target, &source, 2, |_| {
                Err(BridgeError::Io(std::io::Error::other("disk full")))
            })
            .unwrap_err();
        assert!(err.objects_written());
        assert!(target.contains(&blob).unwrap());
        assert!(mapping.is_empty());

        // A transient failure is retried
        let mut failures = 1;
        let summary = batch
            .commit_with(&target, &source, 2, |entries| {
                if failures > 0 {
                    failures -= 1;
                    return Err(BridgeError::Io(std::io::Error::other("busy")));
                }
                mapping.append_batch(entries)
            })
            .unwrap();
        assert_eq!(summary.mappings, 1);
    }

    #[test]
    fn test_outgoing_groups_by_kind() {
        let batch = BatchBuffer::new();
        let file = FullRevision::new(HgId::NULL, HgId::NULL, "f");
        let manifest = FullRevision::new(HgId::NULL, HgId::NULL, "m");
        let changeset = FullRevision::new(HgId::NULL, HgId::NULL, "c");
        batch.put_revision(RevisionKind::File(b"a".to_vec()), file.clone());
        batch.put_revision(RevisionKind::Manifest, manifest.clone());
        batch.put_revision(RevisionKind::Changeset, changeset.clone());

        let outgoing = batch.outgoing();
        assert_eq!(outgoing.changesets, vec![changeset]);
        assert_eq!(outgoing.manifests, vec![manifest]);
        assert_eq!(outgoing.files[&b"a".to_vec()], vec![file]);
    }

    #[test]
    fn test_shared_file_node_goes_out_under_every_path() {
        let (_dir, target, source, mapping) = setup();
        let batch = BatchBuffer::new();
        let file = FullRevision::new(HgId::NULL, HgId::NULL, "same\n");
        batch.put_revision(RevisionKind::File(b"a".to_vec()), file.clone());
        batch.put_revision(RevisionKind::File(b"b".to_vec()), file.clone());
        batch.put_revision(RevisionKind::File(b"b".to_vec()), file.clone());

        let outgoing = batch.outgoing();
        assert_eq!(outgoing.files.len(), 2);
        assert_eq!(outgoing.files[&b"a".to_vec()], vec![file.clone()]);
        assert_eq!(outgoing.files[&b"b".to_vec()], vec![file.clone()]);

        let summary = batch.commit(&target, &source, &mapping, 0).unwrap();
        assert_eq!(summary.revisions, 1);
        assert!(source.contains(&file.id).unwrap());
    }
}
