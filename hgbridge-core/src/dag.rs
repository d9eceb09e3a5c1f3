//! DAG translation between hg changesets and git commits
//!
//! Forward (fetch): an hg changeset whose parents are already mapped becomes
//! a git commit. Backward (push): a git commit whose parents are already
//! mapped becomes one or more hg changesets.
//!
//! Everything is staged in a [`BatchBuffer`]; the stores are only read.
//!
//! ## Shape mismatches
//!
//! hg changesets have at most two parents. A git commit with `k > 2`
//! parents becomes `k - 1` synthetic merges chained over all parents, then
//! one single-parent changeset standing for the commit itself. Synthetic
//! changesets map forward to the commit but the commit maps back only to
//! the final changeset.
//!
//! ## Commit collisions
//!
//! Two changesets that differ only in data git cannot carry (extra keys,
//! the file list) would produce the same commit. The later one gets NUL
//! bytes appended to its message until its id is unused.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;

use crate::batch::{BatchBuffer, RevisionKind, StagedTexts};
use crate::bundle::FullRevision;
use crate::changeset::{Authorship, Changeset, EXTRA_COMMITTER, EXTRA_OCTOPUS};
use crate::error::{BridgeError, Result};
use crate::filetext;
use crate::hg_store::SourceStore;
use crate::id::{GitId, HgId};
use crate::manifest::Manifest;
use crate::mapping::{CorrespondenceStore, MappingEntry, Recorded};
use crate::object::{Commit, ObjectKind, RawObject};
use crate::storage::TargetStore;
use crate::tree::{FileNodes, ModePolicy, SkippedEntry, manifest_to_tree, tree_to_manifest};

/// Cache of file node -> blob id
///
/// File nodes to blobs is many-to-one, so this is never persisted: it is
/// rebuilt from stored texts on demand.
pub struct BlobCache {
    inner: Mutex<LruCache<HgId, GitId>>,
}

impl BlobCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, node: &HgId) -> Option<GitId> {
        self.inner.lock().get(node).copied()
    }

    pub fn insert(&self, node: HgId, blob: GitId) {
        self.inner.lock().put(node, blob);
    }
}

/// [`FileNodes`] backed by hg texts and git blobs
///
/// When given parent manifests, [`FileNodes::node_for`] reuses a parent's
/// node if its content matches and otherwise creates a new file revision
/// with the parents' nodes for that path as its parents.
pub struct FileNodeMap<'a> {
    texts: StagedTexts<'a>,
    objects: &'a dyn TargetStore,
    cache: &'a BlobCache,
    parents: Vec<Manifest>,
    created: Vec<(Vec<u8>, FullRevision)>,
}

impl<'a> FileNodeMap<'a> {
    pub fn new(
        texts: StagedTexts<'a>,
        objects: &'a dyn TargetStore,
        cache: &'a BlobCache,
        parents: Vec<Manifest>,
    ) -> Self {
        Self {
            texts,
            objects,
            cache,
            parents,
            created: Vec::new(),
        }
    }

    /// File revisions created by `node_for`
    pub fn into_created(self) -> Vec<(Vec<u8>, FullRevision)> {
        self.created
    }
}

impl FileNodes for FileNodeMap<'_> {
    fn blob_for(&self, path: &[u8], node: &HgId) -> Result<GitId> {
        if let Some(blob) = self.cache.get(node) {
            return Ok(blob);
        }
        let revision = self.texts.revision(node)?.ok_or_else(|| {
            BridgeError::NotFound(format!(
                "file revision {} for {}",
                node,
                String::from_utf8_lossy(path)
            ))
        })?;
        let blob = ObjectKind::Blob.hash(&filetext::content(&revision.text));
        self.cache.insert(*node, blob);
        Ok(blob)
    }

    fn node_for(&mut self, path: &[u8], blob: &GitId) -> Result<HgId> {
        let mut parent_nodes: Vec<HgId> = Vec::with_capacity(2);
        for manifest in self.parents.iter().take(2) {
            if let Some(entry) = manifest.get(path) {
                if !parent_nodes.contains(&entry.node) {
                    parent_nodes.push(entry.node);
                }
            }
        }
        for node in &parent_nodes {
            if self.blob_for(path, node)? == *blob {
                return Ok(*node);
            }
        }
        let content = self.objects.get_kind(blob, ObjectKind::Blob)?;
        let p1 = parent_nodes.first().copied().unwrap_or(HgId::NULL);
        let p2 = parent_nodes.get(1).copied().unwrap_or(HgId::NULL);
        let revision = FullRevision::new(p1, p2, filetext::join(None, &content));
        let node = revision.id;
        self.cache.insert(node, *blob);
        self.created.push((path.to_vec(), revision));
        Ok(node)
    }
}

/// Translator bound to one batch
pub struct DagTranslator<'a> {
    batch: &'a BatchBuffer,
    mapping: &'a CorrespondenceStore,
    source: &'a dyn SourceStore,
    target: &'a dyn TargetStore,
    policy: ModePolicy,
    cache: &'a BlobCache,
    skipped: Mutex<Vec<SkippedEntry>>,
}

impl<'a> DagTranslator<'a> {
    pub fn new(
        batch: &'a BatchBuffer,
        mapping: &'a CorrespondenceStore,
        source: &'a dyn SourceStore,
        target: &'a dyn TargetStore,
        policy: ModePolicy,
        cache: &'a BlobCache,
    ) -> Self {
        Self {
            batch,
            mapping,
            source,
            target,
            policy,
            cache,
            skipped: Mutex::new(Vec::new()),
        }
    }

    /// Entries left out so far under [`ModePolicy::SkipAndReport`]
    pub fn take_skipped(&self) -> Vec<SkippedEntry> {
        std::mem::take(&mut *self.skipped.lock())
    }

    fn changeset(&self, id: &HgId) -> Result<(FullRevision, Changeset)> {
        let revision = self.batch.revision_or_stored(id, self.source)?;
        let changeset = Changeset::parse(&revision.text, id)?;
        Ok((revision, changeset))
    }

    fn manifest(&self, id: &HgId) -> Result<Manifest> {
        if id.is_null() {
            return Ok(Manifest::new());
        }
        let revision = self.batch.revision_or_stored(id, self.source)?;
        Manifest::parse(&revision.text, id)
    }

    fn missing_parent(child: impl ToString, parent: impl ToString) -> BridgeError {
        BridgeError::MissingParent {
            child: child.to_string(),
            parent: parent.to_string(),
        }
    }

    /// Translate an hg changeset into a git commit
    pub fn translate_forward(&self, hg: &HgId) -> Result<GitId> {
        if self.batch.is_synthetic(self.mapping, hg) {
            if let Some(git) = self.batch.lookup_forward(self.mapping, hg) {
                return Ok(git);
            }
        }

        let (revision, changeset) = self.changeset(hg)?;
        let hg_parents = self.commit_parents(&revision)?;
        let mut parents = Vec::with_capacity(hg_parents.len());
        for parent in hg_parents {
            let git = self
                .batch
                .lookup_forward(self.mapping, &parent)
                .ok_or_else(|| Self::missing_parent(hg, parent))?;
            parents.push(git);
        }

        let manifest = self.manifest(&changeset.manifest)?;
        let objects = self.batch.objects(self.target);
        let files = FileNodeMap::new(
            self.batch.texts(self.source),
            &objects,
            self.cache,
            Vec::new(),
        );
        let build = manifest_to_tree(&manifest, &changeset.manifest, &files, self.policy)?;
        for object in build.objects {
            self.batch.put_object(object);
        }
        self.skipped.lock().extend(build.skipped);

        let mut commit = Commit {
            tree: build.root,
            parents,
            author: changeset.author().to_git_bytes(),
            committer: changeset.committer().to_git_bytes(),
            message: changeset.description,
        };
        loop {
            let object = RawObject::commit(&commit);
            match self.batch.lookup_reverse(self.mapping, &object.id) {
                Some(owner) if owner != *hg => {
                    tracing::debug!(
                        changeset = %hg,
                        commit = %object.id,
                        owner = %owner,
                        "commit collision, padding message"
                    );
                    commit.message.push(0);
                }
                _ => {
                    let git = object.id;
                    let recorded = self
                        .batch
                        .stage(self.mapping, MappingEntry::real(*hg, git))?;
                    self.batch.put_object(object);
                    tracing::debug!(
                        changeset = %hg,
                        commit = %git,
                        new = recorded == Recorded::New,
                        "translated changeset"
                    );
                    return Ok(git);
                }
            }
        }
    }

    /// hg parents whose git counterparts become the commit's parents.
    ///
    /// The final changeset of a linearized octopus merge has a synthetic
    /// merge as its only parent; its commit's parents are recovered by
    /// unwinding the synthetic chain.
    fn commit_parents(&self, revision: &FullRevision) -> Result<Vec<HgId>> {
        let parents = revision.parents();
        let [p1] = parents[..] else {
            return Ok(parents);
        };
        if !self.batch.is_synthetic(self.mapping, &p1) {
            return Ok(parents);
        }
        let octopus = self.batch.lookup_forward(self.mapping, &p1);
        let owner = octopus.and_then(|git| self.batch.lookup_reverse(self.mapping, &git));
        if owner != Some(revision.id) {
            return Ok(parents);
        }

        let mut unwound = Vec::new();
        let mut current = p1;
        while self.batch.is_synthetic(self.mapping, &current) {
            let merge = self.batch.revision_or_stored(&current, self.source)?;
            unwound.push(merge.p2);
            current = merge.p1;
        }
        unwound.push(current);
        unwound.reverse();
        Ok(unwound)
    }

    /// Translate a git commit into hg changesets, returning the changeset
    /// the commit maps back to
    pub fn translate_backward(&self, git: &GitId) -> Result<HgId> {
        if let Some(hg) = self.batch.lookup_reverse(self.mapping, git) {
            return Ok(hg);
        }

        let objects = self.batch.objects(self.target);
        let commit = objects.get_commit(git)?;
        let mut parents = Vec::with_capacity(commit.parents.len());
        for parent in &commit.parents {
            let hg = self
                .batch
                .lookup_reverse(self.mapping, parent)
                .ok_or_else(|| Self::missing_parent(git, parent))?;
            parents.push(hg);
        }

        let mut parent_manifests = Vec::with_capacity(parents.len());
        for parent in &parents {
            let (_, changeset) = self.changeset(parent)?;
            parent_manifests.push((changeset.manifest, self.manifest(&changeset.manifest)?));
        }

        let mut files = FileNodeMap::new(
            self.batch.texts(self.source),
            &objects,
            self.cache,
            parent_manifests.iter().take(2).map(|(_, m)| m.clone()).collect(),
        );
        let build = tree_to_manifest(&commit.tree, &objects, &mut files, self.policy)?;
        for (path, revision) in files.into_created() {
            self.batch.put_revision(RevisionKind::File(path), revision);
        }
        self.skipped.lock().extend(build.skipped);

        let malformed =
            |what: &str| BridgeError::malformed("commit", git, format!("invalid {} line", what));
        let author =
            Authorship::from_git_bytes(&commit.author).ok_or_else(|| malformed("author"))?;
        let committer = Authorship::from_git_bytes(&commit.committer)
            .ok_or_else(|| malformed("committer"))?;
        let mut extra = BTreeMap::new();
        if committer != author {
            extra.insert(EXTRA_COMMITTER.to_vec(), commit.committer.clone());
        }

        let draft = Draft {
            manifest: &build.manifest,
            author: &author,
            description: &commit.message,
        };
        let parent_of = |i: usize| {
            parents
                .get(i)
                .map(|p| (*p, parent_manifests[i].0, &parent_manifests[i].1))
        };

        let (p1, p2) = match parents.len() {
            0..=2 => (parent_of(0), parent_of(1)),
            _ => {
                let mut synthetic_extra = extra.clone();
                synthetic_extra.insert(EXTRA_OCTOPUS.to_vec(), git.to_hex().into_bytes());
                let mut left = parent_of(0);
                for i in 1..parents.len() {
                    let (merge, manifest_id) =
                        self.write_changeset(&draft, left, parent_of(i), &synthetic_extra)?;
                    self.batch.stage(self.mapping, MappingEntry::synthetic(merge, *git))?;
                    tracing::debug!(commit = %git, changeset = %merge, "synthetic merge");
                    left = Some((merge, manifest_id, &build.manifest));
                }
                (left, None)
            }
        };

        let (hg, _) = self.write_changeset(&draft, p1, p2, &extra)?;
        self.batch.stage(self.mapping, MappingEntry::real(hg, *git))?;
        tracing::debug!(commit = %git, changeset = %hg, "translated commit");
        Ok(hg)
    }

    /// Stage the manifest and changeset revisions of one hg changeset
    fn write_changeset(
        &self,
        draft: &Draft<'_>,
        p1: Option<(HgId, HgId, &Manifest)>,
        p2: Option<(HgId, HgId, &Manifest)>,
        extra: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(HgId, HgId)> {
        let mp1 = p1.map(|(_, m, _)| m).unwrap_or(HgId::NULL);
        let mut mp2 = p2.map(|(_, m, _)| m).unwrap_or(HgId::NULL);
        if mp2 == mp1 {
            mp2 = HgId::NULL;
        }
        let manifest = FullRevision::new(mp1, mp2, draft.manifest.to_bytes());
        let manifest_id = manifest.id;
        self.batch.put_revision(RevisionKind::Manifest, manifest);

        let empty = Manifest::new();
        let files = draft.manifest.changed_paths(p1.map(|(_, _, m)| m).unwrap_or(&empty));
        let changeset = Changeset {
            manifest: manifest_id,
            user: draft.author.hg_user(),
            time: draft.author.time,
            tz: draft.author.hg_tz(),
            extra: extra.clone(),
            files,
            description: draft.description.to_vec(),
        };
        let revision = FullRevision::new(
            p1.map(|(id, _, _)| id).unwrap_or(HgId::NULL),
            p2.map(|(id, _, _)| id).unwrap_or(HgId::NULL),
            changeset.to_bytes(),
        );
        let id = revision.id;
        self.batch.put_revision(RevisionKind::Changeset, revision);
        Ok((id, manifest_id))
    }

    /// Unmapped commits reachable from `heads`, with their parents
    pub fn unmapped_ancestors(&self, heads: &[GitId]) -> Result<Vec<(GitId, Vec<GitId>)>> {
        let objects = self.batch.objects(self.target);
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut pending: Vec<GitId> = heads.to_vec();
        while let Some(id) = pending.pop() {
            if !seen.insert(id) || self.batch.lookup_reverse(self.mapping, &id).is_some() {
                continue;
            }
            let commit = objects.get_commit(&id)?;
            pending.extend(commit.parents.iter().copied());
            found.push((id, commit.parents));
        }
        found.reverse();
        Ok(found)
    }
}

/// Parts shared by every changeset written for one commit
struct Draft<'d> {
    manifest: &'d Manifest,
    author: &'d Authorship,
    description: &'d [u8],
}

/// Order commits so that parents come before children (Kahn's algorithm).
/// Parents outside the input are ignored; ties go to the earlier input.
pub fn topological_order(commits: &[(GitId, Vec<GitId>)]) -> Result<Vec<GitId>> {
    let mut position: HashMap<GitId, usize> = HashMap::with_capacity(commits.len());
    for (id, _) in commits {
        let next = position.len();
        position.entry(*id).or_insert(next);
    }
    let mut ids = vec![GitId::NULL; position.len()];
    for (id, pos) in &position {
        ids[*pos] = *id;
    }

    let mut in_degree = vec![0usize; ids.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut counted = HashSet::new();
    for (id, parents) in commits {
        let child = position[id];
        if !counted.insert(child) {
            continue;
        }
        let unique: BTreeSet<usize> = parents
            .iter()
            .filter_map(|p| position.get(p).copied())
            .collect();
        for parent in unique {
            in_degree[child] += 1;
            children[parent].push(child);
        }
    }

    let mut ready: BTreeSet<usize> = (0..ids.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(next) = ready.pop_first() {
        order.push(ids[next]);
        for child in &children[next] {
            in_degree[*child] -= 1;
            if in_degree[*child] == 0 {
                ready.insert(*child);
            }
        }
    }

    if order.len() != ids.len() {
        return Err(BridgeError::malformed(
            "commit graph",
            "push",
            format!("cycle among {} commits", ids.len() - order.len()),
        ));
    }
    Ok(order)
}
