//! Fetch and push orchestration
//!
//! ```text
//! Idle -> Discovering -> Translating -> Committing -> Idle
//!              \______________\_____________\______-> Failed
//! ```
//!
//! A fetch asks the remote for its heads, pulls a bundle for whatever is not
//! mapped yet, decodes file chains concurrently on blocking workers, then
//! translates manifests and changesets in bundle order. A push walks the
//! unmapped git ancestors of the given heads, translates them parents
//! first, and commits only after the remote accepted the bundle.
//!
//! Nothing is visible before the batch commit point. A failed or cancelled
//! run leaves the repository as it was, so the next run simply starts over
//! from discovery.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::batch::{BatchBuffer, CommitSummary, Outgoing, RevisionKind};
use crate::bundle::{Bundle, BundleWriter, Group, GroupKind, encode_chain};
use crate::error::{BridgeError, Result};
use crate::filetext;
use crate::id::{GitId, HgId};
use crate::object::{ObjectKind, RawObject};
use crate::remote::Remote;
use crate::repository::BridgeRepository;
use crate::sync::{SyncDirection, SyncLogEntry};
use crate::tree::SkippedEntry;

/// Where a sync currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Discovering,
    Translating,
    Committing,
    Failed,
}

/// Result of a fetch
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    /// Newly mapped changesets, in bundle order
    pub changesets: Vec<(HgId, GitId)>,
    pub skipped: Vec<SkippedEntry>,
    pub summary: CommitSummary,
    /// Remote heads at discovery time
    pub remote_heads: Vec<HgId>,
}

impl FetchReport {
    pub fn is_up_to_date(&self) -> bool {
        self.changesets.is_empty()
    }
}

/// Result of a push
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// Newly mapped commits, parents first
    pub commits: Vec<(GitId, HgId)>,
    pub skipped: Vec<SkippedEntry>,
    pub summary: CommitSummary,
    /// Size of the bundle handed to the remote
    pub bundle_bytes: usize,
}

impl PushReport {
    pub fn is_up_to_date(&self) -> bool {
        self.commits.is_empty()
    }
}

struct Translated<T> {
    pairs: Vec<T>,
    skipped: Vec<SkippedEntry>,
}

/// Drives fetches and pushes between one repository and one remote
pub struct Orchestrator {
    repo: Arc<BridgeRepository>,
    remote: Arc<dyn Remote>,
    phase: Mutex<SyncPhase>,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(repo: Arc<BridgeRepository>, remote: Arc<dyn Remote>) -> Self {
        Self {
            repo,
            remote,
            phase: Mutex::new(SyncPhase::Idle),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn repository(&self) -> &Arc<BridgeRepository> {
        &self.repo
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    /// Abort the running fetch or push before its commit point; nothing of
    /// it is committed
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn set_phase(&self, phase: SyncPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            tracing::info!(from = ?*current, to = ?phase, "sync phase");
            *current = phase;
        }
    }

    /// Bring every remote changeset over as git commits
    pub async fn fetch(&self) -> Result<FetchReport> {
        let started = Instant::now();
        self.cancel.store(false, Ordering::SeqCst);
        self.repo.begin_sync(&self.remote.url())?;

        let retries = self.repo.config().transport_retries;
        let mut attempt = 0;
        let result = loop {
            match self.fetch_once().await {
                Err(err) if err.is_transport() && attempt < retries => {
                    attempt += 1;
                    tracing::warn!(attempt, "fetch transport failure, rediscovering: {}", err);
                }
                other => break other,
            }
        };

        let counts = result.as_ref().ok().map(|report| {
            (
                report.changesets.len(),
                report.summary.objects + report.summary.revisions,
                report.skipped.len(),
            )
        });
        self.finish(SyncDirection::Fetch, started, counts, result.as_ref().err());
        result
    }

    /// Translate every unmapped commit reachable from `heads` and hand the
    /// resulting bundle to the remote
    pub async fn push(&self, heads: &[GitId]) -> Result<PushReport> {
        let started = Instant::now();
        self.cancel.store(false, Ordering::SeqCst);
        self.repo.begin_sync(&self.remote.url())?;

        let retries = self.repo.config().transport_retries;
        let mut attempt = 0;
        let result = loop {
            match self.push_once(heads).await {
                Err(err) if err.is_transport() && attempt < retries => {
                    attempt += 1;
                    tracing::warn!(attempt, "push transport failure, rediscovering: {}", err);
                }
                other => break other,
            }
        };

        let counts = result.as_ref().ok().map(|report| {
            (
                report.commits.len(),
                report.summary.objects + report.summary.revisions,
                report.skipped.len(),
            )
        });
        self.finish(SyncDirection::Push, started, counts, result.as_ref().err());
        result
    }

    async fn fetch_once(&self) -> Result<FetchReport> {
        self.set_phase(SyncPhase::Discovering);
        let remote_heads = self.remote.heads().await?;
        let wanted: Vec<HgId> = remote_heads
            .iter()
            .filter(|head| !self.repo.mapping().contains_forward(head))
            .copied()
            .collect();
        if wanted.is_empty() {
            tracing::info!(heads = remote_heads.len(), "already up to date");
            return Ok(FetchReport {
                remote_heads,
                ..FetchReport::default()
            });
        }

        self.check_cancelled("discovery")?;
        let common = self.repo.state().hg_heads;
        let data = self.remote.fetch(&common, &wanted).await?;
        tracing::info!(bytes = data.len(), wanted = wanted.len(), "bundle received");

        self.set_phase(SyncPhase::Translating);
        let batch = Arc::new(BatchBuffer::new());
        let translated = self.with_timeout(self.translate_bundle(data, batch.clone())).await?;

        self.set_phase(SyncPhase::Committing);
        let summary = self.commit(batch).await?;
        self.repo.update_state(|state| {
            state.add_heads(remote_heads.iter().copied());
            state.total_fetched += translated.pairs.len() as u64;
        })?;
        tracing::info!(
            changesets = translated.pairs.len(),
            objects = summary.objects,
            revisions = summary.revisions,
            "fetch committed"
        );

        Ok(FetchReport {
            changesets: translated.pairs,
            skipped: translated.skipped,
            summary,
            remote_heads,
        })
    }

    async fn push_once(&self, heads: &[GitId]) -> Result<PushReport> {
        self.set_phase(SyncPhase::Discovering);
        let batch = Arc::new(BatchBuffer::new());
        let order = {
            let repo = self.repo.clone();
            let batch = batch.clone();
            let heads = heads.to_vec();
            join(tokio::task::spawn_blocking(move || {
                let unmapped = repo.translator(&batch).unmapped_ancestors(&heads)?;
                crate::dag::topological_order(&unmapped)
            }))
            .await?
        };
        if order.is_empty() {
            tracing::info!(heads = heads.len(), "nothing to push");
            return Ok(PushReport::default());
        }
        tracing::info!(commits = order.len(), "commits to push");
        self.check_cancelled("discovery")?;

        self.set_phase(SyncPhase::Translating);
        let translated = {
            let repo = self.repo.clone();
            let batch = batch.clone();
            let cancel = self.cancel.clone();
            self.with_timeout(join(tokio::task::spawn_blocking(move || {
                translate_commits(&repo, &batch, &order, &cancel)
            })))
            .await?
        };
        let bundle = encode_outgoing(&batch.outgoing());
        let bundle_bytes = bundle.len();
        self.remote.push(bundle).await?;

        self.set_phase(SyncPhase::Committing);
        let summary = self.commit(batch).await?;
        let pushed_heads: Vec<HgId> = heads
            .iter()
            .filter_map(|head| self.repo.mapping().lookup_reverse(head))
            .collect();
        self.repo.update_state(|state| {
            state.add_heads(pushed_heads);
            state.total_pushed += translated.pairs.len() as u64;
        })?;
        tracing::info!(
            commits = translated.pairs.len(),
            bytes = bundle_bytes,
            revisions = summary.revisions,
            "push committed"
        );

        Ok(PushReport {
            commits: translated.pairs,
            skipped: translated.skipped,
            summary,
            bundle_bytes,
        })
    }

    async fn translate_bundle(
        &self,
        data: Bytes,
        batch: Arc<BatchBuffer>,
    ) -> Result<Translated<(HgId, GitId)>> {
        let Bundle {
            changesets,
            manifests,
            files,
        } = Bundle::parse(data)?;
        let cancel = self.cancel.clone();
        let verify = self.repo.config().verify_hashes;

        let semaphore = Arc::new(Semaphore::new(self.repo.config().worker_threads.max(1)));
        let mut workers = Vec::with_capacity(files.len());
        for group in files {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BridgeError::Cancelled(e.to_string()))?;
            let repo = self.repo.clone();
            let batch = batch.clone();
            let cancel = cancel.clone();
            workers.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                decode_file_group(&repo, &batch, &group, verify, &cancel)
            }));
        }
        let mut file_revisions = 0;
        for worker in workers {
            file_revisions += join(worker).await?;
        }
        tracing::debug!(file_revisions, "file groups decoded");

        let repo = self.repo.clone();
        join(tokio::task::spawn_blocking(move || {
            translate_history(&repo, &batch, &manifests, &changesets, verify, &cancel)
        }))
        .await
    }

    async fn commit(&self, batch: Arc<BatchBuffer>) -> Result<CommitSummary> {
        let repo = self.repo.clone();
        let retries = repo.config().index_write_retries;
        join(tokio::task::spawn_blocking(move || {
            batch.commit(repo.target(), repo.source(), repo.mapping(), retries)
        }))
        .await
    }

    /// Run translation under the batch timeout; on expiry, stop the workers
    /// and drop the batch
    async fn with_timeout<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = Duration::from_secs(self.repo.config().batch_timeout_secs);
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel.store(true, Ordering::SeqCst);
                Err(BridgeError::Cancelled(format!(
                    "batch exceeded {}s",
                    limit.as_secs()
                )))
            }
        }
    }

    fn check_cancelled(&self, stage: &str) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(BridgeError::Cancelled(format!("stopped after {}", stage)));
        }
        Ok(())
    }

    /// Record the outcome in the state file and the sync log
    fn finish(
        &self,
        direction: SyncDirection,
        started: Instant,
        counts: Option<(usize, usize, usize)>,
        error: Option<&BridgeError>,
    ) {
        self.set_phase(if error.is_some() {
            SyncPhase::Failed
        } else {
            SyncPhase::Idle
        });

        let mut entry = SyncLogEntry::new(direction);
        entry.duration_ms = started.elapsed().as_millis() as u64;
        entry.success = error.is_none();
        if let Some((changesets, objects, skipped)) = counts {
            entry.changesets = changesets as u64;
            entry.objects = objects as u64;
            entry.skipped = skipped as u64;
        }
        if let Some(err) = error {
            tracing::error!(kind = err.kind(), "{} failed: {}", direction, err);
            entry.error = Some(format!("{}: {}", err.kind(), err));
        }

        if let Err(e) = self.repo.end_sync(entry.success) {
            tracing::warn!("failed to save sync state: {}", e);
        }
        if let Err(e) = self.repo.sync_log().append(&entry) {
            tracing::warn!("failed to append sync log: {}", e);
        }
    }
}

async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| BridgeError::Cancelled(format!("worker stopped: {}", e)))?
}

/// Decode one file chain, staging each revision with its blob
fn decode_file_group(
    repo: &BridgeRepository,
    batch: &BatchBuffer,
    group: &Group,
    verify: bool,
    cancel: &AtomicBool,
) -> Result<usize> {
    let texts = batch.texts(repo.source());
    let mut decoded = 0;
    for revision in group.decode(&texts, verify) {
        if cancel.load(Ordering::SeqCst) {
            return Err(BridgeError::Cancelled(format!("stopped while decoding {}", group.path())));
        }
        let revision = revision?;
        let blob = RawObject::new(ObjectKind::Blob, filetext::content(&revision.text));
        repo.cache().insert(revision.id, blob.id);
        batch.put_object(blob);
        batch.put_revision(RevisionKind::File(group.name.clone()), revision);
        decoded += 1;
    }
    tracing::debug!(path = %group.path(), revisions = decoded, "decoded file group");
    Ok(decoded)
}

/// Decode manifests and changesets, then translate unmapped changesets in
/// bundle order
fn translate_history(
    repo: &BridgeRepository,
    batch: &BatchBuffer,
    manifests: &Group,
    changesets: &Group,
    verify: bool,
    cancel: &AtomicBool,
) -> Result<Translated<(HgId, GitId)>> {
    let texts = batch.texts(repo.source());
    for revision in manifests.decode(&texts, verify) {
        batch.put_revision(RevisionKind::Manifest, revision?);
    }
    let mut order = Vec::with_capacity(changesets.len());
    for revision in changesets.decode(&texts, verify) {
        let revision = revision?;
        order.push(revision.id);
        batch.put_revision(RevisionKind::Changeset, revision);
    }

    let translator = repo.translator(batch);
    let mut pairs = Vec::new();
    for hg in order {
        if cancel.load(Ordering::SeqCst) {
            return Err(BridgeError::Cancelled(format!("stopped before changeset {}", hg)));
        }
        if repo.mapping().contains_forward(&hg) {
            continue;
        }
        let git = translator.translate_forward(&hg)?;
        pairs.push((hg, git));
    }
    Ok(Translated {
        pairs,
        skipped: translator.take_skipped(),
    })
}

/// Translate commits already in parents-first order
fn translate_commits(
    repo: &BridgeRepository,
    batch: &BatchBuffer,
    order: &[GitId],
    cancel: &AtomicBool,
) -> Result<Translated<(GitId, HgId)>> {
    let translator = repo.translator(batch);
    let mut pairs = Vec::with_capacity(order.len());
    for git in order {
        if cancel.load(Ordering::SeqCst) {
            return Err(BridgeError::Cancelled(format!("stopped before commit {}", git)));
        }
        let hg = translator.translate_backward(git)?;
        pairs.push((*git, hg));
    }
    Ok(Translated {
        pairs,
        skipped: translator.take_skipped(),
    })
}

/// Encode staged revisions as a bundle: changesets, manifests, then one
/// group per file
pub fn encode_outgoing(outgoing: &Outgoing) -> Bytes {
    let mut writer = BundleWriter::new();
    writer.write_group(GroupKind::Changeset, b"", &encode_chain(&outgoing.changesets));
    writer.write_group(GroupKind::Manifest, b"", &encode_chain(&outgoing.manifests));
    for (path, revisions) in &outgoing.files {
        writer.write_group(GroupKind::File, path, &encode_chain(revisions));
    }
    writer.finish()
}
