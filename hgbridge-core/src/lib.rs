//! hgbridge core library
//!
//! Bidirectional bridge between Mercurial-style and git-style history:
//! - Bundle codec (delta chains in, delta chains out)
//! - Manifest <-> tree translation
//! - Correspondence store (append-only id mapping log)
//! - DAG translation with octopus and collision handling
//! - Fetch/push orchestration over a remote
//! - Sync state, configuration and sync log

pub mod batch;
pub mod bundle;
pub mod changeset;
pub mod dag;
pub mod error;
pub mod filetext;
pub mod hg_store;
pub mod id;
pub mod manifest;
pub mod mapping;
pub mod object;
pub mod orchestrator;
pub mod remote;
pub mod repository;
pub mod storage;
pub mod sync;
pub mod tree;

pub use batch::{BatchBuffer, CommitSummary, RevisionKind};
pub use bundle::{Bundle, BundleWriter, FullRevision, GroupKind};
pub use changeset::{Authorship, Changeset};
pub use dag::{BlobCache, DagTranslator, topological_order};
pub use error::{BridgeError, Result};
pub use hg_store::{DiskSourceStore, MemorySourceStore, SourceStore};
pub use id::{AbbrevSize, EMPTY_REVISION, EMPTY_TREE, GitId, HgId};
pub use manifest::{FileFlags, Manifest, ManifestEntry};
pub use mapping::{AuditReport, CorrespondenceStore, MappingEntry, Recorded};
pub use object::{Commit, EntryMode, ObjectKind, RawObject, Tree, TreeEntry};
pub use orchestrator::{FetchReport, Orchestrator, PushReport, SyncPhase};
pub use remote::{BundleFileRemote, MemoryRemote, Remote};
pub use repository::BridgeRepository;
pub use storage::{LooseObjectStore, MemoryTargetStore, TargetStore};
pub use sync::{BridgeConfig, BridgeState, SyncDirection, SyncLog, SyncLogEntry};
pub use tree::{ModePolicy, SkippedEntry};
