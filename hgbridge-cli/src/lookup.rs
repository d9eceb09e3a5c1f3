//! Identifier translation and raw revision dumps.

use anyhow::{Context, Result};
use hgbridge_core::{AbbrevSize, BridgeError, BridgeRepository, GitId, HgId, SourceStore};
use std::io::Write;

/// Which kind of hg revision `data` dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Changeset,
    Manifest,
    File,
}

/// Map hg ids (full or abbreviated) to git commits, one line per id.
/// Unknown ids print as the null id.
pub fn hg2git(
    repo: &BridgeRepository,
    ids: &[String],
    abbrev: AbbrevSize,
    out: &mut dyn Write,
) -> Result<()> {
    let mapping = repo.mapping();
    for id in ids {
        let git = match mapping.resolve_abbrev(id) {
            Ok(hg) => mapping.lookup_forward(&hg).unwrap_or(GitId::NULL),
            Err(BridgeError::NotFound(_)) => GitId::NULL,
            Err(e) => return Err(e).with_context(|| format!("cannot resolve {}", id)),
        };
        writeln!(out, "{}", abbrev.apply(&git.to_hex()))?;
    }
    Ok(())
}

/// Map git commits (full or abbreviated) to hg changesets.
/// Unknown ids print as the null id.
pub fn git2hg(
    repo: &BridgeRepository,
    ids: &[String],
    abbrev: AbbrevSize,
    out: &mut dyn Write,
) -> Result<()> {
    let mapping = repo.mapping();
    for id in ids {
        let hg = match mapping.resolve_git_abbrev(id) {
            Ok(git) => mapping.lookup_reverse(&git).unwrap_or(HgId::NULL),
            Err(BridgeError::NotFound(_)) => HgId::NULL,
            Err(e) => return Err(e).with_context(|| format!("cannot resolve {}", id)),
        };
        writeln!(out, "{}", abbrev.apply(&hg.to_hex()))?;
    }
    Ok(())
}

/// Write the stored text of one hg revision
pub fn data(repo: &BridgeRepository, kind: DataKind, id: &str, out: &mut dyn Write) -> Result<()> {
    let node = match kind {
        // Only changesets are in the mapping; other kinds need full ids
        DataKind::Changeset => repo.mapping().resolve_abbrev(id)?,
        DataKind::Manifest | DataKind::File => HgId::from_hex(id)?,
    };
    let revision = repo
        .source()
        .require(&node)
        .with_context(|| format!("no {:?} revision {}", kind, node))?;
    out.write_all(&revision.text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hgbridge_core::FullRevision;
    use tempfile::TempDir;

    fn repo_with_mapping() -> (TempDir, BridgeRepository, HgId, GitId) {
        let tmp = TempDir::new().unwrap();
        let repo = BridgeRepository::open(tmp.path()).unwrap();
        let revision = FullRevision::new(HgId::NULL, HgId::NULL, "changeset text");
        repo.source().put(&revision).unwrap();
        let git = GitId::new([0x5a; 20]);
        repo.mapping().record(revision.id, git).unwrap();
        (tmp, repo, revision.id, git)
    }

    fn run(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_hg2git_full_and_abbrev() {
        let (_tmp, repo, hg, git) = repo_with_mapping();
        let ids = vec![hg.to_hex(), hg.to_hex()[..6].to_string()];
        let text = run(|out| hg2git(&repo, &ids, AbbrevSize::FULL, out));
        assert_eq!(text, format!("{0}\n{0}\n", git.to_hex()));

        let abbrev: AbbrevSize = "7".parse().unwrap();
        let text = run(|out| hg2git(&repo, &ids[..1], abbrev, out));
        assert_eq!(text, format!("{}\n", &git.to_hex()[..7]));
    }

    #[test]
    fn test_unknown_ids_print_null() {
        let (_tmp, repo, _, _) = repo_with_mapping();
        let ids = vec!["f".repeat(40), "fff".to_string()];
        let text = run(|out| git2hg(&repo, &ids, AbbrevSize::DEFAULT, out));
        assert_eq!(text, format!("{0}\n{0}\n", "0".repeat(12)));
    }

    #[test]
    fn test_git2hg_round_trip() {
        let (_tmp, repo, hg, git) = repo_with_mapping();
        let text = run(|out| git2hg(&repo, &[git.to_hex()], AbbrevSize::FULL, out));
        assert_eq!(text.trim(), hg.to_hex());
    }

    #[test]
    fn test_invalid_prefix_is_error() {
        let (_tmp, repo, _, _) = repo_with_mapping();
        let mut out = Vec::new();
        assert!(hg2git(&repo, &["zz".to_string()], AbbrevSize::FULL, &mut out).is_err());
    }

    #[test]
    fn test_data_dumps_text() {
        let (_tmp, repo, hg, _) = repo_with_mapping();
        let text = run(|out| data(&repo, DataKind::Changeset, &hg.to_hex()[..8], out));
        assert_eq!(text, "changeset text");

        let mut out = Vec::new();
        assert!(data(&repo, DataKind::File, &"1".repeat(40), &mut out).is_err());
    }
}
