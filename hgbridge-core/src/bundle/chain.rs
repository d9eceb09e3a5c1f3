//! Delta chains: decoding records into full texts and back

use bytes::Bytes;

use super::patch::{Patch, encode_delta};
use super::stream::{RecordIter, RevisionRecord};
use crate::error::{BridgeError, Result};
use crate::id::HgId;

/// Lookup of full texts for bases outside the current chain position
pub trait BaseResolver: Send + Sync {
    /// Full text of a previously decoded or stored revision
    fn full_text(&self, id: &HgId) -> Result<Option<Bytes>>;
}

/// A revision with its full text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullRevision {
    pub id: HgId,
    pub p1: HgId,
    pub p2: HgId,
    pub text: Bytes,
}

impl FullRevision {
    /// Build a revision, computing its node id from parents and text
    pub fn new(p1: HgId, p2: HgId, text: impl Into<Bytes>) -> Self {
        let text = text.into();
        Self {
            id: HgId::hash(&p1, &p2, &text),
            p1,
            p2,
            text,
        }
    }

    /// Non-null parents in order
    pub fn parents(&self) -> Vec<HgId> {
        [self.p1, self.p2].into_iter().filter(|p| !p.is_null()).collect()
    }
}

/// Pull-based decoder over one group.
///
/// Only the previous revision's text is kept; other bases go through the
/// resolver. After the first error the iterator is exhausted. It cannot be
/// rewound: to reprocess, open the group again.
pub struct ChainDecoder<'a> {
    records: RecordIter,
    resolver: &'a dyn BaseResolver,
    previous: Option<(HgId, Bytes)>,
    verify: bool,
    failed: bool,
}

impl<'a> ChainDecoder<'a> {
    pub fn new(records: RecordIter, resolver: &'a dyn BaseResolver, verify: bool) -> Self {
        Self {
            records,
            resolver,
            previous: None,
            verify,
            failed: false,
        }
    }

    fn base_text(&self, record: &RevisionRecord) -> Result<Bytes> {
        if record.base.is_null() {
            return Ok(Bytes::new());
        }
        if let Some((id, text)) = &self.previous {
            if *id == record.base {
                return Ok(text.clone());
            }
        }
        self.resolver
            .full_text(&record.base)?
            .ok_or_else(|| BridgeError::CorruptDelta {
                id: record.id,
                message: format!("unknown delta base {}", record.base),
            })
    }

    fn decode(&mut self, record: RevisionRecord) -> Result<FullRevision> {
        let base = self.base_text(&record)?;
        let patch = Patch::parse(&record.patch).map_err(|e| e.for_revision(record.id))?;
        let text = Bytes::from(patch.apply(&base).map_err(|e| e.for_revision(record.id))?);

        if self.verify {
            let actual = HgId::hash(&record.p1, &record.p2, &text);
            if actual != record.id {
                return Err(BridgeError::HashMismatch {
                    expected: record.id,
                    actual,
                });
            }
        }

        self.previous = Some((record.id, text.clone()));
        Ok(FullRevision {
            id: record.id,
            p1: record.p1,
            p2: record.p2,
            text,
        })
    }
}

impl Iterator for ChainDecoder<'_> {
    type Item = Result<FullRevision>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = match self.records.next()? {
            Ok(record) => self.decode(record),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.failed = true;
            self.previous = None;
        }
        Some(result)
    }
}

/// Encode full texts as a chain: each revision is a delta against the one
/// before it, the first against the empty text.
pub fn encode_chain<'r>(
    revisions: impl IntoIterator<Item = &'r FullRevision>,
) -> Vec<RevisionRecord> {
    let mut records = Vec::new();
    let mut previous: Option<&FullRevision> = None;
    for revision in revisions {
        let (base, base_text): (HgId, &[u8]) = match previous {
            Some(prev) => (prev.id, prev.text.as_ref()),
            None => (HgId::NULL, &[][..]),
        };
        records.push(RevisionRecord {
            id: revision.id,
            p1: revision.p1,
            p2: revision.p2,
            base,
            patch: encode_delta(base_text, &revision.text),
        });
        previous = Some(revision);
    }
    records
}

/// Resolver that knows no revisions; every base must come from the chain
pub struct NoBases;

impl BaseResolver for NoBases {
    fn full_text(&self, _id: &HgId) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::patch::PatchOp;
    use crate::bundle::stream::{Bundle, BundleWriter, GroupKind};
    use crate::id::EMPTY_REVISION;

    fn single_group(records: &[RevisionRecord]) -> Bundle {
        let mut writer = BundleWriter::new();
        writer.write_group(GroupKind::Changeset, b"", records);
        writer.write_group(GroupKind::Manifest, b"", &[]);
        Bundle::parse(writer.finish()).unwrap()
    }

    fn patch(ops: Vec<PatchOp>) -> Bytes {
        Bytes::from(Patch::new(ops).to_bytes())
    }

    #[test]
    fn test_encode_decode_chain() {
        let r0 = FullRevision::new(HgId::NULL, HgId::NULL, "one\ntwo\n");
        let r1 = FullRevision::new(r0.id, HgId::NULL, "one\n2\nthree\n");
        let r2 = FullRevision::new(r1.id, HgId::NULL, "");
        let bundle = single_group(&encode_chain([&r0, &r1, &r2]));

        let decoded: Vec<_> = bundle
            .changesets
            .decode(&NoBases, true)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, vec![r0, r1, r2]);
    }

    #[test]
    fn test_hash_mismatch_detected() {
        let bogus = HgId::new([9u8; 20]);
        let bundle = single_group(&[RevisionRecord {
            id: bogus,
            p1: HgId::NULL,
            p2: HgId::NULL,
            base: HgId::NULL,
            patch: patch(vec![PatchOp {
                start: 0,
                end: 0,
                data: b"x".to_vec(),
            }]),
        }]);
        let mut decoder = bundle.changesets.decode(&NoBases, true);
        match decoder.next() {
            Some(Err(BridgeError::HashMismatch { expected, .. })) => assert_eq!(expected, bogus),
            other => panic!("unexpected {:?}", other),
        }
        assert!(decoder.next().is_none());

        // Without verification the text is accepted as declared.
        let text = bundle.changesets.decode(&NoBases, false).next().unwrap().unwrap();
        assert_eq!(text.text.as_ref(), b"x");
    }

    #[test]
    fn test_unknown_base_is_corrupt_delta() {
        let bundle = single_group(&[RevisionRecord {
            id: EMPTY_REVISION,
            p1: HgId::NULL,
            p2: HgId::NULL,
            base: HgId::new([3u8; 20]),
            patch: Bytes::new(),
        }]);
        let result = bundle.changesets.decode(&NoBases, true).next().unwrap();
        assert!(matches!(result, Err(BridgeError::CorruptDelta { .. })));
    }

    #[test]
    fn test_base_from_resolver() {
        struct One(FullRevision);
        impl BaseResolver for One {
            fn full_text(&self, id: &HgId) -> Result<Option<Bytes>> {
                Ok((*id == self.0.id).then(|| self.0.text.clone()))
            }
        }

        let stored = FullRevision::new(HgId::NULL, HgId::NULL, "base\n");
        let next = FullRevision::new(stored.id, HgId::NULL, "base\nmore\n");
        let mut records = encode_chain([&stored, &next]);
        records.remove(0);
        let bundle = single_group(&records);

        let decoded: Vec<_> = bundle
            .changesets
            .decode(&One(stored), true)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, vec![next]);
    }
}
