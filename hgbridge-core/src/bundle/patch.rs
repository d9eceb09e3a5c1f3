//! Binary patches between full texts
//!
//! A patch is a list of fragments `(start, end, data)` meaning "replace
//! `base[start..end]` with `data`". Fragments are ordered and never overlap.
//!
//! ## Format
//!
//! Each fragment: `<start u32 BE><end u32 BE><len u32 BE><data>`

use bytes::Bytes;
use similar::{Algorithm, DiffTag, capture_diff_slices};

use crate::error::BridgeError;
use crate::id::HgId;

/// Size of a fragment header
const FRAGMENT_HEADER: usize = 12;

/// One replace operation against the base text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOp {
    pub start: usize,
    pub end: usize,
    pub data: Vec<u8>,
}

/// Reasons a patch can be rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("truncated fragment at byte {0}")]
    Truncated(usize),

    #[error("fragment {start}..{end} is inverted")]
    Inverted { start: usize, end: usize },

    #[error("fragment starting at {start} overlaps previous fragment ending at {previous_end}")]
    OutOfOrder { start: usize, previous_end: usize },

    #[error("fragment end {end} exceeds base length {len}")]
    OutOfRange { end: usize, len: usize },
}

impl PatchError {
    /// Attach the revision being decoded
    pub fn for_revision(self, id: HgId) -> BridgeError {
        BridgeError::CorruptDelta {
            id,
            message: self.to_string(),
        }
    }
}

/// Ordered list of fragments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Parse the binary fragment list. Only the framing is checked here;
    /// ordering and ranges are validated against the base in [`Patch::apply`].
    pub fn parse(bytes: &[u8]) -> Result<Self, PatchError> {
        let mut ops = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if bytes.len() - pos < FRAGMENT_HEADER {
                return Err(PatchError::Truncated(pos));
            }
            let start = read_u32(&bytes[pos..]) as usize;
            let end = read_u32(&bytes[pos + 4..]) as usize;
            let len = read_u32(&bytes[pos + 8..]) as usize;
            pos += FRAGMENT_HEADER;
            if bytes.len() - pos < len {
                return Err(PatchError::Truncated(pos));
            }
            ops.push(PatchOp {
                start,
                end,
                data: bytes[pos..pos + len].to_vec(),
            });
            pos += len;
        }
        Ok(Self { ops })
    }

    /// Serialize to the binary fragment list
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self
            .ops
            .iter()
            .map(|op| FRAGMENT_HEADER + op.data.len())
            .sum();
        let mut out = Vec::with_capacity(size);
        for op in &self.ops {
            out.extend_from_slice(&(op.start as u32).to_be_bytes());
            out.extend_from_slice(&(op.end as u32).to_be_bytes());
            out.extend_from_slice(&(op.data.len() as u32).to_be_bytes());
            out.extend_from_slice(&op.data);
        }
        out
    }

    /// Apply to `base`, left to right
    pub fn apply(&self, base: &[u8]) -> Result<Vec<u8>, PatchError> {
        let inserted: usize = self.ops.iter().map(|op| op.data.len()).sum();
        let mut out = Vec::with_capacity(base.len() + inserted);
        let mut last_end = 0;
        for op in &self.ops {
            if op.start > op.end {
                return Err(PatchError::Inverted {
                    start: op.start,
                    end: op.end,
                });
            }
            if op.start < last_end {
                return Err(PatchError::OutOfOrder {
                    start: op.start,
                    previous_end: last_end,
                });
            }
            if op.end > base.len() {
                return Err(PatchError::OutOfRange {
                    end: op.end,
                    len: base.len(),
                });
            }
            out.extend_from_slice(&base[last_end..op.start]);
            out.extend_from_slice(&op.data);
            last_end = op.end;
        }
        out.extend_from_slice(&base[last_end..]);
        Ok(out)
    }

    /// Compute a line-based patch turning `old` into `new`.
    ///
    /// Fragments touching each other are merged, so offsets in the result are
    /// strictly increasing.
    pub fn diff(old: &[u8], new: &[u8]) -> Self {
        if old == new {
            return Self::default();
        }

        let old_lines: Vec<&[u8]> = old.split_inclusive(|b| *b == b'\n').collect();
        let new_lines: Vec<&[u8]> = new.split_inclusive(|b| *b == b'\n').collect();
        let old_offsets = line_offsets(&old_lines);
        let new_offsets = line_offsets(&new_lines);

        let mut ops: Vec<PatchOp> = Vec::new();
        for diff_op in capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines) {
            let (tag, old_range, new_range) = diff_op.as_tag_tuple();
            if tag == DiffTag::Equal {
                continue;
            }
            let start = old_offsets[old_range.start];
            let end = old_offsets[old_range.end];
            let data = &new[new_offsets[new_range.start]..new_offsets[new_range.end]];

            match ops.last_mut() {
                Some(last) if last.end == start => {
                    last.end = end;
                    last.data.extend_from_slice(data);
                }
                _ => ops.push(PatchOp {
                    start,
                    end,
                    data: data.to_vec(),
                }),
            }
        }
        Self { ops }
    }
}

/// Serialized patch turning `previous` into `current`
pub fn encode_delta(previous: &[u8], current: &[u8]) -> Bytes {
    Bytes::from(Patch::diff(previous, current).to_bytes())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Byte offset of the start of every line, plus the total length
fn line_offsets(lines: &[&[u8]]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(lines.len() + 1);
    let mut pos = 0;
    offsets.push(0);
    for line in lines {
        pos += line.len();
        offsets.push(pos);
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_apply_replace_middle() {
        let patch = Patch::new(vec![PatchOp {
            start: 1,
            end: 2,
            data: b"X".to_vec(),
        }]);
        assert_eq!(patch.apply(b"abc").unwrap(), b"aXc");
    }

    #[test]
    fn test_parse_serialize() {
        let patch = Patch::new(vec![
            PatchOp {
                start: 0,
                end: 0,
                data: b"head\n".to_vec(),
            },
            PatchOp {
                start: 4,
                end: 9,
                data: Vec::new(),
            },
        ]);
        let bytes = patch.to_bytes();
        assert_eq!(bytes.len(), 12 + 5 + 12);
        assert_eq!(Patch::parse(&bytes).unwrap(), patch);
    }

    #[test]
    fn test_truncated_fragment_rejected() {
        let mut bytes = Patch::new(vec![PatchOp {
            start: 0,
            end: 0,
            data: b"abc".to_vec(),
        }])
        .to_bytes();
        bytes.pop();
        assert!(matches!(Patch::parse(&bytes), Err(PatchError::Truncated(_))));
        assert!(matches!(Patch::parse(&bytes[..5]), Err(PatchError::Truncated(0))));
    }

    #[test]
    fn test_overlapping_fragments_rejected() {
        let patch = Patch::new(vec![
            PatchOp {
                start: 0,
                end: 3,
                data: Vec::new(),
            },
            PatchOp {
                start: 2,
                end: 4,
                data: Vec::new(),
            },
        ]);
        assert_eq!(
            patch.apply(b"abcdef"),
            Err(PatchError::OutOfOrder {
                start: 2,
                previous_end: 3
            })
        );
    }

    #[test]
    fn test_out_of_range_and_inverted() {
        let beyond = Patch::new(vec![PatchOp {
            start: 0,
            end: 10,
            data: Vec::new(),
        }]);
        assert!(matches!(
            beyond.apply(b"abc"),
            Err(PatchError::OutOfRange { end: 10, len: 3 })
        ));

        let inverted = Patch::new(vec![PatchOp {
            start: 2,
            end: 1,
            data: Vec::new(),
        }]);
        assert!(matches!(inverted.apply(b"abc"), Err(PatchError::Inverted { .. })));
    }

    #[test]
    fn test_diff_identical_is_empty() {
        assert!(Patch::diff(b"same\n", b"same\n").is_empty());
        assert!(encode_delta(b"same\n", b"same\n").is_empty());
    }

    #[test]
    fn test_diff_offsets_strictly_increase() {
        let old = b"a\nb\nc\nd\n";
        let new = b"a\nB\nC\nd\ne\n";
        let patch = Patch::diff(old, new);
        for pair in patch.ops().windows(2) {
            assert!(pair[1].start > pair[0].end);
        }
        assert_eq!(patch.apply(old).unwrap(), new);
    }

    #[test]
    fn test_error_names_revision() {
        let id = HgId::new([7u8; 20]);
        let err = PatchError::Truncated(4).for_revision(id);
        assert_eq!(err.kind(), "CorruptDeltaError");
        assert!(err.to_string().contains(&id.to_hex()));
    }

    fn text() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(
            prop_oneof![Just(b'\n'), Just(b'a'), Just(b'b'), any::<u8>()],
            0..200,
        )
    }

    proptest! {
        #[test]
        fn prop_diff_roundtrip(old in text(), new in text()) {
            let patch = Patch::diff(&old, &new);
            let reparsed = Patch::parse(&patch.to_bytes()).unwrap();
            prop_assert_eq!(reparsed.apply(&old).unwrap(), new);
        }
    }
}
