//! Revision identifiers for both sides of the bridge
//!
//! Both systems use 160-bit SHA-1 identifiers, but the identifier spaces are
//! disjoint: an [`HgId`] is never valid as a [`GitId`] without going through
//! the correspondence store. Two distinct newtypes enforce that.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Length of a raw identifier in bytes
pub const ID_LEN: usize = 20;

/// Length of a hex-encoded identifier
pub const HEX_LEN: usize = 40;

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// The all-zero identifier
            pub const NULL: $name = $name([0u8; ID_LEN]);

            /// Create an identifier from raw bytes
            pub const fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Create an identifier from a 20-byte slice
            pub fn from_slice(bytes: &[u8]) -> Result<Self, BridgeError> {
                let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
                    BridgeError::InvalidId(format!(
                        "expected {} bytes, got {}",
                        ID_LEN,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            /// Parse from a 40-character hexadecimal string
            pub fn from_hex(hex_str: &str) -> Result<Self, BridgeError> {
                if hex_str.len() != HEX_LEN {
                    return Err(BridgeError::InvalidId(hex_str.to_string()));
                }
                let mut arr = [0u8; ID_LEN];
                hex::decode_to_slice(hex_str, &mut arr)
                    .map_err(|_| BridgeError::InvalidId(hex_str.to_string()))?;
                Ok(Self(arr))
            }

            /// Convert to hexadecimal string
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Get raw bytes
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            pub fn is_null(&self) -> bool {
                self.0 == [0u8; ID_LEN]
            }

            /// `None` for the null identifier
            pub fn non_null(self) -> Option<Self> {
                if self.is_null() { None } else { Some(self) }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = BridgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = BridgeError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::from_hex(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_hex()
            }
        }
    };
}

object_id!(
    /// Identifier of a Mercurial-side revision (changeset, manifest or file node)
    HgId
);

object_id!(
    /// Identifier of a git object (blob, tree or commit)
    GitId
);

/// Node id of the empty root revision: `hash(null, null, "")`
pub const EMPTY_REVISION: HgId = HgId::new([
    0xb8, 0x0d, 0xe5, 0xd1, 0x38, 0x75, 0x85, 0x41, 0xc5, 0xf0, 0x52, 0x65, 0xad, 0x14, 0x4a, 0xb9,
    0xfa, 0x86, 0xd1, 0xdb,
]);

/// Id of the empty git tree
pub const EMPTY_TREE: GitId = GitId::new([
    0x4b, 0x82, 0x5d, 0xc6, 0x42, 0xcb, 0x6e, 0xb9, 0xa0, 0x60, 0x0e, 0x54, 0xbf, 0x8d, 0x69, 0x28,
    0x8f, 0xbe, 0x49, 0x04,
]);

impl HgId {
    /// Compute a node id the way Mercurial does: the two parents in sorted
    /// order followed by the full text.
    pub fn hash(p1: &HgId, p2: &HgId, text: &[u8]) -> HgId {
        let (a, b) = if p1 <= p2 { (p1, p2) } else { (p2, p1) };
        let mut hasher = Sha1::new();
        hasher.update(a.as_bytes());
        hasher.update(b.as_bytes());
        hasher.update(text);
        HgId(hasher.finalize().into())
    }
}

impl GitId {
    /// Compute a git object id over `"<kind> <len>\0" + body`
    pub fn hash(kind: &str, body: &[u8]) -> GitId {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_bytes());
        hasher.update(b" ");
        hasher.update(body.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(body);
        GitId(hasher.finalize().into())
    }
}

/// Validated abbreviation length for printing identifiers (3..=40)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbbrevSize(usize);

impl AbbrevSize {
    pub const FULL: AbbrevSize = AbbrevSize(HEX_LEN);
    pub const DEFAULT: AbbrevSize = AbbrevSize(12);

    pub fn get(self) -> usize {
        self.0
    }

    /// Truncate a full hex identifier
    pub fn apply<'a>(&self, hex: &'a str) -> &'a str {
        &hex[..self.0.min(hex.len())]
    }
}

impl FromStr for AbbrevSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = usize::from_str(s).map_err(|e| e.to_string())?;
        match value {
            3..=HEX_LEN => Ok(AbbrevSize(value)),
            v if v > HEX_LEN => Err(format!("value too large: {}", v)),
            v => Err(format!("value too small: {}", v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_hex_roundtrip() {
        let id = HgId::new([42u8; 20]);
        let parsed = HgId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), 40);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(GitId::from_hex("abc").is_err());
        assert!(GitId::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn test_empty_revision_constant() {
        assert_eq!(HgId::hash(&HgId::NULL, &HgId::NULL, b""), EMPTY_REVISION);
        assert_eq!(
            EMPTY_REVISION.to_hex(),
            "b80de5d138758541c5f05265ad144ab9fa86d1db"
        );
    }

    #[test]
    fn test_hg_hash_is_parent_order_independent() {
        let a = HgId::new([1u8; 20]);
        let b = HgId::new([2u8; 20]);
        assert_eq!(HgId::hash(&a, &b, b"text"), HgId::hash(&b, &a, b"text"));
    }

    #[test]
    fn test_git_hash_matches_git() {
        assert_eq!(
            GitId::hash("blob", b"").to_hex(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        assert_eq!(GitId::hash("tree", b""), EMPTY_TREE);
    }

    #[test]
    fn test_abbrev_size_bounds() {
        assert!("2".parse::<AbbrevSize>().is_err());
        assert!("41".parse::<AbbrevSize>().is_err());
        let abbrev: AbbrevSize = "7".parse().unwrap();
        assert_eq!(abbrev.apply("0123456789abcdef"), "0123456");
    }

    #[test]
    fn test_serde_as_hex() {
        let id = GitId::new([0xab; 20]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let back: GitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
