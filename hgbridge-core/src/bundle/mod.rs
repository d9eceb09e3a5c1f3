//! Bundle codec
//!
//! Decodes delta-encoded revision streams into full texts and encodes full
//! texts back. The codec does not interpret the bytes it produces: changeset,
//! manifest and file texts all go through the same chain mechanism.

pub mod chain;
pub mod patch;
pub mod stream;

pub use chain::{BaseResolver, ChainDecoder, FullRevision, NoBases, encode_chain};
pub use patch::{Patch, PatchError, PatchOp, encode_delta};
pub use stream::{
    BUNDLE_MAGIC, BUNDLE_VERSION, Bundle, BundleReader, BundleWriter, Group, GroupKind,
    RevisionRecord,
};
