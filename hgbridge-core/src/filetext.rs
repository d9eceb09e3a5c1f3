//! File revision texts and their metadata envelope
//!
//! A file revision may start with `\x01\n<key: value\n>*\x01\n` (copy
//! information). The envelope is not part of the file content: the git blob
//! only holds what follows it.

use bytes::Bytes;

const ENVELOPE: &[u8] = b"\x01\n";

/// Split a file revision text into (envelope body, content)
pub fn split(text: &Bytes) -> (Option<Bytes>, Bytes) {
    if !text.starts_with(ENVELOPE) {
        return (None, text.clone());
    }
    let body = &text[ENVELOPE.len()..];
    match body.windows(ENVELOPE.len()).position(|w| w == ENVELOPE) {
        Some(end) => {
            let meta_end = ENVELOPE.len() + end;
            let data_start = meta_end + ENVELOPE.len();
            (
                Some(text.slice(ENVELOPE.len()..meta_end)),
                text.slice(data_start..),
            )
        }
        // An unterminated envelope is plain content.
        None => (None, text.clone()),
    }
}

/// Content of a file revision, without the envelope
pub fn content(text: &Bytes) -> Bytes {
    split(text).1
}

/// Build a file revision text from an optional envelope and the content.
/// Content that itself starts with the envelope marker gets an empty
/// envelope so it is not misread.
pub fn join(meta: Option<&[u8]>, data: &[u8]) -> Bytes {
    match meta {
        None if !data.starts_with(ENVELOPE) => Bytes::copy_from_slice(data),
        meta => {
            let meta = meta.unwrap_or_default();
            let mut out = Vec::with_capacity(meta.len() + data.len() + 2 * ENVELOPE.len());
            out.extend_from_slice(ENVELOPE);
            out.extend_from_slice(meta);
            out.extend_from_slice(ENVELOPE);
            out.extend_from_slice(data);
            Bytes::from(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        let text = Bytes::from_static(b"hello\n");
        assert_eq!(split(&text), (None, text.clone()));
    }

    #[test]
    fn test_copy_metadata() {
        let text = Bytes::from_static(b"\x01\ncopy: a\ncopyrev: 0123\n\x01\nbody\n");
        let (meta, data) = split(&text);
        assert_eq!(meta.unwrap().as_ref(), b"copy: a\ncopyrev: 0123\n");
        assert_eq!(data.as_ref(), b"body\n");
    }

    #[test]
    fn test_join_escapes_marker() {
        let joined = join(None, b"\x01\nlooks like meta");
        assert_eq!(joined.as_ref(), b"\x01\n\x01\n\x01\nlooks like meta");
        assert_eq!(content(&joined).as_ref(), b"\x01\nlooks like meta");
        assert_eq!(join(None, b"plain").as_ref(), b"plain");
    }
}
