//! Changeset texts and authorship conversion
//!
//! ## Format
//!
//! ```text
//! <manifest hex>
//! <user>
//! <time> <tz>[ <extra>]
//! <file>*
//!
//! <description>
//! ```
//!
//! `tz` is seconds west of UTC. `extra` holds `key:value` pairs joined by
//! `\0`, sorted by key, with `\\`, `\n`, `\r` and `\0` escaped.

use std::collections::BTreeMap;

use crate::error::{BridgeError, Result};
use crate::id::HgId;

/// Extra key holding the git committer when it differs from the author
pub const EXTRA_COMMITTER: &[u8] = b"committer";

/// Extra key set on synthetic merges, holding the git commit they stand for
pub const EXTRA_OCTOPUS: &[u8] = b"octopus";

/// Parsed changeset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub manifest: HgId,
    pub user: Vec<u8>,
    pub time: i64,
    /// Seconds west of UTC
    pub tz: i32,
    pub extra: BTreeMap<Vec<u8>, Vec<u8>>,
    pub files: Vec<Vec<u8>>,
    pub description: Vec<u8>,
}

impl Changeset {
    /// Parse changeset text. `id` names the changeset in errors.
    pub fn parse(text: &[u8], id: &HgId) -> Result<Self> {
        let malformed = |message: &str| BridgeError::malformed("changeset", id, message);

        let split = text
            .windows(2)
            .position(|w| w == b"\n\n")
            .ok_or_else(|| malformed("missing description separator"))?;
        let header = &text[..split];
        let description = text[split + 2..].to_vec();

        let mut lines = header.split(|b| *b == b'\n');
        let manifest_hex = lines.next().ok_or_else(|| malformed("missing manifest"))?;
        let manifest = std::str::from_utf8(manifest_hex)
            .map_err(|_| malformed("non-ascii manifest id"))
            .and_then(HgId::from_hex)?;
        let user = lines.next().ok_or_else(|| malformed("missing user"))?.to_vec();
        let date_line = lines.next().ok_or_else(|| malformed("missing date"))?;
        let files = lines.map(<[u8]>::to_vec).collect();

        let mut date_parts = date_line.splitn(3, |b| *b == b' ');
        let time = date_parts
            .next()
            .and_then(|t| std::str::from_utf8(t).ok())
            .and_then(parse_time)
            .ok_or_else(|| malformed("invalid time"))?;
        let tz = date_parts
            .next()
            .and_then(|t| std::str::from_utf8(t).ok())
            .and_then(|t| t.parse::<i32>().ok())
            .ok_or_else(|| malformed("invalid timezone"))?;
        let extra = match date_parts.next() {
            Some(raw) => parse_extra(raw).ok_or_else(|| malformed("invalid extra"))?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            manifest,
            user,
            time,
            tz,
            extra,
            files,
            description,
        })
    }

    /// Canonical changeset text
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.manifest.to_hex().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.user);
        out.push(b'\n');
        out.extend_from_slice(format!("{} {}", self.time, self.tz).as_bytes());
        if !self.extra.is_empty() {
            out.push(b' ');
            out.extend_from_slice(&encode_extra(&self.extra));
        }
        out.push(b'\n');
        let mut files = self.files.clone();
        files.sort();
        for file in &files {
            out.extend_from_slice(file);
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.description);
        out
    }

    /// Author of the changeset as a git identity
    pub fn author(&self) -> Authorship {
        Authorship::from_hg(&self.user, self.time, self.tz)
    }

    /// Committer recorded in extra, falling back to the author
    pub fn committer(&self) -> Authorship {
        self.extra
            .get(EXTRA_COMMITTER)
            .and_then(|raw| Authorship::from_git_bytes(raw))
            .unwrap_or_else(|| self.author())
    }
}

fn parse_time(raw: &str) -> Option<i64> {
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|t| t as i64))
}

fn parse_extra(raw: &[u8]) -> Option<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut extra = BTreeMap::new();
    for item in raw.split(|b| *b == 0) {
        let item = unescape(item)?;
        let colon = item.iter().position(|b| *b == b':')?;
        extra.insert(item[..colon].to_vec(), item[colon + 1..].to_vec());
    }
    Some(extra)
}

fn encode_extra(extra: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let items: Vec<Vec<u8>> = extra
        .iter()
        .map(|(key, value)| {
            let mut item = key.clone();
            item.push(b':');
            item.extend_from_slice(value);
            escape(&item)
        })
        .collect();
    items.join(&b"\0"[..])
}

fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for byte in raw {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0 => out.extend_from_slice(b"\\0"),
            other => out.push(*other),
        }
    }
    out
}

fn unescape(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(byte) = bytes.next() {
        if *byte != b'\\' {
            out.push(*byte);
            continue;
        }
        match bytes.next()? {
            b'\\' => out.push(b'\\'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b'0' => out.push(0),
            _ => return None,
        }
    }
    Some(out)
}

/// An identity with a timestamp, convertible between both systems
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorship {
    /// `Name <email>`
    pub ident: Vec<u8>,
    pub time: i64,
    /// Seconds east of UTC
    pub utc_offset: i32,
}

impl Authorship {
    /// From an hg user, time and tz (seconds west of UTC)
    pub fn from_hg(user: &[u8], time: i64, tz: i32) -> Self {
        let user = user.trim_ascii();
        let ident = match (user.iter().position(|b| *b == b'<'), user.last()) {
            (Some(lt), Some(b'>')) => {
                let name = user[..lt].trim_ascii();
                let mut ident = name.to_vec();
                if !ident.is_empty() {
                    ident.push(b' ');
                }
                ident.extend_from_slice(&user[lt..]);
                ident
            }
            _ => {
                let mut ident = user.to_vec();
                ident.extend_from_slice(b" <>");
                ident
            }
        };
        Self {
            ident,
            time,
            utc_offset: -tz,
        }
    }

    /// Parse a git `Name <email> <time> <+HHMM>` line
    pub fn from_git_bytes(raw: &[u8]) -> Option<Self> {
        let mut parts = raw.rsplitn(3, |b| *b == b' ');
        let offset = parts.next()?;
        let time = std::str::from_utf8(parts.next()?).ok()?.parse::<i64>().ok()?;
        let ident = parts.next()?.to_vec();
        let offset = std::str::from_utf8(offset).ok()?;
        let (sign, digits) = match offset.as_bytes().first()? {
            b'+' => (1, &offset[1..]),
            b'-' => (-1, &offset[1..]),
            _ => return None,
        };
        if digits.len() != 4 {
            return None;
        }
        let hours: i32 = digits[..2].parse().ok()?;
        let minutes: i32 = digits[2..].parse().ok()?;
        Some(Self {
            ident,
            time,
            utc_offset: sign * (hours * 3600 + minutes * 60),
        })
    }

    /// Git form: `Name <email> <time> <+HHMM>`
    pub fn to_git_bytes(&self) -> Vec<u8> {
        let sign = if self.utc_offset < 0 { '-' } else { '+' };
        let abs = self.utc_offset.unsigned_abs();
        let mut out = self.ident.clone();
        out.extend_from_slice(
            format!(" {} {}{:02}{:02}", self.time, sign, abs / 3600, (abs % 3600) / 60).as_bytes(),
        );
        out
    }

    /// Hg user, dropping an empty `<>` email
    pub fn hg_user(&self) -> Vec<u8> {
        match self.ident.strip_suffix(b" <>") {
            Some(name) => name.to_vec(),
            None => self.ident.clone(),
        }
    }

    /// Timezone in hg convention (seconds west of UTC)
    pub fn hg_tz(&self) -> i32 {
        -self.utc_offset
    }
}
