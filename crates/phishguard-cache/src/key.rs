//! Subject normalization and storage-key derivation.
//!
//! A subject (a URL typed by a user, or a raw email-header blob) is turned
//! into an [`Identity`]: the canonical string two requests must share to be
//! served from the same cache entry. The [`StorageKey`] is a short digest of
//! the identity used as the on-disk filename.
//!
//! Normalization never fails. Input that cannot be read as a URL degrades to
//! a content hash of the trimmed, lowercased text.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marker for identities derived from a URL.
pub const URL_MARKER: &str = "url:";

/// Marker for identities of URL-kind input that could not be parsed.
pub const RAW_MARKER: &str = "raw:";

/// Marker for identities derived from opaque blobs.
pub const BLOB_MARKER: &str = "blob:";

/// Hex characters in a [`StorageKey`].
pub const STORAGE_KEY_LEN: usize = 16;

lazy_static! {
    /// Host with optional port. Bracketed IPv6 literals are accepted.
    static ref HOST_PATTERN: Regex = Regex::new(
        r"^(?:\[[0-9a-f:.]+\]|[\p{L}\p{N}_-]+(?:\.[\p{L}\p{N}_-]+)*)(?::[0-9]{1,5})?$"
    ).unwrap();

    static ref DIGEST_PATTERN: Regex = Regex::new(r"^[0-9a-f]{64}$").unwrap();

    static ref KEY_PATTERN: Regex = Regex::new(r"^[0-9A-Za-z_-]{1,128}$").unwrap();
}

/// What kind of subject is being cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// A URL; superficial variants share one identity.
    Url,

    /// Opaque bytes such as raw email headers; only byte-identical blobs
    /// share an identity.
    Blob,
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKind::Url => write!(f, "url"),
            SubjectKind::Blob => write!(f, "blob"),
        }
    }
}

/// Canonical representation of a cache subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Borrow the identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the storage key for this identity.
    pub fn storage_key(&self) -> StorageKey {
        StorageKey::derive(self)
    }

    /// Recognize a string that is already a normalized identity of `kind`.
    ///
    /// Markers of the other kind are not recognized, so a blob can never
    /// take on a URL identity or the reverse.
    fn recognize(candidate: &str, kind: SubjectKind) -> Option<Identity> {
        let recognized = match kind {
            SubjectKind::Url => {
                if let Some(body) = candidate.strip_prefix(URL_MARKER) {
                    is_normalized_url(body)
                } else if let Some(body) = candidate.strip_prefix(RAW_MARKER) {
                    DIGEST_PATTERN.is_match(body)
                } else {
                    false
                }
            }
            SubjectKind::Blob => candidate
                .strip_prefix(BLOB_MARKER)
                .is_some_and(|body| DIGEST_PATTERN.is_match(body)),
        };

        recognized.then(|| Identity(candidate.to_string()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Short, filesystem-safe primary key of a cache record.
///
/// Keys derived by [`StorageKey::derive`] are 16 lowercase hex characters.
/// Keys read back from a store may follow an older scheme; any stem made of
/// ASCII alphanumerics, `-` and `_` is accepted so such records can still be
/// listed, reconciled and deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// Digest an identity into its canonical key.
    pub fn derive(identity: &Identity) -> Self {
        let digest = Sha256::digest(identity.as_str().as_bytes());
        Self(hex::encode(&digest[..STORAGE_KEY_LEN / 2]))
    }

    /// Accept a key read from the store (e.g. a filename stem).
    pub fn parse(stem: &str) -> Option<Self> {
        KEY_PATTERN.is_match(stem).then(|| Self(stem.to_string()))
    }

    /// Borrow the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key was produced by the current derivation scheme.
    pub fn is_canonical_for(&self, identity: &Identity) -> bool {
        *self == Self::derive(identity)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a subject of the given kind into its identity.
pub fn normalize(subject: &str, kind: SubjectKind) -> Identity {
    if let Some(identity) = Identity::recognize(subject, kind) {
        return identity;
    }

    match kind {
        SubjectKind::Url => normalize_url(subject),
        SubjectKind::Blob => normalize_blob(subject.as_bytes()),
    }
}

/// Identity of a blob given as raw bytes, which need not be UTF-8.
///
/// UTF-8 input gets the same identity as `normalize(text, SubjectKind::Blob)`.
pub fn normalize_blob_bytes(bytes: &[u8]) -> Identity {
    match std::str::from_utf8(bytes) {
        Ok(text) => normalize(text, SubjectKind::Blob),
        Err(_) => normalize_blob(bytes),
    }
}

/// Identity of an opaque blob: a SHA-256 digest of its exact bytes.
pub fn normalize_blob(bytes: &[u8]) -> Identity {
    Identity(format!("{}{}", BLOB_MARKER, sha256_hex(bytes)))
}

fn normalize_url(subject: &str) -> Identity {
    let lowered = subject.trim().to_lowercase();

    let mut rest = lowered.as_str();
    rest = rest
        .strip_prefix("https://")
        .or_else(|| rest.strip_prefix("http://"))
        .unwrap_or(rest);
    rest = rest.strip_prefix("www.").unwrap_or(rest);
    if let Some(cut) = rest.find(['?', '#']) {
        rest = &rest[..cut];
    }
    rest = rest.trim_end_matches('/');

    if is_normalized_url(rest) {
        Identity(format!("{}{}", URL_MARKER, rest))
    } else {
        tracing::debug!(subject = %subject, "Unparseable URL, falling back to content hash");
        Identity(format!("{}{}", RAW_MARKER, sha256_hex(lowered.as_bytes())))
    }
}

/// Whether `body` has the shape [`normalize_url`] produces.
fn is_normalized_url(body: &str) -> bool {
    if body.is_empty()
        || body.ends_with('/')
        || body.contains(['?', '#'])
        || body.chars().any(char::is_whitespace)
        || body.to_lowercase() != body
    {
        return false;
    }

    let host = body.split('/').next().unwrap_or_default();
    HOST_PATTERN.is_match(host)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
