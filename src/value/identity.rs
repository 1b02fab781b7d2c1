//! Content-addressed entity identities.
//!
//! An `Identity` is a 20-byte hash, optionally carrying the original string
//! it was derived from, plus a lazily computed 25-character ASCII encoding
//! whose lexicographic order equals the byte order of the hash.
//!
//! Identities are interned process-wide: `Identity::intern` returns the
//! canonical instance for a hash, so repeated references to one entity share
//! a single allocation. The table is append-only for the life of the
//! process; `clear_interns` exists for test teardown only.

use crate::error::{QueryError, Result};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Length of the raw identity hash in bytes.
pub const HASH_LEN: usize = 20;

/// Length of the sortable text encoding.
pub const ENCODED_LEN: usize = 25;

// Digit alphabet: 85 consecutive ASCII codes starting at '!'. Consecutive
// codes keep digit order equal to ASCII order, which keeps encoded-string
// order equal to hash byte order.
const DIGIT_BASE: u8 = b'!';
const RADIX: u32 = 85;

struct IdentityInner {
    hash: [u8; HASH_LEN],
    original: Option<String>,
    encoded: OnceLock<String>,
}

/// A 20-byte content-addressed entity reference.
///
/// Equality, ordering, and hashing consider the raw hash bytes only; the
/// preserved original string is display metadata.
#[derive(Clone)]
pub struct Identity(Arc<IdentityInner>);

impl Identity {
    /// Build from raw hash bytes.
    pub fn from_bytes(hash: [u8; HASH_LEN]) -> Self {
        Identity(Arc::new(IdentityInner {
            hash,
            original: None,
            encoded: OnceLock::new(),
        }))
    }

    /// Hash an arbitrary string into an identity, preserving the string.
    pub fn of(original: &str) -> Self {
        let digest = Sha256::digest(original.as_bytes());
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&digest[..HASH_LEN]);
        Identity(Arc::new(IdentityInner {
            hash,
            original: Some(original.to_string()),
            encoded: OnceLock::new(),
        }))
    }

    /// Parse a 40-character hex string.
    pub fn from_hex(input: &str) -> Result<Self> {
        let bytes = input.as_bytes();
        if bytes.len() != HASH_LEN * 2 {
            return Err(QueryError::InvalidIdentity {
                input: input.to_string(),
            });
        }
        let mut hash = [0u8; HASH_LEN];
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_nibble(chunk[0]);
            let lo = hex_nibble(chunk[1]);
            match (hi, lo) {
                (Some(h), Some(l)) => hash[i] = (h << 4) | l,
                _ => {
                    return Err(QueryError::InvalidIdentity {
                        input: input.to_string(),
                    })
                }
            }
        }
        Ok(Identity::from_bytes(hash))
    }

    /// Canonical interned instance for a hash.
    pub fn intern(hash: [u8; HASH_LEN], original: Option<&str>) -> Self {
        let table = intern_table();
        if let Some(existing) = table.get(&hash) {
            return existing.clone();
        }
        let fresh = Identity(Arc::new(IdentityInner {
            hash,
            original: original.map(ToString::to_string),
            encoded: OnceLock::new(),
        }));
        table.entry(hash).or_insert(fresh).clone()
    }

    /// Raw hash bytes.
    pub fn bytes(&self) -> &[u8; HASH_LEN] {
        &self.0.hash
    }

    /// The original string this identity was derived from, when known.
    pub fn original(&self) -> Option<&str> {
        self.0.original.as_deref()
    }

    /// Lexicographically sortable 25-character encoding, computed on first
    /// use and cached for the life of the identity.
    pub fn encoded(&self) -> &str {
        self.0.encoded.get_or_init(|| l85_encode(&self.0.hash))
    }

    /// Parse the 25-character sortable encoding.
    pub fn from_encoded(input: &str) -> Result<Self> {
        l85_decode(input).map(Identity::from_bytes)
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.0.hash == other.0.hash
    }
}

impl Eq for Identity {}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.hash.cmp(&other.0.hash)
    }
}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash.hash(state);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.original() {
            Some(orig) => write!(f, "Identity({orig})"),
            None => write!(f, "Identity({})", self.encoded()),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.original() {
            Some(orig) => write!(f, "#id \"{orig}\""),
            None => write!(f, "#id \"{}\"", self.encoded()),
        }
    }
}

impl serde::Serialize for Identity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (self.0.hash, self.original()).serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (hash, original): ([u8; HASH_LEN], Option<String>) =
            serde::Deserialize::deserialize(deserializer)?;
        Ok(Identity(Arc::new(IdentityInner {
            hash,
            original,
            encoded: OnceLock::new(),
        })))
    }
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn intern_table() -> &'static DashMap<[u8; HASH_LEN], Identity> {
    static TABLE: OnceLock<DashMap<[u8; HASH_LEN], Identity>> = OnceLock::new();
    TABLE.get_or_init(DashMap::new)
}

/// Drop all interned identities. Test teardown only.
pub fn clear_identity_interns() {
    intern_table().clear();
}

/// Encode 20 bytes as 25 base-85 digits, big-endian.
///
/// The digit alphabet is 85 consecutive ASCII codes, so string order on
/// encodings equals byte order on inputs.
pub fn l85_encode(hash: &[u8; HASH_LEN]) -> String {
    // Repeated divmod of the big-endian number by 85, least significant
    // digit first.
    let mut scratch = *hash;
    let mut digits = [0u8; ENCODED_LEN];
    for slot in digits.iter_mut().rev() {
        let mut remainder: u32 = 0;
        for byte in scratch.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            *byte = (acc / RADIX) as u8;
            remainder = acc % RADIX;
        }
        *slot = DIGIT_BASE + remainder as u8;
    }
    // Digits are ASCII by construction.
    String::from_utf8_lossy(&digits).into_owned()
}

/// Decode a 25-character base-85 encoding back to 20 bytes.
pub fn l85_decode(input: &str) -> Result<[u8; HASH_LEN]> {
    let bytes = input.as_bytes();
    if bytes.len() != ENCODED_LEN {
        return Err(QueryError::InvalidIdentity {
            input: input.to_string(),
        });
    }
    let mut out = [0u8; HASH_LEN];
    for &c in bytes {
        if !(DIGIT_BASE..DIGIT_BASE + RADIX as u8).contains(&c) {
            return Err(QueryError::InvalidIdentity {
                input: input.to_string(),
            });
        }
        let digit = u32::from(c - DIGIT_BASE);
        // out = out * 85 + digit, big-endian with carry.
        let mut carry = digit;
        for byte in out.iter_mut().rev() {
            let acc = u32::from(*byte) * RADIX + carry;
            *byte = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        if carry != 0 {
            // 85^25 slightly exceeds 2^160; reject encodings past the top.
            return Err(QueryError::InvalidIdentity {
                input: input.to_string(),
            });
        }
    }
    Ok(out)
}
