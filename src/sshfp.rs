//! SSHFP (DNS RRtype 44) record parsing and host key validation.
//!
//! Records arrive either in presentation form, `<algo> <type> <hex>`, or
//! in the generic form `\# <size> <hex>` carrying the raw RDATA. A parsed
//! set validates a server key by trying hash types in priority order,
//! SHA-256 before SHA-1; a record set whose only entries use hash types the
//! validator cannot compute is [`Validity::Insufficient`] rather than a
//! mismatch, and the caller proceeds as if no SSHFP were published.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::BTreeMap;

use crate::ssh::{Key, KeyType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Algorithm {
    Unset,
    Reserved,
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl Algorithm {
    fn from_number(n: u8) -> Algorithm {
        match n {
            0 => Algorithm::Reserved,
            1 => Algorithm::Rsa,
            2 => Algorithm::Dsa,
            3 => Algorithm::Ecdsa,
            4 => Algorithm::Ed25519,
            _ => Algorithm::Unset,
        }
    }

    fn from_key(key: &Key) -> Algorithm {
        match key.key_type() {
            KeyType::Rsa => Algorithm::Rsa,
            KeyType::Dss => Algorithm::Dsa,
            KeyType::Ecdsa => Algorithm::Ecdsa,
            KeyType::Ed25519 => Algorithm::Ed25519,
            KeyType::Unknown => Algorithm::Unset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HashType {
    Unset,
    Reserved,
    Sha1,
    Sha256,
}

impl HashType {
    fn from_number(n: u8) -> HashType {
        match n {
            0 => HashType::Reserved,
            1 => HashType::Sha1,
            2 => HashType::Sha256,
            _ => HashType::Unset,
        }
    }
}

/// Hash types checked against a key, best first.
const HASH_PRIORITY: &[HashType] = &[HashType::Sha256, HashType::Sha1];

/// The digest of `key` in the form `hash` records carry, or `None` while
/// the hash is unsupported.
// TODO: return the SHA-256 digest once the session facade can hash server
// keys with it; SHA-256-only RRsets currently come out Insufficient.
fn key_digest(key: &Key, hash: HashType) -> Option<Vec<u8>> {
    match hash {
        HashType::Sha1 => Some(key.sha1_digest()),
        _ => None,
    }
}

/// Outcome of validating a key against a record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// A fingerprint at the best usable hash type matches.
    Valid,
    /// Fingerprints exist at a usable hash type and none match.
    Invalid,
    /// No fingerprint at any hash type the validator can compute.
    Insufficient,
}

/// One fingerprint from an SSHFP RRset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    algorithm: Algorithm,
    hash_type: HashType,
    digest: Vec<u8>,
}

impl Fingerprint {
    /// Parses one RDATA in either presentation or generic form.
    pub fn parse(rdata: &str) -> Option<Fingerprint> {
        let (algorithm_num, type_num, digest) = parse_generic(rdata)
            .or_else(|| parse_presentation(rdata))?;
        Some(Fingerprint {
            algorithm: Algorithm::from_number(algorithm_num),
            hash_type: HashType::from_number(type_num),
            digest,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }
}

/// Decodes hex, skipping spaces and `:` separators. An odd trailing
/// nibble is dropped.
fn parse_hex(hex: &str) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut pending: Option<u8> = None;
    for c in hex.chars() {
        if c == ':' || c == ' ' {
            continue;
        }
        let nibble = c.to_digit(16)? as u8;
        match pending.take() {
            None => pending = Some(nibble),
            Some(high) => out.push((high << 4) | nibble),
        }
    }
    Some(out)
}

/// Generic RDATA form: `\# <size-decimal> <hex-bytes>` where the bytes are
/// `[algo, hash-type, ...fingerprint]`. The size field is implied by the
/// data and ignored.
fn parse_generic(rdata: &str) -> Option<(u8, u8, Vec<u8>)> {
    let rest = rdata.strip_prefix("\\# ")?;
    let (_size, hex) = rest.split_once([' ', '\t'])?;
    let data = parse_hex(hex)?;
    if data.len() < 3 {
        // One byte of algorithm, one of hash type, at least one of
        // fingerprint.
        return None;
    }
    Some((data[0], data[1], data[2..].to_vec()))
}

/// Presentation form: `<algo-int> <hash-type-int> <hex-fingerprint>`.
fn parse_presentation(rdata: &str) -> Option<(u8, u8, Vec<u8>)> {
    let mut fields = rdata.splitn(3, [' ', '\t']);
    let algorithm_num = fields.next()?.parse::<u8>().ok()?;
    let type_num = fields.next()?.parse::<u8>().ok()?;
    let digest = parse_hex(fields.next()?)?;
    if digest.is_empty() {
        return None;
    }
    Some((algorithm_num, type_num, digest))
}

/// A parsed SSHFP RRset, ordered by algorithm then hash type.
#[derive(Debug, Default, Clone)]
pub struct RecordSet {
    fingerprints: BTreeMap<Algorithm, BTreeMap<HashType, Vec<Fingerprint>>>,
}

impl RecordSet {
    /// Parses an RRset, erasing any previously parsed data. Returns false
    /// on the first record that does not parse; records before it are
    /// kept, so a partially parsed set still validates what it can.
    pub fn parse(&mut self, rdata: &[String]) -> bool {
        self.fingerprints.clear();
        for r in rdata {
            let Some(fp) = Fingerprint::parse(r) else {
                return false;
            };
            self.fingerprints
                .entry(fp.algorithm)
                .or_default()
                .entry(fp.hash_type)
                .or_default()
                .push(fp);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Validates `key` against the set, trying hash types in priority
    /// order for the key's algorithm.
    pub fn validate(&self, key: &Key) -> Validity {
        let algorithm = Algorithm::from_key(key);
        if algorithm == Algorithm::Unset {
            return Validity::Insufficient;
        }
        let Some(by_type) = self.fingerprints.get(&algorithm) else {
            return Validity::Insufficient;
        };

        for hash in HASH_PRIORITY {
            let Some(prints) = by_type.get(hash) else { continue };
            if prints.is_empty() {
                continue;
            }
            let Some(digest) = key_digest(key, *hash) else {
                // Records exist at this type but it is not usable yet;
                // fall through to the next priority.
                continue;
            };
            if prints.iter().any(|fp| fp.digest == digest) {
                return Validity::Valid;
            }
            return Validity::Invalid;
        }
        Validity::Insufficient
    }
}
