//! Key authorization directory
//!
//! A [`KeyMaster`] tracks which public keys are acceptable for which
//! subjects. Hubs index agent keys by identity; agents index hub keys by
//! hostname, address, or the wildcard `*`. One KeyMaster belongs to one
//! hub or one agent — do not share an instance across unrelated fabrics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use russh::keys::PublicKey;

use crate::keys::fingerprint;

/// What we have decided about a `(subject, key)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Seen but never ruled on
    Unknown,
    /// An operator approved this pair
    Authorized,
    /// An operator rejected this pair
    NotAuthorized,
}

/// One row of the [`KeyMaster::authorizations`] snapshot.
#[derive(Clone, Debug)]
pub struct Authorization {
    /// The public key on record
    pub key: PublicKey,
    /// The subject it is tracked under (agent identity, hostname,
    /// address, or `*`)
    pub identity: String,
    /// SHA-256 fingerprint of `key`
    pub fingerprint: String,
    /// Whether the pair is currently authorized
    pub authorized: bool,
    /// Whether an operator has ever ruled on the pair (true for both
    /// authorized and deauthorized; false while still unknown)
    pub known: bool,
}

/// Per-key record: the original key object is retained so an operator can
/// approve it later without re-receiving it.
struct Record {
    key: PublicKey,
    subjects: HashMap<String, Disposition>,
}

/// Tracks authorization decisions for `(subject, public-key)` pairs.
///
/// Cheap to clone; clones share the same directory. The index is keyed by
/// fingerprint so lookups never compare raw key bytes.
#[derive(Clone)]
pub struct KeyMaster {
    strict: bool,
    records: Arc<Mutex<HashMap<String, Record>>>,
}

impl KeyMaster {
    /// Create a directory. In strict mode, handshake gating refuses keys
    /// with no authorized subject; otherwise unknown keys are admitted and
    /// gated at dispatch time.
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether this directory gates handshakes strictly.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Authorize a key for one or more subjects. Idempotent.
    pub fn authorize(&self, key: &PublicKey, subjects: &[&str]) {
        self.set(key, subjects, Disposition::Authorized);
    }

    /// Deauthorize a key for one or more subjects. Idempotent.
    pub fn deauthorize(&self, key: &PublicKey, subjects: &[&str]) {
        self.set(key, subjects, Disposition::NotAuthorized);
    }

    fn set(&self, key: &PublicKey, subjects: &[&str], disposition: Disposition) {
        let mut records = self.records.lock().expect("keymaster lock");
        let record = records.entry(fingerprint(key)).or_insert_with(|| Record {
            key: key.clone(),
            subjects: HashMap::new(),
        });
        for subject in subjects {
            record.subjects.insert((*subject).to_string(), disposition);
        }
    }

    /// Record that `key` was observed claiming `subject`, without ruling
    /// on it. Never downgrades an existing authorized or deauthorized
    /// entry; only inserts `Unknown` where nothing was tracked.
    pub fn observe(&self, subject: &str, key: &PublicKey) {
        let mut records = self.records.lock().expect("keymaster lock");
        let record = records.entry(fingerprint(key)).or_insert_with(|| Record {
            key: key.clone(),
            subjects: HashMap::new(),
        });
        record
            .subjects
            .entry(subject.to_string())
            .or_insert(Disposition::Unknown);
    }

    /// The current disposition of `(subject, key)`. Pairs never observed
    /// report [`Disposition::Unknown`].
    pub fn disposition(&self, subject: &str, key: &PublicKey) -> Disposition {
        let records = self.records.lock().expect("keymaster lock");
        records
            .get(&fingerprint(key))
            .and_then(|r| r.subjects.get(subject))
            .copied()
            .unwrap_or(Disposition::Unknown)
    }

    /// Whether `key` is currently authorized for `subject`.
    pub fn authorized(&self, subject: &str, key: &PublicKey) -> bool {
        let records = self.records.lock().expect("keymaster lock");
        records
            .get(&fingerprint(key))
            .and_then(|r| r.subjects.get(subject))
            .is_some_and(|d| *d == Disposition::Authorized)
    }

    /// Whether `key` is authorized for at least one subject. This is the
    /// strict-mode handshake gate, applied before the peer has announced
    /// which identity it claims.
    pub fn any_authorized(&self, key: &PublicKey) -> bool {
        let records = self.records.lock().expect("keymaster lock");
        records
            .get(&fingerprint(key))
            .is_some_and(|r| r.subjects.values().any(|d| *d == Disposition::Authorized))
    }

    /// Whether `key` is authorized for any of `candidates` or for the
    /// wildcard `*`. Agents use this to vet a hub's key against the
    /// hostname and address they dialed.
    pub fn host_authorized(&self, key: &PublicKey, candidates: &[&str]) -> bool {
        candidates
            .iter()
            .any(|c| self.authorized(c, key))
            || self.authorized("*", key)
    }

    /// Snapshot of every `(subject, key)` pair ever observed.
    pub fn authorizations(&self) -> Vec<Authorization> {
        let records = self.records.lock().expect("keymaster lock");
        let mut out = Vec::new();
        for (fp, record) in records.iter() {
            for (subject, disposition) in record.subjects.iter() {
                out.push(Authorization {
                    key: record.key.clone(),
                    identity: subject.clone(),
                    fingerprint: fp.clone(),
                    authorized: *disposition == Disposition::Authorized,
                    known: *disposition != Disposition::Unknown,
                });
            }
        }
        out.sort_by(|a, b| (&a.identity, &a.fingerprint).cmp(&(&b.identity, &b.fingerprint)));
        out
    }
}
