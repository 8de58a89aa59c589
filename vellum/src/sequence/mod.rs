// Sequence - deterministic, non-guessable id allocation. A monotonic counter
// (pointer.dat) is mapped through a keyed hash so ids leak nothing about
// insertion order, while the same counter and secret always yield the same id.

use crate::error::{Result, VellumError};
use crate::store::Store;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub type IdTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Id derivation: `base64(sha256("{n}--{secret}"))`, stripped of banned and
/// non-filename-safe characters, truncated to `size`.
#[derive(Clone)]
pub struct Sequence {
    secret: String,
    max: u64,
    size: usize,
    banned: String,
    subs: HashMap<u64, String>,
    transform: Option<IdTransform>,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("max", &self.max)
            .field("size", &self.size)
            .field("banned", &self.banned)
            .field("subs", &self.subs.len())
            .finish()
    }
}

impl Sequence {
    /// Secrets shorter than 32 characters are rejected outright; the id
    /// space is only as unguessable as the secret.
    pub fn new(secret: &str, max: u64) -> Result<Self> {
        if secret.len() < 32 {
            return Err(VellumError::Schema(
                "sequence secret must be at least 32 characters".to_string(),
            ));
        }

        Ok(Sequence {
            secret: secret.to_string(),
            max,
            size: 12,
            banned: String::new(),
            subs: HashMap::new(),
            transform: None,
        })
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Extra characters to strip from derived ids, e.g. lookalikes.
    pub fn with_banned(mut self, banned: &str) -> Self {
        self.banned = banned.to_string();
        self
    }

    /// Pin a counter value to a fixed id, bypassing derivation.
    pub fn with_sub(mut self, n: u64, id: &str) -> Self {
        self.subs.insert(n, id.to_string());
        self
    }

    pub fn with_transform(mut self, transform: IdTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn id_for(&self, n: u64) -> String {
        if let Some(id) = self.subs.get(&n) {
            return id.clone();
        }

        let digest = Sha256::digest(format!("{}--{}", n, self.secret).as_bytes());
        let id: String = STANDARD
            .encode(digest)
            .chars()
            .filter(|c| !matches!(c, '+' | '/' | '=') && !self.banned.contains(*c))
            .take(self.size)
            .collect();

        match &self.transform {
            Some(transform) => transform(id),
            None => id,
        }
    }
}

/// Allocate the next id: read the counter, derive the id, stage the
/// incremented counter. The allocation only lands if the surrounding
/// commit persists.
pub fn take_a_number(sequence: &Sequence, home: &Path, store: &mut Store) -> Result<(u64, String)> {
    let pointer = home.join("pointer.dat");
    let n: u64 = match store.get_string(&pointer)? {
        Some(raw) => raw.trim().parse().map_err(|_| {
            VellumError::Schema(format!("unparseable sequence pointer: {:?}", raw.trim()))
        })?,
        None => 1,
    };

    if n > sequence.max {
        return Err(VellumError::Schema(format!(
            "sequence exhausted at {}",
            sequence.max
        )));
    }

    store.put(&pointer, (n + 1).to_string())?;
    Ok((n, sequence.id_for(n)))
}
