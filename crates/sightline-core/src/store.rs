//! In-memory registry of known identities and their embeddings.
//!
//! Identities and embeddings are kept in two index-aligned vectors behind a
//! single exclusive lock, so a reader never sees one without the other.
//! Matching is an exhaustive cosine scan in insertion order.

use crate::collaborator::{CollaboratorError, IdentitySource};
use crate::types::{Embedding, Identity, IdentityId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("embedding dimension mismatch: store holds {expected}-dim vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("identity already registered: {0}")]
    DuplicateIdentity(IdentityId),
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
}

/// Best candidate returned by [`EmbeddingStore::best_match`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreMatch {
    pub identity: Identity,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

#[derive(Default)]
struct StoreInner {
    identities: Vec<Identity>,
    embeddings: Vec<Embedding>,
    positions: HashMap<IdentityId, usize>,
    /// Fixed by the first accepted embedding.
    dimension: Option<usize>,
}

impl StoreInner {
    fn check(&self, identity: &Identity, embedding: &Embedding) -> Result<(), StoreError> {
        if embedding.dim() == 0 {
            return Err(StoreError::EmptyEmbedding);
        }
        if let Some(expected) = self.dimension {
            if embedding.dim() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
            }
        }
        if self.positions.contains_key(&identity.id) {
            return Err(StoreError::DuplicateIdentity(identity.id));
        }
        Ok(())
    }

    /// Validate then append both halves of the pair; on error nothing changes.
    fn push(&mut self, identity: Identity, embedding: Embedding) -> Result<(), StoreError> {
        self.check(&identity, &embedding)?;
        self.dimension.get_or_insert(embedding.dim());
        self.positions.insert(identity.id, self.identities.len());
        self.identities.push(identity);
        self.embeddings.push(embedding);
        Ok(())
    }

    fn identity_mut(&mut self, id: IdentityId) -> Result<&mut Identity, StoreError> {
        let pos = *self
            .positions
            .get(&id)
            .ok_or(StoreError::UnknownIdentity(id))?;
        Ok(&mut self.identities[pos])
    }
}

/// Growable set of `(Identity, Embedding)` pairs.
#[derive(Default)]
pub struct EmbeddingStore {
    inner: Mutex<StoreInner>,
}

impl EmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store populated from an initial record set (e.g. loaded from
    /// the database at startup). Records that cannot be added are skipped.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (Identity, Embedding)>,
    {
        let store = Self::new();
        store.reload(records);
        store
    }

    /// Build a store from everything `source` knows at startup.
    pub fn from_source(source: &dyn IdentitySource) -> Result<Self, CollaboratorError> {
        Ok(Self::from_records(source.load_identities()?))
    }

    /// Replace the whole contents with `records`. The dimension is re-derived
    /// from the first accepted record. Returns the number of records kept.
    pub fn reload<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = (Identity, Embedding)>,
    {
        let mut fresh = StoreInner::default();
        let mut skipped = 0usize;

        for (identity, embedding) in records {
            let id = identity.id;
            if let Err(e) = fresh.push(identity, embedding) {
                tracing::warn!(identity = %id, error = %e, "skipping stored identity");
                skipped += 1;
            }
        }

        let kept = fresh.identities.len();
        *self.inner.lock() = fresh;

        tracing::info!(kept, skipped, "embedding store loaded");
        kept
    }

    /// Append an identity with its embedding.
    ///
    /// The first successful add fixes the store dimension; any later
    /// embedding of a different length is rejected without touching state.
    pub fn add(&self, identity: Identity, embedding: Embedding) -> Result<(), StoreError> {
        self.inner.lock().push(identity, embedding)
    }

    /// Highest-scoring stored identity for `probe`.
    ///
    /// Ties resolve to the earliest inserted identity. Returns `None` when
    /// the store is empty or `probe` has the wrong dimension.
    pub fn best_match(&self, probe: &Embedding) -> Option<StoreMatch> {
        let inner = self.inner.lock();
        if inner.dimension != Some(probe.dim()) {
            return None;
        }

        let mut best: Option<(usize, f32)> = None;
        for (i, stored) in inner.embeddings.iter().enumerate() {
            let score = probe.similarity(stored);
            // Strict `>` keeps the earliest index on ties.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }

        best.map(|(i, score)| StoreMatch {
            identity: inner.identities[i].clone(),
            score,
        })
    }

    /// Record a logged visit on the in-memory identity and return the
    /// updated copy.
    pub fn record_visit(&self, id: IdentityId, now: DateTime<Utc>) -> Result<Identity, StoreError> {
        let mut inner = self.inner.lock();
        let identity = inner.identity_mut(id)?;
        identity.record_visit(now);
        Ok(identity.clone())
    }

    /// Set (or clear, with `None`) the display name of an identity.
    pub fn rename(&self, id: IdentityId, name: Option<String>) -> Result<(), StoreError> {
        self.inner.lock().identity_mut(id)?.name = name;
        Ok(())
    }

    pub fn get(&self, id: IdentityId) -> Option<Identity> {
        let inner = self.inner.lock();
        inner.positions.get(&id).map(|&pos| inner.identities[pos].clone())
    }

    /// Snapshot of all identities in insertion order.
    pub fn identities(&self) -> Vec<Identity> {
        self.inner.lock().identities.clone()
    }

    /// Embedding dimension, once fixed.
    pub fn dimension(&self) -> Option<usize> {
        self.inner.lock().dimension
    }

    pub fn len(&self) -> usize {
        self.inner.lock().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
