//! Threshold-based identity matching with registration of unknown faces.

use crate::collaborator::{CollaboratorError, IdentityRegistrar};
use crate::store::{EmbeddingStore, StoreError, StoreMatch};
use crate::types::{Embedding, Identity};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

/// Default cosine similarity threshold for a positive match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.55;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registration(#[from] CollaboratorError),
}

/// Result of [`IdentityMatcher::find_or_register`].
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub identity: Identity,
    /// `true` when the identity was registered by this call.
    pub is_new: bool,
    /// Similarity of the best stored candidate, if any was compared.
    pub score: Option<f32>,
}

/// Wraps an [`EmbeddingStore`] with a similarity threshold.
pub struct IdentityMatcher {
    store: EmbeddingStore,
    threshold: f32,
    /// Serializes the decide-then-register sequence. The store lock itself
    /// is never held across the registrar call.
    registration: Mutex<()>,
}

impl IdentityMatcher {
    pub fn new(store: EmbeddingStore, threshold: f32) -> Self {
        Self {
            store,
            threshold,
            registration: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Best stored identity scoring at least the threshold (inclusive).
    pub fn lookup(&self, probe: &Embedding) -> Option<StoreMatch> {
        self.store
            .best_match(probe)
            .filter(|m| m.score >= self.threshold)
    }

    /// Return the matching identity, or register a new one for `probe`.
    ///
    /// A probe whose dimension disagrees with the store is rejected before
    /// the registrar is consulted, so no orphan identity gets persisted.
    /// Concurrent callers presenting the same unknown face register it once:
    /// the loser of the race re-checks the store after the winner's add.
    pub fn find_or_register(
        &self,
        probe: &Embedding,
        registrar: &dyn IdentityRegistrar,
        now: DateTime<Utc>,
    ) -> Result<MatchOutcome, MatchError> {
        self.check_dimension(probe)?;
        if let Some(m) = self.lookup(probe) {
            return Ok(matched(m));
        }

        let _guard = self.registration.lock();
        let best = self.store.best_match(probe);
        if let Some(m) = best.clone().filter(|m| m.score >= self.threshold) {
            return Ok(matched(m));
        }
        self.check_dimension(probe)?;

        let identity = registrar.register(probe, now)?;
        if let Err(e) = self.store.add(identity.clone(), probe.clone()) {
            // Only a concurrent reload that changed the dimension gets here.
            tracing::warn!(
                identity = %identity.id,
                error = %e,
                "registered identity not added to the store; persisted record is orphaned"
            );
            return Err(e.into());
        }

        tracing::info!(
            identity = %identity.id,
            best_score = ?best.as_ref().map(|m| m.score),
            threshold = self.threshold,
            "registered new identity"
        );

        Ok(MatchOutcome {
            identity,
            is_new: true,
            score: best.map(|m| m.score),
        })
    }

    fn check_dimension(&self, probe: &Embedding) -> Result<(), StoreError> {
        if probe.dim() == 0 {
            return Err(StoreError::EmptyEmbedding);
        }
        match self.store.dimension() {
            Some(expected) if expected != probe.dim() => Err(StoreError::DimensionMismatch {
                expected,
                actual: probe.dim(),
            }),
            _ => Ok(()),
        }
    }
}

fn matched(m: StoreMatch) -> MatchOutcome {
    MatchOutcome {
        identity: m.identity,
        is_new: false,
        score: Some(m.score),
    }
}
