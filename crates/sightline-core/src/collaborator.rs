//! Boundaries to the world outside the recognition core.
//!
//! The pipeline never performs I/O itself; detection, identity allocation,
//! visit persistence and snapshot encoding all go through these traits.
//! Implementations may block, and are never called while the embedding
//! store lock is held.

use crate::source::Frame;
use crate::types::{Detection, Embedding, Identity};
use chrono::{DateTime, Utc};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("identity registration failed: {0}")]
    Registration(String),
    #[error("visit persistence failed: {0}")]
    Persistence(String),
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("loading known identities failed: {0}")]
    Load(String),
}

/// Detects faces in a frame and extracts one embedding per face.
pub trait FaceDetector: Send + Sync {
    /// Zero faces is a normal outcome, not an error.
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, CollaboratorError>;
}

/// Allocates and persists a brand-new identity.
pub trait IdentityRegistrar: Send + Sync {
    fn register(
        &self,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<Identity, CollaboratorError>;
}

/// Durable sink for logged visits.
pub trait VisitStore: Send + Sync {
    /// `identity` already carries the updated `last_seen` and `visit_count`.
    fn persist(
        &self,
        identity: &Identity,
        timestamp: DateTime<Utc>,
        snapshot: Option<&[u8]>,
    ) -> Result<(), CollaboratorError>;
}

/// Turns a cropped face into encoded bytes; `None` if it cannot.
pub trait SnapshotEncoder: Send + Sync {
    fn encode(&self, crop: &RgbImage) -> Option<Vec<u8>>;
}

/// Supplies the identities known at startup.
pub trait IdentitySource {
    fn load_identities(&self) -> Result<Vec<(Identity, Embedding)>, CollaboratorError>;
}
