//! sightline-core — Identity matching and visit deduplication engine.
//!
//! Matches per-face embeddings against a registry of known identities,
//! registers unknown faces, and decides which sightings become durable
//! visit records under a per-identity cooldown.

pub mod collaborator;
pub mod cooldown;
pub mod matcher;
pub mod pipeline;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod types;

pub use collaborator::{
    CollaboratorError, FaceDetector, IdentityRegistrar, IdentitySource, SnapshotEncoder,
    VisitStore,
};
pub use cooldown::VisitCooldownTracker;
pub use matcher::{IdentityMatcher, MatchError, MatchOutcome};
pub use pipeline::{Collaborators, FrameReport, RecognitionPipeline, RunStats};
pub use snapshot::JpegSnapshotEncoder;
pub use source::{Frame, FrameGrabber, FrameSource};
pub use store::{EmbeddingStore, StoreError, StoreMatch};
pub use types::{BoundingBox, Detection, Embedding, FaceResult, Identity, IdentityId};
