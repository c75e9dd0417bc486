//! Domain types shared across the orchestrators, custody and storage layers

pub mod custody;
pub mod session;
pub mod stage;
pub mod wire;

pub use custody::{
    Curve, HealthCheckRecord, KeyShare, KeyShareNode, KeyShareStatus, NodeAssignment, NodeFailure,
    NodeStatus, ServerKeypair,
};
pub use session::{Session, SessionPurpose, SessionState, Wallet};
pub use stage::{Stage, StageStatus, StageType};
pub use wire::{
    Ed25519AggregateRequest, Ed25519CommitResponse, Ed25519ShareResponse,
    Ed25519SignRequest, Ed25519SignatureResponse, ErrorResponse, IdentifiedPayload,
    ParticipantId, PeerMessage, RoundRequest, RoundResponse, SessionRequest,
};
