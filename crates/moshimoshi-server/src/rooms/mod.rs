//! Room orchestration
//!
//! The registry holds what is live (sessions, memberships, media handles);
//! the coordinator keeps it consistent with the directory and the engine.

mod coordinator;
mod registry;
mod session;

pub use coordinator::RoomCoordinator;
pub use registry::{ProducerOwner, RemovedSession, SessionRegistry};
pub use session::{
    ConsumerHandle, DrainedMedia, OrphanedConsumer, PeerSession, ProducerHandle, SessionMedia,
    TransportHandle,
};
