pub mod coordinator;
pub mod envelope;
pub mod health;
pub mod memory;
pub mod merge;
pub mod retry;
pub mod transport;

pub use coordinator::{ReplicationCoordinator, SyncEvent};
pub use envelope::{
    ProgramDeletion, ReplyStatus, StateSnapshot, SyncAction, SyncEnvelope, SyncReply,
};
pub use health::ConnectivityHealth;
pub use memory::{Endpoint, InMemoryLink, InMemoryTransport};
pub use merge::MergeSummary;
pub use retry::{BackoffPolicy, PendingRecord};
pub use transport::{Inbound, LinkState, SyncTransport};
