//! State Management Module
//!
//! The replicated dataset, the node's view of its peers, the election
//! state machine and snapshot persistence.

mod store;
mod view;
mod snapshot_file;
pub mod election;

pub use store::{
    MessageEntry, PersistedLogin, PersistedMessage, PersistedPublication, PersistedState, Publication,
    ReplicatedDataset, Stamp,
};
pub use view::PeerView;
pub use snapshot_file::SnapshotFile;
pub use election::{ElectionConfig, ElectionManager, ElectionState};
