//! Clocks
//!
//! The Lamport logical clock that orders every operation, the adjustable
//! physical clock, and the coordinator-side Berkeley synchronizer.

mod lamport;
mod physical;
pub mod berkeley;

pub use lamport::LamportClock;
pub use physical::PhysicalClock;
pub use berkeley::{ClockSynchronizer, SyncConfig};
