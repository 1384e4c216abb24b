//! In-process transport and state machine for running groups inside one process.

mod applier;
mod network;

pub use applier::{ApplyFailure, ClosedFile, MemoryApplier};
pub use network::{MockNetwork, MockNetworkConfig, MockNodeNetwork};
