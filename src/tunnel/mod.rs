//! Interface seam, lifecycle state machine and the orchestrator tying the
//! relay, handoff and protocol engine together.

pub mod interface;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod orchestrator;
pub mod state;

pub use interface::{InterfaceHandle, InterfaceParams, InterfaceProvider};
pub use orchestrator::{Orchestrator, TunnelSettings};
pub use state::{ObserverId, StateObserver, TunnelState, TunnelStateMachine};
