// Relay process: its invocation, supervision and the descriptor handoff.
pub mod command;
pub mod handoff;
pub mod supervisor;

pub use command::RelayCommand;
pub use handoff::RetryPolicy;
pub use supervisor::RelaySupervisor;
