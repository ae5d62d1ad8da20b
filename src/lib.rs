// h2tun library crate
//
// The orchestration core (state machine, relay supervision, descriptor
// handoff) is portable; the Android JNI crate and the CLI both drive it.
// Interface creation is platform glue behind `tunnel::InterfaceProvider`.

// Infrastructure
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;

// Profiles and the engine config they render to
pub mod engine;
pub mod profile;

// Relay subprocess and tunnel lifecycle
pub mod relay;
pub mod tunnel;

#[cfg(test)]
mod test_support;
