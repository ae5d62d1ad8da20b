//! Tunnel-protocol engine seam and its executable-backed implementation.
//!
//! The engine speaks the real wire protocol and exposes a SOCKS5 listener on
//! [`PROXY_ENDPOINT`]; the relay forwards interface traffic into it.

pub mod config;
pub mod executable;

use crate::error::Result;

pub use config::render;
pub use executable::ExecutableEngine;

/// Loopback SOCKS5 endpoint shared by the engine config and the relay argv.
pub const PROXY_ENDPOINT: &str = "127.0.0.1:8920";

pub trait ProtocolEngine: Send + Sync {
    /// Start the engine with a rendered config document.
    fn start(&self, config: &str) -> Result<()>;

    /// Stop the engine; a no-op when it is not running.
    fn stop(&self) -> Result<()>;
}
