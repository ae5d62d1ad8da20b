use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, Result};

pub const VPN_MTU: u32 = 1500;

/// Addressing and routing for the virtual interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceParams {
    pub mtu: u32,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub dns_servers: Vec<IpAddr>,
    pub routes: Vec<Route>,
    /// Applications whose traffic bypasses the tunnel (our own, at least).
    pub excluded_apps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpAddr,
    pub prefix_len: u8,
}

impl InterfaceParams {
    /// 10.0.88.88/16, DNS 1.0.0.1, default route, `app_id` excluded.
    #[must_use]
    pub fn tunnel_default(app_id: &str) -> Self {
        Self {
            mtu: VPN_MTU,
            address: Ipv4Addr::new(10, 0, 88, 88),
            prefix_len: 16,
            dns_servers: vec![IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1))],
            routes: vec![Route {
                destination: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                prefix_len: 0,
            }],
            excluded_apps: vec![app_id.to_string()],
        }
    }

    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// Creates the virtual interface. Platform glue lives behind this seam.
pub trait InterfaceProvider: Send + Sync {
    fn establish(&self, params: &InterfaceParams) -> Result<InterfaceHandle>;
}

/// An open virtual interface and its packet descriptor.
///
/// Closed exactly once, by [`InterfaceHandle::close`] or on drop; any use
/// after that fails with [`AppError::Closed`].
#[derive(Debug)]
pub struct InterfaceHandle {
    name: String,
    fd: Option<OwnedFd>,
}

impl InterfaceHandle {
    pub fn new(name: impl Into<String>, fd: OwnedFd) -> Self {
        Self {
            name: name.into(),
            fd: Some(fd),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd(&self) -> Result<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd).ok_or(AppError::Closed)
    }

    /// Duplicate the descriptor, e.g. to hand it to another process.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(self.fd()?.try_clone_to_owned()?)
    }

    pub fn close(&mut self) -> Result<()> {
        let fd = self.fd.take().ok_or(AppError::Closed)?;
        debug!(interface = ?self.name, fd = fd.as_raw_fd(), "interface_closed");
        drop(fd);
        Ok(())
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        if self.fd.is_some() {
            warn!(interface = ?self.name, "interface_dropped_while_open");
            let _ = self.close();
        }
    }
}
