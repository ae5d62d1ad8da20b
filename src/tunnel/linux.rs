//! `/dev/net/tun` interface provider for the desktop CLI.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Command;

use nix::libc::{c_char, c_int, c_short, IFF_NO_PI, IFF_TUN, IFNAMSIZ};
use tracing::{info, warn};

use super::interface::{InterfaceHandle, InterfaceParams, InterfaceProvider};
use crate::error::{AppError, Result};

pub const DEFAULT_NAME: &str = "h2tun0";

#[repr(C)]
struct IfReq {
    name: [c_char; IFNAMSIZ],
    flags: c_short,
    _pad: [u8; 22],
}

nix::ioctl_write_ptr_bad!(
    tun_set_iff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<c_int>()),
    IfReq
);

/// Creates a TUN device and configures it with `ip`. Needs CAP_NET_ADMIN.
#[derive(Debug, Clone)]
pub struct LinuxTun {
    name: String,
}

impl Default for LinuxTun {
    fn default() -> Self {
        Self::new(DEFAULT_NAME)
    }
}

impl LinuxTun {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn open(&self) -> Result<OwnedFd> {
        if self.name.is_empty() || self.name.len() >= IFNAMSIZ {
            return Err(AppError::Interface(format!(
                "invalid interface name {:?}",
                self.name
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| AppError::Interface(format!("failed to open /dev/net/tun: {}", e)))?;

        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            flags: (IFF_TUN | IFF_NO_PI) as c_short,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(self.name.bytes()) {
            *dst = src as c_char;
        }
        // SAFETY: `req` is a properly sized, initialised ifreq for TUNSETIFF.
        unsafe { tun_set_iff(file.as_raw_fd(), &req) }
            .map_err(|e| AppError::Interface(format!("TUNSETIFF {} failed: {}", self.name, e)))?;
        Ok(OwnedFd::from(file))
    }
}

impl InterfaceProvider for LinuxTun {
    fn establish(&self, params: &InterfaceParams) -> Result<InterfaceHandle> {
        let fd = self.open()?;
        // The handle closes the device if configuration fails below.
        let handle = InterfaceHandle::new(self.name.clone(), fd);

        let mtu = params.mtu.to_string();
        let cidr = params.cidr();
        ip(&["addr", "add", &cidr, "dev", &self.name])?;
        ip(&["link", "set", "dev", &self.name, "mtu", &mtu])?;
        ip(&["link", "set", "dev", &self.name, "up"])?;

        if !params.routes.is_empty() || !params.dns_servers.is_empty() {
            warn!(
                interface = ?self.name,
                routes = params.routes.len(),
                dns = ?params.dns_servers,
                "routes_and_dns_left_to_host"
            );
        }
        info!(interface = ?self.name, address = ?cidr, mtu = params.mtu, "interface_established");
        Ok(handle)
    }
}

fn ip(args: &[&str]) -> Result<()> {
    info!("Running: ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| AppError::Interface(format!("failed to run ip: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Interface(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}
