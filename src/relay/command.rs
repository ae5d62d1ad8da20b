use std::path::{Path, PathBuf};
use std::process::Command;

use crate::engine::PROXY_ENDPOINT;
use crate::tunnel::interface::VPN_MTU;

/// Address tun2socks gives its end of the point-to-point link.
pub const ROUTER_IP: &str = "10.10.14.2";
pub const NETMASK: &str = "255.255.255.252";
/// Handoff socket name, relative to the private directory.
pub const SOCK_NAME: &str = "sock_path";

/// How to launch the relay: program, argv and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl RelayCommand {
    /// The fixed tun2socks invocation, run inside `private_dir`.
    pub fn tun2socks(program: impl Into<PathBuf>, private_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: tun2socks_args(),
            working_dir: private_dir.into(),
        }
    }

    /// Where the relay listens for the interface descriptor.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.working_dir)
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(&self.working_dir);
        command
    }
}

#[must_use]
pub fn socket_path(private_dir: &Path) -> PathBuf {
    private_dir.join(SOCK_NAME)
}

#[must_use]
pub fn tun2socks_args() -> Vec<String> {
    let mtu = VPN_MTU.to_string();
    [
        "--netif-ipaddr",
        ROUTER_IP,
        "--netif-netmask",
        NETMASK,
        "--socks-server-addr",
        PROXY_ENDPOINT,
        "--tunmtu",
        mtu.as_str(),
        "--sock-path",
        SOCK_NAME,
        "--enable-udprelay",
        "--loglevel",
        "notice",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tun2socks_argv_is_fixed() {
        let command = RelayCommand::tun2socks("/data/lib/libtun2socks.so", "/data/files");
        assert_eq!(
            command.args.join(" "),
            "--netif-ipaddr 10.10.14.2 --netif-netmask 255.255.255.252 \
             --socks-server-addr 127.0.0.1:8920 --tunmtu 1500 --sock-path sock_path \
             --enable-udprelay --loglevel notice"
        );
        assert_eq!(command.socket_path(), PathBuf::from("/data/files/sock_path"));
    }
}
