use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "h2tun",
    about = "Local IP tunnel over a tun2socks relay",
    version = env!("H2TUN_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Bring the tunnel up and hold it until interrupted
    Up {
        /// Profile name (default: the selected profile)
        #[arg(short, long)]
        profile: Option<String>,

        /// Relay executable (overrides relay.executable)
        #[arg(long)]
        relay: Option<PathBuf>,

        /// Protocol engine executable (overrides engine.executable)
        #[arg(long)]
        engine: Option<PathBuf>,

        /// TUN interface name
        #[arg(long, default_value = "h2tun0")]
        interface: String,
    },

    /// Print the engine config a profile renders to
    Render {
        /// Profile name (default: the selected profile)
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage saved profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommand {
    /// List saved profiles (* marks the selected one)
    List,

    /// Save a new profile
    Add(ProfileArgs),

    /// Change fields of an existing profile
    Edit {
        /// Profile to edit
        name: String,

        /// Remote endpoint, host:port
        #[arg(long)]
        address: Option<String>,

        /// Authentication token
        #[arg(long)]
        token: Option<String>,

        /// Upload limit in Mbps
        #[arg(long)]
        up: Option<u32>,

        /// Download limit in Mbps
        #[arg(long)]
        down: Option<u32>,

        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: Option<bool>,
    },

    /// Delete a profile
    Remove {
        name: String,
    },

    /// Select the profile `up` and `render` use by default
    Select {
        name: String,
    },
}

#[derive(Args)]
pub struct ProfileArgs {
    /// Profile name
    pub name: String,

    /// Remote endpoint, host:port
    #[arg(long)]
    pub address: String,

    /// Authentication token
    #[arg(long)]
    pub token: String,

    /// Upload limit in Mbps
    #[arg(long, default_value = "10")]
    pub up: u32,

    /// Download limit in Mbps
    #[arg(long, default_value = "50")]
    pub down: u32,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Also select the new profile
    #[arg(long)]
    pub select: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_up_with_overrides() {
        let cli = Cli::try_parse_from([
            "h2tun", "-v", "up", "--profile", "home", "--relay", "/opt/tun2socks",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            TopCommand::Up {
                profile,
                relay,
                engine,
                interface,
            } => {
                assert_eq!(profile.as_deref(), Some("home"));
                assert_eq!(relay, Some(PathBuf::from("/opt/tun2socks")));
                assert!(engine.is_none());
                assert_eq!(interface, "h2tun0");
            }
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn profile_add_requires_address_and_token() {
        assert!(Cli::try_parse_from(["h2tun", "profile", "add", "home"]).is_err());
        let cli = Cli::try_parse_from([
            "h2tun",
            "profile",
            "add",
            "home",
            "--address",
            "h.example.com:443",
            "--token",
            "tok",
        ])
        .unwrap();
        match cli.command {
            TopCommand::Profile {
                command: ProfileCommand::Add(args),
            } => {
                assert_eq!(args.up, 10);
                assert_eq!(args.down, 50);
                assert!(!args.insecure);
            }
            _ => panic!("expected profile add"),
        }
    }
}
