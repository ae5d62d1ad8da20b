use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use anyhow::Context;
use tracing::{info, warn};

use h2tun::cli::{ProfileArgs, ProfileCommand, TopCommand};
use h2tun::config::{self, AppConfig};
use h2tun::engine::{self, ExecutableEngine};
use h2tun::profile::{ProfileStore, TunnelProfile};
use h2tun::relay::command::socket_path;
use h2tun::tunnel::linux::LinuxTun;
use h2tun::tunnel::{Orchestrator, TunnelSettings, TunnelState};

const APP_ID: &str = "h2tun";

pub fn dispatch(command: TopCommand, config: &AppConfig) -> anyhow::Result<()> {
    match command {
        TopCommand::Up {
            profile,
            relay,
            engine,
            interface,
        } => cmd_up(profile.as_deref(), relay, engine, interface, config),
        TopCommand::Render { profile } => cmd_render(profile.as_deref()),
        TopCommand::Profile { command } => dispatch_profile(command),
    }
}

fn resolve_profile(store: &ProfileStore, name: Option<&str>) -> anyhow::Result<TunnelProfile> {
    let profile = match name {
        Some(name) => store
            .find(name)
            .ok_or_else(|| h2tun::error::AppError::ProfileNotFound(name.to_string()))?,
        None => store
            .selected()
            .ok_or(h2tun::error::AppError::NoProfileSelected)?,
    };
    Ok(profile.clone())
}

fn cmd_render(name: Option<&str>) -> anyhow::Result<()> {
    let store = ProfileStore::open_default()?;
    let profile = resolve_profile(&store, name)?;
    println!("{}", engine::render(&profile));
    Ok(())
}

/// A socket left behind by a relay that died uncleanly makes the next bind fail.
fn remove_stale_socket(private_dir: &Path) -> anyhow::Result<()> {
    let path = socket_path(private_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            info!(path = ?path.display().to_string(), "stale_socket_removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn cmd_up(
    name: Option<&str>,
    relay: Option<PathBuf>,
    engine_program: Option<PathBuf>,
    interface: String,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let store = ProfileStore::open_default()?;
    let profile = resolve_profile(&store, name)?;
    profile.validate()?;

    let private_dir = config.private_dir();
    config::ensure_private_dir(&private_dir)
        .with_context(|| format!("failed to create {}", private_dir.display()))?;
    remove_stale_socket(&private_dir)?;

    let relay_program = relay.unwrap_or_else(|| config.relay.executable.clone());
    let mut settings = TunnelSettings::new(&private_dir, relay_program, APP_ID);
    settings.handoff = config.handoff.retry_policy();

    let engine = ExecutableEngine::new(
        engine_program.unwrap_or_else(|| config.engine.executable.clone()),
        config.engine.args.clone(),
        &private_dir,
    );
    let orchestrator = Orchestrator::new(settings, Arc::new(LinuxTun::new(interface)), Arc::new(engine));

    let (tx, rx) = mpsc::channel();
    orchestrator.subscribe_channel(tx);

    let profile_name = profile.name.clone();
    if !orchestrator.request_start(profile) {
        anyhow::bail!("tunnel is already starting");
    }
    println!("Connecting with profile {}...", profile_name);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    let outcome = rt.block_on(wait_for_exit(rx));
    orchestrator.stop();
    drop(rt);

    match outcome? {
        Exit::Signal(signal) => {
            info!(signal = ?signal, "shutdown_requested");
            println!("Tunnel stopped");
            Ok(())
        }
        Exit::Disconnected => {
            let reason = orchestrator
                .last_failure()
                .unwrap_or_else(|| "tunnel went down".to_string());
            anyhow::bail!("tunnel failed: {}", reason)
        }
    }
}

enum Exit {
    Signal(&'static str),
    Disconnected,
}

async fn wait_for_exit(states: mpsc::Receiver<TunnelState>) -> anyhow::Result<Exit> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let watcher = tokio::task::spawn_blocking(move || {
        for state in states {
            match state {
                TunnelState::Connected => println!("Tunnel up"),
                TunnelState::Disconnected => return,
                TunnelState::Connecting => {}
            }
        }
    });

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to wait for ctrl-c")?;
            Ok(Exit::Signal("SIGINT"))
        }
        _ = sigterm.recv() => Ok(Exit::Signal("SIGTERM")),
        res = watcher => {
            if let Err(e) = res {
                warn!(error = ?e.to_string(), "state_watcher_failed");
            }
            Ok(Exit::Disconnected)
        }
    }
}

fn dispatch_profile(command: ProfileCommand) -> anyhow::Result<()> {
    let mut store = ProfileStore::open_default()?;
    match command {
        ProfileCommand::List => {
            if store.profiles().is_empty() {
                println!("No profiles saved. Add one with `h2tun profile add`.");
                return Ok(());
            }
            let selected = store.selected_index();
            for (i, p) in store.profiles().iter().enumerate() {
                let marker = if Some(i) == selected { "*" } else { " " };
                println!(
                    "{} {:<16} {:<32} up {} / down {} mbps{}",
                    marker,
                    p.name,
                    p.address,
                    p.upload_limit_mbps,
                    p.download_limit_mbps,
                    if p.allow_insecure_tls { " (insecure)" } else { "" }
                );
            }
        }
        ProfileCommand::Add(args) => cmd_profile_add(&mut store, args)?,
        ProfileCommand::Edit {
            name,
            address,
            token,
            up,
            down,
            insecure,
        } => {
            let mut profile = store
                .find(&name)
                .cloned()
                .ok_or_else(|| h2tun::error::AppError::ProfileNotFound(name.clone()))?;
            if let Some(address) = address {
                profile.address = address;
            }
            if let Some(token) = token {
                profile.auth_token = token;
            }
            if let Some(up) = up {
                profile.upload_limit_mbps = up;
            }
            if let Some(down) = down {
                profile.download_limit_mbps = down;
            }
            if let Some(insecure) = insecure {
                profile.allow_insecure_tls = insecure;
            }
            store.edit(&name, profile)?;
            println!("Updated profile {}", name);
        }
        ProfileCommand::Remove { name } => {
            store.remove(&name)?;
            println!("Removed profile {}", name);
        }
        ProfileCommand::Select { name } => {
            store.select(&name)?;
            println!("Selected profile {}", name);
        }
    }
    Ok(())
}

fn cmd_profile_add(store: &mut ProfileStore, args: ProfileArgs) -> anyhow::Result<()> {
    let profile = TunnelProfile {
        name: args.name.clone(),
        address: args.address,
        auth_token: args.token,
        upload_limit_mbps: args.up,
        download_limit_mbps: args.down,
        allow_insecure_tls: args.insecure,
    };
    store.add(profile)?;
    if args.select || store.selected_index().is_none() {
        store.select(&args.name)?;
    }
    println!("Saved profile {}", args.name);
    Ok(())
}
