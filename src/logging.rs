//! slog-backed logging for the CLI.
//!
//! Library code logs through `tracing`; with no tracing subscriber installed the
//! events are forwarded to the `log` facade, which `slog-stdlog` routes into the
//! global slog logger set up here.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Once, OnceLock};

use slog::Drain;

/// Resolve the max level from `RUST_LOG`, falling back to `default`.
///
/// Only the most verbose level word found in the variable is honoured, so
/// `RUST_LOG=h2tun=debug` and `RUST_LOG=debug` behave the same.
fn level_from_env_or_default(default: log::LevelFilter) -> log::LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(value) => parse_level(&value).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_level(value: &str) -> Option<log::LevelFilter> {
    let lower = value.to_ascii_lowercase();
    let levels = [
        ("trace", log::LevelFilter::Trace),
        ("debug", log::LevelFilter::Debug),
        ("info", log::LevelFilter::Info),
        ("warn", log::LevelFilter::Warn),
        ("error", log::LevelFilter::Error),
        ("off", log::LevelFilter::Off),
    ];
    levels
        .iter()
        .find(|(word, _)| lower.contains(word))
        .map(|(_, level)| *level)
}

fn default_level(verbose: bool) -> log::LevelFilter {
    if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    }
}

fn install_logger(logger: slog::Logger, level: log::LevelFilter) {
    static LOGGER_GUARD: OnceLock<slog_scope::GlobalLoggerGuard> = OnceLock::new();
    static STDLOG_INIT: Once = Once::new();

    if LOGGER_GUARD.get().is_none() {
        let guard = slog_scope::set_global_logger(logger);
        let _ = LOGGER_GUARD.set(guard);
    }

    STDLOG_INIT.call_once(|| {
        let _ = slog_stdlog::init();
    });
    log::set_max_level(level);
}

fn async_root<D>(drain: D) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!("app" => "h2tun"))
}

pub fn init_terminal(verbose: bool) {
    let level = level_from_env_or_default(default_level(verbose));
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    install_logger(async_root(drain), level);
}

pub fn init_file(path: &Path, verbose: bool) -> anyhow::Result<()> {
    let level = level_from_env_or_default(default_level(verbose));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    install_logger(async_root(drain), level);
    Ok(())
}
