use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config as app_config;
use crate::error::{AppError, Result};
use crate::process;

use super::ProtocolEngine;

pub const CONFIG_FILE_NAME: &str = "engine.json";

/// A child that is still alive after this long is considered started.
const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(300);

/// Runs the engine binary as `<program> <args..> --config <private_dir>/engine.json`.
pub struct ExecutableEngine {
    program: PathBuf,
    args: Vec<String>,
    private_dir: PathBuf,
    startup_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl ExecutableEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, private_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            private_dir: private_dir.into(),
            startup_grace: DEFAULT_STARTUP_GRACE,
            child: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.private_dir.join(CONFIG_FILE_NAME)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Child::id)
    }

    fn remove_config(path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?path.display().to_string(), error = ?e.to_string(), "engine_config_remove_failed");
            }
        }
    }
}

impl ProtocolEngine for ExecutableEngine {
    fn start(&self, config: &str) -> Result<()> {
        let mut slot = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = slot.as_mut() {
            if child.try_wait()?.is_none() {
                return Err(AppError::ProtocolEngine(format!(
                    "engine already running (pid {})",
                    child.id()
                )));
            }
        }

        let config_path = self.config_path();
        app_config::write_private_file(&config_path, config.as_bytes())?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--config")
            .arg(&config_path)
            .current_dir(&self.private_dir);
        let mut child = process::spawn_logged(&mut command, "engine").map_err(|e| {
            Self::remove_config(&config_path);
            AppError::ProtocolEngine(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;

        if let Some(status) = process::wait_timeout(&mut child, self.startup_grace)? {
            Self::remove_config(&config_path);
            return Err(AppError::ProtocolEngine(format!(
                "{} exited during startup: {}",
                self.program.display(),
                status
            )));
        }

        info!(pid = ?child.id(), program = ?self.program.display().to_string(), "engine_started");
        *slot = Some(child);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut child) = child else {
            debug!("engine_stop_not_running");
            return Ok(());
        };

        let pid = child.id();
        let result = process::terminate(&mut child, process::STOP_GRACE);
        Self::remove_config(&self.config_path());
        let status = result?;
        info!(pid = ?pid, status = ?status.to_string(), "engine_stopped");
        Ok(())
    }
}

impl Drop for ExecutableEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = ?e.to_string(), "engine_stop_on_drop_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn start_writes_private_config_and_stop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c` ignores the trailing `--config <path>` arguments.
        let engine = ExecutableEngine::new(
            "sh",
            vec!["-c".into(), "sleep 30".into(), "engine".into()],
            dir.path(),
        );
        engine.start("{\"server\": \"x\"}").unwrap();

        let path = engine.config_path();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"server\": \"x\"}");
        assert!(engine.pid().is_some());

        assert!(matches!(engine.start("{}"), Err(AppError::ProtocolEngine(_))));

        engine.stop().unwrap();
        assert!(engine.pid().is_none());
        assert!(!path.exists());
        engine.stop().unwrap();
    }

    #[test]
    fn engine_that_exits_immediately_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutableEngine::new("false", Vec::new(), dir.path());
        let err = engine.start("{}").unwrap_err();
        assert!(matches!(err, AppError::ProtocolEngine(_)));
        assert!(!engine.config_path().exists());
    }

    #[test]
    fn missing_engine_binary_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutableEngine::new(dir.path().join("no-such-engine"), Vec::new(), dir.path());
        assert!(matches!(engine.start("{}"), Err(AppError::ProtocolEngine(_))));
    }
}
