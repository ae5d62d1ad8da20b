//! Keeps the relay process alive while the tunnel is up.
//!
//! A monitor thread blocks on the child with `waitid(WNOWAIT)`, so the exited
//! process stays a zombie (and its pid stays ours) until the monitor takes the
//! state lock and reaps it. `stop` only signals while holding that lock and
//! while a pid is recorded, so it can never hit a recycled pid, and the
//! monitor's "should I restart?" decision cannot interleave with a stop.
//!
//! When a restart is impossible the monitor gives up and, after releasing the
//! lock, reports the reason through the optional give-up hook.

use std::process::Child;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result, SpawnError};
use crate::process;

use super::command::RelayCommand;

#[cfg(feature = "restart-guard")]
pub use guard::RestartGuard;

/// Called from the monitor thread once the relay is gone for good. Must not
/// call [`RelaySupervisor::stop`], which joins that thread.
pub type GiveUpHook = Box<dyn Fn(&str) + Send + Sync>;

/// Owns the relay subprocess and its monitor thread.
pub struct RelaySupervisor {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    command: RelayCommand,
    state: Mutex<SupervisorState>,
    exited: Condvar,
    on_give_up: Option<GiveUpHook>,
}

struct SupervisorState {
    should_run: bool,
    pid: Option<u32>,
    spawn_count: u64,
    last_error: Option<String>,
    #[cfg(feature = "restart-guard")]
    guard: RestartGuard,
}

impl SupervisorState {
    fn new() -> Self {
        Self {
            should_run: true,
            pid: None,
            spawn_count: 0,
            last_error: None,
            #[cfg(feature = "restart-guard")]
            guard: RestartGuard::default(),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the relay; the caller holds the state lock.
    fn spawn_locked(&self, state: &mut SupervisorState) -> std::result::Result<Child, SpawnError> {
        let mut command = self.command.to_command();
        let child = process::spawn_logged(&mut command, "relay").map_err(|source| SpawnError {
            program: self.command.program.clone(),
            source,
        })?;
        state.pid = Some(child.id());
        state.spawn_count += 1;
        info!(pid = ?child.id(), spawn_count = state.spawn_count, "relay_spawned");
        Ok(child)
    }
}

impl RelaySupervisor {
    /// Spawn the relay and attach a monitor thread to it.
    ///
    /// A launch failure is returned as-is; it is not retried here.
    pub fn start(command: RelayCommand) -> std::result::Result<Self, SpawnError> {
        Self::launch(SupervisorState::new(), command, None)
    }

    /// Like [`RelaySupervisor::start`], reporting to `on_give_up` when a
    /// crashed relay cannot be restarted.
    pub fn start_watched(
        command: RelayCommand,
        on_give_up: impl Fn(&str) + Send + Sync + 'static,
    ) -> std::result::Result<Self, SpawnError> {
        Self::launch(SupervisorState::new(), command, Some(Box::new(on_give_up)))
    }

    /// Like [`RelaySupervisor::start`], with a custom restart-rate limit.
    #[cfg(feature = "restart-guard")]
    pub fn start_with_guard(
        command: RelayCommand,
        guard: RestartGuard,
    ) -> std::result::Result<Self, SpawnError> {
        let mut state = SupervisorState::new();
        state.guard = guard;
        Self::launch(state, command, None)
    }

    fn launch(
        state: SupervisorState,
        command: RelayCommand,
        on_give_up: Option<GiveUpHook>,
    ) -> std::result::Result<Self, SpawnError> {
        let shared = Arc::new(Shared {
            command,
            state: Mutex::new(state),
            exited: Condvar::new(),
            on_give_up,
        });

        let child = {
            let mut state = shared.lock();
            shared.spawn_locked(&mut state)?
        };

        let monitor_shared = Arc::clone(&shared);
        let pid = child.id();
        let spawned = thread::Builder::new()
            .name("relay-monitor".to_string())
            .spawn(move || monitor(monitor_shared, child));
        let monitor = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                // No monitor means nobody reaps the child; take it down now.
                let mut state = shared.lock();
                state.should_run = false;
                let _ = process::signal(pid, Signal::SIGKILL);
                return Err(SpawnError {
                    program: shared.command.program.clone(),
                    source,
                });
            }
        };

        Ok(Self {
            shared,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    #[must_use]
    pub fn command(&self) -> &RelayCommand {
        &self.shared.command
    }

    /// Pid of the relay currently alive, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    /// Number of times the relay has been launched, restarts included.
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.shared.lock().spawn_count
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        let state = self.shared.lock();
        state.should_run && state.pid.is_some()
    }

    /// Why the monitor gave up restarting, if it did.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Stop supervising and take the relay down. Idempotent.
    ///
    /// SIGTERM first; SIGKILL if the relay is still there after
    /// [`process::STOP_GRACE`].
    pub fn stop(&self) -> Result<()> {
        let mut state = self.shared.lock();
        let was_running = state.should_run;
        state.should_run = false;

        for sig in [Signal::SIGTERM, Signal::SIGKILL] {
            let Some(pid) = state.pid else {
                break;
            };
            process::signal(pid, sig)?;
            state = self
                .shared
                .exited
                .wait_timeout_while(state, process::STOP_GRACE, |s| s.pid.is_some())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if state.pid.is_some() {
                warn!(pid = ?pid, signal = ?sig, "relay_still_alive_after_signal");
            }
        }
        let leftover = state.pid;
        drop(state);

        if let Some(pid) = leftover {
            return Err(AppError::Other(format!(
                "relay {} is still alive after SIGKILL",
                pid
            )));
        }

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = monitor {
            if handle.join().is_err() {
                error!("relay_monitor_panicked");
            }
        }
        if was_running {
            info!("relay_stopped");
        }
        Ok(())
    }
}

impl Drop for RelaySupervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = ?e.to_string(), "relay_stop_on_drop_failed");
        }
    }
}

/// Block until `child` has exited without reaping it.
fn wait_exited(child: &Child) {
    let pid = Pid::from_raw(child.id() as i32);
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                // ECHILD and friends: fall through and let `wait` sort it out.
                debug!(pid = ?child.id(), error = ?e, "relay_waitid_failed");
                return;
            }
        }
    }
}

fn monitor(shared: Arc<Shared>, child: Child) {
    let Some(reason) = supervise(&shared, child) else {
        return;
    };
    if let Some(on_give_up) = &shared.on_give_up {
        on_give_up(&reason);
    }
}

/// Reap and restart until stopped. Returns why it gave up otherwise.
fn supervise(shared: &Shared, mut child: Child) -> Option<String> {
    loop {
        debug!(pid = ?child.id(), "relay_monitor_waiting");
        wait_exited(&child);

        let mut state = shared.lock();
        let pid = child.id();
        let status = child.wait();
        state.pid = None;
        shared.exited.notify_all();

        let status = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown ({})", e),
        };
        if !state.should_run {
            info!(pid = ?pid, status = ?status, "relay_exited");
            return None;
        }

        #[cfg(feature = "restart-guard")]
        if !state.guard.allow(std::time::Instant::now()) {
            error!(pid = ?pid, status = ?status, "relay_restart_limit_reached");
            let reason = format!("relay restart limit reached (last exit: {})", status);
            state.should_run = false;
            state.last_error = Some(reason.clone());
            return Some(reason);
        }

        warn!(pid = ?pid, status = ?status, "relay_exited_unexpectedly_restarting");
        match shared.spawn_locked(&mut state) {
            Ok(next) => child = next,
            Err(e) => {
                error!(error = ?e.to_string(), "relay_restart_failed");
                let reason = e.to_string();
                state.should_run = false;
                state.last_error = Some(reason.clone());
                return Some(reason);
            }
        }
    }
}

#[cfg(feature = "restart-guard")]
mod guard {
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    /// Allows at most `max_restarts` restarts within any `window`.
    #[derive(Debug, Clone)]
    pub struct RestartGuard {
        max_restarts: usize,
        window: Duration,
        recent: VecDeque<Instant>,
    }

    impl Default for RestartGuard {
        fn default() -> Self {
            Self::new(5, Duration::from_secs(10))
        }
    }

    impl RestartGuard {
        #[must_use]
        pub fn new(max_restarts: usize, window: Duration) -> Self {
            Self {
                max_restarts,
                window,
                recent: VecDeque::new(),
            }
        }

        /// Record a restart at `now` if the budget allows it.
        pub fn allow(&mut self, now: Instant) -> bool {
            while let Some(&oldest) = self.recent.front() {
                if now.duration_since(oldest) >= self.window {
                    self.recent.pop_front();
                } else {
                    break;
                }
            }
            if self.recent.len() >= self.max_restarts {
                return false;
            }
            self.recent.push_back(now);
            true
        }
    }

}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::test_support::{pid_alive, wait_for};

    fn sleeper(dir: &std::path::Path) -> RelayCommand {
        RelayCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "exec sleep 30".into()],
            working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn crash_while_running_restarts_once_per_exit() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = RelaySupervisor::start(sleeper(dir.path())).unwrap();
        assert_eq!(supervisor.spawn_count(), 1);

        for expected in 2..=3 {
            let pid = supervisor.pid().unwrap();
            process::signal(pid, Signal::SIGKILL).unwrap();
            assert!(wait_for(Duration::from_secs(3), || {
                supervisor.pid().is_some_and(|p| p != pid)
            }));
            assert_eq!(supervisor.spawn_count(), expected);
        }

        supervisor.stop().unwrap();
        assert_eq!(supervisor.spawn_count(), 3);
    }

    #[test]
    fn stop_terminates_and_does_not_restart() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = RelaySupervisor::start(sleeper(dir.path())).unwrap();
        let pid = supervisor.pid().unwrap();
        assert!(supervisor.is_running());

        supervisor.stop().unwrap();
        assert!(supervisor.pid().is_none());
        assert!(!supervisor.is_running());
        assert!(wait_for(Duration::from_secs(1), || !pid_alive(pid)));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(supervisor.spawn_count(), 1);
        supervisor.stop().unwrap();
    }

    #[test]
    fn stop_escalates_when_relay_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let command = RelayCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "trap '' TERM; while :; do sleep 1; done".into()],
            working_dir: dir.path().to_path_buf(),
        };
        let supervisor = RelaySupervisor::start(command).unwrap();
        thread::sleep(Duration::from_millis(200));
        supervisor.stop().unwrap();
        assert!(supervisor.pid().is_none());
        assert_eq!(supervisor.spawn_count(), 1);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let command = RelayCommand::tun2socks(dir.path().join("missing-relay"), dir.path());
        let err = match RelaySupervisor::start(command) {
            Ok(_) => panic!("spawn should fail"),
            Err(e) => e,
        };
        assert_eq!(err.program, dir.path().join("missing-relay"));
    }

    /// `sh` behind a symlink the test can delete to make the next spawn fail.
    fn removable_sleeper(dir: &std::path::Path) -> RelayCommand {
        let program = dir.join("relay");
        std::os::unix::fs::symlink("/bin/sh", &program).unwrap();
        RelayCommand {
            program,
            args: vec!["-c".into(), "exec sleep 30".into()],
            working_dir: dir.to_path_buf(),
        }
    }

    fn give_up_channel() -> (impl Fn(&str) + Send + Sync + 'static, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let hook = move |reason: &str| {
            let _ = tx.lock().unwrap().send(reason.to_string());
        };
        (hook, rx)
    }

    #[test]
    fn failed_respawn_reports_give_up() {
        let dir = tempfile::tempdir().unwrap();
        let command = removable_sleeper(dir.path());
        let program = command.program.clone();
        let (hook, gave_up) = give_up_channel();
        let supervisor = RelaySupervisor::start_watched(command, hook).unwrap();
        let pid = supervisor.pid().unwrap();

        std::fs::remove_file(&program).unwrap();
        process::signal(pid, Signal::SIGKILL).unwrap();

        let reason = gave_up.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(reason.contains("failed to spawn"), "{}", reason);
        assert_eq!(supervisor.last_error().as_deref(), Some(reason.as_str()));
        assert!(!supervisor.is_running());
        assert!(supervisor.pid().is_none());
        assert_eq!(supervisor.spawn_count(), 1);

        supervisor.stop().unwrap();
        assert!(gave_up.try_recv().is_err());
    }

    #[test]
    fn stop_does_not_report_give_up() {
        let dir = tempfile::tempdir().unwrap();
        let (hook, gave_up) = give_up_channel();
        let supervisor = RelaySupervisor::start_watched(removable_sleeper(dir.path()), hook).unwrap();
        supervisor.stop().unwrap();
        assert!(gave_up.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(supervisor.last_error().is_none());
    }

    #[test]
    fn relay_runs_in_private_dir() {
        let dir = tempfile::tempdir().unwrap();
        let command = RelayCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "pwd > cwd.txt; exec sleep 30".into()],
            working_dir: dir.path().to_path_buf(),
        };
        let supervisor = RelaySupervisor::start(command).unwrap();
        let marker = dir.path().join("cwd.txt");
        assert!(wait_for(Duration::from_secs(3), || {
            std::fs::read_to_string(&marker).is_ok_and(|s| !s.trim().is_empty())
        }));
        let cwd = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(
            std::fs::canonicalize(cwd.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        supervisor.stop().unwrap();
    }

    #[cfg(feature = "restart-guard")]
    #[test]
    fn guard_stops_a_restart_storm() {
        let dir = tempfile::tempdir().unwrap();
        let command = RelayCommand {
            program: PathBuf::from("true"),
            args: Vec::new(),
            working_dir: dir.path().to_path_buf(),
        };
        let supervisor =
            RelaySupervisor::start_with_guard(command, RestartGuard::new(3, Duration::from_secs(60)))
                .unwrap();
        assert!(wait_for(Duration::from_secs(3), || supervisor.last_error().is_some()));
        assert_eq!(supervisor.spawn_count(), 4);
        supervisor.stop().unwrap();
    }
}
