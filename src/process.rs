//! Child-process plumbing shared by the relay supervisor and the engine.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Pid};
use tracing::{debug, info, warn};

/// How long a child gets to exit after SIGTERM (and again after SIGKILL).
pub const STOP_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawn `command` with stderr merged into stdout, forwarding both into the
/// log under `label`.
pub fn spawn_logged(command: &mut Command, label: &'static str) -> io::Result<Child> {
    let (reader, writer) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let writer = File::from(writer);
    let stderr = writer.try_clone()?;

    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(stderr));
    let child = command.spawn();
    // Our copies of the write end must be gone before the child exits, or the
    // forwarder never sees EOF; `command` still holds them until dropped here.
    command.stdout(Stdio::null()).stderr(Stdio::null());
    let child = child?;

    let pid = child.id();
    let reader = File::from(reader);
    thread::Builder::new()
        .name(format!("{label}-output"))
        .spawn(move || forward_lines(reader, label, pid))?;
    Ok(child)
}

fn forward_lines(reader: File, label: &'static str, pid: u32) {
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => info!(process = label, pid = pid, "{}", line.trim_end()),
            Err(e) => {
                debug!(process = label, pid = pid, error = ?e.to_string(), "output_read_failed");
                break;
            }
        }
    }
}

/// Deliver `signal` to `pid`; a process that is already gone is not an error.
pub fn signal(pid: u32, signal: Signal) -> io::Result<()> {
    debug!(pid = ?pid, signal = ?signal, "process_signal_send");
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Stop a child we own: SIGTERM, wait up to `grace`, then SIGKILL and reap.
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    let pid = child.id();
    signal(pid, Signal::SIGTERM)?;
    if let Some(status) = wait_timeout(child, grace)? {
        debug!(pid = ?pid, "process_exited_after_sigterm");
        return Ok(status);
    }

    warn!(pid = ?pid, "process_ignored_sigterm");
    child.kill()?;
    let status = child.wait()?;
    debug!(pid = ?pid, "process_exited_after_sigkill");
    Ok(status)
}

/// Poll `child` until it exits or `timeout` passes.
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_stops_a_sleeping_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let started = Instant::now();
        let status = terminate(&mut child, STOP_GRACE).unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < STOP_GRACE);
    }

    #[test]
    fn terminate_escalates_to_sigkill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        // Give the shell a moment to install the trap.
        thread::sleep(Duration::from_millis(200));
        let status = terminate(&mut child, Duration::from_millis(300)).unwrap();
        assert!(!status.success());
    }

    #[test]
    fn terminate_on_exited_child_returns_status() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        assert!(terminate(&mut child, STOP_GRACE).unwrap().success());
    }

    #[test]
    fn spawn_logged_merges_streams_and_exits() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err 1>&2"]);
        let mut child = spawn_logged(&mut command, "test").unwrap();
        assert!(child.wait().unwrap().success());
    }
}
