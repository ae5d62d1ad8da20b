//! Descriptor handoff: pass the interface fd to the relay over its unix socket.
//!
//! The relay cannot open the interface itself, so the orchestrator connects to
//! the socket the relay listens on, attaches the descriptor as `SCM_RIGHTS`
//! ancillary data next to a single sentinel byte, and hangs up. The relay may
//! not be listening yet when we are ready, hence the retry loop.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use tracing::{debug, info, warn};

use crate::error::HandoffError;

/// Byte sent alongside the descriptor.
pub const SENTINEL: u8 = 42;

const DEFAULT_MAX_ATTEMPTS: u32 = 6;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

/// Bounded exponential backoff for the handoff loop.
///
/// Attempt 0 runs immediately; attempt `n > 0` waits `base_delay << (n - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

/// One try of the handoff loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffAttempt {
    pub attempt: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn attempts(&self) -> impl Iterator<Item = HandoffAttempt> + '_ {
        (0..self.max_attempts).map(|attempt| HandoffAttempt {
            attempt,
            delay: self.delay_before(attempt),
        })
    }
}

/// Hand `fd` to the relay listening on `path`.
///
/// `keep_going` is checked before and after every backoff sleep; once it
/// returns false the loop gives up with [`HandoffError::Aborted`].
pub fn send_descriptor(
    path: &Path,
    fd: BorrowedFd<'_>,
    policy: &RetryPolicy,
    keep_going: impl Fn() -> bool,
) -> Result<(), HandoffError> {
    debug!(path = ?path.display().to_string(), fd = fd.as_raw_fd(), "handoff_begin");
    retry(policy, keep_going, |_| send_once(path, fd))
}

/// Run [`send_descriptor`] on a transient `tunnel-handoff` thread.
pub fn spawn_send(
    path: PathBuf,
    fd: OwnedFd,
    policy: RetryPolicy,
    keep_going: impl Fn() -> bool + Send + 'static,
) -> io::Result<JoinHandle<Result<(), HandoffError>>> {
    thread::Builder::new()
        .name("tunnel-handoff".to_string())
        .spawn(move || {
            use std::os::fd::AsFd;
            send_descriptor(&path, fd.as_fd(), &policy, keep_going)
        })
}

pub(crate) fn retry<F>(
    policy: &RetryPolicy,
    keep_going: impl Fn() -> bool,
    mut attempt_once: F,
) -> Result<(), HandoffError>
where
    F: FnMut(&HandoffAttempt) -> io::Result<()>,
{
    let mut last_error = None;
    for attempt in policy.attempts() {
        if !keep_going() {
            return Err(HandoffError::Aborted {
                attempts: attempt.attempt,
            });
        }
        if !attempt.delay.is_zero() {
            thread::sleep(attempt.delay);
            if !keep_going() {
                return Err(HandoffError::Aborted {
                    attempts: attempt.attempt,
                });
            }
        }

        debug!(attempt = attempt.attempt, delay_ms = attempt.delay.as_millis() as u64, "handoff_attempt");
        match attempt_once(&attempt) {
            Ok(()) => {
                info!(attempt = attempt.attempt, "handoff_sent");
                return Ok(());
            }
            Err(e) => {
                warn!(attempt = attempt.attempt, error = ?e.to_string(), "handoff_attempt_failed");
                last_error = Some(e);
            }
        }
    }

    Err(HandoffError::Exhausted {
        attempts: policy.max_attempts,
        last_error: last_error.unwrap_or_else(|| io::Error::other("no handoff attempt was made")),
    })
}

fn send_once(path: &Path, fd: BorrowedFd<'_>) -> io::Result<()> {
    let stream = UnixStream::connect(path)?;
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let payload = [SENTINEL];
    let iov = [IoSlice::new(&payload)];
    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
        .map_err(io::Error::from)?;
    if sent != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "relay socket accepted no payload",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::test_support::receive_descriptor;

    #[test]
    fn delays_follow_exponential_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = policy
            .attempts()
            .map(|a| a.delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 50, 100, 200, 400, 800]);
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(64, Duration::from_millis(50));
        assert!(policy.delay_before(63) >= policy.delay_before(40));
    }

    #[test]
    fn failing_attempts_exhaust_after_six_tries_with_backoff() {
        let policy = RetryPolicy::default();
        let mut started = Vec::new();
        let result = retry(&policy, || true, |_| {
            started.push(Instant::now());
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        });

        match result {
            Err(HandoffError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last_error.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected exhausted, got {:?}", other),
        }

        assert_eq!(started.len(), 6);
        let expected = [50u128, 100, 200, 400, 800];
        for (gap, want) in started.windows(2).map(|w| w[1] - w[0]).zip(expected) {
            let got = gap.as_millis();
            assert!(got >= want, "gap {}ms shorter than {}ms", got, want);
            assert!(got < want + 150, "gap {}ms too long for {}ms", got, want);
        }
    }

    #[test]
    fn retry_stops_when_tunnel_is_no_longer_wanted() {
        let policy = RetryPolicy::new(6, Duration::from_millis(1));
        let checks = AtomicU32::new(0);
        let mut tries = 0;
        let result = retry(
            &policy,
            || checks.fetch_add(1, Ordering::SeqCst) < 2,
            |_| {
                tries += 1;
                Err(io::Error::from(io::ErrorKind::NotFound))
            },
        );
        assert!(matches!(result, Err(HandoffError::Aborted { attempts: 1 })));
        assert_eq!(tries, 1);
    }

    #[test]
    fn missing_socket_reports_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::open("/dev/null").unwrap();
        let policy = RetryPolicy::new(6, Duration::from_millis(1));

        use std::os::fd::AsFd;
        let result = send_descriptor(&dir.path().join("sock_path"), file.as_fd(), &policy, || true);
        match result {
            Err(HandoffError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last_error.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[test]
    fn descriptor_and_sentinel_reach_the_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock_path");
        let listener = UnixListener::bind(&path).unwrap();
        let (mut local, remote) = UnixStream::pair().unwrap();

        let receiver = thread::spawn(move || receive_descriptor(&listener));
        let handle = spawn_send(path, OwnedFd::from(remote), RetryPolicy::default(), || true).unwrap();
        handle.join().unwrap().unwrap();

        let (fd, byte) = receiver.join().unwrap();
        assert_eq!(byte, SENTINEL);

        // The received descriptor is the same socket: writing to it reaches `local`.
        let mut passed = File::from(fd);
        passed.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn handoff_waits_for_a_late_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock_path");
        let (_local, remote) = UnixStream::pair().unwrap();

        let handle = spawn_send(path.clone(), OwnedFd::from(remote), RetryPolicy::default(), || true).unwrap();
        thread::sleep(Duration::from_millis(120));
        let listener = UnixListener::bind(&path).unwrap();
        let (_fd, byte) = receive_descriptor(&listener);

        handle.join().unwrap().unwrap();
        assert_eq!(byte, SENTINEL);
    }
}
