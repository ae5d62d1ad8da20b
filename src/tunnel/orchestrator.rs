//! Sequences a tunnel start and owns its teardown.
//!
//! Start runs on a `tunnel-start` worker: interface, relay, descriptor
//! handoff, protocol engine, then CONNECTED. Every acquired resource is parked
//! in the session under its lock, after re-checking that the start is still
//! current; a stop bumps the state machine's generation and then empties the
//! session, so whichever side loses the race releases the resource.
//!
//! Stops run one at a time, on a `tunnel-stop` worker unless the caller uses
//! the blocking [`Orchestrator::stop`]. A relay that crashes and cannot be
//! restarted takes the whole tunnel down the same way, ending in a failure.
//!
//! Lock order: stop, then session, then state machine.

use std::mem;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config;
use crate::engine::{self, ProtocolEngine};
use crate::error::{AppError, HandoffError, Result};
use crate::profile::TunnelProfile;
use crate::relay::{handoff, RelayCommand, RelaySupervisor, RetryPolicy};

use super::interface::{InterfaceHandle, InterfaceParams, InterfaceProvider};
use super::state::{ObserverId, StateObserver, TunnelState, TunnelStateMachine};

/// Everything a start sequence needs besides the profile.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub private_dir: PathBuf,
    pub relay: RelayCommand,
    pub handoff: RetryPolicy,
    pub interface: InterfaceParams,
}

impl TunnelSettings {
    /// tun2socks from `relay_program`, default handoff policy, and the
    /// default interface layout excluding `app_id`.
    pub fn new(private_dir: impl Into<PathBuf>, relay_program: impl Into<PathBuf>, app_id: &str) -> Self {
        let private_dir = private_dir.into();
        Self {
            relay: RelayCommand::tun2socks(relay_program, &private_dir),
            private_dir,
            handoff: RetryPolicy::default(),
            interface: InterfaceParams::tunnel_default(app_id),
        }
    }
}

#[derive(Default)]
struct Session {
    interface: Option<InterfaceHandle>,
    relay: Option<RelaySupervisor>,
    engine_running: bool,
}

struct Inner {
    machine: TunnelStateMachine,
    interfaces: Arc<dyn InterfaceProvider>,
    engine: Arc<dyn ProtocolEngine>,
    settings: TunnelSettings,
    session: Mutex<Session>,
    stop_lock: Mutex<()>,
    /// Start, stop and relay-lost workers still running.
    in_flight: Mutex<usize>,
    settled: Condvar,
}

/// Public facade over one tunnel. Dropping it stops the tunnel.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        settings: TunnelSettings,
        interfaces: Arc<dyn InterfaceProvider>,
        engine: Arc<dyn ProtocolEngine>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                machine: TunnelStateMachine::new(),
                interfaces,
                engine,
                settings,
                session: Mutex::new(Session::default()),
                stop_lock: Mutex::new(()),
                in_flight: Mutex::new(0),
                settled: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &TunnelSettings {
        &self.inner.settings
    }

    /// Begin connecting with `profile`.
    ///
    /// Returns false, doing nothing, unless the tunnel is DISCONNECTED. On
    /// true the state is already CONNECTING and the rest runs in the
    /// background.
    pub fn request_start(&self, profile: TunnelProfile) -> bool {
        let Some(generation) = self.inner.machine.begin_connect() else {
            return false;
        };
        let inner = Arc::clone(&self.inner);
        let spawned = spawn_worker(&self.inner, "tunnel-start", move || {
            start_worker(&inner, generation, &profile);
        });
        if let Err(e) = spawned {
            error!(error = ?e.to_string(), "start_worker_spawn_failed");
            self.inner.machine.fail(generation, format!("failed to spawn start worker: {}", e));
        }
        true
    }

    /// Tear everything down in the background and end in DISCONNECTED.
    ///
    /// Returns at once; [`Self::wait_until_settled`] waits for the teardown.
    pub fn request_stop(&self) {
        let inner = Arc::clone(&self.inner);
        let spawned = spawn_worker(&self.inner, "tunnel-stop", move || inner.stop());
        if let Err(e) = spawned {
            warn!(error = ?e.to_string(), "stop_worker_spawn_failed");
            self.inner.stop();
        }
    }

    /// Like [`Self::request_stop`], but returns only once the teardown is
    /// done. Blocks for up to the relay's stop grace period.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Wait until no start or stop is running. False on timeout.
    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.inner.lock_in_flight();
        while *in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            in_flight = self
                .inner
                .settled
                .wait_timeout(in_flight, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.inner.machine.state()
    }

    /// Why the tunnel last failed, if it did since the latest start.
    #[must_use]
    pub fn last_failure(&self) -> Option<String> {
        self.inner.machine.last_failure()
    }

    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) -> ObserverId {
        self.inner.machine.subscribe(observer)
    }

    pub fn subscribe_channel(&self, tx: Sender<TunnelState>) -> ObserverId {
        self.inner.machine.subscribe_channel(tx)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.machine.unsubscribe(id)
    }

    /// Duplicate of the live interface descriptor.
    pub fn interface_fd(&self) -> Result<OwnedFd> {
        let session = self.inner.lock_session();
        session
            .interface
            .as_ref()
            .ok_or(AppError::Closed)?
            .try_clone_fd()
    }

    #[must_use]
    pub fn relay_pid(&self) -> Option<u32> {
        self.inner.lock_session().relay.as_ref().and_then(RelaySupervisor::pid)
    }

    #[must_use]
    pub fn relay_spawn_count(&self) -> u64 {
        self.inner
            .lock_session()
            .relay
            .as_ref()
            .map_or(0, RelaySupervisor::spawn_count)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `work` on a named thread counted in `in_flight`.
fn spawn_worker(
    inner: &Arc<Inner>,
    name: &str,
    work: impl FnOnce() + Send + 'static,
) -> std::io::Result<()> {
    *inner.lock_in_flight() += 1;
    let tracked = Arc::clone(inner);
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        work();
        tracked.finish_task();
    });
    match spawned {
        Ok(_) => Ok(()),
        Err(e) => {
            inner.finish_task();
            Err(e)
        }
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stop(&self) -> MutexGuard<'_, ()> {
        self.stop_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_task(&self) {
        let mut in_flight = self.lock_in_flight();
        *in_flight = in_flight.saturating_sub(1);
        self.settled.notify_all();
    }

    fn stop(&self) {
        let _serial = self.lock_stop();
        let generation = self.machine.invalidate();
        let session = mem::take(&mut *self.lock_session());
        release(self.engine.as_ref(), session);
        self.machine.mark_disconnected(generation);
    }

    /// The relay of `generation` died and could not be restarted.
    fn relay_lost(&self, generation: u64, reason: &str) {
        let _serial = self.lock_stop();
        let (owned, session) = {
            let mut session = self.lock_session();
            if !self.machine.is_live(generation) {
                debug!(generation, "stale_relay_loss_ignored");
                return;
            }
            (self.machine.invalidate(), mem::take(&mut *session))
        };
        error!(generation, reason = ?reason, "relay_lost");
        release(self.engine.as_ref(), session);
        self.machine.fail(owned, format!("relay could not be restarted: {}", reason));
    }

    /// Release whatever a cancelled start left parked once no stop is
    /// left to do it.
    fn drain_if_disconnected(&self) {
        let session = {
            let mut session = self.lock_session();
            if self.machine.state() != TunnelState::Disconnected {
                return;
            }
            mem::take(&mut *session)
        };
        release(self.engine.as_ref(), session);
    }

    fn ensure_current(&self, generation: u64) -> Result<()> {
        if self.machine.is_current(generation) {
            Ok(())
        } else {
            Err(AppError::Cancelled)
        }
    }

    /// Store `resource` in the session if `generation` is still current;
    /// otherwise hand it to `release` and report the cancellation.
    fn park<T>(
        &self,
        generation: u64,
        resource: T,
        store: impl FnOnce(&mut Session, T),
        release: impl FnOnce(T),
    ) -> Result<()> {
        let mut session = self.lock_session();
        if !self.machine.is_current(generation) {
            drop(session);
            release(resource);
            return Err(AppError::Cancelled);
        }
        store(&mut session, resource);
        Ok(())
    }
}

fn start_worker(inner: &Arc<Inner>, generation: u64, profile: &TunnelProfile) {
    match run_start(inner, generation, profile) {
        Ok(()) => info!(profile = ?profile.name, generation, "tunnel_connected"),
        Err(AppError::Cancelled) => {
            info!(generation, "tunnel_start_cancelled");
            inner.drain_if_disconnected();
        }
        Err(e) => {
            let session = {
                let mut session = inner.lock_session();
                if inner.machine.is_current(generation) {
                    Some(mem::take(&mut *session))
                } else {
                    None
                }
            };
            if let Some(session) = session {
                release(inner.engine.as_ref(), session);
            }
            inner.machine.fail(generation, e.to_string());
        }
    }
}

fn run_start(inner: &Arc<Inner>, generation: u64, profile: &TunnelProfile) -> Result<()> {
    profile.validate()?;
    let settings = &inner.settings;
    config::ensure_private_dir(&settings.private_dir)?;

    let interface = inner.interfaces.establish(&settings.interface)?;
    let handoff_fd = match interface.try_clone_fd() {
        Ok(fd) => fd,
        Err(e) => {
            close_interface(interface);
            return Err(e);
        }
    };
    debug!(interface = ?interface.name(), "interface_ready");
    inner.park(
        generation,
        interface,
        |session, interface| session.interface = Some(interface),
        close_interface,
    )?;

    let relay =
        RelaySupervisor::start_watched(settings.relay.clone(), relay_lost_hook(inner, generation))?;
    inner.park(
        generation,
        relay,
        |session, relay| session.relay = Some(relay),
        stop_relay,
    )?;

    let keep_going = {
        let inner = Arc::clone(inner);
        move || inner.machine.is_current(generation)
    };
    let sent = handoff::spawn_send(
        settings.relay.socket_path(),
        handoff_fd,
        settings.handoff,
        keep_going,
    )?
    .join()
    .map_err(|_| AppError::Other("handoff thread panicked".to_string()))?;
    match sent {
        Ok(()) => {}
        Err(HandoffError::Aborted { .. }) => return Err(AppError::Cancelled),
        Err(e) => return Err(e.into()),
    }

    inner.ensure_current(generation)?;
    let rendered = engine::render(profile);
    inner.engine.start(&rendered)?;
    let engine = Arc::clone(&inner.engine);
    inner.park(
        generation,
        (),
        |session, ()| session.engine_running = true,
        move |()| stop_engine(engine.as_ref()),
    )?;

    let _session = inner.lock_session();
    if inner.machine.mark_connected(generation) {
        Ok(())
    } else {
        Err(AppError::Cancelled)
    }
}

/// Give-up hook for the relay of `generation`. Runs on the relay monitor,
/// which the teardown joins, so the work moves to a `relay-lost` worker.
fn relay_lost_hook(inner: &Arc<Inner>, generation: u64) -> impl Fn(&str) + Send + Sync + 'static {
    let inner: Weak<Inner> = Arc::downgrade(inner);
    move |reason: &str| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let reason = reason.to_string();
        let worker = Arc::clone(&inner);
        let spawned = spawn_worker(&inner, "relay-lost", move || {
            worker.relay_lost(generation, &reason);
        });
        if let Err(e) = spawned {
            error!(error = ?e.to_string(), "relay_lost_worker_spawn_failed");
        }
    }
}

/// Best-effort teardown: engine, relay, interface.
fn release(engine: &dyn ProtocolEngine, session: Session) {
    let Session {
        interface,
        relay,
        engine_running,
    } = session;
    if engine_running {
        stop_engine(engine);
    }
    if let Some(relay) = relay {
        stop_relay(relay);
    }
    if let Some(interface) = interface {
        close_interface(interface);
    }
}

fn stop_engine(engine: &dyn ProtocolEngine) {
    if let Err(e) = engine.stop() {
        warn!(error = ?e.to_string(), "engine_stop_failed");
    }
}

fn stop_relay(relay: RelaySupervisor) {
    if let Err(e) = relay.stop() {
        warn!(error = ?e.to_string(), "relay_stop_failed");
    }
}

fn close_interface(mut interface: InterfaceHandle) {
    if let Err(e) = interface.close() {
        warn!(interface = ?interface.name(), error = ?e.to_string(), "interface_close_failed");
    }
}
