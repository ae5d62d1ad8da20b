use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
}

impl TunnelState {
    /// Stable numeric code used across the JNI boundary.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Connecting),
            2 => Some(Self::Connected),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Receives every state transition, in order.
///
/// Called with the state machine locked: implementations must not call back
/// into the orchestrator.
pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, state: TunnelState);
}

impl<F> StateObserver for F
where
    F: Fn(TunnelState) + Send + Sync,
{
    fn on_state_changed(&self, state: TunnelState) {
        self(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct MachineState {
    state: TunnelState,
    generation: u64,
    last_failure: Option<String>,
    next_observer: u64,
    observers: Vec<(ObserverId, Arc<dyn StateObserver>)>,
}

/// DISCONNECTED -> CONNECTING -> CONNECTED, back to DISCONNECTED on stop or
/// failure.
///
/// Each accepted start gets a generation number; a stop bumps it, so a worker
/// still running an older start can no longer move the machine.
pub struct TunnelStateMachine {
    inner: Mutex<MachineState>,
}

impl Default for TunnelStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MachineState {
                state: TunnelState::Disconnected,
                generation: 0,
                last_failure: None,
                next_observer: 0,
                observers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.lock().state
    }

    #[must_use]
    pub fn last_failure(&self) -> Option<String> {
        self.lock().last_failure.clone()
    }

    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) -> ObserverId {
        let mut inner = self.lock();
        let id = ObserverId(inner.next_observer);
        inner.next_observer += 1;
        inner.observers.push((id, observer));
        id
    }

    /// Forward transitions into `tx`; the subscription outlives a dropped
    /// receiver but sends to it are ignored.
    pub fn subscribe_channel(&self, tx: Sender<TunnelState>) -> ObserverId {
        let tx = Mutex::new(tx);
        self.subscribe(Arc::new(move |state: TunnelState| {
            let _ = tx.lock().unwrap_or_else(PoisonError::into_inner).send(state);
        }))
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        inner.observers.len() != before
    }

    /// Accept a start request. Returns the generation of the new attempt, or
    /// `None` when a tunnel is already connecting or connected.
    pub fn begin_connect(&self) -> Option<u64> {
        let mut inner = self.lock();
        if inner.state != TunnelState::Disconnected {
            debug!(state = %inner.state, "start_ignored");
            return None;
        }
        inner.generation += 1;
        inner.last_failure = None;
        let generation = inner.generation;
        transition(&mut inner, TunnelState::Connecting);
        Some(generation)
    }

    /// Retire whatever start is in flight. Returns the generation the
    /// caller's teardown owns; pass it to [`Self::mark_disconnected`].
    pub fn invalidate(&self) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.generation
    }

    /// `generation` is still connecting.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.generation == generation && inner.state == TunnelState::Connecting
    }

    /// `generation` is connecting or connected.
    #[must_use]
    pub fn is_live(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.generation == generation && inner.state != TunnelState::Disconnected
    }

    /// CONNECTING -> CONNECTED for `generation`. False if it went stale.
    pub fn mark_connected(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != TunnelState::Connecting {
            return false;
        }
        transition(&mut inner, TunnelState::Connected);
        true
    }

    /// The tunnel of `generation` failed, while starting or after: record
    /// why and return to DISCONNECTED, unless a stop already took over.
    pub fn fail(&self, generation: u64, reason: impl Into<String>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state == TunnelState::Disconnected {
            return false;
        }
        let reason = reason.into();
        warn!(reason = ?reason, "tunnel_failed");
        inner.last_failure = Some(reason);
        transition(&mut inner, TunnelState::Disconnected);
        true
    }

    /// Finish the stop that obtained `generation` from [`Self::invalidate`].
    /// No-op when a later start or stop has moved the generation on.
    pub fn mark_disconnected(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(generation, current = inner.generation, "stale_disconnect_ignored");
            return false;
        }
        transition(&mut inner, TunnelState::Disconnected);
        true
    }
}

fn transition(inner: &mut MachineState, next: TunnelState) {
    if inner.state == next {
        return;
    }
    info!(from = %inner.state, to = %next, "tunnel_state_changed");
    inner.state = next;
    for (_, observer) in &inner.observers {
        observer.on_state_changed(next);
    }
}
