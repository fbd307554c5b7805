//! Per-peer state machine, retry backoff, and the egress worker that
//! serializes outbound RPCs to one peer.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use uuid::Uuid;

use crate::config::{BackoffConfig, PeerSpec};
use crate::net::{PeerClient, PeerClientFactory, PublicationMsg, RpcError, SyncRequest, SyncResponse};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Syncing,
    Initialized,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Idle => "IDLE",
            PeerState::Syncing => "SYNCING",
            PeerState::Initialized => "INITIALIZED",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    PeerAdd,
    SyncRespRcvd,
    RpcError,
}

/// The peer FSM transition function. Pure; drives every state change.
pub fn next_state(state: PeerState, event: PeerEvent) -> PeerState {
    match (state, event) {
        (PeerState::Idle, PeerEvent::PeerAdd) => PeerState::Syncing,
        (PeerState::Syncing, PeerEvent::SyncRespRcvd) => PeerState::Initialized,
        (PeerState::Syncing, PeerEvent::RpcError) => PeerState::Idle,
        // reentrant full-resync keeps the peer initialized
        (PeerState::Initialized, PeerEvent::SyncRespRcvd) => PeerState::Initialized,
        (PeerState::Initialized, PeerEvent::RpcError) => PeerState::Idle,
        (state, _) => state,
    }
}

/// Exponential retry backoff, reset on success.
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let base = Duration::from_millis(config.initial_ms);
        Self {
            base,
            max: Duration::from_millis(config.max_ms),
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Observed view of a peer, as returned by the admin surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerStatus {
    pub spec: PeerSpec,
    pub state: PeerState,
}

/// Runtime record for one peer of one area. Owned by the area loop;
/// `generation` tags every outcome so work from a torn-down incarnation
/// is discarded.
pub struct Peer {
    pub spec: PeerSpec,
    pub state: PeerState,
    pub generation: u64,
    pub backoff: Backoff,
    pub retry_at: Option<Instant>,
    pub pending_sync: Option<Uuid>,
    pub egress: Option<EgressHandle>,
}

impl Peer {
    pub fn new(spec: PeerSpec, backoff: BackoffConfig, generation: u64) -> Self {
        Self {
            spec,
            state: PeerState::Idle,
            generation,
            backoff: Backoff::new(backoff),
            retry_at: None,
            pending_sync: None,
            egress: None,
        }
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            spec: self.spec.clone(),
            state: self.state,
        }
    }

    /// Drop the egress worker and any pending sync; the generation bump
    /// orphans in-flight outcomes.
    pub fn teardown(&mut self, next_generation: u64) {
        self.egress = None;
        self.pending_sync = None;
        self.generation = next_generation;
    }
}

/// Work items executed in FIFO order by the peer's egress worker.
pub enum EgressJob {
    FullSync { token: Uuid, request: SyncRequest },
    FinalizedPush { token: Uuid, publication: PublicationMsg },
    Flood { publication: PublicationMsg },
}

/// Completion report posted back to the owning area loop.
pub enum EgressOutcome {
    SyncDone {
        token: Uuid,
        result: Result<SyncResponse, RpcError>,
    },
    FinalizedDone {
        token: Uuid,
        result: Result<(), RpcError>,
    },
    FloodDone {
        result: Result<(), RpcError>,
    },
}

impl fmt::Debug for EgressOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressOutcome::SyncDone { token, result } => f
                .debug_struct("SyncDone")
                .field("token", token)
                .field("ok", &result.is_ok())
                .finish(),
            EgressOutcome::FinalizedDone { token, result } => f
                .debug_struct("FinalizedDone")
                .field("token", token)
                .field("ok", &result.is_ok())
                .finish(),
            EgressOutcome::FloodDone { result } => f
                .debug_struct("FloodDone")
                .field("ok", &result.is_ok())
                .finish(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EgressTimeouts {
    pub connect: Duration,
    pub sync: Duration,
    pub flood: Duration,
}

/// Sender half held by the area loop; dropping it stops the worker after
/// the job in flight.
pub struct EgressHandle {
    tx: Sender<EgressJob>,
}

impl EgressHandle {
    /// Enqueue a job; returns false when the worker is gone.
    pub fn send(&self, job: EgressJob) -> bool {
        self.tx.send(job).is_ok()
    }
}

/// Spawn the egress worker for one peer incarnation. Outcomes are handed
/// to `on_outcome` tagged with `(peer, generation)`; the worker never
/// touches area state directly.
pub fn spawn_egress(
    peer: String,
    generation: u64,
    addr: String,
    factory: Arc<dyn PeerClientFactory>,
    timeouts: EgressTimeouts,
    on_outcome: impl Fn(String, u64, EgressOutcome) + Send + 'static,
) -> EgressHandle {
    let (tx, rx) = crossbeam::channel::unbounded::<EgressJob>();
    thread::spawn(move || {
        run_egress_worker(peer, generation, addr, factory, timeouts, rx, on_outcome);
    });
    EgressHandle { tx }
}

fn run_egress_worker(
    peer: String,
    generation: u64,
    addr: String,
    factory: Arc<dyn PeerClientFactory>,
    timeouts: EgressTimeouts,
    rx: Receiver<EgressJob>,
    on_outcome: impl Fn(String, u64, EgressOutcome),
) {
    let mut client: Option<Box<dyn PeerClient>> = None;

    while let Ok(job) = rx.recv() {
        let outcome = match job {
            EgressJob::FullSync { token, request } => {
                let result = with_client(&mut client, &*factory, &addr, timeouts.connect, |c| {
                    c.sync_hashes(&request, timeouts.sync)
                });
                EgressOutcome::SyncDone { token, result }
            }
            EgressJob::FinalizedPush { token, publication } => {
                let result = with_client(&mut client, &*factory, &addr, timeouts.connect, |c| {
                    c.apply_publication(&publication, timeouts.sync)
                });
                EgressOutcome::FinalizedDone { token, result }
            }
            EgressJob::Flood { publication } => {
                let result = with_client(&mut client, &*factory, &addr, timeouts.connect, |c| {
                    c.apply_publication(&publication, timeouts.flood)
                });
                EgressOutcome::FloodDone { result }
            }
        };

        let failed = match &outcome {
            EgressOutcome::SyncDone { result, .. } => result.is_err(),
            EgressOutcome::FinalizedDone { result, .. } => result.is_err(),
            EgressOutcome::FloodDone { result } => result.is_err(),
        };
        if failed {
            // next job reconnects rather than reusing a broken stream
            client = None;
            tracing::debug!(target: "mesh", %peer, generation, ?outcome, "egress rpc failed");
        }

        on_outcome(peer.clone(), generation, outcome);
    }
}

fn with_client<T>(
    client: &mut Option<Box<dyn PeerClient>>,
    factory: &dyn PeerClientFactory,
    addr: &str,
    connect_timeout: Duration,
    call: impl FnOnce(&mut dyn PeerClient) -> Result<T, RpcError>,
) -> Result<T, RpcError> {
    if client.is_none() {
        *client = Some(factory.connect(addr, connect_timeout)?);
    }
    let active = client.as_mut().expect("client just connected");
    call(active.as_mut())
}
