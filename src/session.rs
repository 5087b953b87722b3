//! Call session controller: the engine's handle on one call attempt.
//!
//! The media session itself (SFU connection, audio, video) lives outside this
//! crate. A [`CallSessionFactory`] implementation hands out a
//! [`GroupCallController`] whose lifecycle signals the session backend
//! completes; the coordination engine only awaits and steers them.

use crate::sfu::ParticipantId;
use crate::types::{CallId, GroupCallDescription, Identity};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("call session disposed")]
    Disposed,

    #[error("call session closed: {0}")]
    Closed(String),
}

/// Phase of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Confirmed,
    Declined,
    Disposed,
}

/// The local decision on a connected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    /// Keep the call; participate.
    Confirmed,
    /// Abort the call; used by a creator that found stale SFU state.
    Declined,
}

/// Data the session backend reports once the SFU connection is established.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedInfo {
    /// Authoritative call start, milliseconds since the unix epoch.
    pub started_at: u64,
    /// Participants already in the call, excluding ourselves.
    pub participants: Vec<ParticipantId>,
}

/// A one-shot, multi-waiter completion signal.
struct Signal<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Signal<T> {
    fn new() -> Self {
        Self {
            tx: watch::channel(None).0,
        }
    }

    /// Complete the signal. The first value wins; later completions are
    /// ignored.
    fn complete(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(value);
                true
            } else {
                false
            }
        });
    }

    fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    async fn wait(&self) -> Result<T, SessionError> {
        let mut rx = self.tx.subscribe();
        let guard = rx
            .wait_for(|value| value.is_some())
            .await
            .map_err(|_| SessionError::Closed("signal sender dropped".into()))?;
        guard
            .clone()
            .ok_or_else(|| SessionError::Closed("signal resolved empty".into()))
    }
}

/// Controller for a single call session.
///
/// The engine side awaits [`connected`](Self::connected) /
/// [`disposed`](Self::disposed) and issues `confirm`/`decline`/`leave`; the
/// session backend completes the `mark_*` signals and observes the decision.
pub struct GroupCallController {
    description: Mutex<GroupCallDescription>,
    phase: watch::Sender<SessionPhase>,
    connected: Signal<ConnectedInfo>,
    disposed: Signal<()>,
    left: Signal<()>,
    decision: Signal<CallDecision>,
    leave_requested: Signal<()>,
    microphone_active: AtomicBool,
    allowed_participants: Mutex<Option<HashSet<Identity>>>,
}

impl GroupCallController {
    pub fn new(description: GroupCallDescription) -> Arc<Self> {
        Arc::new(Self {
            description: Mutex::new(description),
            phase: watch::channel(SessionPhase::Connecting).0,
            connected: Signal::new(),
            disposed: Signal::new(),
            left: Signal::new(),
            decision: Signal::new(),
            leave_requested: Signal::new(),
            microphone_active: AtomicBool::new(true),
            allowed_participants: Mutex::new(None),
        })
    }

    pub fn call_id(&self) -> CallId {
        self.description().call_id
    }

    pub fn description(&self) -> GroupCallDescription {
        self.description
            .lock()
            .unwrap()
            .clone()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn microphone_active(&self) -> bool {
        self.microphone_active.load(Ordering::Relaxed)
    }

    pub fn set_microphone_active(&self, active: bool) {
        self.microphone_active.store(active, Ordering::Relaxed);
    }

    /// Wait until the session is connected. Resolves with
    /// [`SessionError::Disposed`] if the session dies first.
    pub async fn connected(&self) -> Result<ConnectedInfo, SessionError> {
        tokio::select! {
            biased;
            info = self.connected.wait() => info,
            _ = self.disposed.wait() => Err(SessionError::Disposed),
        }
    }

    /// Wait until the session is fully torn down.
    pub async fn disposed(&self) -> Result<(), SessionError> {
        self.disposed.wait().await
    }

    /// Wait until the local user has left the call (or the session died).
    pub async fn left(&self) -> Result<(), SessionError> {
        self.left.wait().await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_complete()
    }

    /// Keep the call. Creators confirm after the wait window, joiners
    /// immediately on `Connected`.
    pub fn confirm(&self) {
        self.decision.complete(CallDecision::Confirmed);
        self.set_phase(SessionPhase::Confirmed);
    }

    /// Abort the call attempt without keeping it.
    pub fn decline(&self) {
        self.decision.complete(CallDecision::Declined);
        self.set_phase(SessionPhase::Declined);
    }

    /// Request the session backend to leave the call.
    pub fn leave(&self) {
        self.leave_requested.complete(());
    }

    /// Restrict the call to the given identities. The session backend drops
    /// everyone else.
    pub fn purge_participants(&self, allowed: HashSet<Identity>) {
        *self
            .allowed_participants
            .lock()
            .unwrap() = Some(allowed);
    }

    pub fn allowed_participants(&self) -> Option<HashSet<Identity>> {
        self.allowed_participants
            .lock()
            .unwrap()
            .clone()
    }

    // -- session backend side --

    pub fn mark_connected(&self, info: ConnectedInfo) {
        self.connected.complete(info);
        self.set_phase(SessionPhase::Connected);
    }

    pub fn mark_left(&self) {
        self.left.complete(());
    }

    pub fn mark_disposed(&self) {
        // Disposal implies the user is no longer in the call.
        self.left.complete(());
        self.disposed.complete(());
        self.set_phase(SessionPhase::Disposed);
    }

    /// Await the engine's confirm/decline decision.
    pub async fn decision(&self) -> Result<CallDecision, SessionError> {
        self.decision.wait().await
    }

    /// Await the engine's leave request.
    pub async fn leave_requested(&self) -> Result<(), SessionError> {
        self.leave_requested.wait().await
    }

    fn set_phase(&self, phase: SessionPhase) {
        // Disposed is terminal.
        self.phase.send_if_modified(|current| {
            if *current == SessionPhase::Disposed || *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }
}

/// Boundary to the media session implementation.
#[async_trait]
pub trait CallSessionFactory: Send + Sync {
    /// Start (or bind) a session for the given call and return its
    /// controller. The backend completes the controller's lifecycle signals.
    async fn start_session(
        &self,
        description: &GroupCallDescription,
    ) -> Result<Arc<GroupCallController>, SessionError>;
}
