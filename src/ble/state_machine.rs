//! Connection session state machine.
//!
//! One machine per session, with a fixed directional transition table,
//! per-state deadlines, and an error counter that forces a hard reset to
//! [`ConnectionState::Idle`] instead of looping through error handling
//! forever. The machine itself is synchronous; the owning manager runs a
//! watchdog task that fires [`ConnectionStateMachine::transition_to_error`]
//! when a state's deadline passes.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::Error;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session activity.
    #[default]
    Idle,
    /// Scanning for candidate devices.
    Scanning,
    /// Establishing the link.
    Connecting,
    /// Discovering services and subscribing notifications.
    Initializing,
    /// Link up, all channels subscribed.
    Connected,
    /// Link up, but one or more non-critical channels failed to subscribe.
    PartialConnected,
    /// Tearing the session down.
    Disconnecting,
    /// A step failed; recovery pending.
    Error,
    /// Link lost while wanted; awaiting the next reconnection attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Check if the session holds a usable link.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::PartialConnected)
    }

    /// Check if a connection attempt is currently in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Initializing)
    }

    /// The states this state may transition to.
    ///
    /// The table is fixed and directional; anything not listed is
    /// rejected. `Error -> Error` is not in the table: re-entry into the
    /// error state is special-cased by [`ConnectionStateMachine::transition_to_error`].
    pub fn allowed_successors(&self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Idle => &[Scanning, Error],
            Scanning => &[Connecting, Error, Idle],
            Connecting => &[Initializing, Error, Idle, Reconnecting],
            Initializing => &[Connected, PartialConnected, Error, Disconnecting],
            Connected => &[Disconnecting, Error, Reconnecting],
            PartialConnected => &[Disconnecting, Error, Reconnecting],
            Disconnecting => &[Idle, Error, Reconnecting],
            Error => &[Idle, Reconnecting, Scanning],
            Reconnecting => &[Connecting, Error, Idle],
        }
    }

    /// Check whether the table allows a transition to `to`.
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        self.allowed_successors().contains(&to)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Connecting => "Connecting",
            Self::Initializing => "Initializing",
            Self::Connected => "Connected",
            Self::PartialConnected => "PartialConnected",
            Self::Disconnecting => "Disconnecting",
            Self::Error => "Error",
            Self::Reconnecting => "Reconnecting",
        };
        write!(f, "{name}")
    }
}

/// Per-state deadline budgets.
///
/// States that wait on external progress get a budget; the terminal set
/// (`Idle`, `Connected`, `PartialConnected`, `Error`) has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTimeouts {
    /// Budget for the scanning state.
    pub scanning: Duration,
    /// Budget for the connecting state.
    pub connecting: Duration,
    /// Budget for the initializing state.
    pub initializing: Duration,
    /// Budget for the disconnecting state.
    pub disconnecting: Duration,
    /// Budget for the reconnecting state.
    pub reconnecting: Duration,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            scanning: Duration::from_secs(30),
            connecting: Duration::from_secs(10),
            initializing: Duration::from_secs(15),
            disconnecting: Duration::from_secs(5),
            reconnecting: Duration::from_secs(10),
        }
    }
}

impl StateTimeouts {
    /// The budget for a given state, if it has one.
    pub fn budget(&self, state: ConnectionState) -> Option<Duration> {
        match state {
            ConnectionState::Scanning => Some(self.scanning),
            ConnectionState::Connecting => Some(self.connecting),
            ConnectionState::Initializing => Some(self.initializing),
            ConnectionState::Disconnecting => Some(self.disconnecting),
            ConnectionState::Reconnecting => Some(self.reconnecting),
            _ => None,
        }
    }
}

/// One entry in the diagnostic transition history.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    /// State before the transition.
    pub from: ConnectionState,
    /// State after the transition.
    pub to: ConnectionState,
    /// When the transition happened.
    pub at: Instant,
    /// Optional context supplied by the caller.
    pub context: Option<String>,
}

/// Event emitted on state machine activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// The state changed.
    Changed {
        /// State before the transition.
        from: ConnectionState,
        /// State after the transition.
        to: ConnectionState,
    },
    /// A transition was requested that the table does not allow.
    Rejected {
        /// The state the machine was in.
        from: ConnectionState,
        /// The state that was requested.
        requested: ConnectionState,
    },
    /// The machine entered (or re-entered) the error state.
    ErrorEntered {
        /// The error message.
        message: String,
        /// The consecutive error count after this entry.
        count: u32,
    },
    /// The error threshold was exceeded and the machine was reset to idle.
    HardReset {
        /// Consecutive errors before the reset.
        errors: u32,
    },
}

/// Consecutive error entries tolerated before the hard reset to idle.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Diagnostic history depth.
const HISTORY_LIMIT: usize = 50;

struct Inner {
    state: ConnectionState,
    entered_at: Instant,
    error_count: u32,
    history: VecDeque<TransitionRecord>,
}

impl Inner {
    fn record(&mut self, from: ConnectionState, to: ConnectionState, context: Option<String>) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            at: Instant::now(),
            context,
        });
    }
}

/// Explicit state machine governing one session's lifecycle.
pub struct ConnectionStateMachine {
    inner: RwLock<Inner>,
    timeouts: StateTimeouts,
    event_tx: broadcast::Sender<StateEvent>,
    changed: Notify,
}

impl ConnectionStateMachine {
    /// Create a machine in `Idle` with default timeouts.
    pub fn new() -> Self {
        Self::with_timeouts(StateTimeouts::default())
    }

    /// Create a machine with custom per-state timeouts.
    pub fn with_timeouts(timeouts: StateTimeouts) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            inner: RwLock::new(Inner {
                state: ConnectionState::Idle,
                entered_at: Instant::now(),
                error_count: 0,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            }),
            timeouts,
            event_tx,
            changed: Notify::new(),
        }
    }

    /// Get the current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Check if the session holds a usable link.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Check if a connection attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        self.state().is_connecting()
    }

    /// The consecutive error count.
    pub fn error_count(&self) -> u32 {
        self.inner.read().error_count
    }

    /// Snapshot of the bounded transition history, oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.read().history.iter().cloned().collect()
    }

    /// Subscribe to state machine events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    /// The current state's deadline, if it has one.
    pub fn deadline(&self) -> Option<Instant> {
        let inner = self.inner.read();
        self.timeouts
            .budget(inner.state)
            .map(|budget| inner.entered_at + budget)
    }

    /// Future resolved on the next transition; used by the watchdog.
    pub(crate) fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Request a transition. Returns false (and emits a rejection event)
    /// if the table does not allow it; the state is left untouched.
    pub fn transition(&self, to: ConnectionState) -> bool {
        self.apply(to, None)
    }

    /// Request a transition with a context string for the history.
    pub fn transition_with_context(&self, to: ConnectionState, context: impl Into<String>) -> bool {
        self.apply(to, Some(context.into()))
    }

    fn apply(&self, to: ConnectionState, context: Option<String>) -> bool {
        let (from, event) = {
            let mut inner = self.inner.write();
            let from = inner.state;

            if !from.can_transition_to(to) {
                drop(inner);
                warn!("rejected transition {} -> {}", from, to);
                let _ = self.event_tx.send(StateEvent::Rejected {
                    from,
                    requested: to,
                });
                return false;
            }

            inner.state = to;
            inner.entered_at = Instant::now();
            inner.record(from, to, context);

            if to == ConnectionState::Connected {
                inner.error_count = 0;
            } else if to == ConnectionState::Error {
                inner.error_count += 1;
            }

            (from, StateEvent::Changed { from, to })
        };

        debug!("state changed: {} -> {}", from, to);
        self.changed.notify_waiters();
        let _ = self.event_tx.send(event);
        true
    }

    /// Enter the error state, bypassing the table.
    ///
    /// Re-entry while already in `Error` is a permitted self-loop and
    /// still counts toward the threshold. Once the consecutive error
    /// count has reached [`MAX_CONSECUTIVE_ERRORS`], the next call forces
    /// a hard reset to `Idle` instead, so a failing session cannot loop
    /// through error recovery forever.
    pub fn transition_to_error(&self, error: &Error) {
        self.transition_to_error_with_context(error, error.to_string())
    }

    /// Enter the error state with an explicit context string.
    pub fn transition_to_error_with_context(&self, error: &Error, context: impl Into<String>) {
        let context = context.into();
        let events = {
            let mut inner = self.inner.write();
            let from = inner.state;

            if inner.error_count >= MAX_CONSECUTIVE_ERRORS {
                let errors = inner.error_count;
                inner.state = ConnectionState::Idle;
                inner.entered_at = Instant::now();
                inner.error_count = 0;
                inner.record(
                    from,
                    ConnectionState::Idle,
                    Some(format!("hard reset after {errors} consecutive errors")),
                );
                warn!(
                    "error threshold reached ({} consecutive), hard reset to Idle: {}",
                    errors, error
                );
                vec![
                    StateEvent::HardReset { errors },
                    StateEvent::Changed {
                        from,
                        to: ConnectionState::Idle,
                    },
                ]
            } else {
                inner.error_count += 1;
                let count = inner.error_count;
                inner.record(from, ConnectionState::Error, Some(context.clone()));
                inner.state = ConnectionState::Error;
                inner.entered_at = Instant::now();
                warn!("entering error state ({} consecutive): {}", count, error);

                let mut events = vec![StateEvent::ErrorEntered {
                    message: context,
                    count,
                }];
                if from != ConnectionState::Error {
                    events.push(StateEvent::Changed {
                        from,
                        to: ConnectionState::Error,
                    });
                }
                events
            }
        };

        self.changed.notify_waiters();
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
