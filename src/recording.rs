//! Shared recording state and the auto-reconnection timer.
//!
//! A [`RecordingRegistry`] is constructed by the application and passed to
//! every connection manager explicitly. While either recording flag is
//! set, sessions may not be torn down without force, unexpected link
//! drops schedule reconnection, and a shared timer periodically retries
//! any registered session that wants its link back. When both flags are
//! clear the timer is stopped and link drops settle in idle.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A session the reconnection timer can call back into.
#[async_trait]
pub trait Reconnectable: Send + Sync {
    /// Short label for logs.
    fn label(&self) -> String;

    /// Whether the session currently holds a live link.
    fn is_connected(&self) -> bool;

    /// Whether the session wants the timer to re-establish its link.
    fn wants_reconnect(&self) -> bool;

    /// Attempt to re-establish the link.
    async fn reconnect(&self) -> Result<()>;
}

/// Process-wide recording flags shared by all connection managers.
///
/// The registry holds only weak references to the sessions it drives;
/// ownership stays with the application's adapters.
pub struct RecordingRegistry {
    foreground: AtomicBool,
    background: AtomicBool,
    poll_interval: Duration,
    sessions: RwLock<Vec<Weak<dyn Reconnectable>>>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RecordingRegistry {
    /// Default reconnection poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(7);

    /// Create a registry with the default poll interval.
    pub fn new() -> Arc<Self> {
        Self::with_poll_interval(Self::DEFAULT_POLL_INTERVAL)
    }

    /// Create a registry with a custom reconnection poll interval.
    pub fn with_poll_interval(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            foreground: AtomicBool::new(false),
            background: AtomicBool::new(false),
            poll_interval,
            sessions: RwLock::new(Vec::new()),
            timer: Mutex::new(None),
        })
    }

    /// Whether a foreground recording is active.
    pub fn foreground_recording(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// Whether a background recording is active.
    pub fn background_recording(&self) -> bool {
        self.background.load(Ordering::SeqCst)
    }

    /// Whether any recording is active.
    pub fn is_recording(&self) -> bool {
        self.foreground_recording() || self.background_recording()
    }

    /// Set the foreground recording flag.
    pub fn set_foreground(self: &Arc<Self>, active: bool) {
        self.foreground.store(active, Ordering::SeqCst);
        self.update_timer();
    }

    /// Set the background recording flag.
    pub fn set_background(self: &Arc<Self>, active: bool) {
        self.background.store(active, Ordering::SeqCst);
        self.update_timer();
    }

    /// Register a session for reconnection polling.
    pub fn register(self: &Arc<Self>, session: Weak<dyn Reconnectable>) {
        self.sessions.write().push(session);
    }

    /// Whether the reconnection timer is currently running.
    pub fn reconnect_timer_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Start or stop the timer to match the recording flags.
    fn update_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if self.is_recording() {
            if timer.is_none() {
                info!("recording active, starting reconnection timer");
                *timer = Some(self.spawn_timer());
            }
        } else if let Some(task) = timer.take() {
            info!("recording stopped, stopping reconnection timer");
            task.abort();
        }
    }

    fn spawn_timer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a freshly
            // started recording does not race the session it belongs to.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if !registry.is_recording() {
                    continue;
                }

                let sessions: Vec<Arc<dyn Reconnectable>> = {
                    let mut slots = registry.sessions.write();
                    slots.retain(|weak| weak.strong_count() > 0);
                    slots.iter().filter_map(Weak::upgrade).collect()
                };

                for session in sessions {
                    if session.is_connected() || !session.wants_reconnect() {
                        continue;
                    }
                    debug!("attempting reconnection for {}", session.label());
                    if let Err(e) = session.reconnect().await {
                        warn!("reconnection failed for {}: {}", session.label(), e);
                    }
                }
            }

            debug!("reconnection timer ended");
        })
    }
}

impl Drop for RecordingRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.timer.lock().take() {
            task.abort();
        }
    }
}
