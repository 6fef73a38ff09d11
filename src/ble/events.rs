//! Notification re-subscription after a silent GATT reconnection.
//!
//! Some platforms keep service and characteristic handles structurally
//! valid across a brief link drop. In that case a full re-initialization
//! is wasted work: the stored handles are re-subscribed instead. Stale
//! listener registrations are removed first so a notification is never
//! delivered twice.

use std::sync::Arc;
use tracing::{debug, info};

use super::initializer::{subscribe_channels, ChannelBinding};
use crate::error::Result;
use crate::transport::{BleTransport, ServiceHandle};

/// Re-establishes notification listeners on existing session handles.
pub struct EventManager<'a, T: BleTransport> {
    transport: &'a T,
}

impl<'a, T: BleTransport> EventManager<'a, T> {
    /// Create an event manager over a transport.
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Remove stale listeners and re-subscribe every channel.
    ///
    /// Applies the same critical/non-critical split as initialization;
    /// returns whether the session came back degraded.
    pub(crate) async fn reestablish(
        &self,
        service: &ServiceHandle,
        bindings: &[Arc<ChannelBinding>],
    ) -> Result<bool> {
        for binding in bindings {
            let stale = binding.characteristic.read().clone();
            if let Some(characteristic) = stale {
                match self.transport.unsubscribe(&characteristic).await {
                    Ok(()) => debug!(
                        "removed stale {} listener",
                        binding.spec.kind.name()
                    ),
                    // Expected when the platform dropped the registration
                    // along with the link.
                    Err(e) => debug!(
                        "stale {} unsubscribe failed: {}",
                        binding.spec.kind.name(),
                        e
                    ),
                }
            }
        }

        let degraded = subscribe_channels(self.transport, service, bindings).await?;
        info!(
            "event listeners re-established{}",
            if degraded { " (degraded)" } else { "" }
        );
        Ok(degraded)
    }
}
