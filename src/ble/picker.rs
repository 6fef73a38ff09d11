//! Device-picker protocol.
//!
//! When a scan yields more than one candidate and no stored preferred
//! device matches, the core publishes a [`PickerRequest`] for the
//! embedding UI to render and waits for [`DevicePicker::resolve_selection`]
//! or [`DevicePicker::reject_selection`]. If nothing answers within the
//! picker timeout — or nothing is listening at all — selection falls back
//! to the strongest signal.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::DeviceHandle;

/// A request for the embedding UI to pick one of several candidates.
#[derive(Debug, Clone)]
pub struct PickerRequest {
    /// The candidate devices, as discovered.
    pub candidates: Vec<DeviceHandle>,
}

/// Entry points for a device-picker UI.
pub struct DevicePicker {
    request_tx: broadcast::Sender<PickerRequest>,
    pending: Mutex<Option<oneshot::Sender<Result<DeviceHandle>>>>,
    timeout: Duration,
}

impl DevicePicker {
    /// How long the picker UI gets before best-signal fallback.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a picker with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Create a picker with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (request_tx, _) = broadcast::channel(4);
        Self {
            request_tx,
            pending: Mutex::new(None),
            timeout,
        }
    }

    /// Subscribe to picker requests.
    pub fn subscribe(&self) -> broadcast::Receiver<PickerRequest> {
        self.request_tx.subscribe()
    }

    /// Complete the pending request with the user's selection.
    ///
    /// Returns false if no selection was pending.
    pub fn resolve_selection(&self, device: DeviceHandle) -> bool {
        match self.pending.lock().take() {
            Some(tx) => tx.send(Ok(device)).is_ok(),
            None => {
                debug!("resolve_selection with no pending picker request");
                false
            }
        }
    }

    /// Reject the pending request (e.g. the user dismissed the dialog).
    ///
    /// Returns false if no selection was pending.
    pub fn reject_selection(&self, reason: impl Into<String>) -> bool {
        match self.pending.lock().take() {
            Some(tx) => tx
                .send(Err(Error::PickerRejected {
                    reason: reason.into(),
                }))
                .is_ok(),
            None => {
                debug!("reject_selection with no pending picker request");
                false
            }
        }
    }

    /// Choose one device from the scan candidates.
    ///
    /// A single candidate is selected directly. With several, the picker
    /// request is published and awaited; timeout or an absent UI falls
    /// back to the strongest signal. A rejection propagates to the
    /// caller.
    pub(crate) async fn select(&self, candidates: Vec<DeviceHandle>) -> Result<DeviceHandle> {
        match candidates.len() {
            0 => {
                return Err(Error::DeviceNotFound {
                    identifier: "no candidates from scan".to_string(),
                })
            }
            1 => {
                let mut candidates = candidates;
                return Ok(candidates.remove(0));
            }
            n => debug!("{} candidates, asking the picker", n),
        }

        if self.request_tx.receiver_count() == 0 {
            info!("no picker attached, selecting by signal strength");
            return best_by_signal(candidates);
        }

        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);
        let _ = self.request_tx.send(PickerRequest {
            candidates: candidates.clone(),
        });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(device))) => {
                info!("picker selected {}", device.id);
                Ok(device)
            }
            Ok(Ok(Err(e))) => {
                self.pending.lock().take();
                Err(e)
            }
            // Picker dropped its end or never answered.
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().take();
                warn!("picker did not answer, selecting by signal strength");
                best_by_signal(candidates)
            }
        }
    }
}

impl Default for DevicePicker {
    fn default() -> Self {
        Self::new()
    }
}

/// The candidate with the strongest signal; unknown RSSI sorts last.
fn best_by_signal(candidates: Vec<DeviceHandle>) -> Result<DeviceHandle> {
    candidates
        .into_iter()
        .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
        .ok_or_else(|| Error::DeviceNotFound {
            identifier: "no candidates from scan".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn device(id: &str, rssi: Option<i16>) -> DeviceHandle {
        DeviceHandle {
            id: id.to_string(),
            name: Some(format!("PMScan {id}")),
            rssi,
        }
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let picker = DevicePicker::new();
        let result = picker.select(Vec::new()).await;
        assert!(matches!(result, Err(Error::DeviceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_single_candidate_skips_picker() {
        let picker = DevicePicker::new();
        let selected = picker
            .select(vec![device("only", Some(-40))])
            .await
            .expect("selection succeeds");
        assert_eq!(selected.id, "only");
    }

    #[tokio::test]
    async fn test_no_subscriber_falls_back_to_signal() {
        let picker = DevicePicker::new();
        let selected = picker
            .select(vec![
                device("weak", Some(-80)),
                device("strong", Some(-42)),
                device("unknown", None),
            ])
            .await
            .expect("selection succeeds");
        assert_eq!(selected.id, "strong");
    }

    #[tokio::test]
    async fn test_resolution_path() {
        let picker = Arc::new(DevicePicker::new());
        let mut requests = picker.subscribe();

        let ui = {
            let picker = picker.clone();
            tokio::spawn(async move {
                let request = requests.recv().await.expect("request arrives");
                assert_eq!(request.candidates.len(), 2);
                picker.resolve_selection(request.candidates[1].clone());
            })
        };

        let selected = picker
            .select(vec![device("a", Some(-50)), device("b", Some(-70))])
            .await
            .expect("selection succeeds");
        assert_eq!(selected.id, "b");
        ui.await.expect("ui task completes");
    }

    #[tokio::test]
    async fn test_rejection_propagates() {
        let picker = Arc::new(DevicePicker::new());
        let mut requests = picker.subscribe();

        let ui = {
            let picker = picker.clone();
            tokio::spawn(async move {
                let _ = requests.recv().await;
                picker.reject_selection("dismissed");
            })
        };

        let result = picker
            .select(vec![device("a", Some(-50)), device("b", Some(-70))])
            .await;
        match result {
            Err(Error::PickerRejected { reason }) => assert_eq!(reason, "dismissed"),
            other => panic!("expected rejection, got ok={}", other.is_ok()),
        }
        ui.await.expect("ui task completes");
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_signal() {
        let picker = DevicePicker::with_timeout(Duration::from_millis(30));
        // Keep a subscriber attached that never answers.
        let _requests = picker.subscribe();

        let selected = picker
            .select(vec![device("far", Some(-90)), device("near", Some(-35))])
            .await
            .expect("selection succeeds");
        assert_eq!(selected.id, "near");
    }

    #[tokio::test]
    async fn test_resolve_without_pending_is_noop() {
        let picker = DevicePicker::new();
        assert!(!picker.resolve_selection(device("a", None)));
        assert!(!picker.reject_selection("nothing pending"));
    }
}
