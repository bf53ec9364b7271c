//! Discovery session lifecycle.
//!
//! The client protocol treats discovery as one-shot while the platform
//! scans until told to stop, so every session carries a deadline after
//! which it is cancelled automatically. The controller never spawns its
//! own timer; the owning event loop sleeps until [`deadline`] and calls
//! [`on_timeout`], which keeps the whole lifecycle deterministic under
//! test.
//!
//! [`deadline`]: DiscoveryController::deadline
//! [`on_timeout`]: DiscoveryController::on_timeout

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::models::DeviceInfo;
use crate::error::BridgeError;
use crate::infrastructure::adapter::{AdapterFacade, DiscoveryFilter};

/// What happened to the session, in delivery order.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Started,
    Stopped,
    DeviceFound(DeviceInfo),
}

pub struct DiscoveryController {
    timeout: Duration,
    active: bool,
    deadline: Option<Instant>,
}

impl DiscoveryController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: false,
            deadline: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// When the current session must be auto-cancelled, if one is active.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start or refresh a session. A start while one is already active
    /// does not create a second platform session; it pushes the deadline
    /// out and replays every currently known device so the caller catches
    /// up with what the scan has already seen.
    pub async fn start(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        filter: DiscoveryFilter,
    ) -> Result<Vec<DiscoveryEvent>, BridgeError> {
        if !self.active {
            adapter.start_discovery(filter).await?;
            self.active = true;
            info!(timeout_secs = self.timeout.as_secs(), "discovery session started");
        } else {
            info!("discovery already active; refreshing deadline and replaying devices");
        }
        self.deadline = Some(Instant::now() + self.timeout);

        let mut events = vec![DiscoveryEvent::Started];
        events.extend(adapter.devices().into_iter().map(DiscoveryEvent::DeviceFound));
        Ok(events)
    }

    /// Stop the session. Stopping when nothing is active is a no-op.
    pub async fn cancel(
        &mut self,
        adapter: &mut dyn AdapterFacade,
    ) -> Result<Vec<DiscoveryEvent>, BridgeError> {
        if !self.active {
            return Ok(Vec::new());
        }
        self.active = false;
        self.deadline = None;
        adapter.stop_discovery().await?;
        info!("discovery session stopped");
        Ok(vec![DiscoveryEvent::Stopped])
    }

    /// Deadline expiry routes through the same stop path as an explicit
    /// cancel. Platform failures during the stop are logged, not raised;
    /// the session is considered over either way.
    pub async fn on_timeout(&mut self, adapter: &mut dyn AdapterFacade) -> Vec<DiscoveryEvent> {
        match self.cancel(adapter).await {
            Ok(events) => events,
            Err(error) => {
                warn!(%error, "failed to stop discovery at timeout");
                vec![DiscoveryEvent::Stopped]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockAdapter;
    use tokio::sync::mpsc;

    fn mock_with_device() -> MockAdapter {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut adapter = MockAdapter::new(tx);
        adapter.add_device(DeviceInfo::new("AA:BB:CC:DD:EE:FF".parse().unwrap()));
        adapter
    }

    #[tokio::test]
    async fn second_start_reuses_the_session_and_replays_devices() {
        let mut adapter = mock_with_device();
        let mut controller = DiscoveryController::new(Duration::from_secs(120));

        controller
            .start(&mut adapter, DiscoveryFilter::default())
            .await
            .unwrap();
        let events = controller
            .start(&mut adapter, DiscoveryFilter::default())
            .await
            .unwrap();

        let starts = adapter
            .calls()
            .iter()
            .filter(|c| c.as_str() == "start_discovery")
            .count();
        assert_eq!(starts, 1);
        assert!(matches!(events[0], DiscoveryEvent::Started));
        assert!(events
            .iter()
            .any(|e| matches!(e, DiscoveryEvent::DeviceFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn refreshing_pushes_the_deadline_out() {
        let mut adapter = mock_with_device();
        let mut controller = DiscoveryController::new(Duration::from_secs(120));

        controller
            .start(&mut adapter, DiscoveryFilter::default())
            .await
            .unwrap();
        let first = controller.deadline().unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        controller
            .start(&mut adapter, DiscoveryFilter::default())
            .await
            .unwrap();
        assert!(controller.deadline().unwrap() > first);
    }

    #[tokio::test]
    async fn cancel_without_a_session_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut adapter = MockAdapter::new(tx);
        let mut controller = DiscoveryController::new(Duration::from_secs(120));

        let events = controller.cancel(&mut adapter).await.unwrap();
        assert!(events.is_empty());
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn timeout_routes_through_the_stop_path() {
        let mut adapter = mock_with_device();
        let mut controller = DiscoveryController::new(Duration::from_secs(120));

        controller
            .start(&mut adapter, DiscoveryFilter::default())
            .await
            .unwrap();
        let events = controller.on_timeout(&mut adapter).await;

        assert!(matches!(events[0], DiscoveryEvent::Stopped));
        assert!(!controller.is_active());
        assert!(controller.deadline().is_none());
        assert!(!adapter.is_discovering());
    }
}
