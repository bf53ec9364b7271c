//! Modal device chooser.
//!
//! Drives one "pick a device" interaction: validates the requesting
//! client's options, streams matching devices to a presentation layer,
//! survives adapter power flaps, and resolves to exactly one outcome.
//! The chooser owns its own scan session; its deadline is surfaced to the
//! event loop the same way the protocol-level discovery session is.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blocklist::Blocklist;
use crate::discovery::{DiscoveryController, DiscoveryEvent};
use crate::domain::filter::ScanFilterSequence;
use crate::domain::models::{DeviceAddress, DeviceInfo};
use crate::error::BridgeError;
use crate::infrastructure::adapter::{AdapterFacade, DiscoveryFilter};

/// How many signal strength buckets the presentation layer gets.
const SIGNAL_LEVELS: i32 = 5;

/// Permission verdict for the requesting context, computed by the
/// embedder: origin relationships and policy state never reach this
/// process, only their conclusion does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionVerdict {
    #[default]
    Granted,
    /// The requesting frame is embedded by another origin that has not
    /// delegated the permission to it.
    BlockedByEmbedding,
    /// Bluetooth access is disabled by policy, globally or for this
    /// requester.
    BlockedByPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChooserOptions {
    pub filters: ScanFilterSequence,
    pub accept_all_devices: bool,
    pub permission: PermissionVerdict,
}

impl ChooserOptions {
    /// Reject option combinations a conforming client can never produce,
    /// a blocked permission verdict, and filters naming a blocklisted
    /// service. Violations of the first kind are fatal; the policy and
    /// blocklist rejections are ordinary denials.
    pub fn validate(&self, blocklist: &Blocklist) -> Result<(), BridgeError> {
        if self.accept_all_devices && !self.filters.is_empty() {
            return Err(BridgeError::ProtocolViolation(
                "accept-all combined with a filter list".to_string(),
            ));
        }
        if !self.accept_all_devices && self.filters.is_empty() {
            return Err(BridgeError::ProtocolViolation(
                "no filters and not accept-all".to_string(),
            ));
        }
        if self.filters.has_empty_or_invalid_filter() {
            return Err(BridgeError::ProtocolViolation(
                "empty or oversized filter".to_string(),
            ));
        }
        match self.permission {
            PermissionVerdict::Granted => {}
            PermissionVerdict::BlockedByEmbedding => {
                return Err(BridgeError::PermissionDenied(
                    "permission not delegated to the embedded frame",
                ));
            }
            PermissionVerdict::BlockedByPolicy => {
                return Err(BridgeError::PermissionDenied("bluetooth disabled by policy"));
            }
        }
        for uuid in self.filters.all_service_uuids() {
            if blocklist.is_blocklisted(&uuid) {
                return Err(BridgeError::PermissionDenied("blocklisted service in filter"));
            }
        }
        Ok(())
    }
}

/// Device row pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChooserDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub gatt_connected: bool,
    pub paired: bool,
    pub signal_level: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterPresence {
    Absent,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPresentationState {
    FailedToStart,
    Discovering,
    Idle,
}

/// Narrow callback contract to whatever renders the chooser.
pub trait ChooserPresentation: Send {
    fn show_discovery_state(&mut self, state: DiscoveryPresentationState);
    fn add_or_update_device(&mut self, device: ChooserDevice);
    fn set_adapter_presence(&mut self, presence: AdapterPresence);
}

/// What the presentation layer reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChooserResponse {
    Selected(DeviceAddress),
    Cancelled,
    DeniedPermission,
    Rescan,
    ShowHelp,
}

/// Terminal result of the interaction, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChooserOutcome {
    Selected(DeviceAddress),
    Cancelled,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PopulatingKnownDevices,
    AwaitingAdapterPower,
    Discovering,
    Closed,
}

pub struct DeviceChooser {
    options: ChooserOptions,
    state: State,
    discovery: DiscoveryController,
    presentation: Box<dyn ChooserPresentation>,
    outcome: Option<oneshot::Sender<ChooserOutcome>>,
    rssi_floor: i16,
    rssi_ceiling: i16,
}

impl DeviceChooser {
    /// Options must already have passed [`ChooserOptions::validate`].
    pub fn new(
        options: ChooserOptions,
        scan_duration: Duration,
        presentation: Box<dyn ChooserPresentation>,
        outcome: oneshot::Sender<ChooserOutcome>,
        rssi_floor: i16,
        rssi_ceiling: i16,
    ) -> Self {
        Self {
            options,
            state: State::PopulatingKnownDevices,
            discovery: DiscoveryController::new(scan_duration),
            presentation,
            outcome: Some(outcome),
            rssi_floor,
            rssi_ceiling,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.discovery.deadline()
    }

    /// Populate the list from already-known devices, then start scanning
    /// (or park until the adapter is powered).
    pub async fn start(&mut self, adapter: &mut dyn AdapterFacade) {
        if !adapter.is_present() {
            self.presentation.set_adapter_presence(AdapterPresence::Absent);
            return;
        }
        if !adapter.is_powered() {
            info!("chooser waiting for adapter power");
            self.presentation.set_adapter_presence(AdapterPresence::PoweredOff);
            self.state = State::AwaitingAdapterPower;
            return;
        }
        self.presentation.set_adapter_presence(AdapterPresence::PoweredOn);
        self.populate_known_devices(adapter);
        self.start_discovery(adapter).await;
    }

    fn populate_known_devices(&mut self, adapter: &dyn AdapterFacade) {
        self.state = State::PopulatingKnownDevices;
        for device in adapter.devices() {
            self.consider_device(&device, false);
        }
    }

    async fn start_discovery(&mut self, adapter: &mut dyn AdapterFacade) {
        let filter = DiscoveryFilter {
            transport: None,
            service_uuids: self.options.filters.all_service_uuids(),
            rssi_threshold: None,
        };
        match self.discovery.start(adapter, filter).await {
            Ok(events) => {
                self.state = State::Discovering;
                self.presentation
                    .show_discovery_state(DiscoveryPresentationState::Discovering);
                for event in events {
                    if let DiscoveryEvent::DeviceFound(device) = event {
                        self.consider_device(&device, false);
                    }
                }
            }
            Err(error) => {
                warn!(%error, "chooser failed to start discovery");
                self.presentation
                    .show_discovery_state(DiscoveryPresentationState::FailedToStart);
            }
        }
    }

    /// Adapter power flap. Power returning while parked re-populates and
    /// restarts the scan without the caller doing anything.
    pub async fn on_adapter_power_changed(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        powered: bool,
    ) {
        if self.state == State::Closed {
            return;
        }
        if !powered {
            self.presentation.set_adapter_presence(AdapterPresence::PoweredOff);
            self.state = State::AwaitingAdapterPower;
            return;
        }
        if self.state == State::AwaitingAdapterPower {
            self.presentation.set_adapter_presence(AdapterPresence::PoweredOn);
            self.populate_known_devices(adapter);
            self.start_discovery(adapter).await;
        }
    }

    /// A device appeared or changed. `gatt_connected` is whether the
    /// bridge holds a live GATT connection to it; such devices stay
    /// visible even when they stop matching an active scan.
    pub fn on_device_updated(&mut self, device: &DeviceInfo, gatt_connected: bool) {
        if matches!(self.state, State::Closed | State::AwaitingAdapterPower) {
            return;
        }
        self.consider_device(device, gatt_connected);
    }

    fn consider_device(&mut self, device: &DeviceInfo, gatt_connected: bool) {
        let matches = self.options.accept_all_devices || self.options.filters.matches(device);
        if !matches && !gatt_connected && !device.connected {
            return;
        }
        let signal_level = device
            .inquiry_rssi
            .map(|rssi| signal_strength_level(rssi, self.rssi_floor, self.rssi_ceiling));
        self.presentation.add_or_update_device(ChooserDevice {
            address: device.address.clone(),
            name: device.name.clone(),
            gatt_connected: gatt_connected || device.connected,
            paired: device.paired,
            signal_level,
        });
    }

    /// Scan deadline expiry. The chooser stays open; the user can rescan.
    pub async fn on_timeout(&mut self, adapter: &mut dyn AdapterFacade) {
        if self.state != State::Discovering {
            return;
        }
        self.discovery.on_timeout(adapter).await;
        self.state = State::PopulatingKnownDevices;
        self.presentation
            .show_discovery_state(DiscoveryPresentationState::Idle);
    }

    /// Inbound presentation event. Selection, cancellation and denial all
    /// close the chooser; rescan restarts the scan in place.
    pub async fn on_response(&mut self, adapter: &mut dyn AdapterFacade, response: ChooserResponse) {
        if self.state == State::Closed {
            // A timer-driven close and a user action can race; the loser
            // finds the chooser already closed and backs off.
            debug!("chooser response after close ignored");
            return;
        }
        match response {
            ChooserResponse::Selected(address) => {
                self.close(adapter, ChooserOutcome::Selected(address)).await;
            }
            ChooserResponse::Cancelled => {
                self.close(adapter, ChooserOutcome::Cancelled).await;
            }
            ChooserResponse::DeniedPermission => {
                self.close(adapter, ChooserOutcome::PermissionDenied).await;
            }
            ChooserResponse::Rescan => {
                self.populate_known_devices(adapter);
                self.start_discovery(adapter).await;
            }
            ChooserResponse::ShowHelp => {
                info!("chooser help requested");
                self.close(adapter, ChooserOutcome::Cancelled).await;
            }
        }
    }

    async fn close(&mut self, adapter: &mut dyn AdapterFacade, outcome: ChooserOutcome) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        if let Err(error) = self.discovery.cancel(adapter).await {
            warn!(%error, "failed to stop chooser scan on close");
        }
        self.presentation
            .show_discovery_state(DiscoveryPresentationState::Idle);
        if let Some(sender) = self.outcome.take() {
            let _ = sender.send(outcome);
        }
    }
}

impl Drop for DeviceChooser {
    /// A chooser dropped with a selection still pending must complete its
    /// awaiter; it synthesizes a cancellation.
    fn drop(&mut self) {
        if let Some(sender) = self.outcome.take() {
            let _ = sender.send(ChooserOutcome::Cancelled);
        }
    }
}

/// Bucket a raw RSSI into `[0, SIGNAL_LEVELS)` by linear interpolation
/// between `floor` and `ceiling`, clamped at both ends. Presentation hint
/// only; never used for matching.
pub fn signal_strength_level(rssi: i16, floor: i16, ceiling: i16) -> u8 {
    if ceiling <= floor {
        return 0;
    }
    let clamped = rssi.clamp(floor, ceiling);
    let span = i32::from(ceiling) - i32::from(floor);
    let offset = i32::from(clamped) - i32::from(floor);
    let level = (offset * (SIGNAL_LEVELS - 1) + span / 2) / span;
    level as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filter::ScanFilter;
    use crate::infrastructure::mock::MockAdapter;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorded {
        devices: Vec<ChooserDevice>,
        states: Vec<DiscoveryPresentationState>,
        presence: Vec<AdapterPresence>,
    }

    #[derive(Clone, Default)]
    struct RecordingPresentation(Arc<Mutex<Recorded>>);

    impl ChooserPresentation for RecordingPresentation {
        fn show_discovery_state(&mut self, state: DiscoveryPresentationState) {
            self.0.lock().unwrap().states.push(state);
        }
        fn add_or_update_device(&mut self, device: ChooserDevice) {
            self.0.lock().unwrap().devices.push(device);
        }
        fn set_adapter_presence(&mut self, presence: AdapterPresence) {
            self.0.lock().unwrap().presence.push(presence);
        }
    }

    fn widget_filter() -> ScanFilterSequence {
        ScanFilterSequence(vec![ScanFilter {
            name_prefix: Some("Wid".to_string()),
            ..Default::default()
        }])
    }

    fn widget(address: &str, rssi: Option<i16>) -> DeviceInfo {
        let mut device = DeviceInfo::new(address.parse().unwrap());
        device.name = Some("Widget".to_string());
        device.inquiry_rssi = rssi;
        device
    }

    fn chooser(
        options: ChooserOptions,
    ) -> (DeviceChooser, RecordingPresentation, oneshot::Receiver<ChooserOutcome>) {
        let presentation = RecordingPresentation::default();
        let (tx, rx) = oneshot::channel();
        let chooser = DeviceChooser::new(
            options,
            Duration::from_secs(60),
            Box::new(presentation.clone()),
            tx,
            -100,
            -55,
        );
        (chooser, presentation, rx)
    }

    fn mock() -> MockAdapter {
        let (tx, _rx) = mpsc::unbounded_channel();
        MockAdapter::new(tx)
    }

    #[test]
    fn accept_all_with_filters_is_a_protocol_violation() {
        let options = ChooserOptions {
            filters: widget_filter(),
            accept_all_devices: true,
            permission: PermissionVerdict::Granted,
        };
        assert!(matches!(
            options.validate(&Blocklist::default()),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn no_filters_without_accept_all_is_a_protocol_violation() {
        let options = ChooserOptions {
            filters: ScanFilterSequence::default(),
            accept_all_devices: false,
            permission: PermissionVerdict::Granted,
        };
        assert!(matches!(
            options.validate(&Blocklist::default()),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn blocklisted_service_is_denied_not_fatal() {
        let hid = Uuid::parse_str("00001812-0000-1000-8000-00805f9b34fb").unwrap();
        let options = ChooserOptions {
            filters: ScanFilterSequence(vec![ScanFilter {
                services: vec![hid],
                ..Default::default()
            }]),
            accept_all_devices: false,
            permission: PermissionVerdict::Granted,
        };
        let error = options.validate(&Blocklist::default()).unwrap_err();
        assert!(matches!(error, BridgeError::PermissionDenied(_)));
        assert!(!error.is_fatal());
    }

    #[test]
    fn blocked_permission_verdicts_are_denied_not_fatal() {
        for verdict in [
            PermissionVerdict::BlockedByEmbedding,
            PermissionVerdict::BlockedByPolicy,
        ] {
            let options = ChooserOptions {
                filters: widget_filter(),
                accept_all_devices: false,
                permission: verdict,
            };
            let error = options.validate(&Blocklist::default()).unwrap_err();
            assert!(matches!(error, BridgeError::PermissionDenied(_)));
            assert!(!error.is_fatal());
        }
    }

    #[tokio::test]
    async fn matching_devices_reach_the_presentation() {
        let mut adapter = mock();
        adapter.add_device(widget("AA:BB:CC:DD:EE:FF", Some(-60)));
        let mut other = DeviceInfo::new("11:22:33:44:55:66".parse().unwrap());
        other.name = Some("Gadget".to_string());
        adapter.add_device(other);

        let (mut chooser, presentation, _rx) = chooser(ChooserOptions {
            filters: widget_filter(),
            accept_all_devices: false,
            permission: PermissionVerdict::Granted,
        });
        chooser.start(&mut adapter).await;

        let recorded = presentation.0.lock().unwrap();
        // Known-device population plus the discovery replay.
        assert!(!recorded.devices.is_empty());
        assert!(recorded.devices.iter().all(|d| d.name.as_deref() == Some("Widget")));
        assert_eq!(recorded.states.last(), Some(&DiscoveryPresentationState::Discovering));
    }

    #[tokio::test]
    async fn connected_devices_stay_visible_without_matching() {
        let mut adapter = mock();
        let (mut chooser, presentation, _rx) = chooser(ChooserOptions {
            filters: widget_filter(),
            accept_all_devices: false,
            permission: PermissionVerdict::Granted,
        });
        chooser.start(&mut adapter).await;

        let mut gadget = DeviceInfo::new("11:22:33:44:55:66".parse().unwrap());
        gadget.name = Some("Gadget".to_string());
        chooser.on_device_updated(&gadget, true);

        let recorded = presentation.0.lock().unwrap();
        assert_eq!(recorded.devices.len(), 1);
        assert!(recorded.devices[0].gatt_connected);
    }

    #[tokio::test]
    async fn powered_off_adapter_parks_and_power_return_restarts() {
        let mut adapter = mock();
        adapter.set_powered_state(false);
        adapter.add_device(widget("AA:BB:CC:DD:EE:FF", None));

        let (mut chooser, presentation, _rx) = chooser(ChooserOptions {
            filters: widget_filter(),
            accept_all_devices: false,
            permission: PermissionVerdict::Granted,
        });
        chooser.start(&mut adapter).await;
        assert!(adapter.calls().iter().all(|c| c != "start_discovery"));

        adapter.set_powered_state(true);
        chooser.on_adapter_power_changed(&mut adapter, true).await;

        let recorded = presentation.0.lock().unwrap();
        assert!(recorded.presence.contains(&AdapterPresence::PoweredOff));
        assert!(recorded.presence.contains(&AdapterPresence::PoweredOn));
        assert!(adapter.is_discovering());
        assert!(!recorded.devices.is_empty());
    }

    #[tokio::test]
    async fn selection_resolves_exactly_once_and_stops_the_scan() {
        let mut adapter = mock();
        adapter.add_device(widget("AA:BB:CC:DD:EE:FF", None));
        let (mut chooser, _presentation, mut rx) = chooser(ChooserOptions {
            filters: widget_filter(),
            accept_all_devices: false,
            permission: PermissionVerdict::Granted,
        });
        chooser.start(&mut adapter).await;
        chooser
            .on_response(
                &mut adapter,
                ChooserResponse::Selected("AA:BB:CC:DD:EE:FF".parse().unwrap()),
            )
            .await;
        assert!(chooser.is_closed());
        assert!(!adapter.is_discovering());
        assert!(matches!(rx.try_recv(), Ok(ChooserOutcome::Selected(_))));

        // Racing cancel after close is ignored.
        chooser.on_response(&mut adapter, ChooserResponse::Cancelled).await;
        drop(chooser);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_a_pending_chooser_synthesizes_one_cancellation() {
        let adapter = mock();
        let (chooser, _presentation, mut rx) = chooser(ChooserOptions {
            filters: widget_filter(),
            accept_all_devices: false,
            permission: PermissionVerdict::Granted,
        });
        drop(adapter);
        drop(chooser);
        assert!(matches!(rx.try_recv(), Ok(ChooserOutcome::Cancelled)));
    }

    #[test]
    fn signal_levels_interpolate_and_clamp() {
        assert_eq!(signal_strength_level(-120, -100, -55), 0);
        assert_eq!(signal_strength_level(-100, -100, -55), 0);
        assert_eq!(signal_strength_level(-55, -100, -55), 4);
        assert_eq!(signal_strength_level(-30, -100, -55), 4);
        let mid = signal_strength_level(-78, -100, -55);
        assert!(mid >= 1 && mid <= 3);
    }
}
