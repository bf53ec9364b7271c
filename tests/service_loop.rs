//! End-to-end exercises of the bridge event loop over in-process channels.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use blebridge::chooser::{
    AdapterPresence, ChooserDevice, ChooserOptions, ChooserOutcome, ChooserPresentation,
    ChooserResponse, DiscoveryPresentationState, PermissionVerdict,
};
use blebridge::domain::filter::{ScanFilter, ScanFilterSequence};
use blebridge::domain::models::{
    AttributeId, AttributePermissions, CharacteristicProperties, DeviceAddress, DeviceInfo,
    RemoteCharacteristic, RemoteService,
};
use blebridge::domain::settings::Settings;
use blebridge::infrastructure::adapter::AdapterEvent;
use blebridge::infrastructure::mock::MockAdapter;
use blebridge::protocol::{
    AttributePath, ClientChannel, ClientEvent, ClientMessage, GattStatus, RequestOp,
    ResponsePayload, ServerMessage, ServerRequestOp, PROTOCOL_VERSION,
};
use blebridge::service::{BridgeService, ServiceHandle};

const ADDR: &str = "AA:BB:CC:DD:EE:FF";

struct Harness {
    client_tx: mpsc::UnboundedSender<ClientMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    adapter_tx: mpsc::UnboundedSender<AdapterEvent>,
    handle: ServiceHandle,
    service_task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(prime: impl FnOnce(&mut MockAdapter)) -> Self {
        let (adapter_tx, mut adapter_rx) = mpsc::unbounded_channel();
        let mut adapter = MockAdapter::new(adapter_tx.clone());
        prime(&mut adapter);
        // Priming emits adapter events a live stack would have delivered
        // long before the client attached; they are not part of any test.
        while adapter_rx.try_recv().is_ok() {}

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let client = ClientChannel::new(server_tx, PROTOCOL_VERSION);

        let settings = Settings::default();
        let (service, handle, command_rx) = BridgeService::new(Box::new(adapter), client, &settings);
        let service_task = tokio::spawn(service.run(client_rx, adapter_rx, command_rx));

        Harness {
            client_tx,
            server_rx,
            adapter_tx,
            handle,
            service_task,
        }
    }

    fn request(&self, id: u64, op: RequestOp) {
        self.client_tx
            .send(ClientMessage::Request { id, op })
            .expect("service alive");
    }

    async fn next_message(&mut self) -> ServerMessage {
        timeout(Duration::from_secs(5), self.server_rx.recv())
            .await
            .expect("no message within timeout")
            .expect("server channel closed")
    }

    /// Skip events until the response for `id` arrives.
    async fn response(&mut self, id: u64) -> ResponsePayload {
        loop {
            if let ServerMessage::Response { id: got, payload } = self.next_message().await {
                assert_eq!(got, id);
                return payload;
            }
        }
    }
}

fn device() -> DeviceInfo {
    let mut device = DeviceInfo::new(ADDR.parse::<DeviceAddress>().unwrap());
    device.name = Some("Widget".to_string());
    device
}

fn svc_uuid() -> Uuid {
    Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap()
}

fn chr_uuid() -> Uuid {
    Uuid::parse_str("00002a19-0000-1000-8000-00805f9b34fb").unwrap()
}

#[tokio::test]
async fn discovery_round_trip_delivers_state_and_devices() {
    let mut h = Harness::start(|adapter| adapter.add_device(device()));

    h.request(1, RequestOp::StartDiscovery);

    let mut saw_discovering = false;
    let mut saw_device = false;
    loop {
        match h.next_message().await {
            ServerMessage::Event(ClientEvent::DiscoveryStateChanged { discovering }) => {
                saw_discovering = discovering;
            }
            ServerMessage::Event(ClientEvent::DeviceFound(summary))
            | ServerMessage::Event(ClientEvent::LeDeviceFound { device: summary }) => {
                assert_eq!(summary.address.as_str(), ADDR);
                saw_device = true;
            }
            ServerMessage::Response { id, payload } => {
                assert_eq!(id, 1);
                assert!(matches!(payload, ResponsePayload::Status(GattStatus::Success)));
                break;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(saw_discovering);
    assert!(saw_device);

    h.request(2, RequestOp::CancelDiscovery);
    loop {
        match h.next_message().await {
            ServerMessage::Event(ClientEvent::DiscoveryStateChanged { discovering }) => {
                assert!(!discovering);
            }
            ServerMessage::Response { id, .. } => {
                assert_eq!(id, 2);
                break;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn gatt_server_build_and_forwarded_read() {
    let mut h = Harness::start(|_| {});

    h.request(1, RequestOp::AddService {
        uuid: svc_uuid(),
        primary: true,
        num_handles: 3,
    });
    let ResponsePayload::Handle { status, handle: service_handle } = h.response(1).await else {
        panic!("wrong payload shape");
    };
    assert_eq!(status, GattStatus::Success);
    assert_eq!(service_handle, 1);

    h.request(2, RequestOp::AddCharacteristic {
        service_handle,
        uuid: chr_uuid(),
        properties: CharacteristicProperties::READ.bits(),
        permissions: AttributePermissions::READ.bits(),
    });
    let ResponsePayload::Handle { handle: char_handle, .. } = h.response(2).await else {
        panic!("wrong payload shape");
    };
    assert_eq!(char_handle, 2);

    // A remote device reads the characteristic we just published. The
    // platform identifier is the mock's second minted local attribute.
    let (responder, platform_rx) = oneshot::channel();
    h.adapter_tx
        .send(AdapterEvent::LocalReadRequest {
            address: ADDR.parse().unwrap(),
            attribute: blebridge::domain::models::AttributeId("local/chr0002".to_string()),
            offset: 0,
            is_long: false,
            responder,
        })
        .unwrap();

    let ServerMessage::ServerRequest { id, op } = h.next_message().await else {
        panic!("expected a forwarded server request");
    };
    let ServerRequestOp::ReadLocalAttribute { handle, offset, .. } = op else {
        panic!("expected a read");
    };
    assert_eq!(handle, char_handle);
    assert_eq!(offset, 0);

    h.client_tx
        .send(ClientMessage::ServerResponse {
            id,
            status: GattStatus::Success,
            value: vec![0x2a],
        })
        .unwrap();

    let answered = timeout(Duration::from_secs(5), platform_rx)
        .await
        .expect("platform answer timed out")
        .expect("responder dropped");
    assert_eq!(answered, Ok(vec![0x2a]));
}

#[tokio::test]
async fn response_for_unknown_server_request_tears_the_connection_down() {
    let h = Harness::start(|_| {});

    h.client_tx
        .send(ClientMessage::ServerResponse {
            id: 999,
            status: GattStatus::Success,
            value: Vec::new(),
        })
        .unwrap();

    timeout(Duration::from_secs(5), h.service_task)
        .await
        .expect("service did not terminate")
        .expect("service task panicked");
}

#[derive(Clone, Default)]
struct NullPresentation;

impl ChooserPresentation for NullPresentation {
    fn show_discovery_state(&mut self, _state: DiscoveryPresentationState) {}
    fn add_or_update_device(&mut self, _device: ChooserDevice) {}
    fn set_adapter_presence(&mut self, _presence: AdapterPresence) {}
}

#[tokio::test]
async fn chooser_selection_resolves_through_the_service() {
    let h = Harness::start(|adapter| adapter.add_device(device()));

    let options = ChooserOptions {
        filters: ScanFilterSequence(vec![ScanFilter {
            name_prefix: Some("Wid".to_string()),
            ..Default::default()
        }]),
        accept_all_devices: false,
        permission: PermissionVerdict::Granted,
    };
    let choose = h.handle.choose_device(options, Box::new(NullPresentation));
    h.handle
        .chooser_response(ChooserResponse::Selected(ADDR.parse().unwrap()));

    let outcome = timeout(Duration::from_secs(5), choose)
        .await
        .expect("chooser timed out")
        .expect("chooser failed");
    assert_eq!(outcome, ChooserOutcome::Selected(ADDR.parse().unwrap()));
}

#[tokio::test]
async fn second_read_of_an_in_flight_characteristic_reports_busy() {
    let mut held = None;
    let mut h = Harness::start(|adapter| {
        adapter.add_device(device());
        let service_id = AttributeId("dev/svc0001".to_string());
        adapter.add_remote_service(
            &ADDR.parse().unwrap(),
            RemoteService {
                id: service_id.clone(),
                uuid: svc_uuid(),
                primary: true,
            },
        );
        let characteristic_id = AttributeId("dev/chr0001".to_string());
        adapter.add_remote_characteristic(
            &service_id,
            RemoteCharacteristic {
                id: characteristic_id.clone(),
                uuid: chr_uuid(),
                properties: CharacteristicProperties::READ,
                permissions: AttributePermissions::READ,
            },
        );
        adapter.set_value(&characteristic_id, vec![0x2a]);
        held = Some(adapter.hold_remote_ops());
    });
    let mut held = held.expect("primed");

    let path = || AttributePath {
        service: svc_uuid(),
        characteristic: chr_uuid(),
        descriptor: None,
    };
    h.request(1, RequestOp::ReadGattCharacteristic {
        address: ADDR.parse().unwrap(),
        path: path(),
    });
    h.request(2, RequestOp::ReadGattCharacteristic {
        address: ADDR.parse().unwrap(),
        path: path(),
    });

    // The first transfer is still in flight, so the second is refused
    // without touching the platform again.
    let ResponsePayload::Value { status, .. } = h.response(2).await else {
        panic!("wrong payload shape");
    };
    assert_eq!(status, GattStatus::Busy);

    assert_eq!(held.release_all(), 1);
    let ResponsePayload::Value { status, value } = h.response(1).await else {
        panic!("wrong payload shape");
    };
    assert_eq!(status, GattStatus::Success);
    assert_eq!(value, vec![0x2a]);
}

#[tokio::test]
async fn le_scan_without_filters_clears_the_previous_ones() {
    let mut h = Harness::start(|adapter| adapter.add_device(device()));

    let filters = ScanFilterSequence(vec![ScanFilter {
        name: Some("Other".to_string()),
        ..Default::default()
    }]);
    h.request(1, RequestOp::StartLeScan { filters });
    loop {
        match h.next_message().await {
            ServerMessage::Event(ClientEvent::DeviceFound(_))
            | ServerMessage::Event(ClientEvent::LeDeviceFound { .. }) => {
                panic!("device leaked through a non-matching filter");
            }
            ServerMessage::Response { id, payload } => {
                assert_eq!(id, 1);
                assert!(matches!(payload, ResponsePayload::Status(GattStatus::Success)));
                break;
            }
            _ => {}
        }
    }

    // Restarting without filters widens the scan back out; the known
    // device is replayed instead of staying hidden behind stale filters.
    h.request(2, RequestOp::StartLeScan {
        filters: ScanFilterSequence(vec![]),
    });
    let mut saw_device = false;
    loop {
        match h.next_message().await {
            ServerMessage::Event(ClientEvent::LeDeviceFound { device }) => {
                assert_eq!(device.address.as_str(), ADDR);
                saw_device = true;
            }
            ServerMessage::Response { id, .. } => {
                assert_eq!(id, 2);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_device);
}

#[tokio::test]
async fn chooser_rejects_hostile_options() {
    let h = Harness::start(|_| {});

    let options = ChooserOptions {
        filters: ScanFilterSequence(vec![ScanFilter {
            name: Some("x".to_string()),
            ..Default::default()
        }]),
        accept_all_devices: true,
        permission: PermissionVerdict::Granted,
    };
    let error = h
        .handle
        .choose_device(options, Box::new(NullPresentation))
        .await
        .unwrap_err();
    assert!(error.is_fatal());
}
