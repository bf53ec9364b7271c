//! Client protocol surface.
//!
//! The transport itself is out of scope; messages travel over an in-process
//! channel pair and are plain data. The client declares a protocol version
//! at attach time, and events from newer message families are silently not
//! delivered to older clients.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::filter::ScanFilterSequence;
use crate::domain::models::{AdvertisementData, DeviceAddress, DeviceInfo, SdpRecord};
use crate::error::{AdapterError, BridgeError};

/// Newest protocol version this daemon speaks.
pub const PROTOCOL_VERSION: u32 = 5;

/// Minimum client version required per message family.
pub mod min_version {
    /// Base BLE surface: discovery, LE connect, GATT client ops.
    pub const BTLE: u32 = 1;
    /// Characteristic notification events.
    pub const GATT_NOTIFY: u32 = 2;
    /// Server-hosted GATT services and forwarded attribute requests.
    pub const GATT_SERVER: u32 = 3;
    /// Adapter address/property change events.
    pub const ADDRESS_CHANGE: u32 = 4;
    /// SDP record access.
    pub const SDP: u32 = 5;
}

/// Status reported on every GATT-family response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    Failure,
    NotFound,
    NotPermitted,
    Busy,
    InvalidOffset,
    ResourceExhausted,
}

impl From<&BridgeError> for GattStatus {
    fn from(error: &BridgeError) -> Self {
        match error {
            BridgeError::NotFound(_) => GattStatus::NotFound,
            BridgeError::PermissionDenied(_) => GattStatus::NotPermitted,
            BridgeError::Busy => GattStatus::Busy,
            BridgeError::InvalidOffset(_) => GattStatus::InvalidOffset,
            BridgeError::Exhausted(_) => GattStatus::ResourceExhausted,
            BridgeError::Platform(AdapterError::InProgress | AdapterError::Busy) => {
                GattStatus::Busy
            }
            BridgeError::Platform(AdapterError::DoesNotExist) => GattStatus::NotFound,
            BridgeError::Platform(AdapterError::NotPermitted) => GattStatus::NotPermitted,
            BridgeError::Platform(_) | BridgeError::ProtocolViolation(_) => GattStatus::Failure,
        }
    }
}

impl<T> From<&Result<T, BridgeError>> for GattStatus {
    fn from(result: &Result<T, BridgeError>) -> Self {
        match result {
            Ok(_) => GattStatus::Success,
            Err(error) => error.into(),
        }
    }
}

/// Wire address of a remote GATT attribute: UUID path from the service
/// down. Duplicate UUIDs under one parent resolve to the first match in
/// platform enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePath {
    pub service: Uuid,
    pub characteristic: Uuid,
    #[serde(default)]
    pub descriptor: Option<Uuid>,
}

/// One element of the flattened remote GATT database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattDbElement {
    pub kind: GattDbElementKind,
    pub uuid: Uuid,
    pub instance_id: u16,
    pub properties: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattDbElementKind {
    PrimaryService,
    SecondaryService,
    Characteristic,
    Descriptor,
}

/// Device snapshot as sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub transport: u8,
    pub paired: bool,
    pub connected: bool,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
}

impl From<&DeviceInfo> for DeviceSummary {
    fn from(device: &DeviceInfo) -> Self {
        DeviceSummary {
            address: device.address.clone(),
            name: device.name.clone(),
            transport: device.transport.bits(),
            paired: device.paired,
            connected: device.connected,
            rssi: device.inquiry_rssi,
            service_uuids: device.service_uuids.clone(),
        }
    }
}

/// Requests a client may issue. Every request is answered exactly once
/// with a [`Response`] carrying the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestOp {
    EnableAdapter,
    DisableAdapter,
    GetAdapterProperties,
    SetAdapterName { name: String },
    /// `timeout_secs` of 0 means "until turned off".
    SetDiscoverable { discoverable: bool, timeout_secs: u32 },
    StartDiscovery,
    CancelDiscovery,
    StartLeScan { filters: ScanFilterSequence },
    StopLeScan,
    CreateBond { address: DeviceAddress, transport: u8 },
    RemoveBond { address: DeviceAddress },
    CancelBond { address: DeviceAddress },
    ConnectLeDevice { address: DeviceAddress },
    DisconnectLeDevice { address: DeviceAddress },
    SearchService { address: DeviceAddress },
    GetGattDb { address: DeviceAddress },
    ReadGattCharacteristic { address: DeviceAddress, path: AttributePath },
    WriteGattCharacteristic { address: DeviceAddress, path: AttributePath, value: Vec<u8>, offset: i32 },
    ReadGattDescriptor { address: DeviceAddress, path: AttributePath },
    WriteGattDescriptor { address: DeviceAddress, path: AttributePath, value: Vec<u8>, offset: i32 },
    RegisterForGattNotification { address: DeviceAddress, path: AttributePath },
    DeregisterForGattNotification { address: DeviceAddress, path: AttributePath },
    AddService { uuid: Uuid, primary: bool, num_handles: u16 },
    AddCharacteristic { service_handle: u16, uuid: Uuid, properties: u32, permissions: u32 },
    AddDescriptor { service_handle: u16, uuid: Uuid, permissions: u32 },
    StartService { service_handle: u16 },
    StopService { service_handle: u16 },
    DeleteService { service_handle: u16 },
    ReserveAdvertisement,
    BroadcastAdvertisement { slot: u16, data: AdvertisementData },
    ReleaseAdvertisement { slot: u16 },
    GetSdpRecords { address: DeviceAddress, uuid: Option<Uuid> },
    CreateSdpRecord { record: SdpRecord },
    RemoveSdpRecord { handle: u32 },
}

/// Everything a client sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Request { id: u64, op: RequestOp },
    /// Answer to a forwarded local-attribute request.
    ServerResponse { id: u64, status: GattStatus, value: Vec<u8> },
}

/// Response payloads, one variant per response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Status(GattStatus),
    Value { status: GattStatus, value: Vec<u8> },
    Handle { status: GattStatus, handle: u16 },
    AdapterProperties(AdapterProperties),
    GattDb { status: GattStatus, elements: Vec<GattDbElement> },
    SdpRecords { status: GattStatus, records: Vec<SdpRecord> },
    SdpHandle { status: GattStatus, handle: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterProperties {
    pub present: bool,
    pub powered: bool,
    pub discoverable: bool,
    pub address: DeviceAddress,
    pub name: String,
}

/// Forwarded platform requests that need a client answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerRequestOp {
    ReadLocalAttribute { address: DeviceAddress, handle: u16, offset: u32, is_long: bool },
    WriteLocalAttribute { address: DeviceAddress, handle: u16, offset: u32, value: Vec<u8> },
}

/// Unsolicited events pushed to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientEvent {
    AdapterProperties(AdapterProperties),
    DiscoveryStateChanged { discovering: bool },
    DeviceFound(DeviceSummary),
    LeDeviceFound { device: DeviceSummary },
    LeConnectionStateChange { address: DeviceAddress, connected: bool },
    BondStateChanged { address: DeviceAddress, bonded: bool, status: GattStatus },
    SearchComplete { address: DeviceAddress, status: GattStatus, uuids: Vec<Uuid> },
    GattNotify { address: DeviceAddress, service_uuid: Uuid, characteristic_uuid: Uuid, value: Vec<u8> },
}

impl ClientEvent {
    /// Minimum client protocol version that receives this event.
    pub fn min_version(&self) -> u32 {
        match self {
            ClientEvent::AdapterProperties(_) => min_version::ADDRESS_CHANGE,
            ClientEvent::GattNotify { .. } => min_version::GATT_NOTIFY,
            _ => min_version::BTLE,
        }
    }
}

/// Everything the daemon sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Response { id: u64, payload: ResponsePayload },
    Event(ClientEvent),
    ServerRequest { id: u64, op: ServerRequestOp },
}

/// Outbound half of one attached client, with its declared version.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    sender: mpsc::UnboundedSender<ServerMessage>,
    version: u32,
}

impl ClientChannel {
    pub fn new(sender: mpsc::UnboundedSender<ServerMessage>, version: u32) -> Self {
        Self { sender, version }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn send_response(&self, id: u64, payload: ResponsePayload) {
        let _ = self.sender.send(ServerMessage::Response { id, payload });
    }

    /// Deliver an event if the client's version is new enough. Returns
    /// whether the event was sent.
    pub fn send_event(&self, event: ClientEvent) -> bool {
        if self.version < event.min_version() {
            debug!(
                client_version = self.version,
                required = event.min_version(),
                "dropping event for an older client"
            );
            return false;
        }
        self.sender.send(ServerMessage::Event(event)).is_ok()
    }

    /// Forward a local-attribute request; requires GATT server support.
    pub fn send_server_request(&self, id: u64, op: ServerRequestOp) -> bool {
        if self.version < min_version::GATT_SERVER {
            return false;
        }
        self.sender.send(ServerMessage::ServerRequest { id, op }).is_ok()
    }
}
