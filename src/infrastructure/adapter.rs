//! Platform adapter boundary.
//!
//! Everything above this module talks to the Bluetooth stack through
//! [`AdapterFacade`] and receives unsolicited platform activity as
//! [`AdapterEvent`]s on a channel. Higher layers hold devices and GATT
//! attributes by address and [`AttributeId`] only; platform objects never
//! cross this boundary.

use async_trait::async_trait;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::domain::models::{
    AdvertisementData, AdvertisementId, AttributeId, AttributePermissions,
    CharacteristicProperties, DeviceAddress, DeviceInfo, RemoteCharacteristic, RemoteDescriptor,
    RemoteService, SdpRecord, Transport,
};
use crate::error::AdapterError;

/// Filter passed to the platform when starting a discovery session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub transport: Option<Transport>,
    pub service_uuids: Vec<Uuid>,
    pub rssi_threshold: Option<i16>,
}

/// Answer channel for a remote read of a locally hosted attribute.
pub type LocalReadResponder = oneshot::Sender<Result<Vec<u8>, AdapterError>>;
/// Answer channel for a remote write of a locally hosted attribute.
pub type LocalWriteResponder = oneshot::Sender<Result<(), AdapterError>>;

/// Completion of a started remote value read.
pub type RemoteValueReceiver = oneshot::Receiver<Result<Vec<u8>, AdapterError>>;
/// Completion of a started remote value write.
pub type RemoteStatusReceiver = oneshot::Receiver<Result<(), AdapterError>>;

/// Unsolicited platform activity, pushed in the order the platform
/// reported it.
#[derive(Debug)]
pub enum AdapterEvent {
    AdapterPresentChanged(bool),
    AdapterPoweredChanged(bool),
    DeviceAdded(DeviceInfo),
    DeviceChanged(DeviceInfo),
    DeviceRemoved(DeviceAddress),
    DeviceConnectionChanged {
        address: DeviceAddress,
        connected: bool,
    },
    DevicePairedChanged {
        address: DeviceAddress,
        paired: bool,
    },
    GattServicesResolved {
        address: DeviceAddress,
    },
    CharacteristicValueChanged {
        address: DeviceAddress,
        characteristic: AttributeId,
        value: Vec<u8>,
    },
    /// A connected remote device is reading a locally hosted attribute.
    /// The platform waits on the responder; dropping it fails the read.
    LocalReadRequest {
        address: DeviceAddress,
        attribute: AttributeId,
        offset: u32,
        is_long: bool,
        responder: LocalReadResponder,
    },
    /// A connected remote device is writing a locally hosted attribute.
    LocalWriteRequest {
        address: DeviceAddress,
        attribute: AttributeId,
        offset: u32,
        value: Vec<u8>,
        responder: LocalWriteResponder,
    },
}

/// Capability surface over the platform Bluetooth adapter.
///
/// Every method is a direct translation of one platform operation. No
/// caching, no validation and no policy lives behind this trait; that is
/// the bridge's job. Implementations report failures only through
/// [`AdapterError`].
#[async_trait]
pub trait AdapterFacade: Send {
    fn is_present(&self) -> bool;
    fn is_powered(&self) -> bool;
    fn address(&self) -> DeviceAddress;
    fn name(&self) -> String;
    fn is_discoverable(&self) -> bool;

    async fn set_powered(&mut self, powered: bool) -> Result<(), AdapterError>;
    async fn set_name(&mut self, name: String) -> Result<(), AdapterError>;
    async fn set_discoverable(&mut self, on: bool, timeout_secs: u32) -> Result<(), AdapterError>;

    fn devices(&self) -> Vec<DeviceInfo>;
    fn device(&self, address: &DeviceAddress) -> Option<DeviceInfo>;

    async fn start_discovery(&mut self, filter: DiscoveryFilter) -> Result<(), AdapterError>;
    async fn stop_discovery(&mut self) -> Result<(), AdapterError>;

    async fn connect_device(&mut self, address: &DeviceAddress) -> Result<(), AdapterError>;
    async fn disconnect_device(&mut self, address: &DeviceAddress) -> Result<(), AdapterError>;

    async fn create_bond(
        &mut self,
        address: &DeviceAddress,
        transport: Transport,
    ) -> Result<(), AdapterError>;
    async fn remove_bond(&mut self, address: &DeviceAddress) -> Result<(), AdapterError>;
    async fn cancel_bond(&mut self, address: &DeviceAddress) -> Result<(), AdapterError>;

    /// SDP service search against a remote device; resolves to the
    /// service class UUIDs the device advertises.
    async fn search_services(&mut self, address: &DeviceAddress) -> Result<Vec<Uuid>, AdapterError>;

    fn gatt_services(&self, address: &DeviceAddress) -> Result<Vec<RemoteService>, AdapterError>;
    fn characteristics(
        &self,
        address: &DeviceAddress,
        service: &AttributeId,
    ) -> Result<Vec<RemoteCharacteristic>, AdapterError>;
    fn descriptors(
        &self,
        address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<Vec<RemoteDescriptor>, AdapterError>;

    // Remote value transfers can take a radio round trip; the methods
    // start the platform operation and the outcome arrives on the
    // returned receiver. An immediate `Err` means nothing was started.
    fn read_characteristic(
        &mut self,
        address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<RemoteValueReceiver, AdapterError>;
    fn write_characteristic(
        &mut self,
        address: &DeviceAddress,
        characteristic: &AttributeId,
        value: Vec<u8>,
    ) -> Result<RemoteStatusReceiver, AdapterError>;
    fn read_descriptor(
        &mut self,
        address: &DeviceAddress,
        descriptor: &AttributeId,
    ) -> Result<RemoteValueReceiver, AdapterError>;
    fn write_descriptor(
        &mut self,
        address: &DeviceAddress,
        descriptor: &AttributeId,
        value: Vec<u8>,
    ) -> Result<RemoteStatusReceiver, AdapterError>;

    async fn start_notify_session(
        &mut self,
        address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<(), AdapterError>;
    async fn stop_notify_session(
        &mut self,
        address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<(), AdapterError>;

    // Local (server-hosted) GATT objects. Creation is synchronous on every
    // supported platform; only register/unregister touch the radio.
    fn create_local_service(&mut self, uuid: Uuid, primary: bool)
        -> Result<AttributeId, AdapterError>;
    fn create_local_characteristic(
        &mut self,
        service: &AttributeId,
        uuid: Uuid,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
    ) -> Result<AttributeId, AdapterError>;
    fn create_local_descriptor(
        &mut self,
        characteristic: &AttributeId,
        uuid: Uuid,
        permissions: AttributePermissions,
    ) -> Result<AttributeId, AdapterError>;
    async fn register_local_service(&mut self, service: &AttributeId) -> Result<(), AdapterError>;
    async fn unregister_local_service(&mut self, service: &AttributeId)
        -> Result<(), AdapterError>;
    fn delete_local_service(&mut self, service: &AttributeId) -> Result<(), AdapterError>;

    async fn register_advertisement(
        &mut self,
        data: AdvertisementData,
    ) -> Result<AdvertisementId, AdapterError>;
    async fn unregister_advertisement(&mut self, id: AdvertisementId)
        -> Result<(), AdapterError>;

    async fn create_service_record(&mut self, record: SdpRecord) -> Result<u32, AdapterError>;
    async fn remove_service_record(&mut self, handle: u32) -> Result<(), AdapterError>;
    fn service_records(
        &self,
        address: &DeviceAddress,
        uuid: Option<Uuid>,
    ) -> Result<Vec<SdpRecord>, AdapterError>;
}
