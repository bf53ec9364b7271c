//! GATT bridge core.
//!
//! Translates validated client requests into adapter calls and adapter
//! activity back into client-facing data. Remote attributes are addressed
//! by UUID path and resolved against the platform's current view on every
//! request, so a cached identifier can never outlive its object. Local
//! (server-hosted) attributes are addressed by 16-bit handles owned by
//! [`handles::HandleAllocator`].

pub mod advertising;
pub mod handles;
pub mod registry;

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::{
    ccc_descriptor_uuid, AdvertisementData, AttributeId, AttributePermissions,
    CharacteristicProperties, DeviceAddress, RemoteCharacteristic, RemoteDescriptor,
    RemoteService, SdpRecord, Transport,
};
use crate::blocklist::Blocklist;
use crate::error::{AdapterError, BridgeError};
use crate::infrastructure::adapter::{AdapterFacade, RemoteStatusReceiver, RemoteValueReceiver};
use crate::protocol::{GattDbElement, GattDbElementKind};
use advertising::AdvertisementPool;
use handles::HandleAllocator;
use registry::{ConnectionRegistry, NotifySession};

/// Longest value a GATT attribute can hold; write offsets must fall
/// strictly below it.
pub const MAX_ATTRIBUTE_LENGTH: i32 = 512;

pub struct GattBridge {
    handles: HandleAllocator,
    registry: ConnectionRegistry,
    advertisements: AdvertisementPool,
    blocklist: Blocklist,
    // Service handle -> most recently added characteristic beneath it.
    // Descriptor creation attaches there; the client protocol carries no
    // parent characteristic for AddDescriptor.
    last_characteristic: HashMap<u16, AttributeId>,
    in_flight: HashSet<AttributeId>,
}

impl GattBridge {
    pub fn new(max_advertisements: usize, blocklist: Blocklist) -> Self {
        Self {
            handles: HandleAllocator::new(),
            registry: ConnectionRegistry::new(),
            advertisements: AdvertisementPool::new(max_advertisements),
            blocklist,
            last_characteristic: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    // --- remote attribute resolution ---------------------------------------

    fn find_service(
        &self,
        adapter: &dyn AdapterFacade,
        address: &DeviceAddress,
        uuid: Uuid,
    ) -> Result<RemoteService, BridgeError> {
        if adapter.device(address).is_none() {
            return Err(BridgeError::NotFound("device"));
        }
        adapter
            .gatt_services(address)?
            .into_iter()
            .find(|s| s.uuid == uuid)
            .ok_or(BridgeError::NotFound("service"))
    }

    fn find_characteristic(
        &self,
        adapter: &dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<(RemoteService, RemoteCharacteristic), BridgeError> {
        let service = self.find_service(adapter, address, service_uuid)?;
        let characteristic = adapter
            .characteristics(address, &service.id)?
            .into_iter()
            .find(|c| c.uuid == characteristic_uuid)
            .ok_or(BridgeError::NotFound("characteristic"))?;
        Ok((service, characteristic))
    }

    fn find_descriptor(
        &self,
        adapter: &dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
    ) -> Result<RemoteDescriptor, BridgeError> {
        let (_, characteristic) =
            self.find_characteristic(adapter, address, service_uuid, characteristic_uuid)?;
        adapter
            .descriptors(address, &characteristic.id)?
            .into_iter()
            .find(|d| d.uuid == descriptor_uuid)
            .ok_or(BridgeError::NotFound("descriptor"))
    }

    // --- per-attribute serialization ----------------------------------------

    fn begin(&mut self, id: &AttributeId) -> Result<(), BridgeError> {
        if !self.in_flight.insert(id.clone()) {
            return Err(BridgeError::Busy);
        }
        Ok(())
    }

    fn finish(&mut self, id: &AttributeId) {
        self.in_flight.remove(id);
    }

    fn check_offset(offset: i32) -> Result<(), BridgeError> {
        if offset < 0 || offset >= MAX_ATTRIBUTE_LENGTH {
            return Err(BridgeError::InvalidOffset(offset));
        }
        Ok(())
    }

    // --- client-side GATT ops -----------------------------------------------
    //
    // Value transfers are started, not awaited: the caller gets the
    // attribute (now marked in flight) and the platform completion
    // channel, and must hand the completion back through
    // [`GattBridge::complete_remote_op`]. A second transfer on the same
    // attribute fails with `Busy` until then.

    pub fn read_characteristic(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<(AttributeId, RemoteValueReceiver), BridgeError> {
        let (_, characteristic) =
            self.find_characteristic(adapter, address, service_uuid, characteristic_uuid)?;
        if !characteristic.properties.contains(CharacteristicProperties::READ)
            && !characteristic.permissions.allows_read()
        {
            return Err(BridgeError::PermissionDenied("characteristic is not readable"));
        }
        if self.blocklist.is_blocklisted_for_reads(&characteristic.uuid) {
            return Err(BridgeError::PermissionDenied("blocklisted characteristic"));
        }
        self.begin(&characteristic.id)?;
        match adapter.read_characteristic(address, &characteristic.id) {
            Ok(completion) => Ok((characteristic.id, completion)),
            Err(error) => {
                self.finish(&characteristic.id);
                Err(map_in_progress(error))
            }
        }
    }

    pub fn write_characteristic(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        value: Vec<u8>,
        offset: i32,
    ) -> Result<(AttributeId, RemoteStatusReceiver), BridgeError> {
        Self::check_offset(offset)?;
        let (_, characteristic) =
            self.find_characteristic(adapter, address, service_uuid, characteristic_uuid)?;
        let writable = CharacteristicProperties::WRITE
            | CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        if !characteristic.properties.intersects(writable)
            && !characteristic.permissions.allows_write()
        {
            return Err(BridgeError::PermissionDenied("characteristic is not writable"));
        }
        if self.blocklist.is_blocklisted_for_writes(&characteristic.uuid) {
            return Err(BridgeError::PermissionDenied("blocklisted characteristic"));
        }
        self.begin(&characteristic.id)?;
        match adapter.write_characteristic(address, &characteristic.id, value) {
            Ok(completion) => Ok((characteristic.id, completion)),
            Err(error) => {
                self.finish(&characteristic.id);
                Err(map_in_progress(error))
            }
        }
    }

    pub fn read_descriptor(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
    ) -> Result<(AttributeId, RemoteValueReceiver), BridgeError> {
        let descriptor = self.find_descriptor(
            adapter,
            address,
            service_uuid,
            characteristic_uuid,
            descriptor_uuid,
        )?;
        if self.blocklist.is_blocklisted_for_reads(&descriptor.uuid) {
            return Err(BridgeError::PermissionDenied("blocklisted descriptor"));
        }
        self.begin(&descriptor.id)?;
        match adapter.read_descriptor(address, &descriptor.id) {
            Ok(completion) => Ok((descriptor.id, completion)),
            Err(error) => {
                self.finish(&descriptor.id);
                Err(map_in_progress(error))
            }
        }
    }

    /// Writes to the Client Characteristic Configuration descriptor are
    /// acknowledged without touching the adapter: notification state is
    /// driven through the notify-session primitives, and clients that
    /// write the CCC as a second step must still see success. `Ok(None)`
    /// is that local acknowledgement.
    pub fn write_descriptor(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
        value: Vec<u8>,
        offset: i32,
    ) -> Result<Option<(AttributeId, RemoteStatusReceiver)>, BridgeError> {
        Self::check_offset(offset)?;
        if descriptor_uuid == ccc_descriptor_uuid() {
            debug!(%address, "CCC descriptor write acknowledged locally");
            return Ok(None);
        }
        let descriptor = self.find_descriptor(
            adapter,
            address,
            service_uuid,
            characteristic_uuid,
            descriptor_uuid,
        )?;
        if self.blocklist.is_blocklisted_for_writes(&descriptor.uuid) {
            return Err(BridgeError::PermissionDenied("blocklisted descriptor"));
        }
        self.begin(&descriptor.id)?;
        match adapter.write_descriptor(address, &descriptor.id, value) {
            Ok(completion) => Ok(Some((descriptor.id, completion))),
            Err(error) => {
                self.finish(&descriptor.id);
                Err(map_in_progress(error))
            }
        }
    }

    /// Completion of a started transfer: releases the attribute's
    /// in-flight mark and maps the platform result.
    pub fn complete_remote_op<T>(
        &mut self,
        attribute: &AttributeId,
        result: Result<T, AdapterError>,
    ) -> Result<T, BridgeError> {
        self.finish(attribute);
        result.map_err(map_in_progress)
    }

    // --- notifications --------------------------------------------------------

    pub async fn register_for_notification(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<(), BridgeError> {
        let (service, characteristic) =
            self.find_characteristic(adapter, address, service_uuid, characteristic_uuid)?;
        if self.registry.has_notify_session(&characteristic.id) {
            // The platform shares one session per characteristic; a second
            // register is satisfied by the existing one.
            return Ok(());
        }
        adapter
            .start_notify_session(address, &characteristic.id)
            .await?;
        self.registry.add_notify_session(NotifySession {
            address: address.clone(),
            service_uuid: service.uuid,
            characteristic_uuid: characteristic.uuid,
            characteristic: characteristic.id,
        });
        Ok(())
    }

    /// The session entry is erased before the platform stop call so a
    /// value-changed event racing the stop finds nothing to deliver.
    pub async fn deregister_for_notification(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<(), BridgeError> {
        let (_, characteristic) =
            self.find_characteristic(adapter, address, service_uuid, characteristic_uuid)?;
        let session = self
            .registry
            .take_notify_session(&characteristic.id)
            .ok_or(BridgeError::NotFound("notify session"))?;
        adapter
            .stop_notify_session(&session.address, &session.characteristic)
            .await?;
        Ok(())
    }

    /// Session lookup for routing a value-changed event; `None` means the
    /// client never registered (or already deregistered) and the event is
    /// dropped.
    pub fn notify_session(&self, characteristic: &AttributeId) -> Option<&NotifySession> {
        self.registry.notify_session(characteristic)
    }

    // --- connections and bonds -------------------------------------------------

    pub async fn connect_le_device(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
    ) -> Result<(), BridgeError> {
        if adapter.device(address).is_none() {
            return Err(BridgeError::NotFound("device"));
        }
        adapter.connect_device(address).await?;
        self.registry.register_connection(address.clone());
        Ok(())
    }

    pub async fn disconnect_le_device(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
    ) -> Result<(), BridgeError> {
        self.stop_sessions_for(adapter, address).await;
        adapter.disconnect_device(address).await?;
        Ok(())
    }

    /// Platform-initiated disconnect: no adapter call to make, but every
    /// notify session riding the connection must be stopped.
    pub async fn on_connection_lost(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
    ) {
        self.stop_sessions_for(adapter, address).await;
    }

    async fn stop_sessions_for(&mut self, adapter: &mut dyn AdapterFacade, address: &DeviceAddress) {
        for session in self.registry.connection_closed(address) {
            if let Err(error) = adapter
                .stop_notify_session(&session.address, &session.characteristic)
                .await
            {
                warn!(%address, %error, "failed to stop notify session on disconnect");
            }
        }
    }

    pub fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.registry.is_connected(address)
    }

    pub async fn create_bond(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
        transport_bits: u8,
    ) -> Result<(), BridgeError> {
        let transport = Transport::from_bits(transport_bits).ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("unknown transport bits {transport_bits:#04x}"))
        })?;
        if adapter.device(address).is_none() {
            return Err(BridgeError::NotFound("device"));
        }
        adapter.create_bond(address, transport).await?;
        Ok(())
    }

    pub async fn remove_bond(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
    ) -> Result<(), BridgeError> {
        adapter.remove_bond(address).await.map_err(Into::into)
    }

    pub async fn cancel_bond(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
    ) -> Result<(), BridgeError> {
        adapter.cancel_bond(address).await.map_err(Into::into)
    }

    // --- GATT DB and SDP ----------------------------------------------------------

    /// Flatten the remote attribute hierarchy into the list shape the
    /// client protocol expects, depth-first.
    pub fn get_gatt_db(
        &self,
        adapter: &dyn AdapterFacade,
        address: &DeviceAddress,
    ) -> Result<Vec<GattDbElement>, BridgeError> {
        if adapter.device(address).is_none() {
            return Err(BridgeError::NotFound("device"));
        }
        let mut elements = Vec::new();
        for service in adapter.gatt_services(address)? {
            elements.push(GattDbElement {
                kind: if service.primary {
                    GattDbElementKind::PrimaryService
                } else {
                    GattDbElementKind::SecondaryService
                },
                uuid: service.uuid,
                instance_id: service.id.short_id(),
                properties: 0,
            });
            for characteristic in adapter.characteristics(address, &service.id)? {
                elements.push(GattDbElement {
                    kind: GattDbElementKind::Characteristic,
                    uuid: characteristic.uuid,
                    instance_id: characteristic.id.short_id(),
                    properties: characteristic.properties.bits(),
                });
                for descriptor in adapter.descriptors(address, &characteristic.id)? {
                    elements.push(GattDbElement {
                        kind: GattDbElementKind::Descriptor,
                        uuid: descriptor.uuid,
                        instance_id: descriptor.id.short_id(),
                        properties: 0,
                    });
                }
            }
        }
        Ok(elements)
    }

    pub async fn search_services(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        address: &DeviceAddress,
    ) -> Result<Vec<Uuid>, BridgeError> {
        adapter.search_services(address).await.map_err(Into::into)
    }

    pub fn get_sdp_records(
        &self,
        adapter: &dyn AdapterFacade,
        address: &DeviceAddress,
        uuid: Option<Uuid>,
    ) -> Result<Vec<SdpRecord>, BridgeError> {
        adapter.service_records(address, uuid).map_err(Into::into)
    }

    pub async fn create_sdp_record(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        record: SdpRecord,
    ) -> Result<u32, BridgeError> {
        if !record.has_service_class_id_list() {
            return Err(BridgeError::Platform(AdapterError::Failed(
                "service record carries no service class id list".to_string(),
            )));
        }
        adapter.create_service_record(record).await.map_err(Into::into)
    }

    pub async fn remove_sdp_record(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        handle: u32,
    ) -> Result<(), BridgeError> {
        adapter.remove_service_record(handle).await.map_err(Into::into)
    }

    // --- server-hosted attributes ----------------------------------------------

    /// Create a local service. `num_handles` is the client's declared
    /// budget for the whole service subtree; the reservation is checked
    /// up front so a service never lands with room for none of its
    /// children.
    pub fn add_service(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        uuid: Uuid,
        primary: bool,
        num_handles: u16,
    ) -> Result<u16, BridgeError> {
        if !self.handles.is_available(num_handles.max(1)) {
            return Err(BridgeError::Exhausted("attribute handles"));
        }
        let id = adapter.create_local_service(uuid, primary)?;
        self.handles
            .allocate(id)
            .ok_or(BridgeError::Exhausted("attribute handles"))
    }

    pub fn add_characteristic(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        service_handle: u16,
        uuid: Uuid,
        property_bits: u32,
        permission_bits: u32,
    ) -> Result<u16, BridgeError> {
        let properties = CharacteristicProperties::from_bits(property_bits).ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("unknown property bits {property_bits:#x}"))
        })?;
        let permissions = AttributePermissions::from_bits(permission_bits).ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("unknown permission bits {permission_bits:#x}"))
        })?;
        let service_id = self.resolve_local(service_handle)?.clone();
        if !self.handles.is_available(1) {
            return Err(BridgeError::Exhausted("attribute handles"));
        }
        let id = adapter.create_local_characteristic(&service_id, uuid, properties, permissions)?;
        let handle = self
            .handles
            .allocate(id.clone())
            .ok_or(BridgeError::Exhausted("attribute handles"))?;
        self.last_characteristic.insert(service_handle, id);
        Ok(handle)
    }

    /// The protocol names only the service a descriptor belongs to, so
    /// the descriptor attaches to the characteristic most recently added
    /// under that service. A CCC descriptor is acknowledged with a handle
    /// but never created: the platform manages subscription state itself.
    pub fn add_descriptor(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        service_handle: u16,
        uuid: Uuid,
        permission_bits: u32,
    ) -> Result<u16, BridgeError> {
        let permissions = AttributePermissions::from_bits(permission_bits).ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("unknown permission bits {permission_bits:#x}"))
        })?;
        // Validates the handle even for the CCC shortcut.
        let _ = self.resolve_local(service_handle)?;
        if uuid == ccc_descriptor_uuid() {
            return self
                .handles
                .allocate_unmapped()
                .ok_or(BridgeError::Exhausted("attribute handles"));
        }
        let parent = self
            .last_characteristic
            .get(&service_handle)
            .cloned()
            .ok_or(BridgeError::NotFound("characteristic"))?;
        if !self.handles.is_available(1) {
            return Err(BridgeError::Exhausted("attribute handles"));
        }
        let id = adapter.create_local_descriptor(&parent, uuid, permissions)?;
        self.handles
            .allocate(id)
            .ok_or(BridgeError::Exhausted("attribute handles"))
    }

    pub async fn start_service(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        service_handle: u16,
    ) -> Result<(), BridgeError> {
        let id = self.resolve_local(service_handle)?.clone();
        adapter.register_local_service(&id).await.map_err(Into::into)
    }

    pub async fn stop_service(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        service_handle: u16,
    ) -> Result<(), BridgeError> {
        let id = self.resolve_local(service_handle)?.clone();
        adapter.unregister_local_service(&id).await.map_err(Into::into)
    }

    pub fn delete_service(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        service_handle: u16,
    ) -> Result<(), BridgeError> {
        let id = self.resolve_local(service_handle)?.clone();
        adapter.delete_local_service(&id)?;
        self.handles.release(service_handle);
        self.last_characteristic.remove(&service_handle);
        Ok(())
    }

    /// A handle the bridge never handed out can only come from a
    /// non-conforming client.
    fn resolve_local(&self, handle: u16) -> Result<&AttributeId, BridgeError> {
        self.handles.resolve(handle).ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("unknown attribute handle {handle}"))
        })
    }

    /// Handle for a platform-reported local attribute. Every attribute the
    /// bridge created was handle-allocated at creation, so `None` here is
    /// an invariant violation and the platform request must be failed.
    pub fn local_handle(&self, id: &AttributeId) -> Option<u16> {
        self.handles.handle_for(id)
    }

    #[cfg(test)]
    fn resolve_local_for_test(&self, handle: u16) -> Option<&AttributeId> {
        self.handles.resolve(handle)
    }

    // --- advertising ---------------------------------------------------------------

    pub fn reserve_advertisement(&mut self) -> Result<u16, BridgeError> {
        self.advertisements.reserve()
    }

    pub async fn broadcast_advertisement(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        slot: u16,
        data: AdvertisementData,
    ) -> Result<(), BridgeError> {
        self.advertisements.broadcast(slot, data, adapter).await
    }

    pub async fn release_advertisement(
        &mut self,
        adapter: &mut dyn AdapterFacade,
        slot: u16,
    ) -> Result<(), BridgeError> {
        self.advertisements.release(slot, adapter).await
    }

    // --- teardown -------------------------------------------------------------------

    /// Stop everything the departing client left running. Failures are
    /// logged; there is nobody left to report them to.
    pub async fn client_detached(&mut self, adapter: &mut dyn AdapterFacade) {
        for session in self.registry.drain() {
            if let Err(error) = adapter
                .stop_notify_session(&session.address, &session.characteristic)
                .await
            {
                warn!(address = %session.address, %error, "failed to stop notify session at teardown");
            }
        }
        self.advertisements.release_all(adapter).await;
    }
}

fn map_in_progress(error: AdapterError) -> BridgeError {
    match error {
        AdapterError::InProgress => BridgeError::Busy,
        other => BridgeError::Platform(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceInfo;
    use crate::infrastructure::mock::MockAdapter;
    use tokio::sync::mpsc;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn svc_uuid() -> Uuid {
        Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap()
    }

    fn chr_uuid() -> Uuid {
        Uuid::parse_str("00002a19-0000-1000-8000-00805f9b34fb").unwrap()
    }

    fn dsc_uuid() -> Uuid {
        Uuid::parse_str("00002901-0000-1000-8000-00805f9b34fb").unwrap()
    }

    fn setup() -> (GattBridge, MockAdapter, DeviceAddress) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut adapter = MockAdapter::new(tx);
        let address: DeviceAddress = ADDR.parse().unwrap();
        adapter.add_device(DeviceInfo::new(address.clone()));
        let svc_id = AttributeId("dev/srv001a".to_string());
        let chr_id = AttributeId("dev/srv001a/chr002b".to_string());
        let dsc_id = AttributeId("dev/srv001a/chr002b/dsc003c".to_string());
        adapter.add_remote_service(
            &address,
            RemoteService {
                id: svc_id.clone(),
                uuid: svc_uuid(),
                primary: true,
            },
        );
        adapter.add_remote_characteristic(
            &svc_id,
            RemoteCharacteristic {
                id: chr_id.clone(),
                uuid: chr_uuid(),
                properties: CharacteristicProperties::READ
                    | CharacteristicProperties::WRITE
                    | CharacteristicProperties::NOTIFY,
                permissions: AttributePermissions::ANY_READ | AttributePermissions::ANY_WRITE,
            },
        );
        adapter.add_remote_descriptor(
            &chr_id,
            RemoteDescriptor {
                id: dsc_id.clone(),
                uuid: dsc_uuid(),
                permissions: AttributePermissions::ANY_READ | AttributePermissions::ANY_WRITE,
            },
        );
        adapter.set_value(&chr_id, vec![0x2a]);
        adapter.set_value(&dsc_id, vec![0x01]);
        (GattBridge::new(4, Blocklist::default()), adapter, address)
    }

    /// Start a characteristic read and run it to completion.
    async fn drive_read(
        bridge: &mut GattBridge,
        adapter: &mut MockAdapter,
        address: &DeviceAddress,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BridgeError> {
        let (attribute, completion) =
            bridge.read_characteristic(adapter, address, service, characteristic)?;
        let result = completion.await.unwrap();
        bridge.complete_remote_op(&attribute, result)
    }

    /// Start a characteristic write and run it to completion.
    async fn drive_write(
        bridge: &mut GattBridge,
        adapter: &mut MockAdapter,
        address: &DeviceAddress,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        offset: i32,
    ) -> Result<(), BridgeError> {
        let (attribute, completion) =
            bridge.write_characteristic(adapter, address, service, characteristic, value, offset)?;
        let result = completion.await.unwrap();
        bridge.complete_remote_op(&attribute, result)
    }

    #[tokio::test]
    async fn blocklisted_characteristic_write_is_denied() {
        let (mut bridge, mut adapter, address) = setup();
        // Peripheral privacy flag: write-excluded by the built-in list.
        let privacy = Uuid::parse_str("00002a02-0000-1000-8000-00805f9b34fb").unwrap();
        let chr_id = AttributeId("dev/srv001a/chr009f".to_string());
        adapter.add_remote_characteristic(
            &AttributeId("dev/srv001a".to_string()),
            RemoteCharacteristic {
                id: chr_id.clone(),
                uuid: privacy,
                properties: CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                permissions: AttributePermissions::ANY_READ | AttributePermissions::ANY_WRITE,
            },
        );
        adapter.set_value(&chr_id, vec![0]);
        let result =
            drive_write(&mut bridge, &mut adapter, &address, svc_uuid(), privacy, vec![1], 0).await;
        assert!(matches!(result, Err(BridgeError::PermissionDenied(_))));
        // Reads of the same characteristic stay allowed.
        drive_read(&mut bridge, &mut adapter, &address, svc_uuid(), privacy)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ccc_write_succeeds_without_an_adapter_call() {
        let (mut bridge, mut adapter, address) = setup();
        let started = bridge
            .write_descriptor(
                &mut adapter,
                &address,
                svc_uuid(),
                chr_uuid(),
                ccc_descriptor_uuid(),
                vec![0x01, 0x00],
                0,
            )
            .unwrap();
        assert!(started.is_none());
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn write_offset_boundaries() {
        let (mut bridge, mut adapter, address) = setup();
        for bad in [-1, 512] {
            let result = drive_write(
                &mut bridge,
                &mut adapter,
                &address,
                svc_uuid(),
                chr_uuid(),
                vec![1],
                bad,
            )
            .await;
            assert!(matches!(result, Err(BridgeError::InvalidOffset(o)) if o == bad));
        }
        for good in [0, 511] {
            drive_write(
                &mut bridge,
                &mut adapter,
                &address,
                svc_uuid(),
                chr_uuid(),
                vec![1],
                good,
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn read_on_unknown_device_is_not_found_with_no_adapter_call() {
        let (mut bridge, mut adapter, _) = setup();
        let missing: DeviceAddress = "11:22:33:44:55:66".parse().unwrap();
        let result = bridge.read_characteristic(&mut adapter, &missing, svc_uuid(), chr_uuid());
        assert!(matches!(result, Err(BridgeError::NotFound("device"))));
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn vanished_service_reports_not_found() {
        let (mut bridge, mut adapter, address) = setup();
        let other = Uuid::parse_str("0000ffff-0000-1000-8000-00805f9b34fb").unwrap();
        let result = bridge.read_characteristic(&mut adapter, &address, other, chr_uuid());
        assert!(matches!(result, Err(BridgeError::NotFound("service"))));
    }

    #[tokio::test]
    async fn second_transfer_on_a_busy_attribute_is_rejected() {
        let (mut bridge, mut adapter, address) = setup();
        let mut held = adapter.hold_remote_ops();

        let (attribute, completion) = bridge
            .read_characteristic(&mut adapter, &address, svc_uuid(), chr_uuid())
            .unwrap();
        let second = bridge.read_characteristic(&mut adapter, &address, svc_uuid(), chr_uuid());
        assert!(matches!(second, Err(BridgeError::Busy)));
        // A write to the same attribute is rejected as well.
        let write =
            bridge.write_characteristic(&mut adapter, &address, svc_uuid(), chr_uuid(), vec![1], 0);
        assert!(matches!(write, Err(BridgeError::Busy)));

        assert_eq!(held.release_all(), 1);
        let value = bridge
            .complete_remote_op(&attribute, completion.await.unwrap())
            .unwrap();
        assert_eq!(value, vec![0x2a]);

        // Completion frees the attribute for the next transfer.
        assert!(bridge
            .read_characteristic(&mut adapter, &address, svc_uuid(), chr_uuid())
            .is_ok());
    }

    #[tokio::test]
    async fn notify_register_then_deregister() {
        let (mut bridge, mut adapter, address) = setup();
        bridge
            .register_for_notification(&mut adapter, &address, svc_uuid(), chr_uuid())
            .await
            .unwrap();
        let chr_id = AttributeId("dev/srv001a/chr002b".to_string());
        assert!(adapter.is_notifying(&chr_id));
        assert!(bridge.notify_session(&chr_id).is_some());

        bridge
            .deregister_for_notification(&mut adapter, &address, svc_uuid(), chr_uuid())
            .await
            .unwrap();
        assert!(!adapter.is_notifying(&chr_id));
        assert!(bridge.notify_session(&chr_id).is_none());
    }

    #[tokio::test]
    async fn deregistering_an_unknown_notification_is_a_deterministic_error() {
        let (mut bridge, mut adapter, address) = setup();
        let result = bridge
            .deregister_for_notification(&mut adapter, &address, svc_uuid(), chr_uuid())
            .await;
        assert!(matches!(result, Err(BridgeError::NotFound("notify session"))));
    }

    #[tokio::test]
    async fn second_register_reuses_the_shared_session() {
        let (mut bridge, mut adapter, address) = setup();
        bridge
            .register_for_notification(&mut adapter, &address, svc_uuid(), chr_uuid())
            .await
            .unwrap();
        bridge
            .register_for_notification(&mut adapter, &address, svc_uuid(), chr_uuid())
            .await
            .unwrap();
        let starts = adapter
            .calls()
            .iter()
            .filter(|c| c.as_str() == "start_notify_session")
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn disconnect_stops_riding_notify_sessions() {
        let (mut bridge, mut adapter, address) = setup();
        bridge
            .connect_le_device(&mut adapter, &address)
            .await
            .unwrap();
        bridge
            .register_for_notification(&mut adapter, &address, svc_uuid(), chr_uuid())
            .await
            .unwrap();
        bridge
            .disconnect_le_device(&mut adapter, &address)
            .await
            .unwrap();
        let chr_id = AttributeId("dev/srv001a/chr002b".to_string());
        assert!(!adapter.is_notifying(&chr_id));
        assert!(bridge.notify_session(&chr_id).is_none());
        assert!(!bridge.is_connected(&address));
    }

    #[tokio::test]
    async fn server_build_scenario_attaches_descriptor_to_last_characteristic() {
        let (mut bridge, mut adapter, _) = setup();
        let svc = bridge
            .add_service(&mut adapter, svc_uuid(), true, 3)
            .unwrap();
        assert_eq!(svc, 1);
        let chr = bridge
            .add_characteristic(
                &mut adapter,
                svc,
                chr_uuid(),
                CharacteristicProperties::READ.bits(),
                AttributePermissions::READ.bits(),
            )
            .unwrap();
        assert_eq!(chr, 2);
        let dsc = bridge
            .add_descriptor(&mut adapter, svc, dsc_uuid(), AttributePermissions::READ.bits())
            .unwrap();

        let chr_id = bridge.resolve_local_for_test(chr).unwrap().clone();
        let dsc_id = bridge.resolve_local_for_test(dsc).unwrap().clone();
        assert_eq!(adapter.local_parent(&dsc_id), Some(chr_id));
    }

    #[tokio::test]
    async fn ccc_descriptor_gets_an_unmapped_handle_and_no_platform_object() {
        let (mut bridge, mut adapter, _) = setup();
        let svc = bridge
            .add_service(&mut adapter, svc_uuid(), true, 3)
            .unwrap();
        bridge
            .add_characteristic(
                &mut adapter,
                svc,
                chr_uuid(),
                CharacteristicProperties::NOTIFY.bits(),
                AttributePermissions::READ.bits(),
            )
            .unwrap();
        let handle = bridge
            .add_descriptor(
                &mut adapter,
                svc,
                ccc_descriptor_uuid(),
                AttributePermissions::READ.bits(),
            )
            .unwrap();
        assert!(handle > 0);
        assert!(bridge.resolve_local_for_test(handle).is_none());
    }

    #[tokio::test]
    async fn fabricated_service_handle_is_a_protocol_violation() {
        let (mut bridge, mut adapter, _) = setup();
        let result = bridge.add_characteristic(
            &mut adapter,
            42,
            chr_uuid(),
            CharacteristicProperties::READ.bits(),
            AttributePermissions::READ.bits(),
        );
        assert!(matches!(result, Err(BridgeError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn delete_service_releases_its_handle() {
        let (mut bridge, mut adapter, _) = setup();
        let svc = bridge
            .add_service(&mut adapter, svc_uuid(), true, 2)
            .unwrap();
        bridge.delete_service(&mut adapter, svc).unwrap();
        assert!(matches!(
            bridge.delete_service(&mut adapter, svc),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn gatt_db_is_flattened_depth_first() {
        let (bridge, adapter, address) = setup();
        let elements = bridge.get_gatt_db(&adapter, &address).unwrap();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0].kind, GattDbElementKind::PrimaryService);
        assert_eq!(elements[0].instance_id, 0x001a);
        assert_eq!(elements[1].kind, GattDbElementKind::Characteristic);
        assert_eq!(elements[2].kind, GattDbElementKind::Descriptor);
    }

    #[tokio::test]
    async fn in_progress_platform_error_maps_to_busy() {
        let (mut bridge, mut adapter, address) = setup();
        adapter.fail_next("read_characteristic", AdapterError::InProgress);
        let result = bridge.read_characteristic(&mut adapter, &address, svc_uuid(), chr_uuid());
        assert!(matches!(result, Err(BridgeError::Busy)));
        // The failed start released the in-flight mark.
        drive_read(&mut bridge, &mut adapter, &address, svc_uuid(), chr_uuid())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sdp_record_without_service_class_list_is_rejected() {
        let (mut bridge, mut adapter, _) = setup();
        let record = SdpRecord {
            service_class_uuids: vec![],
            service_name: Some("x".to_string()),
            channel: None,
        };
        assert!(bridge.create_sdp_record(&mut adapter, record).await.is_err());
        assert!(adapter.calls().is_empty());
    }
}
