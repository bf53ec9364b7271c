//! In-memory adapter used by the test suite and as the daemon's stand-in
//! backend while no platform HAL is wired up.
//!
//! The mock keeps a scriptable device table and a local attribute graph,
//! records every mutating call by name, and can be primed to fail the
//! next occurrence of a given operation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::domain::models::{
    AdvertisementData, AdvertisementId, AttributeId, AttributePermissions,
    CharacteristicProperties, DeviceAddress, DeviceInfo, RemoteCharacteristic, RemoteDescriptor,
    RemoteService, SdpRecord, Transport,
};
use crate::error::AdapterError;
use crate::infrastructure::adapter::{
    AdapterEvent, AdapterFacade, DiscoveryFilter, RemoteStatusReceiver, RemoteValueReceiver,
};

#[derive(Debug, Clone)]
struct LocalAttribute {
    uuid: Uuid,
    parent: Option<AttributeId>,
}

enum HeldCompletion {
    Value(oneshot::Sender<Result<Vec<u8>, AdapterError>>, Result<Vec<u8>, AdapterError>),
    Status(oneshot::Sender<Result<(), AdapterError>>, Result<(), AdapterError>),
}

/// Handle over remote value transfers kept pending by
/// [`MockAdapter::hold_remote_ops`].
pub struct HeldRemoteOps {
    completions: mpsc::UnboundedReceiver<HeldCompletion>,
}

impl HeldRemoteOps {
    /// Complete every held transfer with its scripted result; returns how
    /// many were released.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        while let Ok(held) = self.completions.try_recv() {
            match held {
                HeldCompletion::Value(sender, result) => {
                    let _ = sender.send(result);
                }
                HeldCompletion::Status(sender, result) => {
                    let _ = sender.send(result);
                }
            }
            released += 1;
        }
        released
    }
}

pub struct MockAdapter {
    present: bool,
    powered: bool,
    discoverable: bool,
    discovering: bool,
    adapter_address: DeviceAddress,
    adapter_name: String,

    devices: HashMap<DeviceAddress, DeviceInfo>,
    services: HashMap<DeviceAddress, Vec<RemoteService>>,
    characteristics: HashMap<AttributeId, Vec<RemoteCharacteristic>>,
    descriptors: HashMap<AttributeId, Vec<RemoteDescriptor>>,
    values: HashMap<AttributeId, Vec<u8>>,
    sdp_uuids: HashMap<DeviceAddress, Vec<Uuid>>,
    notifying: HashSet<AttributeId>,

    local_attributes: HashMap<AttributeId, LocalAttribute>,
    registered_services: HashSet<AttributeId>,
    next_local_id: u32,

    advertisements: HashMap<AdvertisementId, AdvertisementData>,
    next_advertisement: u64,

    sdp_records: HashMap<u32, SdpRecord>,
    next_record_handle: u32,

    events: mpsc::UnboundedSender<AdapterEvent>,
    queued_failures: HashMap<&'static str, AdapterError>,
    held_completions: Option<mpsc::UnboundedSender<HeldCompletion>>,
    calls: Vec<String>,
}

impl MockAdapter {
    pub fn new(events: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self {
            present: true,
            powered: true,
            discoverable: false,
            discovering: false,
            adapter_address: "00:1A:7D:DA:71:13"
                .parse()
                .unwrap_or_else(|_| unreachable!()),
            adapter_name: "blebridge".to_string(),
            devices: HashMap::new(),
            services: HashMap::new(),
            characteristics: HashMap::new(),
            descriptors: HashMap::new(),
            values: HashMap::new(),
            sdp_uuids: HashMap::new(),
            notifying: HashSet::new(),
            local_attributes: HashMap::new(),
            registered_services: HashSet::new(),
            next_local_id: 0,
            advertisements: HashMap::new(),
            next_advertisement: 1,
            sdp_records: HashMap::new(),
            next_record_handle: 1,
            events,
            queued_failures: HashMap::new(),
            held_completions: None,
            calls: Vec::new(),
        }
    }

    // --- scripting helpers ------------------------------------------------

    pub fn set_present(&mut self, present: bool) {
        self.present = present;
        let _ = self.events.send(AdapterEvent::AdapterPresentChanged(present));
    }

    pub fn set_powered_state(&mut self, powered: bool) {
        self.powered = powered;
        let _ = self.events.send(AdapterEvent::AdapterPoweredChanged(powered));
    }

    /// Insert or replace a device and emit the matching event.
    pub fn add_device(&mut self, device: DeviceInfo) {
        let known = self.devices.contains_key(&device.address);
        self.devices.insert(device.address.clone(), device.clone());
        let event = if known {
            AdapterEvent::DeviceChanged(device)
        } else {
            AdapterEvent::DeviceAdded(device)
        };
        let _ = self.events.send(event);
    }

    pub fn remove_device(&mut self, address: &DeviceAddress) {
        if self.devices.remove(address).is_some() {
            self.services.remove(address);
            let _ = self.events.send(AdapterEvent::DeviceRemoved(address.clone()));
        }
    }

    pub fn add_remote_service(&mut self, address: &DeviceAddress, service: RemoteService) {
        self.services.entry(address.clone()).or_default().push(service);
    }

    pub fn add_remote_characteristic(
        &mut self,
        service: &AttributeId,
        characteristic: RemoteCharacteristic,
    ) {
        self.characteristics
            .entry(service.clone())
            .or_default()
            .push(characteristic);
    }

    pub fn add_remote_descriptor(
        &mut self,
        characteristic: &AttributeId,
        descriptor: RemoteDescriptor,
    ) {
        self.descriptors
            .entry(characteristic.clone())
            .or_default()
            .push(descriptor);
    }

    pub fn set_value(&mut self, attribute: &AttributeId, value: Vec<u8>) {
        self.values.insert(attribute.clone(), value);
    }

    pub fn set_sdp_uuids(&mut self, address: &DeviceAddress, uuids: Vec<Uuid>) {
        self.sdp_uuids.insert(address.clone(), uuids);
    }

    /// Fail the next occurrence of the named operation with `error`.
    pub fn fail_next(&mut self, op: &'static str, error: AdapterError) {
        self.queued_failures.insert(op, error);
    }

    /// Keep started remote value transfers pending until the returned
    /// handle releases them. Transfers started before this call are
    /// unaffected.
    pub fn hold_remote_ops(&mut self) -> HeldRemoteOps {
        let (tx, rx) = mpsc::unbounded_channel();
        self.held_completions = Some(tx);
        HeldRemoteOps { completions: rx }
    }

    /// Names of every mutating facade call made so far, in order.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    pub fn is_notifying(&self, characteristic: &AttributeId) -> bool {
        self.notifying.contains(characteristic)
    }

    pub fn advertisement_count(&self) -> usize {
        self.advertisements.len()
    }

    /// Parent of a local attribute, for asserting descriptor attachment.
    pub fn local_parent(&self, id: &AttributeId) -> Option<AttributeId> {
        self.local_attributes.get(id).and_then(|a| a.parent.clone())
    }

    pub fn has_local_attribute(&self, id: &AttributeId) -> bool {
        self.local_attributes.contains_key(id)
    }

    // --- internals --------------------------------------------------------

    fn record(&mut self, op: &'static str) -> Result<(), AdapterError> {
        self.calls.push(op.to_string());
        match self.queued_failures.remove(op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn require_powered(&self) -> Result<(), AdapterError> {
        if !self.present {
            return Err(AdapterError::NotPresent);
        }
        if !self.powered {
            return Err(AdapterError::NotPowered);
        }
        Ok(())
    }

    fn mint_local_id(&mut self, kind: &str) -> AttributeId {
        self.next_local_id += 1;
        AttributeId(format!("local/{}{:04x}", kind, self.next_local_id))
    }

    fn complete_value(&mut self, result: Result<Vec<u8>, AdapterError>) -> RemoteValueReceiver {
        let (tx, rx) = oneshot::channel();
        match &self.held_completions {
            Some(held) => {
                let _ = held.send(HeldCompletion::Value(tx, result));
            }
            None => {
                let _ = tx.send(result);
            }
        }
        rx
    }

    fn complete_status(&mut self, result: Result<(), AdapterError>) -> RemoteStatusReceiver {
        let (tx, rx) = oneshot::channel();
        match &self.held_completions {
            Some(held) => {
                let _ = held.send(HeldCompletion::Status(tx, result));
            }
            None => {
                let _ = tx.send(result);
            }
        }
        rx
    }
}

#[async_trait]
impl AdapterFacade for MockAdapter {
    fn is_present(&self) -> bool {
        self.present
    }

    fn is_powered(&self) -> bool {
        self.present && self.powered
    }

    fn address(&self) -> DeviceAddress {
        self.adapter_address.clone()
    }

    fn name(&self) -> String {
        self.adapter_name.clone()
    }

    fn is_discoverable(&self) -> bool {
        self.discoverable
    }

    async fn set_powered(&mut self, powered: bool) -> Result<(), AdapterError> {
        self.record("set_powered")?;
        if !self.present {
            return Err(AdapterError::NotPresent);
        }
        if self.powered != powered {
            self.powered = powered;
            let _ = self.events.send(AdapterEvent::AdapterPoweredChanged(powered));
        }
        Ok(())
    }

    async fn set_name(&mut self, name: String) -> Result<(), AdapterError> {
        self.record("set_name")?;
        self.adapter_name = name;
        Ok(())
    }

    async fn set_discoverable(&mut self, on: bool, _timeout_secs: u32) -> Result<(), AdapterError> {
        self.record("set_discoverable")?;
        self.require_powered()?;
        self.discoverable = on;
        Ok(())
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.values().cloned().collect()
    }

    fn device(&self, address: &DeviceAddress) -> Option<DeviceInfo> {
        self.devices.get(address).cloned()
    }

    async fn start_discovery(&mut self, _filter: DiscoveryFilter) -> Result<(), AdapterError> {
        self.record("start_discovery")?;
        self.require_powered()?;
        self.discovering = true;
        Ok(())
    }

    async fn stop_discovery(&mut self) -> Result<(), AdapterError> {
        self.record("stop_discovery")?;
        self.discovering = false;
        Ok(())
    }

    async fn connect_device(&mut self, address: &DeviceAddress) -> Result<(), AdapterError> {
        self.record("connect_device")?;
        self.require_powered()?;
        let device = self
            .devices
            .get_mut(address)
            .ok_or(AdapterError::DoesNotExist)?;
        device.connected = true;
        let _ = self.events.send(AdapterEvent::DeviceConnectionChanged {
            address: address.clone(),
            connected: true,
        });
        Ok(())
    }

    async fn disconnect_device(&mut self, address: &DeviceAddress) -> Result<(), AdapterError> {
        self.record("disconnect_device")?;
        let device = self
            .devices
            .get_mut(address)
            .ok_or(AdapterError::DoesNotExist)?;
        device.connected = false;
        let _ = self.events.send(AdapterEvent::DeviceConnectionChanged {
            address: address.clone(),
            connected: false,
        });
        Ok(())
    }

    async fn create_bond(
        &mut self,
        address: &DeviceAddress,
        _transport: Transport,
    ) -> Result<(), AdapterError> {
        self.record("create_bond")?;
        self.require_powered()?;
        let device = self
            .devices
            .get_mut(address)
            .ok_or(AdapterError::DoesNotExist)?;
        device.paired = true;
        let _ = self.events.send(AdapterEvent::DevicePairedChanged {
            address: address.clone(),
            paired: true,
        });
        Ok(())
    }

    async fn remove_bond(&mut self, address: &DeviceAddress) -> Result<(), AdapterError> {
        self.record("remove_bond")?;
        let device = self
            .devices
            .get_mut(address)
            .ok_or(AdapterError::DoesNotExist)?;
        device.paired = false;
        let _ = self.events.send(AdapterEvent::DevicePairedChanged {
            address: address.clone(),
            paired: false,
        });
        Ok(())
    }

    async fn cancel_bond(&mut self, address: &DeviceAddress) -> Result<(), AdapterError> {
        self.record("cancel_bond")?;
        if !self.devices.contains_key(address) {
            return Err(AdapterError::DoesNotExist);
        }
        Ok(())
    }

    async fn search_services(
        &mut self,
        address: &DeviceAddress,
    ) -> Result<Vec<Uuid>, AdapterError> {
        self.record("search_services")?;
        self.require_powered()?;
        if !self.devices.contains_key(address) {
            return Err(AdapterError::DoesNotExist);
        }
        Ok(self.sdp_uuids.get(address).cloned().unwrap_or_default())
    }

    fn gatt_services(&self, address: &DeviceAddress) -> Result<Vec<RemoteService>, AdapterError> {
        if !self.devices.contains_key(address) {
            return Err(AdapterError::DoesNotExist);
        }
        Ok(self.services.get(address).cloned().unwrap_or_default())
    }

    fn characteristics(
        &self,
        _address: &DeviceAddress,
        service: &AttributeId,
    ) -> Result<Vec<RemoteCharacteristic>, AdapterError> {
        Ok(self.characteristics.get(service).cloned().unwrap_or_default())
    }

    fn descriptors(
        &self,
        _address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<Vec<RemoteDescriptor>, AdapterError> {
        Ok(self
            .descriptors
            .get(characteristic)
            .cloned()
            .unwrap_or_default())
    }

    fn read_characteristic(
        &mut self,
        _address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<RemoteValueReceiver, AdapterError> {
        self.record("read_characteristic")?;
        let result = self
            .values
            .get(characteristic)
            .cloned()
            .ok_or(AdapterError::DoesNotExist);
        Ok(self.complete_value(result))
    }

    fn write_characteristic(
        &mut self,
        _address: &DeviceAddress,
        characteristic: &AttributeId,
        value: Vec<u8>,
    ) -> Result<RemoteStatusReceiver, AdapterError> {
        self.record("write_characteristic")?;
        self.values.insert(characteristic.clone(), value);
        Ok(self.complete_status(Ok(())))
    }

    fn read_descriptor(
        &mut self,
        _address: &DeviceAddress,
        descriptor: &AttributeId,
    ) -> Result<RemoteValueReceiver, AdapterError> {
        self.record("read_descriptor")?;
        let result = self
            .values
            .get(descriptor)
            .cloned()
            .ok_or(AdapterError::DoesNotExist);
        Ok(self.complete_value(result))
    }

    fn write_descriptor(
        &mut self,
        _address: &DeviceAddress,
        descriptor: &AttributeId,
        value: Vec<u8>,
    ) -> Result<RemoteStatusReceiver, AdapterError> {
        self.record("write_descriptor")?;
        self.values.insert(descriptor.clone(), value);
        Ok(self.complete_status(Ok(())))
    }

    async fn start_notify_session(
        &mut self,
        _address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<(), AdapterError> {
        self.record("start_notify_session")?;
        self.notifying.insert(characteristic.clone());
        Ok(())
    }

    async fn stop_notify_session(
        &mut self,
        _address: &DeviceAddress,
        characteristic: &AttributeId,
    ) -> Result<(), AdapterError> {
        self.record("stop_notify_session")?;
        self.notifying.remove(characteristic);
        Ok(())
    }

    fn create_local_service(
        &mut self,
        uuid: Uuid,
        _primary: bool,
    ) -> Result<AttributeId, AdapterError> {
        let id = self.mint_local_id("svc");
        self.local_attributes
            .insert(id.clone(), LocalAttribute { uuid, parent: None });
        Ok(id)
    }

    fn create_local_characteristic(
        &mut self,
        service: &AttributeId,
        uuid: Uuid,
        _properties: CharacteristicProperties,
        _permissions: AttributePermissions,
    ) -> Result<AttributeId, AdapterError> {
        if !self.local_attributes.contains_key(service) {
            return Err(AdapterError::DoesNotExist);
        }
        let id = self.mint_local_id("chr");
        self.local_attributes.insert(
            id.clone(),
            LocalAttribute {
                uuid,
                parent: Some(service.clone()),
            },
        );
        Ok(id)
    }

    fn create_local_descriptor(
        &mut self,
        characteristic: &AttributeId,
        uuid: Uuid,
        _permissions: AttributePermissions,
    ) -> Result<AttributeId, AdapterError> {
        if !self.local_attributes.contains_key(characteristic) {
            return Err(AdapterError::DoesNotExist);
        }
        let id = self.mint_local_id("dsc");
        self.local_attributes.insert(
            id.clone(),
            LocalAttribute {
                uuid,
                parent: Some(characteristic.clone()),
            },
        );
        Ok(id)
    }

    async fn register_local_service(&mut self, service: &AttributeId) -> Result<(), AdapterError> {
        self.record("register_local_service")?;
        if !self.local_attributes.contains_key(service) {
            return Err(AdapterError::DoesNotExist);
        }
        self.registered_services.insert(service.clone());
        Ok(())
    }

    async fn unregister_local_service(
        &mut self,
        service: &AttributeId,
    ) -> Result<(), AdapterError> {
        self.record("unregister_local_service")?;
        self.registered_services.remove(service);
        Ok(())
    }

    fn delete_local_service(&mut self, service: &AttributeId) -> Result<(), AdapterError> {
        if self.local_attributes.remove(service).is_none() {
            return Err(AdapterError::DoesNotExist);
        }
        self.registered_services.remove(service);
        let children: Vec<AttributeId> = self
            .local_attributes
            .iter()
            .filter(|(_, attr)| attr.parent.as_ref() == Some(service))
            .map(|(id, _)| id.clone())
            .collect();
        for child in children {
            let grandchildren: Vec<AttributeId> = self
                .local_attributes
                .iter()
                .filter(|(_, attr)| attr.parent.as_ref() == Some(&child))
                .map(|(id, _)| id.clone())
                .collect();
            for gc in grandchildren {
                self.local_attributes.remove(&gc);
            }
            self.local_attributes.remove(&child);
        }
        Ok(())
    }

    async fn register_advertisement(
        &mut self,
        data: AdvertisementData,
    ) -> Result<AdvertisementId, AdapterError> {
        self.record("register_advertisement")?;
        self.require_powered()?;
        let id = AdvertisementId(self.next_advertisement);
        self.next_advertisement += 1;
        self.advertisements.insert(id, data);
        Ok(id)
    }

    async fn unregister_advertisement(
        &mut self,
        id: AdvertisementId,
    ) -> Result<(), AdapterError> {
        self.record("unregister_advertisement")?;
        if self.advertisements.remove(&id).is_none() {
            return Err(AdapterError::DoesNotExist);
        }
        Ok(())
    }

    async fn create_service_record(&mut self, record: SdpRecord) -> Result<u32, AdapterError> {
        self.record("create_service_record")?;
        let handle = self.next_record_handle;
        self.next_record_handle += 1;
        self.sdp_records.insert(handle, record);
        Ok(handle)
    }

    async fn remove_service_record(&mut self, handle: u32) -> Result<(), AdapterError> {
        self.record("remove_service_record")?;
        if self.sdp_records.remove(&handle).is_none() {
            return Err(AdapterError::DoesNotExist);
        }
        Ok(())
    }

    fn service_records(
        &self,
        address: &DeviceAddress,
        uuid: Option<Uuid>,
    ) -> Result<Vec<SdpRecord>, AdapterError> {
        if !self.devices.contains_key(address) {
            return Err(AdapterError::DoesNotExist);
        }
        let records = self
            .sdp_records
            .values()
            .filter(|r| uuid.map_or(true, |u| r.service_class_uuids.contains(&u)))
            .cloned()
            .collect();
        Ok(records)
    }
}
