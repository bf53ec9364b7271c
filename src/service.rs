//! Bridge event loop.
//!
//! One task owns the adapter and every component, so every request and
//! every platform callback runs on a single logical thread of control.
//! The loop selects over the client channel, the adapter event stream,
//! embedder commands, the pending chooser outcome, and the earliest
//! discovery deadline.
//!
//! Forwarded local-attribute requests are the one place the loop must not
//! await inline: the answer comes from the untrusted client, and awaiting
//! it would let a stalled client wedge every other operation. Their
//! responders are parked in a pending map keyed by request id instead.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::blocklist::Blocklist;
use crate::bridge::GattBridge;
use crate::chooser::{
    ChooserOptions, ChooserOutcome, ChooserPresentation, ChooserResponse, DeviceChooser,
};
use crate::discovery::{DiscoveryController, DiscoveryEvent};
use crate::domain::filter::ScanFilterSequence;
use crate::domain::models::{AttributeId, DeviceInfo, Transport};
use crate::domain::settings::Settings;
use crate::error::{AdapterError, BridgeError};
use crate::infrastructure::adapter::{
    AdapterEvent, AdapterFacade, DiscoveryFilter, LocalReadResponder, LocalWriteResponder,
    RemoteStatusReceiver, RemoteValueReceiver,
};
use crate::protocol::{
    AdapterProperties, ClientChannel, ClientEvent, ClientMessage, DeviceSummary, GattStatus,
    RequestOp, ResponsePayload, ServerRequestOp,
};

/// Embedder-side commands into the loop.
pub enum ServiceCommand {
    ChooseDevice {
        options: ChooserOptions,
        presentation: Box<dyn ChooserPresentation>,
        responder: oneshot::Sender<Result<ChooserOutcome, BridgeError>>,
    },
    ChooserResponse(ChooserResponse),
    Shutdown,
}

/// Cloneable handle for talking to a running [`BridgeService`].
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<ServiceCommand>,
}

impl ServiceHandle {
    /// Run one modal device-selection flow to completion. The command is
    /// queued before this returns, so a [`ServiceHandle::chooser_response`]
    /// sent right after is ordered behind it.
    pub fn choose_device(
        &self,
        options: ChooserOptions,
        presentation: Box<dyn ChooserPresentation>,
    ) -> impl std::future::Future<Output = Result<ChooserOutcome, BridgeError>> {
        let (responder, rx) = oneshot::channel();
        let sent = self
            .commands
            .send(ServiceCommand::ChooseDevice {
                options,
                presentation,
                responder,
            })
            .is_ok();
        async move {
            if !sent {
                return Err(BridgeError::NotFound("bridge service"));
            }
            rx.await
                .unwrap_or(Err(BridgeError::NotFound("bridge service")))
        }
    }

    pub fn chooser_response(&self, response: ChooserResponse) {
        let _ = self.commands.send(ServiceCommand::ChooserResponse(response));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ServiceCommand::Shutdown);
    }
}

enum PendingResponder {
    Read(LocalReadResponder),
    Write(LocalWriteResponder),
}

enum RemoteOutcome {
    Value(Result<Vec<u8>, AdapterError>),
    Status(Result<(), AdapterError>),
}

/// Finished remote value transfer, funneled back into the loop by the
/// task parked on its completion channel.
struct RemoteCompletion {
    request_id: u64,
    attribute: AttributeId,
    outcome: RemoteOutcome,
}

pub struct BridgeService {
    adapter: Box<dyn AdapterFacade>,
    bridge: GattBridge,
    discovery: DiscoveryController,
    blocklist: Blocklist,
    chooser: Option<DeviceChooser>,
    chooser_responder: Option<oneshot::Sender<Result<ChooserOutcome, BridgeError>>>,
    chooser_scan_duration: Duration,
    rssi_floor: i16,
    rssi_ceiling: i16,
    client: ClientChannel,
    le_scan_filters: Option<ScanFilterSequence>,
    // End of a timed discoverability window, if one is running.
    discoverable_deadline: Option<Instant>,
    pending_server_requests: HashMap<u64, PendingResponder>,
    next_server_request_id: u64,
    remote_completions_tx: mpsc::UnboundedSender<RemoteCompletion>,
    remote_completions_rx: mpsc::UnboundedReceiver<RemoteCompletion>,
    // Fatal error noted while building a response; checked after the
    // response is sent so the client still sees a status before teardown.
    pending_fatal: Option<BridgeError>,
}

impl BridgeService {
    pub fn new(
        adapter: Box<dyn AdapterFacade>,
        client: ClientChannel,
        settings: &Settings,
    ) -> (Self, ServiceHandle, mpsc::UnboundedReceiver<ServiceCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (remote_completions_tx, remote_completions_rx) = mpsc::unbounded_channel();
        let blocklist = Blocklist::with_extra(&settings.extra_blocklist);
        let service = Self {
            adapter,
            bridge: GattBridge::new(settings.max_advertisements, blocklist.clone()),
            discovery: DiscoveryController::new(Duration::from_secs(
                settings.discovery_timeout_secs,
            )),
            blocklist,
            chooser: None,
            chooser_responder: None,
            chooser_scan_duration: Duration::from_secs(settings.chooser_scan_duration_secs),
            rssi_floor: settings.rssi_floor,
            rssi_ceiling: settings.rssi_ceiling,
            client,
            le_scan_filters: None,
            discoverable_deadline: None,
            pending_server_requests: HashMap::new(),
            next_server_request_id: 1,
            remote_completions_tx,
            remote_completions_rx,
            pending_fatal: None,
        };
        let handle = ServiceHandle {
            commands: command_tx,
        };
        (service, handle, command_rx)
    }

    /// Drive the bridge until the client channel closes, a protocol
    /// violation terminates it, or a shutdown command arrives.
    pub async fn run(
        mut self,
        mut client_rx: mpsc::UnboundedReceiver<ClientMessage>,
        mut adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
        mut commands: mpsc::UnboundedReceiver<ServiceCommand>,
    ) {
        let mut chooser_outcome: Option<oneshot::Receiver<ChooserOutcome>> = None;
        info!(version = self.client.version(), "client attached");

        loop {
            let deadline = earliest(
                earliest(
                    self.discovery.deadline(),
                    self.chooser.as_ref().and_then(|c| c.deadline()),
                ),
                self.discoverable_deadline,
            );

            tokio::select! {
                message = client_rx.recv() => {
                    match message {
                        Some(message) => {
                            if let Err(fatal) = self.handle_client_message(message).await {
                                error!(%fatal, "terminating client connection");
                                break;
                            }
                        }
                        None => {
                            info!("client channel closed");
                            break;
                        }
                    }
                }
                event = adapter_events.recv() => {
                    match event {
                        Some(event) => self.handle_adapter_event(event).await,
                        None => {
                            warn!("adapter event stream closed");
                            break;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(ServiceCommand::Shutdown) | None => break,
                        Some(command) => {
                            if let Some(rx) = self.handle_command(command).await {
                                chooser_outcome = Some(rx);
                            }
                        }
                    }
                }
                outcome = recv_outcome(&mut chooser_outcome) => {
                    chooser_outcome = None;
                    self.finish_chooser(outcome).await;
                }
                // Never yields None: the loop holds a sender.
                Some(completion) = self.remote_completions_rx.recv() => {
                    self.finish_remote_transfer(completion);
                }
                _ = sleep_until_opt(deadline) => {
                    self.handle_deadlines().await;
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.bridge.client_detached(self.adapter.as_mut()).await;
        if let Err(error) = self.discovery.cancel(self.adapter.as_mut()).await {
            warn!(%error, "failed to stop discovery at teardown");
        }
        if let Some(mut chooser) = self.chooser.take() {
            chooser
                .on_response(self.adapter.as_mut(), ChooserResponse::Cancelled)
                .await;
        }
        info!("bridge service stopped");
    }

    // --- deadlines -----------------------------------------------------------

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();
        if self.discovery.deadline().is_some_and(|d| d <= now) {
            let events = self.discovery.on_timeout(self.adapter.as_mut()).await;
            self.publish_discovery_events(events);
        }
        if let Some(chooser) = self.chooser.as_mut() {
            if chooser.deadline().is_some_and(|d| d <= now) {
                chooser.on_timeout(self.adapter.as_mut()).await;
            }
        }
        if self.discoverable_deadline.is_some_and(|d| d <= now) {
            self.discoverable_deadline = None;
            if let Err(error) = self.adapter.set_discoverable(false, 0).await {
                warn!(%error, "failed to end discoverability window");
            }
            let properties = self.adapter_properties();
            self.client.send_event(ClientEvent::AdapterProperties(properties));
        }
    }

    fn publish_discovery_events(&mut self, events: Vec<DiscoveryEvent>) {
        for event in events {
            match event {
                DiscoveryEvent::Started => {
                    self.client
                        .send_event(ClientEvent::DiscoveryStateChanged { discovering: true });
                }
                DiscoveryEvent::Stopped => {
                    self.client
                        .send_event(ClientEvent::DiscoveryStateChanged { discovering: false });
                }
                DiscoveryEvent::DeviceFound(device) => {
                    self.publish_device(&device);
                }
            }
        }
    }

    fn publish_device(&mut self, device: &DeviceInfo) {
        if let Some(filters) = &self.le_scan_filters {
            if !filters.matches(device) {
                return;
            }
        }
        let summary = DeviceSummary::from(device);
        let event = if device.transport.contains(Transport::LE) {
            ClientEvent::LeDeviceFound { device: summary }
        } else {
            ClientEvent::DeviceFound(summary)
        };
        self.client.send_event(event);
    }

    // --- adapter events --------------------------------------------------------

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::AdapterPresentChanged(_) | AdapterEvent::AdapterPoweredChanged(_) => {
                let powered = self.adapter.is_powered();
                let properties = self.adapter_properties();
                self.client.send_event(ClientEvent::AdapterProperties(properties));
                if let Some(chooser) = self.chooser.as_mut() {
                    chooser
                        .on_adapter_power_changed(self.adapter.as_mut(), powered)
                        .await;
                }
            }
            AdapterEvent::DeviceAdded(device) | AdapterEvent::DeviceChanged(device) => {
                if self.discovery.is_active() {
                    self.publish_device(&device);
                }
                let connected = self.bridge.is_connected(&device.address);
                if let Some(chooser) = self.chooser.as_mut() {
                    chooser.on_device_updated(&device, connected);
                }
            }
            AdapterEvent::DeviceRemoved(address) => {
                self.bridge
                    .on_connection_lost(self.adapter.as_mut(), &address)
                    .await;
            }
            AdapterEvent::DeviceConnectionChanged { address, connected } => {
                if !connected {
                    self.bridge
                        .on_connection_lost(self.adapter.as_mut(), &address)
                        .await;
                }
                self.client
                    .send_event(ClientEvent::LeConnectionStateChange { address, connected });
            }
            AdapterEvent::DevicePairedChanged { address, paired } => {
                self.client.send_event(ClientEvent::BondStateChanged {
                    address,
                    bonded: paired,
                    status: GattStatus::Success,
                });
            }
            AdapterEvent::GattServicesResolved { address } => {
                let uuids = self
                    .adapter
                    .gatt_services(&address)
                    .map(|services| services.into_iter().map(|s| s.uuid).collect())
                    .unwrap_or_default();
                self.client.send_event(ClientEvent::SearchComplete {
                    address,
                    status: GattStatus::Success,
                    uuids,
                });
            }
            AdapterEvent::CharacteristicValueChanged {
                address,
                characteristic,
                value,
            } => {
                // Only registered characteristics reach the client.
                if let Some(session) = self.bridge.notify_session(&characteristic) {
                    self.client.send_event(ClientEvent::GattNotify {
                        address,
                        service_uuid: session.service_uuid,
                        characteristic_uuid: session.characteristic_uuid,
                        value,
                    });
                }
            }
            AdapterEvent::LocalReadRequest {
                address,
                attribute,
                offset,
                is_long,
                responder,
            } => {
                let Some(handle) = self.bridge.local_handle(&attribute) else {
                    error!(%attribute, "local read for an attribute with no handle");
                    let _ = responder.send(Err(AdapterError::DoesNotExist));
                    return;
                };
                let id = self.next_server_request_id;
                self.next_server_request_id += 1;
                let sent = self.client.send_server_request(
                    id,
                    ServerRequestOp::ReadLocalAttribute {
                        address,
                        handle,
                        offset,
                        is_long,
                    },
                );
                if sent {
                    self.pending_server_requests
                        .insert(id, PendingResponder::Read(responder));
                } else {
                    let _ = responder.send(Err(AdapterError::NotSupported));
                }
            }
            AdapterEvent::LocalWriteRequest {
                address,
                attribute,
                offset,
                value,
                responder,
            } => {
                let Some(handle) = self.bridge.local_handle(&attribute) else {
                    error!(%attribute, "local write for an attribute with no handle");
                    let _ = responder.send(Err(AdapterError::DoesNotExist));
                    return;
                };
                let id = self.next_server_request_id;
                self.next_server_request_id += 1;
                let sent = self.client.send_server_request(
                    id,
                    ServerRequestOp::WriteLocalAttribute {
                        address,
                        handle,
                        offset,
                        value,
                    },
                );
                if sent {
                    self.pending_server_requests
                        .insert(id, PendingResponder::Write(responder));
                } else {
                    let _ = responder.send(Err(AdapterError::NotSupported));
                }
            }
        }
    }

    fn adapter_properties(&self) -> AdapterProperties {
        AdapterProperties {
            present: self.adapter.is_present(),
            powered: self.adapter.is_powered(),
            discoverable: self.adapter.is_discoverable(),
            address: self.adapter.address(),
            name: self.adapter.name(),
        }
    }

    // --- client requests ----------------------------------------------------------

    /// Returns `Err` only for fatal protocol violations; the connection is
    /// then torn down.
    async fn handle_client_message(&mut self, message: ClientMessage) -> Result<(), BridgeError> {
        match message {
            ClientMessage::Request { id, op } => {
                // `None` means the response is deferred to a parked
                // transfer completion.
                if let Some(payload) = self.dispatch_request(id, op).await {
                    self.client.send_response(id, payload);
                }
                match self.pending_fatal.take() {
                    Some(error) => Err(error),
                    None => Ok(()),
                }
            }
            ClientMessage::ServerResponse { id, status, value } => {
                let Some(pending) = self.pending_server_requests.remove(&id) else {
                    return Err(BridgeError::ProtocolViolation(format!(
                        "response for unknown server request {id}"
                    )));
                };
                match pending {
                    PendingResponder::Read(responder) => {
                        let result = if status == GattStatus::Success {
                            Ok(value)
                        } else {
                            Err(AdapterError::Failed(format!("client reported {status:?}")))
                        };
                        let _ = responder.send(result);
                    }
                    PendingResponder::Write(responder) => {
                        let result = if status == GattStatus::Success {
                            Ok(())
                        } else {
                            Err(AdapterError::Failed(format!("client reported {status:?}")))
                        };
                        let _ = responder.send(result);
                    }
                }
                Ok(())
            }
        }
    }

    /// `None` defers the response: a parked transfer completion will
    /// answer the same request id later.
    async fn dispatch_request(&mut self, id: u64, op: RequestOp) -> Option<ResponsePayload> {
        let adapter = self.adapter.as_mut();
        let payload = match op {
            RequestOp::EnableAdapter => status_payload(
                &mut self.pending_fatal,
                adapter.set_powered(true).await.map_err(Into::into),
            ),
            RequestOp::DisableAdapter => status_payload(
                &mut self.pending_fatal,
                adapter.set_powered(false).await.map_err(Into::into),
            ),
            RequestOp::GetAdapterProperties => {
                ResponsePayload::AdapterProperties(self.adapter_properties())
            }
            RequestOp::SetAdapterName { name } => status_payload(
                &mut self.pending_fatal,
                adapter.set_name(name).await.map_err(Into::into),
            ),
            RequestOp::SetDiscoverable { discoverable, timeout_secs } => {
                let result = adapter
                    .set_discoverable(discoverable, timeout_secs)
                    .await
                    .map_err(Into::into);
                if result.is_ok() {
                    self.discoverable_deadline = (discoverable && timeout_secs > 0)
                        .then(|| Instant::now() + Duration::from_secs(timeout_secs.into()));
                }
                status_payload(&mut self.pending_fatal, result)
            }
            RequestOp::StartDiscovery => {
                let result = self.discovery.start(adapter, DiscoveryFilter::default()).await;
                self.finish_discovery_request(result)
            }
            RequestOp::CancelDiscovery => {
                let result = self.discovery.cancel(adapter).await;
                self.finish_discovery_request(result)
            }
            RequestOp::StartLeScan { filters } => {
                let filter = DiscoveryFilter {
                    transport: Some(Transport::LE),
                    service_uuids: filters.all_service_uuids(),
                    rssi_threshold: None,
                };
                let result = self.discovery.start(adapter, filter).await;
                if result.is_ok() {
                    // A scan restarted without filters replaces any
                    // narrower set from the previous start.
                    self.le_scan_filters = (!filters.is_empty()).then_some(filters);
                }
                self.finish_discovery_request(result)
            }
            RequestOp::StopLeScan => {
                self.le_scan_filters = None;
                let result = self.discovery.cancel(adapter).await;
                self.finish_discovery_request(result)
            }
            RequestOp::CreateBond { address, transport } => status_payload(
                &mut self.pending_fatal,
                self.bridge.create_bond(adapter, &address, transport).await,
            ),
            RequestOp::RemoveBond { address } => status_payload(
                &mut self.pending_fatal,
                self.bridge.remove_bond(adapter, &address).await,
            ),
            RequestOp::CancelBond { address } => status_payload(
                &mut self.pending_fatal,
                self.bridge.cancel_bond(adapter, &address).await,
            ),
            RequestOp::ConnectLeDevice { address } => status_payload(
                &mut self.pending_fatal,
                self.bridge.connect_le_device(adapter, &address).await,
            ),
            RequestOp::DisconnectLeDevice { address } => status_payload(
                &mut self.pending_fatal,
                self.bridge.disconnect_le_device(adapter, &address).await,
            ),
            RequestOp::SearchService { address } => {
                let result = self.bridge.search_services(adapter, &address).await;
                let status = GattStatus::from(&result);
                if let Ok(uuids) = result {
                    self.client.send_event(ClientEvent::SearchComplete {
                        address,
                        status,
                        uuids,
                    });
                }
                ResponsePayload::Status(status)
            }
            RequestOp::GetGattDb { address } => {
                let result = self.bridge.get_gatt_db(adapter, &address);
                let status = GattStatus::from(&result);
                ResponsePayload::GattDb {
                    status,
                    elements: result.unwrap_or_default(),
                }
            }
            RequestOp::ReadGattCharacteristic { address, path } => {
                match self.bridge.read_characteristic(
                    adapter,
                    &address,
                    path.service,
                    path.characteristic,
                ) {
                    Ok((attribute, completion)) => {
                        self.park_remote_read(id, attribute, completion);
                        return None;
                    }
                    Err(error) => value_payload(&mut self.pending_fatal, Err(error)),
                }
            }
            RequestOp::WriteGattCharacteristic { address, path, value, offset } => {
                match self.bridge.write_characteristic(
                    adapter,
                    &address,
                    path.service,
                    path.characteristic,
                    value,
                    offset,
                ) {
                    Ok((attribute, completion)) => {
                        self.park_remote_write(id, attribute, completion);
                        return None;
                    }
                    Err(error) => status_payload(&mut self.pending_fatal, Err(error)),
                }
            }
            RequestOp::ReadGattDescriptor { address, path } => {
                let Some(descriptor) = path.descriptor else {
                    return Some(ResponsePayload::Value {
                        status: GattStatus::NotFound,
                        value: Vec::new(),
                    });
                };
                match self.bridge.read_descriptor(
                    adapter,
                    &address,
                    path.service,
                    path.characteristic,
                    descriptor,
                ) {
                    Ok((attribute, completion)) => {
                        self.park_remote_read(id, attribute, completion);
                        return None;
                    }
                    Err(error) => value_payload(&mut self.pending_fatal, Err(error)),
                }
            }
            RequestOp::WriteGattDescriptor { address, path, value, offset } => {
                let Some(descriptor) = path.descriptor else {
                    return Some(ResponsePayload::Status(GattStatus::NotFound));
                };
                match self.bridge.write_descriptor(
                    adapter,
                    &address,
                    path.service,
                    path.characteristic,
                    descriptor,
                    value,
                    offset,
                ) {
                    Ok(Some((attribute, completion))) => {
                        self.park_remote_write(id, attribute, completion);
                        return None;
                    }
                    Ok(None) => ResponsePayload::Status(GattStatus::Success),
                    Err(error) => status_payload(&mut self.pending_fatal, Err(error)),
                }
            }
            RequestOp::RegisterForGattNotification { address, path } => status_payload(
                &mut self.pending_fatal,
                self.bridge
                    .register_for_notification(
                        adapter,
                        &address,
                        path.service,
                        path.characteristic,
                    )
                    .await,
            ),
            RequestOp::DeregisterForGattNotification { address, path } => status_payload(
                &mut self.pending_fatal,
                self.bridge
                    .deregister_for_notification(
                        adapter,
                        &address,
                        path.service,
                        path.characteristic,
                    )
                    .await,
            ),
            RequestOp::AddService { uuid, primary, num_handles } => handle_payload(
                &mut self.pending_fatal,
                self.bridge.add_service(adapter, uuid, primary, num_handles),
            ),
            RequestOp::AddCharacteristic { service_handle, uuid, properties, permissions } => {
                handle_payload(
                    &mut self.pending_fatal,
                    self.bridge.add_characteristic(
                        adapter,
                        service_handle,
                        uuid,
                        properties,
                        permissions,
                    ),
                )
            }
            RequestOp::AddDescriptor { service_handle, uuid, permissions } => handle_payload(
                &mut self.pending_fatal,
                self.bridge.add_descriptor(adapter, service_handle, uuid, permissions),
            ),
            RequestOp::StartService { service_handle } => status_payload(
                &mut self.pending_fatal,
                self.bridge.start_service(adapter, service_handle).await,
            ),
            RequestOp::StopService { service_handle } => status_payload(
                &mut self.pending_fatal,
                self.bridge.stop_service(adapter, service_handle).await,
            ),
            RequestOp::DeleteService { service_handle } => status_payload(
                &mut self.pending_fatal,
                self.bridge.delete_service(adapter, service_handle),
            ),
            RequestOp::ReserveAdvertisement => {
                handle_payload(&mut self.pending_fatal, self.bridge.reserve_advertisement())
            }
            RequestOp::BroadcastAdvertisement { slot, data } => status_payload(
                &mut self.pending_fatal,
                self.bridge.broadcast_advertisement(adapter, slot, data).await,
            ),
            RequestOp::ReleaseAdvertisement { slot } => status_payload(
                &mut self.pending_fatal,
                self.bridge.release_advertisement(adapter, slot).await,
            ),
            RequestOp::GetSdpRecords { address, uuid } => {
                let result = self.bridge.get_sdp_records(adapter, &address, uuid);
                let status = GattStatus::from(&result);
                ResponsePayload::SdpRecords {
                    status,
                    records: result.unwrap_or_default(),
                }
            }
            RequestOp::CreateSdpRecord { record } => {
                let result = self.bridge.create_sdp_record(adapter, record).await;
                let status = GattStatus::from(&result);
                ResponsePayload::SdpHandle {
                    status,
                    handle: result.unwrap_or(0),
                }
            }
            RequestOp::RemoveSdpRecord { handle } => status_payload(
                &mut self.pending_fatal,
                self.bridge.remove_sdp_record(adapter, handle).await,
            ),
        };
        Some(payload)
    }

    /// Park a started remote read; its completion re-enters the loop as a
    /// [`RemoteCompletion`] and answers the request from there.
    fn park_remote_read(
        &mut self,
        request_id: u64,
        attribute: AttributeId,
        completion: RemoteValueReceiver,
    ) {
        let completions = self.remote_completions_tx.clone();
        tokio::spawn(async move {
            let result = completion.await.unwrap_or(Err(AdapterError::Failed(
                "platform dropped the transfer".to_string(),
            )));
            let _ = completions.send(RemoteCompletion {
                request_id,
                attribute,
                outcome: RemoteOutcome::Value(result),
            });
        });
    }

    fn park_remote_write(
        &mut self,
        request_id: u64,
        attribute: AttributeId,
        completion: RemoteStatusReceiver,
    ) {
        let completions = self.remote_completions_tx.clone();
        tokio::spawn(async move {
            let result = completion.await.unwrap_or(Err(AdapterError::Failed(
                "platform dropped the transfer".to_string(),
            )));
            let _ = completions.send(RemoteCompletion {
                request_id,
                attribute,
                outcome: RemoteOutcome::Status(result),
            });
        });
    }

    fn finish_remote_transfer(&mut self, completion: RemoteCompletion) {
        let RemoteCompletion { request_id, attribute, outcome } = completion;
        let payload = match outcome {
            RemoteOutcome::Value(result) => value_payload(
                &mut self.pending_fatal,
                self.bridge.complete_remote_op(&attribute, result),
            ),
            RemoteOutcome::Status(result) => status_payload(
                &mut self.pending_fatal,
                self.bridge.complete_remote_op(&attribute, result),
            ),
        };
        self.client.send_response(request_id, payload);
    }

    fn finish_discovery_request(
        &mut self,
        result: Result<Vec<DiscoveryEvent>, BridgeError>,
    ) -> ResponsePayload {
        match result {
            Ok(events) => {
                self.publish_discovery_events(events);
                ResponsePayload::Status(GattStatus::Success)
            }
            Err(error) => ResponsePayload::Status(GattStatus::from(&error)),
        }
    }

    // --- chooser ---------------------------------------------------------------------

    async fn handle_command(
        &mut self,
        command: ServiceCommand,
    ) -> Option<oneshot::Receiver<ChooserOutcome>> {
        match command {
            ServiceCommand::ChooseDevice {
                options,
                presentation,
                responder,
            } => {
                if self.chooser.is_some() {
                    let _ = responder.send(Err(BridgeError::Busy));
                    return None;
                }
                if let Err(error) = options.validate(&self.blocklist) {
                    let _ = responder.send(Err(error));
                    return None;
                }
                let (outcome_tx, outcome_rx) = oneshot::channel();
                let mut chooser = DeviceChooser::new(
                    options,
                    self.chooser_scan_duration,
                    presentation,
                    outcome_tx,
                    self.rssi_floor,
                    self.rssi_ceiling,
                );
                chooser.start(self.adapter.as_mut()).await;
                self.chooser = Some(chooser);
                self.chooser_responder = Some(responder);
                Some(outcome_rx)
            }
            ServiceCommand::ChooserResponse(response) => {
                if let Some(chooser) = self.chooser.as_mut() {
                    chooser.on_response(self.adapter.as_mut(), response).await;
                }
                None
            }
            ServiceCommand::Shutdown => None,
        }
    }

    /// A selected device can vanish between selection and lookup; that is
    /// a distinct terminal error, not a generic failure.
    async fn finish_chooser(&mut self, outcome: ChooserOutcome) {
        self.chooser = None;
        let result = match outcome {
            ChooserOutcome::Selected(address) => {
                if self.adapter.device(&address).is_some() {
                    Ok(ChooserOutcome::Selected(address))
                } else {
                    Err(BridgeError::NotFound("chosen device"))
                }
            }
            other => Ok(other),
        };
        if let Some(responder) = self.chooser_responder.take() {
            let _ = responder.send(result);
        }
    }
}

/// Map a result to its wire status, parking fatal errors for teardown
/// after the response has been sent.
fn track_fatal<T>(
    fatal: &mut Option<BridgeError>,
    result: Result<T, BridgeError>,
) -> (GattStatus, Option<T>) {
    match result {
        Ok(value) => (GattStatus::Success, Some(value)),
        Err(error) => {
            let status = GattStatus::from(&error);
            if error.is_fatal() {
                *fatal = Some(error);
            }
            (status, None)
        }
    }
}

fn status_payload(
    fatal: &mut Option<BridgeError>,
    result: Result<(), BridgeError>,
) -> ResponsePayload {
    let (status, _) = track_fatal(fatal, result);
    ResponsePayload::Status(status)
}

fn value_payload(
    fatal: &mut Option<BridgeError>,
    result: Result<Vec<u8>, BridgeError>,
) -> ResponsePayload {
    let (status, value) = track_fatal(fatal, result);
    ResponsePayload::Value {
        status,
        value: value.unwrap_or_default(),
    }
}

fn handle_payload(
    fatal: &mut Option<BridgeError>,
    result: Result<u16, BridgeError>,
) -> ResponsePayload {
    let (status, handle) = track_fatal(fatal, result);
    ResponsePayload::Handle {
        status,
        handle: handle.unwrap_or(0),
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn recv_outcome(rx: &mut Option<oneshot::Receiver<ChooserOutcome>>) -> ChooserOutcome {
    match rx.as_mut() {
        Some(rx) => rx.await.unwrap_or(ChooserOutcome::Cancelled),
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
