//! Connection and notify-session bookkeeping.
//!
//! The registry owns no platform objects. It tracks which devices the
//! bridge holds a GATT connection to and which characteristics have an
//! active notify session, so both can be torn down deterministically when
//! a connection drops or the client goes away.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::domain::models::{AttributeId, DeviceAddress};

/// An active characteristic notification subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySession {
    pub address: DeviceAddress,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub characteristic: AttributeId,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashSet<DeviceAddress>,
    sessions: HashMap<AttributeId, NotifySession>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_connection(&mut self, address: DeviceAddress) {
        self.connections.insert(address);
    }

    pub fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.connections.contains(address)
    }

    pub fn connected_devices(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.connections.iter()
    }

    /// Drop the connection entry and detach every notify session that was
    /// riding on it. The sessions are returned so the caller can stop them
    /// on the platform; the map entries are already gone by then.
    pub fn connection_closed(&mut self, address: &DeviceAddress) -> Vec<NotifySession> {
        self.connections.remove(address);
        let stale: Vec<AttributeId> = self
            .sessions
            .iter()
            .filter(|(_, s)| &s.address == address)
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .collect()
    }

    pub fn add_notify_session(&mut self, session: NotifySession) {
        self.sessions.insert(session.characteristic.clone(), session);
    }

    pub fn has_notify_session(&self, characteristic: &AttributeId) -> bool {
        self.sessions.contains_key(characteristic)
    }

    /// Remove and return the session for `characteristic`. The entry is
    /// erased before the platform stop call is made so a value-changed
    /// event arriving mid-stop finds no session to report against.
    pub fn take_notify_session(&mut self, characteristic: &AttributeId) -> Option<NotifySession> {
        self.sessions.remove(characteristic)
    }

    pub fn notify_session(&self, characteristic: &AttributeId) -> Option<&NotifySession> {
        self.sessions.get(characteristic)
    }

    /// Remove every session and connection, returning the sessions for
    /// platform teardown. Used when the client connection terminates.
    pub fn drain(&mut self) -> Vec<NotifySession> {
        self.connections.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }
}
