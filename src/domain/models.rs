//! Core data model shared by the bridge, discovery and chooser components.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A canonical Bluetooth device address, "XX:XX:XX:XX:XX:XX" uppercase.
///
/// The address is the stable unique key for a device; components never hold
/// platform device objects across async boundaries, only addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bluetooth address: {}", self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for DeviceAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: Vec<&str> = s.split(':').collect();
        if bytes.len() != 6
            || bytes
                .iter()
                .any(|b| b.len() != 2 || !b.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(InvalidAddress(s.to_string()));
        }
        Ok(DeviceAddress(s.to_ascii_uppercase()))
    }
}

/// Opaque platform identifier for a GATT object.
///
/// Identifiers are minted by the platform stack (e.g. BlueZ object paths)
/// and must never be interpreted, only compared and looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeId(pub String);

impl AttributeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short 16-bit id derived from the last four hex digits of the
    /// identifier, used when flattening the remote GATT DB. Identifiers
    /// without a hex suffix map to 0.
    pub fn short_id(&self) -> u16 {
        let s = self.0.as_str();
        if s.len() < 4 {
            return 0;
        }
        u16::from_str_radix(&s[s.len() - 4..], 16).unwrap_or(0)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

bitflags! {
    /// Transport(s) a device was seen on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Transport: u8 {
        const CLASSIC = 0b01;
        const LE      = 0b10;
        const DUAL    = 0b11;
    }
}

bitflags! {
    /// GATT characteristic property bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CharacteristicProperties: u32 {
        const BROADCAST                   = 0b0000_0000_1;
        const READ                        = 0b0000_0001_0;
        const WRITE_WITHOUT_RESPONSE      = 0b0000_0010_0;
        const WRITE                       = 0b0000_0100_0;
        const NOTIFY                      = 0b0000_1000_0;
        const INDICATE                    = 0b0001_0000_0;
        const AUTHENTICATED_SIGNED_WRITES = 0b0010_0000_0;
        const RELIABLE_WRITE              = 0b0100_0000_0;
        const WRITABLE_AUXILIARIES        = 0b1000_0000_0;
    }
}

bitflags! {
    /// GATT attribute permission bits, encrypted/authenticated variants
    /// included so that "any read permission" checks stay a single mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttributePermissions: u32 {
        const READ                          = 0b000001;
        const READ_ENCRYPTED                = 0b000010;
        const READ_ENCRYPTED_AUTHENTICATED  = 0b000100;
        const WRITE                         = 0b001000;
        const WRITE_ENCRYPTED               = 0b010000;
        const WRITE_ENCRYPTED_AUTHENTICATED = 0b100000;
    }
}

impl AttributePermissions {
    pub const ANY_READ: AttributePermissions = AttributePermissions::READ
        .union(AttributePermissions::READ_ENCRYPTED)
        .union(AttributePermissions::READ_ENCRYPTED_AUTHENTICATED);
    pub const ANY_WRITE: AttributePermissions = AttributePermissions::WRITE
        .union(AttributePermissions::WRITE_ENCRYPTED)
        .union(AttributePermissions::WRITE_ENCRYPTED_AUTHENTICATED);

    pub fn allows_read(&self) -> bool {
        self.intersects(Self::ANY_READ)
    }

    pub fn allows_write(&self) -> bool {
        self.intersects(Self::ANY_WRITE)
    }
}

/// Snapshot of a remote device as known to the adapter.
///
/// The inquiry RSSI and the advertised data maps are only meaningful while
/// a scan is active; they go stale the moment discovery stops.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub transport: Transport,
    pub paired: bool,
    pub connected: bool,
    pub services_resolved: bool,
    pub last_seen: SystemTime,
    pub inquiry_rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub advertising_flags: Option<u8>,
}

impl DeviceInfo {
    pub fn new(address: DeviceAddress) -> Self {
        DeviceInfo {
            address,
            name: None,
            transport: Transport::LE,
            paired: false,
            connected: false,
            services_resolved: false,
            last_seen: SystemTime::now(),
            inquiry_rssi: None,
            service_uuids: Vec::new(),
            service_data: HashMap::new(),
            manufacturer_data: HashMap::new(),
            advertising_flags: None,
        }
    }
}

/// A remote (client-side) GATT service as enumerated through the facade.
#[derive(Debug, Clone)]
pub struct RemoteService {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub primary: bool,
}

/// A remote GATT characteristic.
#[derive(Debug, Clone)]
pub struct RemoteCharacteristic {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
}

/// A remote GATT descriptor.
#[derive(Debug, Clone)]
pub struct RemoteDescriptor {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub permissions: AttributePermissions,
}

/// The Client Characteristic Configuration descriptor UUID (0x2902).
pub fn ccc_descriptor_uuid() -> Uuid {
    Uuid::parse_str("00002902-0000-1000-8000-00805f9b34fb").expect("well-known UUID")
}

/// Payload for a platform advertisement registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub include_tx_power: bool,
}

/// Platform token for a registered advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisementId(pub u64);

/// A minimal SDP record: the service class id list plus named attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpRecord {
    pub service_class_uuids: Vec<Uuid>,
    pub service_name: Option<String>,
    pub channel: Option<u8>,
}

impl SdpRecord {
    /// A record without a service class id list cannot be registered.
    pub fn has_service_class_id_list(&self) -> bool {
        !self.service_class_uuids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parses_and_canonicalizes() {
        let addr: DeviceAddress = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:00:11:22");
    }

    #[test]
    fn address_rejects_malformed_input() {
        assert!("aa:bb:cc:00:11".parse::<DeviceAddress>().is_err());
        assert!("aa:bb:cc:00:11:2".parse::<DeviceAddress>().is_err());
        assert!("zz:bb:cc:00:11:22".parse::<DeviceAddress>().is_err());
        assert!("aabbcc001122".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn short_id_reads_trailing_hex() {
        assert_eq!(AttributeId("dev_AA/service001a".into()).short_id(), 0x001a);
        assert_eq!(AttributeId("x".into()).short_id(), 0);
        assert_eq!(AttributeId("nothex".into()).short_id(), 0);
    }

    #[test]
    fn permission_masks_cover_encrypted_variants() {
        let perms = AttributePermissions::READ_ENCRYPTED;
        assert!(perms.allows_read());
        assert!(!perms.allows_write());
        let perms = AttributePermissions::WRITE_ENCRYPTED_AUTHENTICATED;
        assert!(perms.allows_write());
    }
}
