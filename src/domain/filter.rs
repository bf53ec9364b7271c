//! Scan filters and device matching.
//!
//! A request carries a sequence of filters. A device matches the sequence
//! if it matches at least one filter; within one filter every present
//! field must match.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::DeviceInfo;

/// Longest name or name prefix a filter may carry, in bytes.
pub const MAX_FILTER_NAME_LENGTH: usize = 29;

/// One scan filter. A filter with no fields at all is invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    /// A filter is invalid when every field is absent, or when a name or
    /// prefix exceeds [`MAX_FILTER_NAME_LENGTH`].
    pub fn is_empty_or_invalid(&self) -> bool {
        let empty = self.name.is_none() && self.name_prefix.is_none() && self.services.is_empty();
        let too_long = |s: &Option<String>| s.as_ref().map_or(false, |n| n.len() > MAX_FILTER_NAME_LENGTH);
        empty
            || too_long(&self.name)
            || too_long(&self.name_prefix)
            || self.name_prefix.as_ref().map_or(false, |p| p.is_empty())
    }

    /// Whether `device` matches every present field of this filter.
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        if self.is_empty_or_invalid() {
            return false;
        }

        if let Some(ref name) = self.name {
            if device.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }

        if let Some(ref prefix) = self.name_prefix {
            match device.name {
                Some(ref device_name) if device_name.starts_with(prefix.as_str()) => {}
                _ => return false,
            }
        }

        for service in &self.services {
            if !device.service_uuids.contains(service) {
                return false;
            }
        }

        true
    }
}

/// A sequence of filters with OR semantics across its members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilterSequence(pub Vec<ScanFilter>);

impl ScanFilterSequence {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_empty_or_invalid_filter(&self) -> bool {
        self.0.iter().any(|f| f.is_empty_or_invalid())
    }

    pub fn matches(&self, device: &DeviceInfo) -> bool {
        if self.has_empty_or_invalid_filter() {
            return false;
        }
        self.0.iter().any(|f| f.matches(device))
    }

    /// Union of every service UUID named by any filter, used to build the
    /// platform discovery filter.
    pub fn all_service_uuids(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = self.0.iter().flat_map(|f| f.services.iter().copied()).collect();
        uuids.sort();
        uuids.dedup();
        uuids
    }
}
