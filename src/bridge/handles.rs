//! Attribute handle allocation.
//!
//! The client protocol addresses local GATT attributes with 16-bit handles
//! while the platform hands out opaque string identifiers. This allocator
//! owns the mapping in both directions. Handles are assigned from a
//! monotonically increasing counter and are never reused after release, so
//! a stale handle held by the client can never alias a newer attribute.

use std::collections::HashMap;

use crate::domain::models::AttributeId;

/// Largest handle the protocol can carry.
pub const MAX_HANDLE: u16 = 0xFFFF;

#[derive(Debug, Default)]
pub struct HandleAllocator {
    next: u16,
    by_handle: HashMap<u16, AttributeId>,
    by_id: HashMap<AttributeId, u16>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `count` more handles can still be assigned. Multi-handle
    /// requests must check this before allocating anything so a request
    /// either gets all of its handles or none.
    pub fn is_available(&self, count: u16) -> bool {
        u32::from(self.next) + u32::from(count) <= u32::from(MAX_HANDLE)
    }

    /// Assign the next handle to `id`. Returns `None` once the space is
    /// exhausted; the counter never wraps.
    pub fn allocate(&mut self, id: AttributeId) -> Option<u16> {
        let handle = self.allocate_unmapped()?;
        self.by_handle.insert(handle, id.clone());
        self.by_id.insert(id, handle);
        Some(handle)
    }

    /// Assign a handle with no identifier behind it. Used for attributes
    /// the bridge acknowledges but never creates on the platform.
    pub fn allocate_unmapped(&mut self) -> Option<u16> {
        if !self.is_available(1) {
            return None;
        }
        self.next += 1;
        Some(self.next)
    }

    pub fn resolve(&self, handle: u16) -> Option<&AttributeId> {
        self.by_handle.get(&handle)
    }

    pub fn handle_for(&self, id: &AttributeId) -> Option<u16> {
        self.by_id.get(id).copied()
    }

    /// Remove both directions of the mapping. Releasing an unknown or
    /// unmapped handle is a no-op.
    pub fn release(&mut self, handle: u16) {
        if let Some(id) = self.by_handle.remove(&handle) {
            self.by_id.remove(&id);
        }
    }
}
