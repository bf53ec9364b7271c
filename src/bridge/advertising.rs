//! Advertisement slot pool.
//!
//! Clients reserve a slot, broadcast into it (possibly repeatedly, each
//! broadcast replacing the previous advertisement), and release it when
//! done. The pool is bounded; reservation fails once every slot is taken.

use tracing::warn;

use crate::domain::models::{AdvertisementData, AdvertisementId};
use crate::error::BridgeError;
use crate::infrastructure::adapter::AdapterFacade;

#[derive(Debug)]
pub struct AdvertisementPool {
    capacity: usize,
    // slot -> platform advertisement, None while reserved but not broadcast
    slots: std::collections::HashMap<u16, Option<AdvertisementId>>,
}

impl AdvertisementPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: std::collections::HashMap::new(),
        }
    }

    /// Claim the lowest free slot.
    pub fn reserve(&mut self) -> Result<u16, BridgeError> {
        for slot in 0..self.capacity as u16 {
            if !self.slots.contains_key(&slot) {
                self.slots.insert(slot, None);
                return Ok(slot);
            }
        }
        Err(BridgeError::Exhausted("advertisement slots"))
    }

    /// Register `data` into `slot`, unregistering whatever the slot held
    /// before. On any platform failure the slot is left reserved-but-empty
    /// so the client can retry without re-reserving.
    pub async fn broadcast(
        &mut self,
        slot: u16,
        data: AdvertisementData,
        adapter: &mut dyn AdapterFacade,
    ) -> Result<(), BridgeError> {
        let current = match self.slots.get(&slot) {
            Some(current) => current.clone(),
            None => return Err(BridgeError::NotFound("advertisement slot")),
        };

        if let Some(old) = current {
            // Unregister the previous advertisement first. The slot is
            // emptied before the platform call so a failure here still
            // leaves it in a retryable state.
            self.slots.insert(slot, None);
            if let Err(error) = adapter.unregister_advertisement(old).await {
                warn!(slot, %error, "failed to unregister previous advertisement");
                return Err(error.into());
            }
        }

        match adapter.register_advertisement(data).await {
            Ok(id) => {
                self.slots.insert(slot, Some(id));
                Ok(())
            }
            Err(error) => {
                self.slots.insert(slot, None);
                Err(error.into())
            }
        }
    }

    /// Unregister the slot's advertisement (if any) and free the slot.
    /// Releasing an unknown slot is a no-op.
    pub async fn release(
        &mut self,
        slot: u16,
        adapter: &mut dyn AdapterFacade,
    ) -> Result<(), BridgeError> {
        match self.slots.remove(&slot) {
            Some(Some(id)) => adapter.unregister_advertisement(id).await.map_err(Into::into),
            Some(None) | None => Ok(()),
        }
    }

    /// Tear down every slot. Platform failures are logged, not reported;
    /// this only runs when the owning client is already gone.
    pub async fn release_all(&mut self, adapter: &mut dyn AdapterFacade) {
        for (slot, entry) in std::mem::take(&mut self.slots) {
            if let Some(id) = entry {
                if let Err(error) = adapter.unregister_advertisement(id).await {
                    warn!(slot, %error, "failed to unregister advertisement during teardown");
                }
            }
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.slots.len()
    }
}
