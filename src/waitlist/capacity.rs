use crate::domain::Capacity;
use crate::store::WaitlistStore;
use crate::{LobbyError, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

/// Computes how many tickets an event can still hand out.
///
/// Always recomputed from committed state; a cached answer here could
/// oversell. Capacity is counted in ticket units throughout: an entry with
/// `quantity` N holds N units while its offer is active.
pub struct CapacityAccountant {
    store: Arc<dyn WaitlistStore>,
}

impl CapacityAccountant {
    pub fn new(store: Arc<dyn WaitlistStore>) -> Self {
        Self { store }
    }

    pub fn available_capacity(&self, event_id: &str) -> Result<Capacity> {
        let event = self
            .store
            .event(event_id)?
            .ok_or_else(|| LobbyError::not_found(format!("event {}", event_id)))?;

        let total = match event.capacity() {
            Capacity::Unbounded => return Ok(Capacity::Unbounded),
            Capacity::Bounded(total) => total,
        };

        let committed = self.store.committed_ticket_count(event_id)?;
        if committed > total {
            // Sold tickets can never legitimately exceed the total; offers
            // can transiently, which is why they are not part of this check.
            error!(
                "event {} has {} committed tickets against a total of {}",
                event_id, committed, total
            );
            return Err(LobbyError::CapacityExceeded {
                event_id: event_id.to_string(),
                committed,
                total,
            });
        }

        let active_offers = self.store.active_offer_quantity(event_id, Utc::now())?;
        Ok(Capacity::Bounded(total - committed - active_offers))
    }
}
