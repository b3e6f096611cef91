use crate::domain::{EntryStatus, QueuePosition};
use crate::store::WaitlistStore;
use crate::{LobbyError, Result};
use std::sync::Arc;

/// Reports a user's rank within an event's queue.
pub struct PositionCalculator {
    store: Arc<dyn WaitlistStore>,
}

impl PositionCalculator {
    pub fn new(store: Arc<dyn WaitlistStore>) -> Self {
        Self { store }
    }

    /// None when the user holds no live entry. Position counts waiting and
    /// offered entries in the same FIFO order the scheduler promotes in, so
    /// position 1 is always the next entry to be offered.
    pub fn queue_position(&self, event_id: &str, user_id: &str) -> Result<Option<QueuePosition>> {
        self.store
            .event(event_id)?
            .ok_or_else(|| LobbyError::not_found(format!("event {}", event_id)))?;

        let entry = match self.store.active_entry_for_user(event_id, user_id)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let ahead = self
            .store
            .entries_for_event(event_id)?
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Waiting | EntryStatus::Offered))
            .filter(|e| e.fifo_key() < entry.fifo_key())
            .count();

        Ok(Some(QueuePosition {
            position: ahead + 1,
            entry,
        }))
    }
}
