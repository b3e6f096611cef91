use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A buyer's place in an event's waiting list.
///
/// Entries are never deleted; terminal states are kept for audit and
/// position history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingListEntry {
    pub entry_id: String,
    pub event_id: String,
    pub user_id: String,
    pub ticket_type_id: String,
    pub quantity: u32,
    pub status: EntryStatus,
    /// Set while the entry holds a time-boxed purchase offer, cleared on
    /// every other status.
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Waiting,
    Offered,
    Expired,
    Purchased,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Expired | EntryStatus::Purchased)
    }
}

impl WaitingListEntry {
    pub fn new(
        event_id: impl Into<String>,
        user_id: impl Into<String>,
        ticket_type_id: impl Into<String>,
        quantity: u32,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            user_id: user_id.into(),
            ticket_type_id: ticket_type_id.into(),
            quantity,
            status: EntryStatus::Waiting,
            offer_expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the entry holds an offer that has not lapsed as of `now`.
    pub fn has_active_offer(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Offered
            && self.offer_expires_at.map(|at| at > now).unwrap_or(false)
    }

    /// Whether the offer has lapsed without being purchased or released.
    pub fn offer_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Offered
            && self.offer_expires_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Total ordering key for FIFO promotion. `created_at` leads; the entry
    /// id breaks ties so every consumer sees the same order.
    pub fn fifo_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.entry_id.as_str())
    }
}

/// A user's rank within an event's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePosition {
    pub entry: WaitingListEntry,
    /// 1-based; position 1 is the next entry to be offered.
    pub position: usize,
}
