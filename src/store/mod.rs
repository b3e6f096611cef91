use crate::domain::{EntryStatus, Event, Ticket, WaitingListEntry};
use crate::Result;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

/// Storage boundary for events, tickets, and waiting-list entries.
///
/// All methods are synchronous: both backends are process-local. Status
/// changes go through [`WaitlistStore::transition_entry`] exclusively, so a
/// lost race is a no-op instead of a lost update.
pub trait WaitlistStore: Send + Sync {
    fn put_event(&self, event: Event) -> Result<()>;

    fn event(&self, event_id: &str) -> Result<Option<Event>>;

    fn put_ticket(&self, ticket: Ticket) -> Result<()>;

    /// Tickets counted toward capacity (valid or used), in ticket units.
    fn committed_ticket_count(&self, event_id: &str) -> Result<i64>;

    fn insert_entry(&self, entry: WaitingListEntry) -> Result<()>;

    fn entry(&self, event_id: &str, entry_id: &str) -> Result<Option<WaitingListEntry>>;

    /// The user's non-terminal entry for the event, if any. The waitlist
    /// service keeps at most one alive per (user, event) pair.
    fn active_entry_for_user(&self, event_id: &str, user_id: &str)
        -> Result<Option<WaitingListEntry>>;

    /// All entries for the event, sorted in FIFO promotion order.
    fn entries_for_event(&self, event_id: &str) -> Result<Vec<WaitingListEntry>>;

    /// Ticket units held by offers that have not lapsed as of `now`.
    fn active_offer_quantity(&self, event_id: &str, now: DateTime<Utc>) -> Result<i64>;

    /// Offers past their deadline across all events, for the fail-safe sweep.
    fn overdue_offers(&self, now: DateTime<Utc>) -> Result<Vec<WaitingListEntry>>;

    /// Atomic compare-and-set on entry status. Returns false when the entry
    /// is no longer in `from` (another path settled it first); errors only
    /// when the entry does not exist. `offer_expires_at` is stored verbatim:
    /// the deadline when moving to Offered, `None` otherwise.
    fn transition_entry(
        &self,
        event_id: &str,
        entry_id: &str,
        from: EntryStatus,
        to: EntryStatus,
        offer_expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}
