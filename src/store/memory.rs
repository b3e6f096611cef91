use crate::domain::{entry_key, event_key, ticket_key, EntryStatus, Event, Ticket, WaitingListEntry};
use crate::store::WaitlistStore;
use crate::{LobbyError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// In-memory store used by default and in tests.
#[derive(Default)]
pub struct MemoryStore {
    events: DashMap<String, Event>,
    tickets: DashMap<String, Ticket>,
    entries: DashMap<String, WaitingListEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitlistStore for MemoryStore {
    fn put_event(&self, event: Event) -> Result<()> {
        self.events.insert(event_key(&event.event_id), event);
        Ok(())
    }

    fn event(&self, event_id: &str) -> Result<Option<Event>> {
        Ok(self.events.get(&event_key(event_id)).map(|e| e.value().clone()))
    }

    fn put_ticket(&self, ticket: Ticket) -> Result<()> {
        self.tickets
            .insert(ticket_key(&ticket.event_id, &ticket.ticket_id), ticket);
        Ok(())
    }

    fn committed_ticket_count(&self, event_id: &str) -> Result<i64> {
        Ok(self
            .tickets
            .iter()
            .filter(|t| t.event_id == event_id && t.status.counts_toward_capacity())
            .count() as i64)
    }

    fn insert_entry(&self, entry: WaitingListEntry) -> Result<()> {
        self.entries
            .insert(entry_key(&entry.event_id, &entry.entry_id), entry);
        Ok(())
    }

    fn entry(&self, event_id: &str, entry_id: &str) -> Result<Option<WaitingListEntry>> {
        Ok(self
            .entries
            .get(&entry_key(event_id, entry_id))
            .map(|e| e.value().clone()))
    }

    fn active_entry_for_user(
        &self,
        event_id: &str,
        user_id: &str,
    ) -> Result<Option<WaitingListEntry>> {
        Ok(self
            .entries
            .iter()
            .find(|e| {
                e.event_id == event_id && e.user_id == user_id && !e.status.is_terminal()
            })
            .map(|e| e.value().clone()))
    }

    fn entries_for_event(&self, event_id: &str) -> Result<Vec<WaitingListEntry>> {
        let mut entries: Vec<WaitingListEntry> = self
            .entries
            .iter()
            .filter(|e| e.event_id == event_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.fifo_key().cmp(&b.fifo_key()));
        Ok(entries)
    }

    fn active_offer_quantity(&self, event_id: &str, now: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.event_id == event_id && e.has_active_offer(now))
            .map(|e| e.quantity as i64)
            .sum())
    }

    fn overdue_offers(&self, now: DateTime<Utc>) -> Result<Vec<WaitingListEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.offer_overdue(now))
            .map(|e| e.value().clone())
            .collect())
    }

    fn transition_entry(
        &self,
        event_id: &str,
        entry_id: &str,
        from: EntryStatus,
        to: EntryStatus,
        offer_expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        // The shard lock held by get_mut makes the check-and-set atomic.
        match self.entries.get_mut(&entry_key(event_id, entry_id)) {
            Some(mut entry) => {
                if entry.status != from {
                    return Ok(false);
                }
                entry.status = to;
                entry.offer_expires_at = offer_expires_at;
                Ok(true)
            }
            None => Err(LobbyError::not_found(format!(
                "waiting list entry {} for event {}",
                entry_id, event_id
            ))),
        }
    }
}
