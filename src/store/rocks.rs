use crate::domain::{
    entry_key, entry_prefix, event_key, ticket_key, ticket_prefix, EntryStatus, Event, Ticket,
    WaitingListEntry, ENTRY_SCAN_PREFIX,
};
use crate::store::WaitlistStore;
use crate::{LobbyError, Result};
use chrono::{DateTime, Utc};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// RocksDB-backed store. Entries survive restarts, which is what lets the
/// fail-safe sweep pick up offers whose in-process timers died with the
/// previous process.
pub struct RocksStore {
    db: DB,
    // Serializes read-modify-write transitions; everything else is lock-free.
    transition_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(10000);
        opts.set_use_fsync(false);
        opts.set_bytes_per_sync(8388608);
        opts.optimize_for_point_lookup(1024);
        opts.set_max_write_buffer_number(32);
        opts.set_write_buffer_size(536870912);
        opts.set_compaction_style(rocksdb::DBCompactionStyle::Universal);

        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            transition_lock: Mutex::new(()),
        })
    }

    fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self.db.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn put<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.db.put(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn scan<T>(&self, prefix: &str) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut out = Vec::new();
        for item in self.db.prefix_iterator(prefix.as_bytes()) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl WaitlistStore for RocksStore {
    fn put_event(&self, event: Event) -> Result<()> {
        self.put(&event_key(&event.event_id), &event)
    }

    fn event(&self, event_id: &str) -> Result<Option<Event>> {
        self.get(&event_key(event_id))
    }

    fn put_ticket(&self, ticket: Ticket) -> Result<()> {
        self.put(&ticket_key(&ticket.event_id, &ticket.ticket_id), &ticket)
    }

    fn committed_ticket_count(&self, event_id: &str) -> Result<i64> {
        let tickets: Vec<Ticket> = self.scan(&ticket_prefix(event_id))?;
        Ok(tickets
            .iter()
            .filter(|t| t.status.counts_toward_capacity())
            .count() as i64)
    }

    fn insert_entry(&self, entry: WaitingListEntry) -> Result<()> {
        self.put(&entry_key(&entry.event_id, &entry.entry_id), &entry)
    }

    fn entry(&self, event_id: &str, entry_id: &str) -> Result<Option<WaitingListEntry>> {
        self.get(&entry_key(event_id, entry_id))
    }

    fn active_entry_for_user(
        &self,
        event_id: &str,
        user_id: &str,
    ) -> Result<Option<WaitingListEntry>> {
        let entries: Vec<WaitingListEntry> = self.scan(&entry_prefix(event_id))?;
        Ok(entries
            .into_iter()
            .find(|e| e.user_id == user_id && !e.status.is_terminal()))
    }

    fn entries_for_event(&self, event_id: &str) -> Result<Vec<WaitingListEntry>> {
        let mut entries: Vec<WaitingListEntry> = self.scan(&entry_prefix(event_id))?;
        entries.sort_by(|a, b| a.fifo_key().cmp(&b.fifo_key()));
        Ok(entries)
    }

    fn active_offer_quantity(&self, event_id: &str, now: DateTime<Utc>) -> Result<i64> {
        let entries: Vec<WaitingListEntry> = self.scan(&entry_prefix(event_id))?;
        Ok(entries
            .iter()
            .filter(|e| e.has_active_offer(now))
            .map(|e| e.quantity as i64)
            .sum())
    }

    fn overdue_offers(&self, now: DateTime<Utc>) -> Result<Vec<WaitingListEntry>> {
        let entries: Vec<WaitingListEntry> = self.scan(ENTRY_SCAN_PREFIX)?;
        Ok(entries.into_iter().filter(|e| e.offer_overdue(now)).collect())
    }

    fn transition_entry(
        &self,
        event_id: &str,
        entry_id: &str,
        from: EntryStatus,
        to: EntryStatus,
        offer_expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let _guard = self.transition_lock.lock().unwrap();

        let key = entry_key(event_id, entry_id);
        let mut entry: WaitingListEntry = self.get(&key)?.ok_or_else(|| {
            LobbyError::not_found(format!(
                "waiting list entry {} for event {}",
                entry_id, event_id
            ))
        })?;

        if entry.status != from {
            return Ok(false);
        }
        entry.status = to;
        entry.offer_expires_at = offer_expires_at;
        self.put(&key, &entry)?;
        Ok(true)
    }
}

impl Drop for RocksStore {
    fn drop(&mut self) {
        let _ = self.db.flush();
    }
}
