// Storage key layout and cache key helpers.

pub fn event_key(event_id: &str) -> String {
    format!("event/{}", event_id)
}

pub fn ticket_key(event_id: &str, ticket_id: &str) -> String {
    format!("ticket/{}/{}", event_id, ticket_id)
}

pub fn ticket_prefix(event_id: &str) -> String {
    format!("ticket/{}/", event_id)
}

pub fn entry_key(event_id: &str, entry_id: &str) -> String {
    format!("entry/{}/{}", event_id, entry_id)
}

pub fn entry_prefix(event_id: &str) -> String {
    format!("entry/{}/", event_id)
}

pub const ENTRY_SCAN_PREFIX: &str = "entry/";

/// Cache key namespaces, one per data class.
pub struct CacheKeys;

impl CacheKeys {
    pub fn event(event_id: &str) -> String {
        format!("lobby:event:{}", event_id)
    }
}
