use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: String,
    pub event_id: String,
    pub ticket_type_id: String,
    pub status: TicketStatus,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Valid,
    Used,
    Refunded,
    Cancelled,
}

impl TicketStatus {
    /// Refunded and cancelled tickets return their capacity to the pool.
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(self, TicketStatus::Valid | TicketStatus::Used)
    }
}

impl Ticket {
    pub fn issue(event_id: impl Into<String>, ticket_type_id: impl Into<String>) -> Self {
        Self {
            ticket_id: Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            ticket_type_id: ticket_type_id.into(),
            status: TicketStatus::Valid,
            issued_at: Utc::now(),
        }
    }
}
