use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub name: String,
    /// `None` means the event sells an unbounded number of tickets.
    pub total_tickets: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_id: impl Into<String>, name: impl Into<String>, total_tickets: Option<i64>) -> Self {
        Self {
            event_id: event_id.into(),
            name: name.into(),
            total_tickets,
            created_at: Utc::now(),
        }
    }

    pub fn capacity(&self) -> Capacity {
        match self.total_tickets {
            Some(total) => Capacity::Bounded(total),
            None => Capacity::Unbounded,
        }
    }
}

/// Ticket capacity, either a concrete count or unlimited. Used both for an
/// event's total supply and for the accountant's remaining-capacity answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tickets", rename_all = "snake_case")]
pub enum Capacity {
    Bounded(i64),
    Unbounded,
}

impl Capacity {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Capacity::Bounded(n) if *n <= 0)
    }

    /// Remaining budget in ticket units, saturating for unbounded events.
    pub fn budget(&self) -> i64 {
        match self {
            Capacity::Bounded(n) => (*n).max(0),
            Capacity::Unbounded => i64::MAX,
        }
    }
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capacity::Bounded(n) => write!(f, "{}", n),
            Capacity::Unbounded => write!(f, "unbounded"),
        }
    }
}
