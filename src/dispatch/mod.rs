use crate::domain::ReservationRequest;
use crate::Result;
use async_trait::async_trait;

pub mod dispatcher;
pub mod queue;
pub mod sink;

pub use dispatcher::*;
pub use queue::*;
pub use sink::*;

/// Executes a reservation job. Implementations must be idempotent: both
/// dispatch paths may run the same request.
#[async_trait]
pub trait ReservationProcessor: Send + Sync {
    async fn process(&self, request: &ReservationRequest) -> Result<serde_json::Value>;
}
