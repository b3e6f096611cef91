pub mod breaker;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod waitlist;

pub use breaker::*;
pub use cache::*;
pub use config::*;
pub use dispatch::*;
pub use domain::*;
pub use error::*;
pub use metrics::*;
pub use retry::*;
pub use shutdown::*;
pub use store::*;
pub use waitlist::*;
