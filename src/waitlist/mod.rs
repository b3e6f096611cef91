pub mod capacity;
pub mod expiry;
pub mod position;
pub mod scheduler;
pub mod service;

pub use capacity::*;
pub use expiry::*;
pub use position::*;
pub use scheduler::*;
pub use service::*;
