#![forbid(unsafe_code)]

//! Session engine: connects to the broker, drives the publisher or
//! subscriber role, injects faults and persists what was measured.

pub mod connection;
pub mod error;
pub mod fault;
pub mod publisher;
pub mod retry;
pub mod state;
pub mod subscriber;
pub mod summary;

pub use connection::ConnectionManager;
pub use error::{Result, SessionError};
pub use fault::FaultInjector;
pub use publisher::Publisher;
pub use retry::Backoff;
pub use state::{SessionPhase, SessionState};
pub use subscriber::Subscriber;
pub use summary::{RoleSummary, SessionReport, SummaryWriter, WrittenFiles};
