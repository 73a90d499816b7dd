#![forbid(unsafe_code)]

//! Core data model for mqprobe: timestamps, records, configuration, the
//! send/ack correlation table and the statistics reducers.

pub mod clock;
pub mod config;
pub mod correlation;
pub mod error;
pub mod payload;
pub mod stats;
pub mod types;

pub use clock::{Clock, Millis};
pub use config::{BrokerConfig, FaultConfig, RetryConfig, SessionConfig, TransportKind};
pub use correlation::CorrelationTable;
pub use error::{Error, Result};
pub use payload::Payload;
pub use stats::{loss_ratio, summarize, Field, Sample, StatsError, SummaryStatistics};
pub use types::{ConnectionAttemptRecord, DatasetEntry, DisconnectEvent, MessageId, MessageRecord, QosLevel, RecordKind, Role};
