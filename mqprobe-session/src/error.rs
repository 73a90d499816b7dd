#![forbid(unsafe_code)]

use thiserror::Error as ThisError;

use crate::state::SessionPhase;

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

#[derive(Debug, ThisError)]
pub enum SessionError {
	#[error("transport error: {0}")]
	Transport(#[from] mqprobe_transport::Error),
	#[error("gave up connecting after {attempts} attempts: {last}")]
	RetriesExhausted { attempts: u32, last: String },
	#[error("invalid session transition {from:?} -> {to:?}")]
	InvalidTransition { from: SessionPhase, to: SessionPhase },
	#[error("transport event channel closed")]
	ChannelClosed,
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Core(#[from] mqprobe_core::Error),
	#[error("internal error: {0}")]
	Internal(String),
}

impl SessionError {
	pub fn internal(msg: impl Into<String>) -> Self { SessionError::Internal(msg.into()) }
}
