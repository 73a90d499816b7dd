use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("yaml: {0}")]
	Yaml(#[from] serde_yaml::Error),
	#[error("config: {0}")]
	Config(String),
	#[error("payload: {0}")]
	Payload(String),
}

impl Error {
	pub fn config(msg: impl Into<String>) -> Self { Self::Config(msg.into()) }
	pub fn payload(msg: impl Into<String>) -> Self { Self::Payload(msg.into()) }
}
