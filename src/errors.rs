use thiserror::Error;

use crate::calling::types::CallId;

/// Failures of the shared document store used for signaling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling store unavailable: {0}")]
    Unavailable(String),

    #[error("Call record not found: {0}")]
    RecordNotFound(CallId),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Signal payload codec error: {0}")]
    Codec(String),
}

/// Failures of the media transport primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("Peer connection failed: {0}")]
    PeerConnection(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("General error: {0}")]
    General(String),
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        CallError::General(format!("{err:#}"))
    }
}

impl From<bincode::Error> for SignalingError {
    fn from(err: bincode::Error) -> Self {
        SignalingError::Codec(err.to_string())
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
