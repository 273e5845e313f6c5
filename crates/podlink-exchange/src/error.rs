use std::time::Duration;

use podlink_frame::ProtocolError;
use podlink_transport::RadioError;

use crate::policy::FailureKind;

/// The session store could not load or save state.
#[derive(Debug, thiserror::Error)]
#[error("session store error: {0}")]
pub struct StoreError(pub String);

/// Errors surfaced by the exchange engine.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Transport failure that outlasted re-initialization.
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    /// Decode, CRC or sequencing mismatch.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Nothing usable heard within the retry budget. The command may still
    /// have been received by the pod.
    #[error("no reply from pod within {0:?}")]
    Timeout(Duration),

    /// The pod rejected the nonce again after one resynchronization.
    #[error("nonce resynchronization failed")]
    NonceDesync,

    /// A nonce-bearing command was sent without a nonce generator.
    #[error("no nonce generator for this session")]
    NonceUnavailable,

    /// The engine did not become idle within the ready timeout.
    #[error("radio is busy")]
    Busy,

    /// The engine has stopped.
    #[error("exchange engine shut down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExchangeError {
    /// Input to the retry policy, for failures it knows how to handle.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ExchangeError::Radio(_) => Some(FailureKind::Radio),
            ExchangeError::Protocol(_) => Some(FailureKind::Protocol),
            ExchangeError::Timeout(_) => Some(FailureKind::Timeout),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
