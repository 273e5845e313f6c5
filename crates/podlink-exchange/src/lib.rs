//! Request/response exchange engine for pod communication.
//!
//! This is the protocol core. It drives one PDM message at a time through
//! the radio, reassembles the pod's reply, keeps the packet and message
//! sequence counters in lockstep with the pod, and recovers from silence,
//! corruption and mis-sequenced replies without ever resending a command
//! whose delivery state is ambiguous.
//!
//! - [`Exchange`]: the synchronous state machine over a [`PacketRadio`](podlink_transport::PacketRadio).
//! - [`PdmRadio`]: a dedicated worker owning an `Exchange`, with a
//!   single-flight handoff for concurrent callers.
//! - [`PodSession`]: nonce-bearing commands with resynchronization and
//!   persistence of counters and nonce state.

pub mod config;
pub mod error;
pub mod exchange;
pub mod nonce;
pub mod policy;
pub mod radio;
pub mod session;

pub use config::ExchangeConfig;
pub use error::{ExchangeError, Result, StoreError};
pub use exchange::{Exchange, ExchangeRequest};
pub use nonce::{Nonce, NonceState, NONCE_TABLE_LEN};
pub use policy::{FailureKind, PacketPosition, RecoveryAction, RetryPolicy};
pub use radio::{EngineState, PdmRadio, RadioHandle};
pub use session::{MemoryStore, PodSession, RadioCounters, SessionState, SessionStore};
