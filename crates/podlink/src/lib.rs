//! Pod radio protocol core.
//!
//! podlink speaks the packet and message protocol used between a PDM and an
//! insulin pod over a radio adapter: CRC-protected radio packets, multi-packet
//! message framing, the sequenced request/response exchange with its recovery
//! rules, and the shared nonce generator.
//!
//! # Crate Structure
//!
//! - [`transport`]: the radio adapter port and a scripted adapter for tests
//! - [`frame`]: CRCs, radio packets, PDM/POD message framing
//! - [`exchange`]: exchange engine, retry policy, nonce generator, sessions
//! - [`logging`]: subscriber setup (behind the `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use podlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use podlink_frame::*;
}

/// Re-export exchange types.
pub mod exchange {
    pub use podlink_exchange::*;
}

#[cfg(feature = "logging")]
pub mod logging;
