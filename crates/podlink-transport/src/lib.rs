//! Packet radio adapter abstraction.
//!
//! The pod is reached through a third-party radio adapter (a RileyLink-style
//! BLE bridge or a serial dongle). Everything above this crate talks to the
//! adapter only through the [`PacketRadio`] trait:
//! - send a packet and optionally wait for one reply
//! - send a packet repeatedly without listening
//! - listen for a packet
//! - nudge transmit power
//!
//! This is the lowest layer of podlink. Concrete drivers live outside the
//! workspace; [`ScriptedRadio`] is an in-memory implementation for tests
//! and dry runs.

pub mod error;
pub mod scripted;
pub mod traits;

pub use error::{RadioError, Result};
pub use scripted::{Reply, ScriptLog, ScriptedRadio, Transmission, TransmissionKind};
pub use traits::{PacketRadio, TransmitParams, TxPower, SIGNAL_MARKER_LEN};
