//! Retry and recovery decisions for a packet exchange.
//!
//! The policy is a pure function of the failure kind, the position of the
//! packet within its message, and how many attempts at that packet have
//! already failed. Keeping it separate from the state machine lets the
//! schedule be tuned and tested on its own.

use std::time::Duration;

/// Category of a failed packet exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No usable reply within the exchange timeout.
    Timeout,
    /// The adapter failed.
    Radio,
    /// A reply arrived but had the wrong type or sequence.
    Protocol,
}

/// Where a packet sits within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketPosition {
    pub index: usize,
    pub count: usize,
}

impl PacketPosition {
    pub fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// No packet of the message has been acknowledged yet.
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    /// The pod answers this packet with its reply message.
    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.count
    }

    pub fn is_only(&self) -> bool {
        self.count == 1
    }
}

/// What the exchange engine does next after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Send the same packet again with a new exchange timeout.
    Retry { timeout: Duration },
    /// Zero both sequence counters, pause, then retry.
    ResetSequences { timeout: Duration, pause: Duration },
    /// Re-initialize the adapter, optionally zeroing the counters, then retry.
    Reinitialize {
        reset_sequences: bool,
        timeout: Duration,
    },
    /// Disconnect and recreate the adapter, pause, then retry.
    Recreate { timeout: Duration, pause: Duration },
    /// Give up and surface the error.
    ///
    /// `calm_pod` asks for a final acknowledgment at maximum power so that a
    /// pod which did hear the request stops retransmitting its reply.
    Fail {
        calm_pod: bool,
        reset_sequences: bool,
    },
}

/// Bounded retry schedule for packet exchanges.
///
/// Attempt budgets count the failed attempts including the first; a budget
/// of 4 means three retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Exchange timeout for the first attempt at any packet.
    pub initial_timeout: Duration,
    /// Timeout for retries of the first packet that keep the counters.
    pub first_packet_extended_timeout: Duration,
    /// Timeout for retries of interior and final packets.
    pub retry_timeout: Duration,
    /// Pause before retrying after a counter reset or adapter recreation.
    pub recovery_pause: Duration,
    pub first_packet_timeout_attempts: u32,
    pub interior_timeout_attempts: u32,
    pub final_timeout_attempts: u32,
    /// Radio failures on the first packet handled by a plain re-initialization.
    pub first_packet_reinit_attempts: u32,
    pub first_packet_radio_attempts: u32,
    pub interior_radio_attempts: u32,
    pub final_radio_attempts: u32,
    /// Retry a protocol error once when it hits the first attempt of the
    /// first packet.
    pub retry_first_protocol_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(10),
            first_packet_extended_timeout: Duration::from_secs(15),
            retry_timeout: Duration::from_secs(20),
            recovery_pause: Duration::from_secs(2),
            first_packet_timeout_attempts: 4,
            interior_timeout_attempts: 3,
            final_timeout_attempts: 11,
            first_packet_reinit_attempts: 2,
            first_packet_radio_attempts: 5,
            interior_radio_attempts: 7,
            final_radio_attempts: 11,
            retry_first_protocol_error: true,
        }
    }
}

impl RetryPolicy {
    /// Decide how to recover after attempt number `attempt` (zero based) at
    /// the packet in `position` failed with `kind`.
    ///
    /// Counter resets are only ever proposed for the first packet; once the
    /// pod has acknowledged part of a message the counters must survive.
    pub fn decide(&self, kind: FailureKind, position: PacketPosition, attempt: u32) -> RecoveryAction {
        let next = attempt.saturating_add(1);
        match kind {
            FailureKind::Timeout if position.is_first() => {
                if next >= self.first_packet_timeout_attempts {
                    return RecoveryAction::Fail {
                        calm_pod: position.is_only(),
                        reset_sequences: true,
                    };
                }
                match attempt {
                    0 => RecoveryAction::Retry {
                        timeout: self.first_packet_extended_timeout,
                    },
                    1 => RecoveryAction::ResetSequences {
                        timeout: self.initial_timeout,
                        pause: self.recovery_pause,
                    },
                    _ => RecoveryAction::Reinitialize {
                        reset_sequences: true,
                        timeout: self.first_packet_extended_timeout,
                    },
                }
            }
            FailureKind::Timeout => {
                let budget = if position.is_last() {
                    self.final_timeout_attempts
                } else {
                    self.interior_timeout_attempts
                };
                if next < budget {
                    RecoveryAction::Retry {
                        timeout: self.retry_timeout,
                    }
                } else {
                    give_up()
                }
            }
            FailureKind::Radio if position.is_first() => {
                if attempt < self.first_packet_reinit_attempts {
                    RecoveryAction::Reinitialize {
                        reset_sequences: false,
                        timeout: self.initial_timeout,
                    }
                } else if next < self.first_packet_radio_attempts {
                    RecoveryAction::Recreate {
                        timeout: self.initial_timeout,
                        pause: self.recovery_pause,
                    }
                } else {
                    RecoveryAction::Fail {
                        calm_pod: false,
                        reset_sequences: true,
                    }
                }
            }
            FailureKind::Radio => {
                let budget = if position.is_last() {
                    self.final_radio_attempts
                } else {
                    self.interior_radio_attempts
                };
                if next < budget {
                    RecoveryAction::Recreate {
                        timeout: self.retry_timeout,
                        pause: self.recovery_pause,
                    }
                } else {
                    give_up()
                }
            }
            FailureKind::Protocol => {
                if self.retry_first_protocol_error && position.is_first() && attempt == 0 {
                    RecoveryAction::Retry {
                        timeout: self.initial_timeout,
                    }
                } else {
                    give_up()
                }
            }
        }
    }

    /// Most attempts any single packet can receive under this policy.
    pub fn max_attempts(&self) -> u32 {
        [
            self.first_packet_timeout_attempts,
            self.interior_timeout_attempts,
            self.final_timeout_attempts,
            self.first_packet_radio_attempts,
            self.interior_radio_attempts,
            self.final_radio_attempts,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
    }
}

fn give_up() -> RecoveryAction {
    RecoveryAction::Fail {
        calm_pod: false,
        reset_sequences: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn first_packet_timeout_schedule() {
        let policy = RetryPolicy::default();
        let only = PacketPosition::new(0, 1);

        assert_eq!(
            policy.decide(FailureKind::Timeout, only, 0),
            RecoveryAction::Retry { timeout: secs(15) }
        );
        assert_eq!(
            policy.decide(FailureKind::Timeout, only, 1),
            RecoveryAction::ResetSequences {
                timeout: secs(10),
                pause: secs(2)
            }
        );
        assert_eq!(
            policy.decide(FailureKind::Timeout, only, 2),
            RecoveryAction::Reinitialize {
                reset_sequences: true,
                timeout: secs(15)
            }
        );
        assert_eq!(
            policy.decide(FailureKind::Timeout, only, 3),
            RecoveryAction::Fail {
                calm_pod: true,
                reset_sequences: true
            }
        );
    }

    #[test]
    fn calm_pod_only_for_single_packet_messages() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureKind::Timeout, PacketPosition::new(0, 3), 3),
            RecoveryAction::Fail {
                calm_pod: false,
                reset_sequences: true
            }
        );
    }

    #[test]
    fn later_packets_never_reset_counters() {
        let policy = RetryPolicy::default();
        for kind in [FailureKind::Timeout, FailureKind::Radio, FailureKind::Protocol] {
            for index in 1..3 {
                let position = PacketPosition::new(index, 3);
                for attempt in 0..policy.max_attempts() + 2 {
                    match policy.decide(kind, position, attempt) {
                        RecoveryAction::ResetSequences { .. } => {
                            panic!("reset proposed for {kind:?} at {position:?}")
                        }
                        RecoveryAction::Reinitialize {
                            reset_sequences: true,
                            ..
                        }
                        | RecoveryAction::Fail {
                            reset_sequences: true,
                            ..
                        } => panic!("reset proposed for {kind:?} at {position:?}"),
                        _ => {}
                    }
                }
            }
        }
    }

    #[test]
    fn interior_and_final_timeout_budgets() {
        let policy = RetryPolicy::default();
        let interior = PacketPosition::new(1, 3);
        let last = PacketPosition::new(2, 3);

        assert_eq!(
            policy.decide(FailureKind::Timeout, interior, 1),
            RecoveryAction::Retry { timeout: secs(20) }
        );
        assert!(matches!(
            policy.decide(FailureKind::Timeout, interior, 2),
            RecoveryAction::Fail { .. }
        ));
        assert_eq!(
            policy.decide(FailureKind::Timeout, last, 9),
            RecoveryAction::Retry { timeout: secs(20) }
        );
        assert!(matches!(
            policy.decide(FailureKind::Timeout, last, 10),
            RecoveryAction::Fail { .. }
        ));
    }

    #[test]
    fn radio_failures_escalate_on_first_packet() {
        let policy = RetryPolicy::default();
        let first = PacketPosition::new(0, 2);

        assert!(matches!(
            policy.decide(FailureKind::Radio, first, 0),
            RecoveryAction::Reinitialize {
                reset_sequences: false,
                ..
            }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Radio, first, 1),
            RecoveryAction::Reinitialize { .. }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Radio, first, 2),
            RecoveryAction::Recreate { .. }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Radio, first, 3),
            RecoveryAction::Recreate { .. }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Radio, first, 4),
            RecoveryAction::Fail { .. }
        ));
    }

    #[test]
    fn protocol_error_retried_once_on_first_packet() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.decide(FailureKind::Protocol, PacketPosition::new(0, 1), 0),
            RecoveryAction::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Protocol, PacketPosition::new(0, 1), 1),
            RecoveryAction::Fail { .. }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Protocol, PacketPosition::new(1, 2), 0),
            RecoveryAction::Fail { .. }
        ));

        let strict = RetryPolicy {
            retry_first_protocol_error: false,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            strict.decide(FailureKind::Protocol, PacketPosition::new(0, 1), 0),
            RecoveryAction::Fail { .. }
        ));
    }
}
