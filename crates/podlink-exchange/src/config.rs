use std::time::Duration;

use podlink_transport::TransmitParams;

use crate::policy::RetryPolicy;

/// Timing and recovery configuration for the exchange engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    pub policy: RetryPolicy,
    /// Adapter parameters for request packets.
    pub exchange_params: TransmitParams,
    /// Adapter parameters for the conversation-closing acknowledgment.
    pub final_ack_params: TransmitParams,
    /// Longest time spent repeating the final acknowledgment.
    pub final_ack_window: Duration,
    /// Extra listening time after an unanswered final acknowledgment before
    /// the conversation counts as closed.
    pub final_ack_silence: Duration,
    /// Preamble used to wake the pod before a new conversation. `None` skips
    /// the wake-up burst.
    pub awaken_preamble: Option<Duration>,
    /// How long a caller waits for the engine to become idle.
    pub ready_timeout: Duration,
    /// Idle time after which the adapter link is released.
    pub idle_disconnect: Duration,
    /// Re-initialization attempts when the adapter fails outside an exchange.
    pub radio_init_retries: u32,
    /// Pause between re-initialization attempts.
    pub radio_init_pause: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            exchange_params: TransmitParams::exchange(),
            final_ack_params: TransmitParams::final_ack(),
            final_ack_window: Duration::from_secs(25),
            final_ack_silence: Duration::from_secs(1),
            awaken_preamble: Some(Duration::from_millis(250)),
            ready_timeout: Duration::from_secs(30),
            idle_disconnect: Duration::from_secs(5),
            radio_init_retries: 3,
            radio_init_pause: Duration::from_secs(2),
        }
    }
}
