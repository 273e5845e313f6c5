use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

/// Raw replies from the adapter start with this many signal-quality bytes
/// (RSSI followed by a sequence counter) ahead of the radio packet itself.
pub const SIGNAL_MARKER_LEN: usize = 2;

/// Transmit power presets understood by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxPower {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

/// Parameters for a single transmit (and optional receive) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitParams {
    /// Additional copies sent after the first transmission.
    pub repeat_count: u8,
    /// Pause between repeated copies.
    pub delay: Duration,
    /// How long to listen for a reply after each transmission.
    pub timeout: Duration,
    /// How many times the adapter retransmits when nothing is heard.
    pub retry_count: u8,
    /// Extra preamble ahead of the first copy, to wake a sleeping receiver.
    pub preamble_extension: Duration,
}

impl TransmitParams {
    /// Parameters used for request packets inside an exchange.
    pub const fn exchange() -> Self {
        Self {
            repeat_count: 0,
            delay: Duration::ZERO,
            timeout: Duration::from_millis(100),
            retry_count: 1,
            preamble_extension: Duration::from_millis(130),
        }
    }

    /// Parameters used for the conversation-closing acknowledgment.
    pub const fn final_ack() -> Self {
        Self {
            repeat_count: 5,
            delay: Duration::from_millis(55),
            timeout: Duration::from_millis(300),
            retry_count: 2,
            preamble_extension: Duration::from_millis(40),
        }
    }
}

impl Default for TransmitParams {
    fn default() -> Self {
        Self::exchange()
    }
}

/// Capability offered by a radio adapter driver.
///
/// Replies are returned as raw bytes still carrying the
/// [`SIGNAL_MARKER_LEN`]-byte signal-quality prefix. `Ok(None)` means
/// nothing was heard before the timeout; it is not an error.
pub trait PacketRadio: Send {
    /// Establish the link to the adapter, optionally forcing a full
    /// register re-initialization.
    fn connect(&mut self, force_initialize: bool) -> Result<()>;

    /// Tear down the link to the adapter.
    fn disconnect(&mut self, ignore_errors: bool) -> Result<()>;

    /// Transmit `packet` and wait for a single reply.
    fn send_and_receive(&mut self, packet: &[u8], params: &TransmitParams)
        -> Result<Option<Bytes>>;

    /// Transmit `packet` `repeat_count + 1` times without listening.
    fn send_repeated(
        &mut self,
        packet: &[u8],
        repeat_count: u8,
        delay: Duration,
        preamble_extension: Duration,
    ) -> Result<()>;

    /// Listen for the next packet.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>>;

    fn set_transmit_power(&mut self, level: TxPower) -> Result<()>;

    /// Hint that the pod is not hearing us.
    fn bump_power_up(&mut self) -> Result<()>;

    /// Hint that we are drowning the pod or a neighbor.
    fn bump_power_down(&mut self) -> Result<()>;

    /// Discard the adapter link entirely and build a fresh one.
    ///
    /// Drivers that own helper processes or OS handles should override this
    /// to kill them; the default reconnects with a forced re-initialization.
    fn recreate(&mut self) -> Result<()> {
        self.disconnect(true)?;
        self.connect(true)
    }
}

impl<R: PacketRadio + ?Sized> PacketRadio for Box<R> {
    fn connect(&mut self, force_initialize: bool) -> Result<()> {
        (**self).connect(force_initialize)
    }

    fn disconnect(&mut self, ignore_errors: bool) -> Result<()> {
        (**self).disconnect(ignore_errors)
    }

    fn send_and_receive(
        &mut self,
        packet: &[u8],
        params: &TransmitParams,
    ) -> Result<Option<Bytes>> {
        (**self).send_and_receive(packet, params)
    }

    fn send_repeated(
        &mut self,
        packet: &[u8],
        repeat_count: u8,
        delay: Duration,
        preamble_extension: Duration,
    ) -> Result<()> {
        (**self).send_repeated(packet, repeat_count, delay, preamble_extension)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        (**self).receive(timeout)
    }

    fn set_transmit_power(&mut self, level: TxPower) -> Result<()> {
        (**self).set_transmit_power(level)
    }

    fn bump_power_up(&mut self) -> Result<()> {
        (**self).bump_power_up()
    }

    fn bump_power_down(&mut self) -> Result<()> {
        (**self).bump_power_down()
    }

    fn recreate(&mut self) -> Result<()> {
        (**self).recreate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_params_match_adapter_defaults() {
        let params = TransmitParams::exchange();
        assert_eq!(params.repeat_count, 0);
        assert_eq!(params.timeout, Duration::from_millis(100));
        assert_eq!(params.retry_count, 1);
        assert_eq!(params.preamble_extension, Duration::from_millis(130));
        assert_eq!(TransmitParams::default(), params);
    }

    #[test]
    fn final_ack_params_repeat_more() {
        let params = TransmitParams::final_ack();
        assert!(params.repeat_count > TransmitParams::exchange().repeat_count);
        assert_eq!(params.delay, Duration::from_millis(55));
    }

    #[test]
    fn tx_power_orders_low_to_high() {
        assert!(TxPower::Lowest < TxPower::Normal);
        assert!(TxPower::High < TxPower::Highest);
    }
}
