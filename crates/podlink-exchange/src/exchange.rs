//! Synchronous exchange state machine.
//!
//! [`Exchange`] owns the radio and the sequence counters. One call to
//! [`Exchange::send_and_get`] fragments a PDM message, walks each packet
//! through the pod's acknowledgments under the [`RetryPolicy`](crate::RetryPolicy),
//! and reassembles the reply. The conversation is closed separately with a
//! final acknowledgment so a caller can be handed the reply first.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use podlink_frame::{PacketType, PdmMessage, PodMessage, ProtocolError, RadioPacket};
use podlink_transport::{PacketRadio, RadioError, TxPower, SIGNAL_MARKER_LEN};
use tracing::{debug, info, trace, warn};

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::policy::{PacketPosition, RecoveryAction};
use crate::session::RadioCounters;

const PACKET_TARGET: &str = "podlink::packet";
const EXCHANGE_TARGET: &str = "podlink::exchange";

/// One PDM message to deliver, with its per-request options.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub message: PdmMessage,
    /// Address written into the message header. Defaults to the radio address.
    pub message_address: Option<u32>,
    /// Second address for interim and final acknowledgments.
    pub ack_address_override: Option<u32>,
    pub tx_power: Option<TxPower>,
    /// Exchange the first packet twice and keep the second reply.
    pub double_take: bool,
    pub critical_follow_up: bool,
    /// Send with this message sequence instead of the current counter.
    pub message_sequence: Option<u8>,
}

impl ExchangeRequest {
    pub fn new(message: PdmMessage) -> Self {
        Self {
            message,
            message_address: None,
            ack_address_override: None,
            tx_power: None,
            double_take: false,
            critical_follow_up: false,
            message_sequence: None,
        }
    }

    pub fn message_address(mut self, address: u32) -> Self {
        self.message_address = Some(address);
        self
    }

    pub fn ack_address_override(mut self, address: u32) -> Self {
        self.ack_address_override = Some(address);
        self
    }

    pub fn tx_power(mut self, power: TxPower) -> Self {
        self.tx_power = Some(power);
        self
    }

    pub fn double_take(mut self, enabled: bool) -> Self {
        self.double_take = enabled;
        self
    }

    pub fn critical_follow_up(mut self, enabled: bool) -> Self {
        self.critical_follow_up = enabled;
        self
    }

    pub fn message_sequence(mut self, sequence: u8) -> Self {
        self.message_sequence = Some(sequence & 0x0f);
        self
    }

    /// Same options, different message.
    pub fn with_message(&self, message: PdmMessage) -> Self {
        Self {
            message,
            ..self.clone()
        }
    }
}

/// Exchange engine over a single radio.
pub struct Exchange<R: PacketRadio> {
    radio: R,
    counters: RadioCounters,
    last_received: Option<(PacketType, u8)>,
    config: ExchangeConfig,
}

impl<R: PacketRadio> Exchange<R> {
    pub fn new(radio: R, counters: RadioCounters, config: ExchangeConfig) -> Self {
        Self {
            radio,
            counters,
            last_received: None,
            config,
        }
    }

    pub fn counters(&self) -> RadioCounters {
        self.counters
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Zero both sequence counters and forget the last packet heard, since
    /// the pod reuses its sequences from zero.
    pub fn reset_sequences(&mut self) {
        debug!(target: EXCHANGE_TARGET, "resetting sequence counters");
        self.counters.reset();
        self.last_received = None;
    }

    /// Deliver `request` and return the pod's reassembled reply, leaving the
    /// conversation open. Follow with [`close_conversation`](Self::close_conversation).
    pub fn send_and_get(&mut self, request: &ExchangeRequest) -> Result<PodMessage> {
        if let Some(sequence) = request.message_sequence {
            self.counters.message_sequence = sequence & 0x0f;
        }
        let mut packets = self.build_packets(request)?;

        if let Err(err) = self.prepare(request.tx_power) {
            warn!(target: EXCHANGE_TARGET, error = %err, "radio not ready, re-initializing");
            if !self.initialize(self.config.radio_init_retries) {
                return Err(err.into());
            }
        }

        info!(
            target: EXCHANGE_TARGET,
            message_sequence = self.counters.message_sequence,
            packets = packets.len(),
            "sending message"
        );

        let count = packets.len();
        let mut index = 0;
        let mut received = loop {
            let position = PacketPosition::new(index, count);
            let reply = self.deliver_packet(request, &mut packets, position)?;
            if position.is_last() {
                break reply;
            }
            index += 1;
        };

        let mut response = PodMessage::new();
        while !response.add_radio_packet(&received)? {
            let ack = self.interim_ack(request.ack_address_override, (received.sequence + 1) % 32);
            received = self.exchange_packets(
                &ack,
                PacketType::Con,
                self.config.policy.initial_timeout,
            )?;
        }

        self.counters.message_sequence = (response.sequence() + 1) % 16;
        info!(
            target: EXCHANGE_TARGET,
            sequence = response.sequence(),
            length = response.body_length(),
            "received reply"
        );
        Ok(response)
    }

    /// Build the acknowledgment that closes the current conversation and
    /// advance the packet sequence past it.
    pub fn prepare_final_ack(&mut self, ack_address_override: Option<u32>) -> RadioPacket {
        let ack = RadioPacket::ack(
            self.counters.radio_address,
            ack_address_override.unwrap_or(0),
            self.counters.packet_sequence,
        );
        self.counters.packet_sequence = (self.counters.packet_sequence + 1) % 32;
        ack
    }

    /// Repeat `ack` until the pod falls silent or the final-ack window
    /// elapses. Any new packet from the pod is acknowledged again with an
    /// updated sequence.
    pub fn send_final(&mut self, ack: RadioPacket) -> Result<()> {
        let mut ack = ack;
        let mut started: Option<Instant> = None;
        loop {
            if started.is_some_and(|s| s.elapsed() >= self.config.final_ack_window) {
                warn!(target: EXCHANGE_TARGET, "pod still transmitting after final acknowledgment window");
                return Ok(());
            }

            let raw = match self.final_round(&ack) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(target: EXCHANGE_TARGET, error = %err, "radio error during final acknowledgment");
                    if !self.initialize(self.config.radio_init_retries) {
                        return Err(err.into());
                    }
                    started.get_or_insert_with(Instant::now);
                    continue;
                }
            };
            started.get_or_insert_with(Instant::now);

            let Some(raw) = raw else {
                debug!(target: EXCHANGE_TARGET, "conversation closed");
                return Ok(());
            };
            let Some(packet) = self.read_packet(&raw) else {
                self.adjust_power(false);
                continue;
            };
            if packet.address != self.counters.radio_address {
                self.adjust_power(false);
                continue;
            }
            if self.last_received == Some((packet.packet_type, packet.sequence)) {
                self.adjust_power(true);
                continue;
            }

            debug!(target: EXCHANGE_TARGET, %packet, "unexpected packet during final acknowledgment");
            self.last_received = Some((packet.packet_type, packet.sequence));
            ack = ack.with_sequence((packet.sequence + 1) % 32);
            self.counters.packet_sequence = (packet.sequence + 2) % 32;
        }
    }

    /// Close the conversation: [`prepare_final_ack`](Self::prepare_final_ack)
    /// followed by [`send_final`](Self::send_final). Failures are logged.
    pub fn close_conversation(&mut self, ack_address_override: Option<u32>) {
        let ack = self.prepare_final_ack(ack_address_override);
        if let Err(err) = self.send_final(ack) {
            warn!(target: EXCHANGE_TARGET, error = %err, "failed to close conversation");
        }
    }

    /// Deliver `request`, then close the conversation.
    pub fn exchange(&mut self, request: &ExchangeRequest) -> Result<PodMessage> {
        let response = self.send_and_get(request)?;
        self.close_conversation(request.ack_address_override);
        Ok(response)
    }

    /// Disconnect and reconnect the adapter, up to `retries` times.
    pub fn initialize(&mut self, retries: u32) -> bool {
        for attempt in 0..retries.max(1) {
            if attempt > 0 {
                thread::sleep(self.config.radio_init_pause);
            }
            if let Err(err) = self.radio.disconnect(true) {
                debug!(target: EXCHANGE_TARGET, error = %err, "ignoring disconnect error");
            }
            match self.radio.connect(true) {
                Ok(()) => {
                    debug!(target: EXCHANGE_TARGET, "radio initialized");
                    return true;
                }
                Err(err) => {
                    warn!(target: EXCHANGE_TARGET, error = %err, attempt, "radio initialization failed")
                }
            }
        }
        false
    }

    /// Release the adapter link.
    pub fn disconnect(&mut self) {
        debug!(target: EXCHANGE_TARGET, "disconnecting idle radio");
        if let Err(err) = self.radio.disconnect(true) {
            warn!(target: EXCHANGE_TARGET, error = %err, "disconnect failed");
        }
    }

    /// Walk one packet through to the pod's answer under the retry policy.
    /// Counter resets rebuild `packets` with the new sequences.
    fn deliver_packet(
        &mut self,
        request: &ExchangeRequest,
        packets: &mut Vec<RadioPacket>,
        position: PacketPosition,
    ) -> Result<RadioPacket> {
        let expected = if position.is_last() {
            PacketType::Pod
        } else {
            PacketType::Ack
        };
        let mut attempt = 0u32;
        let mut timeout = self.config.policy.initial_timeout;
        let mut second_take = request.double_take && position.is_first();

        let received = loop {
            let packet = packets[position.index].with_sequence(self.counters.packet_sequence);
            let err = match self.exchange_packets(&packet, expected, timeout) {
                Ok(reply) if second_take => {
                    debug!(target: EXCHANGE_TARGET, sequence = reply.sequence, "double take, repeating first packet");
                    second_take = false;
                    continue;
                }
                Ok(reply) => break reply,
                Err(err) => err,
            };
            let Some(kind) = err.failure_kind() else {
                return Err(err);
            };

            let action = self.config.policy.decide(kind, position, attempt);
            warn!(
                target: EXCHANGE_TARGET,
                error = %err,
                packet = position.index,
                attempt,
                ?action,
                "packet exchange failed"
            );
            match action {
                RecoveryAction::Retry { timeout: next } => timeout = next,
                RecoveryAction::ResetSequences { timeout: next, pause } => {
                    self.reset_sequences();
                    *packets = self.build_packets(request)?;
                    thread::sleep(pause);
                    timeout = next;
                }
                RecoveryAction::Reinitialize {
                    reset_sequences,
                    timeout: next,
                } => {
                    if reset_sequences {
                        self.reset_sequences();
                        *packets = self.build_packets(request)?;
                    }
                    self.initialize(1);
                    timeout = next;
                }
                RecoveryAction::Recreate {
                    timeout: next,
                    pause,
                } => {
                    if let Err(err) = self.radio.recreate() {
                        warn!(target: EXCHANGE_TARGET, error = %err, "failed to recreate radio");
                    }
                    thread::sleep(pause);
                    timeout = next;
                }
                RecoveryAction::Fail {
                    calm_pod,
                    reset_sequences,
                } => {
                    if calm_pod {
                        self.calm_pod(request.ack_address_override);
                    }
                    if reset_sequences {
                        self.reset_sequences();
                    }
                    return Err(err);
                }
            }
            attempt += 1;
        };

        self.counters.packet_sequence = (received.sequence + 1) % 32;
        Ok(received)
    }

    fn build_packets(&self, request: &ExchangeRequest) -> Result<Vec<RadioPacket>> {
        let packets = request.message.get_radio_packets(
            request.message_address.unwrap_or(self.counters.radio_address),
            self.counters.message_sequence,
            self.counters.radio_address,
            self.counters.packet_sequence,
            request.critical_follow_up,
        )?;
        Ok(packets)
    }

    fn prepare(&mut self, tx_power: Option<TxPower>) -> std::result::Result<(), RadioError> {
        if let Some(power) = tx_power {
            self.radio.set_transmit_power(power)?;
        }
        if let Some(preamble) = self.config.awaken_preamble {
            self.radio
                .send_repeated(&[], 0, Duration::ZERO, preamble)?;
        }
        Ok(())
    }

    /// One request/reply round with the pod, repeating `packet` until a new
    /// valid packet from our pod arrives or `timeout` elapses.
    fn exchange_packets(
        &mut self,
        packet: &RadioPacket,
        expected: PacketType,
        timeout: Duration,
    ) -> Result<RadioPacket> {
        let data = packet.serialize();
        let params = self.config.exchange_params;
        trace!(target: PACKET_TARGET, %packet, "send");

        let mut started: Option<Instant> = None;
        loop {
            if started.is_some_and(|s| s.elapsed() >= timeout) {
                return Err(ExchangeError::Timeout(timeout));
            }
            let raw = self.radio.send_and_receive(&data, &params)?;
            started.get_or_insert_with(Instant::now);

            let Some(raw) = raw else {
                self.radio.bump_power_up()?;
                continue;
            };
            let Some(received) = self.read_packet(&raw) else {
                self.radio.bump_power_down()?;
                continue;
            };
            if received.address != self.counters.radio_address {
                debug!(target: PACKET_TARGET, %received, "ignoring packet for another address");
                self.radio.bump_power_down()?;
                continue;
            }
            if self.last_received == Some((received.packet_type, received.sequence)) {
                debug!(target: PACKET_TARGET, %received, "pod repeated its last packet");
                self.radio.bump_power_up()?;
                continue;
            }

            self.last_received = Some((received.packet_type, received.sequence));
            self.counters.packet_sequence = (received.sequence + 1) % 32;

            if received.packet_type != expected {
                return Err(ProtocolError::UnexpectedPacketType {
                    expected,
                    actual: received.packet_type,
                }
                .into());
            }
            let expected_sequence = (packet.sequence + 1) % 32;
            if received.sequence != expected_sequence {
                return Err(ProtocolError::UnexpectedSequence {
                    expected: expected_sequence,
                    actual: received.sequence,
                }
                .into());
            }
            return Ok(received);
        }
    }

    fn final_round(&mut self, ack: &RadioPacket) -> std::result::Result<Option<Bytes>, RadioError> {
        trace!(target: PACKET_TARGET, packet = %ack, "send final");
        let params = self.config.final_ack_params;
        match self.radio.send_and_receive(&ack.serialize(), &params)? {
            Some(raw) => Ok(Some(raw)),
            None => self.radio.receive(self.config.final_ack_silence),
        }
    }

    /// Final acknowledgment at maximum power after giving up on a message,
    /// in case the pod did hear it and is waiting to be released.
    fn calm_pod(&mut self, ack_address_override: Option<u32>) {
        info!(target: EXCHANGE_TARGET, "sending final acknowledgment at maximum power");
        if let Err(err) = self.radio.set_transmit_power(TxPower::Highest) {
            warn!(target: EXCHANGE_TARGET, error = %err, "failed to raise transmit power");
        }
        let ack = RadioPacket::ack(
            self.counters.radio_address,
            ack_address_override.unwrap_or(0),
            (self.counters.packet_sequence + 1) % 32,
        );
        if let Err(err) = self.send_final(ack) {
            warn!(target: EXCHANGE_TARGET, error = %err, "failed to send final acknowledgment");
        }
    }

    fn interim_ack(&self, ack_address_override: Option<u32>, sequence: u8) -> RadioPacket {
        RadioPacket::ack(
            self.counters.radio_address,
            ack_address_override.unwrap_or(self.counters.radio_address),
            sequence,
        )
    }

    fn read_packet(&self, raw: &[u8]) -> Option<RadioPacket> {
        if raw.len() <= SIGNAL_MARKER_LEN {
            debug!(target: PACKET_TARGET, len = raw.len(), "reply too short");
            return None;
        }
        match RadioPacket::parse(&raw[SIGNAL_MARKER_LEN..]) {
            Ok(packet) => {
                trace!(target: PACKET_TARGET, rssi = raw[0], %packet, "recv");
                Some(packet)
            }
            Err(err) => {
                debug!(target: PACKET_TARGET, error = %err, "discarding undecodable reply");
                None
            }
        }
    }

    fn adjust_power(&mut self, up: bool) {
        let result = if up {
            self.radio.bump_power_up()
        } else {
            self.radio.bump_power_down()
        };
        if let Err(err) = result {
            debug!(target: EXCHANGE_TARGET, error = %err, "power adjustment failed");
        }
    }
}
