//! A pod that answers like the real thing: it reassembles requests,
//! acknowledges packets, repeats its last reply on duplicates and goes quiet
//! on a final acknowledgment.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use podlink_exchange::{ExchangeConfig, RetryPolicy};
use podlink_frame::{PacketType, PdmMessage, PodMessage, RadioPacket};
use podlink_transport::{PacketRadio, RadioError, TransmitParams, TxPower};

pub const POD_ADDRESS: u32 = 0x1f01_482a;

pub type Responder = Box<dyn FnMut(&PodMessage) -> PdmMessage + Send>;

struct PodState {
    address: u32,
    responder: Responder,
    last_in: Option<(PacketType, u8)>,
    last_reply: Option<Bytes>,
    assembly: Option<PodMessage>,
    outgoing: VecDeque<RadioPacket>,
    requests: Vec<PodMessage>,
    final_acks: usize,
    drop_next_reply_message: bool,
}

impl PodState {
    fn respond(&mut self, request: PodMessage, sequence: u8) -> RadioPacket {
        let response = (self.responder)(&request);
        let mut packets = response
            .get_radio_packets(
                self.address,
                (request.sequence() + 1) % 16,
                self.address,
                (sequence + 1) % 32,
                false,
            )
            .expect("response should encode");
        packets[0].packet_type = PacketType::Pod;
        self.requests.push(request);
        let first = packets.remove(0);
        self.outgoing = packets.into();
        first
    }

    fn handle(&mut self, packet: &RadioPacket) -> Option<RadioPacket> {
        match packet.packet_type {
            PacketType::Pdm => {
                let mut first = packet.clone();
                first.packet_type = PacketType::Pod;
                let mut request = PodMessage::new();
                if request.add_radio_packet(&first).expect("valid request") {
                    Some(self.respond(request, packet.sequence))
                } else {
                    self.assembly = Some(request);
                    Some(RadioPacket::ack(self.address, self.address, packet.sequence + 1))
                }
            }
            PacketType::Con => {
                let mut request = self.assembly.take()?;
                if request.add_radio_packet(packet).expect("valid continuation") {
                    Some(self.respond(request, packet.sequence))
                } else {
                    self.assembly = Some(request);
                    Some(RadioPacket::ack(self.address, self.address, packet.sequence + 1))
                }
            }
            PacketType::Ack if packet.is_final() => {
                self.final_acks += 1;
                None
            }
            PacketType::Ack => self
                .outgoing
                .pop_front()
                .map(|con| con.with_sequence(packet.sequence + 1)),
            PacketType::Pod => None,
        }
    }
}

fn with_marker(packet: &RadioPacket) -> Bytes {
    let data = packet.serialize();
    let mut raw = BytesMut::with_capacity(data.len() + 2);
    raw.put_u8(0x40);
    raw.put_u8(0);
    raw.put_slice(&data);
    raw.freeze()
}

pub struct SimulatedPod {
    state: Arc<Mutex<PodState>>,
}

/// Inspection handle for a [`SimulatedPod`] that has been moved into an engine.
#[derive(Clone)]
pub struct PodLog {
    state: Arc<Mutex<PodState>>,
}

impl SimulatedPod {
    pub fn new(responder: impl FnMut(&PodMessage) -> PdmMessage + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(PodState {
                address: POD_ADDRESS,
                responder: Box::new(responder),
                last_in: None,
                last_reply: None,
                assembly: None,
                outgoing: VecDeque::new(),
                requests: Vec::new(),
                final_acks: 0,
                drop_next_reply_message: false,
            })),
        }
    }

    /// A pod that answers every request with a short status message.
    pub fn status() -> Self {
        Self::new(|_| status_reply())
    }

    pub fn log(&self) -> PodLog {
        PodLog {
            state: Arc::clone(&self.state),
        }
    }
}

impl PodLog {
    pub fn requests(&self) -> Vec<PodMessage> {
        self.state.lock().requests.clone()
    }

    pub fn final_acks(&self) -> usize {
        self.state.lock().final_acks
    }

    /// Lose the first transmission of the next reply message on the air.
    pub fn drop_next_reply_message(&self) {
        self.state.lock().drop_next_reply_message = true;
    }
}

impl PacketRadio for SimulatedPod {
    fn connect(&mut self, _force_initialize: bool) -> Result<(), RadioError> {
        Ok(())
    }

    fn disconnect(&mut self, _ignore_errors: bool) -> Result<(), RadioError> {
        Ok(())
    }

    fn send_and_receive(
        &mut self,
        packet: &[u8],
        params: &TransmitParams,
    ) -> Result<Option<Bytes>, RadioError> {
        let reply = {
            let mut state = self.state.lock();
            match RadioPacket::parse(packet) {
                Err(_) => None,
                Ok(packet) if state.last_in == Some((packet.packet_type, packet.sequence)) => {
                    state.last_reply.clone()
                }
                Ok(packet) => {
                    state.last_in = Some((packet.packet_type, packet.sequence));
                    let reply = state.handle(&packet);
                    state.last_reply = reply.as_ref().map(with_marker);
                    match reply {
                        Some(reply)
                            if reply.packet_type == PacketType::Pod
                                && state.drop_next_reply_message =>
                        {
                            state.drop_next_reply_message = false;
                            None
                        }
                        other => other.as_ref().map(with_marker),
                    }
                }
            }
        };
        if reply.is_none() {
            thread::sleep(params.timeout);
        }
        Ok(reply)
    }

    fn send_repeated(
        &mut self,
        _packet: &[u8],
        _repeat_count: u8,
        _delay: Duration,
        _preamble_extension: Duration,
    ) -> Result<(), RadioError> {
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>, RadioError> {
        thread::sleep(timeout);
        Ok(None)
    }

    fn set_transmit_power(&mut self, _level: TxPower) -> Result<(), RadioError> {
        Ok(())
    }

    fn bump_power_up(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn bump_power_down(&mut self) -> Result<(), RadioError> {
        Ok(())
    }
}

pub fn status_reply() -> PdmMessage {
    PdmMessage::single(0x02, vec![0x08, 0x00, 0x00, 0x12, 0x34])
}

pub fn bad_nonce_reply(sync_word: u16) -> PdmMessage {
    let [hi, lo] = sync_word.to_be_bytes();
    PdmMessage::single(0x06, vec![0x14, hi, lo])
}

pub fn fast_config() -> ExchangeConfig {
    let ms = Duration::from_millis;
    ExchangeConfig {
        policy: RetryPolicy {
            initial_timeout: ms(30),
            first_packet_extended_timeout: ms(30),
            retry_timeout: ms(30),
            recovery_pause: Duration::ZERO,
            ..RetryPolicy::default()
        },
        exchange_params: TransmitParams {
            timeout: ms(1),
            ..TransmitParams::exchange()
        },
        final_ack_params: TransmitParams {
            timeout: ms(1),
            ..TransmitParams::final_ack()
        },
        final_ack_window: ms(100),
        final_ack_silence: ms(1),
        ready_timeout: Duration::from_secs(2),
        radio_init_pause: Duration::ZERO,
        ..ExchangeConfig::default()
    }
}
