use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RadioError, Result};
use crate::traits::{PacketRadio, TransmitParams, TxPower};

/// Signal-quality byte prefixed onto scripted replies.
const SCRIPTED_RSSI: u8 = 0x3c;

/// One queued adapter reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Raw bytes as the adapter would return them, marker included.
    Packet(Bytes),
    /// Nothing heard before the timeout.
    Silence,
    /// The adapter fails the command.
    Fail(String),
}

impl Reply {
    /// Wrap radio packet bytes with a signal-quality marker.
    pub fn packet(packet: &[u8]) -> Self {
        let mut raw = BytesMut::with_capacity(packet.len() + 2);
        raw.put_u8(SCRIPTED_RSSI);
        raw.put_u8(0);
        raw.put_slice(packet);
        Reply::Packet(raw.freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionKind {
    SendAndReceive,
    SendRepeated,
}

/// A packet handed to the scripted adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub kind: TransmissionKind,
    pub data: Bytes,
    pub params: TransmitParams,
    pub power: TxPower,
}

#[derive(Debug)]
struct ScriptState {
    replies: VecDeque<Reply>,
    transmissions: Vec<Transmission>,
    connects: usize,
    disconnects: usize,
    recreates: usize,
    power: TxPower,
    power_ups: usize,
    power_downs: usize,
}

/// Shared view of a [`ScriptedRadio`]: queue replies and inspect what was sent
/// after the radio itself has been moved into a worker.
#[derive(Debug, Clone)]
pub struct ScriptLog {
    inner: Arc<Mutex<ScriptState>>,
}

impl ScriptLog {
    /// Queue a reply for the next receive.
    pub fn push(&self, reply: Reply) {
        self.inner.lock().replies.push_back(reply);
    }

    /// Queue a radio packet reply.
    pub fn push_packet(&self, packet: &[u8]) {
        self.push(Reply::packet(packet));
    }

    /// Queue `count` silent receives.
    pub fn push_silence(&self, count: usize) {
        let mut state = self.inner.lock();
        for _ in 0..count {
            state.replies.push_back(Reply::Silence);
        }
    }

    /// Replies not yet consumed.
    pub fn pending_replies(&self) -> usize {
        self.inner.lock().replies.len()
    }

    /// Everything transmitted so far, in order.
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.inner.lock().transmissions.clone()
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.inner.lock().disconnects
    }

    pub fn recreates(&self) -> usize {
        self.inner.lock().recreates
    }

    pub fn power(&self) -> TxPower {
        self.inner.lock().power
    }

    /// `(bump_power_up, bump_power_down)` call counts.
    pub fn power_bumps(&self) -> (usize, usize) {
        let state = self.inner.lock();
        (state.power_ups, state.power_downs)
    }
}

/// In-memory adapter that replays queued replies.
///
/// Once the queue runs dry every receive is silent. A silent receive blocks
/// for its listening window, as a real adapter would.
#[derive(Debug)]
pub struct ScriptedRadio {
    log: ScriptLog,
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self {
            log: ScriptLog {
                inner: Arc::new(Mutex::new(ScriptState {
                    replies: VecDeque::new(),
                    transmissions: Vec::new(),
                    connects: 0,
                    disconnects: 0,
                    recreates: 0,
                    power: TxPower::Normal,
                    power_ups: 0,
                    power_downs: 0,
                })),
            },
        }
    }

    /// Handle for scripting and inspection.
    pub fn log(&self) -> ScriptLog {
        self.log.clone()
    }

    fn next_reply(&self, listen: Duration) -> Result<Option<Bytes>> {
        let reply = self.log.inner.lock().replies.pop_front();
        match reply {
            Some(Reply::Packet(raw)) => Ok(Some(raw)),
            Some(Reply::Silence) | None => {
                std::thread::sleep(listen);
                Ok(None)
            }
            Some(Reply::Fail(message)) => {
                debug!(%message, "scripted radio failure");
                Err(RadioError::Device(message))
            }
        }
    }
}

impl Default for ScriptedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketRadio for ScriptedRadio {
    fn connect(&mut self, _force_initialize: bool) -> Result<()> {
        self.log.inner.lock().connects += 1;
        Ok(())
    }

    fn disconnect(&mut self, _ignore_errors: bool) -> Result<()> {
        self.log.inner.lock().disconnects += 1;
        Ok(())
    }

    fn send_and_receive(
        &mut self,
        packet: &[u8],
        params: &TransmitParams,
    ) -> Result<Option<Bytes>> {
        {
            let mut state = self.log.inner.lock();
            let power = state.power;
            state.transmissions.push(Transmission {
                kind: TransmissionKind::SendAndReceive,
                data: Bytes::copy_from_slice(packet),
                params: *params,
                power,
            });
        }
        self.next_reply(params.timeout)
    }

    fn send_repeated(
        &mut self,
        packet: &[u8],
        repeat_count: u8,
        delay: Duration,
        preamble_extension: Duration,
    ) -> Result<()> {
        let mut state = self.log.inner.lock();
        let power = state.power;
        state.transmissions.push(Transmission {
            kind: TransmissionKind::SendRepeated,
            data: Bytes::copy_from_slice(packet),
            params: TransmitParams {
                repeat_count,
                delay,
                timeout: Duration::ZERO,
                retry_count: 0,
                preamble_extension,
            },
            power,
        });
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        self.next_reply(timeout)
    }

    fn set_transmit_power(&mut self, level: TxPower) -> Result<()> {
        self.log.inner.lock().power = level;
        Ok(())
    }

    fn bump_power_up(&mut self) -> Result<()> {
        self.log.inner.lock().power_ups += 1;
        Ok(())
    }

    fn bump_power_down(&mut self) -> Result<()> {
        self.log.inner.lock().power_downs += 1;
        Ok(())
    }

    fn recreate(&mut self) -> Result<()> {
        debug!("recreating scripted radio");
        let mut state = self.log.inner.lock();
        state.recreates += 1;
        state.disconnects += 1;
        state.connects += 1;
        Ok(())
    }
}
