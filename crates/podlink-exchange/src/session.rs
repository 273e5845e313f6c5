//! Persistent session state and nonce-bearing commands.

use std::sync::Arc;

use parking_lot::Mutex;
use podlink_frame::PodMessage;
use podlink_transport::PacketRadio;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result, StoreError};
use crate::exchange::ExchangeRequest;
use crate::nonce::{Nonce, NonceState};
use crate::radio::{PdmRadio, RadioHandle};

const TARGET: &str = "podlink::exchange";

/// Sequence counters shared with one pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RadioCounters {
    /// Address the pod answers to.
    pub radio_address: u32,
    /// 4-bit message sequence for the next request.
    pub message_sequence: u8,
    /// 5-bit sequence for the next packet we send.
    pub packet_sequence: u8,
}

impl RadioCounters {
    pub fn new(radio_address: u32) -> Self {
        Self {
            radio_address,
            message_sequence: 0,
            packet_sequence: 0,
        }
    }

    pub fn reset(&mut self) {
        self.message_sequence = 0;
        self.packet_sequence = 0;
    }
}

/// Everything that must survive a restart to keep talking to a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub counters: RadioCounters,
    #[serde(default)]
    pub nonce: Option<NonceState>,
}

impl SessionState {
    pub fn new(radio_address: u32) -> Self {
        Self {
            counters: RadioCounters::new(radio_address),
            nonce: None,
        }
    }
}

/// Durable storage for [`SessionState`].
pub trait SessionStore: Send {
    fn load(&mut self) -> std::result::Result<Option<SessionState>, StoreError>;
    fn save(&mut self, state: &SessionState) -> std::result::Result<(), StoreError>;
}

/// Session store kept in memory. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemorySlot>>,
}

#[derive(Debug, Default)]
struct MemorySlot {
    state: Option<SessionState>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SessionState) -> Self {
        let store = Self::new();
        store.inner.lock().state = Some(state);
        store
    }

    pub fn state(&self) -> Option<SessionState> {
        self.inner.lock().state.clone()
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        self.inner.lock().saves
    }
}

impl SessionStore for MemoryStore {
    fn load(&mut self) -> std::result::Result<Option<SessionState>, StoreError> {
        Ok(self.inner.lock().state.clone())
    }

    fn save(&mut self, state: &SessionState) -> std::result::Result<(), StoreError> {
        let mut slot = self.inner.lock();
        slot.state = Some(state.clone());
        slot.saves += 1;
        Ok(())
    }
}

/// Conversation with one pod: the exchange engine plus the nonce generator,
/// persisted after every exchange.
pub struct PodSession<S: SessionStore> {
    radio: PdmRadio,
    nonce: Option<Nonce>,
    persisted: Arc<Mutex<Persisted<S>>>,
}

/// Store plus the nonce state last handed to it. The radio worker saves
/// through it when closing a conversation moves the counters.
struct Persisted<S> {
    store: S,
    nonce: Option<NonceState>,
}

impl<S: SessionStore + 'static> PodSession<S> {
    /// Resume the session held by `store`, or start from `initial` when the
    /// store is empty.
    pub fn open<R>(radio: R, mut store: S, initial: SessionState, config: ExchangeConfig) -> Result<Self>
    where
        R: PacketRadio + 'static,
    {
        let state = store.load()?.unwrap_or(initial);
        let nonce = match &state.nonce {
            Some(saved) => Some(Nonce::restore(saved).ok_or_else(|| {
                StoreError("stored nonce state is malformed".to_string())
            })?),
            None => None,
        };

        let persisted = Arc::new(Mutex::new(Persisted {
            store,
            nonce: state.nonce.clone(),
        }));
        let on_closed = Arc::clone(&persisted);
        let radio = PdmRadio::start_with_hook(radio, state.counters, config, move |counters| {
            let mut persisted = on_closed.lock();
            let state = SessionState {
                counters,
                nonce: persisted.nonce.clone(),
            };
            if let Err(err) = persisted.store.save(&state) {
                error!(target: TARGET, error = %err, "failed to persist session after closing conversation");
            }
        })?;

        Ok(Self {
            radio,
            nonce,
            persisted,
        })
    }

    /// Install a nonce generator, typically right after pairing.
    pub fn set_nonce(&mut self, nonce: Nonce) -> Result<()> {
        self.nonce = Some(nonce);
        self.save()
    }

    pub fn nonce(&self) -> Option<&Nonce> {
        self.nonce.as_ref()
    }

    pub fn counters(&self) -> RadioCounters {
        self.radio.counters()
    }

    pub fn handle(&self) -> RadioHandle {
        self.radio.handle()
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            counters: self.radio.counters(),
            nonce: self.nonce.as_ref().map(Nonce::state),
        }
    }

    /// Send a command and return the pod's reply.
    ///
    /// Nonce-bearing messages are stamped with the next nonce. When the pod
    /// rejects the nonce with a sync word, the generator is reseeded and the
    /// command is resent once with the same message sequence.
    pub fn send_command(&mut self, request: ExchangeRequest) -> Result<PodMessage> {
        if !request.message.has_nonce() {
            return self.exchange(request);
        }

        let nonce = self.nonce.as_mut().ok_or(ExchangeError::NonceUnavailable)?;
        let stamped = request.with_message(request.message.with_nonce(nonce.next()));
        let response = self.exchange(stamped)?;

        let Some(sync_word) = response.nonce_sync_word() else {
            return Ok(response);
        };
        // the pod answers with the request's sequence plus one
        let request_sequence = (response.sequence() + 15) % 16;
        info!(
            target: TARGET,
            sync_word = format_args!("{sync_word:04x}"),
            request_sequence,
            "pod rejected nonce, resynchronizing"
        );

        let nonce = self.nonce.as_mut().ok_or(ExchangeError::NonceUnavailable)?;
        nonce.sync(sync_word, request_sequence);
        let retry = request
            .with_message(request.message.with_nonce(nonce.next()))
            .message_sequence(request_sequence);
        let response = self.exchange(retry)?;

        if response.nonce_sync_word().is_some() {
            warn!(target: TARGET, "pod rejected nonce after resynchronization");
            return Err(ExchangeError::NonceDesync);
        }
        Ok(response)
    }

    /// Stop the radio worker and persist the final state.
    pub fn close(mut self) -> Result<()> {
        self.radio.stop();
        self.save()
    }

    fn exchange(&mut self, request: ExchangeRequest) -> Result<PodMessage> {
        let result = self.radio.send_message_get_message(request);
        match (result, self.save()) {
            (Ok(response), Ok(())) => Ok(response),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(store_err)) => {
                error!(target: TARGET, error = %store_err, "failed to persist session after failed exchange");
                Err(err)
            }
        }
    }

    fn save(&mut self) -> Result<()> {
        // counters are read under the lock so a concurrent save from the
        // worker cannot be overwritten with older ones
        let mut persisted = self.persisted.lock();
        persisted.nonce = self.nonce.as_ref().map(Nonce::state);
        let state = SessionState {
            counters: self.radio.counters(),
            nonce: persisted.nonce.clone(),
        };
        persisted.store.save(&state).map_err(|err| {
            error!(target: TARGET, error = %err, "failed to persist session");
            ExchangeError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_reset() {
        let mut counters = RadioCounters {
            radio_address: 0x1f01_482a,
            message_sequence: 7,
            packet_sequence: 19,
        };
        counters.reset();
        assert_eq!(counters, RadioCounters::new(0x1f01_482a));
    }

    #[test]
    fn session_state_json() {
        let mut nonce = Nonce::new(43962, 940182);
        nonce.next();
        let state = SessionState {
            counters: RadioCounters {
                radio_address: 0x1f01_482a,
                message_sequence: 3,
                packet_sequence: 21,
            },
            nonce: Some(nonce.state()),
        };

        let json = serde_json::to_string(&state).unwrap();
        let parsed: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn session_state_without_nonce_field() {
        let parsed: SessionState = serde_json::from_str(
            r#"{"counters":{"radio_address":1,"message_sequence":2,"packet_sequence":3}}"#,
        )
        .unwrap();
        assert_eq!(parsed.nonce, None);
        assert_eq!(parsed.counters.packet_sequence, 3);
    }

    #[test]
    fn counters_moved_while_closing_are_persisted() {
        use podlink_frame::{PacketType, PdmMessage};
        use podlink_transport::{ScriptedRadio, TransmitParams};
        use std::time::{Duration, Instant};

        use crate::radio::EngineState;

        const ADDR: u32 = 0x1f01_482a;
        let pod_reply = |packet_sequence| {
            let mut packets = PdmMessage::single(0x02, vec![1, 2, 3])
                .get_radio_packets(ADDR, 1, ADDR, packet_sequence, false)
                .unwrap();
            packets[0].packet_type = PacketType::Pod;
            packets[0].serialize()
        };
        let config = ExchangeConfig {
            exchange_params: TransmitParams {
                timeout: Duration::from_millis(1),
                ..TransmitParams::exchange()
            },
            final_ack_params: TransmitParams {
                timeout: Duration::from_millis(1),
                ..TransmitParams::final_ack()
            },
            final_ack_silence: Duration::from_millis(1),
            ..ExchangeConfig::default()
        };

        let radio = ScriptedRadio::new();
        let log = radio.log();
        log.push_packet(&pod_reply(1));
        // the pod missed the final ack and sends again
        log.push_packet(&pod_reply(3));

        let store = MemoryStore::new();
        let mut session = PodSession::open(radio, store.clone(), SessionState::new(ADDR), config).unwrap();
        session
            .send_command(ExchangeRequest::new(PdmMessage::single(0x0e, vec![0])))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.handle().state() == EngineState::Finalizing {
            assert!(Instant::now() < deadline, "conversation never closed");
            std::thread::sleep(Duration::from_millis(1));
        }

        let saved = store.state().unwrap();
        assert_eq!(saved.counters, session.counters());
        assert_eq!(saved.counters.packet_sequence, 5);
        assert_eq!(store.saves(), 2);
    }

    #[test]
    fn memory_store_shares_slot() {
        let store = MemoryStore::new();
        let mut writer = store.clone();
        writer.save(&SessionState::new(5)).unwrap();

        assert_eq!(store.saves(), 1);
        assert_eq!(store.state(), Some(SessionState::new(5)));
        assert_eq!(writer.load().unwrap(), Some(SessionState::new(5)));
    }
}
