//! Worker thread owning the exchange engine.
//!
//! Callers hand requests to the worker through a rendezvous channel, so a
//! request is only accepted while the worker is idle. The reply is delivered
//! as soon as it is reassembled; the worker then closes the conversation with
//! the pod on its own before accepting the next request.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use podlink_frame::PodMessage;
use podlink_transport::{PacketRadio, RadioError};
use tracing::{debug, error, info, warn};

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::exchange::{Exchange, ExchangeRequest};
use crate::session::RadioCounters;

const TARGET: &str = "podlink::exchange";

/// Observable phase of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Adapter link released or not yet established.
    Idle,
    /// Waiting for the next request.
    AwaitingRequest,
    Exchanging,
    /// Reply delivered; closing the conversation.
    Finalizing,
    /// Last exchange failed; the error went to the caller.
    Failed,
    Stopped,
}

type ClosedHook = Box<dyn FnMut(RadioCounters) + Send>;

enum Job {
    Exchange {
        request: ExchangeRequest,
        reply: Sender<Result<PodMessage>>,
    },
    Shutdown,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<EngineState>,
    counters: Mutex<RadioCounters>,
}

impl Shared {
    fn set_state(&self, state: EngineState) {
        *self.state.lock() = state;
    }
}

/// Cloneable entry point to a running [`PdmRadio`].
#[derive(Clone)]
pub struct RadioHandle {
    jobs: Sender<Job>,
    shared: Arc<Shared>,
    ready_timeout: std::time::Duration,
}

impl RadioHandle {
    /// Deliver one message and wait for the pod's reply.
    ///
    /// Blocks up to the configured ready timeout for the engine to become
    /// idle and fails with [`ExchangeError::Busy`] otherwise.
    pub fn send_message_get_message(&self, request: ExchangeRequest) -> Result<PodMessage> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        let job = Job::Exchange {
            request,
            reply: reply_tx,
        };
        match self.jobs.send_timeout(job, self.ready_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(ExchangeError::Busy),
            Err(SendTimeoutError::Disconnected(_)) => return Err(ExchangeError::Shutdown),
        }
        reply_rx.recv().map_err(|_| ExchangeError::Shutdown)?
    }

    /// [`send_message_get_message`](Self::send_message_get_message) on the
    /// blocking thread pool.
    #[cfg(feature = "async")]
    pub async fn send_async(&self, request: ExchangeRequest) -> Result<PodMessage> {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.send_message_get_message(request))
            .await
            .map_err(|_| ExchangeError::Shutdown)?
    }

    /// Counters as of the last completed exchange, including the pending
    /// final acknowledgment.
    pub fn counters(&self) -> RadioCounters {
        *self.shared.counters.lock()
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }
}

impl std::fmt::Debug for RadioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioHandle")
            .field("state", &self.state())
            .field("counters", &self.counters())
            .finish()
    }
}

/// Exchange engine running on a dedicated thread.
pub struct PdmRadio {
    handle: RadioHandle,
    worker: Option<JoinHandle<()>>,
}

impl PdmRadio {
    /// Spawn the worker. The adapter is initialized on the worker thread.
    pub fn start<R>(radio: R, counters: RadioCounters, config: ExchangeConfig) -> Result<Self>
    where
        R: PacketRadio + 'static,
    {
        Self::spawn(radio, counters, config, None)
    }

    /// Like [`start`](Self::start), and call `on_closed` from the worker
    /// whenever closing a conversation moved the counters past the ones
    /// published with the reply.
    pub fn start_with_hook<R, F>(
        radio: R,
        counters: RadioCounters,
        config: ExchangeConfig,
        on_closed: F,
    ) -> Result<Self>
    where
        R: PacketRadio + 'static,
        F: FnMut(RadioCounters) + Send + 'static,
    {
        Self::spawn(radio, counters, config, Some(Box::new(on_closed)))
    }

    fn spawn<R>(
        radio: R,
        counters: RadioCounters,
        config: ExchangeConfig,
        on_closed: Option<ClosedHook>,
    ) -> Result<Self>
    where
        R: PacketRadio + 'static,
    {
        let (jobs_tx, jobs_rx) = channel::bounded(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState::Idle),
            counters: Mutex::new(counters),
        });
        let handle = RadioHandle {
            jobs: jobs_tx,
            shared: Arc::clone(&shared),
            ready_timeout: config.ready_timeout,
        };

        let exchange = Exchange::new(radio, counters, config);
        let worker = thread::Builder::new()
            .name("pdm-radio".to_string())
            .spawn(move || run(exchange, jobs_rx, shared, on_closed))
            .map_err(RadioError::Io)?;

        info!(target: TARGET, address = format_args!("{:08x}", counters.radio_address), "radio worker started");
        Ok(Self {
            handle,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> RadioHandle {
        self.handle.clone()
    }

    pub fn send_message_get_message(&self, request: ExchangeRequest) -> Result<PodMessage> {
        self.handle.send_message_get_message(request)
    }

    pub fn counters(&self) -> RadioCounters {
        self.handle.counters()
    }

    pub fn state(&self) -> EngineState {
        self.handle.state()
    }

    /// Stop the worker once the current exchange, if any, has finished, and
    /// release the adapter.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        // a failed send means the worker is already gone
        let _ = self.handle.jobs.send(Job::Shutdown);
        if worker.join().is_err() {
            error!(target: TARGET, "radio worker panicked");
        }
    }
}

impl Drop for PdmRadio {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<R: PacketRadio>(
    mut exchange: Exchange<R>,
    jobs: Receiver<Job>,
    shared: Arc<Shared>,
    mut on_closed: Option<ClosedHook>,
) {
    let mut connected = exchange.initialize(exchange.config().radio_init_retries);
    if !connected {
        warn!(target: TARGET, "radio unavailable, retrying on first request");
    }
    let idle_disconnect = exchange.config().idle_disconnect;

    loop {
        shared.set_state(if connected {
            EngineState::AwaitingRequest
        } else {
            EngineState::Idle
        });

        let job = match jobs.recv_timeout(idle_disconnect) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                if connected {
                    exchange.disconnect();
                    connected = false;
                    shared.set_state(EngineState::Idle);
                }
                match jobs.recv() {
                    Ok(job) => job,
                    Err(_) => break,
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let (request, reply) = match job {
            Job::Exchange { request, reply } => (request, reply),
            Job::Shutdown => break,
        };

        shared.set_state(EngineState::Exchanging);
        let result = exchange.send_and_get(&request);
        connected = true;

        match result {
            Ok(response) => {
                shared.set_state(EngineState::Finalizing);
                let ack = exchange.prepare_final_ack(request.ack_address_override);
                *shared.counters.lock() = exchange.counters();
                if reply.send(Ok(response)).is_err() {
                    debug!(target: TARGET, "caller went away before the reply arrived");
                }
                if let Err(err) = exchange.send_final(ack) {
                    warn!(target: TARGET, error = %err, "failed to close conversation");
                }
                let closed = exchange.counters();
                let published = std::mem::replace(&mut *shared.counters.lock(), closed);
                if closed != published {
                    debug!(target: TARGET, packet_sequence = closed.packet_sequence, "counters moved while closing");
                    if let Some(hook) = on_closed.as_mut() {
                        hook(closed);
                    }
                }
            }
            Err(err) => {
                shared.set_state(EngineState::Failed);
                *shared.counters.lock() = exchange.counters();
                warn!(target: TARGET, error = %err, "exchange failed");
                let _ = reply.send(Err(err));
            }
        }
    }

    exchange.disconnect();
    shared.set_state(EngineState::Stopped);
    info!(target: TARGET, "radio worker stopped");
}
