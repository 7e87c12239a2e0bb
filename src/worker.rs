//! Placement-group worker
//!
//! Drives one [`EcBackend`] from a single task: inbound sub-op messages
//! and store-completion events are interleaved onto the backend in
//! arrival order, which is what gives the group its serialization
//! guarantee. Different groups run their own workers in parallel.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::backend::{BackendEvent, EcBackend};
use crate::messages::Message;

/// Inbound work for one placement group.
pub enum PgWork {
    /// A sub-op message from a peer daemon.
    Message(Message),
    /// Tear the worker down.
    Shutdown,
}

/// Single-task driver for one placement group's backend.
pub struct PgWorker {
    backend: EcBackend,
    work_rx: UnboundedReceiver<PgWork>,
    event_rx: UnboundedReceiver<BackendEvent>,
}

/// Handle for feeding work into a running [`PgWorker`].
#[derive(Clone)]
pub struct PgWorkerHandle {
    tx: UnboundedSender<PgWork>,
}

impl PgWorkerHandle {
    pub fn deliver(&self, msg: Message) {
        let _ = self.tx.send(PgWork::Message(msg));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PgWork::Shutdown);
    }
}

impl PgWorker {
    /// Pair a backend with its event receiver and produce the worker and
    /// its feeding handle.
    pub fn new(backend: EcBackend, event_rx: UnboundedReceiver<BackendEvent>) -> (Self, PgWorkerHandle) {
        let (tx, work_rx) = unbounded_channel();
        (
            Self {
                backend,
                work_rx,
                event_rx,
            },
            PgWorkerHandle { tx },
        )
    }

    /// Access the backend between turns (tests and setup).
    pub fn backend_mut(&mut self) -> &mut EcBackend {
        &mut self.backend
    }

    /// Drain everything currently queued without waiting for more.
    /// Returns the number of items processed.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        loop {
            // Events first so store completions are observed before any
            // message that raced past them.
            if let Ok(event) = self.event_rx.try_recv() {
                self.backend.handle_event(event);
                handled += 1;
                continue;
            }
            match self.work_rx.try_recv() {
                Ok(PgWork::Message(msg)) => {
                    self.backend.handle_message(msg);
                    handled += 1;
                }
                Ok(PgWork::Shutdown) | Err(_) => break,
            }
        }
        handled
    }

    /// Run until shutdown, interleaving messages and events in arrival
    /// order.
    pub async fn run(mut self) {
        info!("placement-group worker running");
        loop {
            tokio::select! {
                biased;
                Some(event) = self.event_rx.recv() => {
                    self.backend.handle_event(event);
                }
                work = self.work_rx.recv() => {
                    match work {
                        Some(PgWork::Message(msg)) => {
                            debug!(kind = msg.kind(), "worker dispatching");
                            self.backend.handle_message(msg);
                        }
                        Some(PgWork::Shutdown) | None => {
                            info!("placement-group worker stopping");
                            return;
                        }
                    }
                }
            }
        }
    }
}
