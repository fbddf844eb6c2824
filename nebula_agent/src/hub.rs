//! Broadcast hub: one coordinating task owns the client set; every register,
//! unregister and publish is a command on its queue.
//!
//! Delivery to each client is a non-blocking push into that client's bounded
//! queue. A full queue means the client is not keeping up: the message is
//! dropped for it and the client is removed, which closes its queue.

use bytes::Bytes;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::Envelope;

pub type ClientId = u64;

enum Command {
    Register {
        id: ClientId,
        name: String,
        tx: mpsc::Sender<Bytes>,
    },
    Unregister(ClientId),
    Publish(Bytes),
}

struct Client {
    name: String,
    tx: mpsc::Sender<Bytes>,
}

/// Cheap, cloneable handle to the hub task.
#[derive(Clone)]
pub struct Hub {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    // written only by the hub task
    client_count: Arc<AtomicUsize>,
    queue_capacity: usize,
}

impl Hub {
    /// Start the coordinating task. `queue_capacity` bounds every client's mailbox.
    pub fn spawn(queue_capacity: usize, cancel: CancellationToken) -> (Hub, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let client_count = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run(cmd_rx, client_count.clone(), cancel));
        let hub = Hub {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            client_count,
            queue_capacity: queue_capacity.max(1),
        };
        (hub, task)
    }

    /// Register a new client. Dropping the returned subscription unregisters it.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let _ = self.cmd_tx.send(Command::Register {
            id,
            name: name.clone(),
            tx,
        });
        Subscription {
            id,
            name,
            rx,
            hub: self.clone(),
        }
    }

    /// Remove a client and close its queue. Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        let _ = self.cmd_tx.send(Command::Unregister(id));
    }

    /// Serialize `{"type": kind, "payload": payload}` once and fan it out.
    pub fn publish_json<T: Serialize>(&self, kind: &str, payload: &T) {
        match serde_json::to_vec(&Envelope::new(kind, payload)) {
            Ok(buf) => self.publish(Bytes::from(buf)),
            Err(e) => warn!(kind, "failed to serialize broadcast: {e}"),
        }
    }

    /// Fan out an already serialized message.
    pub fn publish(&self, msg: impl Into<Bytes>) {
        let _ = self.cmd_tx.send(Command::Publish(msg.into()));
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

async fn run(
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    client_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut clients: HashMap<ClientId, Client> = HashMap::new();
    loop {
        let cmd = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(c) => c,
                None => break,
            },
        };
        match cmd {
            Command::Register { id, name, tx } => {
                info!(client = %name, id, "client registered");
                clients.insert(id, Client { name, tx });
            }
            Command::Unregister(id) => {
                // dropping the sender closes the client's queue
                if let Some(c) = clients.remove(&id) {
                    info!(client = %c.name, id, "client unregistered");
                }
            }
            Command::Publish(msg) => {
                let mut gone = Vec::new();
                for (id, c) in &clients {
                    match c.tx.try_send(msg.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(client = %c.name, id, "client too slow, dropping it");
                            gone.push(*id);
                        }
                        Err(TrySendError::Closed(_)) => gone.push(*id),
                    }
                }
                for id in gone {
                    if let Some(c) = clients.remove(&id) {
                        debug!(client = %c.name, id, "client removed after failed delivery");
                    }
                }
            }
        }
        client_count.store(clients.len(), Ordering::Release);
    }
    clients.clear();
    client_count.store(0, Ordering::Release);
    debug!("hub stopped");
}

/// A registered client's receiving end.
pub struct Subscription {
    id: ClientId,
    name: String,
    rx: mpsc::Receiver<Bytes>,
    hub: Hub,
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next message; `None` once the hub has closed this client's queue and it
    /// has been drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next already-queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}
