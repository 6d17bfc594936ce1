//! Broker-relayed binding
//!
//! A relay that owns the log for one document. On connect it announces the
//! persisted snapshot (`init`); once the replica acknowledges with its
//! position it streams the catch-up and then every new batch, stamped by the
//! log, to every streaming connection including the author's own.
//!
//! Connections carry JSON text frames in both directions, as a socket would.
//! A frame that does not decode is logged and dropped; the connection stays
//! open.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent};
use crate::error::{Result, SyncError};
use crate::log::{LogStore, MemoryLog};
use crate::protocol::{decode_client, decode_server, encode_client, encode_server};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::DocumentId;

type ConnectionId = u64;

struct Connection {
    tx: mpsc::UnboundedSender<String>,
    streaming: bool,
}

struct BrokerState<L> {
    document_id: DocumentId,
    log: L,
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
}

impl<L: LogStore> BrokerState<L> {
    fn send(&mut self, id: ConnectionId, message: &ServerMessage) {
        let frame = match encode_server(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection = id, error = %err, "could not encode frame");
                return;
            }
        };
        let delivered = self
            .connections
            .get(&id)
            .map_or(false, |conn| conn.tx.send(frame).is_ok());
        if !delivered {
            self.connections.remove(&id);
        }
    }
}

/// Relay owning the log of one document
pub struct Broker<L: LogStore = MemoryLog> {
    state: Arc<Mutex<BrokerState<L>>>,
}

impl<L: LogStore> Clone for Broker<L> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl Broker<MemoryLog> {
    /// Broker over a fresh in-memory log
    pub fn in_memory(document_id: impl Into<DocumentId>) -> Self {
        Self::new(document_id, MemoryLog::new())
    }
}

impl<L: LogStore> Broker<L> {
    pub fn new(document_id: impl Into<DocumentId>, log: L) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                document_id: document_id.into(),
                log,
                connections: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    /// New unconnected transport for a replica
    pub fn transport(&self) -> BrokerTransport<L> {
        BrokerTransport {
            broker: self.clone(),
            connection: None,
            opened: false,
        }
    }

    /// Run a closure against the log (inspection, trimming)
    pub fn with_log<R>(&self, f: impl FnOnce(&mut L) -> R) -> R {
        f(&mut self.state.lock().log)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Drop every connection, as if the relay restarted
    pub fn disconnect_all(&self) {
        let dropped = std::mem::take(&mut self.state.lock().connections);
        info!(count = dropped.len(), "broker dropped all connections");
    }

    fn attach(&self) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.connections.insert(
            id,
            Connection {
                tx,
                streaming: false,
            },
        );

        let init = state.log.snapshot(&state.document_id).to_init();
        debug!(connection = id, last = %init.last_sequence_id, "announcing snapshot");
        state.send(id, &ServerMessage::Init(init));
        (id, rx)
    }

    fn detach(&self, id: ConnectionId) {
        self.state.lock().connections.remove(&id);
    }

    /// Take one text frame from a connection
    fn receive(&self, id: ConnectionId, frame: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&id) {
            return Err(SyncError::Transport("connection closed by broker".into()));
        }
        match decode_client(frame) {
            Ok(message) => {
                Self::handle(&mut state, id, message);
                Ok(())
            }
            Err(err) => {
                warn!(connection = id, error = %err, "dropping malformed frame");
                Ok(())
            }
        }
    }

    fn handle(state: &mut BrokerState<L>, id: ConnectionId, message: ClientMessage) {
        let document_id = state.document_id.clone();

        match message {
            ClientMessage::InitAck { last_sequence_id } => {
                let catch_up = state.log.subscribe(&document_id, last_sequence_id);
                debug!(connection = id, from = %last_sequence_id, count = catch_up.len(), "streaming");
                if !catch_up.is_empty() {
                    state.send(id, &ServerMessage::OperationBatch { operations: catch_up });
                }
                if let Some(conn) = state.connections.get_mut(&id) {
                    conn.streaming = true;
                }
            }
            ClientMessage::OperationBatch { operations } => {
                let stamped: Vec<_> = operations
                    .into_iter()
                    .map(|mut op| {
                        op.sequence = Some(state.log.append(&document_id, op.clone()));
                        op
                    })
                    .collect();
                let streaming: Vec<ConnectionId> = state
                    .connections
                    .iter()
                    .filter(|(_, conn)| conn.streaming)
                    .map(|(id, _)| *id)
                    .collect();
                let batch = ServerMessage::OperationBatch { operations: stamped };
                for target in streaming {
                    state.send(target, &batch);
                }
            }
            ClientMessage::PersistSnapshot {
                last_sequence_id,
                serialized_document,
            } => {
                if let Err(err) =
                    state
                        .log
                        .persist_snapshot(&document_id, serialized_document, last_sequence_id)
                {
                    warn!(connection = id, error = %err, "rejected snapshot");
                }
            }
        }
    }
}

/// A replica's connection to a [`Broker`]
pub struct BrokerTransport<L: LogStore = MemoryLog> {
    broker: Broker<L>,
    connection: Option<(ConnectionId, mpsc::UnboundedReceiver<String>)>,
    opened: bool,
}

#[async_trait]
impl<L: LogStore + 'static> Transport for BrokerTransport<L> {
    async fn connect(&mut self) -> Result<()> {
        if self.connection.is_none() {
            self.connection = Some(self.broker.attach());
            self.opened = true;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some((id, _)) = self.connection.take() {
            self.broker.detach(id);
        }
        self.opened = false;
    }

    fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        match &self.connection {
            Some((id, _)) => self.broker.receive(*id, &encode_client(&message)?),
            None => Err(SyncError::Transport("not connected".into())),
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if std::mem::take(&mut self.opened) {
            return Some(TransportEvent::Opened);
        }
        loop {
            let Some((id, rx)) = self.connection.as_mut() else {
                return std::future::pending().await;
            };
            let id = *id;
            let Some(frame) = rx.recv().await else {
                self.connection = None;
                return Some(TransportEvent::Closed);
            };
            match decode_server(&frame) {
                Ok(message) => return Some(TransportEvent::Message(message)),
                Err(err) => warn!(connection = id, error = %err, "dropping malformed frame"),
            }
        }
    }
}
