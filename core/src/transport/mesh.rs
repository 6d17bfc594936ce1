//! Peer-mesh binding
//!
//! Peers join a [`MeshRoom`] and exchange frames directly; there is no
//! central log. Each peer keeps its own copy of the stream and plays the log
//! for whoever joins after it:
//!
//! | Situation | What the peer does |
//! |-----------|--------------------|
//! | Joins an empty room | Announces its own snapshot to itself |
//! | Another peer joins | Sends that peer an `init` from its snapshot |
//! | Receives an `init` | Accepts only the first one per connection |
//! | Receives an ack | Serves catch-up from its stream copy |
//! | Sends a batch | Stamps ids from its clock, echoes to itself, fans out |
//! | Sends while alone | Queues the batch, replays it on first contact |
//!
//! Every peer stamps from a clock salted with its room slot, so stamps are
//! unique across the room and double as the de-duplication key. Batches
//! from different peers can cross in flight, so stamps are not delivered to
//! the local replica as-is: each peer appends every new stamp to its stream
//! copy under a local position, and the replica only ever sees those
//! positions, which strictly increase.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Transport, TransportEvent};
use crate::error::{Result, SyncError};
use crate::ids::{now_millis, SequenceClock, SequenceId};
use crate::operation::Operation;
use crate::protocol::{ClientMessage, Init, ServerMessage};
use crate::tree::SerializedDocument;

pub type PeerId = u64;

/// Frames carry operations under their origin stamps
#[derive(Debug, Clone)]
enum PeerFrame {
    Joined(PeerId),
    Init { from: PeerId, init: Init },
    InitAck { from: PeerId, last: SequenceId },
    Batch(Vec<Operation>),
}

#[derive(Default)]
struct RoomState {
    peers: HashMap<PeerId, mpsc::UnboundedSender<PeerFrame>>,
    next_id: PeerId,
    next_slot: u64,
}

/// Shared room peers meet in
#[derive(Clone, Default)]
pub struct MeshRoom {
    state: Arc<Mutex<RoomState>>,
}

impl MeshRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// New peer with an empty stream copy and its own clock slot
    pub fn transport(&self) -> MeshTransport {
        let slot = {
            let mut state = self.state.lock();
            state.next_slot += 1;
            state.next_slot
        };
        MeshTransport {
            room: self.clone(),
            link: None,
            inbox: VecDeque::new(),
            stream: Vec::new(),
            origins: HashSet::new(),
            stamps: SequenceClock::salted(slot),
            positions: SequenceClock::new(),
            document: SerializedDocument::empty(),
            persisted_at: SequenceId::ZERO,
            init_source: None,
            streamed: false,
            queued: Vec::new(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Register a peer; returns its id, its inbox and whether it is alone
    fn join(&self) -> (PeerId, mpsc::UnboundedReceiver<PeerFrame>, bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;

        let alone = state.peers.is_empty();
        state
            .peers
            .retain(|_, peer| peer.send(PeerFrame::Joined(id)).is_ok());
        state.peers.insert(id, tx);
        (id, rx, alone)
    }

    fn leave(&self, id: PeerId) {
        self.state.lock().peers.remove(&id);
    }

    fn send_to(&self, id: PeerId, frame: PeerFrame) {
        let mut state = self.state.lock();
        let delivered = state.peers.get(&id).map_or(false, |peer| peer.send(frame).is_ok());
        if !delivered {
            state.peers.remove(&id);
        }
    }

    /// Fan out to every peer but `from`; returns how many received it
    fn broadcast(&self, from: PeerId, frame: PeerFrame) -> usize {
        let mut state = self.state.lock();
        state
            .peers
            .retain(|id, peer| *id == from || peer.send(frame.clone()).is_ok());
        state.peers.len().saturating_sub(1)
    }
}

/// An operation in a peer's stream copy
#[derive(Debug, Clone)]
struct StreamEntry {
    /// Local position, as handed to this peer's replica
    position: SequenceId,

    /// Operation under its origin stamp
    operation: Operation,
}

/// One peer's connection to a [`MeshRoom`]
///
/// The stream copy, clocks and persisted snapshot outlive individual
/// connections, so a peer that reconnects can still serve catch-up.
pub struct MeshTransport {
    room: MeshRoom,
    link: Option<(PeerId, mpsc::UnboundedReceiver<PeerFrame>)>,
    inbox: VecDeque<TransportEvent>,
    stream: Vec<StreamEntry>,
    origins: HashSet<SequenceId>,
    stamps: SequenceClock,
    positions: SequenceClock,
    document: SerializedDocument,
    persisted_at: SequenceId,
    init_source: Option<PeerId>,
    streamed: bool,
    queued: Vec<Operation>,
}

impl MeshTransport {
    pub fn peer_id(&self) -> Option<PeerId> {
        self.link.as_ref().map(|(id, _)| *id)
    }

    /// Number of operations in this peer's stream copy
    pub fn stream_len(&self) -> usize {
        self.stream.len()
    }

    fn snapshot(&self) -> Init {
        Init {
            last_sequence_id: self.persisted_at,
            oldest_retained_sequence_id: None,
            serialized_document: self.document.clone(),
        }
    }

    /// Entries after a local position, in stream order
    fn catch_up(&self, from: SequenceId) -> impl Iterator<Item = &StreamEntry> {
        self.stream.iter().filter(move |entry| entry.position > from)
    }

    /// Append an operation seen for the first time; returns it under its
    /// local position
    fn record(&mut self, operation: Operation) -> Option<Operation> {
        let origin = operation.sequence?;
        self.stamps.observe(origin);
        if !self.origins.insert(origin) {
            return None;
        }
        let position = self.positions.tick();
        let local = operation.clone().with_sequence(position);
        self.stream.push(StreamEntry {
            position,
            operation,
        });
        Some(local)
    }

    /// Hand operations queued while alone to the peers now present
    fn replay_queued(&mut self, me: PeerId) {
        if self.queued.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.queued);
        info!(peer = me, count = ops.len(), "replaying operations queued while alone");
        self.room.broadcast(me, PeerFrame::Batch(ops));
    }

    fn handle_frame(&mut self, me: PeerId, frame: PeerFrame) -> Option<TransportEvent> {
        match frame {
            PeerFrame::Joined(peer) => {
                debug!(peer = me, joined = peer, "announcing snapshot to new peer");
                self.room.send_to(
                    peer,
                    PeerFrame::Init {
                        from: me,
                        init: self.snapshot(),
                    },
                );
                self.replay_queued(me);
                None
            }
            PeerFrame::Init { from, init } => {
                self.replay_queued(me);
                if self.init_source.is_some() {
                    return None;
                }
                self.init_source = Some(from);
                self.positions.observe(init.last_sequence_id);
                Some(TransportEvent::Message(ServerMessage::Init(init)))
            }
            PeerFrame::InitAck { from, last } => {
                let operations: Vec<Operation> =
                    self.catch_up(last).map(|entry| entry.operation.clone()).collect();
                debug!(peer = me, to = from, count = operations.len(), "serving catch-up");
                if !operations.is_empty() {
                    self.room.send_to(from, PeerFrame::Batch(operations));
                }
                None
            }
            PeerFrame::Batch(operations) => {
                // Catch-up from the init source covers anything sent before it
                if self.init_source.is_none() {
                    debug!(peer = me, count = operations.len(), "batch before init; skipped");
                    return None;
                }
                let fresh: Vec<Operation> =
                    operations.into_iter().filter_map(|op| self.record(op)).collect();
                if fresh.is_empty() {
                    return None;
                }
                Some(TransportEvent::Message(ServerMessage::OperationBatch { operations: fresh }))
            }
        }
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let (id, rx, alone) = self.room.join();
        info!(peer = id, alone, "joined mesh room");
        self.link = Some((id, rx));
        self.inbox.push_back(TransportEvent::Opened);
        if alone {
            self.init_source = Some(id);
            self.inbox
                .push_back(TransportEvent::Message(ServerMessage::Init(self.snapshot())));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some((id, _)) = self.link.take() {
            self.room.leave(id);
        }
        self.inbox.clear();
        self.init_source = None;
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        let Some(me) = self.peer_id() else {
            return Err(SyncError::Transport("not connected".into()));
        };

        match message {
            ClientMessage::InitAck { last_sequence_id } => {
                let resumed = std::mem::replace(&mut self.streamed, true);
                match self.init_source {
                    Some(source) if source == me => {
                        let operations: Vec<Operation> = self
                            .catch_up(last_sequence_id)
                            .map(|entry| entry.operation.clone().with_sequence(entry.position))
                            .collect();
                        if !operations.is_empty() {
                            self.inbox.push_back(TransportEvent::Message(
                                ServerMessage::OperationBatch { operations },
                            ));
                        }
                    }
                    Some(source) => {
                        // A resumed replica counts in our positions, not the source's;
                        // ask for everything and drop what we already have
                        let last = if resumed {
                            SequenceId::ZERO
                        } else {
                            last_sequence_id
                        };
                        self.room
                            .send_to(source, PeerFrame::InitAck { from: me, last });
                    }
                    None => {
                        return Err(SyncError::Protocol("ack without a pending init".into()));
                    }
                }
            }
            ClientMessage::OperationBatch { operations } => {
                let now = now_millis().max(0) as u64;
                let stamped: Vec<Operation> = operations
                    .into_iter()
                    .map(|op| op.with_sequence(self.stamps.tick_at(now)))
                    .collect();
                let echo: Vec<Operation> = stamped
                    .iter()
                    .filter_map(|op| self.record(op.clone()))
                    .collect();
                self.inbox
                    .push_back(TransportEvent::Message(ServerMessage::OperationBatch {
                        operations: echo,
                    }));
                if self.room.broadcast(me, PeerFrame::Batch(stamped.clone())) == 0 {
                    self.queued.extend(stamped);
                }
            }
            ClientMessage::PersistSnapshot {
                last_sequence_id,
                serialized_document,
            } => {
                if last_sequence_id >= self.persisted_at {
                    self.document = serialized_document;
                    self.persisted_at = last_sequence_id;
                }
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.inbox.pop_front() {
                return Some(event);
            }
            let Some((me, rx)) = self.link.as_mut() else {
                return std::future::pending().await;
            };
            let me = *me;
            let frame = rx.recv().await;
            match frame {
                Some(frame) => {
                    if let Some(event) = self.handle_frame(me, frame) {
                        return Some(event);
                    }
                }
                None => {
                    self.link = None;
                    self.init_source = None;
                    return Some(TransportEvent::Closed);
                }
            }
        }
    }
}
