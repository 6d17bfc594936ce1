//! Session driver
//!
//! Runs a [`Replica`] against a [`Transport`] on a tokio task. The task owns
//! both; callers talk to it through a cloneable [`SessionHandle`] that sends
//! commands over a channel and awaits a oneshot reply.
//!
//! The driver's loop multiplexes:
//!
//! - commands from handles (edits, undo, redo, connection control)
//! - transport events (open, inbound messages, close)
//! - the flush debounce deadline
//! - the cursor, persist and reconnect intervals
//!
//! Reconnection stops for good once the replica is desynced.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::ConnectionStatus;
use crate::error::{Result, SyncError};
use crate::ids::{now_millis, SequenceId};
use crate::replica::{Replica, ReplicaEvent};
use crate::transport::{Transport, TransportEvent};
use crate::tree::{HostTree, SerializedDocument};

type EditFn<T> = Box<dyn FnOnce(&mut Replica<T>) + Send>;

// ============================================================================
// Commands
// ============================================================================

enum Command<T: HostTree> {
    Edit(EditFn<T>),
    Undo { reply: oneshot::Sender<bool> },
    Redo { reply: oneshot::Sender<bool> },
    Flush { reply: oneshot::Sender<()> },
    Disconnect { reply: oneshot::Sender<()> },
    Reconnect { reply: oneshot::Sender<()> },
    Inspect { reply: oneshot::Sender<SessionState> },
    Close { reply: oneshot::Sender<()> },
}

/// Point-in-time view of a running session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub status: ConnectionStatus,
    pub last_seen: Option<SequenceId>,
    pub text: String,
    pub document: SerializedDocument,
    pub pending: bool,
}

fn shutdown() -> SyncError {
    SyncError::Transport("session task has shut down".into())
}

// ============================================================================
// SessionHandle
// ============================================================================

/// Cloneable handle to a running session
pub struct SessionHandle<T: HostTree> {
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T: HostTree> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: HostTree + Send + 'static> SessionHandle<T> {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command<T>) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| shutdown())?;
        rx.await.map_err(|_| shutdown())
    }

    /// Edit the host tree; the change is captured and flushed after the
    /// debounce window
    pub async fn edit<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: EditFn<T> = Box::new(move |replica| {
            let _ = reply.send(replica.edit(f));
        });
        self.tx.send(Command::Edit(job)).map_err(|_| shutdown())?;
        rx.await.map_err(|_| shutdown())
    }

    pub async fn undo(&self) -> Result<bool> {
        self.request(|reply| Command::Undo { reply }).await
    }

    pub async fn redo(&self) -> Result<bool> {
        self.request(|reply| Command::Redo { reply }).await
    }

    /// Send pending operations now instead of waiting for the debounce
    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Go offline; edits keep queueing until [`reconnect`](Self::reconnect)
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.request(|reply| Command::Inspect { reply }).await
    }

    pub async fn text(&self) -> Result<String> {
        Ok(self.state().await?.text)
    }

    pub async fn export(&self) -> Result<SerializedDocument> {
        Ok(self.state().await?.document)
    }

    pub async fn status(&self) -> Result<ConnectionStatus> {
        Ok(self.state().await?.status)
    }

    /// Stop the session and close the transport
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }
}

// ============================================================================
// Session actor
// ============================================================================

/// Start a session on the current tokio runtime
///
/// Returns the handle and the stream of [`ReplicaEvent`]s. The transport is
/// connected immediately.
pub fn spawn<T, X>(
    replica: Replica<T>,
    transport: X,
) -> (SessionHandle<T>, mpsc::UnboundedReceiver<ReplicaEvent>)
where
    T: HostTree + Send + 'static,
    X: Transport + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = Session {
        replica,
        transport,
        should_reconnect: true,
        flush_at: None,
        events: events_tx,
    };
    tokio::spawn(session.run(rx));
    (SessionHandle { tx }, events_rx)
}

struct Session<T: HostTree, X: Transport> {
    replica: Replica<T>,
    transport: X,
    should_reconnect: bool,
    flush_at: Option<Instant>,
    events: mpsc::UnboundedSender<ReplicaEvent>,
}

impl<T, X> Session<T, X>
where
    T: HostTree + Send + 'static,
    X: Transport + 'static,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<T>>) {
        let config = self.replica.config().clone();
        let mut cursor = interval(config.cursor_interval());
        let mut persist = interval(config.persist_interval());
        let mut reconnect = interval(config.reconnect_interval());
        for timer in [&mut cursor, &mut persist, &mut reconnect] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(author = self.replica.author(), "session started");
        self.connect().await;

        loop {
            let flushing = self.flush_at.is_some();
            let deadline = self.flush_at.unwrap_or_else(Instant::now);
            let may_reconnect = self.should_reconnect
                && !self.transport.is_open()
                && !self.replica.is_desynced();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = self.transport.next_event() => {
                    if let Some(event) = event {
                        self.handle_transport(event).await;
                    }
                }
                _ = sleep_until(deadline), if flushing => {
                    self.flush_at = None;
                    self.flush().await;
                }
                _ = cursor.tick() => {
                    if self.replica.cursor_tick(now_millis()) {
                        self.arm_flush();
                    }
                    self.publish_events();
                }
                _ = persist.tick() => {
                    if self.replica.persist_tick() {
                        self.send_outbox().await;
                    }
                }
                _ = reconnect.tick(), if may_reconnect => {
                    self.connect().await;
                }
            }
        }
        info!(author = self.replica.author(), "session stopped");
    }

    async fn handle_command(&mut self, command: Command<T>) {
        match command {
            Command::Edit(job) => {
                job(&mut self.replica);
                if self.replica.has_pending() {
                    self.arm_flush();
                }
            }
            Command::Undo { reply } => {
                let done = self.replica.undo();
                if done {
                    self.arm_flush();
                }
                let _ = reply.send(done);
            }
            Command::Redo { reply } => {
                let done = self.replica.redo();
                if done {
                    self.arm_flush();
                }
                let _ = reply.send(done);
            }
            Command::Flush { reply } => {
                self.flush_at = None;
                self.flush().await;
                let _ = reply.send(());
            }
            Command::Disconnect { reply } => {
                info!("disconnecting");
                self.should_reconnect = false;
                self.transport.close().await;
                self.replica.on_close();
                let _ = reply.send(());
            }
            Command::Reconnect { reply } => {
                self.should_reconnect = true;
                self.connect().await;
                let _ = reply.send(());
            }
            Command::Inspect { reply } => {
                let _ = reply.send(SessionState {
                    status: self.replica.status(),
                    last_seen: self.replica.last_seen(),
                    text: self.replica.text(),
                    document: self.replica.export_document(),
                    pending: self.replica.has_pending(),
                });
            }
            // Handled by the loop
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                debug!("transport opened");
                self.replica.on_open();
            }
            TransportEvent::Message(message) => {
                if let Err(err) = self.replica.receive(message, now_millis()) {
                    if err.is_terminal() {
                        error!(error = %err, "replica desynced; giving up on this document");
                        self.should_reconnect = false;
                        self.transport.close().await;
                        self.replica.on_close();
                    } else {
                        warn!(error = %err, "inbound message rejected");
                    }
                }
                self.send_outbox().await;
                self.publish_events();
            }
            TransportEvent::Closed => {
                info!("transport closed");
                self.replica.on_close();
            }
        }
    }

    async fn connect(&mut self) {
        if self.transport.is_open() || self.replica.is_desynced() {
            return;
        }
        if let Err(err) = self.transport.connect().await {
            warn!(error = %err, "connect failed");
        }
    }

    fn arm_flush(&mut self) {
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.replica.config().flush_debounce());
        }
    }

    async fn flush(&mut self) {
        if self.replica.flush() {
            self.send_outbox().await;
        }
    }

    async fn send_outbox(&mut self) {
        for message in self.replica.take_outbox() {
            if let Err(err) = self.transport.send(message.clone()).await {
                warn!(error = %err, kind = message.kind_name(), "send failed; requeueing");
                self.replica.requeue(message);
            }
        }
    }

    fn publish_events(&mut self) {
        for event in self.replica.take_events() {
            let _ = self.events.send(event);
        }
    }

    async fn shutdown(&mut self) {
        self.flush().await;
        self.transport.close().await;
        self.replica.on_close();
        self.publish_events();
    }
}
