//! A collaborative editing session for one open document.
//!
//! Each session is a single tokio task that owns the document, the socket and
//! every timer. The [`SessionHandle`] talks to it over a command channel, so
//! the document never needs a lock: only the session task touches it.
//!
//! The task multiplexes:
//! - commands from the handle (local edits, backup requests, close)
//! - relay socket events
//! - broadcast, save, reconnect and typing deadlines
//! - the periodic local backup
//! - completions of spawned saves

use crate::config::{socket_url, ConfigError, SessionConfig};
use crate::transport::{spawn_connect, TransportEvent, WsWriter};
use collab_core::backup::{BackupError, BackupStorage, BackupSummary, LocalSafetyNet};
use collab_core::clock::now_millis;
use collab_core::protocol::{decode, encode, Inbound};
use collab_core::store::{DocumentStore, StoreError};
use collab_core::{
    BoardDocument, BoardOp, ConnectionAction, ConnectionMachine, ConnectionState, Document,
    DocumentId, EchoGuard, Edge, EventBus, Node, NodePatch, NoteDocument, NoteOp, OfferOutcome,
    Operation, Outbox, PresenceSnapshot, PresenceTracker, Propagation, SaveTicket, SessionEvent,
    SessionIdentity, Subscription,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use web_time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to load document: {0}")]
    Load(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Save failed: {0}")]
    Save(StoreError),

    #[error("Session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    /// Reconnect attempts since the last successful open.
    pub attempts: u32,
    pub has_unsaved_changes: bool,
    pub presence: PresenceSnapshot,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            attempts: 0,
            has_unsaved_changes: false,
            presence: PresenceSnapshot::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;
type Mutation<D> = Box<dyn FnOnce(&mut D) + Send>;

enum Command<D: Document> {
    Apply(D::Op),
    Update(Mutation<D>),
    Document(Reply<D>),
    Snapshot(Reply<std::result::Result<(), BackupError>>),
    ListBackups(Reply<std::result::Result<Vec<BackupSummary>, BackupError>>),
    Restore(usize, Reply<std::result::Result<Option<D>, BackupError>>),
    ClearBackups(Reply<std::result::Result<(), BackupError>>),
    ForceSave(Reply<std::result::Result<(), StoreError>>),
    CancelAutoSave,
    Reconnect,
    Close,
}

struct SaveOutcome {
    ticket: SaveTicket,
    result: std::result::Result<(), StoreError>,
    reply: Option<Reply<std::result::Result<(), StoreError>>>,
}

/// Handle to a running session.
///
/// Dropping the handle closes the session the same way [`close`](Self::close)
/// does, without waiting for it.
pub struct SessionHandle<D: Document> {
    id: DocumentId,
    commands: mpsc::UnboundedSender<Command<D>>,
    status: watch::Receiver<SessionStatus>,
    events: Arc<EventBus<SessionEvent<D>>>,
    task: Option<JoinHandle<()>>,
}

impl<D: Document> SessionHandle<D> {
    /// Open `id`: load it from the store, connect to the relay at `relay_url`
    /// and start the session task.
    pub async fn open(
        relay_url: &str,
        id: DocumentId,
        identity: SessionIdentity,
        store: Arc<dyn DocumentStore<D>>,
        backups: Arc<dyn BackupStorage>,
        config: SessionConfig,
    ) -> Result<Self> {
        let url = socket_url(relay_url, D::KIND, &id, &identity)?;
        let document = store.load(&id).await?;
        info!("Opened {:?} {} as {}", D::KIND, id, identity.username);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let events = Arc::new(EventBus::new());

        let session = Session {
            id: id.clone(),
            url: url.to_string(),
            echo: EchoGuard::new(&identity),
            identity,
            document,
            store,
            safety_net: LocalSafetyNet::for_document(backups, &id, config.backup_capacity),
            connection: ConnectionMachine::new(config.reconnect.clone()),
            presence: PresenceTracker::new(),
            propagation: Propagation::new(config.cadence_for(D::KIND)),
            outbox: Outbox::new(config.offline),
            writer: None,
            transport_task: None,
            epoch: 0,
            reconnect_at: None,
            typing: None,
            config,
            events: Arc::clone(&events),
            status: status_tx,
        };
        let task = tokio::spawn(session.run(command_rx));

        Ok(Self {
            id,
            commands: command_tx,
            status: status_rx,
            events,
            task: Some(task),
        })
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    fn send(&self, command: Command<D>) -> Result<()> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command<D>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Apply a local operation and propagate it to peers and the store.
    pub fn apply(&self, op: D::Op) -> Result<()> {
        self.send(Command::Apply(op))
    }

    /// Mutate the document locally without a wire operation. The change
    /// reaches other sessions through the next durable save.
    pub fn update(&self, mutate: impl FnOnce(&mut D) + Send + 'static) -> Result<()> {
        self.send(Command::Update(Box::new(mutate)))
    }

    /// Current document.
    pub async fn document(&self) -> Result<D> {
        self.request(Command::Document).await
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self, callback: impl Fn(SessionEvent<D>) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Take a local backup right now.
    pub async fn snapshot(&self) -> Result<()> {
        Ok(self.request(Command::Snapshot).await??)
    }

    /// Local backups, most recent first.
    pub async fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        Ok(self.request(Command::ListBackups).await??)
    }

    /// Backup at `index` (0 is the newest). The session's document is not
    /// touched; apply it with [`update`](Self::update) if wanted.
    pub async fn restore(&self, index: usize) -> Result<Option<D>> {
        Ok(self.request(|tx| Command::Restore(index, tx)).await??)
    }

    pub async fn clear_backups(&self) -> Result<()> {
        Ok(self.request(Command::ClearBackups).await??)
    }

    /// Save now instead of waiting for the save window. Resolves when the
    /// save completes.
    pub async fn force_save(&self) -> Result<()> {
        self.request(Command::ForceSave)
            .await?
            .map_err(SessionError::Save)
    }

    /// Drop the pending save and clear the unsaved flag.
    pub fn cancel_auto_save(&self) -> Result<()> {
        self.send(Command::CancelAutoSave)
    }

    /// Reconnect after the session gave up retrying.
    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    /// Close the session: tear down the socket, cancel timers and wait for a
    /// final save of unsaved changes.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task for {} ended abnormally: {}", self.id, e);
            }
        }
        Ok(())
    }
}

impl SessionHandle<NoteDocument> {
    /// Replace the note content.
    pub fn edit_content(&self, content: impl Into<String>) -> Result<()> {
        self.apply(NoteOp::ContentChange {
            content: content.into(),
        })
    }

    pub fn move_cursor(&self, position: usize) -> Result<()> {
        self.apply(NoteOp::CursorPosition { position })
    }

    pub fn rename(&self, title: impl Into<String>) -> Result<()> {
        let title = title.into();
        self.update(move |note| note.title = title)
    }
}

impl SessionHandle<BoardDocument> {
    pub fn add_node(&self, node: Node) -> Result<()> {
        self.apply(BoardOp::AddNode(node))
    }

    pub fn update_node(&self, patch: NodePatch) -> Result<()> {
        self.apply(BoardOp::UpdateNode(patch))
    }

    pub fn delete_node(&self, id: impl Into<String>) -> Result<()> {
        self.apply(BoardOp::delete_node(id))
    }

    pub fn add_edge(&self, edge: Edge) -> Result<()> {
        self.apply(BoardOp::AddEdge(edge))
    }

    pub fn delete_edge(&self, id: impl Into<String>) -> Result<()> {
        self.apply(BoardOp::delete_edge(id))
    }
}

/// A peer currently typing, and when that expires.
struct Typing {
    username: Option<String>,
    until: Instant,
}

/// The session task state. Only ever touched from [`Session::run`].
struct Session<D: Document> {
    id: DocumentId,
    identity: SessionIdentity,
    url: String,
    document: D,
    store: Arc<dyn DocumentStore<D>>,
    safety_net: LocalSafetyNet<Arc<dyn BackupStorage>, D>,
    connection: ConnectionMachine,
    echo: EchoGuard,
    presence: PresenceTracker,
    propagation: Propagation<D>,
    outbox: Outbox,
    writer: Option<WsWriter>,
    transport_task: Option<JoinHandle<()>>,
    /// Incremented per connection attempt; older transport events are stale.
    epoch: u64,
    reconnect_at: Option<Instant>,
    typing: Option<Typing>,
    config: SessionConfig,
    events: Arc<EventBus<SessionEvent<D>>>,
    status: watch::Sender<SessionStatus>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<D: Document> Session<D> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<D>>) {
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let (save_tx, mut save_rx) = mpsc::unbounded_channel();

        let mut backup_timer = (!self.config.backup_interval.is_zero()).then(|| {
            let period = self.config.backup_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        if let Some(action) = self.connection.open() {
            self.perform(action, &transport_tx);
        }
        self.publish_status();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.on_command(command, &transport_tx, &save_tx).await,
                },

                Some(event) = transport_rx.recv() => {
                    self.on_transport_event(event, &transport_tx).await;
                }

                Some(outcome) = save_rx.recv() => {
                    self.on_save_outcome(outcome);
                }

                _ = sleep_until(self.propagation.broadcast_deadline()) => {
                    if let Some(op) = self.propagation.take_due_broadcast(Instant::now()) {
                        self.send_operation(op).await;
                    }
                }

                _ = sleep_until(self.propagation.save_deadline()) => {
                    if let Some(ticket) = self.propagation.take_due_save(Instant::now()) {
                        self.start_save(ticket, None, &save_tx);
                    }
                    self.publish_status();
                }

                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    if let Some(action) = self.connection.on_reconnect_due() {
                        self.perform(action, &transport_tx);
                    }
                }

                _ = sleep_until(self.typing.as_ref().map(|t| t.until)) => {
                    if let Some(typing) = self.typing.take() {
                        self.events.emit(SessionEvent::PeerTyping {
                            username: typing.username,
                            active: false,
                        });
                    }
                }

                _ = tick(&mut backup_timer) => {
                    self.take_backup();
                }
            }
        }

        self.shutdown().await;
    }

    // ==================== Commands ====================

    async fn on_command(
        &mut self,
        command: Command<D>,
        transport_tx: &mpsc::UnboundedSender<TransportEvent>,
        save_tx: &mpsc::UnboundedSender<SaveOutcome>,
    ) {
        match command {
            Command::Apply(op) => {
                let changed = self.document.apply(&op);
                if let Some(op) = self.propagation.on_local_operation(op, changed, Instant::now()) {
                    self.send_operation(op).await;
                }
                self.publish_status();
            }
            Command::Update(mutate) => {
                let before = self.document.clone();
                mutate(&mut self.document);
                if self.document != before {
                    self.propagation.on_local_mutation(Instant::now());
                    self.publish_status();
                }
            }
            Command::Document(reply) => {
                let _ = reply.send(self.document.clone());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.take_backup());
            }
            Command::ListBackups(reply) => {
                let _ = reply.send(self.safety_net.list_backups());
            }
            Command::Restore(index, reply) => {
                let _ = reply.send(self.safety_net.restore(index));
            }
            Command::ClearBackups(reply) => {
                let _ = reply.send(self.safety_net.clear());
            }
            Command::ForceSave(reply) => match self.propagation.force() {
                Some(ticket) => self.start_save(ticket, Some(reply), save_tx),
                None => {
                    let _ = reply.send(Ok(()));
                }
            },
            Command::CancelAutoSave => {
                self.propagation.cancel();
                self.publish_status();
            }
            Command::Reconnect => {
                if let Some(action) = self.connection.open() {
                    info!("Reopening connection for {}", self.id);
                    self.perform(action, transport_tx);
                    self.publish_status();
                }
            }
            Command::Close => {}
        }
    }

    // ==================== Connection ====================

    fn perform(&mut self, action: ConnectionAction, transport_tx: &mpsc::UnboundedSender<TransportEvent>) {
        match action {
            ConnectionAction::Connect => {
                self.epoch += 1;
                if let Some(task) = self.transport_task.take() {
                    task.abort();
                }
                self.transport_task = Some(spawn_connect(self.url.clone(), self.epoch, transport_tx.clone()));
            }
            ConnectionAction::ScheduleReconnect { delay, attempt } => {
                info!(
                    "Connection to {} lost; reconnect attempt {} in {:?}",
                    self.id, attempt, delay
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            ConnectionAction::GiveUp => {
                warn!("Giving up on relay for {}; reopen to retry", self.id);
                self.reconnect_at = None;
            }
            ConnectionAction::Teardown => {
                self.reconnect_at = None;
                if let Some(task) = self.transport_task.take() {
                    task.abort();
                }
            }
        }
    }

    async fn on_transport_event(
        &mut self,
        event: TransportEvent,
        transport_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        if event.epoch() != self.epoch {
            debug!("Ignoring event from stale connection {}", event.epoch());
            return;
        }

        match event {
            TransportEvent::Opened { writer, .. } => {
                self.connection.on_opened();
                self.writer = Some(writer);
                self.presence.set_connected(true);
                info!("Connected to relay for {}", self.id);
                self.flush_outbox().await;
                self.publish_status();
            }
            TransportEvent::Frame { text, .. } => {
                self.on_frame(&text);
            }
            TransportEvent::Closed { .. } => {
                self.on_disconnected(transport_tx);
            }
            TransportEvent::Failed { error, .. } => {
                debug!("Connection attempt failed: {}", error);
                self.on_disconnected(transport_tx);
            }
        }
    }

    fn on_disconnected(&mut self, transport_tx: &mpsc::UnboundedSender<TransportEvent>) {
        self.writer = None;
        let before = self.presence.snapshot();
        self.presence.set_connected(false);
        let after = self.presence.snapshot();
        if after != before {
            self.events.emit(SessionEvent::PresenceChanged(after));
        }
        if let Some(action) = self.connection.on_closed() {
            self.perform(action, transport_tx);
        }
        self.publish_status();
    }

    /// Send a frame, or hand it to the outbox when the socket is down.
    async fn send_frame(&mut self, text: String) {
        if self.connection.can_send() {
            if let Some(writer) = self.writer.as_mut() {
                match writer.send_text(text.clone()).await {
                    Ok(()) => return,
                    // The read loop reports the close; the frame waits in the
                    // outbox like any other sent during the outage.
                    Err(e) => warn!("Failed to send to relay: {}", e),
                }
            }
        }

        if self.outbox.offer(text) == OfferOutcome::Dropped {
            self.events.emit(SessionEvent::OperationDropped);
        }
    }

    async fn send_operation(&mut self, op: D::Op) {
        let operation = Operation::local(&self.identity, op);
        match encode::<D>(&operation) {
            Ok(text) => self.send_frame(text).await,
            Err(e) => warn!("Failed to encode operation: {}", e),
        }
    }

    async fn flush_outbox(&mut self) {
        let queued = self.outbox.drain();
        if queued.is_empty() {
            return;
        }
        info!("Flushing {} queued operation(s)", queued.len());
        for text in queued {
            self.send_frame(text).await;
        }
    }

    // ==================== Inbound ====================

    fn on_frame(&mut self, text: &str) {
        let inbound = match decode::<D>(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Ignoring malformed frame: {}", e);
                return;
            }
        };

        match inbound {
            Inbound::State { document, online } => {
                debug!("Received full state for {}", self.id);
                self.document = document;
                if self.presence.set_online(online) {
                    self.events
                        .emit(SessionEvent::PresenceChanged(self.presence.snapshot()));
                }
                self.events
                    .emit(SessionEvent::DocumentReplaced(self.document.clone()));
                self.publish_status();
            }
            Inbound::Operation(operation) => self.on_remote_operation(operation),
            Inbound::Presence(event) => {
                if self.presence.apply(&event, now_millis()) {
                    self.events
                        .emit(SessionEvent::PresenceChanged(self.presence.snapshot()));
                    self.publish_status();
                }
            }
            Inbound::Notice(notice) => {
                info!(
                    "{} {:?} (version {:?})",
                    notice.username.as_deref().unwrap_or("someone"),
                    notice.kind,
                    notice.version_number
                );
                self.events.emit(SessionEvent::Notice(notice));
            }
            Inbound::Unknown(kind) => {
                debug!("Ignoring unknown frame type {:?}", kind);
            }
        }
    }

    fn on_remote_operation(&mut self, operation: Operation<D::Op>) {
        if !self.echo.should_apply(&operation) {
            debug!("Ignoring echo of our own operation");
            return;
        }

        let changed = self.document.apply(&operation.op);
        self.propagation.observe_remote(&operation.op);

        let coalesces = D::coalesces(&operation.op);
        if coalesces && changed {
            let started = self.typing.is_none();
            self.typing = Some(Typing {
                username: operation.username.clone(),
                until: Instant::now() + self.config.typing_timeout,
            });
            if started {
                self.events.emit(SessionEvent::PeerTyping {
                    username: operation.username.clone(),
                    active: true,
                });
            }
        }

        // Identical content from a peer is not news; cursor moves and graph
        // edits are always surfaced.
        if changed || !coalesces {
            self.events.emit(SessionEvent::RemoteOperation(operation));
        }
    }

    // ==================== Saves ====================

    fn start_save(
        &mut self,
        ticket: SaveTicket,
        reply: Option<Reply<std::result::Result<(), StoreError>>>,
        save_tx: &mpsc::UnboundedSender<SaveOutcome>,
    ) {
        debug!("Saving {} (generation {})", self.id, ticket.generation());
        self.events.emit(SessionEvent::SaveStarted);

        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let document = self.document.clone();
        let save_tx = save_tx.clone();
        // Not tracked: in-flight saves are allowed to finish after close.
        tokio::spawn(async move {
            let result = store.save(&id, &document).await;
            let _ = save_tx.send(SaveOutcome {
                ticket,
                result,
                reply,
            });
        });
    }

    fn on_save_outcome(&mut self, outcome: SaveOutcome) {
        match &outcome.result {
            Ok(()) => {
                if !self.propagation.on_save_success(outcome.ticket) {
                    debug!("Saved {}; newer changes still pending", self.id);
                }
                self.events.emit(SessionEvent::SaveSucceeded);
            }
            Err(e) => {
                warn!("Failed to save {}: {}", self.id, e);
                self.propagation.on_save_failure(Instant::now());
                self.events.emit(SessionEvent::SaveFailed {
                    message: e.to_string(),
                });
            }
        }
        self.publish_status();
        if let Some(reply) = outcome.reply {
            let _ = reply.send(outcome.result);
        }
    }

    // ==================== Backups ====================

    fn take_backup(&mut self) -> std::result::Result<(), BackupError> {
        let timestamp = now_millis();
        match self.safety_net.snapshot(&self.document, timestamp) {
            Ok(()) => {
                self.events.emit(SessionEvent::BackupStored { timestamp });
                Ok(())
            }
            Err(e) => {
                warn!("Local backup of {} failed: {}", self.id, e);
                self.events.emit(SessionEvent::BackupFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ==================== Status ====================

    fn publish_status(&mut self) {
        let status = SessionStatus {
            connection: self.connection.state(),
            attempts: self.connection.attempts(),
            has_unsaved_changes: self.propagation.has_unsaved_changes(),
            presence: self.presence.snapshot(),
        };

        let previous = self.status.borrow().clone();
        if previous.connection != status.connection || previous.attempts != status.attempts {
            self.events.emit(SessionEvent::ConnectionChanged {
                state: status.connection,
                attempts: status.attempts,
            });
        }
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    // ==================== Shutdown ====================

    async fn shutdown(mut self) {
        debug!("Closing session for {}", self.id);
        // Peers get the last coalesced edit before the socket goes away.
        if let Some(op) = self.propagation.flush_broadcast() {
            self.send_operation(op).await;
        }
        self.connection.close();
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
        self.reconnect_at = None;
        self.typing = None;
        if let Some(task) = self.transport_task.take() {
            task.abort();
        }
        self.presence.set_connected(false);

        if let Some(ticket) = self.propagation.shutdown() {
            info!("Saving unsaved changes to {} before closing", self.id);
            self.events.emit(SessionEvent::SaveStarted);
            match tokio::time::timeout(FINAL_SAVE_TIMEOUT, self.store.save(&self.id, &self.document)).await {
                Ok(Ok(())) => {
                    let _ = self.propagation.on_save_success(ticket);
                    self.events.emit(SessionEvent::SaveSucceeded);
                }
                Ok(Err(e)) => {
                    warn!("Final save of {} failed: {}", self.id, e);
                    self.events.emit(SessionEvent::SaveFailed {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!("Final save of {} timed out", self.id);
                    self.events.emit(SessionEvent::SaveFailed {
                        message: "timed out".into(),
                    });
                }
            }
        }

        self.publish_status();
        info!("Closed {}", self.id);
    }
}

/// Upper bound on the save issued while closing.
const FINAL_SAVE_TIMEOUT: Duration = Duration::from_secs(30);
