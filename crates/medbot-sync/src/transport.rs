//! Transport channel: one logical WebSocket connection with automatic
//! reconnection.
//!
//! [`TransportChannel`] owns the connection. Calling
//! [`open`](TransportChannel::open) spawns a driver task that
//!
//! 1. **connects** to the endpoint and reconnects with exponential backoff
//!    after every unexpected close, as decided by a
//!    [`ConnectionMachine`];
//! 2. **interprets** every inbound frame and hands the resulting
//!    [`Envelope`] to the caller's [`ChannelHandler`] (handshakes are
//!    dropped here);
//! 3. **queues** outbound frames while the connection is not open and
//!    drains the queue in FIFO order as soon as it opens.
//!
//! Cloneable [`ChannelHandle`]s give other components `send` access and a
//! view of the connection state without giving them `close`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use medbot_types::{CloseReason, ConnectionState, Envelope, OutboundCommand, SyncError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::adapter::CommandSink;
use crate::interpreter::{encode, interpret};
use crate::reconnect::{ConnectionAction, ConnectionEvent, ConnectionMachine, ReconnectPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, tungstenite::Error>> + Send>>;

/// Queue depth at which, and at every multiple of which, a backlog warning
/// is logged. The queue itself is unbounded.
pub const QUEUE_WARN_EVERY: usize = 64;

fn backlog_warning_due(depth: usize) -> bool {
    depth > 0 && depth % QUEUE_WARN_EVERY == 0
}

/// Receives what a [`TransportChannel`] produces.
///
/// Both callbacks run on the driver task, in arrival order.
pub trait ChannelHandler: Send + 'static {
    /// A decoded inbound frame. Never called with [`Envelope::Handshake`].
    fn on_envelope(&mut self, envelope: Envelope);

    /// Called on every lifecycle transition.
    fn on_state_change(&mut self, _state: &ConnectionState) {}
}

enum ChannelCommand {
    Open,
    Send(String),
    Close(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// ChannelHandle
// ---------------------------------------------------------------------------

/// Send access and state view for one [`TransportChannel`].
#[derive(Clone)]
pub struct ChannelHandle {
    endpoint: Arc<str>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ChannelHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Transmit a raw text frame now, or queue it until the connection opens.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] once the channel has been closed.
    pub fn send_text(&self, frame: impl Into<String>) -> Result<(), SyncError> {
        self.commands
            .send(ChannelCommand::Send(frame.into()))
            .map_err(|_| SyncError::Transport {
                endpoint: self.endpoint.to_string(),
                details: "channel is closed".to_string(),
            })
    }

    /// Encode and send an [`OutboundCommand`].
    pub fn send(&self, command: &OutboundCommand) -> Result<(), SyncError> {
        let frame = encode(command)?;
        debug!(
            endpoint = %self.endpoint,
            command_id = %command.id,
            joints = command.values.len(),
            "sending joint command"
        );
        self.send_text(frame)
    }
}

impl CommandSink for ChannelHandle {
    fn send_command(&self, command: OutboundCommand) -> Result<(), SyncError> {
        self.send(&command)
    }
}

// ---------------------------------------------------------------------------
// TransportChannel
// ---------------------------------------------------------------------------

/// Owner of one logical connection to `endpoint`.
///
/// Must be opened from within a Tokio runtime. Dropping the channel aborts
/// its driver task.
pub struct TransportChannel {
    endpoint: Arc<str>,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    /// Receiver waiting for the driver; frames sent before `open` sit here.
    pending_rx: Option<mpsc::UnboundedReceiver<ChannelCommand>>,
    driver: Option<JoinHandle<()>>,
}

impl TransportChannel {
    pub fn new(endpoint: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let endpoint: String = endpoint.into();
        let (commands, pending_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            endpoint: Arc::from(endpoint),
            policy,
            state_tx: Arc::new(state_tx),
            commands,
            pending_rx: Some(pending_rx),
            driver: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// A handle for sending and observing state. Frames sent through it
    /// before [`open`](Self::open) are queued.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            endpoint: Arc::clone(&self.endpoint),
            commands: self.commands.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Start connecting and deliver envelopes to `handler`.
    ///
    /// While a driver is running this only asks it to connect, which is a
    /// no-op when the connection is already connecting or open, and restarts
    /// it after the reconnect ceiling was reached. `handler` is installed only
    /// when a new driver is spawned. After [`close`](Self::close) a fresh
    /// driver is spawned and handles obtained earlier stay closed.
    pub fn open<H: ChannelHandler>(&mut self, handler: H) -> ChannelHandle {
        if self.is_running() {
            debug!(endpoint = %self.endpoint, "open requested on running channel");
            let _ = self.commands.send(ChannelCommand::Open);
            return self.handle();
        }

        let commands = match self.pending_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.commands = tx;
                rx
            }
        };

        let driver = Driver {
            endpoint: Arc::clone(&self.endpoint),
            machine: ConnectionMachine::new(self.policy),
            commands,
            state_tx: Arc::clone(&self.state_tx),
            handler,
            queue: VecDeque::new(),
            socket: None,
            connecting: None,
            retry: None,
        };
        let span = info_span!("transport_driver", endpoint = %self.endpoint);
        self.driver = Some(tokio::spawn(driver.run().instrument(span)));
        self.handle()
    }

    /// `true` while a driver task is alive.
    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel any pending reconnect, close the socket, and detach the
    /// handler. No automatic reconnect happens afterwards.
    pub async fn close(&mut self) {
        let Some(task) = self.driver.take() else {
            self.state_tx.send_replace(ConnectionState::Closed(CloseReason::Explicit));
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(ChannelCommand::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = task.await
            && !e.is_cancelled()
        {
            error!(endpoint = %self.endpoint, error = %e, "transport driver panicked");
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(task) = self.driver.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

struct Driver<H> {
    endpoint: Arc<str>,
    machine: ConnectionMachine,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    handler: H,
    queue: VecDeque<String>,
    socket: Option<WsStream>,
    connecting: Option<ConnectFuture>,
    retry: Option<Pin<Box<Sleep>>>,
}

impl<H: ChannelHandler> Driver<H> {
    async fn run(mut self) {
        self.dispatch(ConnectionEvent::OpenRequested).await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Open) => {
                        self.dispatch(ConnectionEvent::OpenRequested).await;
                    }
                    Some(ChannelCommand::Send(frame)) => self.enqueue(frame).await,
                    Some(ChannelCommand::Close(ack)) => {
                        self.dispatch(ConnectionEvent::CloseRequested).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.dispatch(ConnectionEvent::CloseRequested).await;
                        break;
                    }
                },
                result = poll_connect(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(ws) => {
                            self.socket = Some(ws);
                            self.dispatch(ConnectionEvent::Connected).await;
                        }
                        Err(e) => {
                            warn!(endpoint = %self.endpoint, error = %e, "connect failed");
                            self.dispatch(ConnectionEvent::ConnectFailed).await;
                        }
                    }
                }
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                () = poll_retry(&mut self.retry) => {
                    self.retry = None;
                    self.dispatch(ConnectionEvent::RetryTimerFired).await;
                }
            }
        }

        if !self.queue.is_empty() {
            debug!(
                endpoint = %self.endpoint,
                dropped = self.queue.len(),
                "discarding queued frames on close"
            );
        }
        debug!(endpoint = %self.endpoint, "transport driver stopped");
    }

    /// Feed `event` to the machine and carry out its actions, including any
    /// follow-up event an action produces.
    async fn dispatch(&mut self, event: ConnectionEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let previous = self.machine.state().clone();
            let actions = self.machine.handle(event);
            if *self.machine.state() != previous {
                self.publish_state();
            }
            for action in actions {
                if let Some(follow_up) = self.perform(action).await {
                    next = Some(follow_up);
                }
            }
        }
    }

    async fn perform(&mut self, action: ConnectionAction) -> Option<ConnectionEvent> {
        match action {
            ConnectionAction::Connect => {
                let url = self.endpoint.to_string();
                self.connecting = Some(Box::pin(async move {
                    connect_async(url).await.map(|(ws, _response)| ws)
                }));
                None
            }
            ConnectionAction::ScheduleReconnect(delay) => {
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                None
            }
            ConnectionAction::CancelReconnect => {
                self.retry = None;
                None
            }
            ConnectionAction::AbortConnect => {
                self.connecting = None;
                None
            }
            ConnectionAction::CloseSocket => {
                if let Some(mut ws) = self.socket.take()
                    && let Err(e) = ws.close(None).await
                {
                    debug!(endpoint = %self.endpoint, error = %e, "error while closing socket");
                }
                None
            }
            ConnectionAction::FlushQueue => self.flush().await,
        }
    }

    async fn enqueue(&mut self, frame: String) {
        self.queue.push_back(frame);
        if self.machine.state().is_open() {
            if let Some(event) = self.flush().await {
                self.dispatch(event).await;
            }
        } else if backlog_warning_due(self.queue.len()) {
            warn!(
                endpoint = %self.endpoint,
                queued = self.queue.len(),
                "outbound backlog growing; every queued frame replays in order on reconnect"
            );
        } else {
            debug!(
                endpoint = %self.endpoint,
                queued = self.queue.len(),
                "connection not open; frame queued"
            );
        }
    }

    /// Drain the queue in order. A failed write puts the frame back at the
    /// front and reports the connection as dropped.
    async fn flush(&mut self) -> Option<ConnectionEvent> {
        let mut failed = false;
        if let Some(ws) = self.socket.as_mut() {
            if !self.queue.is_empty() {
                debug!(endpoint = %self.endpoint, count = self.queue.len(), "flushing queued frames");
            }
            while let Some(frame) = self.queue.pop_front() {
                if let Err(e) = ws.send(Message::Text(frame.clone().into())).await {
                    warn!(endpoint = %self.endpoint, error = %e, "send failed");
                    self.queue.push_front(frame);
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            self.socket = None;
            Some(ConnectionEvent::Disconnected)
        } else {
            None
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.deliver(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.deliver(text),
                Err(_) => warn!(endpoint = %self.endpoint, "dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                info!(endpoint = %self.endpoint, "connection closed by peer");
                self.socket = None;
                self.dispatch(ConnectionEvent::Disconnected).await;
            }
            Some(Err(e)) => {
                warn!(endpoint = %self.endpoint, error = %e, "connection error");
                self.socket = None;
                self.dispatch(ConnectionEvent::Disconnected).await;
            }
            Some(Ok(_)) => {}
        }
    }

    fn deliver(&mut self, raw: &str) {
        match interpret(raw) {
            Envelope::Handshake => debug!(endpoint = %self.endpoint, "handshake received"),
            Envelope::Malformed(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "malformed frame");
                self.handler.on_envelope(Envelope::Malformed(err));
            }
            envelope => self.handler.on_envelope(envelope),
        }
    }

    fn publish_state(&mut self) {
        let state = self.machine.state().clone();
        match &state {
            ConnectionState::Closed(CloseReason::Exhausted { attempts }) => error!(
                endpoint = %self.endpoint,
                attempts,
                "reconnect attempts exhausted; staying disconnected"
            ),
            ConnectionState::Reconnecting { attempt, delay } => warn!(
                endpoint = %self.endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            ),
            _ => info!(endpoint = %self.endpoint, state = %state, "connection state changed"),
        }
        self.handler.on_state_change(&state);
        self.state_tx.send_replace(state);
    }
}

async fn poll_connect(slot: &mut Option<ConnectFuture>) -> Result<WsStream, tungstenite::Error> {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_retry(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}
