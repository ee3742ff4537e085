//! Connection lifecycle: the dispatcher task owning the state machine,
//! reconnection with fallback hosts, resume/recover, and serial bookkeeping.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::now_ms;
use crate::channel::{Channels, ConnectionTransition};
use crate::error::{codes, Error, ErrorInfo};
use crate::hosts::Hosts;
use crate::options::{ClientOptions, AGENT_STRING, PROTOCOL_VERSION};
use crate::protocol::{action, decode_frame, encode_frame, AuthDetails, ProtocolMessage};
use crate::queue::{Completion, OutboundQueue, PendingQueue};
use crate::rest::Rest;
use crate::emitter::Emitter;
use crate::transport::{Dialer, Transport, WebsocketDialer};

const HEARTBEAT_MARGIN: Duration = Duration::from_secs(10);
const DEFAULT_MAX_IDLE_INTERVAL: Duration = Duration::from_secs(15);

/// The state of a realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Initialized => "INITIALIZED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Suspended => "SUSPENDED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Connection lifecycle events: the states plus `Update` for in-place changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
    Update,
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Initialized => ConnectionEvent::Initialized,
            ConnectionState::Connecting => ConnectionEvent::Connecting,
            ConnectionState::Connected => ConnectionEvent::Connected,
            ConnectionState::Disconnected => ConnectionEvent::Disconnected,
            ConnectionState::Suspended => ConnectionEvent::Suspended,
            ConnectionState::Closing => ConnectionEvent::Closing,
            ConnectionState::Closed => ConnectionEvent::Closed,
            ConnectionState::Failed => ConnectionEvent::Failed,
        }
    }
}

/// Data accompanying every connection state transition.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub current: ConnectionState,
    pub previous: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: Option<ErrorInfo>,
    /// Time until the next automatic retry; zero when none is scheduled.
    pub retry_in: Duration,
}

pub(crate) enum Command {
    Connect,
    Close,
    /// A MESSAGE or PRESENCE frame; gets a serial and a pending-ack entry.
    Publish {
        frame: ProtocolMessage,
        completion: Option<Completion>,
    },
    /// A control frame (ATTACH, DETACH); dropped when the transport is down.
    Send { frame: ProtocolMessage },
}

#[derive(Default)]
struct Snapshot {
    state: ConnectionState,
    id: Option<String>,
    key: Option<String>,
    serial: Option<i64>,
    msg_serial: i64,
    error_reason: Option<ErrorInfo>,
}

pub(crate) struct ConnectionInner {
    snapshot: Mutex<Snapshot>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) emitter: Emitter<ConnectionEvent, ConnectionStateChange>,
}

impl ConnectionInner {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        ConnectionInner {
            snapshot: Mutex::new(Snapshot::default()),
            cmd_tx,
            emitter: Emitter::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.snapshot().state
    }

    pub(crate) fn send_command(&self, cmd: Command) -> Result<(), Error> {
        self.cmd_tx.send(cmd).map_err(|_| {
            Error::Connection(ErrorInfo::new(
                codes::CONNECTION_FAILED,
                "connection is no longer running",
            ))
        })
    }

    fn snapshot(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.snapshot.lock().expect("connection snapshot poisoned")
    }
}

/// Handle to a realtime connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(inner: Arc<ConnectionInner>) -> Self {
        Connection { inner }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.snapshot().state
    }

    /// The last error that caused a state change, if any.
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.snapshot().error_reason.clone()
    }

    /// Server-assigned connection id, once connected.
    pub fn id(&self) -> Option<String> {
        self.inner.snapshot().id.clone()
    }

    /// Server-issued key enabling session resume.
    pub fn key(&self) -> Option<String> {
        self.inner.snapshot().key.clone()
    }

    /// Most recent inbound connection serial.
    pub fn serial(&self) -> Option<i64> {
        self.inner.snapshot().serial
    }

    /// Opaque string for bootstrapping a future client onto this session via
    /// the `recover` option.
    pub fn recovery_key(&self) -> Option<String> {
        let snapshot = self.inner.snapshot();
        let key = snapshot.key.as_ref()?;
        Some(format!(
            "{key}:{}:{}",
            snapshot.serial.unwrap_or(-1),
            snapshot.msg_serial
        ))
    }

    /// Start connecting without waiting for the outcome.
    pub fn request_connect(&self) {
        let _ = self.inner.send_command(Command::Connect);
    }

    /// Start connecting and wait until CONNECTED, or fail with the error that
    /// drove the connection to SUSPENDED, CLOSED or FAILED. Wrap in
    /// `tokio::time::timeout` to bound the wait.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        let mut rx = self.inner.emitter.subscribe();
        self.inner.send_command(Command::Connect)?;
        loop {
            match rx.recv().await {
                Ok((_, change)) => match change.current {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Suspended
                    | ConnectionState::Closed
                    | ConnectionState::Failed => {
                        return Err(state_error(change.current, change.reason))
                    }
                    _ => continue,
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if self.state() == ConnectionState::Connected {
                        return Ok(());
                    }
                }
                Err(_) => {
                    return Err(Error::Connection(ErrorInfo::new(
                        codes::CONNECTION_FAILED,
                        "connection is no longer running",
                    )))
                }
            }
        }
    }

    /// Close the connection and wait for CLOSED.
    pub async fn close(&self) -> Result<(), Error> {
        match self.state() {
            ConnectionState::Closed | ConnectionState::Failed => return Ok(()),
            _ => {}
        }
        let mut rx = self.inner.emitter.subscribe();
        self.inner.send_command(Command::Close)?;
        loop {
            match rx.recv().await {
                Ok((_, change)) => match change.current {
                    ConnectionState::Closed => return Ok(()),
                    ConnectionState::Failed => {
                        return Err(state_error(change.current, change.reason))
                    }
                    _ => continue,
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if self.state() == ConnectionState::Closed {
                        return Ok(());
                    }
                }
                Err(_) => return Ok(()),
            }
        }
    }

    pub fn on(
        &self,
        event: ConnectionEvent,
        listener: impl FnMut(ConnectionStateChange) + Send + 'static,
    ) -> crate::emitter::ListenerGuard {
        self.inner.emitter.on(event, listener)
    }

    pub fn once(
        &self,
        event: ConnectionEvent,
        listener: impl FnMut(ConnectionStateChange) + Send + 'static,
    ) -> crate::emitter::ListenerGuard {
        self.inner.emitter.once(event, listener)
    }

    pub fn on_all(
        &self,
        listener: impl FnMut(ConnectionStateChange) + Send + 'static,
    ) -> crate::emitter::ListenerGuard {
        self.inner.emitter.on_all(listener)
    }

    pub fn off_all(&self) {
        self.inner.emitter.off_all();
    }
}

fn state_error(state: ConnectionState, reason: Option<ErrorInfo>) -> Error {
    Error::Connection(reason.unwrap_or_else(|| match state {
        ConnectionState::Suspended => {
            ErrorInfo::new(codes::CONNECTION_SUSPENDED, "connection unavailable")
        }
        ConnectionState::Closed => {
            ErrorInfo::new(codes::CONNECTION_CLOSED, "connection closed")
        }
        ConnectionState::Failed => ErrorInfo::new(codes::CONNECTION_FAILED, "connection failed"),
        _ => ErrorInfo::new(codes::DISCONNECTED, "connection temporarily unavailable"),
    }))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns all mutable connection state. Exactly one dispatcher task runs per
/// connection; every FSM mutation happens on it.
pub(crate) struct Dispatcher {
    opts: Arc<ClientOptions>,
    rest: Rest,
    inner: Arc<ConnectionInner>,
    channels: Channels,
    dialer: Arc<dyn Dialer>,
    hosts: Hosts,
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    pending: PendingQueue,
    queued: OutboundQueue,

    msg_serial: i64,
    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,

    state_ttl: Duration,
    max_idle: Duration,
    disconnected_at: Option<Instant>,
    retry_at: Option<Instant>,
    close_deadline: Option<Instant>,
    use_fallback: bool,
    /// Set when the server rejected the current token; the next connect
    /// attempt renews it instead of reusing the cache.
    force_reauth: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        opts: Arc<ClientOptions>,
        rest: Rest,
        inner: Arc<ConnectionInner>,
        channels: Channels,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let hosts = Hosts::realtime(&opts);
        let dialer = opts
            .dialer
            .clone()
            .unwrap_or_else(|| Arc::new(WebsocketDialer));

        let mut dispatcher = Dispatcher {
            state_ttl: opts.connection_state_ttl,
            max_idle: DEFAULT_MAX_IDLE_INTERVAL,
            opts,
            rest,
            inner,
            channels,
            dialer,
            hosts,
            cmd_rx,
            state: ConnectionState::Initialized,
            transport: None,
            pending: PendingQueue::default(),
            queued: OutboundQueue::default(),
            msg_serial: 0,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            disconnected_at: None,
            retry_at: None,
            close_deadline: None,
            use_fallback: false,
            force_reauth: false,
        };
        dispatcher.apply_recover_option();
        dispatcher
    }

    /// Bootstrap session state from a user-supplied recovery key of the form
    /// `<connectionKey>:<connectionSerial>:<msgSerial>`.
    fn apply_recover_option(&mut self) {
        let Some(recover) = self.opts.recover.clone() else {
            return;
        };
        let mut parts = recover.rsplitn(3, ':');
        let msg_serial = parts.next().and_then(|s| s.parse::<i64>().ok());
        let serial = parts.next().and_then(|s| s.parse::<i64>().ok());
        let key = parts.next();
        match (key, serial, msg_serial) {
            (Some(key), Some(serial), Some(msg_serial)) if !key.is_empty() => {
                self.connection_key = Some(key.to_string());
                self.connection_serial = Some(serial);
                self.msg_serial = msg_serial;
                // Pretend we just disconnected so the first connect resumes.
                self.disconnected_at = Some(Instant::now());
                self.sync_snapshot();
            }
            _ => {
                tracing::warn!(recover, "malformed recovery key, connecting fresh");
            }
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            match self.state {
                ConnectionState::Connecting => self.run_connecting().await,
                ConnectionState::Connected | ConnectionState::Closing => self.run_active().await,
                ConnectionState::Initialized
                | ConnectionState::Disconnected
                | ConnectionState::Suspended => {
                    if !self.run_idle().await {
                        return;
                    }
                }
                ConnectionState::Closed | ConnectionState::Failed => {
                    if !self.run_terminal().await {
                        return;
                    }
                }
            }
        }
    }

    // --- state helpers -----------------------------------------------------

    fn set_state(&mut self, state: ConnectionState, reason: Option<ErrorInfo>, retry_in: Duration) {
        let previous = self.state;
        self.state = state;
        {
            let mut snapshot = self.inner.snapshot.lock().expect("connection snapshot poisoned");
            snapshot.state = state;
            if reason.is_some() {
                snapshot.error_reason = reason.clone();
            }
        }
        let event = if previous == state {
            ConnectionEvent::Update
        } else {
            ConnectionEvent::from(state)
        };
        tracing::info!(previous = %previous, current = %state, "connection state change");
        self.inner.emitter.emit(
            event,
            ConnectionStateChange {
                current: state,
                previous,
                event,
                reason,
                retry_in,
            },
        );
    }

    fn sync_snapshot(&self) {
        let mut snapshot = self.inner.snapshot.lock().expect("connection snapshot poisoned");
        snapshot.id = self.connection_id.clone();
        snapshot.key = self.connection_key.clone();
        snapshot.serial = self.connection_serial;
        snapshot.msg_serial = self.msg_serial;
    }

    fn can_resume(&self) -> bool {
        self.connection_key.is_some()
            && self
                .disconnected_at
                .is_some_and(|at| at.elapsed() < self.state_ttl)
    }

    fn pick_host(&mut self) -> String {
        if !self.use_fallback {
            return self.hosts.preferred_host();
        }
        match self.hosts.fallback_host() {
            Some(host) => host,
            None => {
                self.hosts.reset_visited();
                self.hosts.preferred_host()
            }
        }
    }

    /// Fail everything in flight and forget the session; resume is no longer
    /// possible.
    fn abandon_session(&mut self, error: &ErrorInfo) {
        self.pending.fail_all(error.clone());
        self.queued.fail_all(error.clone());
        self.connection_id = None;
        self.connection_key = None;
        self.connection_serial = None;
        self.msg_serial = 0;
        self.sync_snapshot();
    }

    // --- connecting --------------------------------------------------------

    async fn run_connecting(&mut self) {
        let host = self.pick_host();
        let resume = if self.can_resume() {
            Some((self.connection_key.clone().expect("checked"), self.connection_serial))
        } else {
            None
        };

        let attempt = establish(
            self.opts.clone(),
            self.rest.clone(),
            self.dialer.clone(),
            host.clone(),
            resume,
            std::mem::take(&mut self.force_reauth),
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    self.on_connect_result(&host, result).await;
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Close) => {
                        self.finish_close(None);
                        return;
                    }
                    Some(Command::Publish { frame, completion }) => {
                        self.queue_or_fail(frame, completion);
                    }
                    Some(Command::Send { .. }) | Some(Command::Connect) => {}
                    None => {
                        self.finish_close(None);
                        return;
                    }
                }
            }
        }
    }

    async fn on_connect_result(
        &mut self,
        host: &str,
        result: Result<(Box<dyn Transport>, ProtocolMessage), Error>,
    ) {
        match result {
            Ok((transport, connected)) => {
                self.transport = Some(transport);
                self.use_fallback = false;
                if host == self.hosts.primary_host() {
                    self.hosts.reset_visited();
                } else {
                    self.hosts.cache_host(host);
                }
                self.rest.set_active_realtime_host(host);
                self.on_connected(connected).await;
            }
            Err(err) => {
                let info = error_info_of(&err);
                if is_fatal_connect_error(&info) {
                    tracing::warn!("connection failed terminally: {info}");
                    self.fail_connection(info);
                    return;
                }
                if codes::is_token_error(info.code) {
                    self.force_reauth = true;
                }
                tracing::warn!(host, "connection attempt failed: {err}");
                self.use_fallback = true;
                self.enter_disconnected(Some(info));
            }
        }
    }

    async fn on_connected(&mut self, frame: ProtocolMessage) {
        let previous_id = self.connection_id.clone();
        let new_id = frame.connection_id.clone();
        let resumed = previous_id.is_some() && previous_id == new_id;
        let had_session = previous_id.is_some();

        if let Some(details) = &frame.connection_details {
            if let Some(key) = &details.connection_key {
                self.connection_key = Some(key.clone());
            }
            if let Some(ttl) = details.connection_state_ttl {
                self.state_ttl = Duration::from_millis(ttl.max(0) as u64);
            }
            if let Some(idle) = details.max_idle_interval {
                self.max_idle = Duration::from_millis(idle.max(0) as u64);
            }
        }
        if let Some(key) = &frame.connection_key {
            self.connection_key = Some(key.clone());
        }
        self.connection_id = new_id;

        if had_session && !resumed {
            // Fresh session: unacknowledged messages are gone for good.
            let err = frame.error.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::CONNECTION_FAILED, "connection resume failed")
            });
            tracing::warn!("resume failed, starting fresh session: {err}");
            self.pending.fail_all(err);
            self.connection_serial = None;
            self.msg_serial = 0;
        } else if resumed {
            tracing::info!("connection resumed");
        }

        self.disconnected_at = None;
        self.retry_at = None;
        self.sync_snapshot();
        self.set_state(ConnectionState::Connected, frame.error.clone(), Duration::ZERO);
        self.channels.connection_changed(ConnectionTransition::Connected {
            resumed: !had_session || resumed,
        });

        // Flush the backlog in submission order.
        for (frame, completion) in self.queued.drain() {
            self.send_frame(frame, completion).await;
        }
    }

    // --- active (connected / closing) --------------------------------------

    async fn run_active(&mut self) {
        let mut idle_deadline = Instant::now() + self.max_idle + HEARTBEAT_MARGIN;
        loop {
            if !matches!(self.state, ConnectionState::Connected | ConnectionState::Closing) {
                return;
            }
            let close_deadline = self.close_deadline.unwrap_or_else(|| {
                Instant::now() + Duration::from_secs(24 * 60 * 60)
            });
            tokio::select! {
                frame = self.transport.as_mut().expect("active state has a transport").recv() => match frame {
                    Some(Ok(bytes)) => {
                        idle_deadline = Instant::now() + self.max_idle + HEARTBEAT_MARGIN;
                        match decode_frame(&bytes, self.opts.binary_protocol) {
                            Ok(frame) => self.handle_frame(frame).await,
                            Err(e) => tracing::warn!("failed to decode frame: {e}"),
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("transport error: {e}");
                        self.on_transport_down(None);
                    }
                    None => {
                        tracing::info!("transport closed");
                        self.on_transport_down(None);
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Publish { frame, completion }) => {
                        self.send_frame(frame, completion).await;
                    }
                    Some(Command::Send { frame }) => {
                        self.send_control(frame).await;
                    }
                    Some(Command::Close) => {
                        self.begin_close().await;
                    }
                    Some(Command::Connect) => {}
                    None => {
                        self.begin_close().await;
                    }
                },
                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::warn!("nothing received within the idle interval");
                    self.on_transport_down(Some(ErrorInfo::new(
                        codes::DISCONNECTED,
                        "idle timeout expired",
                    )));
                }
                _ = tokio::time::sleep_until(close_deadline) => {
                    tracing::warn!("timed out awaiting CLOSED");
                    self.finish_close(None);
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: ProtocolMessage) {
        if let Some(serial) = frame.connection_serial {
            self.connection_serial = Some(serial);
            self.sync_snapshot();
        }
        match frame.action {
            action::HEARTBEAT => {
                tracing::trace!("heartbeat");
            }
            action::ACK => {
                self.pending.ack(
                    frame.msg_serial.unwrap_or(0),
                    frame.count.unwrap_or(1) as i64,
                    frame.error,
                );
            }
            action::NACK => {
                let err = ErrorInfo::or_unknown(frame.error);
                self.pending
                    .nack(frame.msg_serial.unwrap_or(0), frame.count.unwrap_or(1) as i64, err);
            }
            action::CONNECTED => {
                // In-place session update (e.g. after reauth).
                if let Some(details) = &frame.connection_details {
                    if let Some(ttl) = details.connection_state_ttl {
                        self.state_ttl = Duration::from_millis(ttl.max(0) as u64);
                    }
                    if let Some(idle) = details.max_idle_interval {
                        self.max_idle = Duration::from_millis(idle.max(0) as u64);
                    }
                    if let Some(key) = &details.connection_key {
                        self.connection_key = Some(key.clone());
                    }
                }
                self.sync_snapshot();
                self.set_state(ConnectionState::Connected, frame.error, Duration::ZERO);
            }
            action::DISCONNECTED => {
                let err = ErrorInfo::or_unknown(frame.error);
                if codes::is_token_error(err.code) {
                    // Renewable: reconnect with a fresh token.
                    self.force_reauth = true;
                    self.on_transport_down(Some(err));
                } else if err.is_retriable() {
                    self.on_transport_down(Some(err));
                } else {
                    self.fail_connection(err);
                }
            }
            action::CLOSED => {
                self.finish_close(frame.error);
            }
            action::ERROR => {
                if frame.channel.is_some() {
                    self.channels.handle_frame(frame);
                } else {
                    self.fail_connection(ErrorInfo::or_unknown(frame.error));
                }
            }
            action::AUTH => {
                self.reauth().await;
            }
            action::ATTACHED
            | action::DETACHED
            | action::MESSAGE
            | action::PRESENCE
            | action::SYNC => {
                self.channels.handle_frame(frame);
            }
            other => {
                tracing::debug!(action = other, "ignoring frame");
            }
        }
    }

    /// Renew the token inline and present it on the live connection.
    async fn reauth(&mut self) {
        tracing::info!("server requested reauthentication");
        let token = match self.rest.auth().authorize(true).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("reauthentication failed: {e}");
                self.fail_connection(ErrorInfo::new(codes::TOKEN_ERROR, e.to_string()));
                return;
            }
        };
        let frame = ProtocolMessage {
            action: action::AUTH,
            auth: Some(AuthDetails {
                access_token: token.token,
            }),
            ..Default::default()
        };
        self.send_control(frame).await;
    }

    async fn send_frame(&mut self, mut frame: ProtocolMessage, completion: Option<Completion>) {
        if self.state != ConnectionState::Connected {
            self.queue_or_fail(frame, completion);
            return;
        }
        if frame.expects_ack() {
            let serial = self.msg_serial;
            self.msg_serial += 1;
            frame.msg_serial = Some(serial);
            self.pending.enqueue(serial, completion);
            self.sync_snapshot();
        } else if let Some(completion) = completion {
            let _ = completion.send(None);
        }
        self.transmit(frame).await;
    }

    async fn send_control(&mut self, frame: ProtocolMessage) {
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Closing {
            self.transmit(frame).await;
        }
    }

    async fn transmit(&mut self, frame: ProtocolMessage) {
        let binary = self.opts.binary_protocol;
        let bytes = match encode_frame(&frame, binary) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(action = frame.action, "failed to encode frame: {e}");
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send(bytes, binary).await {
            tracing::warn!("transport send failed: {e}");
            // Sent-but-unacked entries stay pending; a resume settles them.
            self.on_transport_down(None);
        }
    }

    async fn begin_close(&mut self) {
        self.set_state(ConnectionState::Closing, None, Duration::ZERO);
        self.close_deadline = Some(Instant::now() + self.opts.realtime_request_timeout);
        let frame = ProtocolMessage {
            action: action::CLOSE,
            ..Default::default()
        };
        self.send_control(frame).await;
    }

    fn finish_close(&mut self, reason: Option<ErrorInfo>) {
        let err = reason
            .clone()
            .unwrap_or_else(|| ErrorInfo::new(codes::CONNECTION_CLOSED, "connection closed"));
        self.abandon_session(&err);
        self.close_deadline = None;
        self.drop_transport();
        self.set_state(ConnectionState::Closed, reason, Duration::ZERO);
        self.channels.connection_changed(ConnectionTransition::Closed);
    }

    fn fail_connection(&mut self, err: ErrorInfo) {
        self.abandon_session(&err);
        self.close_deadline = None;
        self.drop_transport();
        self.set_state(ConnectionState::Failed, Some(err.clone()), Duration::ZERO);
        self.channels
            .connection_changed(ConnectionTransition::Failed(err));
    }

    fn on_transport_down(&mut self, reason: Option<ErrorInfo>) {
        self.drop_transport();
        if self.state == ConnectionState::Closing {
            self.finish_close(None);
            return;
        }
        self.enter_disconnected(reason);
    }

    fn enter_disconnected(&mut self, reason: Option<ErrorInfo>) {
        if self.disconnected_at.is_none() {
            self.disconnected_at = Some(Instant::now());
        }
        // Past the TTL the session is gone; surface SUSPENDED instead.
        if self
            .disconnected_at
            .is_some_and(|at| at.elapsed() >= self.state_ttl)
        {
            self.enter_suspended(reason);
            return;
        }
        let retry_in = self.opts.disconnected_retry_timeout;
        self.retry_at = Some(Instant::now() + retry_in);
        self.set_state(ConnectionState::Disconnected, reason, retry_in);
        self.channels
            .connection_changed(ConnectionTransition::Disconnected);
    }

    fn enter_suspended(&mut self, reason: Option<ErrorInfo>) {
        let err = reason
            .unwrap_or_else(|| ErrorInfo::new(codes::CONNECTION_SUSPENDED, "connection unavailable"));
        self.abandon_session(&err);
        let retry_in = self.opts.suspended_retry_timeout;
        self.retry_at = Some(Instant::now() + retry_in);
        self.set_state(ConnectionState::Suspended, Some(err.clone()), retry_in);
        self.channels
            .connection_changed(ConnectionTransition::Suspended(err));
    }

    fn drop_transport(&mut self) {
        // Closing is best-effort and must not block the dispatcher; the
        // transport cleans up when dropped.
        self.transport = None;
    }

    // --- idle (initialized / disconnected / suspended) ----------------------

    /// Returns `false` when the dispatcher should exit.
    async fn run_idle(&mut self) -> bool {
        loop {
            if !matches!(
                self.state,
                ConnectionState::Initialized
                    | ConnectionState::Disconnected
                    | ConnectionState::Suspended
            ) {
                return true;
            }
            let far_future = Instant::now() + Duration::from_secs(24 * 60 * 60);
            let retry_at = self.retry_at.unwrap_or(far_future);
            let ttl_at = match (self.state, self.disconnected_at) {
                (ConnectionState::Disconnected, Some(at)) => at + self.state_ttl,
                _ => far_future,
            };
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect) => {
                        self.retry_at = None;
                        self.set_state(ConnectionState::Connecting, None, Duration::ZERO);
                        return true;
                    }
                    Some(Command::Close) => {
                        self.finish_close(None);
                        return true;
                    }
                    Some(Command::Publish { frame, completion }) => {
                        self.queue_or_fail(frame, completion);
                    }
                    Some(Command::Send { .. }) => {}
                    None => return false,
                },
                _ = tokio::time::sleep_until(retry_at) => {
                    self.retry_at = None;
                    self.set_state(ConnectionState::Connecting, None, Duration::ZERO);
                    return true;
                }
                _ = tokio::time::sleep_until(ttl_at) => {
                    self.enter_suspended(None);
                }
            }
        }
    }

    /// Returns `false` when the dispatcher should exit.
    async fn run_terminal(&mut self) -> bool {
        match self.cmd_rx.recv().await {
            Some(Command::Publish { completion, .. }) => {
                if let Some(completion) = completion {
                    let _ = completion.send(Some(state_error_info(self.state)));
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn queue_or_fail(&mut self, frame: ProtocolMessage, completion: Option<Completion>) {
        let queueable = matches!(
            self.state,
            ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Disconnected
        );
        if queueable && self.opts.queue_messages {
            self.queued.enqueue(frame, completion);
        } else if let Some(completion) = completion {
            let _ = completion.send(Some(state_error_info(self.state)));
        }
    }
}

fn state_error_info(state: ConnectionState) -> ErrorInfo {
    match state {
        ConnectionState::Suspended => {
            ErrorInfo::new(codes::CONNECTION_SUSPENDED, "connection unavailable")
        }
        ConnectionState::Closing | ConnectionState::Closed => {
            ErrorInfo::new(codes::CONNECTION_CLOSED, "connection closed")
        }
        ConnectionState::Failed => ErrorInfo::new(codes::CONNECTION_FAILED, "connection failed"),
        _ => ErrorInfo::new(codes::DISCONNECTED, "connection temporarily unavailable"),
    }
}

fn error_info_of(err: &Error) -> ErrorInfo {
    err.error_info().cloned().unwrap_or_else(|| {
        ErrorInfo::new(codes::DISCONNECTED, err.to_string())
    })
}

/// Whether a failed connect attempt should move the connection to FAILED
/// rather than retrying. Token errors are left retriable; a fresh attempt
/// renews the token.
fn is_fatal_connect_error(err: &ErrorInfo) -> bool {
    if codes::is_token_error(err.code) {
        return false;
    }
    !err.is_retriable()
}

// ---------------------------------------------------------------------------
// Connection establishment
// ---------------------------------------------------------------------------

/// Dial, send CONNECT (with resume details when available), and wait for
/// CONNECTED. The whole attempt is bounded by `realtime_request_timeout`.
async fn establish(
    opts: Arc<ClientOptions>,
    rest: Rest,
    dialer: Arc<dyn Dialer>,
    host: String,
    resume: Option<(String, Option<i64>)>,
    force_reauth: bool,
) -> Result<(Box<dyn Transport>, ProtocolMessage), Error> {
    let deadline = opts.realtime_request_timeout;
    tokio::time::timeout(deadline, async move {
        let token = rest.auth().authorize(force_reauth).await?;
        let url = realtime_url(&opts, &host, &token.token)?;
        let mut transport = dialer.dial(&url, opts.realtime_request_timeout).await?;

        let connect = ProtocolMessage {
            action: action::CONNECT,
            connection_key: resume.as_ref().map(|(key, _)| key.clone()),
            connection_serial: resume.as_ref().and_then(|(_, serial)| *serial),
            timestamp: Some(now_ms()),
            ..Default::default()
        };
        let bytes = encode_frame(&connect, opts.binary_protocol)?;
        transport.send(bytes, opts.binary_protocol).await?;

        loop {
            let Some(frame) = transport.recv().await else {
                return Err(Error::Connection(ErrorInfo::new(
                    codes::CONNECTION_FAILED,
                    "transport closed before CONNECTED",
                )));
            };
            let frame = decode_frame(&frame?, opts.binary_protocol)?;
            match frame.action {
                action::CONNECTED => return Ok((transport, frame)),
                action::ERROR | action::DISCONNECTED => {
                    return Err(Error::Connection(ErrorInfo::or_unknown(frame.error)));
                }
                other => {
                    tracing::debug!(action = other, "ignoring pre-CONNECTED frame");
                }
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout)?
}

fn realtime_url(opts: &ClientOptions, host: &str, token: &str) -> Result<String, Error> {
    let mut url = url::Url::parse(&opts.realtime_url(host))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("v", PROTOCOL_VERSION);
        query.append_pair("agent", AGENT_STRING);
        query.append_pair(
            "format",
            if opts.binary_protocol { "msgpack" } else { "json" },
        );
        query.append_pair("heartbeats", "true");
        query.append_pair("echo", if opts.echo_messages { "true" } else { "false" });
        query.append_pair("accessToken", token);
        if let Some(client_id) = &opts.client_id {
            query.append_pair("clientId", client_id);
        }
        for (name, value) in &opts.transport_params {
            query.append_pair(name, value);
        }
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_url_carries_negotiation_params() {
        let mut opts = ClientOptions::new();
        opts.client_id = Some("alice".into());
        opts.transport_params = vec![("rewind".into(), "1".into())];
        let url = realtime_url(&opts, "realtime.ably.io", "tok").unwrap();
        assert!(url.starts_with("wss://realtime.ably.io:443/?"));
        assert!(url.contains("v=1.2"));
        assert!(url.contains("format=msgpack"));
        assert!(url.contains("heartbeats=true"));
        assert!(url.contains("echo=true"));
        assert!(url.contains("accessToken=tok"));
        assert!(url.contains("clientId=alice"));
        assert!(url.contains("rewind=1"));
    }

    #[test]
    fn realtime_url_json_protocol_no_echo() {
        let mut opts = ClientOptions::new();
        opts.binary_protocol = false;
        opts.echo_messages = false;
        opts.tls = false;
        let url = realtime_url(&opts, "127.0.0.1", "tok").unwrap();
        assert!(url.starts_with("ws://127.0.0.1:80/?"));
        assert!(url.contains("format=json"));
        assert!(url.contains("echo=false"));
    }

    #[test]
    fn connection_event_from_state() {
        assert_eq!(
            ConnectionEvent::from(ConnectionState::Connected),
            ConnectionEvent::Connected
        );
        assert_eq!(
            ConnectionEvent::from(ConnectionState::Failed),
            ConnectionEvent::Failed
        );
    }

    #[test]
    fn fatal_connect_error_classification() {
        // Token errors get a fresh token on retry.
        assert!(!is_fatal_connect_error(
            &ErrorInfo::new(40142, "expired").with_status(401)
        ));
        // Other 4xx errors are terminal.
        assert!(is_fatal_connect_error(
            &ErrorInfo::new(40160, "denied").with_status(401)
        ));
        // 5xx and network errors retry.
        assert!(!is_fatal_connect_error(
            &ErrorInfo::new(50000, "oops").with_status(500)
        ));
        assert!(!is_fatal_connect_error(&ErrorInfo {
            code: 0,
            status_code: None,
            message: "io".into(),
            href: None,
        }));
    }
}
