//! Realtime channels: the attach/detach state machine, message
//! subscriptions, and the channel-scoped presence API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::connection::{Command, ConnectionInner, ConnectionState};
use crate::crypto::CipherParams;
use crate::emitter::Emitter;
use crate::error::{codes, Error, ErrorInfo};
use crate::message::{Data, Message, PresenceAction, PresenceMessage};
use crate::options::ClientOptions;
use crate::presence::PresenceState;
use crate::protocol::{action, flags, ProtocolMessage};
use crate::queue::Completion;

const SUBSCRIPTION_CAPACITY: usize = 64;

/// The state of a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelState::Initialized => "INITIALIZED",
            ChannelState::Attaching => "ATTACHING",
            ChannelState::Attached => "ATTACHED",
            ChannelState::Detaching => "DETACHING",
            ChannelState::Detached => "DETACHED",
            ChannelState::Suspended => "SUSPENDED",
            ChannelState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Channel lifecycle events: the states plus `Update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
    Update,
}

impl From<ChannelState> for ChannelEvent {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Initialized => ChannelEvent::Initialized,
            ChannelState::Attaching => ChannelEvent::Attaching,
            ChannelState::Attached => ChannelEvent::Attached,
            ChannelState::Detaching => ChannelEvent::Detaching,
            ChannelState::Detached => ChannelEvent::Detached,
            ChannelState::Suspended => ChannelEvent::Suspended,
            ChannelState::Failed => ChannelEvent::Failed,
        }
    }
}

/// Data accompanying every channel state transition.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    pub current: ChannelState,
    pub previous: ChannelState,
    pub event: ChannelEvent,
    pub reason: Option<ErrorInfo>,
    /// Whether message continuity was preserved across this (re)attach. When
    /// `false` there may be a gap.
    pub resumed: bool,
}

/// Connection transitions as seen by channels.
pub(crate) enum ConnectionTransition {
    Connected { resumed: bool },
    Disconnected,
    Suspended(ErrorInfo),
    Closed,
    Failed(ErrorInfo),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The channel registry owned by a realtime client. Channels are created
/// lazily on first [`get`](Channels::get) and survive reconnection until
/// released.
#[derive(Clone)]
pub struct Channels {
    inner: Arc<ChannelsInner>,
}

struct ChannelsInner {
    opts: Arc<ClientOptions>,
    conn: Arc<ConnectionInner>,
    registry: Mutex<HashMap<String, Arc<ChannelInner>>>,
}

impl Channels {
    pub(crate) fn new(opts: Arc<ClientOptions>, conn: Arc<ConnectionInner>) -> Self {
        Channels {
            inner: Arc::new(ChannelsInner {
                opts,
                conn,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The channel with the given name, created on first use.
    pub fn get(&self, name: impl Into<String>) -> RealtimeChannel {
        self.get_inner(name.into(), None)
    }

    /// Like [`get`](Channels::get), with payload encryption. The cipher only
    /// takes effect when the channel is first created.
    pub fn get_with_cipher(
        &self,
        name: impl Into<String>,
        cipher: CipherParams,
    ) -> RealtimeChannel {
        self.get_inner(name.into(), Some(cipher))
    }

    fn get_inner(&self, name: String, cipher: Option<CipherParams>) -> RealtimeChannel {
        let mut registry = self.registry();
        let inner = registry
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(ChannelInner {
                    name,
                    opts: self.inner.opts.clone(),
                    conn: self.inner.conn.clone(),
                    state: Mutex::new(ChannelStateData::default()),
                    emitter: Emitter::new(),
                    subscriptions: Arc::new(Mutex::new(Vec::new())),
                    next_sub_id: AtomicU64::new(0),
                    presence: PresenceState::new(),
                    cipher,
                })
            })
            .clone();
        RealtimeChannel { inner }
    }

    /// Destroy a channel handle. Detach is the caller's responsibility.
    pub fn release(&self, name: &str) {
        self.registry().remove(name);
    }

    /// Names of all live channels.
    pub fn names(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ChannelInner>>> {
        self.inner.registry.lock().expect("channel registry poisoned")
    }

    /// Route an inbound channel-scoped frame.
    pub(crate) fn handle_frame(&self, frame: ProtocolMessage) {
        let Some(name) = frame.channel.as_deref() else {
            tracing::warn!(action = frame.action, "channel frame without channel name");
            return;
        };
        let channel = self.registry().get(name).cloned();
        match channel {
            Some(channel) => channel.handle_frame(frame),
            None => {
                tracing::debug!(channel = name, "frame for unknown channel");
            }
        }
    }

    /// Propagate a connection transition to every channel.
    pub(crate) fn connection_changed(&self, transition: ConnectionTransition) {
        let channels: Vec<Arc<ChannelInner>> = self.registry().values().cloned().collect();
        for channel in channels {
            channel.connection_changed(&transition);
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelStateData {
    state: ChannelState,
    error_reason: Option<ErrorInfo>,
}

struct ChannelInner {
    name: String,
    opts: Arc<ClientOptions>,
    conn: Arc<ConnectionInner>,
    state: Mutex<ChannelStateData>,
    emitter: Emitter<ChannelEvent, ChannelStateChange>,
    subscriptions: Arc<Mutex<Vec<SubscriptionEntry>>>,
    next_sub_id: AtomicU64,
    presence: PresenceState,
    cipher: Option<CipherParams>,
}

struct SubscriptionEntry {
    id: u64,
    /// Event-name filter; `None` receives everything.
    name: Option<String>,
    tx: mpsc::Sender<Message>,
    dropped: u64,
}

/// Handle to a realtime channel. Cheap to clone.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state_data().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.state_data().error_reason.clone()
    }

    pub fn on(
        &self,
        event: ChannelEvent,
        listener: impl FnMut(ChannelStateChange) + Send + 'static,
    ) -> crate::emitter::ListenerGuard {
        self.inner.emitter.on(event, listener)
    }

    pub fn once(
        &self,
        event: ChannelEvent,
        listener: impl FnMut(ChannelStateChange) + Send + 'static,
    ) -> crate::emitter::ListenerGuard {
        self.inner.emitter.once(event, listener)
    }

    pub fn on_all(
        &self,
        listener: impl FnMut(ChannelStateChange) + Send + 'static,
    ) -> crate::emitter::ListenerGuard {
        self.inner.emitter.on_all(listener)
    }

    pub fn off_all(&self) {
        self.inner.emitter.off_all();
    }

    /// Attach to the channel, waiting for the server's ATTACHED (bounded by
    /// `realtime_request_timeout`). A timed-out attach leaves the channel
    /// SUSPENDED with a retry scheduled.
    pub async fn attach(&self) -> Result<(), Error> {
        match self.inner.conn.state() {
            ConnectionState::Closed | ConnectionState::Closing | ConnectionState::Failed => {
                return Err(Error::Channel(ErrorInfo::new(
                    codes::CHANNEL_OPERATION_FAILED,
                    "cannot attach; connection is closed or failed",
                )));
            }
            _ => {}
        }
        let mut rx = self.inner.emitter.subscribe();
        match self.state() {
            ChannelState::Attached => return Ok(()),
            ChannelState::Failed => {
                // A failed channel can be explicitly reattached.
                self.inner.begin_attach();
            }
            ChannelState::Attaching => {}
            _ => self.inner.begin_attach(),
        }

        let timeout = self.inner.opts.realtime_request_timeout;
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok((_, change)) => match change.current {
                        ChannelState::Attached => return Ok(()),
                        ChannelState::Failed => {
                            return Err(Error::Channel(change.reason.unwrap_or_else(|| {
                                ErrorInfo::new(
                                    codes::CHANNEL_OPERATION_FAILED,
                                    "attach failed",
                                )
                            })))
                        }
                        // A connection transition can detach an attaching
                        // channel in passing; re-drive the attach unless the
                        // connection itself is gone.
                        ChannelState::Detached => match self.inner.conn.state() {
                            ConnectionState::Closed
                            | ConnectionState::Closing
                            | ConnectionState::Failed => {
                                return Err(Error::Channel(change.reason.unwrap_or_else(
                                    || {
                                        ErrorInfo::new(
                                            codes::CHANNEL_OPERATION_FAILED,
                                            "cannot attach; connection is closed or failed",
                                        )
                                    },
                                )))
                            }
                            _ => {
                                self.inner.begin_attach();
                                continue;
                            }
                        },
                        _ => continue,
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        if self.state() == ChannelState::Attached {
                            return Ok(());
                        }
                    }
                    Err(_) => {
                        return Err(Error::Channel(ErrorInfo::new(
                            codes::CHANNEL_OPERATION_FAILED,
                            "channel is no longer running",
                        )))
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.suspend(
                    ErrorInfo::new(codes::TIMEOUT, "attach timed out").with_status(408),
                );
                Err(Error::Timeout)
            }
        }
    }

    /// Detach from the channel, waiting for DETACHED.
    pub async fn detach(&self) -> Result<(), Error> {
        let mut rx = self.inner.emitter.subscribe();
        let prior_state = self.state();
        match prior_state {
            ChannelState::Initialized | ChannelState::Detached => return Ok(()),
            ChannelState::Failed => {
                return Err(Error::Channel(ErrorInfo::new(
                    codes::CHANNEL_OPERATION_FAILED,
                    "cannot detach a failed channel",
                )))
            }
            // The server has no attachment to release.
            ChannelState::Suspended => {
                self.inner
                    .set_state(ChannelState::Detached, None, true);
                return Ok(());
            }
            ChannelState::Detaching => {}
            _ => {
                self.inner.set_state(ChannelState::Detaching, None, true);
                self.inner.send_control(ProtocolMessage {
                    action: action::DETACH,
                    channel: Some(self.inner.name.clone()),
                    ..Default::default()
                });
            }
        }

        let timeout = self.inner.opts.realtime_request_timeout;
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok((_, change)) => match change.current {
                        ChannelState::Detached => return Ok(()),
                        ChannelState::Failed => {
                            return Err(Error::Channel(change.reason.unwrap_or_else(|| {
                                ErrorInfo::new(
                                    codes::CHANNEL_OPERATION_FAILED,
                                    "detach failed",
                                )
                            })))
                        }
                        _ => continue,
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        if self.state() == ChannelState::Detached {
                            return Ok(());
                        }
                    }
                    Err(_) => return Ok(()),
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                // Roll back so the channel remains usable.
                self.inner.set_state(
                    prior_state,
                    Some(ErrorInfo::new(codes::TIMEOUT, "detach timed out").with_status(408)),
                    true,
                );
                Err(Error::Timeout)
            }
        }
    }

    /// Publish one message and wait for the server's acknowledgement.
    pub async fn publish(&self, message: Message) -> Result<(), Error> {
        self.publish_batch(vec![message]).await
    }

    /// Publish a batch in one frame and wait for its acknowledgement.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<(), Error> {
        if self.state() == ChannelState::Failed {
            return Err(Error::Channel(ErrorInfo::new(
                codes::CHANNEL_OPERATION_FAILED,
                "channel is failed",
            )));
        }
        // Publishing an unused channel brings it up.
        if self.state() == ChannelState::Initialized {
            self.inner.begin_attach();
        }

        let mut wires = Vec::with_capacity(messages.len());
        for message in &messages {
            let mut message = message.clone();
            if message.client_id.is_none() {
                message.client_id = self.inner.opts.client_id.clone();
            }
            wires.push(message.encoded(self.inner.cipher.as_ref())?);
        }
        let frame = ProtocolMessage {
            action: action::MESSAGE,
            channel: Some(self.inner.name.clone()),
            messages: Some(wires),
            ..Default::default()
        };
        self.inner.send_acked(frame).await
    }

    /// Subscribe to every message on this channel.
    pub fn subscribe(&self) -> MessageStream {
        self.inner.subscribe(None)
    }

    /// Subscribe to messages with the given event name.
    pub fn subscribe_to(&self, name: impl Into<String>) -> MessageStream {
        self.inner.subscribe(Some(name.into()))
    }

    /// The channel-scoped presence API.
    pub fn presence(&self) -> Presence {
        Presence {
            inner: self.inner.clone(),
        }
    }
}

/// A stream of messages delivered to one subscriber. Dropping it
/// unsubscribes. Messages are dropped (with a logged warning) if the
/// consumer falls persistently behind.
pub struct MessageStream {
    id: u64,
    rx: mpsc::Receiver<Message>,
    subscriptions: Arc<Mutex<Vec<SubscriptionEntry>>>,
}

impl MessageStream {
    /// The next message, or `None` once unsubscribed and drained.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
        subs.retain(|entry| entry.id != self.id);
    }
}

impl ChannelInner {
    fn state_data(&self) -> std::sync::MutexGuard<'_, ChannelStateData> {
        self.state.lock().expect("channel state poisoned")
    }

    fn current_state(&self) -> ChannelState {
        self.state_data().state
    }

    fn set_state(
        self: &Arc<Self>,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
    ) {
        let previous = {
            let mut data = self.state_data();
            let previous = data.state;
            data.state = state;
            if reason.is_some() {
                data.error_reason = reason.clone();
            }
            previous
        };
        let event = if previous == state {
            ChannelEvent::Update
        } else {
            ChannelEvent::from(state)
        };
        tracing::debug!(
            channel = %self.name,
            previous = %previous,
            current = %state,
            "channel state change"
        );
        self.emitter.emit(
            event,
            ChannelStateChange {
                current: state,
                previous,
                event,
                reason,
                resumed,
            },
        );
        if state == ChannelState::Suspended {
            self.schedule_reattach();
        }
    }

    /// Move to ATTACHING and send ATTACH. No-op while an attach is already
    /// in flight.
    fn begin_attach(self: &Arc<Self>) {
        if self.current_state() == ChannelState::Attaching {
            return;
        }
        self.set_state(ChannelState::Attaching, None, true);
        self.send_attach();
    }

    fn send_attach(&self) {
        self.send_control(ProtocolMessage {
            action: action::ATTACH,
            channel: Some(self.name.clone()),
            ..Default::default()
        });
    }

    fn send_control(&self, frame: ProtocolMessage) {
        let _ = self.conn.send_command(Command::Send { frame });
    }

    async fn send_acked(&self, frame: ProtocolMessage) -> Result<(), Error> {
        let (tx, rx): (Completion, _) = tokio::sync::oneshot::channel();
        self.conn.send_command(Command::Publish {
            frame,
            completion: Some(tx),
        })?;
        match rx.await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err.into()),
            Err(_) => Err(Error::Cancelled),
        }
    }

    fn suspend(self: &Arc<Self>, reason: ErrorInfo) {
        if matches!(
            self.current_state(),
            ChannelState::Attaching | ChannelState::Attached
        ) {
            self.set_state(ChannelState::Suspended, Some(reason), false);
        }
    }

    /// A suspended channel retries its attach once the retry timeout passes,
    /// provided the connection came back.
    fn schedule_reattach(self: &Arc<Self>) {
        let channel = self.clone();
        let delay = self.opts.channel_retry_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if channel.current_state() == ChannelState::Suspended
                && channel.conn.state() == ConnectionState::Connected
            {
                channel.begin_attach();
            }
        });
    }

    fn subscribe(self: &Arc<Self>, name: Option<String>) -> MessageStream {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .push(SubscriptionEntry {
                id,
                name,
                tx,
                dropped: 0,
            });
        MessageStream {
            id,
            rx,
            subscriptions: self.subscriptions.clone(),
        }
    }

    // --- inbound frames ----------------------------------------------------

    fn handle_frame(self: &Arc<Self>, frame: ProtocolMessage) {
        match frame.action {
            action::ATTACHED => self.on_attached(frame),
            action::DETACHED => self.on_detached(frame),
            action::ERROR => {
                let err = ErrorInfo::or_unknown(frame.error);
                tracing::warn!(channel = %self.name, "channel error: {err}");
                self.set_state(ChannelState::Failed, Some(err), false);
            }
            action::MESSAGE => self.on_message(frame),
            action::PRESENCE => self.on_presence(frame),
            action::SYNC => self.on_sync(frame),
            other => {
                tracing::debug!(channel = %self.name, action = other, "ignoring frame");
            }
        }
    }

    fn on_attached(self: &Arc<Self>, frame: ProtocolMessage) {
        let resumed = frame.has_flag(flags::RESUMED);
        let has_presence = frame.has_flag(flags::HAS_PRESENCE);

        if !resumed {
            // Continuity lost: the member set will be rebuilt (by SYNC when
            // the server has members, from scratch otherwise), and our own
            // members must be re-entered.
            self.presence.reset();
            self.reenter_local_members();
        }
        if has_presence {
            self.presence.expect_sync();
        }
        tracing::info!(
            channel = %self.name,
            resumed,
            has_presence,
            has_backlog = frame.has_flag(flags::HAS_BACKLOG),
            "channel attached"
        );
        self.set_state(ChannelState::Attached, frame.error, resumed);
    }

    fn on_detached(self: &Arc<Self>, frame: ProtocolMessage) {
        match self.current_state() {
            ChannelState::Detaching => {
                self.set_state(ChannelState::Detached, frame.error, false);
            }
            ChannelState::Failed | ChannelState::Detached | ChannelState::Initialized => {}
            _ => {
                // Unsolicited detach: bring the channel back.
                tracing::warn!(channel = %self.name, "server detached channel, reattaching");
                self.set_state(ChannelState::Attaching, frame.error, false);
                self.send_attach();
            }
        }
    }

    fn on_message(&self, frame: ProtocolMessage) {
        let Some(wires) = frame.messages else { return };
        let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
        for (index, wire) in wires.into_iter().enumerate() {
            let (mut message, decode_err) = Message::from_wire(wire, self.cipher.as_ref());
            if let Some(err) = decode_err {
                // The partially decoded payload is still delivered.
                tracing::warn!(channel = %self.name, "message decode: {err}");
            }
            message.update_empty_fields(
                frame.id.as_deref(),
                frame.connection_id.as_deref(),
                frame.timestamp,
                index,
            );
            for entry in subs.iter_mut() {
                if entry.name.as_deref().is_some_and(|n| Some(n) != message.name.as_deref()) {
                    continue;
                }
                match entry.tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        entry.dropped += 1;
                        tracing::warn!(
                            channel = %self.name,
                            total_dropped = entry.dropped,
                            "subscriber full, dropping message"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
    }

    fn on_presence(&self, frame: ProtocolMessage) {
        let Some(wires) = frame.presence else { return };
        for (index, wire) in wires.into_iter().enumerate() {
            let (mut message, decode_err) = PresenceMessage::from_wire(wire, self.cipher.as_ref());
            if let Some(err) = decode_err {
                tracing::warn!(channel = %self.name, "presence decode: {err}");
            }
            if message.id.is_none() {
                if let Some(fid) = frame.id.as_deref() {
                    message.id = Some(format!("{fid}:{index}"));
                }
            }
            if message.connection_id.is_none() {
                message.connection_id = frame.connection_id.clone();
            }
            if message.timestamp.is_none() {
                message.timestamp = frame.timestamp;
            }
            self.presence.apply_realtime(message);
        }
    }

    fn on_sync(&self, frame: ProtocolMessage) {
        let members = frame
            .presence
            .unwrap_or_default()
            .into_iter()
            .map(|wire| {
                let (message, decode_err) =
                    PresenceMessage::from_wire(wire, self.cipher.as_ref());
                if let Some(err) = decode_err {
                    tracing::warn!(channel = %self.name, "presence decode during sync: {err}");
                }
                message
            })
            .collect();
        self.presence
            .process_sync(frame.channel_serial.as_deref(), members);
    }

    /// Re-enter members this client had entered, after an attach without
    /// continuity.
    fn reenter_local_members(&self) {
        for member in self.presence.internal_members() {
            tracing::info!(
                channel = %self.name,
                client_id = ?member.client_id,
                "re-entering presence member"
            );
            let wire = match member_with_action(&member, PresenceAction::Enter)
                .encoded(self.cipher.as_ref())
            {
                Ok(wire) => wire,
                Err(e) => {
                    tracing::warn!(channel = %self.name, "failed to encode re-entry: {e}");
                    continue;
                }
            };
            let _ = self.conn.send_command(Command::Publish {
                frame: ProtocolMessage {
                    action: action::PRESENCE,
                    channel: Some(self.name.clone()),
                    presence: Some(vec![wire]),
                    ..Default::default()
                },
                completion: None,
            });
        }
    }

    // --- connection propagation ---------------------------------------------

    fn connection_changed(self: &Arc<Self>, transition: &ConnectionTransition) {
        match transition {
            ConnectionTransition::Connected { resumed } => match self.current_state() {
                ChannelState::Suspended => self.begin_attach(),
                ChannelState::Attaching => self.send_attach(),
                ChannelState::Attached if !resumed => {
                    self.set_state(ChannelState::Attaching, None, false);
                    self.send_attach();
                }
                _ => {}
            },
            // Messages queue; attachment state is preserved for a resume.
            ConnectionTransition::Disconnected => {}
            ConnectionTransition::Suspended(err) => self.suspend(err.clone()),
            ConnectionTransition::Closed => {
                if !matches!(
                    self.current_state(),
                    ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
                ) {
                    self.set_state(ChannelState::Detached, None, false);
                }
            }
            ConnectionTransition::Failed(err) => {
                if !matches!(
                    self.current_state(),
                    ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
                ) {
                    self.set_state(ChannelState::Failed, Some(err.clone()), false);
                }
            }
        }
    }
}

fn member_with_action(member: &PresenceMessage, action: PresenceAction) -> PresenceMessage {
    PresenceMessage {
        action,
        id: None,
        client_id: member.client_id.clone(),
        connection_id: None,
        data: member.data.clone(),
        encoding: None,
        timestamp: None,
    }
}

// ---------------------------------------------------------------------------
// Presence API
// ---------------------------------------------------------------------------

/// Channel-scoped presence operations.
pub struct Presence {
    inner: Arc<ChannelInner>,
}

impl Presence {
    /// The current member set. Waits for an in-progress SYNC so a partial
    /// set is never presented as complete; bounded by
    /// `realtime_request_timeout`.
    pub async fn get(&self) -> Result<Vec<PresenceMessage>, Error> {
        let timeout = self.inner.opts.realtime_request_timeout;
        tokio::time::timeout(timeout, self.inner.presence.wait_sync())
            .await
            .map_err(|_| Error::Timeout)?;
        Ok(self.inner.presence.members())
    }

    /// The member set as currently known, even mid-SYNC.
    pub fn get_now(&self) -> Vec<PresenceMessage> {
        self.inner.presence.members()
    }

    /// Enter this client into the channel's presence set.
    pub async fn enter(&self, data: Data) -> Result<(), Error> {
        let client_id = self.own_client_id()?;
        self.send_presence(PresenceAction::Enter, client_id, data).await
    }

    /// Update this client's presence data.
    pub async fn update(&self, data: Data) -> Result<(), Error> {
        let client_id = self.own_client_id()?;
        self.send_presence(PresenceAction::Update, client_id, data).await
    }

    /// Remove this client from the presence set.
    pub async fn leave(&self) -> Result<(), Error> {
        let client_id = self.own_client_id()?;
        self.send_presence(PresenceAction::Leave, client_id, Data::None).await
    }

    /// Enter on behalf of another client id (requires a wildcard-capable
    /// token).
    pub async fn enter_client(&self, client_id: impl Into<String>, data: Data) -> Result<(), Error> {
        self.send_presence(PresenceAction::Enter, client_id.into(), data).await
    }

    pub async fn leave_client(&self, client_id: impl Into<String>) -> Result<(), Error> {
        self.send_presence(PresenceAction::Leave, client_id.into(), Data::None).await
    }

    fn own_client_id(&self) -> Result<String, Error> {
        self.inner.opts.client_id.clone().ok_or_else(|| {
            Error::Channel(ErrorInfo::new(
                codes::OPERATION_NOT_PERMITTED,
                "presence requires a client_id",
            ))
        })
    }

    async fn send_presence(
        &self,
        presence_action: PresenceAction,
        client_id: String,
        data: Data,
    ) -> Result<(), Error> {
        // Presence can only be sent over a live connection.
        if self.inner.conn.state() != ConnectionState::Connected {
            return Err(Error::Connection(ErrorInfo::new(
                codes::DISCONNECTED,
                "presence requires an active connection",
            )));
        }
        if self.inner.current_state() != ChannelState::Attached {
            self.channel().attach().await?;
        }

        let message = PresenceMessage {
            action: presence_action,
            id: None,
            client_id: Some(client_id),
            connection_id: None,
            data,
            encoding: None,
            timestamp: None,
        };
        let wire = message.encoded(self.inner.cipher.as_ref())?;
        let frame = ProtocolMessage {
            action: action::PRESENCE,
            channel: Some(self.inner.name.clone()),
            presence: Some(vec![wire]),
            ..Default::default()
        };
        self.inner.send_acked(frame).await?;

        match presence_action {
            PresenceAction::Enter | PresenceAction::Update => {
                self.inner.presence.track_internal(message);
            }
            PresenceAction::Leave => {
                self.inner.presence.untrack_internal(&message.member_key());
            }
            _ => {}
        }
        Ok(())
    }

    fn channel(&self) -> RealtimeChannel {
        RealtimeChannel {
            inner: self.inner.clone(),
        }
    }
}
