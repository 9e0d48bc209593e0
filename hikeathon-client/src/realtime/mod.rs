use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    time::Duration,
};

use chrono::Utc;
use hikeathon_core::{
    ChannelName, SubscribeStatus, TeamId, now_unix_ms,
    presence::{PresenceRoster, TypingTracker},
    protocol::{
        BROADCAST_EVENT_COUNTDOWN, BROADCAST_EVENT_MESSAGE, BROADCAST_EVENT_TYPING, BroadcastKind,
        BroadcastMessage, ChangeKind, DataChange, InboundEvent, PresenceStatus, PresenceUser,
        TypingIndicator, join_payload,
    },
    reconnect::{LinkAction, LinkEvent, LinkState, ReconnectMachine, ReconnectPolicy},
    records::Countdown,
};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::RealtimeError;

mod socket;

pub use socket::PhoenixBackend;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const BROADCAST_FEED_CAP: usize = 50;

pub type HandleId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(SubscribeStatus),
    Inbound(InboundEvent),
}

/// Something that happened on the channel joined under `handle`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendEvent {
    pub handle: HandleId,
    pub event: ChannelEvent,
}

impl BackendEvent {
    pub fn status(handle: HandleId, status: SubscribeStatus) -> Self {
        Self {
            handle,
            event: ChannelEvent::Status(status),
        }
    }

    pub fn inbound(handle: HandleId, event: InboundEvent) -> Self {
        Self {
            handle,
            event: ChannelEvent::Inbound(event),
        }
    }
}

/// Transport under the channel manager. Implementations report subscribe
/// statuses and inbound events on the `BackendEvent` sender they were built
/// with, tagged with the handle passed to `join`.
pub trait RealtimeBackend: Send + 'static {
    fn join(
        &mut self,
        handle: HandleId,
        channel: ChannelName,
        payload: Value,
    ) -> impl Future<Output = Result<(), RealtimeError>> + Send;

    fn leave(&mut self, handle: HandleId) -> impl Future<Output = Result<(), RealtimeError>> + Send;

    fn send(
        &mut self,
        handle: HandleId,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<(), RealtimeError>> + Send;

    fn track(
        &mut self,
        handle: HandleId,
        payload: Value,
    ) -> impl Future<Output = Result<(), RealtimeError>> + Send;
}

/// The team the realtime link acts for. Without one only the public
/// channels are joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeIdentity {
    pub team_id: TeamId,
    pub team_name: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeSnapshot {
    pub link: LinkState,
    pub attempts: u32,
    pub channels: Vec<ChannelName>,
    /// Newest first.
    pub broadcasts: Vec<BroadcastMessage>,
    pub presence: PresenceRoster,
    pub typing: TypingTracker,
    pub countdown: Option<Countdown>,
    pub last_change: Option<DataChange>,
}

impl RealtimeSnapshot {
    fn new(own_team: Option<TeamId>) -> Self {
        Self {
            link: LinkState::Disconnected,
            attempts: 0,
            channels: Vec::new(),
            broadcasts: Vec::new(),
            presence: PresenceRoster::default(),
            typing: TypingTracker::new(own_team),
            countdown: None,
            last_change: None,
        }
    }
}

enum Command {
    Link(LinkEvent),
    Send {
        channel: ChannelName,
        event: &'static str,
        payload: Value,
        reply: Option<oneshot::Sender<Result<(), RealtimeError>>>,
    },
}

/// Handle to the realtime actor. Cheap to clone; the actor tears its
/// channels down once every handle is dropped.
#[derive(Clone)]
pub struct ChannelManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<RealtimeSnapshot>,
    identity: Option<RealtimeIdentity>,
}

impl ChannelManager {
    pub fn spawn<B: RealtimeBackend>(
        backend: B,
        events: mpsc::UnboundedReceiver<BackendEvent>,
        identity: Option<RealtimeIdentity>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let own_team = identity.as_ref().map(|id| id.team_id.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(RealtimeSnapshot::new(own_team));

        let actor = Actor {
            backend,
            commands: commands_rx,
            events,
            machine: ReconnectMachine::new(policy),
            registry: BTreeMap::new(),
            subscribed: BTreeSet::new(),
            next_handle: 1,
            identity: identity.clone(),
            reconnect_at: None,
            snapshot: snapshot_tx,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            identity,
        }
    }

    /// Manager over the Supabase realtime websocket at `url`.
    pub fn connect(url: Url, identity: Option<RealtimeIdentity>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backend = PhoenixBackend::new(url, events_tx);
        Self::spawn(backend, events_rx, identity, ReconnectPolicy::default())
    }

    pub fn identity(&self) -> Option<&RealtimeIdentity> {
        self.identity.as_ref()
    }

    pub fn start(&self) {
        self.link(LinkEvent::Start);
    }

    pub fn online(&self) {
        self.link(LinkEvent::Online);
    }

    pub fn offline(&self) {
        self.link(LinkEvent::Offline);
    }

    pub fn stop(&self) {
        self.link(LinkEvent::Stop);
    }

    fn link(&self, event: LinkEvent) {
        let _ = self.commands.send(Command::Link(event));
    }

    /// Sends a chat-wide broadcast from the current team.
    pub async fn send_broadcast(&self, message: &str, kind: BroadcastKind) -> Result<(), RealtimeError> {
        self.publish(BroadcastMessage {
            id: Uuid::new_v4().to_string(),
            message: message.to_owned(),
            kind,
            timestamp: Utc::now().to_rfc3339(),
            from: self.identity.as_ref().map(|id| id.team_name.clone()),
            title: None,
        })
        .await
    }

    pub async fn publish(&self, message: BroadcastMessage) -> Result<(), RealtimeError> {
        let payload =
            serde_json::to_value(&message).map_err(|err| RealtimeError::Backend(err.to_string()))?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                channel: ChannelName::Broadcasts,
                event: BROADCAST_EVENT_MESSAGE,
                payload,
                reply: Some(reply),
            })
            .map_err(|_| RealtimeError::Stopped)?;
        rx.await.unwrap_or(Err(RealtimeError::Stopped))
    }

    /// Fire and forget; does nothing without a team or a typing channel.
    pub fn send_typing(&self, is_typing: bool) {
        let Some(identity) = &self.identity else {
            return;
        };
        let indicator = TypingIndicator {
            team_id: identity.team_id.clone(),
            team_name: identity.team_name.clone(),
            is_typing,
        };
        let Ok(payload) = serde_json::to_value(&indicator) else {
            return;
        };
        let _ = self.commands.send(Command::Send {
            channel: ChannelName::Typing,
            event: BROADCAST_EVENT_TYPING,
            payload,
            reply: None,
        });
    }

    pub fn snapshot(&self) -> RealtimeSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RealtimeSnapshot> {
        self.snapshot.clone()
    }
}

struct Actor<B> {
    backend: B,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    machine: ReconnectMachine,
    registry: BTreeMap<ChannelName, HandleId>,
    /// Channels of the current registry that reported `SUBSCRIBED`.
    subscribed: BTreeSet<ChannelName>,
    next_handle: HandleId,
    identity: Option<RealtimeIdentity>,
    reconnect_at: Option<Instant>,
    snapshot: watch::Sender<RealtimeSnapshot>,
}

impl<B: RealtimeBackend> Actor<B> {
    async fn run(mut self) {
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let typing_deadline = self.typing_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("all manager handles dropped; shutting down realtime");
                        self.apply(LinkEvent::Stop).await;
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event).await,
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.apply(LinkEvent::BackoffElapsed).await;
                }
                _ = heartbeat.tick() => self.on_heartbeat().await,
                _ = wait_until(typing_deadline) => {
                    self.snapshot.send_modify(|s| s.typing.prune(now_unix_ms()));
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Link(event) => self.apply(event).await,
            Command::Send {
                channel,
                event,
                payload,
                reply,
            } => {
                let result = match self.registry.get(&channel) {
                    Some(&handle) => self.backend.send(handle, event, payload).await,
                    None => Err(RealtimeError::ChannelMissing(channel)),
                };
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            debug!(channel = %channel, event, "send skipped: {err}");
                        }
                    }
                }
            }
        }
    }

    async fn apply(&mut self, event: LinkEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            match self.machine.handle(event) {
                LinkAction::Subscribe => next = self.subscribe_all().await,
                LinkAction::ScheduleReconnect { attempt, delay } => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.machine.policy().max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "realtime link failed; reconnect scheduled"
                    );
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                LinkAction::Resubscribe => {
                    self.reconnect_at = None;
                    info!(attempt = self.machine.attempts(), "reconnecting realtime channels");
                    self.unsubscribe_all().await;
                    next = self.subscribe_all().await;
                }
                LinkAction::CancelReconnect => {
                    self.reconnect_at = None;
                    info!("offline; realtime paused");
                }
                LinkAction::Disable => {
                    self.reconnect_at = None;
                    error!(
                        max_attempts = self.machine.policy().max_attempts,
                        "max reconnect attempts reached; realtime disabled"
                    );
                    self.unsubscribe_all().await;
                }
                LinkAction::Teardown => {
                    self.reconnect_at = None;
                    self.unsubscribe_all().await;
                    self.snapshot.send_modify(|s| {
                        s.presence.clear();
                        s.typing.clear();
                    });
                }
                LinkAction::None => {}
            }
        }
        self.publish_link();
    }

    async fn subscribe_all(&mut self) -> Option<LinkEvent> {
        let authenticated = self.identity.is_some();
        let presence_key = self.identity.as_ref().map(|id| id.team_id.clone());
        let access_token = self
            .identity
            .as_ref()
            .and_then(|id| id.access_token.clone());

        for channel in ChannelName::subscription_order(authenticated) {
            let handle = self.next_handle;
            self.next_handle += 1;
            self.registry.insert(channel, handle);

            let payload = join_payload(channel, presence_key.as_deref(), access_token.as_deref());
            if let Err(err) = self.backend.join(handle, channel, payload).await {
                warn!(channel = %channel, "subscribe failed: {err}");
                return Some(LinkEvent::Status(SubscribeStatus::ChannelError));
            }
            debug!(channel = %channel, handle, "subscribing");
        }
        None
    }

    async fn unsubscribe_all(&mut self) {
        self.subscribed.clear();
        let registry = std::mem::take(&mut self.registry);
        for (channel, handle) in registry {
            if let Err(err) = self.backend.leave(handle).await {
                debug!(channel = %channel, "unsubscribe failed: {err}");
            }
        }
    }

    async fn on_event(&mut self, event: BackendEvent) {
        let Some(channel) = self.channel_for(event.handle) else {
            debug!(handle = event.handle, "dropping event from stale channel");
            return;
        };
        match event.event {
            ChannelEvent::Status(status) => {
                info!(channel = %channel, status = status.as_str(), "channel status");
                if status == SubscribeStatus::Subscribed {
                    self.subscribed.insert(channel);
                    if channel == ChannelName::Presence {
                        self.track_presence().await;
                    }
                }
                self.apply(LinkEvent::Status(status)).await;
                if status == SubscribeStatus::Subscribed && self.fully_subscribed() {
                    self.apply(LinkEvent::AllSubscribed).await;
                }
            }
            ChannelEvent::Inbound(inbound) => self.on_inbound(channel, inbound),
        }
    }

    fn on_inbound(&mut self, channel: ChannelName, event: InboundEvent) {
        match (channel, event) {
            (ChannelName::Broadcasts, InboundEvent::Broadcast { event, payload })
                if event == BROADCAST_EVENT_MESSAGE =>
            {
                let fallback_id = Uuid::new_v4().to_string();
                let now = Utc::now().to_rfc3339();
                match BroadcastMessage::from_payload(&payload, &fallback_id, &now) {
                    Some(message) => {
                        info!(id = %message.id, kind = message.kind.as_str(), "broadcast received");
                        self.snapshot.send_modify(|s| {
                            s.broadcasts.insert(0, message);
                            s.broadcasts.truncate(BROADCAST_FEED_CAP);
                        });
                    }
                    None => warn!("broadcast without a message body ignored"),
                }
            }
            (ChannelName::Typing, InboundEvent::Broadcast { event, payload })
                if event == BROADCAST_EVENT_TYPING =>
            {
                match serde_json::from_value::<TypingIndicator>(payload) {
                    Ok(indicator) => self
                        .snapshot
                        .send_modify(|s| s.typing.apply(indicator, now_unix_ms())),
                    Err(err) => debug!("invalid typing payload: {err}"),
                }
            }
            (ChannelName::Countdowns, InboundEvent::Broadcast { event, payload })
                if event == BROADCAST_EVENT_COUNTDOWN =>
            {
                match serde_json::from_value::<Countdown>(payload) {
                    Ok(countdown) => self.snapshot.send_modify(|s| s.countdown = Some(countdown)),
                    Err(err) => debug!("invalid countdown payload: {err}"),
                }
            }
            (ChannelName::Presence, InboundEvent::PresenceState(state)) => {
                self.snapshot.send_modify(|s| s.presence.sync(state));
            }
            (ChannelName::Presence, InboundEvent::PresenceDiff { joins, leaves }) => {
                self.snapshot
                    .send_modify(|s| s.presence.apply_diff(joins, &leaves));
            }
            (_, InboundEvent::DataChange(change)) => {
                debug!(table = %change.table, kind = ?change.kind, "data change");
                self.snapshot.send_modify(|s| {
                    if change.table == "countdowns" {
                        apply_countdown_change(&mut s.countdown, &change);
                    }
                    s.last_change = Some(change);
                });
            }
            (channel, event) => debug!(channel = %channel, ?event, "unhandled realtime event"),
        }
    }

    async fn on_heartbeat(&mut self) {
        if self.machine.state() == LinkState::Connected {
            self.track_presence().await;
        }
    }

    async fn track_presence(&mut self) {
        let Some(identity) = &self.identity else {
            return;
        };
        let Some(&handle) = self.registry.get(&ChannelName::Presence) else {
            return;
        };
        let user = PresenceUser {
            team_id: identity.team_id.clone(),
            team_name: identity.team_name.clone(),
            online_at: Utc::now().to_rfc3339(),
            status: Some(PresenceStatus::Active),
        };
        let payload = match serde_json::to_value(&user) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode presence: {err}");
                return;
            }
        };
        if let Err(err) = self.backend.track(handle, payload).await {
            warn!("presence track failed: {err}");
        }
    }

    fn fully_subscribed(&self) -> bool {
        !self.registry.is_empty()
            && self
                .registry
                .keys()
                .all(|channel| self.subscribed.contains(channel))
    }

    fn channel_for(&self, handle: HandleId) -> Option<ChannelName> {
        self.registry
            .iter()
            .find_map(|(channel, &id)| (id == handle).then_some(*channel))
    }

    fn typing_deadline(&self) -> Option<Instant> {
        let expiry = self.snapshot.borrow().typing.next_expiry()?;
        let wait = expiry.saturating_sub(now_unix_ms());
        Some(Instant::now() + Duration::from_millis(wait))
    }

    fn publish_link(&self) {
        let link = self.machine.state();
        let attempts = self.machine.attempts();
        let channels: Vec<ChannelName> = self.registry.keys().copied().collect();
        self.snapshot.send_if_modified(|s| {
            if s.link == link && s.attempts == attempts && s.channels == channels {
                return false;
            }
            s.link = link;
            s.attempts = attempts;
            s.channels = channels;
            true
        });
    }
}

fn apply_countdown_change(current: &mut Option<Countdown>, change: &DataChange) {
    let current_id = current.as_ref().map(|c| c.id.clone());
    let same_id = |value: &Value| {
        let id = value.get("id").and_then(Value::as_str);
        id.is_some() && current_id.as_deref() == id
    };
    match change.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(record) = &change.record else {
                return;
            };
            match serde_json::from_value::<Countdown>(record.clone()) {
                Ok(countdown) if countdown.active => *current = Some(countdown),
                Ok(_) if same_id(record) => *current = None,
                Ok(_) => {}
                Err(err) => debug!("invalid countdown record: {err}"),
            }
        }
        ChangeKind::Delete => {
            if change.old_record.as_ref().is_some_and(same_id) {
                *current = None;
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
