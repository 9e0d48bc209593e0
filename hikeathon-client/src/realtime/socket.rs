use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use hikeathon_core::{
    ChannelName, SubscribeStatus,
    protocol::{EVENT_CLOSE, EVENT_ERROR, EVENT_REPLY, InboundEvent, PHOENIX_TOPIC, PhoenixMessage},
};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::AbortHandle,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{BackendEvent, HandleId, RealtimeBackend};
use crate::error::RealtimeError;

pub const SOCKET_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
struct Joined {
    topic: String,
    join_ref: String,
}

#[derive(Debug, Default)]
struct Topics {
    joined: HashMap<HandleId, Joined>,
    /// Outstanding `phx_join` refs awaiting their reply.
    pending: HashMap<String, HandleId>,
}

impl Topics {
    /// Finds the channel instance a frame belongs to. Frames that carry a
    /// join ref must match it, so a late `phx_close` for a channel that was
    /// already left never lands on its replacement.
    fn handle_for(&self, topic: &str, instance_ref: Option<&str>) -> Option<HandleId> {
        self.joined.iter().find_map(|(handle, joined)| {
            (joined.topic == topic && instance_ref.is_none_or(|r| r == joined.join_ref))
                .then_some(*handle)
        })
    }

    fn handles(&self) -> Vec<HandleId> {
        self.joined.keys().copied().collect()
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<PhoenixMessage>,
    tasks: Vec<AbortHandle>,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// `RealtimeBackend` over the Supabase realtime websocket. The socket is
/// opened lazily on the first join and reopened by a later join after it
/// drops.
pub struct PhoenixBackend {
    url: Url,
    events: mpsc::UnboundedSender<BackendEvent>,
    topics: Arc<Mutex<Topics>>,
    next_ref: Arc<AtomicU64>,
    link: Option<Link>,
}

impl PhoenixBackend {
    pub fn new(url: Url, events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self {
            url,
            events,
            topics: Arc::new(Mutex::new(Topics::default())),
            next_ref: Arc::new(AtomicU64::new(1)),
            link: None,
        }
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        lock(&self.topics)
    }

    async fn ensure_connected(
        &mut self,
    ) -> Result<mpsc::UnboundedSender<PhoenixMessage>, RealtimeError> {
        if let Some(link) = &self.link
            && link.is_open()
        {
            return Ok(link.outbound.clone());
        }
        if let Some(stale) = self.link.take() {
            stale.shutdown();
        }

        info!(host = self.url.host_str().unwrap_or_default(), "opening realtime socket");
        let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(err)) => return Err(RealtimeError::Backend(format!("connect failed: {err}"))),
            Err(_) => {
                return Err(RealtimeError::Backend(format!(
                    "connect timed out after {CONNECT_TIMEOUT:?}"
                )));
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<PhoenixMessage>();
        let send_task = tokio::spawn(socket_send_task(
            ws_stream,
            outbound_rx,
            self.events.clone(),
            Arc::clone(&self.topics),
        ));
        let heartbeat_task = tokio::spawn(heartbeat_task(
            outbound.clone(),
            Arc::clone(&self.next_ref),
        ));

        self.link = Some(Link {
            outbound: outbound.clone(),
            tasks: vec![send_task.abort_handle(), heartbeat_task.abort_handle()],
        });
        Ok(outbound)
    }

    fn joined(&self, handle: HandleId) -> Result<Joined, RealtimeError> {
        self.topics()
            .joined
            .get(&handle)
            .cloned()
            .ok_or_else(|| RealtimeError::Backend(format!("channel {handle} not joined")))
    }

    fn push(&self, message: PhoenixMessage) -> Result<(), RealtimeError> {
        let link = self
            .link
            .as_ref()
            .filter(|link| link.is_open())
            .ok_or_else(|| RealtimeError::Backend("socket closed".to_owned()))?;
        link.outbound
            .send(message)
            .map_err(|_| RealtimeError::Backend("socket closed".to_owned()))
    }
}

impl Drop for PhoenixBackend {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
    }
}

impl RealtimeBackend for PhoenixBackend {
    async fn join(
        &mut self,
        handle: HandleId,
        channel: ChannelName,
        payload: Value,
    ) -> Result<(), RealtimeError> {
        let outbound = self.ensure_connected().await?;
        let topic = channel.topic();
        let join_ref = self.next_ref();
        {
            let mut topics = self.topics();
            topics.joined.insert(
                handle,
                Joined {
                    topic: topic.clone(),
                    join_ref: join_ref.clone(),
                },
            );
            topics.pending.insert(join_ref.clone(), handle);
        }

        outbound
            .send(PhoenixMessage::join(&topic, payload, &join_ref))
            .map_err(|_| RealtimeError::Backend("socket closed".to_owned()))?;

        let topics = Arc::clone(&self.topics);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(JOIN_TIMEOUT).await;
            let expired = lock(&topics).pending.remove(&join_ref);
            if let Some(handle) = expired {
                warn!(topic = %topic, "join timed out");
                let _ = events.send(BackendEvent::status(handle, SubscribeStatus::TimedOut));
            }
        });
        Ok(())
    }

    async fn leave(&mut self, handle: HandleId) -> Result<(), RealtimeError> {
        let removed = {
            let mut topics = self.topics();
            topics.pending.retain(|_, pending| *pending != handle);
            topics.joined.remove(&handle)
        };
        let Some(joined) = removed else {
            return Ok(());
        };
        if self.link.as_ref().is_none_or(|link| !link.is_open()) {
            return Ok(());
        }
        let reference = self.next_ref();
        self.push(PhoenixMessage::leave(
            &joined.topic,
            &reference,
            Some(&joined.join_ref),
        ))
    }

    async fn send(
        &mut self,
        handle: HandleId,
        event: &str,
        payload: Value,
    ) -> Result<(), RealtimeError> {
        let joined = self.joined(handle)?;
        let reference = self.next_ref();
        self.push(PhoenixMessage::broadcast(
            &joined.topic,
            event,
            payload,
            &reference,
            Some(&joined.join_ref),
        ))
    }

    async fn track(&mut self, handle: HandleId, payload: Value) -> Result<(), RealtimeError> {
        let joined = self.joined(handle)?;
        let reference = self.next_ref();
        self.push(PhoenixMessage::track(
            &joined.topic,
            payload,
            &reference,
            Some(&joined.join_ref),
        ))
    }
}

/// Owns the socket: writes queued frames and routes incoming ones. When the
/// socket ends every joined channel is reported `CLOSED`.
async fn socket_send_task(
    ws_stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<PhoenixMessage>,
    events: mpsc::UnboundedSender<BackendEvent>,
    topics: Arc<Mutex<Topics>>,
) {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else { break };
                match message.encode() {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("failed to encode outgoing frame: {err}"),
                }
            }
            incoming = ws_read.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!("realtime read failed: {err}");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => match PhoenixMessage::decode(text.as_str()) {
                        Ok(frame) => route(frame, &topics, &events),
                        Err(err) => warn!("decode frame failed: {err}"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    outbound_rx.close();
    let handles = {
        let mut topics = lock(&topics);
        topics.pending.clear();
        let handles = topics.handles();
        topics.joined.clear();
        handles
    };
    info!(channels = handles.len(), "realtime socket closed");
    for handle in handles {
        let _ = events.send(BackendEvent::status(handle, SubscribeStatus::Closed));
    }
}

async fn heartbeat_task(outbound: mpsc::UnboundedSender<PhoenixMessage>, next_ref: Arc<AtomicU64>) {
    let mut interval = tokio::time::interval(SOCKET_HEARTBEAT_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let reference = next_ref.fetch_add(1, Ordering::Relaxed).to_string();
        if outbound.send(PhoenixMessage::heartbeat(&reference)).is_err() {
            break;
        }
    }
}

fn route(
    frame: PhoenixMessage,
    topics: &Mutex<Topics>,
    events: &mpsc::UnboundedSender<BackendEvent>,
) {
    if frame.topic == PHOENIX_TOPIC {
        return;
    }

    let mut topics = lock(topics);
    if frame.event == EVENT_REPLY {
        let Some(handle) = frame
            .reference
            .as_deref()
            .and_then(|reference| topics.pending.remove(reference))
        else {
            return;
        };
        let ok = frame.payload.get("status").and_then(Value::as_str) == Some("ok");
        let status = if ok {
            SubscribeStatus::Subscribed
        } else {
            warn!(topic = %frame.topic, response = %frame.payload, "join rejected");
            SubscribeStatus::ChannelError
        };
        let _ = events.send(BackendEvent::status(handle, status));
        return;
    }

    let lifecycle = frame.event == EVENT_ERROR || frame.event == EVENT_CLOSE;
    let instance_ref = if lifecycle {
        frame.join_ref.as_deref().or(frame.reference.as_deref())
    } else {
        frame.join_ref.as_deref()
    };
    let Some(handle) = topics.handle_for(&frame.topic, instance_ref) else {
        debug!(topic = %frame.topic, event = %frame.event, "frame for unknown channel");
        return;
    };

    let event = match frame.event.as_str() {
        EVENT_ERROR => BackendEvent::status(handle, SubscribeStatus::ChannelError),
        EVENT_CLOSE => {
            topics.joined.remove(&handle);
            BackendEvent::status(handle, SubscribeStatus::Closed)
        }
        _ => match InboundEvent::parse(&frame) {
            Ok(inbound) => BackendEvent::inbound(handle, inbound),
            Err(err) => {
                warn!(topic = %frame.topic, "invalid realtime frame: {err}");
                return;
            }
        },
    };
    let _ = events.send(event);
}

fn lock(topics: &Mutex<Topics>) -> MutexGuard<'_, Topics> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}
