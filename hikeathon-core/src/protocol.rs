use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{CoreError, TeamId};

pub const TOPIC_PREFIX: &str = "realtime:";
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_BROADCAST: &str = "broadcast";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

pub const BROADCAST_EVENT_MESSAGE: &str = "message";
pub const BROADCAST_EVENT_TYPING: &str = "typing";
pub const BROADCAST_EVENT_COUNTDOWN: &str = "countdown";

/// One Phoenix channel frame in the JSON (`vsn=1.0.0`) serializer format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn decode(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|err| CoreError::InvalidFrame(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    pub fn join(topic: &str, payload: Value, reference: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            event: EVENT_JOIN.to_owned(),
            payload,
            reference: Some(reference.to_owned()),
            join_ref: Some(reference.to_owned()),
        }
    }

    pub fn leave(topic: &str, reference: &str, join_ref: Option<&str>) -> Self {
        Self {
            topic: topic.to_owned(),
            event: EVENT_LEAVE.to_owned(),
            payload: json!({}),
            reference: Some(reference.to_owned()),
            join_ref: join_ref.map(str::to_owned),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_owned(),
            event: EVENT_HEARTBEAT.to_owned(),
            payload: json!({}),
            reference: Some(reference.to_owned()),
            join_ref: None,
        }
    }

    pub fn broadcast(
        topic: &str,
        event: &str,
        payload: Value,
        reference: &str,
        join_ref: Option<&str>,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            event: EVENT_BROADCAST.to_owned(),
            payload: json!({
                "type": "broadcast",
                "event": event,
                "payload": payload,
            }),
            reference: Some(reference.to_owned()),
            join_ref: join_ref.map(str::to_owned),
        }
    }

    pub fn track(topic: &str, payload: Value, reference: &str, join_ref: Option<&str>) -> Self {
        Self {
            topic: topic.to_owned(),
            event: EVENT_PRESENCE.to_owned(),
            payload: json!({
                "type": "presence",
                "event": "track",
                "payload": payload,
            }),
            reference: Some(reference.to_owned()),
            join_ref: join_ref.map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelName {
    Broadcasts,
    Countdowns,
    Presence,
    Typing,
    Todos,
}

impl ChannelName {
    pub const PUBLIC: [ChannelName; 2] = [ChannelName::Broadcasts, ChannelName::Countdowns];
    pub const AUTHENTICATED: [ChannelName; 3] =
        [ChannelName::Presence, ChannelName::Typing, ChannelName::Todos];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelName::Broadcasts => "broadcasts",
            ChannelName::Countdowns => "countdowns",
            ChannelName::Presence => "presence",
            ChannelName::Typing => "typing",
            ChannelName::Todos => "todos",
        }
    }

    pub fn topic(self) -> String {
        format!("{TOPIC_PREFIX}{}", self.as_str())
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        let name = topic.strip_prefix(TOPIC_PREFIX)?;
        [Self::PUBLIC.as_slice(), Self::AUTHENTICATED.as_slice()]
            .concat()
            .into_iter()
            .find(|channel| channel.as_str() == name)
    }

    /// Subscription order: public channels first, then the team-only ones.
    pub fn subscription_order(authenticated: bool) -> Vec<ChannelName> {
        let mut channels = Self::PUBLIC.to_vec();
        if authenticated {
            channels.extend(Self::AUTHENTICATED);
        }
        channels
    }

    fn watched_tables(self) -> &'static [&'static str] {
        match self {
            ChannelName::Todos => &["todos", "team_todos"],
            ChannelName::Countdowns => &["countdowns"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn join_payload(
    channel: ChannelName,
    presence_key: Option<&str>,
    access_token: Option<&str>,
) -> Value {
    let postgres_changes: Vec<Value> = channel
        .watched_tables()
        .iter()
        .map(|table| json!({ "event": "*", "schema": "public", "table": table }))
        .collect();

    let mut payload = json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": presence_key.unwrap_or_default() },
            "postgres_changes": postgres_changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_owned());
    }
    payload
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl SubscribeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscribeStatus::Subscribed => "SUBSCRIBED",
            SubscribeStatus::ChannelError => "CHANNEL_ERROR",
            SubscribeStatus::TimedOut => "TIMED_OUT",
            SubscribeStatus::Closed => "CLOSED",
        }
    }

    pub fn is_failure(self) -> bool {
        self != SubscribeStatus::Subscribed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    #[default]
    Info,
    Warning,
    Success,
    Error,
}

impl BroadcastKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastKind::Info => "info",
            BroadcastKind::Warning => "warning",
            BroadcastKind::Success => "success",
            BroadcastKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastMessage {
    pub id: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: BroadcastKind,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BroadcastWire {
    id: Option<String>,
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<BroadcastKind>,
    timestamp: Option<String>,
    from: Option<String>,
    title: Option<String>,
}

impl BroadcastMessage {
    /// Accepts a loosely filled payload, substituting the given id and
    /// timestamp where the sender omitted them. A payload without a
    /// message body is rejected.
    pub fn from_payload(payload: &Value, fallback_id: &str, now_iso: &str) -> Option<Self> {
        let wire = BroadcastWire::deserialize(payload).ok()?;
        Some(Self {
            id: wire.id.unwrap_or_else(|| fallback_id.to_owned()),
            message: wire.message?,
            kind: wire.kind.unwrap_or_default(),
            timestamp: wire.timestamp.unwrap_or_else(|| now_iso.to_owned()),
            from: wire.from,
            title: wire.title,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub team_id: TeamId,
    pub team_name: String,
    pub online_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub team_id: TeamId,
    pub team_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub kind: ChangeKind,
    pub table: String,
    pub record: Option<Value>,
    pub old_record: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DataChangeWire {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    ChannelError,
    Closed,
    Broadcast {
        event: String,
        payload: Value,
    },
    PresenceState(HashMap<String, PresenceUser>),
    PresenceDiff {
        joins: HashMap<String, PresenceUser>,
        leaves: Vec<String>,
    },
    DataChange(DataChange),
    Other(String),
}

impl InboundEvent {
    pub fn parse(message: &PhoenixMessage) -> Result<Self, CoreError> {
        let payload = &message.payload;
        let event = match message.event.as_str() {
            EVENT_REPLY => InboundEvent::Reply {
                reference: message.reference.clone(),
                ok: payload.get("status").and_then(Value::as_str) == Some("ok"),
                response: payload.get("response").cloned().unwrap_or(Value::Null),
            },
            EVENT_ERROR => InboundEvent::ChannelError,
            EVENT_CLOSE => InboundEvent::Closed,
            EVENT_BROADCAST => InboundEvent::Broadcast {
                event: payload
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                payload: payload.get("payload").cloned().unwrap_or(Value::Null),
            },
            EVENT_PRESENCE_STATE => InboundEvent::PresenceState(first_metas(payload)),
            EVENT_PRESENCE_DIFF => InboundEvent::PresenceDiff {
                joins: payload.get("joins").map(first_metas).unwrap_or_default(),
                leaves: payload
                    .get("leaves")
                    .and_then(Value::as_object)
                    .map(|leaves| leaves.keys().cloned().collect())
                    .unwrap_or_default(),
            },
            EVENT_POSTGRES_CHANGES => {
                let data = payload
                    .get("data")
                    .ok_or_else(|| CoreError::InvalidFrame("postgres_changes without data".into()))?;
                let wire = DataChangeWire::deserialize(data)
                    .map_err(|err| CoreError::InvalidFrame(err.to_string()))?;
                InboundEvent::DataChange(DataChange {
                    kind: wire.kind,
                    table: wire.table,
                    record: wire.record.filter(|value| !is_empty_object(value)),
                    old_record: wire.old_record.filter(|value| !is_empty_object(value)),
                })
            }
            other => InboundEvent::Other(other.to_owned()),
        };
        Ok(event)
    }
}

/// Presence maps look like `{ key: { "metas": [ {...}, ... ] } }`; the first
/// meta per key is the one that counts.
fn first_metas(value: &Value) -> HashMap<String, PresenceUser> {
    let Some(entries) = value.as_object() else {
        return HashMap::new();
    };
    entries
        .iter()
        .filter_map(|(key, entry)| {
            let meta = entry.get("metas")?.as_array()?.first()?;
            let user = PresenceUser::deserialize(meta).ok()?;
            Some((key.clone(), user))
        })
        .collect()
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|map| map.is_empty())
}
