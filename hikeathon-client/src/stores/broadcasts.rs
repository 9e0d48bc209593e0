use chrono::{SecondsFormat, Utc};
use hikeathon_core::{
    protocol::BroadcastMessage,
    records::{
        BroadcastFilters, BroadcastFormData, BroadcastRecord, BroadcastStats, BroadcastUpdate,
        NewBroadcast, broadcast_stats,
    },
};
use tokio::sync::watch;
use tracing::info;

use super::Observable;
use crate::{backend::Backend, error::StoreError, realtime::ChannelManager};

pub const BROADCASTS_TABLE: &str = "broadcasts";
pub const FEED_CAP: usize = 100;
const ADMIN_SENDER: &str = "Admin";

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub message: BroadcastMessage,
    pub read: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedState {
    /// Newest first.
    pub entries: Vec<FeedEntry>,
}

impl FeedState {
    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.read).count()
    }

    pub fn latest(&self) -> Option<&BroadcastMessage> {
        self.entries.first().map(|entry| &entry.message)
    }
}

/// Broadcasts received by this client, with read tracking.
#[derive(Debug, Default)]
pub struct BroadcastFeed {
    state: Observable<FeedState>,
}

impl BroadcastFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FeedState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    /// Adds a message unless one with the same id is already in the feed.
    pub fn add(&self, message: BroadcastMessage) -> bool {
        let mut added = false;
        self.state.update(|s| {
            if s.entries.iter().any(|entry| entry.message.id == message.id) {
                return;
            }
            s.entries.insert(0, FeedEntry { message, read: false });
            s.entries.truncate(FEED_CAP);
            added = true;
        });
        added
    }

    pub fn mark_read(&self, id: &str) {
        self.state.update(|s| {
            if let Some(entry) = s.entries.iter_mut().find(|entry| entry.message.id == id) {
                entry.read = true;
            }
        });
    }

    pub fn mark_all_read(&self) {
        self.state.update(|s| s.entries.iter_mut().for_each(|entry| entry.read = true));
    }

    pub fn remove(&self, id: &str) {
        self.state.update(|s| s.entries.retain(|entry| entry.message.id != id));
    }

    pub fn clear(&self) {
        self.state.update(|s| s.entries.clear());
    }
}

/// Admin CRUD over the `broadcasts` table plus publishing to the realtime
/// feed.
#[derive(Clone)]
pub struct BroadcastService {
    backend: Backend,
}

impl BroadcastService {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub async fn create(&self, form: BroadcastFormData) -> Result<BroadcastRecord, StoreError> {
        let row = NewBroadcast::from(form);
        let record: BroadcastRecord = self.backend.from(BROADCASTS_TABLE).insert(&row).await?;
        info!(id = %record.id, priority = record.priority.as_str(), "broadcast created");
        Ok(record)
    }

    pub async fn update(
        &self,
        id: &str,
        changes: &BroadcastUpdate,
    ) -> Result<BroadcastRecord, StoreError> {
        let rows: Vec<BroadcastRecord> = self
            .backend
            .from(BROADCASTS_TABLE)
            .eq("id", id)
            .update(changes)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("broadcast {id}")))
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.backend.from(BROADCASTS_TABLE).eq("id", id).delete().await?;
        info!(id, "broadcast deleted");
        Ok(())
    }

    /// Newest first. The `expired` filter is applied client-side.
    pub async fn list(&self, filters: &BroadcastFilters) -> Result<Vec<BroadcastRecord>, StoreError> {
        let mut query = self
            .backend
            .from(BROADCASTS_TABLE)
            .order("created_at", false);
        if let Some(priority) = filters.priority {
            query = query.eq("priority", priority.as_str());
        }
        if let Some(active) = filters.active {
            query = query.eq("active", active);
        }
        if let Some(from) = filters.from {
            query = query.gte("created_at", iso(from));
        }
        if let Some(to) = filters.to {
            query = query.lte("created_at", iso(to));
        }
        let mut records: Vec<BroadcastRecord> = query.fetch().await?;
        filters.retain_expired(&mut records, Utc::now());
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<Option<BroadcastRecord>, StoreError> {
        Ok(self
            .backend
            .from(BROADCASTS_TABLE)
            .eq("id", id)
            .single()
            .await?)
    }

    pub async fn toggle_active(&self, id: &str) -> Result<BroadcastRecord, StoreError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("broadcast {id}")))?;
        let changes = BroadcastUpdate {
            active: Some(!current.active),
            ..BroadcastUpdate::default()
        };
        self.update(id, &changes).await
    }

    /// Active and not yet expired, most urgent first.
    pub async fn active(&self) -> Result<Vec<BroadcastRecord>, StoreError> {
        let now = iso(Utc::now());
        Ok(self
            .backend
            .from(BROADCASTS_TABLE)
            .eq("active", true)
            .or(&format!("expires_at.is.null,expires_at.gt.{now}"))
            .order("priority", false)
            .order("created_at", false)
            .fetch()
            .await?)
    }

    pub async fn stats(&self) -> Result<BroadcastStats, StoreError> {
        let records: Vec<BroadcastRecord> = self.backend.from(BROADCASTS_TABLE).fetch().await?;
        Ok(broadcast_stats(&records, Utc::now()))
    }

    /// Deactivates active broadcasts past their expiry and returns how many
    /// were switched off.
    pub async fn expire_overdue(&self) -> Result<usize, StoreError> {
        let expired: Vec<BroadcastRecord> = self
            .backend
            .from(BROADCASTS_TABLE)
            .lt("expires_at", iso(Utc::now()))
            .eq("active", true)
            .update(&BroadcastUpdate {
                active: Some(false),
                ..BroadcastUpdate::default()
            })
            .await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired broadcasts deactivated");
        }
        Ok(expired.len())
    }

    /// Pushes a stored broadcast to every connected client.
    pub async fn publish(
        &self,
        realtime: &ChannelManager,
        record: &BroadcastRecord,
    ) -> Result<(), StoreError> {
        realtime.publish(announcement(record)).await?;
        info!(id = %record.id, "broadcast published");
        Ok(())
    }
}

/// The realtime message announcing a stored broadcast.
pub fn announcement(record: &BroadcastRecord) -> BroadcastMessage {
    BroadcastMessage {
        id: record.id.clone(),
        message: record.message.clone(),
        kind: record.priority.kind(),
        timestamp: iso(Utc::now()),
        from: Some(ADMIN_SENDER.to_owned()),
        title: Some(record.title.clone()),
    }
}

fn iso(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
