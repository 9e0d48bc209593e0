use chrono::Utc;
use hikeathon_core::records::{Countdown, TimeRemaining};
use tokio::sync::watch;
use tracing::warn;

use super::Observable;
use crate::{backend::Backend, error::StoreError};

pub const COUNTDOWNS_TABLE: &str = "countdowns";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountdownState {
    pub current: Option<Countdown>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl CountdownState {
    pub fn is_visible(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|countdown| countdown.is_visible_at(Utc::now()))
    }

    /// Zeroes when no countdown is set.
    pub fn time_remaining(&self) -> TimeRemaining {
        self.current
            .as_ref()
            .map(|countdown| countdown.time_remaining_at(Utc::now()))
            .unwrap_or_default()
    }
}

pub struct CountdownStore {
    backend: Backend,
    state: Observable<CountdownState>,
}

impl CountdownStore {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: Observable::default(),
        }
    }

    pub fn state(&self) -> CountdownState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<CountdownState> {
        self.state.subscribe()
    }

    /// Loads the newest active countdown, or clears it when there is none.
    pub async fn fetch_active(&self) -> Result<Option<Countdown>, StoreError> {
        self.state.update(|s| {
            s.is_loading = true;
            s.error = None;
        });
        let result = self
            .backend
            .from(COUNTDOWNS_TABLE)
            .eq("active", true)
            .order("created_at", false)
            .limit(1)
            .single::<Countdown>()
            .await;
        match result {
            Ok(countdown) => {
                self.state.update(|s| {
                    s.is_loading = false;
                    s.current = countdown.clone();
                });
                Ok(countdown)
            }
            Err(err) => {
                warn!("failed to fetch countdown: {err}");
                self.state.update(|s| {
                    s.is_loading = false;
                    s.error = Some(err.to_string());
                });
                Err(err.into())
            }
        }
    }

    /// Applies a countdown pushed over realtime. `None` clears it.
    pub fn set_countdown(&self, countdown: Option<Countdown>) {
        self.state.update(|s| s.current = countdown);
    }

    pub fn clear(&self) {
        self.set_countdown(None);
    }

    pub fn is_visible(&self) -> bool {
        self.state.read(CountdownState::is_visible)
    }

    pub fn time_remaining(&self) -> TimeRemaining {
        self.state.read(CountdownState::time_remaining)
    }
}
