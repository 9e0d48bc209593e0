use tokio::sync::watch;

pub mod admin;
pub mod auth;
pub mod broadcasts;
pub mod chat;
pub mod chat_history;
pub mod countdown;
pub mod images;
pub mod settings;
pub mod todos;
pub mod web_tools;

pub use admin::AdminStore;
pub use auth::{AuthState, AuthStore, Team};
pub use broadcasts::{BroadcastFeed, BroadcastService};
pub use chat::ChatStore;
pub use chat_history::{ChatHistoryStore, ChatSession};
pub use countdown::CountdownStore;
pub use images::ImageStore;
pub use settings::SettingsStore;
pub use todos::TodoService;
pub use web_tools::WebTools;

/// State cell that front ends can watch. Writers go through `update`/`set`;
/// readers clone a snapshot or subscribe for changes.
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Reads without cloning. Do not touch the same observable from `f`.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_updates() {
        let cell = Observable::new(0_u32);
        let mut rx = cell.subscribe();
        cell.update(|value| *value += 2);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(cell.read(|value| *value * 10), 20);
    }
}
