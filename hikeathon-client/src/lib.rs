//! Async side of the HIKEathon client: authenticated HTTP, PostgREST tables,
//! realtime channels and the domain stores built on them.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod realtime;
pub mod storage;
pub mod stores;

pub use api::{ApiClient, ApiRequest, ApiResponse, AuthProvider, StreamHandle};
pub use backend::Backend;
pub use config::{ClientConfig, ConfigArgs, resolve_config};
pub use error::{ApiError, RealtimeError, StoreError, WebToolError};
pub use realtime::{ChannelManager, RealtimeBackend, RealtimeIdentity, RealtimeSnapshot};
pub use storage::FileStore;
