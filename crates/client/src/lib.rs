//! SiteSync realtime sync core
//!
//! Keeps a session's entity collections in step with the server over a
//! single duplex channel, reconnecting with backoff and falling back to HTTP
//! polling when the channel stays down.

pub mod auth;
pub mod collections;
pub mod config;
pub mod dispatcher;
pub mod logging;
pub mod paths;
pub mod polling;
pub mod reconcile;
pub mod scope;
pub mod session;
pub mod supervisor;
pub mod transition;

pub use auth::{FileToken, StaticToken, TokenSource};
pub use collections::{ChangeOrigin, CollectionChange, CollectionStore};
pub use config::{ConfigError, SyncConfig};
pub use dispatcher::{EventDispatcher, Notice, NotificationSink, PresenceSink, PresenceUpdate};
pub use reconcile::{apply_entity_event, Applied, EntityEvent};
pub use session::{SessionParts, SyncSession};
pub use supervisor::ConnectionSnapshot;
pub use transition::Phase;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
