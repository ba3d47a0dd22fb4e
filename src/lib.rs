pub mod config;
pub mod connection;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod realtime;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod slot_key;
pub mod store;

pub use config::EngineConfig;
pub use connection::{ConnectionPhase, ConnectionResetController};
pub use engine::{Engine, EngineError};
pub use realtime::{FeedState, RealtimeSubscriptionManager, SubscriptionEvent};
pub use registry::{ListenerHandle, ListenerRegistry, ScopeKey};
pub use slot_key::{generate_slot_key, normalize_date, DateInput};
pub use store::{DocumentStore, StoreError};
