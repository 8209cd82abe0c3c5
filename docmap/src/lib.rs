pub mod actions;
pub mod backend;
pub mod build;
pub mod config;
pub mod document;
pub mod error;
pub mod feed;
pub mod manage;
pub mod record;
pub mod schema;
pub mod session;
pub mod transform;
pub mod validation;

pub use actions::{LifecycleEvent, LifecycleHook};
pub use backend::{Backend, Connection, MemoryBackend, OrderBy, Predicate, QueryOptions, SqliteBackend};
pub use config::Config;
pub use document::Document;
pub use error::{DocMapError, Result};
pub use feed::{Change, FeedCloser, Subscription};
pub use record::{Record, RecordBuilder, Value};
pub use schema::{Modifier, Schema};
pub use session::Session;
