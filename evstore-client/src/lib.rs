//! # evstore-client
//!
//! Client library for evstore.
//!
//! This crate provides:
//! - A connection actor that owns all connection state and serializes every
//!   event through one mailbox
//! - Correlated request/response operations with retries and timeouts
//! - Volatile, persistent and catch-up subscriptions
//! - Automatic reconnection, heartbeats and optional TLS
//!
//! ```no_run
//! use evstore_client::{Client, ClientConfig, EventData, ExpectedVersion};
//!
//! # async fn run() -> Result<(), evstore_client::ClientError> {
//! let client = Client::from_config(&ClientConfig::default())?;
//! client.connect().await?;
//! client
//!     .append_to_stream("orders-1", ExpectedVersion::Any, [EventData::new("Created", "{}")])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod catchup;
pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod operations;
pub mod operations_manager;
pub mod stream;
pub mod subscriptions;
pub mod subscriptions_manager;
pub mod task;
pub mod tls;
pub mod transport;
pub mod types;

pub use catchup::CatchUpSubscription;
pub use client::{Client, Transaction};
pub use config::{ClientConfig, ConfigError, ConnectionSettings, TlsSettings};
pub use connection::ClientEvent;
pub use discovery::{EndPointDiscoverer, NodeEndPoints, StaticEndPointDiscoverer};
pub use error::ClientError;
pub use evstore_protocol::UserCredentials;
pub use subscriptions::{DroppedSubscription, PersistentSubscription, VolatileSubscription};
pub use task::{CompletionSource, Task};
pub use types::{
    AllEventsSlice, CatchUpSubscriptionSettings, DeleteResult, EventData, EventReadResult,
    EventReadStatus, ExpectedVersion, NakAction, PersistentSubscriptionSettings, Position,
    ReadDirection, RecordedEvent, ResolvedEvent, SliceReadStatus, StreamEventsSlice,
    StreamPosition, SubscriptionConfirmation, SubscriptionDropReason, WriteResult,
};
