//! Public value types exchanged with the server.

use crate::error::ClientError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use evstore_protocol::messages;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Maximum number of event ids in one persistent subscription ack or nak.
pub const MAX_ACK_BATCH: usize = 2000;

/// Content type flag for JSON event data.
const CONTENT_TYPE_JSON: i32 = 1;
const CONTENT_TYPE_BINARY: i32 = 0;

// ============================================================================
// Positions and versions
// ============================================================================

/// A position in the global transaction log.
///
/// Ordered by commit position, then prepare position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub commit_position: i64,
    pub prepare_position: i64,
}

impl Position {
    /// Start of the log.
    pub const START: Position = Position {
        commit_position: 0,
        prepare_position: 0,
    };

    /// End of the log.
    pub const END: Position = Position {
        commit_position: -1,
        prepare_position: -1,
    };

    /// Creates a position; the commit position must not precede the prepare position.
    pub fn new(commit_position: i64, prepare_position: i64) -> Result<Self, ClientError> {
        if commit_position < prepare_position {
            return Err(ClientError::InvalidArgument(format!(
                "commit position {} is less than prepare position {}",
                commit_position, prepare_position
            )));
        }
        Ok(Self {
            commit_position,
            prepare_position,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit_position, self.prepare_position)
    }
}

/// Stream revision constraint checked by the server on writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No concurrency check.
    Any,
    /// The stream must not exist.
    NoStream,
    /// The stream must exist.
    StreamExists,
    /// The stream's last event number must equal this value.
    Exact(i64),
}

impl ExpectedVersion {
    pub fn to_i64(self) -> i64 {
        match self {
            ExpectedVersion::Any => -2,
            ExpectedVersion::NoStream => -1,
            ExpectedVersion::StreamExists => -4,
            ExpectedVersion::Exact(n) => n,
        }
    }
}

/// Well-known event numbers for stream reads.
pub struct StreamPosition;

impl StreamPosition {
    pub const START: i64 = 0;
    pub const END: i64 = -1;
}

// ============================================================================
// Events
// ============================================================================

/// An event to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl EventData {
    /// Creates a binary event with a fresh id.
    pub fn new(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: false,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    /// Creates a JSON event by serializing `value`.
    pub fn json<T: Serialize>(
        event_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, ClientError> {
        let data = serde_json::to_vec(value)
            .map_err(|e| ClientError::InvalidArgument(format!("event data: {}", e)))?;
        Ok(Self {
            is_json: true,
            ..Self::new(event_type, data)
        })
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub(crate) fn to_message(&self) -> messages::NewEvent {
        let content_type = if self.is_json {
            CONTENT_TYPE_JSON
        } else {
            CONTENT_TYPE_BINARY
        };
        messages::NewEvent {
            event_id: self.event_id.to_bytes_le().to_vec(),
            event_type: self.event_type.clone(),
            data_content_type: content_type,
            metadata_content_type: content_type,
            data: self.data.clone(),
            metadata: Some(self.metadata.clone()),
        }
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event_stream_id: String,
    pub event_id: Uuid,
    pub event_number: i64,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
    pub created: Option<DateTime<Utc>>,
}

impl RecordedEvent {
    pub(crate) fn from_message(record: messages::EventRecord) -> Result<Self, ClientError> {
        let event_id = uuid_from_le_slice(&record.event_id)?;
        Ok(Self {
            event_stream_id: record.event_stream_id,
            event_id,
            event_number: record.event_number,
            event_type: record.event_type,
            is_json: record.data_content_type == CONTENT_TYPE_JSON,
            data: record.data,
            metadata: record.metadata.unwrap_or_default(),
            created: record
                .created_epoch
                .and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }

    /// Deserializes JSON event data.
    pub fn json_data<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.data)
            .map_err(|e| ClientError::InvalidArgument(format!("event data: {}", e)))
    }
}

/// An event together with the link event that pointed at it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub event: Option<RecordedEvent>,
    pub link: Option<RecordedEvent>,
    /// Log position; only present for events read from or pushed by `$all`.
    pub original_position: Option<Position>,
}

impl ResolvedEvent {
    pub(crate) fn from_indexed(
        message: messages::ResolvedIndexedEvent,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            event: message.event.map(RecordedEvent::from_message).transpose()?,
            link: message.link.map(RecordedEvent::from_message).transpose()?,
            original_position: None,
        })
    }

    pub(crate) fn from_all(message: messages::ResolvedEvent) -> Result<Self, ClientError> {
        Ok(Self {
            event: message.event.map(RecordedEvent::from_message).transpose()?,
            link: message.link.map(RecordedEvent::from_message).transpose()?,
            original_position: Some(Position::new(
                message.commit_position,
                message.prepare_position,
            )?),
        })
    }

    /// The event that was read: the link if present, otherwise the event.
    pub fn original_event(&self) -> Option<&RecordedEvent> {
        self.link.as_ref().or(self.event.as_ref())
    }

    pub fn is_resolved(&self) -> bool {
        self.link.is_some() && self.event.is_some()
    }

    pub fn original_stream_id(&self) -> Option<&str> {
        self.original_event().map(|e| e.event_stream_id.as_str())
    }

    pub fn original_event_number(&self) -> Option<i64> {
        self.original_event().map(|e| e.event_number)
    }

    pub fn original_event_id(&self) -> Option<Uuid> {
        self.original_event().map(|e| e.event_id)
    }
}

fn uuid_from_le_slice(bytes: &[u8]) -> Result<Uuid, ClientError> {
    let raw: [u8; 16] = bytes.try_into().map_err(|_| {
        ClientError::InvalidArgument(format!("event id must be 16 bytes, got {}", bytes.len()))
    })?;
    Ok(Uuid::from_bytes_le(raw))
}

// ============================================================================
// Results
// ============================================================================

/// Result of a successful append or transaction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub next_expected_version: i64,
    pub log_position: Position,
}

/// Result of a successful stream deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub log_position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventReadResult {
    pub status: EventReadStatus,
    pub stream: String,
    pub event_number: i64,
    pub event: Option<ResolvedEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// A page of events read from one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventsSlice {
    pub status: SliceReadStatus,
    pub stream: String,
    pub from_event_number: i64,
    pub read_direction: ReadDirection,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

/// A page of events read from `$all`.
#[derive(Debug, Clone, PartialEq)]
pub struct AllEventsSlice {
    pub read_direction: ReadDirection,
    pub from_position: Position,
    pub next_position: Position,
    pub events: Vec<ResolvedEvent>,
}

impl AllEventsSlice {
    pub fn is_end_of_stream(&self) -> bool {
        self.events.is_empty()
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionDropReason {
    UserInitiated,
    NotAuthenticated,
    AccessDenied,
    SubscribingError,
    ServerError,
    ConnectionClosed,
    CatchUpError,
    ProcessingQueueOverflow,
    EventHandlerException,
    MaxSubscribersReached,
    PersistentSubscriptionDeleted,
    NotFound,
    Unknown,
}

impl fmt::Display for SubscriptionDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the server should do with negatively acknowledged events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAction {
    Unknown,
    Park,
    Retry,
    Skip,
    Stop,
}

impl From<NakAction> for messages::NakAction {
    fn from(action: NakAction) -> Self {
        match action {
            NakAction::Unknown => messages::NakAction::Unknown,
            NakAction::Park => messages::NakAction::Park,
            NakAction::Retry => messages::NakAction::Retry,
            NakAction::Skip => messages::NakAction::Skip,
            NakAction::Stop => messages::NakAction::Stop,
        }
    }
}

/// Commit position and event number the server reported when confirming a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfirmation {
    pub last_commit_position: i64,
    pub last_event_number: Option<i64>,
}

/// Server-side settings of a persistent subscription group.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    /// Event number to start from; `-1` starts at the current end.
    pub start_from: i64,
    pub extra_statistics: bool,
    pub message_timeout: Duration,
    pub max_retry_count: i32,
    pub live_buffer_size: i32,
    pub read_batch_size: i32,
    pub history_buffer_size: i32,
    pub check_point_after: Duration,
    pub min_check_point_count: i32,
    pub max_check_point_count: i32,
    /// `0` means unbounded.
    pub max_subscriber_count: i32,
    pub named_consumer_strategy: String,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            extra_statistics: false,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            check_point_after: Duration::from_secs(2),
            min_check_point_count: 10,
            max_check_point_count: 1000,
            max_subscriber_count: 0,
            named_consumer_strategy: "RoundRobin".to_string(),
        }
    }
}

impl PersistentSubscriptionSettings {
    pub fn with_start_from(mut self, event_number: i64) -> Self {
        self.start_from = event_number;
        self
    }

    pub fn with_resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    pub fn with_named_consumer_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.named_consumer_strategy = strategy.into();
        self
    }

    pub(crate) fn to_create_message(
        &self,
        stream: &str,
        group: &str,
    ) -> messages::CreatePersistentSubscription {
        messages::CreatePersistentSubscription {
            subscription_group_name: group.to_string(),
            event_stream_id: stream.to_string(),
            resolve_link_tos: self.resolve_link_tos,
            start_from: self.start_from,
            message_timeout_milliseconds: self.message_timeout.as_millis() as i32,
            record_statistics: self.extra_statistics,
            live_buffer_size: self.live_buffer_size,
            read_batch_size: self.read_batch_size,
            buffer_size: self.history_buffer_size,
            max_retry_count: self.max_retry_count,
            prefer_round_robin: self.named_consumer_strategy == "RoundRobin",
            checkpoint_after_time: self.check_point_after.as_millis() as i32,
            checkpoint_max_count: self.max_check_point_count,
            checkpoint_min_count: self.min_check_point_count,
            subscriber_max_count: self.max_subscriber_count,
            named_consumer_strategy: Some(self.named_consumer_strategy.clone()),
        }
    }

    pub(crate) fn to_update_message(
        &self,
        stream: &str,
        group: &str,
    ) -> messages::UpdatePersistentSubscription {
        let create = self.to_create_message(stream, group);
        messages::UpdatePersistentSubscription {
            subscription_group_name: create.subscription_group_name,
            event_stream_id: create.event_stream_id,
            resolve_link_tos: create.resolve_link_tos,
            start_from: create.start_from,
            message_timeout_milliseconds: create.message_timeout_milliseconds,
            record_statistics: create.record_statistics,
            live_buffer_size: create.live_buffer_size,
            read_batch_size: create.read_batch_size,
            buffer_size: create.buffer_size,
            max_retry_count: create.max_retry_count,
            prefer_round_robin: create.prefer_round_robin,
            checkpoint_after_time: create.checkpoint_after_time,
            checkpoint_max_count: create.checkpoint_max_count,
            checkpoint_min_count: create.checkpoint_min_count,
            subscriber_max_count: create.subscriber_max_count,
            named_consumer_strategy: create.named_consumer_strategy,
        }
    }
}

/// Client-side knobs of a catch-up subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchUpSubscriptionSettings {
    /// Live events buffered while historical reads are in progress.
    pub max_live_queue_size: usize,
    /// Events requested per historical read.
    pub read_batch_size: i32,
    pub resolve_link_tos: bool,
    pub verbose_logging: bool,
}

impl Default for CatchUpSubscriptionSettings {
    fn default() -> Self {
        Self {
            max_live_queue_size: 10_000,
            read_batch_size: 500,
            resolve_link_tos: false,
            verbose_logging: false,
        }
    }
}

impl CatchUpSubscriptionSettings {
    pub fn with_max_live_queue_size(mut self, size: usize) -> Self {
        self.max_live_queue_size = size.max(1);
        self
    }

    pub fn with_read_batch_size(mut self, size: i32) -> Self {
        self.read_batch_size = size.max(1);
        self
    }

    pub fn with_resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_rejects_commit_before_prepare() {
        let result = Position::new(5, 10);
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));

        let position = Position::new(10, 5).unwrap();
        assert_eq!(position.commit_position, 10);
        assert_eq!(position.prepare_position, 5);
    }

    #[test]
    fn test_position_ordering() {
        let a = Position::new(10, 5).unwrap();
        let b = Position::new(10, 7).unwrap();
        let c = Position::new(11, 0).unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(Position::END < Position::START);
        assert_eq!(a.to_string(), "10/5");
    }

    #[test]
    fn test_expected_version_values() {
        assert_eq!(ExpectedVersion::Any.to_i64(), -2);
        assert_eq!(ExpectedVersion::NoStream.to_i64(), -1);
        assert_eq!(ExpectedVersion::StreamExists.to_i64(), -4);
        assert_eq!(ExpectedVersion::Exact(7).to_i64(), 7);
    }

    #[test]
    fn test_event_data_json() {
        #[derive(Serialize)]
        struct Placed {
            total: u32,
        }
        let event = EventData::json("OrderPlaced", &Placed { total: 42 }).unwrap();
        assert!(event.is_json);
        let message = event.to_message();
        assert_eq!(message.data_content_type, 1);
        assert_eq!(message.event_id, event.event_id.to_bytes_le().to_vec());
        assert!(std::str::from_utf8(&message.data).unwrap().contains("42"));
    }

    #[test]
    fn test_recorded_event_from_message() {
        let id = Uuid::new_v4();
        let record = messages::EventRecord {
            event_stream_id: "orders".into(),
            event_number: 3,
            event_id: id.to_bytes_le().to_vec(),
            event_type: "OrderPlaced".into(),
            data_content_type: 1,
            metadata_content_type: 0,
            data: Bytes::from_static(br#"{"total":1}"#),
            metadata: None,
            created: None,
            created_epoch: Some(1_700_000_000_000),
        };

        let event = RecordedEvent::from_message(record).unwrap();
        assert_eq!(event.event_id, id);
        assert!(event.is_json);
        assert!(event.metadata.is_empty());
        assert_eq!(event.created.unwrap().timestamp_millis(), 1_700_000_000_000);

        let value: serde_json::Value = event.json_data().unwrap();
        assert_eq!(value["total"], 1);
    }

    #[test]
    fn test_recorded_event_rejects_bad_id() {
        let record = messages::EventRecord {
            event_id: vec![1, 2, 3],
            ..Default::default()
        };
        assert!(RecordedEvent::from_message(record).is_err());
    }

    #[test]
    fn test_resolved_event_prefers_link() {
        let make = |stream: &str, number: i64| RecordedEvent {
            event_stream_id: stream.into(),
            event_id: Uuid::new_v4(),
            event_number: number,
            event_type: "t".into(),
            is_json: false,
            data: Bytes::new(),
            metadata: Bytes::new(),
            created: None,
        };
        let resolved = ResolvedEvent {
            event: Some(make("orders", 3)),
            link: Some(make("$ce-orders", 9)),
            original_position: None,
        };
        assert!(resolved.is_resolved());
        assert_eq!(resolved.original_stream_id(), Some("$ce-orders"));
        assert_eq!(resolved.original_event_number(), Some(9));
    }

    #[test]
    fn test_persistent_settings_messages() {
        let settings = PersistentSubscriptionSettings::default().with_start_from(0);
        let create = settings.to_create_message("orders", "workers");
        assert_eq!(create.subscription_group_name, "workers");
        assert_eq!(create.start_from, 0);
        assert_eq!(create.message_timeout_milliseconds, 30_000);
        assert!(create.prefer_round_robin);

        let update = settings.to_update_message("orders", "workers");
        assert_eq!(update.checkpoint_after_time, create.checkpoint_after_time);
    }

    #[test]
    fn test_nak_action_mapping() {
        assert_eq!(
            messages::NakAction::from(NakAction::Park),
            messages::NakAction::Park
        );
    }
}
