//! Protocol-buffer payload messages.
//!
//! Field numbers and labels follow the server's `ClientMessageDtos` schema
//! (proto2), so `required` fields are plain values and `optional` fields are
//! `Option`s.

use crate::error::ProtocolError;
use bytes::Bytes;
use prost::Message;

/// Serializes a payload message.
pub fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

/// Deserializes a payload message.
pub fn decode<M: Message + Default>(data: &Bytes) -> Result<M, ProtocolError> {
    Ok(M::decode(data.clone())?)
}

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct NewEvent {
    #[prost(bytes = "vec", required, tag = "1")]
    pub event_id: Vec<u8>,
    #[prost(string, required, tag = "2")]
    pub event_type: String,
    #[prost(int32, required, tag = "3")]
    pub data_content_type: i32,
    #[prost(int32, required, tag = "4")]
    pub metadata_content_type: i32,
    #[prost(bytes = "bytes", required, tag = "5")]
    pub data: Bytes,
    #[prost(bytes = "bytes", optional, tag = "6")]
    pub metadata: Option<Bytes>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EventRecord {
    #[prost(string, required, tag = "1")]
    pub event_stream_id: String,
    #[prost(int64, required, tag = "2")]
    pub event_number: i64,
    #[prost(bytes = "vec", required, tag = "3")]
    pub event_id: Vec<u8>,
    #[prost(string, required, tag = "4")]
    pub event_type: String,
    #[prost(int32, required, tag = "5")]
    pub data_content_type: i32,
    #[prost(int32, required, tag = "6")]
    pub metadata_content_type: i32,
    #[prost(bytes = "bytes", required, tag = "7")]
    pub data: Bytes,
    #[prost(bytes = "bytes", optional, tag = "8")]
    pub metadata: Option<Bytes>,
    #[prost(int64, optional, tag = "9")]
    pub created: Option<i64>,
    #[prost(int64, optional, tag = "10")]
    pub created_epoch: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResolvedIndexedEvent {
    #[prost(message, optional, tag = "1")]
    pub event: Option<EventRecord>,
    #[prost(message, optional, tag = "2")]
    pub link: Option<EventRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResolvedEvent {
    #[prost(message, optional, tag = "1")]
    pub event: Option<EventRecord>,
    #[prost(message, optional, tag = "2")]
    pub link: Option<EventRecord>,
    #[prost(int64, required, tag = "3")]
    pub commit_position: i64,
    #[prost(int64, required, tag = "4")]
    pub prepare_position: i64,
}

/// Result code shared by write, delete and transaction completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum OperationResult {
    Success = 0,
    PrepareTimeout = 1,
    CommitTimeout = 2,
    ForwardTimeout = 3,
    WrongExpectedVersion = 4,
    StreamDeleted = 5,
    InvalidTransaction = 6,
    AccessDenied = 7,
}

// ============================================================================
// Writes
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct WriteEvents {
    #[prost(string, required, tag = "1")]
    pub event_stream_id: String,
    #[prost(int64, required, tag = "2")]
    pub expected_version: i64,
    #[prost(message, repeated, tag = "3")]
    pub events: Vec<NewEvent>,
    #[prost(bool, required, tag = "4")]
    pub require_master: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct WriteEventsCompleted {
    #[prost(enumeration = "OperationResult", required, tag = "1")]
    pub result: i32,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
    #[prost(int64, required, tag = "3")]
    pub first_event_number: i64,
    #[prost(int64, required, tag = "4")]
    pub last_event_number: i64,
    #[prost(int64, optional, tag = "5")]
    pub prepare_position: Option<i64>,
    #[prost(int64, optional, tag = "6")]
    pub commit_position: Option<i64>,
    #[prost(int64, optional, tag = "7")]
    pub current_version: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeleteStream {
    #[prost(string, required, tag = "1")]
    pub event_stream_id: String,
    #[prost(int64, required, tag = "2")]
    pub expected_version: i64,
    #[prost(bool, required, tag = "3")]
    pub require_master: bool,
    #[prost(bool, optional, tag = "4")]
    pub hard_delete: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeleteStreamCompleted {
    #[prost(enumeration = "OperationResult", required, tag = "1")]
    pub result: i32,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
    #[prost(int64, optional, tag = "3")]
    pub prepare_position: Option<i64>,
    #[prost(int64, optional, tag = "4")]
    pub commit_position: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionStart {
    #[prost(string, required, tag = "1")]
    pub event_stream_id: String,
    #[prost(int64, required, tag = "2")]
    pub expected_version: i64,
    #[prost(bool, required, tag = "3")]
    pub require_master: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionStartCompleted {
    #[prost(int64, required, tag = "1")]
    pub transaction_id: i64,
    #[prost(enumeration = "OperationResult", required, tag = "2")]
    pub result: i32,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionWrite {
    #[prost(int64, required, tag = "1")]
    pub transaction_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub events: Vec<NewEvent>,
    #[prost(bool, required, tag = "3")]
    pub require_master: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionWriteCompleted {
    #[prost(int64, required, tag = "1")]
    pub transaction_id: i64,
    #[prost(enumeration = "OperationResult", required, tag = "2")]
    pub result: i32,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionCommit {
    #[prost(int64, required, tag = "1")]
    pub transaction_id: i64,
    #[prost(bool, required, tag = "2")]
    pub require_master: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionCommitCompleted {
    #[prost(int64, required, tag = "1")]
    pub transaction_id: i64,
    #[prost(enumeration = "OperationResult", required, tag = "2")]
    pub result: i32,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
    #[prost(int64, required, tag = "4")]
    pub first_event_number: i64,
    #[prost(int64, required, tag = "5")]
    pub last_event_number: i64,
    #[prost(int64, optional, tag = "6")]
    pub prepare_position: Option<i64>,
    #[prost(int64, optional, tag = "7")]
    pub commit_position: Option<i64>,
}

// ============================================================================
// Reads
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct ReadEvent {
    #[prost(string, required, tag = "1")]
    pub event_stream_id: String,
    #[prost(int64, required, tag = "2")]
    pub event_number: i64,
    #[prost(bool, required, tag = "3")]
    pub resolve_link_tos: bool,
    #[prost(bool, required, tag = "4")]
    pub require_master: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReadEventResult {
    Success = 0,
    NotFound = 1,
    NoStream = 2,
    StreamDeleted = 3,
    Error = 4,
    AccessDenied = 5,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadEventCompleted {
    #[prost(enumeration = "ReadEventResult", required, tag = "1")]
    pub result: i32,
    #[prost(message, required, tag = "2")]
    pub event: ResolvedIndexedEvent,
    #[prost(string, optional, tag = "3")]
    pub error: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadStreamEvents {
    #[prost(string, required, tag = "1")]
    pub event_stream_id: String,
    #[prost(int64, required, tag = "2")]
    pub from_event_number: i64,
    #[prost(int32, required, tag = "3")]
    pub max_count: i32,
    #[prost(bool, required, tag = "4")]
    pub resolve_link_tos: bool,
    #[prost(bool, required, tag = "5")]
    pub require_master: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReadStreamResult {
    Success = 0,
    NoStream = 1,
    StreamDeleted = 2,
    NotModified = 3,
    Error = 4,
    AccessDenied = 5,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadStreamEventsCompleted {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<ResolvedIndexedEvent>,
    #[prost(enumeration = "ReadStreamResult", required, tag = "2")]
    pub result: i32,
    #[prost(int64, required, tag = "3")]
    pub next_event_number: i64,
    #[prost(int64, required, tag = "4")]
    pub last_event_number: i64,
    #[prost(bool, required, tag = "5")]
    pub is_end_of_stream: bool,
    #[prost(int64, required, tag = "6")]
    pub last_commit_position: i64,
    #[prost(string, optional, tag = "7")]
    pub error: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadAllEvents {
    #[prost(int64, required, tag = "1")]
    pub commit_position: i64,
    #[prost(int64, required, tag = "2")]
    pub prepare_position: i64,
    #[prost(int32, required, tag = "3")]
    pub max_count: i32,
    #[prost(bool, required, tag = "4")]
    pub resolve_link_tos: bool,
    #[prost(bool, required, tag = "5")]
    pub require_master: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReadAllResult {
    Success = 0,
    NotModified = 1,
    Error = 2,
    AccessDenied = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadAllEventsCompleted {
    #[prost(int64, required, tag = "1")]
    pub commit_position: i64,
    #[prost(int64, required, tag = "2")]
    pub prepare_position: i64,
    #[prost(message, repeated, tag = "3")]
    pub events: Vec<ResolvedEvent>,
    #[prost(int64, required, tag = "4")]
    pub next_commit_position: i64,
    #[prost(int64, required, tag = "5")]
    pub next_prepare_position: i64,
    #[prost(enumeration = "ReadAllResult", optional, tag = "6")]
    pub result: Option<i32>,
    #[prost(string, optional, tag = "7")]
    pub error: Option<String>,
}

// ============================================================================
// Persistent subscription management
// ============================================================================

/// Settings block shared by create and update requests.
#[derive(Clone, PartialEq, Message)]
pub struct CreatePersistentSubscription {
    #[prost(string, required, tag = "1")]
    pub subscription_group_name: String,
    #[prost(string, required, tag = "2")]
    pub event_stream_id: String,
    #[prost(bool, required, tag = "3")]
    pub resolve_link_tos: bool,
    #[prost(int64, required, tag = "4")]
    pub start_from: i64,
    #[prost(int32, required, tag = "5")]
    pub message_timeout_milliseconds: i32,
    #[prost(bool, required, tag = "6")]
    pub record_statistics: bool,
    #[prost(int32, required, tag = "7")]
    pub live_buffer_size: i32,
    #[prost(int32, required, tag = "8")]
    pub read_batch_size: i32,
    #[prost(int32, required, tag = "9")]
    pub buffer_size: i32,
    #[prost(int32, required, tag = "10")]
    pub max_retry_count: i32,
    #[prost(bool, required, tag = "11")]
    pub prefer_round_robin: bool,
    #[prost(int32, required, tag = "12")]
    pub checkpoint_after_time: i32,
    #[prost(int32, required, tag = "13")]
    pub checkpoint_max_count: i32,
    #[prost(int32, required, tag = "14")]
    pub checkpoint_min_count: i32,
    #[prost(int32, required, tag = "15")]
    pub subscriber_max_count: i32,
    #[prost(string, optional, tag = "16")]
    pub named_consumer_strategy: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdatePersistentSubscription {
    #[prost(string, required, tag = "1")]
    pub subscription_group_name: String,
    #[prost(string, required, tag = "2")]
    pub event_stream_id: String,
    #[prost(bool, required, tag = "3")]
    pub resolve_link_tos: bool,
    #[prost(int64, required, tag = "4")]
    pub start_from: i64,
    #[prost(int32, required, tag = "5")]
    pub message_timeout_milliseconds: i32,
    #[prost(bool, required, tag = "6")]
    pub record_statistics: bool,
    #[prost(int32, required, tag = "7")]
    pub live_buffer_size: i32,
    #[prost(int32, required, tag = "8")]
    pub read_batch_size: i32,
    #[prost(int32, required, tag = "9")]
    pub buffer_size: i32,
    #[prost(int32, required, tag = "10")]
    pub max_retry_count: i32,
    #[prost(bool, required, tag = "11")]
    pub prefer_round_robin: bool,
    #[prost(int32, required, tag = "12")]
    pub checkpoint_after_time: i32,
    #[prost(int32, required, tag = "13")]
    pub checkpoint_max_count: i32,
    #[prost(int32, required, tag = "14")]
    pub checkpoint_min_count: i32,
    #[prost(int32, required, tag = "15")]
    pub subscriber_max_count: i32,
    #[prost(string, optional, tag = "16")]
    pub named_consumer_strategy: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeletePersistentSubscription {
    #[prost(string, required, tag = "1")]
    pub subscription_group_name: String,
    #[prost(string, required, tag = "2")]
    pub event_stream_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CreatePersistentSubscriptionResult {
    Success = 0,
    AlreadyExists = 1,
    Fail = 2,
    AccessDenied = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct CreatePersistentSubscriptionCompleted {
    #[prost(enumeration = "CreatePersistentSubscriptionResult", required, tag = "1")]
    pub result: i32,
    #[prost(string, optional, tag = "2")]
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum UpdatePersistentSubscriptionResult {
    Success = 0,
    DoesNotExist = 1,
    Fail = 2,
    AccessDenied = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdatePersistentSubscriptionCompleted {
    #[prost(enumeration = "UpdatePersistentSubscriptionResult", required, tag = "1")]
    pub result: i32,
    #[prost(string, optional, tag = "2")]
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DeletePersistentSubscriptionResult {
    Success = 0,
    DoesNotExist = 1,
    Fail = 2,
    AccessDenied = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeletePersistentSubscriptionCompleted {
    #[prost(enumeration = "DeletePersistentSubscriptionResult", required, tag = "1")]
    pub result: i32,
    #[prost(string, optional, tag = "2")]
    pub reason: Option<String>,
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeToStream {
    #[prost(string, required, tag = "1")]
    pub event_stream_id: String,
    #[prost(bool, required, tag = "2")]
    pub resolve_link_tos: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscriptionConfirmation {
    #[prost(int64, required, tag = "1")]
    pub last_commit_position: i64,
    #[prost(int64, optional, tag = "2")]
    pub last_event_number: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamEventAppeared {
    #[prost(message, required, tag = "1")]
    pub event: ResolvedEvent,
}

#[derive(Clone, PartialEq, Message)]
pub struct UnsubscribeFromStream {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SubscriptionDropReason {
    Unsubscribed = 0,
    AccessDenied = 1,
    NotFound = 2,
    PersistentSubscriptionDeleted = 3,
    SubscriberMaxCountReached = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscriptionDropped {
    #[prost(enumeration = "SubscriptionDropReason", optional, tag = "1")]
    pub reason: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectToPersistentSubscription {
    #[prost(string, required, tag = "1")]
    pub subscription_id: String,
    #[prost(string, required, tag = "2")]
    pub event_stream_id: String,
    #[prost(int32, required, tag = "3")]
    pub allowed_in_flight_messages: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PersistentSubscriptionConfirmation {
    #[prost(int64, required, tag = "1")]
    pub last_commit_position: i64,
    #[prost(string, required, tag = "2")]
    pub subscription_id: String,
    #[prost(int64, optional, tag = "3")]
    pub last_event_number: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PersistentSubscriptionStreamEventAppeared {
    #[prost(message, required, tag = "1")]
    pub event: ResolvedIndexedEvent,
    #[prost(int32, optional, tag = "2")]
    pub retry_count: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PersistentSubscriptionAckEvents {
    #[prost(string, required, tag = "1")]
    pub subscription_id: String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub processed_event_ids: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum NakAction {
    Unknown = 0,
    Park = 1,
    Retry = 2,
    Skip = 3,
    Stop = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct PersistentSubscriptionNakEvents {
    #[prost(string, required, tag = "1")]
    pub subscription_id: String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub processed_event_ids: Vec<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
    #[prost(enumeration = "NakAction", required, tag = "4")]
    pub action: i32,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum NotHandledReason {
    NotReady = 0,
    TooBusy = 1,
    NotMaster = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct NotHandled {
    #[prost(enumeration = "NotHandledReason", required, tag = "1")]
    pub reason: i32,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub additional_info: Option<Bytes>,
}

/// Master endpoints advertised in `NotHandled(NotMaster)`.
#[derive(Clone, PartialEq, Message)]
pub struct MasterInfo {
    #[prost(string, required, tag = "1")]
    pub external_tcp_address: String,
    #[prost(int32, required, tag = "2")]
    pub external_tcp_port: i32,
    #[prost(string, required, tag = "3")]
    pub external_http_address: String,
    #[prost(int32, required, tag = "4")]
    pub external_http_port: i32,
    #[prost(string, optional, tag = "5")]
    pub external_secure_tcp_address: Option<String>,
    #[prost(int32, optional, tag = "6")]
    pub external_secure_tcp_port: Option<i32>,
}
