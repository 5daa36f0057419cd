//! Request/response operations.
//!
//! Every operation builds one request package and interprets the packages
//! that come back under its correlation id. The [`Operation`] trait is what
//! the operations manager drives; the concrete kinds only describe their
//! payloads and result codes through [`OperationKind`].

use crate::discovery::NodeEndPoints;
use crate::error::ClientError;
use crate::task::{CompletionSource, Task};
use crate::types::{
    AllEventsSlice, DeleteResult, EventData, EventReadResult, EventReadStatus, ExpectedVersion,
    PersistentSubscriptionSettings, Position, ReadDirection, ResolvedEvent, SliceReadStatus,
    StreamEventsSlice, WriteResult,
};
use bytes::Bytes;
use evstore_protocol::messages::{self, MasterInfo, NotHandledReason, OperationResult};
use evstore_protocol::{ProtocolError, TcpCommand, TcpPackage, UserCredentials};
use uuid::Uuid;

/// What the owner of an operation or subscription should do after a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectionDecision {
    DoNothing,
    EndOperation,
    Retry,
    Reconnect(NodeEndPoints),
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionResult {
    pub decision: InspectionDecision,
    pub description: String,
}

impl InspectionResult {
    pub fn new(decision: InspectionDecision, description: impl Into<String>) -> Self {
        Self {
            decision,
            description: description.into(),
        }
    }

    pub fn do_nothing(description: impl Into<String>) -> Self {
        Self::new(InspectionDecision::DoNothing, description)
    }

    pub fn end_operation(description: impl Into<String>) -> Self {
        Self::new(InspectionDecision::EndOperation, description)
    }

    pub fn retry(description: impl Into<String>) -> Self {
        Self::new(InspectionDecision::Retry, description)
    }
}

/// One request/response exchange.
pub trait Operation: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Builds the request under `correlation_id`.
    fn create_network_package(&self, correlation_id: Uuid) -> Result<TcpPackage, ClientError>;

    /// Consumes a response and decides what happens to the operation.
    fn inspect_package(&mut self, package: &TcpPackage) -> InspectionResult;

    /// Resolves the operation with an error. Later calls are ignored.
    fn fail(&mut self, error: ClientError);
}

/// Interpretation of a decoded response.
#[derive(Debug)]
pub(crate) enum Verdict {
    Success,
    Retry(&'static str),
    Fail(ClientError),
}

/// Payload and result-code rules of one request type.
pub(crate) trait OperationKind: Send + 'static {
    type Response: prost::Message + Default;
    type Output: Clone + Send + 'static;

    fn name(&self) -> &'static str;
    fn request_command(&self) -> TcpCommand;
    fn response_command(&self) -> TcpCommand;
    fn request(&self) -> Bytes;
    fn inspect_response(&self, response: &Self::Response) -> Verdict;
    fn transform(&self, response: Self::Response) -> Result<Self::Output, ClientError>;
}

/// Shared [`Operation`] behaviour over an [`OperationKind`].
pub(crate) struct OperationBase<K: OperationKind> {
    kind: K,
    credentials: Option<UserCredentials>,
    source: CompletionSource<K::Output>,
}

impl<K: OperationKind> OperationBase<K> {
    pub(crate) fn new(kind: K, credentials: Option<UserCredentials>) -> Self {
        Self {
            kind,
            credentials,
            source: CompletionSource::new(),
        }
    }

    pub(crate) fn task(&self) -> Task<K::Output> {
        self.source.task()
    }

    fn inspect_expected(&mut self, package: &TcpPackage) -> InspectionResult {
        let response = match messages::decode::<K::Response>(&package.data) {
            Ok(response) => response,
            Err(e) => {
                let description = format!("malformed {}: {}", package.command, e);
                self.fail(e.into());
                return InspectionResult::end_operation(description);
            }
        };

        match self.kind.inspect_response(&response) {
            Verdict::Success => {
                match self.kind.transform(response) {
                    Ok(output) => {
                        self.source.try_set_result(output);
                    }
                    Err(e) => self.fail(e),
                }
                InspectionResult::end_operation("Success")
            }
            Verdict::Retry(description) => InspectionResult::retry(description),
            Verdict::Fail(error) => {
                let description = error.to_string();
                self.fail(error);
                InspectionResult::end_operation(description)
            }
        }
    }
}

impl<K: OperationKind> Operation for OperationBase<K> {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn create_network_package(&self, correlation_id: Uuid) -> Result<TcpPackage, ClientError> {
        Ok(TcpPackage::with_credentials(
            self.kind.request_command(),
            correlation_id,
            self.credentials.clone(),
            self.kind.request(),
        ))
    }

    fn inspect_package(&mut self, package: &TcpPackage) -> InspectionResult {
        if package.command == self.kind.response_command() {
            return self.inspect_expected(package);
        }

        match package.command {
            TcpCommand::NotAuthenticated => {
                let message = lossy_message(&package.data, "Authentication error");
                self.fail(ClientError::NotAuthenticated(message));
                InspectionResult::end_operation("NotAuthenticated")
            }
            TcpCommand::BadRequest => {
                let message = lossy_message(&package.data, "<no message>");
                self.fail(ClientError::ServerError(message));
                InspectionResult::end_operation("BadRequest")
            }
            TcpCommand::NotHandled => inspect_not_handled(package),
            actual => {
                self.fail(ClientError::CommandNotExpected {
                    expected: self.kind.response_command(),
                    actual,
                });
                InspectionResult::end_operation(format!("unexpected command {}", actual))
            }
        }
    }

    fn fail(&mut self, error: ClientError) {
        self.source.try_set_error(error);
    }
}

/// Maps a `NotHandled` response to retry or reconnect.
///
/// Reasons this client does not know are retried.
pub(crate) fn inspect_not_handled(package: &TcpPackage) -> InspectionResult {
    let message = match messages::decode::<messages::NotHandled>(&package.data) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Malformed NotHandled payload, retrying: {}", e);
            return InspectionResult::retry("NotHandled - malformed");
        }
    };

    match NotHandledReason::try_from(message.reason) {
        Ok(NotHandledReason::NotReady) => InspectionResult::retry("NotHandled - NotReady"),
        Ok(NotHandledReason::TooBusy) => InspectionResult::retry("NotHandled - TooBusy"),
        Ok(NotHandledReason::NotMaster) => {
            let master = message
                .additional_info
                .as_ref()
                .ok_or(ClientError::NoResult)
                .and_then(|info| Ok(messages::decode::<MasterInfo>(info)?))
                .and_then(|info| NodeEndPoints::from_master_info(&info));
            match master {
                Ok(endpoints) => InspectionResult::new(
                    InspectionDecision::Reconnect(endpoints),
                    "NotHandled - NotMaster",
                ),
                Err(e) => {
                    tracing::warn!("NotMaster without usable master info, retrying: {}", e);
                    InspectionResult::retry("NotHandled - NotMaster")
                }
            }
        }
        Err(_) => {
            tracing::warn!("Unknown NotHandled reason {}, retrying", message.reason);
            InspectionResult::retry("NotHandled - unknown reason")
        }
    }
}

pub(crate) fn lossy_message(data: &Bytes, fallback: &str) -> String {
    if data.is_empty() {
        fallback.to_string()
    } else {
        String::from_utf8_lossy(data).into_owned()
    }
}

/// Decodes a protobuf enumeration field, rejecting values this client does not know.
pub(crate) fn enum_value<E: TryFrom<i32>>(
    field: &'static str,
    value: i32,
) -> Result<E, ClientError> {
    E::try_from(value)
        .map_err(|_| ClientError::Protocol(ProtocolError::InvalidEnumValue { field, value }))
}

fn log_position(commit: Option<i64>, prepare: Option<i64>) -> Result<Position, ClientError> {
    Position::new(commit.unwrap_or(-1), prepare.unwrap_or(-1))
}

fn write_verdict(result: i32, stream: &str, expected: i64, current: Option<i64>) -> Verdict {
    match enum_value::<OperationResult>("result", result) {
        Ok(OperationResult::Success) => Verdict::Success,
        Ok(OperationResult::PrepareTimeout) => Verdict::Retry("PrepareTimeout"),
        Ok(OperationResult::ForwardTimeout) => Verdict::Retry("ForwardTimeout"),
        Ok(OperationResult::CommitTimeout) => Verdict::Retry("CommitTimeout"),
        Ok(OperationResult::WrongExpectedVersion) => {
            Verdict::Fail(ClientError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
                current,
            })
        }
        Ok(OperationResult::StreamDeleted) => {
            Verdict::Fail(ClientError::StreamDeleted(stream.to_string()))
        }
        Ok(OperationResult::InvalidTransaction) => Verdict::Fail(ClientError::InvalidTransaction),
        Ok(OperationResult::AccessDenied) => Verdict::Fail(ClientError::AccessDenied(format!(
            "write access denied for stream '{}'",
            stream
        ))),
        Err(e) => Verdict::Fail(e),
    }
}

fn new_events(events: &[EventData]) -> Vec<messages::NewEvent> {
    events.iter().map(EventData::to_message).collect()
}

// ============================================================================
// Writes
// ============================================================================

pub(crate) struct AppendToStream {
    pub stream: String,
    pub expected_version: ExpectedVersion,
    pub events: Vec<EventData>,
    pub require_master: bool,
}

impl OperationKind for AppendToStream {
    type Response = messages::WriteEventsCompleted;
    type Output = WriteResult;

    fn name(&self) -> &'static str {
        "AppendToStream"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::WriteEvents
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::WriteEventsCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::WriteEvents {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version.to_i64(),
            events: new_events(&self.events),
            require_master: self.require_master,
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        write_verdict(
            response.result,
            &self.stream,
            self.expected_version.to_i64(),
            response.current_version,
        )
    }

    fn transform(&self, response: Self::Response) -> Result<WriteResult, ClientError> {
        Ok(WriteResult {
            next_expected_version: response.last_event_number,
            log_position: log_position(response.commit_position, response.prepare_position)?,
        })
    }
}

pub(crate) struct DeleteStream {
    pub stream: String,
    pub expected_version: ExpectedVersion,
    pub hard_delete: bool,
    pub require_master: bool,
}

impl OperationKind for DeleteStream {
    type Response = messages::DeleteStreamCompleted;
    type Output = DeleteResult;

    fn name(&self) -> &'static str {
        "DeleteStream"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::DeleteStream
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::DeleteStreamCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::DeleteStream {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version.to_i64(),
            require_master: self.require_master,
            hard_delete: Some(self.hard_delete),
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        write_verdict(
            response.result,
            &self.stream,
            self.expected_version.to_i64(),
            None,
        )
    }

    fn transform(&self, response: Self::Response) -> Result<DeleteResult, ClientError> {
        Ok(DeleteResult {
            log_position: log_position(response.commit_position, response.prepare_position)?,
        })
    }
}

pub(crate) struct StartTransaction {
    pub stream: String,
    pub expected_version: ExpectedVersion,
    pub require_master: bool,
}

impl OperationKind for StartTransaction {
    type Response = messages::TransactionStartCompleted;
    type Output = i64;

    fn name(&self) -> &'static str {
        "StartTransaction"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::TransactionStart
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::TransactionStartCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::TransactionStart {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version.to_i64(),
            require_master: self.require_master,
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        write_verdict(
            response.result,
            &self.stream,
            self.expected_version.to_i64(),
            None,
        )
    }

    fn transform(&self, response: Self::Response) -> Result<i64, ClientError> {
        Ok(response.transaction_id)
    }
}

pub(crate) struct TransactionalWrite {
    pub transaction_id: i64,
    pub events: Vec<EventData>,
    pub require_master: bool,
}

impl OperationKind for TransactionalWrite {
    type Response = messages::TransactionWriteCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "TransactionalWrite"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::TransactionWrite
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::TransactionWriteCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::TransactionWrite {
            transaction_id: self.transaction_id,
            events: new_events(&self.events),
            require_master: self.require_master,
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        let stream = format!("transaction {}", self.transaction_id);
        write_verdict(response.result, &stream, -1, None)
    }

    fn transform(&self, _response: Self::Response) -> Result<(), ClientError> {
        Ok(())
    }
}

pub(crate) struct CommitTransaction {
    pub transaction_id: i64,
    pub require_master: bool,
}

impl OperationKind for CommitTransaction {
    type Response = messages::TransactionCommitCompleted;
    type Output = WriteResult;

    fn name(&self) -> &'static str {
        "CommitTransaction"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::TransactionCommit
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::TransactionCommitCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::TransactionCommit {
            transaction_id: self.transaction_id,
            require_master: self.require_master,
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        let stream = format!("transaction {}", self.transaction_id);
        write_verdict(response.result, &stream, -1, None)
    }

    fn transform(&self, response: Self::Response) -> Result<WriteResult, ClientError> {
        Ok(WriteResult {
            next_expected_version: response.last_event_number,
            log_position: log_position(response.commit_position, response.prepare_position)?,
        })
    }
}

// ============================================================================
// Reads
// ============================================================================

pub(crate) struct ReadEvent {
    pub stream: String,
    pub event_number: i64,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

impl OperationKind for ReadEvent {
    type Response = messages::ReadEventCompleted;
    type Output = EventReadResult;

    fn name(&self) -> &'static str {
        "ReadEvent"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::ReadEvent
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::ReadEventCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::ReadEvent {
            event_stream_id: self.stream.clone(),
            event_number: self.event_number,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        use messages::ReadEventResult as R;
        match enum_value::<R>("result", response.result) {
            Ok(R::Success | R::NotFound | R::NoStream | R::StreamDeleted) => Verdict::Success,
            Ok(R::Error) => Verdict::Fail(ClientError::ServerError(
                response.error.clone().unwrap_or_else(|| "<no message>".to_string()),
            )),
            Ok(R::AccessDenied) => Verdict::Fail(ClientError::AccessDenied(format!(
                "read access denied for stream '{}'",
                self.stream
            ))),
            Err(e) => Verdict::Fail(e),
        }
    }

    fn transform(&self, response: Self::Response) -> Result<EventReadResult, ClientError> {
        use messages::ReadEventResult as R;
        let status = match enum_value::<R>("result", response.result)? {
            R::Success => EventReadStatus::Success,
            R::NotFound => EventReadStatus::NotFound,
            R::NoStream => EventReadStatus::NoStream,
            R::StreamDeleted => EventReadStatus::StreamDeleted,
            other => {
                return Err(ClientError::ServerError(format!(
                    "unexpected read result {:?}",
                    other
                )))
            }
        };
        let event = match status {
            EventReadStatus::Success => Some(ResolvedEvent::from_indexed(response.event)?),
            _ => None,
        };
        Ok(EventReadResult {
            status,
            stream: self.stream.clone(),
            event_number: self.event_number,
            event,
        })
    }
}

pub(crate) struct ReadStreamEvents {
    pub stream: String,
    pub from_event_number: i64,
    pub max_count: i32,
    pub direction: ReadDirection,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

impl OperationKind for ReadStreamEvents {
    type Response = messages::ReadStreamEventsCompleted;
    type Output = StreamEventsSlice;

    fn name(&self) -> &'static str {
        match self.direction {
            ReadDirection::Forward => "ReadStreamEventsForward",
            ReadDirection::Backward => "ReadStreamEventsBackward",
        }
    }

    fn request_command(&self) -> TcpCommand {
        match self.direction {
            ReadDirection::Forward => TcpCommand::ReadStreamEventsForward,
            ReadDirection::Backward => TcpCommand::ReadStreamEventsBackward,
        }
    }

    fn response_command(&self) -> TcpCommand {
        match self.direction {
            ReadDirection::Forward => TcpCommand::ReadStreamEventsForwardCompleted,
            ReadDirection::Backward => TcpCommand::ReadStreamEventsBackwardCompleted,
        }
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::ReadStreamEvents {
            event_stream_id: self.stream.clone(),
            from_event_number: self.from_event_number,
            max_count: self.max_count,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        use messages::ReadStreamResult as R;
        match enum_value::<R>("result", response.result) {
            Ok(R::Success | R::NoStream | R::StreamDeleted) => Verdict::Success,
            Ok(R::NotModified) => Verdict::Fail(ClientError::ServerError(
                "unexpected NotModified for stream read".to_string(),
            )),
            Ok(R::Error) => Verdict::Fail(ClientError::ServerError(
                response.error.clone().unwrap_or_else(|| "<no message>".to_string()),
            )),
            Ok(R::AccessDenied) => Verdict::Fail(ClientError::AccessDenied(format!(
                "read access denied for stream '{}'",
                self.stream
            ))),
            Err(e) => Verdict::Fail(e),
        }
    }

    fn transform(&self, response: Self::Response) -> Result<StreamEventsSlice, ClientError> {
        use messages::ReadStreamResult as R;
        let status = match enum_value::<R>("result", response.result)? {
            R::NoStream => SliceReadStatus::StreamNotFound,
            R::StreamDeleted => SliceReadStatus::StreamDeleted,
            _ => SliceReadStatus::Success,
        };
        let events = response
            .events
            .into_iter()
            .map(ResolvedEvent::from_indexed)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StreamEventsSlice {
            status,
            stream: self.stream.clone(),
            from_event_number: self.from_event_number,
            read_direction: self.direction,
            events,
            next_event_number: response.next_event_number,
            last_event_number: response.last_event_number,
            is_end_of_stream: response.is_end_of_stream,
        })
    }
}

pub(crate) struct ReadAllEvents {
    pub position: Position,
    pub max_count: i32,
    pub direction: ReadDirection,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

impl OperationKind for ReadAllEvents {
    type Response = messages::ReadAllEventsCompleted;
    type Output = AllEventsSlice;

    fn name(&self) -> &'static str {
        match self.direction {
            ReadDirection::Forward => "ReadAllEventsForward",
            ReadDirection::Backward => "ReadAllEventsBackward",
        }
    }

    fn request_command(&self) -> TcpCommand {
        match self.direction {
            ReadDirection::Forward => TcpCommand::ReadAllEventsForward,
            ReadDirection::Backward => TcpCommand::ReadAllEventsBackward,
        }
    }

    fn response_command(&self) -> TcpCommand {
        match self.direction {
            ReadDirection::Forward => TcpCommand::ReadAllEventsForwardCompleted,
            ReadDirection::Backward => TcpCommand::ReadAllEventsBackwardCompleted,
        }
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::ReadAllEvents {
            commit_position: self.position.commit_position,
            prepare_position: self.position.prepare_position,
            max_count: self.max_count,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        use messages::ReadAllResult as R;
        match enum_value::<R>("result", response.result.unwrap_or(0)) {
            Ok(R::Success | R::NotModified) => Verdict::Success,
            Ok(R::Error) => Verdict::Fail(ClientError::ServerError(
                response.error.clone().unwrap_or_else(|| "<no message>".to_string()),
            )),
            Ok(R::AccessDenied) => Verdict::Fail(ClientError::AccessDenied(
                "read access denied for $all".to_string(),
            )),
            Err(e) => Verdict::Fail(e),
        }
    }

    fn transform(&self, response: Self::Response) -> Result<AllEventsSlice, ClientError> {
        let events = response
            .events
            .into_iter()
            .map(ResolvedEvent::from_all)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AllEventsSlice {
            read_direction: self.direction,
            from_position: Position::new(response.commit_position, response.prepare_position)?,
            next_position: Position::new(
                response.next_commit_position,
                response.next_prepare_position,
            )?,
            events,
        })
    }
}

// ============================================================================
// Persistent subscription management
// ============================================================================

fn persistent_verdict(
    result: Result<PersistentOutcome, ClientError>,
    stream: &str,
    group: &str,
    reason: Option<&String>,
) -> Verdict {
    match result {
        Ok(PersistentOutcome::Success) => Verdict::Success,
        Ok(PersistentOutcome::AlreadyExists) => Verdict::Fail(ClientError::PersistentSubscription(
            format!("subscription group '{}' on stream '{}' already exists", group, stream),
        )),
        Ok(PersistentOutcome::DoesNotExist) => Verdict::Fail(ClientError::PersistentSubscription(
            format!("subscription group '{}' on stream '{}' does not exist", group, stream),
        )),
        Ok(PersistentOutcome::Fail) => Verdict::Fail(ClientError::PersistentSubscription(format!(
            "subscription group '{}' on stream '{}' failed: {}",
            group,
            stream,
            reason.map(String::as_str).unwrap_or("<no reason>")
        ))),
        Ok(PersistentOutcome::AccessDenied) => Verdict::Fail(ClientError::AccessDenied(format!(
            "access denied for subscription group '{}' on stream '{}'",
            group, stream
        ))),
        Err(e) => Verdict::Fail(e),
    }
}

enum PersistentOutcome {
    Success,
    AlreadyExists,
    DoesNotExist,
    Fail,
    AccessDenied,
}

pub(crate) struct CreatePersistentSubscription {
    pub stream: String,
    pub group: String,
    pub settings: PersistentSubscriptionSettings,
}

impl OperationKind for CreatePersistentSubscription {
    type Response = messages::CreatePersistentSubscriptionCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "CreatePersistentSubscription"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::CreatePersistentSubscription
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::CreatePersistentSubscriptionCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&self.settings.to_create_message(&self.stream, &self.group))
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        use messages::CreatePersistentSubscriptionResult as R;
        let outcome = enum_value::<R>("result", response.result).map(|r| match r {
            R::Success => PersistentOutcome::Success,
            R::AlreadyExists => PersistentOutcome::AlreadyExists,
            R::Fail => PersistentOutcome::Fail,
            R::AccessDenied => PersistentOutcome::AccessDenied,
        });
        persistent_verdict(outcome, &self.stream, &self.group, response.reason.as_ref())
    }

    fn transform(&self, _response: Self::Response) -> Result<(), ClientError> {
        Ok(())
    }
}

pub(crate) struct UpdatePersistentSubscription {
    pub stream: String,
    pub group: String,
    pub settings: PersistentSubscriptionSettings,
}

impl OperationKind for UpdatePersistentSubscription {
    type Response = messages::UpdatePersistentSubscriptionCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "UpdatePersistentSubscription"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::UpdatePersistentSubscription
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::UpdatePersistentSubscriptionCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&self.settings.to_update_message(&self.stream, &self.group))
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        use messages::UpdatePersistentSubscriptionResult as R;
        let outcome = enum_value::<R>("result", response.result).map(|r| match r {
            R::Success => PersistentOutcome::Success,
            R::DoesNotExist => PersistentOutcome::DoesNotExist,
            R::Fail => PersistentOutcome::Fail,
            R::AccessDenied => PersistentOutcome::AccessDenied,
        });
        persistent_verdict(outcome, &self.stream, &self.group, response.reason.as_ref())
    }

    fn transform(&self, _response: Self::Response) -> Result<(), ClientError> {
        Ok(())
    }
}

pub(crate) struct DeletePersistentSubscription {
    pub stream: String,
    pub group: String,
}

impl OperationKind for DeletePersistentSubscription {
    type Response = messages::DeletePersistentSubscriptionCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "DeletePersistentSubscription"
    }

    fn request_command(&self) -> TcpCommand {
        TcpCommand::DeletePersistentSubscription
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::DeletePersistentSubscriptionCompleted
    }

    fn request(&self) -> Bytes {
        messages::encode(&messages::DeletePersistentSubscription {
            subscription_group_name: self.group.clone(),
            event_stream_id: self.stream.clone(),
        })
    }

    fn inspect_response(&self, response: &Self::Response) -> Verdict {
        use messages::DeletePersistentSubscriptionResult as R;
        let outcome = enum_value::<R>("result", response.result).map(|r| match r {
            R::Success => PersistentOutcome::Success,
            R::DoesNotExist => PersistentOutcome::DoesNotExist,
            R::Fail => PersistentOutcome::Fail,
            R::AccessDenied => PersistentOutcome::AccessDenied,
        });
        persistent_verdict(outcome, &self.stream, &self.group, response.reason.as_ref())
    }

    fn transform(&self, _response: Self::Response) -> Result<(), ClientError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evstore_protocol::TcpFlags;

    fn append() -> OperationBase<AppendToStream> {
        OperationBase::new(
            AppendToStream {
                stream: "S".to_string(),
                expected_version: ExpectedVersion::Any,
                events: vec![EventData::new("Created", Bytes::from_static(b"{}"))],
                require_master: true,
            },
            None,
        )
    }

    fn response<M: prost::Message>(command: TcpCommand, message: &M) -> TcpPackage {
        TcpPackage::new(command, Uuid::new_v4(), messages::encode(message))
    }

    fn write_completed(result: OperationResult) -> messages::WriteEventsCompleted {
        messages::WriteEventsCompleted {
            result: result as i32,
            message: None,
            first_event_number: 0,
            last_event_number: 0,
            prepare_position: Some(100),
            commit_position: Some(120),
            current_version: Some(4),
        }
    }

    #[test]
    fn test_append_request_package() {
        let op = OperationBase::new(
            AppendToStream {
                stream: "S".to_string(),
                expected_version: ExpectedVersion::NoStream,
                events: vec![EventData::new("Created", Bytes::from_static(b"x"))],
                require_master: false,
            },
            Some(UserCredentials::new("admin", "changeit")),
        );
        let id = Uuid::new_v4();
        let package = op.create_network_package(id).unwrap();
        assert_eq!(package.command, TcpCommand::WriteEvents);
        assert_eq!(package.correlation_id, id);
        assert!(package.flags.is_authenticated());

        let request: messages::WriteEvents = messages::decode(&package.data).unwrap();
        assert_eq!(request.event_stream_id, "S");
        assert_eq!(request.expected_version, -1);
        assert_eq!(request.events.len(), 1);
        assert!(!request.require_master);
    }

    #[test]
    fn test_append_success_resolves_write_result() {
        let mut op = append();
        let task = op.task();
        let result = op.inspect_package(&response(
            TcpCommand::WriteEventsCompleted,
            &write_completed(OperationResult::Success),
        ));
        assert_eq!(result.decision, InspectionDecision::EndOperation);
        assert_eq!(
            task.result().unwrap(),
            WriteResult {
                next_expected_version: 0,
                log_position: Position::new(120, 100).unwrap(),
            }
        );
    }

    #[test]
    fn test_append_transient_results_retry() {
        for code in [
            OperationResult::PrepareTimeout,
            OperationResult::CommitTimeout,
            OperationResult::ForwardTimeout,
        ] {
            let mut op = append();
            let task = op.task();
            let result = op.inspect_package(&response(
                TcpCommand::WriteEventsCompleted,
                &write_completed(code),
            ));
            assert_eq!(result.decision, InspectionDecision::Retry);
            assert!(!task.is_completed());
        }
    }

    #[test]
    fn test_append_authoritative_results_fail() {
        let mut op = append();
        let task = op.task();
        let result = op.inspect_package(&response(
            TcpCommand::WriteEventsCompleted,
            &write_completed(OperationResult::WrongExpectedVersion),
        ));
        assert_eq!(result.decision, InspectionDecision::EndOperation);
        assert!(matches!(
            task.error(),
            Some(ClientError::WrongExpectedVersion {
                expected: -2,
                current: Some(4),
                ..
            })
        ));

        let mut op = append();
        let task = op.task();
        op.inspect_package(&response(
            TcpCommand::WriteEventsCompleted,
            &write_completed(OperationResult::StreamDeleted),
        ));
        assert!(matches!(task.error(), Some(ClientError::StreamDeleted(_))));
    }

    #[test]
    fn test_invalid_log_position_fails() {
        let mut op = append();
        let task = op.task();
        let mut completed = write_completed(OperationResult::Success);
        completed.commit_position = Some(5);
        completed.prepare_position = Some(10);
        op.inspect_package(&response(TcpCommand::WriteEventsCompleted, &completed));
        assert!(matches!(task.error(), Some(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn test_unexpected_command_fails() {
        let mut op = append();
        let task = op.task();
        let result = op.inspect_package(&TcpPackage::new(
            TcpCommand::ReadEventCompleted,
            Uuid::new_v4(),
            Bytes::new(),
        ));
        assert_eq!(result.decision, InspectionDecision::EndOperation);
        assert!(matches!(
            task.error(),
            Some(ClientError::CommandNotExpected {
                expected: TcpCommand::WriteEventsCompleted,
                actual: TcpCommand::ReadEventCompleted,
            })
        ));
    }

    #[test]
    fn test_bad_request_and_not_authenticated() {
        let mut op = append();
        let task = op.task();
        op.inspect_package(&TcpPackage::new(
            TcpCommand::BadRequest,
            Uuid::new_v4(),
            Bytes::from_static(b"bad payload"),
        ));
        assert!(matches!(task.error(), Some(ClientError::ServerError(m)) if m == "bad payload"));

        let mut op = append();
        let task = op.task();
        op.inspect_package(&TcpPackage::new(
            TcpCommand::NotAuthenticated,
            Uuid::new_v4(),
            Bytes::new(),
        ));
        assert!(matches!(task.error(), Some(ClientError::NotAuthenticated(_))));
    }

    #[test]
    fn test_not_handled_reasons() {
        let not_handled = |reason: i32, info: Option<Bytes>| {
            response(
                TcpCommand::NotHandled,
                &messages::NotHandled {
                    reason,
                    additional_info: info,
                },
            )
        };

        let result = inspect_not_handled(&not_handled(NotHandledReason::NotReady as i32, None));
        assert_eq!(result.decision, InspectionDecision::Retry);
        let result = inspect_not_handled(&not_handled(NotHandledReason::TooBusy as i32, None));
        assert_eq!(result.decision, InspectionDecision::Retry);
        let result = inspect_not_handled(&not_handled(42, None));
        assert_eq!(result.decision, InspectionDecision::Retry);

        let master = messages::MasterInfo {
            external_tcp_address: "10.0.0.2".to_string(),
            external_tcp_port: 1113,
            external_http_address: "10.0.0.2".to_string(),
            external_http_port: 2113,
            external_secure_tcp_address: None,
            external_secure_tcp_port: None,
        };
        let result = inspect_not_handled(&not_handled(
            NotHandledReason::NotMaster as i32,
            Some(messages::encode(&master)),
        ));
        match result.decision {
            InspectionDecision::Reconnect(endpoints) => {
                assert_eq!(endpoints.tcp, "10.0.0.2:1113".parse().unwrap())
            }
            other => panic!("expected reconnect, got {:?}", other),
        }

        let result = inspect_not_handled(&not_handled(NotHandledReason::NotMaster as i32, None));
        assert_eq!(result.decision, InspectionDecision::Retry);
    }

    #[test]
    fn test_read_event_not_found() {
        let mut op = OperationBase::new(
            ReadEvent {
                stream: "S".to_string(),
                event_number: 3,
                resolve_link_tos: false,
                require_master: false,
            },
            None,
        );
        let task = op.task();
        op.inspect_package(&response(
            TcpCommand::ReadEventCompleted,
            &messages::ReadEventCompleted {
                result: messages::ReadEventResult::NotFound as i32,
                event: messages::ResolvedIndexedEvent::default(),
                error: None,
            },
        ));
        let result = task.result().unwrap();
        assert_eq!(result.status, EventReadStatus::NotFound);
        assert_eq!(result.event_number, 3);
        assert!(result.event.is_none());
    }

    #[test]
    fn test_read_stream_backward_slice() {
        let record = |n: i64| messages::EventRecord {
            event_stream_id: "S".to_string(),
            event_number: n,
            event_id: Uuid::new_v4().to_bytes_le().to_vec(),
            event_type: "Created".to_string(),
            ..Default::default()
        };
        let mut op = OperationBase::new(
            ReadStreamEvents {
                stream: "S".to_string(),
                from_event_number: -1,
                max_count: 2,
                direction: ReadDirection::Backward,
                resolve_link_tos: false,
                require_master: false,
            },
            None,
        );
        let package = op.create_network_package(Uuid::new_v4()).unwrap();
        assert_eq!(package.command, TcpCommand::ReadStreamEventsBackward);

        let task = op.task();
        op.inspect_package(&response(
            TcpCommand::ReadStreamEventsBackwardCompleted,
            &messages::ReadStreamEventsCompleted {
                events: vec![
                    messages::ResolvedIndexedEvent {
                        event: Some(record(5)),
                        link: None,
                    },
                    messages::ResolvedIndexedEvent {
                        event: Some(record(4)),
                        link: None,
                    },
                ],
                result: messages::ReadStreamResult::Success as i32,
                next_event_number: 3,
                last_event_number: 5,
                is_end_of_stream: false,
                last_commit_position: 900,
                error: None,
            },
        ));
        let slice = task.result().unwrap();
        assert_eq!(slice.read_direction, ReadDirection::Backward);
        assert_eq!(slice.events.len(), 2);
        assert_eq!(slice.events[0].original_event_number(), Some(5));
        assert_eq!(slice.next_event_number, 3);
    }

    #[test]
    fn test_read_all_access_denied() {
        let mut op = OperationBase::new(
            ReadAllEvents {
                position: Position::START,
                max_count: 10,
                direction: ReadDirection::Forward,
                resolve_link_tos: false,
                require_master: false,
            },
            None,
        );
        let task = op.task();
        op.inspect_package(&response(
            TcpCommand::ReadAllEventsForwardCompleted,
            &messages::ReadAllEventsCompleted {
                result: Some(messages::ReadAllResult::AccessDenied as i32),
                ..Default::default()
            },
        ));
        assert!(matches!(task.error(), Some(ClientError::AccessDenied(_))));
    }

    #[test]
    fn test_create_persistent_already_exists() {
        let mut op = OperationBase::new(
            CreatePersistentSubscription {
                stream: "S".to_string(),
                group: "g".to_string(),
                settings: PersistentSubscriptionSettings::default(),
            },
            None,
        );
        let task = op.task();
        op.inspect_package(&response(
            TcpCommand::CreatePersistentSubscriptionCompleted,
            &messages::CreatePersistentSubscriptionCompleted {
                result: messages::CreatePersistentSubscriptionResult::AlreadyExists as i32,
                reason: None,
            },
        ));
        assert!(matches!(
            task.error(),
            Some(ClientError::PersistentSubscription(m)) if m.contains("already exists")
        ));
    }

    #[test]
    fn test_transaction_commit_result() {
        let mut op = OperationBase::new(
            CommitTransaction {
                transaction_id: 77,
                require_master: true,
            },
            None,
        );
        let package = op.create_network_package(Uuid::new_v4()).unwrap();
        assert_eq!(package.flags, TcpFlags::new());
        let request: messages::TransactionCommit = messages::decode(&package.data).unwrap();
        assert_eq!(request.transaction_id, 77);

        let task = op.task();
        op.inspect_package(&response(
            TcpCommand::TransactionCommitCompleted,
            &messages::TransactionCommitCompleted {
                transaction_id: 77,
                result: OperationResult::Success as i32,
                message: None,
                first_event_number: 3,
                last_event_number: 5,
                prepare_position: Some(10),
                commit_position: Some(10),
            },
        ));
        assert_eq!(task.result().unwrap().next_expected_version, 5);
    }

    #[test]
    fn test_fail_is_idempotent() {
        let mut op = append();
        let task = op.task();
        op.fail(ClientError::Timeout);
        op.fail(ClientError::NotActive);
        assert!(matches!(task.error(), Some(ClientError::Timeout)));
    }
}
