//! Push subscriptions.
//!
//! A subscription operation lives inside the connection actor and turns
//! server packages into deliveries. User callbacks never run on the actor:
//! each subscription owns a delivery task that invokes them in order.

use crate::connection::{Message, Poster};
use crate::error::{run_handler, ClientError};
use crate::operations::{
    enum_value, inspect_not_handled, lossy_message, InspectionDecision, InspectionResult,
};
use crate::task::{CompletionSource, Task};
use crate::transport::TcpPackageConnection;
use crate::types::{
    NakAction, ResolvedEvent, SubscriptionConfirmation, SubscriptionDropReason, MAX_ACK_BATCH,
};
use bytes::Bytes;
use evstore_protocol::messages::{self, SubscriptionDropReason as WireDropReason};
use evstore_protocol::{TcpCommand, TcpPackage, UserCredentials};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A subscription as driven by the subscriptions manager.
pub trait Subscription: Send {
    fn description(&self) -> String;

    /// Sends the subscribe request under `correlation_id`.
    ///
    /// Returns `false` if the subscription was already dropped.
    fn subscribe(&mut self, correlation_id: Uuid, connection: &TcpPackageConnection) -> bool;

    fn inspect_package(&mut self, package: &TcpPackage) -> InspectionResult;

    /// Ends the subscription once. When `connection` is given and the
    /// subscription was confirmed, the server is told to unsubscribe.
    fn drop_subscription(
        &mut self,
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
        connection: Option<&TcpPackageConnection>,
    );

    fn connection_closed(&mut self) {
        self.drop_subscription(
            SubscriptionDropReason::ConnectionClosed,
            Some(ClientError::connection_closed("connection was closed")),
            None,
        );
    }

    /// Package acknowledging processed events, for subscriptions that support it.
    fn processed_events_package(&self, _control: &SubscriptionControl) -> Option<TcpPackage> {
        None
    }
}

/// Requests a subscription handle sends to the connection actor.
#[derive(Debug, Clone)]
pub enum SubscriptionControl {
    Unsubscribe {
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    },
    Ack {
        event_ids: Vec<Uuid>,
    },
    Nak {
        event_ids: Vec<Uuid>,
        action: NakAction,
        reason: String,
    },
}

/// How a subscription ended, as seen by its handle.
#[derive(Debug, Clone)]
pub struct DroppedSubscription {
    pub reason: SubscriptionDropReason,
    pub error: Option<ClientError>,
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Event {
        event: ResolvedEvent,
        retry_count: Option<i32>,
    },
    Dropped {
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    },
}

// ============================================================================
// Operation core
// ============================================================================

struct SubscriptionCore {
    stream: String,
    credentials: Option<UserCredentials>,
    correlation_id: Uuid,
    confirmation: Option<SubscriptionConfirmation>,
    unsubscribed: bool,
    source: CompletionSource<SubscriptionConfirmation>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    verbose: bool,
}

impl SubscriptionCore {
    fn new(
        stream: String,
        credentials: Option<UserCredentials>,
        deliveries: mpsc::UnboundedSender<Delivery>,
        verbose: bool,
    ) -> Self {
        Self {
            stream,
            credentials,
            correlation_id: Uuid::nil(),
            confirmation: None,
            unsubscribed: false,
            source: CompletionSource::new(),
            deliveries,
            verbose,
        }
    }

    fn stream_name(&self) -> &str {
        if self.stream.is_empty() {
            "$all"
        } else {
            &self.stream
        }
    }

    fn package(&self, command: TcpCommand, data: Bytes) -> TcpPackage {
        TcpPackage::with_credentials(command, self.correlation_id, self.credentials.clone(), data)
    }

    fn subscribe(
        &mut self,
        correlation_id: Uuid,
        connection: &TcpPackageConnection,
        command: TcpCommand,
        data: Bytes,
    ) -> bool {
        if self.unsubscribed {
            return false;
        }
        self.correlation_id = correlation_id;
        connection.enqueue_send(self.package(command, data));
        true
    }

    fn confirm(&mut self, confirmation: SubscriptionConfirmation) -> InspectionResult {
        if self.verbose {
            tracing::debug!(
                "Subscription {} to '{}' confirmed at {}/{:?}",
                self.correlation_id,
                self.stream_name(),
                confirmation.last_commit_position,
                confirmation.last_event_number
            );
        }
        self.confirmation = Some(confirmation);
        self.source.try_set_result(confirmation);
        InspectionResult::new(InspectionDecision::Subscribed, "SubscriptionConfirmation")
    }

    fn deliver(&mut self, event: ResolvedEvent, retry_count: Option<i32>) -> InspectionResult {
        if self.unsubscribed {
            return InspectionResult::do_nothing("event after drop");
        }
        if self.confirmation.is_none() {
            self.drop_subscription(
                SubscriptionDropReason::ServerError,
                Some(ClientError::ServerError(
                    "event appeared before the subscription was confirmed".to_string(),
                )),
                None,
            );
            return InspectionResult::end_operation("event before confirmation");
        }
        let _ = self.deliveries.send(Delivery::Event { event, retry_count });
        InspectionResult::do_nothing("StreamEventAppeared")
    }

    fn malformed(&mut self, command: TcpCommand, error: ClientError) -> InspectionResult {
        let description = format!("malformed {}: {}", command, error);
        self.drop_subscription(SubscriptionDropReason::ServerError, Some(error), None);
        InspectionResult::end_operation(description)
    }

    fn drop_subscription(
        &mut self,
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
        connection: Option<&TcpPackageConnection>,
    ) {
        if self.unsubscribed {
            return;
        }
        self.unsubscribed = true;

        if self.verbose {
            tracing::debug!(
                "Subscription {} to '{}' dropped: {} ({:?})",
                self.correlation_id,
                self.stream_name(),
                reason,
                error
            );
        }

        if reason != SubscriptionDropReason::UserInitiated {
            let failure = error
                .clone()
                .unwrap_or_else(|| ClientError::SubscriptionDropped(reason.to_string()));
            self.source.try_set_error(failure);
        }

        if self.confirmation.is_some() {
            if let Some(connection) = connection {
                connection.enqueue_send(self.package(
                    TcpCommand::UnsubscribeFromStream,
                    messages::encode(&messages::UnsubscribeFromStream {}),
                ));
            }
            let _ = self.deliveries.send(Delivery::Dropped { reason, error });
        }
    }

    /// Handles everything but confirmations and event pushes.
    fn inspect_common(&mut self, package: &TcpPackage, expected: TcpCommand) -> InspectionResult {
        match package.command {
            TcpCommand::SubscriptionDropped => {
                let value = match messages::decode::<messages::SubscriptionDropped>(&package.data) {
                    Ok(message) => message.reason.unwrap_or(WireDropReason::Unsubscribed as i32),
                    Err(e) => return self.malformed(package.command, e.into()),
                };
                let (reason, error) = match enum_value::<WireDropReason>("reason", value) {
                    Ok(WireDropReason::Unsubscribed) => {
                        (SubscriptionDropReason::UserInitiated, None)
                    }
                    Ok(WireDropReason::AccessDenied) => (
                        SubscriptionDropReason::AccessDenied,
                        Some(ClientError::AccessDenied(format!(
                            "subscription to '{}' failed due to access denied",
                            self.stream_name()
                        ))),
                    ),
                    Ok(WireDropReason::NotFound) => (
                        SubscriptionDropReason::NotFound,
                        Some(ClientError::SubscriptionDropped(format!(
                            "subscription to '{}' not found",
                            self.stream_name()
                        ))),
                    ),
                    Ok(WireDropReason::PersistentSubscriptionDeleted) => (
                        SubscriptionDropReason::PersistentSubscriptionDeleted,
                        Some(ClientError::PersistentSubscription(
                            "subscription group was deleted".to_string(),
                        )),
                    ),
                    Ok(WireDropReason::SubscriberMaxCountReached) => (
                        SubscriptionDropReason::MaxSubscribersReached,
                        Some(ClientError::PersistentSubscription(
                            "maximum subscriber count reached".to_string(),
                        )),
                    ),
                    Err(e) => (SubscriptionDropReason::Unknown, Some(e)),
                };
                self.drop_subscription(reason, error, None);
                InspectionResult::end_operation("SubscriptionDropped")
            }
            TcpCommand::NotAuthenticated => {
                let message = lossy_message(&package.data, "Authentication error");
                self.drop_subscription(
                    SubscriptionDropReason::NotAuthenticated,
                    Some(ClientError::NotAuthenticated(message)),
                    None,
                );
                InspectionResult::end_operation("NotAuthenticated")
            }
            TcpCommand::BadRequest => {
                let message = lossy_message(&package.data, "<no message>");
                self.drop_subscription(
                    SubscriptionDropReason::ServerError,
                    Some(ClientError::ServerError(message)),
                    None,
                );
                InspectionResult::end_operation("BadRequest")
            }
            TcpCommand::NotHandled if self.confirmation.is_none() => inspect_not_handled(package),
            actual => {
                self.drop_subscription(
                    SubscriptionDropReason::ServerError,
                    Some(ClientError::CommandNotExpected { expected, actual }),
                    None,
                );
                InspectionResult::end_operation(format!("unexpected command {}", actual))
            }
        }
    }
}

// ============================================================================
// Volatile
// ============================================================================

/// Live-only subscription to one stream or to `$all`.
pub(crate) struct VolatileSubscriptionOperation {
    core: SubscriptionCore,
    resolve_link_tos: bool,
}

impl VolatileSubscriptionOperation {
    pub(crate) fn confirmation(&self) -> Task<SubscriptionConfirmation> {
        self.core.source.task()
    }
}

impl Subscription for VolatileSubscriptionOperation {
    fn description(&self) -> String {
        format!("volatile subscription to '{}'", self.core.stream_name())
    }

    fn subscribe(&mut self, correlation_id: Uuid, connection: &TcpPackageConnection) -> bool {
        let data = messages::encode(&messages::SubscribeToStream {
            event_stream_id: self.core.stream.clone(),
            resolve_link_tos: self.resolve_link_tos,
        });
        self.core
            .subscribe(correlation_id, connection, TcpCommand::SubscribeToStream, data)
    }

    fn inspect_package(&mut self, package: &TcpPackage) -> InspectionResult {
        match package.command {
            TcpCommand::SubscriptionConfirmation => {
                match messages::decode::<messages::SubscriptionConfirmation>(&package.data) {
                    Ok(message) => self.core.confirm(SubscriptionConfirmation {
                        last_commit_position: message.last_commit_position,
                        last_event_number: message.last_event_number,
                    }),
                    Err(e) => self.core.malformed(package.command, e.into()),
                }
            }
            TcpCommand::StreamEventAppeared => {
                let event = messages::decode::<messages::StreamEventAppeared>(&package.data)
                    .map_err(ClientError::from)
                    .and_then(|message| ResolvedEvent::from_all(message.event));
                match event {
                    Ok(event) => self.core.deliver(event, None),
                    Err(e) => self.core.malformed(package.command, e),
                }
            }
            _ => self
                .core
                .inspect_common(package, TcpCommand::SubscriptionConfirmation),
        }
    }

    fn drop_subscription(
        &mut self,
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
        connection: Option<&TcpPackageConnection>,
    ) {
        self.core.drop_subscription(reason, error, connection);
    }
}

// ============================================================================
// Persistent
// ============================================================================

/// Competing-consumer subscription to a server-side group.
pub(crate) struct PersistentSubscriptionOperation {
    core: SubscriptionCore,
    group: String,
    buffer_size: i32,
    subscription_id: Option<String>,
}

impl PersistentSubscriptionOperation {
    pub(crate) fn confirmation(&self) -> Task<SubscriptionConfirmation> {
        self.core.source.task()
    }
}

impl Subscription for PersistentSubscriptionOperation {
    fn description(&self) -> String {
        format!(
            "persistent subscription '{}' on '{}'",
            self.group,
            self.core.stream_name()
        )
    }

    fn subscribe(&mut self, correlation_id: Uuid, connection: &TcpPackageConnection) -> bool {
        let data = messages::encode(&messages::ConnectToPersistentSubscription {
            subscription_id: self.group.clone(),
            event_stream_id: self.core.stream.clone(),
            allowed_in_flight_messages: self.buffer_size,
        });
        self.core.subscribe(
            correlation_id,
            connection,
            TcpCommand::ConnectToPersistentSubscription,
            data,
        )
    }

    fn inspect_package(&mut self, package: &TcpPackage) -> InspectionResult {
        match package.command {
            TcpCommand::PersistentSubscriptionConfirmation => {
                let confirmation =
                    messages::decode::<messages::PersistentSubscriptionConfirmation>(&package.data);
                match confirmation {
                    Ok(message) => {
                        self.subscription_id = Some(message.subscription_id);
                        self.core.confirm(SubscriptionConfirmation {
                            last_commit_position: message.last_commit_position,
                            last_event_number: message.last_event_number,
                        })
                    }
                    Err(e) => self.core.malformed(package.command, e.into()),
                }
            }
            TcpCommand::PersistentSubscriptionStreamEventAppeared => {
                let appeared = messages::decode(&package.data)
                    .map_err(ClientError::from)
                    .and_then(|message: messages::PersistentSubscriptionStreamEventAppeared| {
                        Ok((ResolvedEvent::from_indexed(message.event)?, message.retry_count))
                    });
                match appeared {
                    Ok((event, retry_count)) => self.core.deliver(event, retry_count),
                    Err(e) => self.core.malformed(package.command, e),
                }
            }
            _ => self
                .core
                .inspect_common(package, TcpCommand::PersistentSubscriptionConfirmation),
        }
    }

    fn drop_subscription(
        &mut self,
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
        connection: Option<&TcpPackageConnection>,
    ) {
        self.core.drop_subscription(reason, error, connection);
    }

    fn processed_events_package(&self, control: &SubscriptionControl) -> Option<TcpPackage> {
        if self.core.unsubscribed {
            return None;
        }
        let subscription_id = self.subscription_id.clone()?;
        match control {
            SubscriptionControl::Ack { event_ids } => Some(self.core.package(
                TcpCommand::PersistentSubscriptionAckEvents,
                messages::encode(&messages::PersistentSubscriptionAckEvents {
                    subscription_id,
                    processed_event_ids: wire_ids(event_ids),
                }),
            )),
            SubscriptionControl::Nak {
                event_ids,
                action,
                reason,
            } => Some(self.core.package(
                TcpCommand::PersistentSubscriptionNakEvents,
                messages::encode(&messages::PersistentSubscriptionNakEvents {
                    subscription_id,
                    processed_event_ids: wire_ids(event_ids),
                    message: Some(reason.clone()),
                    action: messages::NakAction::from(*action) as i32,
                }),
            )),
            SubscriptionControl::Unsubscribe { .. } => None,
        }
    }
}

fn wire_ids(ids: &[Uuid]) -> Vec<Vec<u8>> {
    ids.iter().map(|id| id.to_bytes_le().to_vec()).collect()
}

// ============================================================================
// Handles
// ============================================================================

struct HandleShared {
    subscription_id: Uuid,
    stream: String,
    poster: Poster,
    confirmation: Task<SubscriptionConfirmation>,
    dropped: Task<DroppedSubscription>,
}

impl HandleShared {
    fn post(&self, control: SubscriptionControl) {
        self.poster.post(Message::SubscriptionControl {
            subscription_id: self.subscription_id,
            control,
        });
    }

    fn confirmed(&self) -> Option<SubscriptionConfirmation> {
        self.confirmation.peek().and_then(Result::ok)
    }

    async fn stop_and_wait(&self, timeout: Duration) -> Result<DroppedSubscription, ClientError> {
        self.post(SubscriptionControl::Unsubscribe {
            reason: SubscriptionDropReason::UserInitiated,
            error: None,
        });
        tokio::time::timeout(timeout, self.dropped.completed())
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

/// Handle side used by the delivery task.
pub(crate) trait SubscriptionHandle: Send + Sync + 'static {
    fn stop_with(&self, reason: SubscriptionDropReason, error: Option<ClientError>);
}

/// Handle to a live volatile subscription.
#[derive(Clone)]
pub struct VolatileSubscription {
    shared: Arc<HandleShared>,
}

impl VolatileSubscription {
    /// Stable id; unlike the correlation id it survives resubscription.
    pub fn subscription_id(&self) -> Uuid {
        self.shared.subscription_id
    }

    /// Subscribed stream; empty for `$all`.
    pub fn stream_id(&self) -> &str {
        &self.shared.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.shared.stream.is_empty()
    }

    pub fn last_commit_position(&self) -> Option<i64> {
        self.shared.confirmed().map(|c| c.last_commit_position)
    }

    pub fn last_event_number(&self) -> Option<i64> {
        self.shared.confirmed().and_then(|c| c.last_event_number)
    }

    /// Resolves after the drop callback has run.
    pub fn dropped(&self) -> Task<DroppedSubscription> {
        self.shared.dropped.clone()
    }

    pub fn unsubscribe(&self) {
        self.stop_with(SubscriptionDropReason::UserInitiated, None);
    }

    pub async fn unsubscribe_and_wait(
        &self,
        timeout: Duration,
    ) -> Result<DroppedSubscription, ClientError> {
        self.shared.stop_and_wait(timeout).await
    }
}

impl SubscriptionHandle for VolatileSubscription {
    fn stop_with(&self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        self.shared.post(SubscriptionControl::Unsubscribe { reason, error });
    }
}

/// Handle to a connected persistent subscription.
#[derive(Clone)]
pub struct PersistentSubscription {
    shared: Arc<HandleShared>,
    group: String,
}

impl PersistentSubscription {
    pub fn subscription_id(&self) -> Uuid {
        self.shared.subscription_id
    }

    pub fn stream_id(&self) -> &str {
        &self.shared.stream
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    pub fn dropped(&self) -> Task<DroppedSubscription> {
        self.shared.dropped.clone()
    }

    /// Acknowledges events by id.
    pub fn ack(&self, event_ids: impl IntoIterator<Item = Uuid>) -> Result<(), ClientError> {
        let event_ids = batch(event_ids)?;
        self.shared.post(SubscriptionControl::Ack { event_ids });
        Ok(())
    }

    /// Acknowledges the original event of `event`.
    pub fn ack_event(&self, event: &ResolvedEvent) -> Result<(), ClientError> {
        self.ack(event.original_event_id())
    }

    pub fn nak(
        &self,
        event_ids: impl IntoIterator<Item = Uuid>,
        action: NakAction,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        let event_ids = batch(event_ids)?;
        self.shared.post(SubscriptionControl::Nak {
            event_ids,
            action,
            reason: reason.into(),
        });
        Ok(())
    }

    pub fn nak_event(
        &self,
        event: &ResolvedEvent,
        action: NakAction,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.nak(event.original_event_id(), action, reason)
    }

    pub fn stop(&self) {
        self.stop_with(SubscriptionDropReason::UserInitiated, None);
    }

    pub async fn stop_and_wait(
        &self,
        timeout: Duration,
    ) -> Result<DroppedSubscription, ClientError> {
        self.shared.stop_and_wait(timeout).await
    }
}

impl SubscriptionHandle for PersistentSubscription {
    fn stop_with(&self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        self.shared.post(SubscriptionControl::Unsubscribe { reason, error });
    }
}

fn batch(event_ids: impl IntoIterator<Item = Uuid>) -> Result<Vec<Uuid>, ClientError> {
    let event_ids: Vec<Uuid> = event_ids.into_iter().collect();
    if event_ids.len() > MAX_ACK_BATCH {
        return Err(ClientError::InvalidArgument(format!(
            "cannot process more than {} events at once, got {}",
            MAX_ACK_BATCH,
            event_ids.len()
        )));
    }
    Ok(event_ids)
}

// ============================================================================
// Construction and delivery
// ============================================================================

pub(crate) struct SubscriptionParams {
    pub stream: String,
    pub resolve_link_tos: bool,
    pub credentials: Option<UserCredentials>,
    pub mailbox: mpsc::Sender<Message>,
    pub verbose: bool,
}

/// Builds the operation and its handle, and starts the delivery task.
pub(crate) fn volatile_subscription<E, D>(
    params: SubscriptionParams,
    mut event_appeared: E,
    subscription_dropped: D,
) -> (VolatileSubscriptionOperation, VolatileSubscription)
where
    E: FnMut(&VolatileSubscription, ResolvedEvent) -> Result<(), ClientError> + Send + 'static,
    D: FnOnce(&VolatileSubscription, SubscriptionDropReason, Option<ClientError>) + Send + 'static,
{
    let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
    let core = SubscriptionCore::new(
        params.stream.clone(),
        params.credentials,
        deliveries,
        params.verbose,
    );
    let dropped = CompletionSource::new();
    let handle = VolatileSubscription {
        shared: Arc::new(HandleShared {
            subscription_id: Uuid::new_v4(),
            stream: params.stream,
            poster: Poster::new(params.mailbox),
            confirmation: core.source.task(),
            dropped: dropped.task(),
        }),
    };
    let operation = VolatileSubscriptionOperation {
        core,
        resolve_link_tos: params.resolve_link_tos,
    };

    spawn_delivery(
        handle.clone(),
        deliveries_rx,
        move |subscription: &VolatileSubscription, event, _| event_appeared(subscription, event),
        subscription_dropped,
        dropped,
    );
    (operation, handle)
}

/// Like [`volatile_subscription`]; with `auto_ack` every event the handler
/// accepts is acknowledged.
pub(crate) fn persistent_subscription<E, D>(
    params: SubscriptionParams,
    group: String,
    buffer_size: i32,
    auto_ack: bool,
    mut event_appeared: E,
    subscription_dropped: D,
) -> (PersistentSubscriptionOperation, PersistentSubscription)
where
    E: FnMut(&PersistentSubscription, ResolvedEvent, Option<i32>) -> Result<(), ClientError>
        + Send
        + 'static,
    D: FnOnce(&PersistentSubscription, SubscriptionDropReason, Option<ClientError>)
        + Send
        + 'static,
{
    let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
    let core = SubscriptionCore::new(
        params.stream.clone(),
        params.credentials,
        deliveries,
        params.verbose,
    );
    let dropped = CompletionSource::new();
    let handle = PersistentSubscription {
        shared: Arc::new(HandleShared {
            subscription_id: Uuid::new_v4(),
            stream: params.stream,
            poster: Poster::new(params.mailbox),
            confirmation: core.source.task(),
            dropped: dropped.task(),
        }),
        group: group.clone(),
    };
    let operation = PersistentSubscriptionOperation {
        core,
        group,
        buffer_size,
        subscription_id: None,
    };

    spawn_delivery(
        handle.clone(),
        deliveries_rx,
        move |subscription: &PersistentSubscription, event: ResolvedEvent, retry_count| {
            let event_id = event.original_event_id();
            event_appeared(subscription, event, retry_count)?;
            if auto_ack {
                subscription.ack(event_id)?;
            }
            Ok(())
        },
        subscription_dropped,
        dropped,
    );
    (operation, handle)
}

fn spawn_delivery<S, E, D>(
    subscription: S,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut event_appeared: E,
    subscription_dropped: D,
    dropped: CompletionSource<DroppedSubscription>,
) where
    S: SubscriptionHandle,
    E: FnMut(&S, ResolvedEvent, Option<i32>) -> Result<(), ClientError> + Send + 'static,
    D: FnOnce(&S, SubscriptionDropReason, Option<ClientError>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut failed = false;
        while let Some(delivery) = deliveries.recv().await {
            match delivery {
                Delivery::Event { event, retry_count } => {
                    if failed {
                        continue;
                    }
                    let outcome = run_handler(|| event_appeared(&subscription, event, retry_count));
                    if let Err(e) = outcome {
                        tracing::warn!("Subscription event handler failed: {}", e);
                        failed = true;
                        subscription
                            .stop_with(SubscriptionDropReason::EventHandlerException, Some(e));
                    }
                }
                Delivery::Dropped { reason, error } => {
                    subscription_dropped(&subscription, reason, error.clone());
                    dropped.try_set_result(DroppedSubscription { reason, error });
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbound;
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:1113".parse().unwrap()
    }

    fn params(stream: &str) -> (SubscriptionParams, mpsc::Receiver<Message>) {
        let (mailbox, mailbox_rx) = mpsc::channel(16);
        let params = SubscriptionParams {
            stream: stream.to_string(),
            resolve_link_tos: false,
            credentials: None,
            mailbox,
            verbose: false,
        };
        (params, mailbox_rx)
    }

    fn record(stream: &str, number: i64) -> messages::EventRecord {
        messages::EventRecord {
            event_stream_id: stream.to_string(),
            event_number: number,
            event_id: Uuid::new_v4().to_bytes_le().to_vec(),
            event_type: "Created".to_string(),
            data_content_type: 0,
            metadata_content_type: 0,
            data: Bytes::from_static(b"x"),
            metadata: None,
            created: None,
            created_epoch: None,
        }
    }

    fn package<M: prost::Message>(
        command: TcpCommand,
        correlation_id: Uuid,
        message: &M,
    ) -> TcpPackage {
        TcpPackage::new(command, correlation_id, messages::encode(message))
    }

    fn confirmation(correlation_id: Uuid) -> TcpPackage {
        package(
            TcpCommand::SubscriptionConfirmation,
            correlation_id,
            &messages::SubscriptionConfirmation {
                last_commit_position: 100,
                last_event_number: Some(7),
            },
        )
    }

    fn appeared(correlation_id: Uuid, number: i64) -> TcpPackage {
        package(
            TcpCommand::StreamEventAppeared,
            correlation_id,
            &messages::StreamEventAppeared {
                event: messages::ResolvedEvent {
                    event: Some(record("S", number)),
                    link: None,
                    commit_position: 200 + number,
                    prepare_position: 200 + number,
                },
            },
        )
    }

    fn sent(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> TcpPackage {
        match outbound.try_recv() {
            Ok(Outbound::Package(package)) => package,
            other => panic!("expected a package, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_volatile_confirm_and_deliver_in_order() {
        let (params, _mailbox) = params("S");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let (mut op, handle) = volatile_subscription(
            params,
            move |_, event| {
                recorded.lock().push(event.original_event_number().unwrap());
                Ok(())
            },
            |_, _, _| {},
        );

        let (connection, mut outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        assert!(op.subscribe(correlation_id, &connection));
        let request = sent(&mut outbound);
        assert_eq!(request.command, TcpCommand::SubscribeToStream);
        assert_eq!(request.correlation_id, correlation_id);

        let result = op.inspect_package(&confirmation(correlation_id));
        assert_eq!(result.decision, InspectionDecision::Subscribed);
        let confirmed = op.confirmation().completed().await.unwrap();
        assert_eq!(confirmed.last_event_number, Some(7));
        assert_eq!(handle.last_commit_position(), Some(100));

        for number in 0..3 {
            let result = op.inspect_package(&appeared(correlation_id, number));
            assert_eq!(result.decision, InspectionDecision::DoNothing);
        }

        op.drop_subscription(SubscriptionDropReason::UserInitiated, None, Some(&connection));
        let dropped = handle.dropped().completed().await.unwrap();
        assert_eq!(dropped.reason, SubscriptionDropReason::UserInitiated);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(sent(&mut outbound).command, TcpCommand::UnsubscribeFromStream);
    }

    #[tokio::test]
    async fn test_access_denied_before_confirmation() {
        let (params, _mailbox) = params("secret");
        let dropped_called = Arc::new(Mutex::new(false));
        let flag = dropped_called.clone();
        let (mut op, _handle) = volatile_subscription(params, |_, _| Ok(()), move |_, _, _| {
            *flag.lock() = true;
        });
        let (connection, _outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        op.subscribe(correlation_id, &connection);

        let result = op.inspect_package(&package(
            TcpCommand::SubscriptionDropped,
            correlation_id,
            &messages::SubscriptionDropped {
                reason: Some(WireDropReason::AccessDenied as i32),
            },
        ));
        assert_eq!(result.decision, InspectionDecision::EndOperation);
        assert!(matches!(
            op.confirmation().completed().await,
            Err(ClientError::AccessDenied(_))
        ));
        assert!(!op.subscribe(Uuid::new_v4(), &connection));
        tokio::task::yield_now().await;
        assert!(!*dropped_called.lock());
    }

    #[tokio::test]
    async fn test_drop_happens_once() {
        let (params, _mailbox) = params("S");
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let (mut op, handle) = volatile_subscription(params, |_, _| Ok(()), move |_, _, _| {
            *counter.lock() += 1;
        });
        let (connection, _outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        op.subscribe(correlation_id, &connection);
        op.inspect_package(&confirmation(correlation_id));

        op.connection_closed();
        op.drop_subscription(SubscriptionDropReason::ServerError, None, None);
        let dropped = handle.dropped().completed().await.unwrap();
        assert_eq!(dropped.reason, SubscriptionDropReason::ConnectionClosed);
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn test_not_handled_retries_until_confirmed() {
        let (params, _mailbox) = params("S");
        let (mut op, _handle) = volatile_subscription(params, |_, _| Ok(()), |_, _, _| {});
        let not_handled = package(
            TcpCommand::NotHandled,
            Uuid::new_v4(),
            &messages::NotHandled {
                reason: messages::NotHandledReason::TooBusy as i32,
                additional_info: None,
            },
        );
        assert_eq!(op.inspect_package(&not_handled).decision, InspectionDecision::Retry);

        let (connection, _outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        op.subscribe(correlation_id, &connection);
        op.inspect_package(&confirmation(correlation_id));
        assert_eq!(
            op.inspect_package(&not_handled).decision,
            InspectionDecision::EndOperation
        );
    }

    #[tokio::test]
    async fn test_handler_error_requests_drop() {
        let (params, mut mailbox) = params("S");
        let (mut op, _handle) = volatile_subscription(
            params,
            |_, _| Err(ClientError::EventHandler("boom".to_string())),
            |_, _, _| {},
        );
        let (connection, _outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        op.subscribe(correlation_id, &connection);
        op.inspect_package(&confirmation(correlation_id));
        op.inspect_package(&appeared(correlation_id, 0));

        match mailbox.recv().await {
            Some(Message::SubscriptionControl {
                control: SubscriptionControl::Unsubscribe { reason, error },
                ..
            }) => {
                assert_eq!(reason, SubscriptionDropReason::EventHandlerException);
                assert!(matches!(error, Some(ClientError::EventHandler(_))));
            }
            _ => panic!("expected an unsubscribe request"),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_requests_drop() {
        let (params, mut mailbox) = params("S");
        let (mut op, _handle) = volatile_subscription(
            params,
            |_, event: ResolvedEvent| -> Result<(), ClientError> {
                panic!("cannot handle {:?}", event.original_event_number())
            },
            |_, _, _| {},
        );
        let (connection, _outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        op.subscribe(correlation_id, &connection);
        op.inspect_package(&confirmation(correlation_id));
        op.inspect_package(&appeared(correlation_id, 4));

        match mailbox.recv().await {
            Some(Message::SubscriptionControl {
                control: SubscriptionControl::Unsubscribe { reason, error },
                ..
            }) => {
                assert_eq!(reason, SubscriptionDropReason::EventHandlerException);
                match error {
                    Some(ClientError::EventHandler(message)) => {
                        assert_eq!(message, "cannot handle Some(4)")
                    }
                    other => panic!("unexpected error {:?}", other),
                }
            }
            _ => panic!("expected an unsubscribe request"),
        }
    }

    #[tokio::test]
    async fn test_persistent_ack_limits_and_packages() {
        let (params, mut mailbox) = params("orders");
        let (mut op, handle) = persistent_subscription(
            params,
            "workers".to_string(),
            10,
            false,
            |_, _, _| Ok(()),
            |_, _, _| {},
        );

        let too_many: Vec<Uuid> = (0..MAX_ACK_BATCH + 1).map(|_| Uuid::new_v4()).collect();
        assert!(matches!(handle.ack(too_many), Err(ClientError::InvalidArgument(_))));

        let id = Uuid::new_v4();
        handle.ack([id]).unwrap();
        let control = match mailbox.recv().await {
            Some(Message::SubscriptionControl { control, subscription_id }) => {
                assert_eq!(subscription_id, handle.subscription_id());
                control
            }
            _ => panic!("expected an ack request"),
        };

        // Nothing to acknowledge against before the server confirms.
        assert!(op.processed_events_package(&control).is_none());

        let (connection, mut outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        op.subscribe(correlation_id, &connection);
        let request = sent(&mut outbound);
        let connect: messages::ConnectToPersistentSubscription =
            messages::decode(&request.data).unwrap();
        assert_eq!(connect.subscription_id, "workers");
        assert_eq!(connect.allowed_in_flight_messages, 10);

        op.inspect_package(&package(
            TcpCommand::PersistentSubscriptionConfirmation,
            correlation_id,
            &messages::PersistentSubscriptionConfirmation {
                last_commit_position: 5,
                subscription_id: "orders::workers".to_string(),
                last_event_number: None,
            },
        ));
        let ack = op.processed_events_package(&control).unwrap();
        assert_eq!(ack.command, TcpCommand::PersistentSubscriptionAckEvents);
        assert_eq!(ack.correlation_id, correlation_id);
        let ack: messages::PersistentSubscriptionAckEvents = messages::decode(&ack.data).unwrap();
        assert_eq!(ack.subscription_id, "orders::workers");
        assert_eq!(ack.processed_event_ids, vec![id.to_bytes_le().to_vec()]);

        let nak = op
            .processed_events_package(&SubscriptionControl::Nak {
                event_ids: vec![id],
                action: NakAction::Park,
                reason: "poison".to_string(),
            })
            .unwrap();
        let nak: messages::PersistentSubscriptionNakEvents = messages::decode(&nak.data).unwrap();
        assert_eq!(nak.action, messages::NakAction::Park as i32);
        assert_eq!(nak.message.as_deref(), Some("poison"));
    }

    #[tokio::test]
    async fn test_persistent_auto_ack() {
        let (params, mut mailbox) = params("orders");
        let (mut op, _handle) = persistent_subscription(
            params,
            "workers".to_string(),
            10,
            true,
            |_, _, retry_count| {
                assert_eq!(retry_count, Some(2));
                Ok(())
            },
            |_, _, _| {},
        );
        let (connection, _outbound) = TcpPackageConnection::detached(endpoint());
        let correlation_id = Uuid::new_v4();
        op.subscribe(correlation_id, &connection);
        op.inspect_package(&package(
            TcpCommand::PersistentSubscriptionConfirmation,
            correlation_id,
            &messages::PersistentSubscriptionConfirmation {
                last_commit_position: 5,
                subscription_id: "orders::workers".to_string(),
                last_event_number: None,
            },
        ));

        let event = record("orders", 3);
        let event_id = Uuid::from_bytes_le(event.event_id.clone().try_into().unwrap());
        op.inspect_package(&package(
            TcpCommand::PersistentSubscriptionStreamEventAppeared,
            correlation_id,
            &messages::PersistentSubscriptionStreamEventAppeared {
                event: messages::ResolvedIndexedEvent {
                    event: Some(event),
                    link: None,
                },
                retry_count: Some(2),
            },
        ));

        match mailbox.recv().await {
            Some(Message::SubscriptionControl {
                control: SubscriptionControl::Ack { event_ids },
                ..
            }) => assert_eq!(event_ids, vec![event_id]),
            _ => panic!("expected an ack request"),
        }
    }
}
