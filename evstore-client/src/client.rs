//! High-level client API.

use crate::catchup::{self, CatchUpSubscription, CatchUpTarget};
use crate::config::{ClientConfig, ConnectionSettings};
use crate::connection::{self, ClientEvent, Message};
use crate::discovery::{EndPointDiscoverer, NodeEndPoints, StaticEndPointDiscoverer};
use crate::error::ClientError;
use crate::operations::{
    AppendToStream, CommitTransaction, CreatePersistentSubscription, DeletePersistentSubscription,
    DeleteStream, OperationBase, OperationKind, ReadAllEvents, ReadEvent, ReadStreamEvents,
    StartTransaction, TransactionalWrite, UpdatePersistentSubscription,
};
use crate::subscriptions::{
    persistent_subscription, volatile_subscription, PersistentSubscription, SubscriptionParams,
    VolatileSubscription,
};
use crate::task::{CompletionSource, Task};
use crate::types::{
    AllEventsSlice, CatchUpSubscriptionSettings, DeleteResult, EventData, EventReadResult,
    ExpectedVersion, PersistentSubscriptionSettings, Position, ReadDirection, ResolvedEvent,
    StreamEventsSlice, SubscriptionDropReason, WriteResult,
};
use evstore_protocol::UserCredentials;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Largest page a single read may request.
pub const MAX_READ_SIZE: i32 = 4096;

/// Default number of in-flight messages for persistent subscriptions.
pub const DEFAULT_PERSISTENT_BUFFER_SIZE: i32 = 10;

struct ClientInner {
    mailbox: mpsc::Sender<Message>,
    events: broadcast::Sender<ClientEvent>,
    settings: ConnectionSettings,
}

/// Handle to one logical connection.
///
/// Cheap to clone. The connection closes on [`Client::close`], or once the
/// last clone is dropped and no subscription is running.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    credentials: Option<UserCredentials>,
}

impl Client {
    /// Creates a client that resolves its node through `discoverer`.
    ///
    /// Must be called inside a Tokio runtime. Call [`Client::connect`] to start.
    pub fn new(
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndPointDiscoverer>,
    ) -> Result<Self, ClientError> {
        settings
            .validate()
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
        let handle = connection::spawn(settings.clone(), discoverer);
        Ok(Self {
            inner: Arc::new(ClientInner {
                mailbox: handle.mailbox,
                events: handle.events,
                settings,
            }),
            credentials: None,
        })
    }

    /// Creates a client for the single node named in `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let secure = config
            .secure_endpoint
            .or_else(|| config.connection.tls.enabled.then_some(config.endpoint));
        let endpoints = NodeEndPoints::new(config.endpoint, secure);
        Self::new(
            config.connection.clone(),
            Arc::new(StaticEndPointDiscoverer::new(endpoints)),
        )
    }

    /// Returns a handle that sends `credentials` with every request.
    pub fn with_credentials(&self, credentials: UserCredentials) -> Self {
        Self {
            inner: self.inner.clone(),
            credentials: Some(credentials),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Subscribes to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Starts connecting; resolves once the node endpoint is known.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let result = CompletionSource::new();
        let task = result.task();
        self.send(Message::StartConnection { result }).await?;
        task.await
    }

    /// Closes the connection for good.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.send(Message::CloseConnection {
            reason: "Connection close requested by client.".to_string(),
            error: None,
        })
        .await
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.inner
            .mailbox
            .send(message)
            .await
            .map_err(|_| ClientError::connection_closed("connection actor stopped"))
    }

    async fn start_operation<K: OperationKind>(
        &self,
        kind: K,
    ) -> Result<Task<K::Output>, ClientError> {
        let operation = OperationBase::new(kind, self.credentials.clone());
        let task = operation.task();
        self.send(Message::StartOperation {
            operation: Box::new(operation),
            max_retries: self.inner.settings.max_retries,
            timeout: self.inner.settings.operation_timeout,
        })
        .await?;
        Ok(task)
    }

    async fn run_operation<K: OperationKind>(&self, kind: K) -> Result<K::Output, ClientError> {
        self.start_operation(kind).await?.await
    }

    fn require_master(&self) -> bool {
        self.inner.settings.require_master
    }

    fn subscription_params(&self, stream: String, resolve_link_tos: bool) -> SubscriptionParams {
        SubscriptionParams {
            stream,
            resolve_link_tos,
            credentials: self.credentials.clone(),
            mailbox: self.inner.mailbox.clone(),
            verbose: self.inner.settings.verbose_logging,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends events to a stream.
    pub async fn append_to_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: impl IntoIterator<Item = EventData>,
    ) -> Result<WriteResult, ClientError> {
        require_stream(stream)?;
        self.run_operation(AppendToStream {
            stream: stream.to_string(),
            expected_version,
            events: events.into_iter().collect(),
            require_master: self.require_master(),
        })
        .await
    }

    /// Deletes a stream; a hard delete also forbids recreating it.
    pub async fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<DeleteResult, ClientError> {
        require_stream(stream)?;
        self.run_operation(DeleteStream {
            stream: stream.to_string(),
            expected_version,
            hard_delete,
            require_master: self.require_master(),
        })
        .await
    }

    /// Starts a multi-request write transaction on a stream.
    pub async fn start_transaction(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> Result<Transaction, ClientError> {
        require_stream(stream)?;
        let started = self
            .start_operation(StartTransaction {
                stream: stream.to_string(),
                expected_version,
                require_master: self.require_master(),
            })
            .await?;
        let client = self.clone();
        started
            .continue_with(move |started| Ok(Transaction::new(started.result()?, client)))
            .await
    }

    /// Resumes a transaction started elsewhere.
    pub fn continue_transaction(&self, transaction_id: i64) -> Transaction {
        Transaction::new(transaction_id, self.clone())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn read_event(
        &self,
        stream: &str,
        event_number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult, ClientError> {
        require_stream(stream)?;
        if event_number < -1 {
            return Err(ClientError::InvalidArgument(format!(
                "event number {} is out of range",
                event_number
            )));
        }
        self.run_operation(ReadEvent {
            stream: stream.to_string(),
            event_number,
            resolve_link_tos,
            require_master: self.require_master(),
        })
        .await
    }

    pub async fn read_stream_events_forward(
        &self,
        stream: &str,
        start: i64,
        count: i32,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, ClientError> {
        self.read_stream_events(stream, start, count, ReadDirection::Forward, resolve_link_tos)
            .await
    }

    pub async fn read_stream_events_backward(
        &self,
        stream: &str,
        start: i64,
        count: i32,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, ClientError> {
        self.read_stream_events(stream, start, count, ReadDirection::Backward, resolve_link_tos)
            .await
    }

    async fn read_stream_events(
        &self,
        stream: &str,
        start: i64,
        count: i32,
        direction: ReadDirection,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, ClientError> {
        require_stream(stream)?;
        require_count(count)?;
        if direction == ReadDirection::Forward && start < 0 {
            return Err(ClientError::InvalidArgument(format!(
                "forward reads must start at a non-negative event number, got {}",
                start
            )));
        }
        self.run_operation(ReadStreamEvents {
            stream: stream.to_string(),
            from_event_number: start,
            max_count: count,
            direction,
            resolve_link_tos,
            require_master: self.require_master(),
        })
        .await
    }

    pub async fn read_all_events_forward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, ClientError> {
        self.read_all_events(position, max_count, ReadDirection::Forward, resolve_link_tos)
            .await
    }

    pub async fn read_all_events_backward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, ClientError> {
        self.read_all_events(position, max_count, ReadDirection::Backward, resolve_link_tos)
            .await
    }

    async fn read_all_events(
        &self,
        position: Position,
        max_count: i32,
        direction: ReadDirection,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, ClientError> {
        require_count(max_count)?;
        self.run_operation(ReadAllEvents {
            position,
            max_count,
            direction,
            resolve_link_tos,
            require_master: self.require_master(),
        })
        .await
    }

    // =========================================================================
    // Persistent subscription groups
    // =========================================================================

    pub async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        require_group(stream, group)?;
        self.run_operation(CreatePersistentSubscription {
            stream: stream.to_string(),
            group: group.to_string(),
            settings,
        })
        .await
    }

    pub async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        require_group(stream, group)?;
        self.run_operation(UpdatePersistentSubscription {
            stream: stream.to_string(),
            group: group.to_string(),
            settings,
        })
        .await
    }

    pub async fn delete_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<(), ClientError> {
        require_group(stream, group)?;
        self.run_operation(DeletePersistentSubscription {
            stream: stream.to_string(),
            group: group.to_string(),
        })
        .await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes to live events of one stream.
    ///
    /// Resolves once the server confirms. Callbacks run in order on a task
    /// of their own; an `Err` from `event_appeared` drops the subscription.
    pub async fn subscribe_to_stream<E, D>(
        &self,
        stream: &str,
        resolve_link_tos: bool,
        event_appeared: E,
        subscription_dropped: D,
    ) -> Result<VolatileSubscription, ClientError>
    where
        E: FnMut(&VolatileSubscription, ResolvedEvent) -> Result<(), ClientError> + Send + 'static,
        D: FnOnce(&VolatileSubscription, SubscriptionDropReason, Option<ClientError>)
            + Send
            + 'static,
    {
        require_stream(stream)?;
        self.subscribe_volatile(
            stream.to_string(),
            resolve_link_tos,
            event_appeared,
            subscription_dropped,
        )
        .await
    }

    /// Subscribes to live events of every stream.
    pub async fn subscribe_to_all<E, D>(
        &self,
        resolve_link_tos: bool,
        event_appeared: E,
        subscription_dropped: D,
    ) -> Result<VolatileSubscription, ClientError>
    where
        E: FnMut(&VolatileSubscription, ResolvedEvent) -> Result<(), ClientError> + Send + 'static,
        D: FnOnce(&VolatileSubscription, SubscriptionDropReason, Option<ClientError>)
            + Send
            + 'static,
    {
        self.subscribe_volatile(
            String::new(),
            resolve_link_tos,
            event_appeared,
            subscription_dropped,
        )
        .await
    }

    pub(crate) async fn subscribe_volatile<E, D>(
        &self,
        stream: String,
        resolve_link_tos: bool,
        event_appeared: E,
        subscription_dropped: D,
    ) -> Result<VolatileSubscription, ClientError>
    where
        E: FnMut(&VolatileSubscription, ResolvedEvent) -> Result<(), ClientError> + Send + 'static,
        D: FnOnce(&VolatileSubscription, SubscriptionDropReason, Option<ClientError>)
            + Send
            + 'static,
    {
        let (operation, handle) = volatile_subscription(
            self.subscription_params(stream, resolve_link_tos),
            event_appeared,
            subscription_dropped,
        );
        let confirmation = operation.confirmation();
        self.send(Message::StartSubscription {
            subscription: Box::new(operation),
            subscription_id: handle.subscription_id(),
            max_retries: self.inner.settings.max_retries,
            timeout: self.inner.settings.operation_timeout,
        })
        .await?;
        confirmation.await?;
        Ok(handle)
    }

    /// Joins a persistent subscription group.
    ///
    /// `buffer_size` caps the messages in flight and defaults to
    /// [`DEFAULT_PERSISTENT_BUFFER_SIZE`]. With `auto_ack` every event
    /// `event_appeared` accepts is acknowledged; otherwise use
    /// [`PersistentSubscription::ack`].
    #[allow(clippy::too_many_arguments)]
    pub async fn connect_to_persistent_subscription<E, D>(
        &self,
        stream: &str,
        group: &str,
        buffer_size: Option<i32>,
        auto_ack: bool,
        event_appeared: E,
        subscription_dropped: D,
    ) -> Result<PersistentSubscription, ClientError>
    where
        E: FnMut(&PersistentSubscription, ResolvedEvent, Option<i32>) -> Result<(), ClientError>
            + Send
            + 'static,
        D: FnOnce(&PersistentSubscription, SubscriptionDropReason, Option<ClientError>)
            + Send
            + 'static,
    {
        require_group(stream, group)?;
        let buffer_size = buffer_size.unwrap_or(DEFAULT_PERSISTENT_BUFFER_SIZE);
        if buffer_size < 1 {
            return Err(ClientError::InvalidArgument(format!(
                "buffer size must be positive, got {}",
                buffer_size
            )));
        }
        let (operation, handle) = persistent_subscription(
            self.subscription_params(stream.to_string(), false),
            group.to_string(),
            buffer_size,
            auto_ack,
            event_appeared,
            subscription_dropped,
        );
        let confirmation = operation.confirmation();
        self.send(Message::StartPersistentSubscription {
            subscription: Box::new(operation),
            subscription_id: handle.subscription_id(),
            max_retries: self.inner.settings.max_retries,
            timeout: self.inner.settings.operation_timeout,
        })
        .await?;
        confirmation.await?;
        Ok(handle)
    }

    /// Delivers every event of `stream` after `last_checkpoint`, then keeps
    /// following it live.
    ///
    /// Returns immediately; reading happens in the background.
    pub fn subscribe_to_stream_from<E, L, D>(
        &self,
        stream: &str,
        last_checkpoint: Option<i64>,
        settings: CatchUpSubscriptionSettings,
        event_appeared: E,
        live_processing_started: L,
        subscription_dropped: D,
    ) -> Result<CatchUpSubscription, ClientError>
    where
        E: FnMut(&CatchUpSubscription, ResolvedEvent) -> Result<(), ClientError> + Send + 'static,
        L: FnOnce(&CatchUpSubscription) + Send + 'static,
        D: FnOnce(&CatchUpSubscription, SubscriptionDropReason, Option<ClientError>)
            + Send
            + 'static,
    {
        require_stream(stream)?;
        Ok(catchup::start(
            self.clone(),
            CatchUpTarget::stream(stream, last_checkpoint),
            settings,
            Box::new(event_appeared),
            Box::new(live_processing_started),
            Box::new(subscription_dropped),
        ))
    }

    /// Like [`Client::subscribe_to_stream_from`], over `$all`.
    pub fn subscribe_to_all_from<E, L, D>(
        &self,
        last_checkpoint: Option<Position>,
        settings: CatchUpSubscriptionSettings,
        event_appeared: E,
        live_processing_started: L,
        subscription_dropped: D,
    ) -> CatchUpSubscription
    where
        E: FnMut(&CatchUpSubscription, ResolvedEvent) -> Result<(), ClientError> + Send + 'static,
        L: FnOnce(&CatchUpSubscription) + Send + 'static,
        D: FnOnce(&CatchUpSubscription, SubscriptionDropReason, Option<ClientError>)
            + Send
            + 'static,
    {
        catchup::start(
            self.clone(),
            CatchUpTarget::all(last_checkpoint),
            settings,
            Box::new(event_appeared),
            Box::new(live_processing_started),
            Box::new(subscription_dropped),
        )
    }
}

fn require_stream(stream: &str) -> Result<(), ClientError> {
    if stream.is_empty() {
        return Err(ClientError::InvalidArgument("stream name must not be empty".to_string()));
    }
    Ok(())
}

fn require_count(count: i32) -> Result<(), ClientError> {
    if !(1..=MAX_READ_SIZE).contains(&count) {
        return Err(ClientError::InvalidArgument(format!(
            "count must be between 1 and {}, got {}",
            MAX_READ_SIZE, count
        )));
    }
    Ok(())
}

fn require_group(stream: &str, group: &str) -> Result<(), ClientError> {
    require_stream(stream)?;
    if group.is_empty() {
        return Err(ClientError::InvalidArgument("group name must not be empty".to_string()));
    }
    Ok(())
}

/// A write transaction; nothing becomes visible until [`Transaction::commit`].
#[derive(Clone)]
pub struct Transaction {
    transaction_id: i64,
    client: Client,
}

impl Transaction {
    fn new(transaction_id: i64, client: Client) -> Self {
        Self {
            transaction_id,
            client,
        }
    }

    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    pub async fn write(
        &self,
        events: impl IntoIterator<Item = EventData>,
    ) -> Result<(), ClientError> {
        self.client
            .run_operation(TransactionalWrite {
                transaction_id: self.transaction_id,
                events: events.into_iter().collect(),
                require_master: self.client.require_master(),
            })
            .await
    }

    pub async fn commit(self) -> Result<WriteResult, ClientError> {
        self.client
            .run_operation(CommitTransaction {
                transaction_id: self.transaction_id,
                require_master: self.client.require_master(),
            })
            .await
    }

    /// Abandons the transaction; the server discards uncommitted writes.
    pub fn rollback(self) {
        tracing::debug!("Transaction {} rolled back", self.transaction_id);
    }
}
