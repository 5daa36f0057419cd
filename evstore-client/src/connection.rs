//! Connection actor.
//!
//! One task owns the socket, both managers and every timer. Everything else
//! talks to it through [`Message`]s on a bounded mailbox, so no connection
//! state is ever shared behind a lock.

use crate::config::ConnectionSettings;
use crate::discovery::{EndPointDiscoverer, NodeEndPoints};
use crate::error::ClientError;
use crate::operations::{lossy_message, InspectionDecision, InspectionResult, Operation};
use crate::operations_manager::OperationsManager;
use crate::subscriptions::{Subscription, SubscriptionControl};
use crate::subscriptions_manager::SubscriptionsManager;
use crate::task::CompletionSource;
use crate::transport::{TcpPackageConnection, TransportEvent};
use crate::types::SubscriptionDropReason;
use bytes::Bytes;
use evstore_protocol::{TcpCommand, TcpPackage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Period of the actor's timer.
pub const TIMER_PERIOD: Duration = Duration::from_millis(200);

/// Capacity of the client event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the connection actor reacts to.
pub enum Message {
    StartConnection {
        result: CompletionSource<()>,
    },
    CloseConnection {
        reason: String,
        error: Option<ClientError>,
    },
    StartOperation {
        operation: Box<dyn Operation>,
        max_retries: i32,
        timeout: Duration,
    },
    StartSubscription {
        subscription: Box<dyn Subscription>,
        subscription_id: Uuid,
        max_retries: i32,
        timeout: Duration,
    },
    StartPersistentSubscription {
        subscription: Box<dyn Subscription>,
        subscription_id: Uuid,
        max_retries: i32,
        timeout: Duration,
    },
    SubscriptionControl {
        subscription_id: Uuid,
        control: SubscriptionControl,
    },
    EstablishTcpConnection {
        endpoints: NodeEndPoints,
    },
    TcpConnectionEstablished {
        connection_id: Uuid,
    },
    TcpConnectionError {
        connection_id: Uuid,
        error: ClientError,
    },
    TcpConnectionClosed {
        connection_id: Uuid,
        reason: String,
    },
    HandleIncomingPackage {
        connection_id: Uuid,
        package: TcpPackage,
    },
    TimerTick,
}

impl From<TransportEvent> for Message {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Established { connection_id } => {
                Message::TcpConnectionEstablished { connection_id }
            }
            TransportEvent::Package {
                connection_id,
                package,
            } => Message::HandleIncomingPackage {
                connection_id,
                package,
            },
            TransportEvent::Error {
                connection_id,
                error,
            } => Message::TcpConnectionError {
                connection_id,
                error,
            },
            TransportEvent::Closed {
                connection_id,
                reason,
            } => Message::TcpConnectionClosed {
                connection_id,
                reason,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Closed,
}

/// Sub-state while [`ConnectionState::Connecting`]; ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectingPhase {
    Invalid,
    Reconnecting,
    EndPointDiscovery,
    ConnectionEstablishing,
    Authentication,
    Connected,
}

/// Lifecycle notifications broadcast to every interested receiver.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { remote_endpoint: SocketAddr },
    Disconnected { remote_endpoint: SocketAddr },
    Reconnecting,
    Closed { reason: String },
    ErrorOccurred { error: ClientError },
    AuthenticationFailed { reason: String },
}

/// Non-blocking, order-preserving sender into the actor's mailbox.
///
/// One forwarding task drains the posted messages into the bounded mailbox,
/// so they reach the actor in posting order even while the mailbox is full.
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub(crate) struct Poster {
    queue: mpsc::UnboundedSender<Message>,
}

impl Poster {
    pub(crate) fn new(mailbox: mpsc::Sender<Message>) -> Self {
        let (queue, mut posted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = posted.recv().await {
                if mailbox.send(message).await.is_err() {
                    tracing::debug!("Connection actor is gone, discarding posted messages");
                    break;
                }
            }
        });
        Self { queue }
    }

    /// Queues `message` without awaiting, for callers that cannot block.
    pub(crate) fn post(&self, message: Message) {
        if self.queue.send(message).is_err() {
            tracing::debug!("Connection actor is gone, message discarded");
        }
    }
}

/// Mailbox and event channel of a running actor.
pub(crate) struct ActorHandle {
    pub mailbox: mpsc::Sender<Message>,
    pub events: broadcast::Sender<ClientEvent>,
}

/// Starts the actor and its timer.
///
/// The actor only keeps a weak reference to its own mailbox; it closes the
/// connection and stops once every external sender is gone.
pub(crate) fn spawn(
    settings: ConnectionSettings,
    discoverer: Arc<dyn EndPointDiscoverer>,
) -> ActorHandle {
    let (mailbox, mailbox_rx) = mpsc::channel(settings.max_queue_size.max(1));
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let actor = ConnectionActor::new(settings, discoverer, mailbox.downgrade(), events.clone());
    tokio::spawn(actor.run(mailbox_rx));

    let ticker = mailbox.downgrade();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TIMER_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(mailbox) = ticker.upgrade() else {
                break;
            };
            // A full mailbox skips a tick; the next one catches up.
            if let Err(TrySendError::Closed(_)) = mailbox.try_send(Message::TimerTick) {
                break;
            }
        }
    });

    ActorHandle { mailbox, events }
}

struct ReconnectionInfo {
    attempt: i32,
    timestamp: Instant,
}

struct HeartbeatInfo {
    last_package_number: u64,
    interval_stage: bool,
    timestamp: Instant,
}

struct AuthInfo {
    correlation_id: Uuid,
    timestamp: Instant,
}

struct ConnectionActor {
    settings: ConnectionSettings,
    discoverer: Arc<dyn EndPointDiscoverer>,
    mailbox: mpsc::WeakSender<Message>,
    events: broadcast::Sender<ClientEvent>,
    state: ConnectionState,
    phase: ConnectingPhase,
    connection: Option<TcpPackageConnection>,
    last_endpoint: Option<SocketAddr>,
    operations: OperationsManager,
    subscriptions: SubscriptionsManager,
    reconnection: ReconnectionInfo,
    heartbeat: HeartbeatInfo,
    auth: Option<AuthInfo>,
    last_timeout_check: Option<Instant>,
    package_number: u64,
    was_connected: bool,
}

impl ConnectionActor {
    fn new(
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndPointDiscoverer>,
        mailbox: mpsc::WeakSender<Message>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            operations: OperationsManager::new(&settings),
            subscriptions: SubscriptionsManager::new(&settings),
            settings,
            discoverer,
            mailbox,
            events,
            state: ConnectionState::Init,
            phase: ConnectingPhase::Invalid,
            connection: None,
            last_endpoint: None,
            reconnection: ReconnectionInfo {
                attempt: 0,
                timestamp: now,
            },
            heartbeat: HeartbeatInfo {
                last_package_number: 0,
                interval_stage: true,
                timestamp: now,
            },
            auth: None,
            last_timeout_check: None,
            package_number: 0,
            was_connected: false,
        }
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<Message>) {
        while let Some(message) = mailbox.recv().await {
            self.handle(message);
        }
        self.close_connection("client dropped", None);
        tracing::debug!("Connection actor stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::StartConnection { result } => self.start_connection(result),
            Message::CloseConnection { reason, error } => self.close_connection(&reason, error),
            Message::StartOperation {
                operation,
                max_retries,
                timeout,
            } => self.start_operation(operation, max_retries, timeout),
            Message::StartSubscription {
                subscription,
                subscription_id,
                max_retries,
                timeout,
            }
            | Message::StartPersistentSubscription {
                subscription,
                subscription_id,
                max_retries,
                timeout,
            } => self.start_subscription(subscription, subscription_id, max_retries, timeout),
            Message::SubscriptionControl {
                subscription_id,
                control,
            } => self.subscription_control(subscription_id, control),
            Message::EstablishTcpConnection { endpoints } => {
                self.establish_tcp_connection(endpoints)
            }
            Message::TcpConnectionEstablished { connection_id } => {
                self.tcp_connection_established(connection_id)
            }
            Message::TcpConnectionError {
                connection_id,
                error,
            } => self.tcp_connection_error(connection_id, error),
            Message::TcpConnectionClosed {
                connection_id,
                reason,
            } => {
                if self.is_current(connection_id) {
                    tracing::info!("TCP connection {} closed: {}", connection_id, reason);
                }
                self.tcp_connection_closed(connection_id);
            }
            Message::HandleIncomingPackage {
                connection_id,
                package,
            } => self.handle_tcp_package(connection_id, package),
            Message::TimerTick => self.timer_tick(),
        }
    }

    fn raise(&self, event: ClientEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    fn is_current(&self, connection_id: Uuid) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.connection_id() == connection_id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn start_connection(&mut self, result: CompletionSource<()>) {
        match self.state {
            ConnectionState::Init => {
                self.state = ConnectionState::Connecting;
                self.phase = ConnectingPhase::Reconnecting;
                self.discover_endpoint(Some(result));
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                result.try_set_error(ClientError::AlreadyActive);
            }
            ConnectionState::Closed => {
                result.try_set_error(ClientError::connection_closed("connection is closed"));
            }
        }
    }

    fn discover_endpoint(&mut self, completion: Option<CompletionSource<()>>) {
        if self.state != ConnectionState::Connecting
            || self.phase != ConnectingPhase::Reconnecting
        {
            return;
        }
        self.phase = ConnectingPhase::EndPointDiscovery;

        let discovery = self.discoverer.discover(self.last_endpoint);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let message = match discovery.completed().await {
                Ok(endpoints) => {
                    if let Some(completion) = &completion {
                        completion.try_set_result(());
                    }
                    Message::EstablishTcpConnection { endpoints }
                }
                Err(e) => {
                    if let Some(completion) = &completion {
                        completion.try_set_error(ClientError::CannotEstablishConnection(format!(
                            "cannot resolve target end point: {}",
                            e
                        )));
                    }
                    Message::CloseConnection {
                        reason: "Failed to resolve TCP end point to which to connect.".to_string(),
                        error: Some(e),
                    }
                }
            };
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(message).await;
            }
        });
    }

    fn establish_tcp_connection(&mut self, endpoints: NodeEndPoints) {
        if self.state != ConnectionState::Connecting
            || self.phase != ConnectingPhase::EndPointDiscovery
        {
            tracing::debug!("Ignoring discovered endpoints in {:?}/{:?}", self.state, self.phase);
            return;
        }
        let use_tls = self.settings.tls.enabled;
        let Some(endpoint) = endpoints.select(use_tls) else {
            self.close_connection("No end point to node specified.", None);
            return;
        };

        self.phase = ConnectingPhase::ConnectionEstablishing;
        self.last_endpoint = Some(endpoint);
        if let Some(previous) = self.connection.take() {
            previous.close("replaced by a new connection");
        }
        tracing::info!("Connecting to {}", endpoint);
        self.connection = Some(TcpPackageConnection::connect(
            endpoint,
            use_tls.then(|| self.settings.tls.clone()),
            self.settings.client_connection_timeout,
            self.settings.verbose_logging,
            self.mailbox.clone(),
        ));
    }

    fn tcp_connection_established(&mut self, connection_id: Uuid) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        if self.state != ConnectionState::Connecting
            || connection.connection_id() != connection_id
            || connection.is_closed()
        {
            return;
        }

        let now = Instant::now();
        self.heartbeat = HeartbeatInfo {
            last_package_number: self.package_number,
            interval_stage: true,
            timestamp: now,
        };

        match self.settings.default_user_credentials.clone() {
            Some(credentials) => {
                self.phase = ConnectingPhase::Authentication;
                let correlation_id = Uuid::new_v4();
                self.auth = Some(AuthInfo {
                    correlation_id,
                    timestamp: now,
                });
                connection.enqueue_send(TcpPackage::with_credentials(
                    TcpCommand::Authenticate,
                    correlation_id,
                    Some(credentials),
                    Bytes::new(),
                ));
            }
            None => self.go_to_connected_state(),
        }
    }

    fn go_to_connected_state(&mut self) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        self.state = ConnectionState::Connected;
        self.phase = ConnectingPhase::Connected;
        self.auth = None;
        self.was_connected = true;

        let remote_endpoint = connection.remote_endpoint();
        tracing::info!("Connected to {}", remote_endpoint);
        self.raise(ClientEvent::Connected { remote_endpoint });

        let now = Instant::now();
        let due = self.last_timeout_check.map_or(true, |last| {
            now.duration_since(last) >= self.settings.operation_timeout_check_period
        });
        if due {
            self.operations.check_timeouts_and_retry(connection);
            self.subscriptions.check_timeouts_and_retry(connection);
            self.last_timeout_check = Some(now);
        } else {
            self.operations.try_schedule_waiting_operations(connection);
            self.subscriptions.start_waiting_subscriptions(connection);
        }
    }

    fn tcp_connection_error(&mut self, connection_id: Uuid, error: ClientError) {
        if self.state == ConnectionState::Closed || !self.is_current(connection_id) {
            return;
        }
        // The transport always follows an error with a close, which reconnects.
        tracing::warn!("TCP connection {} error: {}", connection_id, error);
        self.raise(ClientEvent::ErrorOccurred { error });
    }

    fn tcp_connection_closed(&mut self, connection_id: Uuid) {
        if matches!(self.state, ConnectionState::Init | ConnectionState::Closed)
            || !self.is_current(connection_id)
        {
            return;
        }

        self.state = ConnectionState::Connecting;
        self.phase = ConnectingPhase::Reconnecting;
        self.auth = None;
        self.subscriptions
            .purge_subscribed_and_dropped_subscriptions(connection_id);
        self.reconnection.timestamp = Instant::now();

        if self.was_connected {
            self.was_connected = false;
            if let Some(connection) = self.connection.as_ref() {
                let remote_endpoint = connection.remote_endpoint();
                tracing::info!("Disconnected from {}", remote_endpoint);
                self.raise(ClientEvent::Disconnected { remote_endpoint });
            }
        }
    }

    /// Closes the current socket; the actor moves on to reconnecting.
    fn close_tcp_connection(&mut self, reason: &str) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let connection_id = connection.connection_id();
        connection.close(reason);
        self.tcp_connection_closed(connection_id);
        self.connection = None;
    }

    fn close_connection(&mut self, reason: &str, error: Option<ClientError>) {
        if self.state == ConnectionState::Closed {
            tracing::debug!("Ignoring close ({}): already closed", reason);
            return;
        }

        tracing::info!("Closing connection: {}", reason);
        self.state = ConnectionState::Closed;
        self.operations.clean_up();
        self.subscriptions.clean_up();
        self.close_tcp_connection(reason);

        if let Some(error) = error {
            self.raise(ClientEvent::ErrorOccurred { error });
        }
        self.raise(ClientEvent::Closed {
            reason: reason.to_string(),
        });
    }

    fn reconnect_to(&mut self, endpoints: NodeEndPoints) {
        let Some(endpoint) = endpoints.select(self.settings.tls.enabled) else {
            tracing::warn!("Master advertised no usable endpoint, staying on current node");
            return;
        };
        let current = self.connection.as_ref().map(TcpPackageConnection::remote_endpoint);
        if self.state != ConnectionState::Connected || current == Some(endpoint) {
            return;
        }

        let reason = format!("going to reconnect to {}, current endpoint {:?}", endpoint, current);
        tracing::info!("{}", reason);
        self.close_tcp_connection(&reason);

        self.state = ConnectionState::Connecting;
        self.phase = ConnectingPhase::EndPointDiscovery;
        self.establish_tcp_connection(endpoints);
    }

    // ========================================================================
    // Work items
    // ========================================================================

    fn start_operation(
        &mut self,
        mut operation: Box<dyn Operation>,
        max_retries: i32,
        timeout: Duration,
    ) {
        match self.state {
            ConnectionState::Init => operation.fail(ClientError::NotActive),
            ConnectionState::Connecting => {
                let item = self.operations.create_item(operation, max_retries, timeout);
                self.operations.enqueue_operation(item);
            }
            ConnectionState::Connected => {
                let item = self.operations.create_item(operation, max_retries, timeout);
                match self.connection.as_ref() {
                    Some(connection) => self.operations.schedule_operation(item, connection),
                    None => self.operations.enqueue_operation(item),
                }
            }
            ConnectionState::Closed => {
                operation.fail(ClientError::connection_closed("connection is closed"));
            }
        }
    }

    fn start_subscription(
        &mut self,
        mut subscription: Box<dyn Subscription>,
        subscription_id: Uuid,
        max_retries: i32,
        timeout: Duration,
    ) {
        match self.state {
            ConnectionState::Init => {
                subscription.drop_subscription(
                    SubscriptionDropReason::SubscribingError,
                    Some(ClientError::NotActive),
                    None,
                );
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                let item = self
                    .subscriptions
                    .create_item(subscription, subscription_id, max_retries, timeout);
                match self.connection.as_ref() {
                    Some(connection) if self.state == ConnectionState::Connected => {
                        self.subscriptions.start_subscription(item, connection)
                    }
                    _ => self.subscriptions.enqueue_subscription(item),
                }
            }
            ConnectionState::Closed => {
                subscription.drop_subscription(
                    SubscriptionDropReason::ConnectionClosed,
                    Some(ClientError::connection_closed("connection is closed")),
                    None,
                );
            }
        }
    }

    fn subscription_control(&mut self, subscription_id: Uuid, control: SubscriptionControl) {
        let connection = match self.state {
            ConnectionState::Connected => self.connection.as_ref(),
            _ => None,
        };

        match control {
            SubscriptionControl::Unsubscribe { reason, error } => {
                if let Some(mut item) = self.subscriptions.take_by_id(&subscription_id) {
                    item.subscription.drop_subscription(reason, error, connection);
                }
            }
            control => {
                let Some(connection) = connection else {
                    tracing::debug!(
                        "Not connected, discarding {:?} for {}",
                        control,
                        subscription_id
                    );
                    return;
                };
                let package = self
                    .subscriptions
                    .find_by_id(&subscription_id)
                    .and_then(|item| item.subscription.processed_events_package(&control));
                if let Some(package) = package {
                    connection.enqueue_send(package);
                }
            }
        }
    }

    // ========================================================================
    // Packages
    // ========================================================================

    fn handle_tcp_package(&mut self, connection_id: Uuid, package: TcpPackage) {
        if matches!(self.state, ConnectionState::Init | ConnectionState::Closed) {
            return;
        }
        let Some(connection) = self
            .connection
            .as_ref()
            .filter(|c| c.connection_id() == connection_id)
        else {
            return;
        };
        self.package_number += 1;

        match package.command {
            TcpCommand::HeartbeatResponseCommand => return,
            TcpCommand::HeartbeatRequestCommand => {
                connection.enqueue_send(TcpPackage::new(
                    TcpCommand::HeartbeatResponseCommand,
                    package.correlation_id,
                    Bytes::new(),
                ));
                return;
            }
            TcpCommand::Authenticated | TcpCommand::NotAuthenticated
                if self.state == ConnectionState::Connecting
                    && self.phase == ConnectingPhase::Authentication
                    && self
                        .auth
                        .as_ref()
                        .is_some_and(|auth| auth.correlation_id == package.correlation_id) =>
            {
                if package.command == TcpCommand::NotAuthenticated {
                    self.raise(ClientEvent::AuthenticationFailed {
                        reason: "not authenticated".to_string(),
                    });
                }
                self.go_to_connected_state();
                return;
            }
            TcpCommand::BadRequest if package.correlation_id.is_nil() => {
                let message = lossy_message(&package.data, "<no message>");
                self.close_connection(
                    "Connection-wide BadRequest received. Too dangerous to continue.",
                    Some(ClientError::ServerError(format!(
                        "bad request received from server: {}",
                        message
                    ))),
                );
                return;
            }
            _ => {}
        }

        let correlation_id = package.correlation_id;
        let verbose = self.settings.verbose_logging;

        if let Some(item) = self.operations.get_active_operation(&correlation_id) {
            let result = item.operation.inspect_package(&package);
            if verbose {
                tracing::debug!("{} => {:?} ({})", item, result.decision, result.description);
            }
            self.apply_operation_decision(correlation_id, result);
            if self.state == ConnectionState::Connected {
                if let Some(connection) = self.connection.as_ref() {
                    self.operations.try_schedule_waiting_operations(connection);
                }
            }
        } else if let Some(item) = self.subscriptions.get_active_subscription(&correlation_id) {
            let result = item.subscription.inspect_package(&package);
            if verbose {
                tracing::debug!("{} => {:?} ({})", item, result.decision, result.description);
            }
            if result.decision == InspectionDecision::Subscribed {
                item.is_subscribed = true;
            }
            self.apply_subscription_decision(correlation_id, result);
        } else if verbose {
            tracing::debug!(
                "Unmapped package {} ({}), {} bytes",
                package.command,
                correlation_id,
                package.data.len()
            );
        }
    }

    fn apply_operation_decision(&mut self, correlation_id: Uuid, result: InspectionResult) {
        match result.decision {
            InspectionDecision::DoNothing => {}
            InspectionDecision::EndOperation => {
                self.operations.remove_operation(&correlation_id);
            }
            InspectionDecision::Retry => {
                self.operations.schedule_operation_retry(&correlation_id);
            }
            InspectionDecision::Reconnect(endpoints) => {
                self.reconnect_to(endpoints);
                self.operations.schedule_operation_retry(&correlation_id);
            }
            InspectionDecision::Subscribed => {
                tracing::warn!("Operation {} reported a subscription confirmation", correlation_id);
            }
        }
    }

    fn apply_subscription_decision(&mut self, correlation_id: Uuid, result: InspectionResult) {
        match result.decision {
            InspectionDecision::DoNothing | InspectionDecision::Subscribed => {}
            InspectionDecision::EndOperation => {
                self.subscriptions.remove_subscription(&correlation_id);
            }
            InspectionDecision::Retry => {
                self.subscriptions.schedule_subscription_retry(&correlation_id);
            }
            InspectionDecision::Reconnect(endpoints) => {
                self.reconnect_to(endpoints);
                self.subscriptions.schedule_subscription_retry(&correlation_id);
            }
        }
    }

    // ========================================================================
    // Timer
    // ========================================================================

    fn timer_tick(&mut self) {
        let now = Instant::now();
        match self.state {
            ConnectionState::Init | ConnectionState::Closed => {}
            ConnectionState::Connecting => {
                let since_reconnect = now.duration_since(self.reconnection.timestamp);
                if self.phase == ConnectingPhase::Reconnecting
                    && since_reconnect >= self.settings.reconnection_delay
                {
                    self.reconnection = ReconnectionInfo {
                        attempt: self.reconnection.attempt + 1,
                        timestamp: now,
                    };
                    let max = self.settings.max_reconnections;
                    if max >= 0 && self.reconnection.attempt > max {
                        self.close_connection(
                            "Reconnection limit reached.",
                            Some(ClientError::CannotEstablishConnection(format!(
                                "reconnection limit of {} reached",
                                max
                            ))),
                        );
                    } else {
                        tracing::info!("Reconnecting, attempt {}", self.reconnection.attempt);
                        self.raise(ClientEvent::Reconnecting);
                        self.discover_endpoint(None);
                    }
                }

                if self.phase == ConnectingPhase::Authentication
                    && self.authentication_timed_out(now)
                {
                    self.raise(ClientEvent::AuthenticationFailed {
                        reason: "authentication timed out".to_string(),
                    });
                    self.go_to_connected_state();
                }

                if self.state == ConnectionState::Connecting
                    && self.phase > ConnectingPhase::ConnectionEstablishing
                {
                    self.manage_heartbeats(now);
                }
            }
            ConnectionState::Connected => {
                let due = self.last_timeout_check.map_or(true, |last| {
                    now.duration_since(last) >= self.settings.operation_timeout_check_period
                });
                if due {
                    // Reconnection attempts only count while no connection stays up.
                    self.reconnection = ReconnectionInfo {
                        attempt: 0,
                        timestamp: now,
                    };
                    if let Some(connection) = self.connection.as_ref() {
                        self.operations.check_timeouts_and_retry(connection);
                        self.subscriptions.check_timeouts_and_retry(connection);
                    }
                    self.last_timeout_check = Some(now);
                }
                self.manage_heartbeats(now);
            }
        }
    }

    fn authentication_timed_out(&self, now: Instant) -> bool {
        let timeout = self.settings.operation_timeout;
        self.auth
            .as_ref()
            .is_some_and(|auth| now.duration_since(auth.timestamp) >= timeout)
    }

    fn manage_heartbeats(&mut self, now: Instant) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };

        if self.heartbeat.last_package_number != self.package_number {
            self.heartbeat = HeartbeatInfo {
                last_package_number: self.package_number,
                interval_stage: true,
                timestamp: now,
            };
            return;
        }

        let timeout = if self.heartbeat.interval_stage {
            self.settings.heartbeat_interval
        } else {
            self.settings.heartbeat_timeout
        };
        if now.duration_since(self.heartbeat.timestamp) < timeout {
            return;
        }

        if self.heartbeat.interval_stage {
            connection.enqueue_send(TcpPackage::new(
                TcpCommand::HeartbeatRequestCommand,
                Uuid::new_v4(),
                Bytes::new(),
            ));
            self.heartbeat = HeartbeatInfo {
                last_package_number: self.heartbeat.last_package_number,
                interval_stage: false,
                timestamp: now,
            };
        } else {
            let reason = format!(
                "closing TCP connection {} to {} due to heartbeat timeout at package {}",
                connection.connection_id(),
                connection.remote_endpoint(),
                self.package_number
            );
            tracing::info!("{}", reason);
            self.close_tcp_connection(&reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;
    use crate::discovery::StaticEndPointDiscoverer;
    use crate::operations::{AppendToStream, OperationBase};
    use crate::task::Task;
    use crate::types::{EventData, ExpectedVersion, WriteResult};
    use evstore_protocol::messages::{self, NotHandledReason};
    use evstore_protocol::{Decoder, UserCredentials};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct FakeServer {
        stream: TcpStream,
        decoder: Decoder,
    }

    impl FakeServer {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            Self {
                stream,
                decoder: Decoder::new(),
            }
        }

        async fn recv(&mut self) -> TcpPackage {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(package) = self.decoder.decode_package().unwrap() {
                    return package;
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed the connection");
                self.decoder.extend(&buf[..n]);
            }
        }

        /// Next package that is not a heartbeat exchange.
        async fn recv_request(&mut self) -> TcpPackage {
            loop {
                let package = self.recv().await;
                if !matches!(
                    package.command,
                    TcpCommand::HeartbeatRequestCommand | TcpCommand::HeartbeatResponseCommand
                ) {
                    return package;
                }
            }
        }

        async fn send(&mut self, package: TcpPackage) {
            let frame = package.encode().unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }
    }

    async fn start(settings: ConnectionSettings) -> (ActorHandle, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoints = NodeEndPoints::new(listener.local_addr().unwrap(), None);
        let handle = spawn(settings, Arc::new(StaticEndPointDiscoverer::new(endpoints)));
        (handle, listener)
    }

    async fn connect(handle: &ActorHandle) -> Result<(), ClientError> {
        let result = CompletionSource::new();
        let task = result.task();
        handle
            .mailbox
            .send(Message::StartConnection { result })
            .await
            .unwrap();
        task.await
    }

    fn append(stream: &str) -> (Box<dyn Operation>, Task<WriteResult>) {
        let op = OperationBase::new(
            AppendToStream {
                stream: stream.to_string(),
                expected_version: ExpectedVersion::Any,
                events: vec![EventData::new("Created", Bytes::from_static(b"{}"))],
                require_master: true,
            },
            None,
        );
        let task = op.task();
        (Box::new(op), task)
    }

    async fn start_append(handle: &ActorHandle, stream: &str) -> Task<WriteResult> {
        let (operation, task) = append(stream);
        handle
            .mailbox
            .send(Message::StartOperation {
                operation,
                max_retries: 10,
                timeout: Duration::from_secs(7),
            })
            .await
            .unwrap();
        task
    }

    async fn next_event(
        events: &mut broadcast::Receiver<ClientEvent>,
        matches: impl Fn(&ClientEvent) -> bool,
    ) -> ClientEvent {
        let wait = async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_poster_keeps_order_when_mailbox_is_full() {
        let (mailbox, mut mailbox_rx) = mpsc::channel(1);
        mailbox.try_send(Message::TimerTick).unwrap();
        let poster = Poster::new(mailbox);

        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            poster.post(Message::SubscriptionControl {
                subscription_id: *id,
                control: SubscriptionControl::Ack {
                    event_ids: vec![*id],
                },
            });
        }

        assert!(matches!(mailbox_rx.recv().await, Some(Message::TimerTick)));
        for id in &ids {
            match mailbox_rx.recv().await {
                Some(Message::SubscriptionControl {
                    subscription_id,
                    ..
                }) => assert_eq!(subscription_id, *id),
                _ => panic!("expected a subscription control message"),
            }
        }
    }

    #[tokio::test]
    async fn test_operation_before_start_fails() {
        let (handle, _listener) = start(ConnectionSettings::default()).await;
        let task = start_append(&handle, "S").await;
        assert!(matches!(task.await, Err(ClientError::NotActive)));
    }

    #[tokio::test]
    async fn test_start_connection_twice() {
        let (handle, _listener) = start(ConnectionSettings::default()).await;
        connect(&handle).await.unwrap();
        assert!(matches!(connect(&handle).await, Err(ClientError::AlreadyActive)));
    }

    #[tokio::test]
    async fn test_operation_queued_until_connected() {
        let (handle, listener) = start(ConnectionSettings::default()).await;
        let mut events = handle.events.subscribe();
        connect(&handle).await.unwrap();
        let task = start_append(&handle, "S").await;

        let mut server = FakeServer::accept(&listener).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
        let request = server.recv_request().await;
        assert_eq!(request.command, TcpCommand::WriteEvents);
        assert!(!task.is_completed());
    }

    #[tokio::test]
    async fn test_not_handled_until_retries_limit() {
        let settings = ConnectionSettings::default()
            .with_operation_timeout_check_period(Duration::from_millis(50));
        let (handle, listener) = start(settings).await;
        let mut events = handle.events.subscribe();
        connect(&handle).await.unwrap();
        let mut server = FakeServer::accept(&listener).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

        let (operation, task) = append("orders");
        handle
            .mailbox
            .send(Message::StartOperation {
                operation,
                max_retries: 1,
                timeout: Duration::from_secs(7),
            })
            .await
            .unwrap();

        let too_busy = messages::encode(&messages::NotHandled {
            reason: NotHandledReason::TooBusy as i32,
            additional_info: None,
        });

        let first = server.recv_request().await;
        assert_eq!(first.command, TcpCommand::WriteEvents);
        server
            .send(TcpPackage::new(
                TcpCommand::NotHandled,
                first.correlation_id,
                too_busy.clone(),
            ))
            .await;

        // Same request, new correlation id.
        let second = server.recv_request().await;
        assert_eq!(second.command, TcpCommand::WriteEvents);
        assert_ne!(second.correlation_id, first.correlation_id);
        assert_eq!(second.data, first.data);
        assert!(!task.is_completed());
        server
            .send(TcpPackage::new(TcpCommand::NotHandled, second.correlation_id, too_busy))
            .await;

        let result = tokio::time::timeout(Duration::from_secs(5), task.completed())
            .await
            .unwrap();
        match result {
            Err(ClientError::RetriesLimitReached { operation, retries }) => {
                assert_eq!(retries, 1);
                assert!(!operation.is_empty());
            }
            other => panic!("expected the retries limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_discovery_result_is_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings =
            ConnectionSettings::default().with_tls(TlsSettings::new("localhost").with_insecure());
        let discoverer = StaticEndPointDiscoverer::new(NodeEndPoints::new(addr, Some(addr)));
        let handle = spawn(settings, Arc::new(discoverer));

        // Nothing is being discovered, and there is no secure endpoint to use.
        handle
            .mailbox
            .send(Message::EstablishTcpConnection {
                endpoints: NodeEndPoints::new(addr, None),
            })
            .await
            .unwrap();

        connect(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_request_is_answered() {
        let (handle, listener) = start(ConnectionSettings::default()).await;
        connect(&handle).await.unwrap();
        let mut server = FakeServer::accept(&listener).await;

        let correlation_id = Uuid::new_v4();
        server
            .send(TcpPackage::new(
                TcpCommand::HeartbeatRequestCommand,
                correlation_id,
                Bytes::new(),
            ))
            .await;
        loop {
            let package = server.recv().await;
            if package.command == TcpCommand::HeartbeatResponseCommand {
                assert_eq!(package.correlation_id, correlation_id);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_authenticates_with_default_credentials() {
        let settings = ConnectionSettings::default()
            .with_default_credentials(UserCredentials::new("admin", "changeit"));
        let (handle, listener) = start(settings).await;
        let mut events = handle.events.subscribe();
        connect(&handle).await.unwrap();
        let mut server = FakeServer::accept(&listener).await;

        let request = server.recv_request().await;
        assert_eq!(request.command, TcpCommand::Authenticate);
        assert!(request.flags.is_authenticated());
        assert_eq!(request.credentials.as_ref().unwrap().username, "admin");

        server
            .send(TcpPackage::new(
                TcpCommand::NotAuthenticated,
                request.correlation_id,
                Bytes::new(),
            ))
            .await;
        next_event(&mut events, |e| matches!(e, ClientEvent::AuthenticationFailed { .. })).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    }

    #[tokio::test]
    async fn test_connection_wide_bad_request_closes() {
        let (handle, listener) = start(ConnectionSettings::default()).await;
        let mut events = handle.events.subscribe();
        connect(&handle).await.unwrap();
        let mut server = FakeServer::accept(&listener).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

        let task = start_append(&handle, "S").await;
        server.recv_request().await;
        server
            .send(TcpPackage::new(
                TcpCommand::BadRequest,
                Uuid::nil(),
                Bytes::from_static(b"garbage"),
            ))
            .await;

        next_event(&mut events, |e| matches!(e, ClientEvent::ErrorOccurred { .. })).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await;
        assert!(matches!(task.await, Err(ClientError::ConnectionClosed(_))));

        // Closed is terminal.
        let task = start_append(&handle, "S").await;
        assert!(matches!(task.await, Err(ClientError::ConnectionClosed(_))));
        assert!(matches!(connect(&handle).await, Err(ClientError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_reconnects_after_server_disconnect() {
        let (handle, listener) = start(ConnectionSettings::default()).await;
        let mut events = handle.events.subscribe();
        connect(&handle).await.unwrap();

        let server = FakeServer::accept(&listener).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
        drop(server);

        next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Reconnecting)).await;
        let _server = FakeServer::accept(&listener).await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    }

    #[tokio::test]
    async fn test_reconnection_limit_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoints = NodeEndPoints::new(listener.local_addr().unwrap(), None);
        drop(listener);

        let settings = ConnectionSettings::default()
            .with_max_reconnections(1)
            .with_reconnection_delay(Duration::from_millis(10));
        let handle = spawn(settings, Arc::new(StaticEndPointDiscoverer::new(endpoints)));
        let mut events = handle.events.subscribe();
        connect(&handle).await.unwrap();

        let closed = next_event(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await;
        match closed {
            ClientEvent::Closed { reason } => assert!(reason.contains("Reconnection limit")),
            _ => unreachable!(),
        }
    }
}
