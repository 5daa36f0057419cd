//! Bookkeeping for subscriptions.

use crate::config::ConnectionSettings;
use crate::error::ClientError;
use crate::subscriptions::Subscription;
use crate::transport::TcpPackageConnection;
use crate::types::SubscriptionDropReason;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A subscription plus its retry and timeout state.
pub struct SubscriptionItem {
    pub seq_no: u64,
    pub subscription: Box<dyn Subscription>,
    /// Stable id of the user handle; control requests are addressed by it.
    pub subscription_id: Uuid,
    pub max_retries: i32,
    pub timeout: Duration,
    pub created: Instant,
    pub correlation_id: Uuid,
    pub connection_id: Option<Uuid>,
    pub is_subscribed: bool,
    pub retry_count: i32,
    pub last_updated: Instant,
}

impl SubscriptionItem {
    fn new(
        seq_no: u64,
        subscription: Box<dyn Subscription>,
        subscription_id: Uuid,
        max_retries: i32,
        timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            seq_no,
            subscription,
            subscription_id,
            max_retries,
            timeout,
            created: now,
            correlation_id: Uuid::new_v4(),
            connection_id: None,
            is_subscribed: false,
            retry_count: 0,
            last_updated: now,
        }
    }
}

impl fmt::Display for SubscriptionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Subscription {} ({}): seq {}, subscribed {}, retry {}/{}, elapsed {:?}",
            self.subscription.description(),
            self.correlation_id,
            self.seq_no,
            self.is_subscribed,
            self.retry_count,
            self.max_retries,
            self.created.elapsed()
        )
    }
}

/// Tracks active, waiting and retry-pending subscriptions.
pub struct SubscriptionsManager {
    active: HashMap<Uuid, SubscriptionItem>,
    waiting: VecDeque<SubscriptionItem>,
    retry_pending: Vec<SubscriptionItem>,
    next_seq_no: u64,
    fail_on_no_server_response: bool,
    verbose: bool,
}

impl SubscriptionsManager {
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            active: HashMap::new(),
            waiting: VecDeque::new(),
            retry_pending: Vec::new(),
            next_seq_no: 0,
            fail_on_no_server_response: settings.fail_on_no_server_response,
            verbose: settings.verbose_logging,
        }
    }

    pub fn create_item(
        &mut self,
        subscription: Box<dyn Subscription>,
        subscription_id: Uuid,
        max_retries: i32,
        timeout: Duration,
    ) -> SubscriptionItem {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        SubscriptionItem::new(seq_no, subscription, subscription_id, max_retries, timeout)
    }

    pub fn total_subscription_count(&self) -> usize {
        self.active.len() + self.waiting.len() + self.retry_pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get_active_subscription(
        &mut self,
        correlation_id: &Uuid,
    ) -> Option<&mut SubscriptionItem> {
        self.active.get_mut(correlation_id)
    }

    /// Parks a subscription until a connection is available.
    pub fn enqueue_subscription(&mut self, item: SubscriptionItem) {
        if self.verbose {
            tracing::debug!("Enqueuing {}", item);
        }
        self.waiting.push_back(item);
    }

    /// Subscribes on `connection` under a fresh correlation id.
    pub fn start_subscription(
        &mut self,
        mut item: SubscriptionItem,
        connection: &TcpPackageConnection,
    ) {
        if item.is_subscribed {
            tracing::debug!("Discarding {}: already subscribed", item);
            return;
        }

        item.correlation_id = Uuid::new_v4();
        item.connection_id = Some(connection.connection_id());
        item.last_updated = Instant::now();
        if self.verbose {
            tracing::debug!("Starting {}", item);
        }
        if item.subscription.subscribe(item.correlation_id, connection) {
            self.active.insert(item.correlation_id, item);
        } else {
            tracing::debug!("Discarding {}: already dropped", item);
        }
    }

    /// Starts every parked subscription.
    pub fn start_waiting_subscriptions(&mut self, connection: &TcpPackageConnection) {
        let waiting: Vec<_> = self.waiting.drain(..).collect();
        for item in waiting {
            self.start_subscription(item, connection);
        }
    }

    pub fn remove_subscription(&mut self, correlation_id: &Uuid) -> Option<SubscriptionItem> {
        let item = self.active.remove(correlation_id)?;
        if self.verbose {
            tracing::debug!("Removed {}", item);
        }
        Some(item)
    }

    /// Finds a subscription by handle id wherever it is tracked.
    pub fn find_by_id(&mut self, subscription_id: &Uuid) -> Option<&mut SubscriptionItem> {
        let id = *subscription_id;
        if let Some(item) = self.active.values_mut().find(|item| item.subscription_id == id) {
            return Some(item);
        }
        if let Some(item) = self.waiting.iter_mut().find(|item| item.subscription_id == id) {
            return Some(item);
        }
        self.retry_pending
            .iter_mut()
            .find(|item| item.subscription_id == id)
    }

    /// Removes a subscription by handle id wherever it is tracked.
    pub fn take_by_id(&mut self, subscription_id: &Uuid) -> Option<SubscriptionItem> {
        let id = *subscription_id;
        let correlation_id = self
            .active
            .values()
            .find(|item| item.subscription_id == id)
            .map(|item| item.correlation_id);
        if let Some(correlation_id) = correlation_id {
            return self.active.remove(&correlation_id);
        }
        if let Some(index) = self.waiting.iter().position(|item| item.subscription_id == id) {
            return self.waiting.remove(index);
        }
        let index = self
            .retry_pending
            .iter()
            .position(|item| item.subscription_id == id)?;
        Some(self.retry_pending.remove(index))
    }

    /// Moves an unconfirmed subscription to retry-pending, dropping it once
    /// its retry budget is spent.
    pub fn schedule_subscription_retry(&mut self, correlation_id: &Uuid) -> bool {
        let Some(mut item) = self.active.remove(correlation_id) else {
            return false;
        };
        if item.max_retries >= 0 && item.retry_count >= item.max_retries {
            tracing::debug!("Retries limit reached for {}", item);
            item.subscription.drop_subscription(
                SubscriptionDropReason::SubscribingError,
                Some(ClientError::RetriesLimitReached {
                    operation: item.subscription.description(),
                    retries: item.retry_count,
                }),
                None,
            );
            return false;
        }
        if self.verbose {
            tracing::debug!("Scheduling retry of {}", item);
        }
        self.retry_pending.push(item);
        true
    }

    /// Tells every confirmed subscription of a lost connection that it is
    /// gone. Unconfirmed ones stay and are retried on the next connection.
    pub fn purge_subscribed_and_dropped_subscriptions(&mut self, connection_id: Uuid) {
        let purged: Vec<Uuid> = self
            .active
            .values()
            .filter(|item| item.is_subscribed && item.connection_id == Some(connection_id))
            .map(|item| item.correlation_id)
            .collect();
        for correlation_id in purged {
            if let Some(mut item) = self.active.remove(&correlation_id) {
                item.subscription.connection_closed();
                if self.verbose {
                    tracing::debug!("Purged {}", item);
                }
            }
        }
    }

    /// Retries unconfirmed subscriptions bound to another connection or
    /// unconfirmed for longer than their timeout, resubscribes everything
    /// retry-pending in sequence-number order, then starts parked ones.
    pub fn check_timeouts_and_retry(&mut self, connection: &TcpPackageConnection) {
        let now = Instant::now();
        let mut retries = Vec::new();
        let mut timed_out = Vec::new();

        for item in self.active.values() {
            if item.is_subscribed {
                continue;
            }
            if item.connection_id != Some(connection.connection_id()) {
                retries.push(item.correlation_id);
            } else if !item.timeout.is_zero()
                && now.duration_since(item.last_updated) > item.timeout
            {
                tracing::debug!("{} never got a confirmation", item);
                if self.fail_on_no_server_response {
                    timed_out.push(item.correlation_id);
                } else {
                    retries.push(item.correlation_id);
                }
            }
        }

        for correlation_id in &retries {
            self.schedule_subscription_retry(correlation_id);
        }
        for correlation_id in &timed_out {
            if let Some(mut item) = self.active.remove(correlation_id) {
                let error = ClientError::OperationTimedOut(format!(
                    "{} was not confirmed within {:?}",
                    item.subscription.description(),
                    item.timeout
                ));
                item.subscription
                    .drop_subscription(SubscriptionDropReason::SubscribingError, Some(error), None);
            }
        }

        if !self.retry_pending.is_empty() {
            let mut pending = std::mem::take(&mut self.retry_pending);
            pending.sort_by_key(|item| item.seq_no);
            for mut item in pending {
                item.retry_count += 1;
                self.start_subscription(item, connection);
            }
        }

        self.start_waiting_subscriptions(connection);
    }

    /// Drops every tracked subscription with a connection-closed error.
    pub fn clean_up(&mut self) {
        let error = ClientError::connection_closed("connection was closed");
        let count = self.total_subscription_count();

        let items = self
            .active
            .drain()
            .map(|(_, item)| item)
            .chain(self.waiting.drain(..))
            .chain(self.retry_pending.drain(..));
        for mut item in items {
            item.subscription.drop_subscription(
                SubscriptionDropReason::ConnectionClosed,
                Some(error.clone()),
                None,
            );
        }

        if count > 0 {
            tracing::debug!("Cleaned up {} subscriptions", count);
        }
    }
}
