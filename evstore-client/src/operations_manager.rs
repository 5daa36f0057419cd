//! Bookkeeping for in-flight operations.

use crate::config::ConnectionSettings;
use crate::error::ClientError;
use crate::operations::Operation;
use crate::transport::TcpPackageConnection;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// An operation plus the state the manager needs to time it out and retry it.
pub struct OperationItem {
    pub seq_no: u64,
    pub operation: Box<dyn Operation>,
    /// `-1` retries forever.
    pub max_retries: i32,
    pub timeout: Duration,
    pub created: Instant,
    pub correlation_id: Uuid,
    pub connection_id: Option<Uuid>,
    pub retry_count: i32,
    pub last_updated: Instant,
}

impl OperationItem {
    fn new(
        seq_no: u64,
        operation: Box<dyn Operation>,
        max_retries: i32,
        timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            seq_no,
            operation,
            max_retries,
            timeout,
            created: now,
            correlation_id: Uuid::new_v4(),
            connection_id: None,
            retry_count: 0,
            last_updated: now,
        }
    }
}

impl fmt::Display for OperationItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation {} ({}): seq {}, retry {}/{}, elapsed {:?}",
            self.operation.name(),
            self.correlation_id,
            self.seq_no,
            self.retry_count,
            self.max_retries,
            self.created.elapsed()
        )
    }
}

/// Tracks active, waiting and retry-pending operations.
///
/// Owned by the connection actor; every item is in exactly one of the three
/// collections.
pub struct OperationsManager {
    active: HashMap<Uuid, OperationItem>,
    waiting: VecDeque<OperationItem>,
    retry_pending: Vec<OperationItem>,
    next_seq_no: u64,
    max_concurrent_items: usize,
    fail_on_no_server_response: bool,
    verbose: bool,
}

impl OperationsManager {
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            active: HashMap::new(),
            waiting: VecDeque::new(),
            retry_pending: Vec::new(),
            next_seq_no: 0,
            max_concurrent_items: settings.max_concurrent_items.max(1),
            fail_on_no_server_response: settings.fail_on_no_server_response,
            verbose: settings.verbose_logging,
        }
    }

    /// Wraps an operation in an item with the next sequence number.
    pub fn create_item(
        &mut self,
        operation: Box<dyn Operation>,
        max_retries: i32,
        timeout: Duration,
    ) -> OperationItem {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        OperationItem::new(seq_no, operation, max_retries, timeout)
    }

    pub fn total_operation_count(&self) -> usize {
        self.active.len() + self.waiting.len() + self.retry_pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn get_active_operation(&mut self, correlation_id: &Uuid) -> Option<&mut OperationItem> {
        self.active.get_mut(correlation_id)
    }

    /// Parks an operation until a connection is available.
    pub fn enqueue_operation(&mut self, item: OperationItem) {
        if self.verbose {
            tracing::debug!("Enqueuing {}", item);
        }
        self.waiting.push_back(item);
    }

    /// Sends an operation on `connection`, or parks it when the concurrency
    /// limit is reached.
    pub fn schedule_operation(
        &mut self,
        mut item: OperationItem,
        connection: &TcpPackageConnection,
    ) {
        if self.active.len() >= self.max_concurrent_items {
            self.waiting.push_back(item);
            return;
        }

        let package = match item.operation.create_network_package(item.correlation_id) {
            Ok(package) => package,
            Err(e) => {
                tracing::warn!("Failed to build request for {}: {}", item, e);
                item.operation.fail(e);
                return;
            }
        };

        item.connection_id = Some(connection.connection_id());
        item.last_updated = Instant::now();
        if self.verbose {
            tracing::debug!("Scheduling {}", item);
        }
        // A closed connection is noticed by the next timeout check, which
        // retries the item on the current connection.
        connection.enqueue_send(package);
        self.active.insert(item.correlation_id, item);
    }

    /// Schedules parked operations while there is capacity.
    pub fn try_schedule_waiting_operations(&mut self, connection: &TcpPackageConnection) {
        while self.active.len() < self.max_concurrent_items {
            match self.waiting.pop_front() {
                Some(item) => self.schedule_operation(item, connection),
                None => break,
            }
        }
    }

    /// Removes an active operation.
    pub fn remove_operation(&mut self, correlation_id: &Uuid) -> Option<OperationItem> {
        let item = self.active.remove(correlation_id)?;
        if self.verbose {
            tracing::debug!("Removed {}", item);
        }
        Some(item)
    }

    /// Moves an active operation to retry-pending, failing it once its
    /// retry budget is spent.
    pub fn schedule_operation_retry(&mut self, correlation_id: &Uuid) -> bool {
        let Some(mut item) = self.active.remove(correlation_id) else {
            return false;
        };
        if item.max_retries >= 0 && item.retry_count >= item.max_retries {
            tracing::debug!("Retries limit reached for {}", item);
            item.operation.fail(ClientError::RetriesLimitReached {
                operation: item.operation.name().to_string(),
                retries: item.retry_count,
            });
            return false;
        }
        if self.verbose {
            tracing::debug!("Scheduling retry of {}", item);
        }
        self.retry_pending.push(item);
        true
    }

    /// Retries operations bound to another connection or silent for longer
    /// than their timeout, then re-sends everything retry-pending in
    /// sequence-number order under fresh correlation ids.
    pub fn check_timeouts_and_retry(&mut self, connection: &TcpPackageConnection) {
        let now = Instant::now();
        let mut retries = Vec::new();
        let mut timed_out = Vec::new();

        for item in self.active.values_mut() {
            if item.connection_id != Some(connection.connection_id()) {
                retries.push(item.correlation_id);
            } else if !item.timeout.is_zero()
                && now.duration_since(item.last_updated) > item.timeout
            {
                let error = ClientError::OperationTimedOut(format!(
                    "{} did not complete within {:?}",
                    item.operation.name(),
                    item.timeout
                ));
                tracing::debug!("{} timed out", item);
                if self.fail_on_no_server_response {
                    item.operation.fail(error);
                    timed_out.push(item.correlation_id);
                } else {
                    retries.push(item.correlation_id);
                }
            }
        }

        for correlation_id in &retries {
            self.schedule_operation_retry(correlation_id);
        }
        for correlation_id in &timed_out {
            self.active.remove(correlation_id);
        }

        if !self.retry_pending.is_empty() {
            let mut pending = std::mem::take(&mut self.retry_pending);
            pending.sort_by_key(|item| item.seq_no);
            for mut item in pending {
                let old_correlation_id = item.correlation_id;
                item.correlation_id = Uuid::new_v4();
                item.retry_count += 1;
                tracing::debug!(
                    "Retrying {} (previous correlation id {})",
                    item,
                    old_correlation_id
                );
                self.schedule_operation(item, connection);
            }
        }

        self.try_schedule_waiting_operations(connection);
    }

    /// Fails every tracked operation with a connection-closed error.
    pub fn clean_up(&mut self) {
        let error = ClientError::connection_closed("connection was closed");
        let count = self.total_operation_count();

        for (_, mut item) in self.active.drain() {
            item.operation.fail(error.clone());
        }
        for mut item in self.waiting.drain(..) {
            item.operation.fail(error.clone());
        }
        for mut item in self.retry_pending.drain(..) {
            item.operation.fail(error.clone());
        }

        if count > 0 {
            tracing::debug!("Cleaned up {} operations", count);
        }
    }
}
