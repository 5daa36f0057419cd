//! Catch-up subscriptions.
//!
//! A catch-up subscription reads a stream (or `$all`) from a checkpoint up
//! to its current end, then follows it live. Live events pushed while the
//! history is still being read are queued and deduplicated against what was
//! already delivered, so the handler sees every event exactly once and in
//! order.

use crate::client::{Client, MAX_READ_SIZE};
use crate::error::{run_handler, ClientError};
use crate::subscriptions::{DroppedSubscription, VolatileSubscription};
use crate::task::{CompletionSource, Task};
use crate::types::{
    CatchUpSubscriptionSettings, Position, ResolvedEvent, SliceReadStatus, SubscriptionDropReason,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) type EventAppeared =
    Box<dyn FnMut(&CatchUpSubscription, ResolvedEvent) -> Result<(), ClientError> + Send>;
pub(crate) type LiveProcessingStarted = Box<dyn FnOnce(&CatchUpSubscription) + Send>;
pub(crate) type SubscriptionDropped =
    Box<dyn FnOnce(&CatchUpSubscription, SubscriptionDropReason, Option<ClientError>) + Send>;

/// Where a catch-up subscription starts.
pub(crate) enum CatchUpTarget {
    Stream {
        stream: String,
        last_checkpoint: Option<i64>,
    },
    All {
        last_checkpoint: Option<Position>,
    },
}

impl CatchUpTarget {
    pub(crate) fn stream(stream: &str, last_checkpoint: Option<i64>) -> Self {
        CatchUpTarget::Stream {
            stream: stream.to_string(),
            last_checkpoint,
        }
    }

    pub(crate) fn all(last_checkpoint: Option<Position>) -> Self {
        CatchUpTarget::All { last_checkpoint }
    }
}

/// Progress through the source; the checkpoint is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Stream { last_processed: i64, next_read: i64 },
    All { last_processed: Position, next_read: Position },
}

impl Cursor {
    fn new(target: &CatchUpTarget) -> Self {
        match target {
            CatchUpTarget::Stream { last_checkpoint, .. } => Cursor::Stream {
                last_processed: last_checkpoint.unwrap_or(-1),
                next_read: last_checkpoint.unwrap_or(0).max(0),
            },
            CatchUpTarget::All { last_checkpoint } => Cursor::All {
                last_processed: last_checkpoint.unwrap_or(Position::END),
                next_read: last_checkpoint.unwrap_or(Position::START),
            },
        }
    }

    /// Whether `event` lies past the last processed one.
    fn is_new(&self, event: &ResolvedEvent) -> Result<bool, ClientError> {
        match self {
            Cursor::Stream { last_processed, .. } => Ok(event
                .original_event_number()
                .is_some_and(|number| number > *last_processed)),
            Cursor::All { last_processed, .. } => Ok(event_position(event)? > *last_processed),
        }
    }

    fn record(&mut self, event: &ResolvedEvent) {
        match self {
            Cursor::Stream { last_processed, .. } => {
                if let Some(number) = event.original_event_number() {
                    *last_processed = number;
                }
            }
            Cursor::All { last_processed, .. } => {
                if let Some(position) = event.original_position {
                    *last_processed = position;
                }
            }
        }
    }
}

fn event_position(event: &ResolvedEvent) -> Result<Position, ClientError> {
    event.original_position.ok_or_else(|| {
        ClientError::ServerError(
            "subscription to $all received an event without a position".to_string(),
        )
    })
}

enum LiveItem {
    Event(ResolvedEvent),
    Drop,
}

struct CatchUpShared {
    stream: String,
    settings: CatchUpSubscriptionSettings,
    cursor: Mutex<Cursor>,
    stop_requested: AtomicBool,
    is_live: AtomicBool,
    live: mpsc::UnboundedSender<LiveItem>,
    live_len: AtomicUsize,
    drop_data: Mutex<Option<DroppedSubscription>>,
    volatile: Mutex<Option<VolatileSubscription>>,
    dropped: Task<DroppedSubscription>,
}

impl CatchUpShared {
    fn enqueue_pushed(&self, event: ResolvedEvent) {
        if self.live_len.load(Ordering::Acquire) >= self.settings.max_live_queue_size {
            self.enqueue_drop(SubscriptionDropReason::ProcessingQueueOverflow, None);
            if let Some(volatile) = self.volatile.lock().as_ref() {
                volatile.unsubscribe();
            }
            return;
        }
        self.live_len.fetch_add(1, Ordering::AcqRel);
        let _ = self.live.send(LiveItem::Event(event));
    }

    /// Records the first drop request and wakes the worker with it.
    fn enqueue_drop(&self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        let mut drop_data = self.drop_data.lock();
        if drop_data.is_some() {
            return;
        }
        *drop_data = Some(DroppedSubscription { reason, error });
        let _ = self.live.send(LiveItem::Drop);
    }
}

/// Handle to a running catch-up subscription.
#[derive(Clone)]
pub struct CatchUpSubscription {
    shared: Arc<CatchUpShared>,
}

impl CatchUpSubscription {
    /// Source stream; empty for `$all`.
    pub fn stream_id(&self) -> &str {
        &self.shared.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.shared.stream.is_empty()
    }

    /// Number of the last event handed to the handler, or -1.
    ///
    /// Always -1 for subscriptions to `$all`.
    pub fn last_processed_event_number(&self) -> i64 {
        match *self.shared.cursor.lock() {
            Cursor::Stream { last_processed, .. } => last_processed,
            Cursor::All { .. } => -1,
        }
    }

    /// Position of the last event handed to the handler.
    ///
    /// [`Position::END`] for stream subscriptions and before the first event.
    pub fn last_processed_position(&self) -> Position {
        match *self.shared.cursor.lock() {
            Cursor::Stream { .. } => Position::END,
            Cursor::All { last_processed, .. } => last_processed,
        }
    }

    /// Whether history has been read and events now arrive live.
    pub fn is_live(&self) -> bool {
        self.shared.is_live.load(Ordering::Acquire)
    }

    /// Resolves after the drop callback has run.
    pub fn dropped(&self) -> Task<DroppedSubscription> {
        self.shared.dropped.clone()
    }

    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.enqueue_drop(SubscriptionDropReason::UserInitiated, None);
    }

    /// Stops and waits for the drop callback to have run.
    pub async fn stop_and_wait(
        &self,
        timeout: Duration,
    ) -> Result<DroppedSubscription, ClientError> {
        self.stop();
        let dropped = self.dropped();
        tokio::time::timeout(timeout, dropped.completed())
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

/// Creates the subscription and starts reading in the background.
pub(crate) fn start(
    client: Client,
    target: CatchUpTarget,
    settings: CatchUpSubscriptionSettings,
    event_appeared: EventAppeared,
    live_processing_started: LiveProcessingStarted,
    subscription_dropped: SubscriptionDropped,
) -> CatchUpSubscription {
    let (live, live_rx) = mpsc::unbounded_channel();
    let dropped = CompletionSource::new();
    let stream = match &target {
        CatchUpTarget::Stream { stream, .. } => stream.clone(),
        CatchUpTarget::All { .. } => String::new(),
    };
    let handle = CatchUpSubscription {
        shared: Arc::new(CatchUpShared {
            stream,
            settings,
            cursor: Mutex::new(Cursor::new(&target)),
            stop_requested: AtomicBool::new(false),
            is_live: AtomicBool::new(false),
            live,
            live_len: AtomicUsize::new(0),
            drop_data: Mutex::new(None),
            volatile: Mutex::new(None),
            dropped: dropped.task(),
        }),
    };

    let worker = Worker {
        handle: handle.clone(),
        client,
        event_appeared,
        live_processing_started: Some(live_processing_started),
        subscription_dropped: Some(subscription_dropped),
        dropped,
        live: live_rx,
    };
    tokio::spawn(worker.run());
    handle
}

struct Worker {
    handle: CatchUpSubscription,
    client: Client,
    event_appeared: EventAppeared,
    live_processing_started: Option<LiveProcessingStarted>,
    subscription_dropped: Option<SubscriptionDropped>,
    dropped: CompletionSource<DroppedSubscription>,
    live: mpsc::UnboundedReceiver<LiveItem>,
}

impl Worker {
    fn shared(&self) -> &CatchUpShared {
        &self.handle.shared
    }

    fn stop_requested(&self) -> bool {
        self.shared().stop_requested.load(Ordering::Acquire)
    }

    async fn run(mut self) {
        match self.catch_up().await {
            Ok(true) => self.process_live().await,
            Ok(false) => self.drop_subscription(SubscriptionDropReason::UserInitiated, None),
            Err(_) if self.stop_requested() => {
                self.drop_subscription(SubscriptionDropReason::UserInitiated, None)
            }
            Err(error) => {
                tracing::warn!("Catch-up subscription to '{}' failed: {}", self.describe(), error);
                self.drop_subscription(SubscriptionDropReason::CatchUpError, Some(error));
            }
        }
    }

    fn describe(&self) -> &str {
        match self.shared().stream.as_str() {
            "" => "$all",
            stream => stream,
        }
    }

    /// Reads history, subscribes, then reads what was written meanwhile.
    ///
    /// Returns `false` when stopped before going live.
    async fn catch_up(&mut self) -> Result<bool, ClientError> {
        if self.shared().settings.verbose_logging {
            tracing::debug!("Catch-up subscription to '{}' reading history", self.describe());
        }
        self.read_history(None).await?;
        if self.stop_requested() {
            return Ok(false);
        }

        let pushed = self.handle.shared.clone();
        let dropped = self.handle.shared.clone();
        let volatile = self
            .client
            .subscribe_volatile(
                self.shared().stream.clone(),
                self.shared().settings.resolve_link_tos,
                move |_, event| {
                    pushed.enqueue_pushed(event);
                    Ok(())
                },
                move |_, reason, error| dropped.enqueue_drop(reason, error),
            )
            .await?;
        *self.shared().volatile.lock() = Some(volatile.clone());

        let till = if volatile.is_subscribed_to_all() {
            volatile.last_commit_position()
        } else {
            volatile.last_event_number()
        };
        self.read_history(Some(till)).await?;
        Ok(!self.stop_requested())
    }

    /// Reads up to `till` (event number or commit position); `None` reads to
    /// the current end.
    async fn read_history(&mut self, till: Option<Option<i64>>) -> Result<(), ClientError> {
        let till = till.flatten();
        let batch = self.shared().settings.read_batch_size.clamp(1, MAX_READ_SIZE);
        let resolve_link_tos = self.shared().settings.resolve_link_tos;
        let mut done = false;

        while !done && !self.stop_requested() {
            let cursor = *self.shared().cursor.lock();
            match cursor {
                Cursor::Stream { next_read, .. } => {
                    let stream = self.shared().stream.clone();
                    let slice = self
                        .client
                        .read_stream_events_forward(&stream, next_read, batch, resolve_link_tos)
                        .await?;
                    match slice.status {
                        SliceReadStatus::Success => {
                            for event in slice.events {
                                self.process(event)?;
                            }
                            if let Cursor::Stream { next_read, .. } =
                                &mut *self.shared().cursor.lock()
                            {
                                *next_read = slice.next_event_number;
                            }
                            done = match till {
                                None => slice.is_end_of_stream,
                                Some(last) => slice.next_event_number > last,
                            };
                        }
                        SliceReadStatus::StreamNotFound => {
                            if till.is_some_and(|last| last != -1) {
                                return Err(ClientError::ServerError(format!(
                                    "stream '{}' disappeared while catching up",
                                    stream
                                )));
                            }
                            done = true;
                        }
                        SliceReadStatus::StreamDeleted => {
                            return Err(ClientError::StreamDeleted(stream))
                        }
                    }
                }
                Cursor::All { next_read, .. } => {
                    let slice = self
                        .client
                        .read_all_events_forward(next_read, batch, resolve_link_tos)
                        .await?;
                    let end_of_stream = slice.is_end_of_stream();
                    for event in slice.events {
                        event_position(&event)?;
                        self.process(event)?;
                    }
                    if let Cursor::All { next_read, .. } = &mut *self.shared().cursor.lock() {
                        *next_read = slice.next_position;
                    }
                    done = match till {
                        None => end_of_stream,
                        Some(last) => {
                            slice.next_position
                                >= Position {
                                    commit_position: last,
                                    prepare_position: last,
                                }
                        }
                    };
                }
            }
        }
        Ok(())
    }

    /// Hands `event` to the handler unless it was already processed.
    fn process(&mut self, event: ResolvedEvent) -> Result<(), ClientError> {
        if !self.shared().cursor.lock().is_new(&event)? {
            if self.shared().settings.verbose_logging {
                tracing::debug!(
                    "Catch-up subscription to '{}' skipping {:?}",
                    self.describe(),
                    event.original_event_number()
                );
            }
            return Ok(());
        }
        let handle = &self.handle;
        let event_appeared = &mut self.event_appeared;
        run_handler(|| event_appeared(handle, event.clone()))?;
        self.shared().cursor.lock().record(&event);
        Ok(())
    }

    async fn process_live(&mut self) {
        self.shared().is_live.store(true, Ordering::Release);
        if self.shared().settings.verbose_logging {
            tracing::debug!("Catch-up subscription to '{}' is live", self.describe());
        }
        if let Some(started) = self.live_processing_started.take() {
            started(&self.handle);
        }

        while let Some(item) = self.live.recv().await {
            match item {
                LiveItem::Event(event) => {
                    self.shared().live_len.fetch_sub(1, Ordering::AcqRel);
                    if let Err(error) = self.process(event) {
                        self.drop_subscription(
                            SubscriptionDropReason::EventHandlerException,
                            Some(error),
                        );
                        return;
                    }
                }
                LiveItem::Drop => {
                    let data = self.shared().drop_data.lock().clone();
                    let (reason, error) = match data {
                        Some(data) => (data.reason, data.error),
                        None => (SubscriptionDropReason::Unknown, None),
                    };
                    self.drop_subscription(reason, error);
                    return;
                }
            }
        }
        self.drop_subscription(SubscriptionDropReason::Unknown, None);
    }

    fn drop_subscription(&mut self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        self.shared().enqueue_drop(reason, error.clone());
        if self.shared().settings.verbose_logging {
            tracing::debug!(
                "Catch-up subscription to '{}' dropped: {} ({:?})",
                self.describe(),
                reason,
                error
            );
        }

        if let Some(volatile) = self.shared().volatile.lock().take() {
            volatile.unsubscribe();
        }
        if let Some(dropped) = self.subscription_dropped.take() {
            dropped(&self.handle, reason, error.clone());
        }
        self.dropped.try_set_result(DroppedSubscription { reason, error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::types::RecordedEvent;
    use bytes::Bytes;
    use uuid::Uuid;

    fn event(number: i64, position: i64) -> ResolvedEvent {
        ResolvedEvent {
            event: Some(RecordedEvent {
                event_stream_id: "orders".to_string(),
                event_id: Uuid::new_v4(),
                event_number: number,
                event_type: "Created".to_string(),
                is_json: false,
                data: Bytes::new(),
                metadata: Bytes::new(),
                created: None,
            }),
            link: None,
            original_position: Some(Position {
                commit_position: position,
                prepare_position: position,
            }),
        }
    }

    #[test]
    fn test_stream_cursor_skips_processed_events() {
        let mut cursor = Cursor::new(&CatchUpTarget::stream("orders", Some(5)));
        assert_eq!(
            cursor,
            Cursor::Stream {
                last_processed: 5,
                next_read: 5
            }
        );
        assert!(!cursor.is_new(&event(5, 0)).unwrap());
        assert!(cursor.is_new(&event(6, 0)).unwrap());

        cursor.record(&event(6, 0));
        assert!(!cursor.is_new(&event(6, 0)).unwrap());

        let fresh = Cursor::new(&CatchUpTarget::stream("orders", None));
        assert!(fresh.is_new(&event(0, 0)).unwrap());
    }

    #[test]
    fn test_all_cursor_compares_positions() {
        let mut cursor = Cursor::new(&CatchUpTarget::all(None));
        assert!(cursor.is_new(&event(0, 0)).unwrap());
        cursor.record(&event(0, 100));
        assert!(!cursor.is_new(&event(1, 100)).unwrap());
        assert!(cursor.is_new(&event(1, 150)).unwrap());

        let mut unpositioned = event(2, 0);
        unpositioned.original_position = None;
        assert!(matches!(
            cursor.is_new(&unpositioned),
            Err(ClientError::ServerError(_))
        ));
    }

    fn accept(_: &CatchUpSubscription, _: ResolvedEvent) -> Result<(), ClientError> {
        Ok(())
    }

    fn drop_recorder() -> (SubscriptionDropped, Arc<Mutex<Vec<SubscriptionDropReason>>>) {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let recorded = reasons.clone();
        (
            Box::new(move |_: &CatchUpSubscription, reason, _: Option<ClientError>| {
                recorded.lock().push(reason)
            }),
            reasons,
        )
    }

    #[tokio::test]
    async fn test_read_failure_drops_with_catch_up_error() {
        let client = Client::from_config(&ClientConfig::default()).unwrap();
        let (dropped, reasons) = drop_recorder();
        let subscription = start(
            client,
            CatchUpTarget::stream("orders", None),
            CatchUpSubscriptionSettings::default(),
            Box::new(accept),
            Box::new(|_: &CatchUpSubscription| panic!("never goes live")),
            dropped,
        );

        let outcome = subscription.dropped().await.unwrap();
        assert_eq!(outcome.reason, SubscriptionDropReason::CatchUpError);
        assert!(matches!(outcome.error, Some(ClientError::NotActive)));
        assert_eq!(*reasons.lock(), vec![SubscriptionDropReason::CatchUpError]);
        assert!(!subscription.is_live());
    }

    #[tokio::test]
    async fn test_stop_before_reading() {
        let client = Client::from_config(&ClientConfig::default()).unwrap();
        let (dropped, reasons) = drop_recorder();
        let subscription = start(
            client,
            CatchUpTarget::all(None),
            CatchUpSubscriptionSettings::default(),
            Box::new(accept),
            Box::new(|_: &CatchUpSubscription| {}),
            dropped,
        );
        assert!(subscription.is_subscribed_to_all());

        let outcome = subscription.stop_and_wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.reason, SubscriptionDropReason::UserInitiated);
        assert_eq!(*reasons.lock(), vec![SubscriptionDropReason::UserInitiated]);
        assert_eq!(subscription.last_processed_position(), Position::END);
    }

    #[test]
    fn test_live_queue_overflow_requests_drop_once() {
        let (live, mut live_rx) = mpsc::unbounded_channel();
        let shared = CatchUpShared {
            stream: "orders".to_string(),
            settings: CatchUpSubscriptionSettings::default().with_max_live_queue_size(2),
            cursor: Mutex::new(Cursor::new(&CatchUpTarget::stream("orders", None))),
            stop_requested: AtomicBool::new(false),
            is_live: AtomicBool::new(false),
            live,
            live_len: AtomicUsize::new(0),
            drop_data: Mutex::new(None),
            volatile: Mutex::new(None),
            dropped: CompletionSource::new().task(),
        };

        for number in 0..4 {
            shared.enqueue_pushed(event(number, number));
        }

        assert!(matches!(live_rx.try_recv(), Ok(LiveItem::Event(_))));
        assert!(matches!(live_rx.try_recv(), Ok(LiveItem::Event(_))));
        assert!(matches!(live_rx.try_recv(), Ok(LiveItem::Drop)));
        assert!(live_rx.try_recv().is_err());
        let data = shared.drop_data.lock().clone().unwrap();
        assert_eq!(data.reason, SubscriptionDropReason::ProcessingQueueOverflow);
    }
}
