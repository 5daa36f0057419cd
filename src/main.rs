//! evstore - event store client
//!
//! Connects to a node and tails a stream (or `$all`) through a catch-up
//! subscription, logging every event it sees. A subscription dropped by a
//! retryable error resumes from the last event it handled.

use evstore_client::{
    CatchUpSubscription, CatchUpSubscriptionSettings, Client, ClientConfig, ClientError,
    ClientEvent, DroppedSubscription, Position, ResolvedEvent, StreamPosition,
    SubscriptionDropReason,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Consecutive resubscriptions after retryable drops before giving up.
const MAX_RESUBSCRIBE_ATTEMPTS: u32 = 10;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if EVSTORE_CONFIG is set, then env overrides)
    let config = match ClientConfig::load() {
        Ok(c) => c,
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if let Ok(path) = std::env::var("EVSTORE_CONFIG") {
                tracing::error!("Failed to load config from {}: {}", path, e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            ClientConfig::default()
        }
    };

    let stream = std::env::var("EVSTORE_STREAM").unwrap_or_default();
    let from = std::env::var("EVSTORE_FROM").ok();

    tracing::info!("Starting evstore client");
    tracing::info!("  Endpoint: {}", config.endpoint);
    if config.connection.tls.enabled {
        tracing::info!("  TLS: enabled");
    }
    tracing::info!(
        "  Tailing: {}",
        if stream.is_empty() { "$all" } else { stream.as_str() }
    );

    let client = Client::from_config(&config)?;

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Connected { remote_endpoint } => {
                    tracing::info!("Connected to {}", remote_endpoint)
                }
                ClientEvent::Disconnected { remote_endpoint } => {
                    tracing::warn!("Disconnected from {}", remote_endpoint)
                }
                ClientEvent::Reconnecting => tracing::info!("Reconnecting"),
                ClientEvent::ErrorOccurred { error } => {
                    tracing::warn!("Connection error: {}", error)
                }
                ClientEvent::AuthenticationFailed { reason } => {
                    tracing::error!("Authentication failed: {}", reason)
                }
                ClientEvent::Closed { reason } => {
                    tracing::info!("Connection closed: {}", reason);
                    break;
                }
            }
        }
    });

    client.connect().await?;

    let mut checkpoint = if stream.is_empty() {
        match from.as_deref() {
            Some(commit) => {
                let commit: i64 = commit.parse()?;
                Checkpoint::All(Some(Position::new(commit, commit)?))
            }
            None => Checkpoint::All(None),
        }
    } else {
        match from.as_deref() {
            Some(number) => {
                let number: i64 = number.parse()?;
                Checkpoint::Stream((number != StreamPosition::END).then_some(number))
            }
            None => Checkpoint::Stream(None),
        }
    };

    let mut attempts = 0;
    loop {
        let subscription = subscribe(&client, &stream, checkpoint)?;
        let dropped = subscription.dropped();
        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                if let Err(e) = subscription.stop_and_wait(Duration::from_secs(5)).await {
                    tracing::warn!("Subscription did not stop cleanly: {}", e);
                }
                break;
            }
            dropped = dropped.completed() => dropped,
        };

        checkpoint = Checkpoint::resume(&subscription);
        if subscription.is_live() {
            attempts = 0;
        }
        match outcome {
            Ok(DroppedSubscription {
                reason,
                error: Some(error),
            }) if error.is_retryable() && attempts < MAX_RESUBSCRIBE_ATTEMPTS => {
                attempts += 1;
                tracing::warn!(
                    "Subscription dropped ({}): {}, resubscribing (attempt {})",
                    reason,
                    error,
                    attempts
                );
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
            Ok(dropped) => {
                tracing::info!("Subscription ended: {}", dropped.reason);
                break;
            }
            Err(e) => {
                tracing::warn!("Subscription ended without a drop reason: {}", e);
                break;
            }
        }
    }

    client.close().await?;
    Ok(())
}

/// Where to (re)start tailing from.
#[derive(Clone, Copy)]
enum Checkpoint {
    Stream(Option<i64>),
    All(Option<Position>),
}

impl Checkpoint {
    /// The last event `subscription` handed out, or its own start if none.
    fn resume(subscription: &CatchUpSubscription) -> Self {
        if subscription.is_subscribed_to_all() {
            let position = subscription.last_processed_position();
            Checkpoint::All((position != Position::END).then_some(position))
        } else {
            let number = subscription.last_processed_event_number();
            Checkpoint::Stream((number != StreamPosition::END).then_some(number))
        }
    }
}

fn subscribe(
    client: &Client,
    stream: &str,
    checkpoint: Checkpoint,
) -> Result<CatchUpSubscription, ClientError> {
    let settings = CatchUpSubscriptionSettings::default();
    let event_appeared = |_: &CatchUpSubscription, event: ResolvedEvent| {
        if let Some(recorded) = event.original_event() {
            tracing::info!(
                stream = %recorded.event_stream_id,
                number = recorded.event_number,
                "{} ({} bytes)",
                recorded.event_type,
                recorded.data.len()
            );
        }
        Ok::<(), ClientError>(())
    };
    let live_processing_started = |_: &CatchUpSubscription| tracing::info!("Caught up, now live");
    let subscription_dropped = |_: &CatchUpSubscription,
                                reason: SubscriptionDropReason,
                                error: Option<ClientError>| match error {
        Some(error) => tracing::error!("Subscription dropped ({}): {}", reason, error),
        None => tracing::info!("Subscription dropped ({})", reason),
    };

    match checkpoint {
        Checkpoint::All(position) => Ok(client.subscribe_to_all_from(
            position,
            settings,
            event_appeared,
            live_processing_started,
            subscription_dropped,
        )),
        Checkpoint::Stream(number) => client.subscribe_to_stream_from(
            stream,
            number,
            settings,
            event_appeared,
            live_processing_started,
            subscription_dropped,
        ),
    }
}
