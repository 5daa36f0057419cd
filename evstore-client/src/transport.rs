//! One physical connection: a reader that reassembles packages and a single
//! writer fed by an unbounded queue.

use crate::config::TlsSettings;
use crate::error::ClientError;
use crate::stream::ClientStream;
use evstore_protocol::{Decoder, TcpPackage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Notifications emitted by a connection, tagged with its id so that the
/// owner can ignore events from a connection it already replaced.
#[derive(Debug)]
pub enum TransportEvent {
    Established {
        connection_id: Uuid,
    },
    Package {
        connection_id: Uuid,
        package: TcpPackage,
    },
    Error {
        connection_id: Uuid,
        error: ClientError,
    },
    /// Emitted exactly once, as the last event of a connection.
    Closed {
        connection_id: Uuid,
        reason: String,
    },
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Package(TcpPackage),
    Close(String),
}

/// Handle to one physical connection.
#[derive(Debug)]
pub struct TcpPackageConnection {
    connection_id: Uuid,
    remote_endpoint: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl TcpPackageConnection {
    /// Starts connecting in the background.
    ///
    /// Events are delivered in socket order through `events`; the connection
    /// stops reading once the receiving side is gone.
    pub fn connect<M>(
        remote_endpoint: SocketAddr,
        tls: Option<TlsSettings>,
        connect_timeout: Duration,
        verbose: bool,
        events: mpsc::WeakSender<M>,
    ) -> Self
    where
        M: From<TransportEvent> + Send + 'static,
    {
        let connection_id = Uuid::new_v4();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tracing::debug!(
            "Connection {} connecting to {}{}",
            connection_id,
            remote_endpoint,
            if tls.is_some() { " (TLS)" } else { "" }
        );

        tokio::spawn(run(
            connection_id,
            remote_endpoint,
            tls,
            connect_timeout,
            verbose,
            events,
            outbound_rx,
            closed.clone(),
        ));

        Self {
            connection_id,
            remote_endpoint,
            outbound,
            closed,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues a package for the writer; returns `false` if the connection is gone.
    pub fn enqueue_send(&self, package: TcpPackage) -> bool {
        !self.is_closed() && self.outbound.send(Outbound::Package(package)).is_ok()
    }

    /// Asks the writer to flush what is queued and shut the socket down.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.outbound.send(Outbound::Close(reason.into()));
    }

    /// A connection with no socket behind it, for exercising the managers.
    #[cfg(test)]
    pub(crate) fn detached(
        remote_endpoint: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Self {
            connection_id: Uuid::new_v4(),
            remote_endpoint,
            outbound,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (connection, outbound_rx)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<M>(
    connection_id: Uuid,
    remote_endpoint: SocketAddr,
    tls: Option<TlsSettings>,
    connect_timeout: Duration,
    verbose: bool,
    events: mpsc::WeakSender<M>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    closed: Arc<AtomicBool>,
) where
    M: From<TransportEvent> + Send + 'static,
{
    let stream = match ClientStream::connect(remote_endpoint, tls.as_ref(), connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Connection {} failed: {}", connection_id, e);
            closed.store(true, Ordering::SeqCst);
            emit(
                &events,
                TransportEvent::Closed {
                    connection_id,
                    reason: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    tracing::debug!("Connection {} established to {}", connection_id, remote_endpoint);
    emit(&events, TransportEvent::Established { connection_id }).await;

    let (mut reader, mut writer) = tokio::io::split(stream);
    let outcome = tokio::select! {
        outcome = read_loop(&mut reader, connection_id, verbose, &events) => outcome,
        outcome = write_loop(&mut writer, connection_id, verbose, &mut outbound_rx) => outcome,
    };
    closed.store(true, Ordering::SeqCst);
    let _ = writer.shutdown().await;

    let reason = match outcome {
        Ok(reason) => reason,
        Err(error) => {
            let reason = error.to_string();
            emit(
                &events,
                TransportEvent::Error {
                    connection_id,
                    error,
                },
            )
            .await;
            reason
        }
    };
    tracing::debug!("Connection {} closed: {}", connection_id, reason);
    emit(
        &events,
        TransportEvent::Closed {
            connection_id,
            reason,
        },
    )
    .await;
}

async fn read_loop<M>(
    reader: &mut ReadHalf<ClientStream>,
    connection_id: Uuid,
    verbose: bool,
    events: &mpsc::WeakSender<M>,
) -> Result<String, ClientError>
where
    M: From<TransportEvent> + Send + 'static,
{
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok("connection closed by server".to_string());
        }
        decoder.extend(&buf[..n]);

        // Drain every complete package; a partial tail stays buffered.
        while let Some(package) = decoder.decode_package()? {
            if verbose {
                tracing::debug!(
                    "Connection {} received {} ({}), {} bytes",
                    connection_id,
                    package.command,
                    package.correlation_id,
                    package.data.len()
                );
            }
            let delivered = emit(
                events,
                TransportEvent::Package {
                    connection_id,
                    package,
                },
            )
            .await;
            if !delivered {
                return Ok("connection owner stopped".to_string());
            }
        }
    }
}

async fn write_loop(
    writer: &mut WriteHalf<ClientStream>,
    connection_id: Uuid,
    verbose: bool,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Result<String, ClientError> {
    while let Some(item) = outbound_rx.recv().await {
        match item {
            Outbound::Package(package) => {
                if verbose {
                    tracing::debug!(
                        "Connection {} sending {} ({}), {} bytes",
                        connection_id,
                        package.command,
                        package.correlation_id,
                        package.data.len()
                    );
                }
                let encoded = package.encode()?;
                writer.write_all(&encoded).await?;
            }
            Outbound::Close(reason) => {
                writer.flush().await?;
                return Ok(reason);
            }
        }
    }
    Ok("connection handle dropped".to_string())
}

async fn emit<M>(events: &mpsc::WeakSender<M>, event: TransportEvent) -> bool
where
    M: From<TransportEvent> + Send + 'static,
{
    match events.upgrade() {
        Some(sender) => sender.send(M::from(event)).await.is_ok(),
        None => false,
    }
}
