//! Persistent signaling channel
//!
//! [`SignalingChannel`] owns one socket at a time and runs three tasks per
//! connection:
//! - **writer**: the only task that writes to the socket, fed by a queue
//! - **reader**: decodes frames and publishes them to every subscriber
//! - **keep-alive**: queues `{"type":"socket-ping"}` once per interval
//!
//! `connect` and `disconnect` are serialized and idempotent, so there is
//! never more than one keep-alive timer. After the remote end hangs up,
//! `connect` opens a fresh socket.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::signaling::{SignalingMessage, KEEP_ALIVE_PAYLOAD};
use crate::traits::{FrameSink, FrameStream, SocketConnector};
use crate::{Error, Result};

/// Default keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

const INBOUND_CAPACITY: usize = 256;

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    tasks: [JoinHandle<()>; 3],
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct ChannelInner {
    url: String,
    connector: Arc<dyn SocketConnector>,
    keep_alive: Duration,
    inbound: broadcast::Sender<SignalingMessage>,
    alive: watch::Sender<bool>,
    connection: Mutex<Option<Connection>>,
    round_trip: StdMutex<Option<Duration>>,
}

/// Persistent, bidirectional signaling channel.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl core::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("url", &self.inner.url)
            .field("keep_alive", &self.inner.keep_alive)
            .finish()
    }
}

impl SignalingChannel {
    /// Create a disconnected channel for `url`
    pub fn new(url: impl Into<String>, connector: Arc<dyn SocketConnector>) -> Self {
        Self::with_keep_alive(url, connector, DEFAULT_KEEP_ALIVE)
    }

    /// Create a disconnected channel with a custom keep-alive interval
    pub fn with_keep_alive(
        url: impl Into<String>,
        connector: Arc<dyn SocketConnector>,
        keep_alive: Duration,
    ) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (alive, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                url: url.into(),
                connector,
                keep_alive,
                inbound,
                alive,
                connection: Mutex::new(None),
                round_trip: StdMutex::new(None),
            }),
        }
    }

    /// Create a channel backed by a real WebSocket
    #[cfg(feature = "websocket")]
    pub fn websocket(url: impl Into<String>, keep_alive: Duration) -> Self {
        Self::with_keep_alive(url, Arc::new(crate::socket::WebSocketConnector), keep_alive)
    }

    /// Target URL
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Open the socket and start the connection tasks.
    ///
    /// A no-op while the current connection is alive. A connection whose
    /// stream has ended is torn down and replaced.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.inner.connection.lock().await;
        if connection.is_some() {
            if *self.inner.alive.borrow() {
                return Ok(());
            }
            connection.take();
            tracing::info!(url = %self.inner.url, "replacing closed signaling connection");
        }

        let started = Instant::now();
        let (sink, stream) = self.inner.connector.connect(&self.inner.url).await?;
        let handshake = started.elapsed();
        if let Ok(mut round_trip) = self.inner.round_trip.lock() {
            *round_trip = Some(handshake);
        }
        tracing::info!(url = %self.inner.url, ?handshake, "signaling channel connected");

        let (outbound, queue) = mpsc::unbounded_channel();
        self.inner.alive.send_replace(true);
        let tasks = [
            tokio::spawn(write_frames(sink, queue)),
            tokio::spawn(read_frames(
                stream,
                self.inner.inbound.clone(),
                self.inner.alive.clone(),
            )),
            tokio::spawn(keep_alive(outbound.clone(), self.inner.keep_alive)),
        ];
        *connection = Some(Connection { outbound, tasks });
        Ok(())
    }

    /// Stop the connection tasks and drop the socket; no-op when disconnected
    pub async fn disconnect(&self) {
        let mut connection = self.inner.connection.lock().await;
        if connection.take().is_some() {
            self.inner.alive.send_replace(false);
            tracing::info!(url = %self.inner.url, "signaling channel disconnected");
        }
    }

    /// Whether a connection is currently open
    pub async fn is_connected(&self) -> bool {
        self.inner.connection.lock().await.is_some() && *self.inner.alive.borrow()
    }

    /// Queue a message for the writer task
    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        let frame = message.encode()?;
        let connection = self.inner.connection.lock().await;
        let connection = connection.as_ref().ok_or(Error::NotConnected)?;
        connection.outbound.send(frame).map_err(|_| Error::Closed)?;
        tracing::debug!(kind = message.message_type(), "signaling message queued");
        Ok(())
    }

    /// Subscribe to decoded inbound messages
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.inner.inbound.subscribe()
    }

    /// Resolve once the current connection is gone
    pub async fn closed(&self) {
        let mut alive = self.inner.alive.subscribe();
        // An error means the sender is gone, which also means closed.
        let _ = alive.wait_for(|alive| !*alive).await;
    }

    /// Duration of the most recent handshake
    pub fn round_trip_estimate(&self) -> Option<Duration> {
        self.inner.round_trip.lock().ok().and_then(|r| *r)
    }
}

async fn write_frames(mut sink: FrameSink, mut queue: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::warn!(error = %e, "signaling write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(
    mut stream: FrameStream,
    inbound: broadcast::Sender<SignalingMessage>,
    alive: watch::Sender<bool>,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "signaling read failed");
                break;
            }
        };
        match SignalingMessage::decode(&text) {
            Ok(SignalingMessage::KeepAlive) => tracing::trace!("keep-alive echo"),
            Ok(message) => {
                tracing::debug!(kind = message.message_type(), "signaling message received");
                // No subscribers is fine; the message is simply dropped.
                let _ = inbound.send(message);
            }
            Err(e) => tracing::warn!(error = %e, "dropping malformed signaling frame"),
        }
    }
    tracing::info!("signaling stream ended");
    alive.send_replace(false);
}

async fn keep_alive(outbound: mpsc::UnboundedSender<String>, period: Duration) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if outbound.send(KEEP_ALIVE_PAYLOAD.to_string()).is_err() {
            break;
        }
        tracing::trace!("keep-alive queued");
    }
}
