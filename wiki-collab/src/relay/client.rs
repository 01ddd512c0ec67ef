//! Relay client: [`SharedCache`] and [`PubSub`] over a WebSocket to a relay server.
//!
//! A background task owns the connection. When it drops, the task reconnects
//! with exponential backoff and resubscribes every channel the process has
//! subscribed to. While disconnected, requests fail fast with
//! [`BusError::Unavailable`] and local subscriptions stay open.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{RelayError, RelayFrame};
use crate::bus::{BusError, ChannelMap, PubSub, SharedCache, Subscription, DEFAULT_CHANNEL_CAPACITY};
use crate::events::RetryPolicy;

const OUTGOING_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Relay client settings.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// `ws://host:port` of the relay
    pub url: String,
    pub request_timeout: Duration,
    /// Reconnect backoff; `max_attempts` is ignored, reconnects never give up
    pub reconnect: RetryPolicy,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
            },
        }
    }
}

struct ClientInner {
    config: RelayClientConfig,
    state: watch::Sender<ConnectionState>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<RelayFrame>>>,
    next_request: AtomicU64,
    /// Local fan-out of messages received from the relay
    channels: ChannelMap,
    subscribed: RwLock<HashSet<String>>,
}

/// WebSocket client of a relay server.
pub struct RelayClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    /// Start the connection task. Returns immediately; the first connect
    /// happens in the background.
    pub fn connect(config: RelayClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(ClientInner {
            config,
            state,
            outgoing: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            channels: ChannelMap::new(DEFAULT_CHANNEL_CAPACITY),
            subscribed: RwLock::new(HashSet::new()),
        });
        let task = tokio::spawn(run_connection(inner.clone()));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Wait until the client is connected, or the timeout elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), BusError> {
        let mut rx = self.inner.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .map(|result| result.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Unavailable("relay client closed".into())),
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// Stop reconnecting and drop the connection.
    pub async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.inner.outgoing.write().await.take();
        self.inner.pending.lock().await.clear();
        self.inner.state.send_replace(ConnectionState::Disconnected);
        log::info!("Relay client for {} closed", self.inner.config.url);
    }

    /// Stop relay delivery for a channel. Open local subscriptions see no
    /// further messages.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        if !self.inner.subscribed.write().await.remove(channel) {
            return Ok(());
        }
        let channel = channel.to_string();
        self.request(|request_id| RelayFrame::Unsubscribe { request_id, channel })
            .await
            .map(|_| ())
    }

    async fn request(&self, build: impl FnOnce(u64) -> RelayFrame) -> Result<RelayFrame, BusError> {
        let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let encoded = build(request_id).encode()?;

        let sender = self
            .inner
            .outgoing
            .read()
            .await
            .clone()
            .ok_or_else(|| BusError::Unavailable("relay not connected".into()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(request_id, tx);
        if sender.send(encoded).await.is_err() {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(BusError::Unavailable("relay connection closed".into()));
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(RelayFrame::Error { message, .. })) => Err(BusError::Protocol(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Unavailable("relay connection lost".into())),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(BusError::Timeout)
            }
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl SharedCache for RelayClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        let key = key.to_string();
        match self.request(|request_id| RelayFrame::Get { request_id, key }).await? {
            RelayFrame::Value { value, .. } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BusError> {
        let (key, value) = (key.to_string(), value.to_vec());
        let ttl_secs = ttl.as_secs().max(1);
        match self
            .request(|request_id| RelayFrame::SetEx {
                request_id,
                key,
                value,
                ttl_secs,
            })
            .await?
        {
            RelayFrame::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl PubSub for RelayClient {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BusError> {
        let (channel, payload) = (channel.to_string(), payload.to_vec());
        match self
            .request(|request_id| RelayFrame::Publish {
                request_id,
                channel,
                payload,
            })
            .await?
        {
            RelayFrame::Ack { receivers, .. } => Ok(receivers as usize),
            other => Err(unexpected(&other)),
        }
    }

    /// Always opens the local subscription. The relay side is registered
    /// now when connected, otherwise on the next (re)connect.
    ///
    /// The session publishes `Connected` while holding the `subscribed`
    /// write lock, so a channel added here is either in the session's
    /// resubscribe snapshot or sees `Connected` and registers itself.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let rx = self.inner.channels.subscribe(channel).await;
        let register = {
            let mut subscribed = self.inner.subscribed.write().await;
            subscribed.insert(channel.to_string())
                && self.connection_state() == ConnectionState::Connected
        };

        if register {
            let name = channel.to_string();
            match self
                .request(|request_id| RelayFrame::Subscribe {
                    request_id,
                    channel: name,
                })
                .await
            {
                Ok(_) => log::debug!("Subscribed to {channel} on relay"),
                Err(e) => log::warn!("Relay subscribe to {channel} failed, retrying on reconnect: {e}"),
            }
        }
        Ok(Subscription::new(channel, rx))
    }
}

fn unexpected(frame: &RelayFrame) -> BusError {
    BusError::Protocol(format!("unexpected reply: {frame:?}"))
}

async fn run_connection(inner: Arc<ClientInner>) {
    let mut attempt: u32 = 0;
    loop {
        let next = if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        inner.state.send_replace(next);

        match tokio_tungstenite::connect_async(inner.config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                log::info!("Connected to relay {}", inner.config.url);
                attempt = 0;
                if let Err(e) = run_session(&inner, ws_stream).await {
                    log::warn!("Relay session with {} ended: {e}", inner.config.url);
                }
                inner.outgoing.write().await.take();
                // Dropping the senders fails every in-flight request.
                inner.pending.lock().await.clear();
                inner.state.send_replace(ConnectionState::Reconnecting);
            }
            Err(e) => {
                log::warn!("Relay {} unreachable: {e}", inner.config.url);
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = inner.config.reconnect.delay(attempt);
        log::info!("Reconnecting to relay {} in {delay:?}", inner.config.url);
        tokio::time::sleep(delay).await;
    }
}

async fn run_session<S>(
    inner: &Arc<ClientInner>,
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
) -> Result<(), RelayError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);

    // Resubscribe before anyone else can use the connection.
    {
        let subscribed = inner.subscribed.write().await;
        for channel in subscribed.iter().cloned() {
            let request_id = inner.next_request.fetch_add(1, Ordering::Relaxed);
            let frame = RelayFrame::Subscribe { request_id, channel };
            ws_writer.send(Message::Binary(frame.encode()?.into())).await?;
        }
        *inner.outgoing.write().await = Some(out_tx.clone());
        inner.state.send_replace(ConnectionState::Connected);
    }

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(data) = outgoing else {
                    return Err(RelayError::ConnectionClosed);
                };
                ws_writer.send(Message::Binary(data.into())).await?;
            }
            incoming = ws_reader.next() => {
                let data = match incoming {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => return Err(RelayError::ConnectionClosed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                };
                let bytes: Vec<u8> = data.into();
                match RelayFrame::decode(&bytes) {
                    Ok(frame) => handle_frame(inner, frame, &out_tx).await,
                    Err(e) => log::warn!("Dropping malformed relay frame: {e}"),
                }
            }
        }
    }
}

async fn handle_frame(inner: &ClientInner, frame: RelayFrame, out_tx: &mpsc::Sender<Vec<u8>>) {
    match frame {
        RelayFrame::Message { channel, payload } => {
            inner.channels.send(&channel, Arc::new(payload)).await;
        }
        RelayFrame::Ping => {
            if let Ok(encoded) = RelayFrame::Pong.encode() {
                let _ = out_tx.try_send(encoded);
            }
        }
        RelayFrame::Pong => {}
        reply => {
            let Some(request_id) = reply.reply_to() else {
                log::debug!("Unexpected frame from relay: {reply:?}");
                return;
            };
            match inner.pending.lock().await.remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(reply);
                }
                // Resubscribe acks and replies to timed-out requests.
                None => log::trace!("No waiter for relay reply {request_id}"),
            }
        }
    }
}
