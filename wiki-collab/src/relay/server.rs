//! WebSocket relay: pub/sub channels plus a TTL key cache shared by collab processes.
//!
//! ```text
//! process A ──┐                      ┌── ChannelMap (channel → broadcast)
//!             ├── RelayServer ───────┤
//! process B ──┘                      └── TtlCache (key → bytes, expiry)
//! ```
//!
//! Each connection gets a writer task fed by an mpsc queue, and one
//! forwarding task per subscribed channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{RelayError, RelayFrame};
use crate::bus::{ChannelMap, TtlCache, CACHE_PURGE_INTERVAL, DEFAULT_CHANNEL_CAPACITY};

/// Frames queued per connection before the writer applies backpressure.
const OUTGOING_CAPACITY: usize = 256;

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub messages_published: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    messages_published: AtomicU64,
}

struct RelayState {
    channels: ChannelMap,
    cache: TtlCache,
    stats: AtomicRelayStats,
}

/// The relay server.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(addr: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState {
                channels: ChannelMap::new(DEFAULT_CHANNEL_CAPACITY),
                cache: TtlCache::new(),
                stats: AtomicRelayStats::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> RelayStats {
        let stats = &self.state.stats;
        RelayStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            messages_published: stats.messages_published.load(Ordering::Relaxed),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), RelayError> {
        log::info!("Collab relay listening on {}", self.local_addr()?);

        let purge_state = self.state.clone();
        let purger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                let purged = purge_state.cache.purge_expired().await;
                if purged > 0 {
                    log::debug!("Purged {purged} expired cache entries");
                }
            }
        });

        let result = loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(RelayError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, state).await {
                    log::warn!("Relay connection from {addr} ended with error: {e}");
                }
            });
        };
        purger.abort();
        result
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("Relay connection established from {addr}");

    state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    state.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    let result = loop {
        let data = match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(RelayError::WebSocket(e)),
        };
        state.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let bytes: Vec<u8> = data.into();
        let frame = match RelayFrame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed frame from {addr}: {e}");
                continue;
            }
        };

        let Some(reply) = handle_frame(frame, &state, &out_tx, &mut subscriptions).await else {
            continue;
        };
        let encoded = match reply.encode() {
            Ok(encoded) => encoded,
            Err(e) => break Err(e),
        };
        if out_tx.send(encoded).await.is_err() {
            break Err(RelayError::ConnectionClosed);
        }
    };

    for (_, task) in subscriptions.drain() {
        task.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    state.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Relay connection from {addr} closed");
    result
}

async fn handle_frame(
    frame: RelayFrame,
    state: &RelayState,
    out_tx: &mpsc::Sender<Vec<u8>>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
) -> Option<RelayFrame> {
    match frame {
        RelayFrame::Publish {
            request_id,
            channel,
            payload,
        } => {
            let receivers = state.channels.send(&channel, Arc::new(payload)).await;
            state.stats.messages_published.fetch_add(1, Ordering::Relaxed);
            log::trace!("Published on {channel} to {receivers} subscribers");
            Some(RelayFrame::Ack {
                request_id,
                receivers: receivers as u64,
            })
        }
        RelayFrame::Subscribe {
            request_id,
            channel,
        } => {
            if !subscriptions.contains_key(&channel) {
                let rx = state.channels.subscribe(&channel).await;
                let task = tokio::spawn(forward(channel.clone(), rx, out_tx.clone()));
                subscriptions.insert(channel, task);
            }
            Some(RelayFrame::Ack {
                request_id,
                receivers: 0,
            })
        }
        RelayFrame::Unsubscribe {
            request_id,
            channel,
        } => {
            if let Some(task) = subscriptions.remove(&channel) {
                task.abort();
            }
            Some(RelayFrame::Ack {
                request_id,
                receivers: 0,
            })
        }
        RelayFrame::Get { request_id, key } => Some(RelayFrame::Value {
            request_id,
            value: state.cache.get(&key).await,
        }),
        RelayFrame::SetEx {
            request_id,
            key,
            value,
            ttl_secs,
        } => {
            if ttl_secs == 0 {
                return Some(RelayFrame::Error {
                    request_id,
                    message: "ttl must be positive".into(),
                });
            }
            state
                .cache
                .set_ex(&key, value, Duration::from_secs(ttl_secs))
                .await;
            Some(RelayFrame::Ack {
                request_id,
                receivers: 0,
            })
        }
        RelayFrame::Ping => Some(RelayFrame::Pong),
        RelayFrame::Pong => None,
        other => {
            log::debug!("Unexpected frame from client: {other:?}");
            None
        }
    }
}

/// Push channel messages to one connection until either side goes away.
async fn forward(
    channel: String,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    out_tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        let payload = match rx.recv().await {
            Ok(payload) => payload,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Relay subscriber on {channel} lagged, skipped {skipped} messages");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let frame = RelayFrame::Message {
            channel: channel.clone(),
            payload: payload.as_ref().clone(),
        };
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed to encode message on {channel}: {e}");
                continue;
            }
        };
        if out_tx.send(encoded).await.is_err() {
            break;
        }
    }
}
