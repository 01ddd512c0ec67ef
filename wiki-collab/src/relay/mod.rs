//! Shared transport over a WebSocket relay.
//!
//! ```text
//! ┌──────────────┐   ws   ┌─────────────┐   ws   ┌──────────────┐
//! │ RelayClient  │ ◄────► │ RelayServer │ ◄────► │ RelayClient  │
//! │ (process A)  │ frames │ pub/sub+TTL │ frames │ (process B)  │
//! └──────────────┘        └─────────────┘        └──────────────┘
//! ```
//!
//! - [`protocol`]: bincode-encoded [`RelayFrame`]s
//! - [`server`]: the relay run by the `collab-relay` binary
//! - [`client`]: [`crate::bus::SharedCache`] + [`crate::bus::PubSub`] implementation

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ConnectionState, RelayClient, RelayClientConfig};
pub use protocol::{RelayError, RelayFrame};
pub use server::{RelayServer, RelayStats};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{PubSub, SharedCache};
    use std::time::Duration;

    async fn start_relay() -> String {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        format!("ws://{addr}")
    }

    async fn connected_client(url: &str) -> RelayClient {
        let client = RelayClient::connect(RelayClientConfig::new(url));
        client.wait_connected(Duration::from_secs(5)).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_publish_reaches_other_client() {
        let url = start_relay().await;
        let a = connected_client(&url).await;
        let b = connected_client(&url).await;

        let mut sub = b.subscribe("wiki:yjs:updates").await.unwrap();
        assert_eq!(a.publish("wiki:yjs:updates", b"delta").await.unwrap(), 1);

        let received = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*received, b"delta".to_vec());
    }

    #[tokio::test]
    async fn test_publisher_receives_own_message() {
        let url = start_relay().await;
        let a = connected_client(&url).await;
        let mut sub = a.subscribe("c").await.unwrap();

        a.publish("c", b"echo").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*received, b"echo".to_vec());
    }

    #[tokio::test]
    async fn test_cache_shared_between_clients() {
        let url = start_relay().await;
        let a = connected_client(&url).await;
        let b = connected_client(&url).await;

        a.set_ex("wiki:doc:page.1", b"snapshot", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            b.get("wiki:doc:page.1").await.unwrap(),
            Some(b"snapshot".to_vec())
        );
        assert_eq!(b.get("wiki:doc:page.2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let url = start_relay().await;
        let a = connected_client(&url).await;
        let b = connected_client(&url).await;

        let _sub = b.subscribe("c").await.unwrap();
        assert_eq!(a.publish("c", b"1").await.unwrap(), 1);
        b.unsubscribe("c").await.unwrap();
        assert_eq!(a.publish("c", b"2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_while_connecting_reaches_relay() {
        let url = start_relay().await;
        let a = connected_client(&url).await;
        let b = RelayClient::connect(RelayClientConfig::new(&url));

        let mut subscriptions = Vec::new();
        for i in 0..20 {
            subscriptions.push(b.subscribe(&format!("c{i}")).await.unwrap());
            tokio::task::yield_now().await;
        }
        b.wait_connected(Duration::from_secs(5)).await.unwrap();

        for i in 0..20 {
            let channel = format!("c{i}");
            let mut receivers = 0;
            for _ in 0..100 {
                receivers = a.publish(&channel, b"x").await.unwrap();
                if receivers == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(receivers, 1, "{channel} never registered on the relay");
        }
    }
}
