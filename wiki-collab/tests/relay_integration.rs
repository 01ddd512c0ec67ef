//! Two collab processes synchronizing through a live relay server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, presence, TestHost, Workspace};
use wiki_collab::events::PageEvents;
use wiki_collab::relay::{ConnectionState, RelayClient, RelayClientConfig, RelayServer};
use wiki_collab::replica::Origin;

async fn start_relay() -> String {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    format!("ws://{addr}")
}

async fn relay_host(process_id: &str, url: &str, workspace: &Workspace) -> (TestHost, Arc<RelayClient>) {
    let client = Arc::new(RelayClient::connect(RelayClientConfig::new(url)));
    client.wait_connected(Duration::from_secs(5)).await.unwrap();
    let host = TestHost::start(
        process_id,
        workspace.store.clone(),
        client.clone(),
        client.clone(),
        PageEvents::new(),
        None,
        true,
    )
    .await;
    (host, client)
}

#[tokio::test]
async fn test_hello_propagates_through_relay() {
    let url = start_relay().await;
    let workspace = Workspace::seed().await;
    let (a, _client_a) = relay_host("relay-a", &url, &workspace).await;
    let (b, _client_b) = relay_host("relay-b", &url, &workspace).await;

    let name = workspace.document_name();
    let token = workspace.token(workspace.writer);
    let on_a = a.open(&name, &token).await.unwrap();
    let on_b = b.open(&name, &token).await.unwrap();

    a.edit(&on_a, "hello").await;
    let converged = eventually(|| {
        let replica = on_b.replica.clone();
        async move { wiki_collab::content::plain_text(&replica.content_json()) == "hello" }
    })
    .await;
    assert!(converged, "edit never crossed the relay");

    let (client, update) = presence("bob");
    on_b.replica.apply_awareness_delta(&update, Origin::Local).unwrap();
    let replica_a = on_a.replica.clone();
    assert!(eventually(|| {
        let r = replica_a.clone();
        async move { r.awareness_clients().contains(&client) }
    })
    .await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_reads_relay_cache() {
    let url = start_relay().await;
    let workspace = Workspace::seed().await;
    let (a, _client_a) = relay_host("relay-a", &url, &workspace).await;
    let (b, _client_b) = relay_host("relay-b", &url, &workspace).await;

    let name = workspace.document_name();
    let token = workspace.token(workspace.writer);
    let on_a = a.open(&name, &token).await.unwrap();
    a.edit(&on_a, "cached").await;

    let on_b = b.open(&name, &token).await.unwrap();
    assert_eq!(on_b.replica.content_json(), on_a.replica.content_json());
}

#[tokio::test]
async fn test_relay_down_degrades_to_local() {
    let workspace = Workspace::seed().await;
    let client = Arc::new(RelayClient::connect(RelayClientConfig::new("ws://127.0.0.1:1")));
    let host = TestHost::start(
        "offline",
        workspace.store.clone(),
        client.clone(),
        client.clone(),
        PageEvents::new(),
        None,
        true,
    )
    .await;
    assert_ne!(client.connection_state(), ConnectionState::Connected);

    let session = host
        .open(&workspace.document_name(), &workspace.token(workspace.writer))
        .await
        .unwrap();
    host.edit(&session, "local only").await;
    host.checkpoint(&session).await;

    assert_eq!(workspace.store.page_writes(), 1);
    client.close().await;
}
