//! Cross-process propagation of document updates and presence.
//!
//! Two `TestHost`s share one store and one in-memory bus, standing in for
//! two collab processes behind a load balancer.

mod common;

use std::sync::Arc;

use common::{append_paragraph, eventually, presence, settle, Cluster};
use wiki_collab::bus::{PubSub, SharedCache};
use wiki_collab::replica::{Origin, Replica};
use wiki_collab::sync::SyncEnvelope;

#[tokio::test]
async fn test_edit_propagates_between_processes() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);

    let on_a = cluster.a.open(&name, &token).await.unwrap();
    let on_b = cluster.b.open(&name, &token).await.unwrap();

    cluster.a.edit(&on_a, "hello").await;

    let converged = eventually(|| {
        let replica = on_b.replica.clone();
        async move { wiki_collab::content::plain_text(&replica.content_json()) == "hello" }
    })
    .await;
    assert!(converged, "process B never saw the edit");
    assert_eq!(on_a.replica.content_json(), on_b.replica.content_json());
}

#[tokio::test]
async fn test_remote_apply_is_not_republished() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);

    let on_a = cluster.a.open(&name, &token).await.unwrap();
    let _on_b = cluster.b.open(&name, &token).await.unwrap();

    cluster.a.edit(&on_a, "once").await;
    let sync_b = cluster.b.document_sync.clone().unwrap();
    assert!(eventually(|| { let s = sync_b.clone(); async move { s.stats().applied == 1 } }).await);
    settle().await;

    let sync_a = cluster.a.document_sync.clone().unwrap();
    assert_eq!(sync_a.stats().published, 1);
    assert_eq!(sync_b.stats().published, 0);
    assert_eq!(cluster.bus.stats().await.messages_published, 1);
}

#[tokio::test]
async fn test_own_messages_are_filtered() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);
    let on_a = cluster.a.open(&name, &token).await.unwrap();

    cluster.a.edit(&on_a, "mine").await;
    let sync_a = cluster.a.document_sync.clone().unwrap();
    assert!(eventually(|| { let s = sync_a.clone(); async move { s.stats().dropped >= 1 } }).await);
    assert_eq!(sync_a.stats().applied, 0);
    assert_eq!(wiki_collab::content::plain_text(&on_a.replica.content_json()), "mine");
}

#[tokio::test]
async fn test_duplicated_and_reordered_deltas_converge() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);
    let on_b = cluster.b.open(&name, &token).await.unwrap();

    // A third writer outside the cluster produces three sequential edits.
    let source = Replica::new();
    let deltas: Vec<Vec<u8>> = ["one", "two", "three"]
        .iter()
        .map(|text| source.transact_local(None, |txn, fragment| append_paragraph(txn, fragment, text)))
        .collect();

    for index in [2, 0, 2, 1, 0] {
        let bytes = SyncEnvelope::new("process-z", &name, &deltas[index]).encode().unwrap();
        cluster.bus.publish("wiki:yjs:updates", &bytes).await.unwrap();
    }

    let expected = source.content_json();
    let converged = eventually(|| {
        let (replica, expected) = (on_b.replica.clone(), expected.clone());
        async move { replica.content_json() == expected }
    })
    .await;
    assert!(converged, "replica diverged under duplication and reordering");
}

#[tokio::test]
async fn test_late_joiner_loads_cached_snapshot() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);

    let on_a = cluster.a.open(&name, &token).await.unwrap();
    cluster.a.edit(&on_a, "not yet checkpointed").await;
    assert_eq!(cluster.workspace.store.page_writes(), 0);

    let on_b = cluster.b.open(&name, &token).await.unwrap();
    assert_eq!(on_b.replica.content_json(), on_a.replica.content_json());
}

#[tokio::test]
async fn test_cache_outage_keeps_local_editing_and_checkpoints() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);
    let on_a = cluster.a.open(&name, &token).await.unwrap();

    cluster.bus.set_available(false);
    cluster.a.edit(&on_a, "offline edit").await;
    cluster.a.checkpoint(&on_a).await;

    assert_eq!(wiki_collab::content::plain_text(&on_a.replica.content_json()), "offline edit");
    assert_eq!(cluster.workspace.store.page_writes(), 1);
    let page = cluster.workspace.page().await;
    assert_eq!(page.text_content.as_deref(), Some("offline edit"));

    let sync_a = cluster.a.document_sync.clone().unwrap();
    assert!(sync_a.stats().cache_failures >= 1);
    assert_eq!(sync_a.stats().published, 0);
}

#[tokio::test]
async fn test_presence_propagates() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);
    let on_a = cluster.a.open(&name, &token).await.unwrap();
    let on_b = cluster.b.open(&name, &token).await.unwrap();

    let (client, update) = presence("alice");
    on_a.replica.apply_awareness_delta(&update, Origin::Local).unwrap();

    let replica_b = on_b.replica.clone();
    assert!(eventually(|| {
        let r = replica_b.clone();
        async move { r.awareness_clients().contains(&client) }
    })
    .await);

    let awareness_b = cluster.b.awareness_sync.clone().unwrap();
    assert!(awareness_b.remote_clients(&name).await.contains(&client));
}

#[tokio::test]
async fn test_remote_client_timeout_not_propagated() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);
    let on_a = cluster.a.open(&name, &token).await.unwrap();
    let on_b = cluster.b.open(&name, &token).await.unwrap();

    let (client, update) = presence("alice");
    on_a.replica.apply_awareness_delta(&update, Origin::Local).unwrap();
    let awareness_b = cluster.b.awareness_sync.clone().unwrap();
    assert!(eventually(|| {
        let a = awareness_b.clone();
        let name = name.clone();
        async move { a.remote_clients(&name).await.contains(&client) }
    })
    .await);

    // B's heartbeat check expires the remote client locally.
    on_b.replica.remove_awareness_client(client);
    settle().await;

    assert_eq!(awareness_b.stats().suppressed_removals, 1);
    assert_eq!(awareness_b.stats().published, 0);
    assert!(on_a.replica.awareness_clients().contains(&client));
}

#[tokio::test]
async fn test_local_disconnect_propagates_removal() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);
    let on_a = cluster.a.open(&name, &token).await.unwrap();
    let on_b = cluster.b.open(&name, &token).await.unwrap();

    let (client, update) = presence("alice");
    on_a.replica.apply_awareness_delta(&update, Origin::Local).unwrap();
    let replica_b = on_b.replica.clone();
    assert!(eventually(|| {
        let r = replica_b.clone();
        async move { r.awareness_clients().contains(&client) }
    })
    .await);

    on_a.replica.remove_awareness_client(client);
    assert!(eventually(|| {
        let r = replica_b.clone();
        async move { !r.awareness_clients().contains(&client) }
    })
    .await);
}

#[tokio::test]
async fn test_unloaded_document_ignores_updates() {
    let cluster = Cluster::start().await;
    let name = cluster.workspace.document_name();
    let token = cluster.workspace.token(cluster.workspace.writer);
    let on_a = cluster.a.open(&name, &token).await.unwrap();
    let on_b = cluster.b.open(&name, &token).await.unwrap();
    cluster.b.unload(&on_b).await;

    cluster.a.edit(&on_a, "after unload").await;
    let sync_b = cluster.b.document_sync.clone().unwrap();
    assert!(eventually(|| { let s = sync_b.clone(); async move { s.stats().dropped >= 1 } }).await);
    assert_eq!(sync_b.stats().applied, 0);

    // The cache still serves the newest state to the next opener.
    let cached = cluster
        .bus
        .get(&format!("wiki:doc:{name}"))
        .await
        .unwrap()
        .unwrap();
    let fresh = Arc::new(Replica::new());
    fresh.apply_delta(&cached, Origin::RemoteSync, None).unwrap();
    assert_eq!(fresh.content_json(), on_a.replica.content_json());
}
