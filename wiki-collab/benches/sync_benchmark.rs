use std::collections::HashSet;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use uuid::Uuid;
use wiki_collab::content;
use wiki_collab::persistence::{plan_checkpoint, Projection};
use wiki_collab::relay::RelayFrame;
use wiki_collab::replica::{Origin, Replica};
use wiki_collab::storage::{AttachmentRecord, PageRecord};
use wiki_collab::sync::SyncEnvelope;
use yrs::{XmlElementPrelim, XmlFragment, XmlTextPrelim};

/// A page of `paragraphs` short paragraphs with an image every tenth.
fn sample_doc(paragraphs: usize) -> Value {
    let nodes: Vec<Value> = (0..paragraphs)
        .map(|i| {
            if i % 10 == 9 {
                json!({"type": "image", "attrs": {"attachmentId": Uuid::new_v4().to_string()}})
            } else {
                json!({"type": "paragraph", "content": [
                    {"type": "text", "text": format!("Paragraph {i} of the benchmark page")},
                    {"type": "text", "text": " bold", "marks": [{"type": "bold"}]}
                ]})
            }
        })
        .collect();
    json!({"type": "doc", "content": nodes})
}

fn typing_delta(replica: &Replica) -> Vec<u8> {
    replica.transact_local(None, |txn, fragment| {
        let index = fragment.len(&*txn);
        let paragraph = fragment.insert(txn, index, XmlElementPrelim::empty("paragraph"));
        paragraph.insert(txn, 0, XmlTextPrelim::new("a"));
    })
}

fn bench_envelope_encode(c: &mut Criterion) {
    let delta = vec![0u8; 64]; // Typical keystroke delta

    c.bench_function("envelope_encode_64B", |b| {
        b.iter(|| {
            let envelope = SyncEnvelope::new(black_box("node-abc123"), black_box("page.1"), &delta);
            black_box(envelope.encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = SyncEnvelope::new("node-abc123", "page.1", &[0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("envelope_decode_64B", |b| {
        b.iter(|| black_box(SyncEnvelope::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_relay_frame_roundtrip(c: &mut Criterion) {
    c.bench_function("relay_frame_roundtrip_256B", |b| {
        b.iter(|| {
            let frame = RelayFrame::Publish {
                request_id: 1,
                channel: "wiki:yjs:updates".into(),
                payload: vec![0u8; 256],
            };
            let encoded = frame.encode().unwrap();
            black_box(RelayFrame::decode(&encoded).unwrap());
        })
    });
}

fn bench_apply_remote_delta(c: &mut Criterion) {
    let source = Replica::new();
    let deltas: Vec<Vec<u8>> = (0..100).map(|_| typing_delta(&source)).collect();

    c.bench_function("apply_100_remote_deltas", |b| {
        b.iter(|| {
            let replica = Replica::new();
            for delta in &deltas {
                replica.apply_delta(delta, Origin::RemoteSync, None).unwrap();
            }
            black_box(replica);
        })
    });
}

fn bench_content_projection(c: &mut Criterion) {
    let replica = Replica::new();
    replica.import_content(&sample_doc(200)).unwrap();

    c.bench_function("content_json_200_nodes", |b| {
        b.iter(|| black_box(replica.content_json()))
    });
}

fn bench_plan_checkpoint(c: &mut Criterion) {
    let doc = sample_doc(200);
    let page = PageRecord::new(Uuid::new_v4(), Uuid::new_v4(), Some(Uuid::new_v4()));
    let attachments: Vec<AttachmentRecord> = content::attachment_ids(&doc)
        .into_iter()
        .chain((0..20).map(|_| Uuid::new_v4()))
        .map(|id| AttachmentRecord {
            id,
            page_id: page.id,
            deleted_at: None,
        })
        .collect();
    let projection = Projection {
        text: content::plain_text(&doc),
        content: doc,
        snapshot: vec![0u8; 4096],
    };
    let contributors: HashSet<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

    c.bench_function("plan_checkpoint_200_nodes", |b| {
        b.iter(|| {
            black_box(plan_checkpoint(
                &page,
                &attachments,
                &projection,
                &contributors,
                Some(Uuid::nil()),
            ))
        })
    });
}

fn bench_full_state_encode(c: &mut Criterion) {
    let replica = Replica::new();
    replica.import_content(&sample_doc(200)).unwrap();

    c.bench_function("encode_full_state_200_nodes", |b| {
        b.iter(|| black_box(replica.encode_full_state()))
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_relay_frame_roundtrip,
    bench_apply_remote_delta,
    bench_content_projection,
    bench_plan_checkpoint,
    bench_full_state_encode,
);
criterion_main!(benches);
