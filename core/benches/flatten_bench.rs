use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use docsync_core::batcher::flatten;
use docsync_core::operation::NodeChange;
use docsync_core::protocol::{decode_client, encode_client, ClientMessage};
use docsync_core::splitter::split_point;
use docsync_core::tree::SerializedNode;
use docsync_core::{MemoryTree, Operation, Replica, SyncConfig, SyncId};

fn text_node(id: &SyncId, text: &str) -> SerializedNode {
    SerializedNode::text(text).with_sync_id(id.clone())
}

/// One create followed by an update per keystroke on the same word
fn typing_burst(keystrokes: usize) -> Vec<Operation> {
    let id = SyncId::from("word");
    let mut text = String::from("a");
    let mut ops = vec![Operation::created("client1", NodeChange::new(text_node(&id, &text)))];
    for _ in 1..keystrokes {
        let before = text_node(&id, &text);
        text.push('a');
        ops.push(Operation::updated(
            "client1",
            NodeChange::new(text_node(&id, &text)).replacing(before),
        ));
    }
    ops
}

/// Benchmark flattening a burst of keystrokes (target: <1ms for 1k)
fn bench_flatten_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("flatten_typing_burst");

    for size in [10, 100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_batched(
                || typing_burst(size),
                |ops| {
                    let flat = flatten(ops);
                    assert_eq!(flat.len(), 1);
                    black_box(flat)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark flattening many distinct nodes (nothing merges)
fn bench_flatten_distinct(c: &mut Criterion) {
    c.bench_function("flatten_1000_distinct_creates", |b| {
        b.iter_batched(
            || {
                (0..1000)
                    .map(|i| {
                        let id = SyncId::from(format!("n{}", i));
                        Operation::created("client1", NodeChange::new(text_node(&id, "w ")))
                    })
                    .collect::<Vec<_>>()
            },
            |ops| black_box(flatten(ops)),
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark the word-boundary scan
fn bench_split_point(c: &mut Criterion) {
    let line = "lorem ".repeat(500);
    c.bench_function("split_point_3k_chars", |b| {
        b.iter(|| black_box(split_point(black_box(&line))));
    });
}

/// Benchmark a full local edit: mutate, split, capture
fn bench_local_edit(c: &mut Criterion) {
    c.bench_function("replica_edit_paragraph_20_words", |b| {
        let sentence = "word ".repeat(20);
        b.iter_batched(
            || Replica::new("client1", MemoryTree::new(), SyncConfig::default()),
            |mut replica| {
                replica.edit(|t| {
                    let p = t.append_paragraph().unwrap();
                    t.append_text(p, &sentence).unwrap();
                });
                black_box(replica.has_pending())
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark wire encoding of a 1k-operation batch
fn bench_wire_round_trip(c: &mut Criterion) {
    let operations: Vec<Operation> = (0..1000)
        .map(|i| {
            let id = SyncId::from(format!("n{}", i));
            Operation::created("client1", NodeChange::new(text_node(&id, "w ")))
        })
        .collect();
    let message = ClientMessage::OperationBatch { operations };
    let encoded = encode_client(&message).unwrap();

    c.bench_function("encode_batch_1k_ops", |b| {
        b.iter(|| black_box(encode_client(&message).unwrap()));
    });
    c.bench_function("decode_batch_1k_ops", |b| {
        b.iter(|| black_box(decode_client(&encoded).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_flatten_typing,
    bench_flatten_distinct,
    bench_split_point,
    bench_local_edit,
    bench_wire_round_trip,
);

criterion_main!(benches);
