use divan::{black_box, AllocProfiler, Bencher};
use serde_json::json;
use viewsync::engine::types::row_from_json;
use viewsync::engine::{RowChangeEvent, VersionedBatch};
use viewsync::schema::DEFAULT_CLIENTS_TABLE;
use viewsync::{Operator, Pipeline, Replica, ReplicaSchema, SchemaConfig};

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

// --------------------------------------------------------------------------
// Fixtures
// --------------------------------------------------------------------------

fn schema() -> ReplicaSchema {
    let config: SchemaConfig = serde_json::from_value(json!({
        "tables": {
            "thread": {"primaryKey": ["id"]},
            "comment": {"primaryKey": ["id"]}
        }
    }))
    .unwrap();
    ReplicaSchema::from_config(config, DEFAULT_CLIENTS_TABLE).unwrap()
}

fn thread(id: usize) -> RowChangeEvent {
    RowChangeEvent::insert(
        "thread",
        row_from_json(json!({"id": id, "title": format!("thread {id}"), "active": id % 3 != 0})),
    )
}

fn comment(id: usize, threads: usize) -> RowChangeEvent {
    RowChangeEvent::insert(
        "comment",
        row_from_json(json!({"id": id, "thread": id % threads, "content": "x".repeat(64)})),
    )
}

/// Replica with `threads` threads and ten comments each.
fn seeded(schema: &ReplicaSchema, threads: usize) -> Replica {
    let mut changes: Vec<RowChangeEvent> = (0..threads).map(thread).collect();
    changes.extend((0..threads * 10).map(|id| comment(id, threads)));
    let mut replica = Replica::new();
    replica
        .apply(schema, VersionedBatch { version: 1, changes })
        .unwrap();
    replica
}

fn active_threads_with_comments() -> Operator {
    serde_json::from_value(json!({
        "op": "join",
        "left": {"op": "scan", "table": "thread", "filter": {"type": "eq", "field": "active", "value": true}},
        "right": {"op": "scan", "table": "comment"},
        "on": {"leftField": "id", "rightField": "thread"},
        "alias": "comment"
    }))
    .unwrap()
}

fn comments_per_thread() -> Operator {
    serde_json::from_value(json!({
        "op": "groupBy",
        "input": {"op": "scan", "table": "comment"},
        "name": "per_thread",
        "keys": [{"field": "thread"}],
        "aggregates": [{"fn": "count", "alias": "n"}]
    }))
    .unwrap()
}

/// 100 new comments spread over existing threads.
fn new_comments(replica: &Replica, threads: usize) -> Vec<RowChangeEvent> {
    let start = replica.row_count();
    (start..start + 100).map(|id| comment(id, threads)).collect()
}

// --------------------------------------------------------------------------
// Benchmarks
// --------------------------------------------------------------------------

#[divan::bench(args = [1_000, 10_000])]
fn bench_hydrate_join(bencher: Bencher, threads: usize) {
    let schema = schema();
    let replica = seeded(&schema, threads);
    let query = active_threads_with_comments();
    bencher
        .with_inputs(|| Pipeline::build(&query, &schema).unwrap())
        .bench_values(|mut pipeline| black_box(pipeline.hydrate(&replica).unwrap()));
}

#[divan::bench(args = [1_000, 10_000], sample_count = 100)]
fn bench_apply_join(bencher: Bencher, threads: usize) {
    let schema = schema();
    let replica = seeded(&schema, threads);
    let query = active_threads_with_comments();
    let events = new_comments(&replica, threads);
    bencher
        .with_inputs(|| {
            let mut pipeline = Pipeline::build(&query, &schema).unwrap();
            pipeline.hydrate(&replica).unwrap();
            pipeline
        })
        .bench_values(|mut pipeline| {
            black_box(pipeline.apply(&events).unwrap());
            pipeline
        });
}

#[divan::bench(args = [1_000, 10_000], sample_count = 100)]
fn bench_apply_group_by(bencher: Bencher, threads: usize) {
    let schema = schema();
    let replica = seeded(&schema, threads);
    let query = comments_per_thread();
    let events = new_comments(&replica, threads);
    bencher
        .with_inputs(|| {
            let mut pipeline = Pipeline::build(&query, &schema).unwrap();
            pipeline.hydrate(&replica).unwrap();
            pipeline
        })
        .bench_values(|mut pipeline| {
            black_box(pipeline.apply(&events).unwrap());
            pipeline
        });
}
