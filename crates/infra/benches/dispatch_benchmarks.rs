use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::json;
use std::sync::Arc;
use stockflow_core::{PathSchema, SchemaDefinition, SliceState, StateChanges, StateUpdate, StoreState, TenantId};
use stockflow_events::{Action, EventRecord, Reducer, Reduction, combine_reducers};
use stockflow_infra::event_log::{AttachOptions, EventLog, EventLogConnection, InMemoryEventLog, ReplayTarget};
use stockflow_infra::state_store::{StateStore, StoreHandle, stage};
use stockflow_infra::StateManager;
use tokio::runtime::Runtime;

fn schema() -> Arc<SchemaDefinition> {
    Arc::new(
        SchemaDefinition::builder()
            .path("stock", "items", PathSchema::list_with_identifier("INV_", 5))
            .path("stock", "moves", PathSchema::counter())
            .build()
            .unwrap(),
    )
}

fn stock_reducer() -> Arc<dyn Reducer> {
    Arc::new(|_: &SliceState, action: &Action| match action.action_type() {
        "NEW_ITEM" => Reduction::update(StateUpdate::add("items", json!({"sku": action.str("sku"), "on_hand": 0}))),
        "MOVE" => Reduction::updates(vec![
            StateUpdate::update_item("items", 0, json!({"$set": {"on_hand": action.i64("qty")}})),
            StateUpdate::inc("moves"),
        ]),
        _ => Reduction::none(),
    })
}

async fn manager(log: Arc<InMemoryEventLog>) -> StateManager {
    let connection = Arc::new(EventLogConnection::attach(log, AttachOptions::default()).await.unwrap());
    let reducer = combine_reducers(vec![("stock".into(), stock_reducer())], vec![]).unwrap();
    let store = StoreHandle::new(StateStore::in_memory("main", schema()));
    StateManager::new("main", connection, store, reducer).unwrap()
}

/// Pure apply-engine cost: validate and compute a batch on a copy.
fn bench_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage");

    for updates in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(updates as u64));
        group.bench_with_input(BenchmarkId::new("add_items", updates), &updates, |b, &n| {
            let schema = schema();
            let state = StoreState::initial(&schema);
            let mut changes = StateChanges::new();
            changes.extend(
                "stock",
                (0..n).map(|i| StateUpdate::add("items", json!({"sku": format!("S-{i}")}))),
            );

            b.iter(|| black_box(stage(&schema, &state, 1, &changes).unwrap()));
        });
    }

    group.finish();
}

/// Full dispatch cycle against the in-memory log.
fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");
    group.sample_size(200);

    group.bench_function("move_stock", |b| {
        let tenant = TenantId::new();
        let sm = rt.block_on(async {
            let sm = manager(Arc::new(InMemoryEventLog::with_tenant(tenant))).await;
            sm.dispatch(&Action::new("NEW_ITEM").with("sku", json!("A-1")))
                .await
                .unwrap();
            sm
        });
        let action = Action::new("MOVE").with("qty", json!(5));

        b.iter(|| rt.block_on(async { black_box(sm.dispatch(&action).await.unwrap()) }));
    });

    group.finish();
}

/// Rebuilding a store from the log.
fn bench_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("replay");

    for records in [100u64, 1_000] {
        group.throughput(Throughput::Elements(records));
        group.bench_with_input(BenchmarkId::new("roll_forward", records), &records, |b, &n| {
            let tenant = TenantId::new();
            let log = Arc::new(InMemoryEventLog::with_tenant(tenant));
            rt.block_on(async {
                for seq in 1..=n {
                    let mut changes = StateChanges::new();
                    changes.extend("stock", [StateUpdate::inc("moves")]);
                    log.append(&EventRecord::new(tenant, seq).with_changes("main", changes))
                        .await
                        .unwrap();
                }
            });

            b.iter(|| {
                rt.block_on(async {
                    let connection = EventLogConnection::attach(log.clone(), AttachOptions::default())
                        .await
                        .unwrap();
                    let store = StoreHandle::new(StateStore::in_memory("main", schema()));
                    let targets: [&dyn ReplayTarget; 1] = [&store];
                    black_box(connection.roll_forward_state(&targets, |_| {}).await.unwrap())
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stage, bench_dispatch, bench_replay);
criterion_main!(benches);
