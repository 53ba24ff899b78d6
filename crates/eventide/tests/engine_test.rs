//! End-to-end tests of the dispatch → pipeline → version path

use eventide::prelude::*;
use rusqlite::params;
use serde_json::Value;

// A model keeping one row per id with the version that last touched it.
struct FooModel;

impl Reducer for FooModel {
    fn reduce(&self, _model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
        if event.event_type != "ADD" {
            return Ok(Reduction::none());
        }
        Ok(Reduction::changes(json!({
            "set": [{ "id": event.data["id"], "v": event.v }]
        })))
    }
}

impl Applier for FooModel {
    fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()> {
        for row in changes["set"].as_array().into_iter().flatten() {
            model.execute(
                "INSERT OR REPLACE INTO foo (id, v) VALUES (?1, ?2)",
                params![
                    row["id"].as_str().unwrap_or_default(),
                    row["v"].as_u64().unwrap_or_default() as i64
                ],
            )?;
        }
        Ok(())
    }
}

fn foo_model() -> ModelDef {
    ModelDef::new("foo")
        .with_migration("init", |conn| {
            conn.execute("CREATE TABLE foo (id TEXT PRIMARY KEY, v INTEGER NOT NULL)", [])
                .map_err(|e| EventideError::Store(e.to_string()))?;
            Ok(())
        })
        .with_reducer(FooModel)
        .with_apply_changes(FooModel)
}

fn foo_row(db: &EventideDb, id: &str) -> Option<i64> {
    db.store()
        .query_row("SELECT v FROM foo WHERE id = ?1", [id], |r| r.get(0))
        .unwrap()
}

#[tokio::test]
async fn add_one_advances_version_and_table() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();

    let event = db.dispatch("ADD", json!({"id": "a"})).await.unwrap();
    assert_eq!(event.v, 1);
    assert_eq!(event.event_type, "ADD");
    let result = event.result.as_ref().unwrap();
    assert!(result.contains_key("foo"));

    assert_eq!(db.current_version().await.unwrap(), 1);
    assert_eq!(foo_row(&db, "a"), Some(1));

    db.close().await.unwrap();
}

#[tokio::test]
async fn versions_stay_dense_and_monotonic() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();

    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        let event = db.dispatch("ADD", json!({ "id": id })).await.unwrap();
        assert_eq!(event.v, i as Version + 1);
        // dispatch resolves once its version is the persisted version
        assert_eq!(db.current_version().await.unwrap(), event.v);
    }

    assert_eq!(db.queue().latest_version().unwrap(), 3);
    assert_eq!(foo_row(&db, "c"), Some(3));
    db.close().await.unwrap();
}

#[tokio::test]
async fn handled_version_resolves_from_stored_row_when_past() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();
    db.dispatch("ADD", json!({"id": "a"})).await.unwrap();

    let replay = db.handled_version(1).await.unwrap();
    assert_eq!(replay.v, 1);
    assert_eq!(replay.event_type, "ADD");
    db.close().await.unwrap();
}

#[tokio::test]
async fn wait_for_queue_drains_externally_added_events() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();

    db.queue().add("ADD", json!({"id": "x"}), None).unwrap();
    db.queue().add("ADD", json!({"id": "y"}), None).unwrap();

    let last = db.wait_for_queue().await.unwrap().unwrap();
    assert_eq!(last.v, 2);
    assert_eq!(db.current_version().await.unwrap(), 2);
    assert_eq!(foo_row(&db, "y"), Some(2));
    db.close().await.unwrap();
}

#[tokio::test]
async fn empty_queue_wait_resolves_immediately() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();
    assert!(db.wait_for_queue().await.unwrap().is_none());
    db.close().await.unwrap();
}

// S2: one reducer fails, its peer succeeds; nothing commits.

struct FailingReducer;

impl Reducer for FailingReducer {
    fn reduce(&self, _model: &ModelView<'_>, _event: &Event) -> Result<Reduction> {
        Err(EventideError::InvalidState("reducer A exploded".into()))
    }
}

impl Applier for FailingReducer {
    fn apply(&self, _model: &ModelTable<'_>, _changes: &Value) -> Result<()> {
        Ok(())
    }
}

struct TableBReducer;

impl Reducer for TableBReducer {
    fn reduce(&self, _model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
        Ok(Reduction::changes(json!({ "id": event.data["id"] })))
    }
}

impl Applier for TableBReducer {
    fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()> {
        model.execute(
            "INSERT INTO b (id) VALUES (?1)",
            [changes["id"].as_str().unwrap_or_default()],
        )?;
        Ok(())
    }
}

#[tokio::test]
async fn reducer_errors_are_isolated_and_aggregate() {
    let models = vec![
        ModelDef::new("a")
            .with_reducer(FailingReducer)
            .with_apply_changes(FailingReducer),
        ModelDef::new("b")
            .with_migration("init", |conn| {
                conn.execute("CREATE TABLE b (id TEXT PRIMARY KEY)", [])
                    .map_err(|e| EventideError::Store(e.to_string()))?;
                Ok(())
            })
            .with_reducer(TableBReducer)
            .with_apply_changes(TableBReducer),
    ];
    let config = EngineConfig::memory().with_stop_on_error(true);
    let db = EventideDb::open(config, models).unwrap();

    let err = db.dispatch("ADD", json!({"id": "a"})).await.unwrap_err();
    let event = match err {
        EventideError::EventFailed(event) => event,
        other => panic!("expected EventFailed, got {other}"),
    };

    let error = event.error.as_ref().unwrap();
    assert!(error.contains_key("reduce_a"));
    assert!(!error.contains_key("reduce_b"));
    assert!(event.result.is_none());

    // version did not advance, peer table untouched
    assert_eq!(db.current_version().await.unwrap(), 0);
    let b_rows: Option<i64> = db
        .store()
        .query_row("SELECT COUNT(*) FROM b", [], |r| r.get(0))
        .unwrap();
    assert_eq!(b_rows, Some(0));

    db.close().await.unwrap();
}

#[tokio::test]
async fn observers_see_events_in_commit_order() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();
    let mut handled = db.on_handled();
    let mut results = db.on_result();

    for id in ["a", "b", "c"] {
        db.dispatch("ADD", json!({ "id": id })).await.unwrap();
    }

    for expected in 1..=3 {
        assert_eq!(handled.recv().await.unwrap().v, expected);
        assert_eq!(results.recv().await.unwrap().v, expected);
    }
    db.close().await.unwrap();
}

#[tokio::test]
async fn dispatch_rejects_empty_type() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();
    let err = db.dispatch("", json!(null)).await.unwrap_err();
    assert!(matches!(err, EventideError::InvalidEvent(_)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_later_dispatch() {
    let db = EventideDb::open(EngineConfig::memory(), vec![foo_model()]).unwrap();
    db.dispatch("ADD", json!({"id": "a"})).await.unwrap();
    db.close().await.unwrap();
    db.close().await.unwrap();

    let err = db.dispatch("ADD", json!({"id": "b"})).await.unwrap_err();
    assert!(matches!(err, EventideError::Closed));
}

// A deriver maintaining a count cache; exercises write access after apply.

struct CountDeriver;

impl Deriver for CountDeriver {
    fn derive(&self, cx: &mut DeriveContext<'_>) -> Result<()> {
        let total: i64 = cx
            .model
            .query_row("SELECT COUNT(*) FROM foo", [], |r| r.get(0))?
            .unwrap_or(0);
        cx.model.execute(
            "INSERT OR REPLACE INTO foo_stats (k, n) VALUES ('total', ?1)",
            [total],
        )?;
        Ok(())
    }
}

#[tokio::test]
async fn derivers_run_after_apply_with_write_access() {
    let models = vec![
        foo_model(),
        ModelDef::new("foo_stats")
            .with_migration("init", |conn| {
                conn.execute("CREATE TABLE foo_stats (k TEXT PRIMARY KEY, n INTEGER)", [])
                    .map_err(|e| EventideError::Store(e.to_string()))?;
                Ok(())
            })
            .with_deriver(CountDeriver),
    ];
    let db = EventideDb::open(EngineConfig::memory(), models).unwrap();

    db.dispatch("ADD", json!({"id": "a"})).await.unwrap();
    db.dispatch("ADD", json!({"id": "b"})).await.unwrap();

    let total: Option<i64> = db
        .store()
        .query_row("SELECT n FROM foo_stats WHERE k = 'total'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(total, Some(2));
    db.close().await.unwrap();
}

struct SneakyDeriver;

impl Deriver for SneakyDeriver {
    fn derive(&self, cx: &mut DeriveContext<'_>) -> Result<()> {
        cx.model.execute("INSERT INTO sneaky (n) VALUES (1)", [])?;
        Ok(())
    }
}

#[tokio::test]
async fn deriver_failures_tag_the_apply_phase() {
    // the sneaky table is never created, so the deriver's write fails
    let models = vec![foo_model(), ModelDef::new("sneaky").with_deriver(SneakyDeriver)];
    let config = EngineConfig::memory().with_stop_on_error(true);
    let db = EventideDb::open(config, models).unwrap();

    let err = db.dispatch("ADD", json!({"id": "a"})).await.unwrap_err();
    let event = err.failed_event().expect("failed event record");
    assert!(event.error.as_ref().unwrap().contains_key("_apply-derive"));

    // the apply rolled back wholesale
    assert_eq!(db.current_version().await.unwrap(), 0);
    assert_eq!(foo_row(&db, "a"), None);
    assert!(event.failed_result.is_some());

    db.close().await.unwrap();
}
