//! Queue semantics through the engine surface

use eventide::prelude::*;
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;

struct NoteModel;

impl Reducer for NoteModel {
    fn reduce(&self, _model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
        if event.event_type == "NOOP" {
            return Ok(Reduction::none());
        }
        Ok(Reduction::changes(json!({ "text": event.data["text"] })))
    }
}

impl Applier for NoteModel {
    fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()> {
        model.execute(
            "INSERT INTO notes (text) VALUES (?1)",
            [changes["text"].as_str().unwrap_or_default()],
        )?;
        Ok(())
    }
}

fn note_model() -> ModelDef {
    ModelDef::new("notes")
        .with_migration("init", |conn| {
            conn.execute(
                "CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, text TEXT)",
                [],
            )
            .map_err(|e| EventideError::Store(e.to_string()))?;
            Ok(())
        })
        .with_reducer(NoteModel)
        .with_apply_changes(NoteModel)
}

#[tokio::test]
async fn queued_events_round_trip_exactly() {
    let db = EventideDb::open(EngineConfig::memory(), vec![note_model()]).unwrap();

    let data = json!({"text": "hello", "tags": ["a", "b"], "count": 3});
    let dispatched = db.dispatch_with_ts("NOTE", data.clone(), Some(777)).await.unwrap();

    let stored = db.queue().get(dispatched.v).unwrap().unwrap();
    assert_eq!(stored.event_type, "NOTE");
    assert_eq!(stored.data, data);
    assert_eq!(stored.ts, 777);
    assert_eq!(stored.result, dispatched.result);

    db.close().await.unwrap();
}

#[tokio::test]
async fn queue_in_its_own_file_still_drives_the_engine() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::file(dir.path().join("state.db"))
        .with_queue(StoreConfig::file(dir.path().join("queue.db")))
        .with_poll_interval(Duration::from_millis(10));
    let db = EventideDb::open(config, vec![note_model()]).unwrap();

    let event = db.dispatch("NOTE", json!({"text": "split files"})).await.unwrap();
    assert_eq!(event.v, 1);
    assert_eq!(db.current_version().await.unwrap(), 1);

    let text: Option<String> = db
        .store()
        .query_row("SELECT text FROM notes WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(text, Some("split files".to_string()));

    // the state file carries no queue table of its own
    let has_events_table: Option<i64> = db
        .store()
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'events'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(has_events_table, Some(0));

    db.close().await.unwrap();
}

#[tokio::test]
async fn failed_rows_can_be_rewritten_by_admin_workflow() {
    struct AlwaysFails;

    impl Reducer for AlwaysFails {
        fn reduce(&self, _model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
            if event.event_type == "BAD" {
                return Err(EventideError::InvalidState("cannot reduce".into()));
            }
            Ok(Reduction::none())
        }
    }

    impl Applier for AlwaysFails {
        fn apply(&self, _model: &ModelTable<'_>, _changes: &Value) -> Result<()> {
            Ok(())
        }
    }

    let config = EngineConfig::memory()
        .with_poll_interval(Duration::from_millis(10))
        .with_stop_on_error(true);
    let db = EventideDb::open(
        config,
        vec![ModelDef::new("strict")
            .with_reducer(AlwaysFails)
            .with_apply_changes(AlwaysFails)],
    )
    .unwrap();

    let err = db.dispatch("BAD", json!({})).await.unwrap_err();
    assert!(matches!(err, EventideError::EventFailed(_)));
    assert_eq!(db.current_version().await.unwrap(), 0);

    // admin rewrites the stuck row to a type every reducer ignores
    let mut row = db.queue().get(1).unwrap().unwrap();
    row.event_type = "NOOP".to_string();
    row.error = None;
    db.queue().set(&row).unwrap();

    let event = db.handled_version(1).await.unwrap();
    assert_eq!(event.event_type, "NOOP");
    assert_eq!(db.current_version().await.unwrap(), 1);

    db.close().await.unwrap();
}
