//! Failure, retry, backoff and the give-up path

use eventide::prelude::*;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Clone, Default)]
struct Fault {
    fail_apply: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

impl Fault {
    fn set_failing(&self, failing: bool) {
        self.fail_apply.store(failing, Ordering::SeqCst);
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

struct FlakyModel {
    fault: Fault,
}

impl Reducer for FlakyModel {
    fn reduce(&self, _model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
        Ok(Reduction::changes(json!({ "id": event.data["id"] })))
    }
}

impl Applier for FlakyModel {
    fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()> {
        self.fault.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fault.fail_apply.load(Ordering::SeqCst) {
            return Err(EventideError::InvalidState("injected apply failure".into()));
        }
        model.execute(
            "INSERT OR REPLACE INTO flaky (id) VALUES (?1)",
            [changes["id"].as_str().unwrap_or_default()],
        )?;
        Ok(())
    }
}

fn flaky_model(fault: &Fault) -> ModelDef {
    ModelDef::new("flaky")
        .with_migration("init", |conn| {
            conn.execute("CREATE TABLE flaky (id TEXT PRIMARY KEY)", [])
                .map_err(|e| EventideError::Store(e.to_string()))?;
            Ok(())
        })
        .with_reducer(FlakyModel {
            fault: fault.clone(),
        })
        .with_apply_changes(FlakyModel {
            fault: fault.clone(),
        })
}

#[tokio::test]
async fn failed_event_blocks_until_reprocessed() {
    let fault = Fault::default();
    let config = EngineConfig::memory()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_backoff(Duration::from_millis(5))
        .with_stop_on_error(true);
    let db = EventideDb::open(config, vec![flaky_model(&fault)]).unwrap();

    db.dispatch("ADD", json!({"id": "a"})).await.unwrap();
    db.dispatch("ADD", json!({"id": "b"})).await.unwrap();
    assert_eq!(db.current_version().await.unwrap(), 2);

    // event 3 fails; the loop exits (stop_on_error) with the version stuck
    fault.set_failing(true);
    let err = db.dispatch("ADD", json!({"id": "c"})).await.unwrap_err();
    let event = err.failed_event().expect("failed event record");
    assert_eq!(event.v, 3);
    assert!(event.error.as_ref().unwrap().contains_key("_apply-apply"));
    assert!(event.failed_result.is_some());
    assert_eq!(db.current_version().await.unwrap(), 2);

    // nothing from the failed attempt leaked
    let c_row: Option<String> = db
        .store()
        .query_row("SELECT id FROM flaky WHERE id = 'c'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(c_row, None);

    // fix the fault; the failed version reprocesses and the engine catches up
    fault.set_failing(false);
    let event = db.handled_version(3).await.unwrap();
    assert_eq!(event.v, 3);
    assert!(event.error.is_none());
    assert_eq!(db.current_version().await.unwrap(), 3);
    let c_row: Option<String> = db
        .store()
        .query_row("SELECT id FROM flaky WHERE id = 'c'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(c_row, Some("c".to_string()));

    db.close().await.unwrap();
}

#[tokio::test]
async fn loop_retries_with_backoff_then_gives_up() {
    let fault = Fault::default();
    fault.set_failing(true);

    let config = EngineConfig::memory()
        .with_poll_interval(Duration::from_millis(5))
        .with_retry_backoff(Duration::from_millis(2))
        .with_max_retries(2);
    let db = EventideDb::open(config, vec![flaky_model(&fault)]).unwrap();

    // the waiter rejects on the first failure while the loop keeps retrying
    let err = db.dispatch("ADD", json!({"id": "a"})).await.unwrap_err();
    assert!(matches!(err, EventideError::EventFailed(_)));

    // wait for the loop to exhaust its retries and surrender
    let mut gave_up = false;
    for _ in 0..200 {
        match db.handled_version(1).await {
            Err(EventideError::GaveUp(v)) => {
                assert_eq!(v, 1);
                gave_up = true;
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            Ok(event) => panic!("event {} should not have succeeded", event.v),
        }
    }
    assert!(gave_up, "loop never surrendered");

    // attempts: the initial one plus max_retries retries
    assert_eq!(fault.attempts(), 3);
    assert_eq!(db.current_version().await.unwrap(), 0);

    db.close().await.unwrap();
}

#[tokio::test]
async fn transient_failures_recover_without_giving_up() {
    let fault = Fault::default();
    fault.set_failing(true);

    let config = EngineConfig::memory()
        .with_poll_interval(Duration::from_millis(5))
        .with_retry_backoff(Duration::from_millis(5))
        .with_max_retries(10);
    let db = EventideDb::open(config, vec![flaky_model(&fault)]).unwrap();

    let err = db.dispatch("ADD", json!({"id": "a"})).await.unwrap_err();
    assert!(matches!(err, EventideError::EventFailed(_)));

    // heal the fault; a background retry should pick the event up
    fault.set_failing(false);
    let mut recovered = false;
    for _ in 0..200 {
        if db.current_version().await.unwrap() == 1 {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(recovered, "failed event was never retried to success");

    // the queue row reflects the eventual success
    let row = db.queue().get(1).unwrap().unwrap();
    assert!(row.error.is_none());
    assert!(row.result.is_some());

    db.close().await.unwrap();
}
