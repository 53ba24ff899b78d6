//! Event queue
//!
//! Append-only ordered log of events keyed by a strictly increasing,
//! gap-free version. `add` assigns `max(v)+1` inside a transaction;
//! `get_next` either returns immediately or suspends, polling the store at
//! the configured interval and waking early on local appends.
//!
//! The queue may live in the engine's read-write database file (sharing its
//! connection) or in a file of its own; other processes appending to the
//! same file are picked up by the polls.

use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use eventide_core::{ErrorMap, Event, EventideError, Result, ResultMap, SubEvent, Version};
use eventide_sqlite::{FnMigration, Migration, SqliteStore, StoreTxn};

/// Migration creating the queue table. Registered on whichever store owns
/// the queue (the read-write store when the queue shares its file).
pub(crate) fn queue_migration() -> Box<dyn Migration> {
    Box::new(FnMigration::new("queue/events-table", |conn| {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                v INTEGER PRIMARY KEY,
                type TEXT NOT NULL,
                ts INTEGER,
                data JSON,
                result JSON,
                error JSON,
                failed_result JSON,
                events JSON
            )",
            [],
        )
        .map_err(|e| EventideError::Store(e.to_string()))?;
        Ok(())
    }))
}

/// The persistent event queue.
#[derive(Clone)]
pub struct EventQueue {
    store: SqliteStore,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl EventQueue {
    pub(crate) fn new(store: SqliteStore, poll_interval: Duration) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
            poll_interval,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Append a new event, atomically assigning the next version.
    pub fn add(&self, event_type: &str, data: Value, ts: Option<i64>) -> Result<Event> {
        if event_type.is_empty() {
            return Err(EventideError::InvalidEvent(
                "event type must be a non-empty string".into(),
            ));
        }

        let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let data_json = to_json_text(&data)?;

        let event = self.store.with_transaction(|txn| {
            let next: i64 = txn
                .query_row("SELECT COALESCE(MAX(v), 0) + 1 FROM events", [], |row| {
                    row.get(0)
                })?
                .unwrap_or(1);
            txn.run(
                "INSERT INTO events (v, type, ts, data) VALUES (?1, ?2, ?3, ?4)",
                params![next, event_type, ts, data_json],
            )?;
            Ok(Event::new(next as Version, event_type, data, ts))
        })?;

        tracing::debug!(v = event.v, event_type, "queued event");
        self.notify.notify_waiters();
        Ok(event)
    }

    /// Point lookup by version.
    pub fn get(&self, v: Version) -> Result<Option<Event>> {
        let row = self.store.query_row(
            "SELECT v, type, ts, data, result, error, failed_result, events
             FROM events WHERE v = ?1",
            [v as i64],
            RawEventRow::from_row,
        )?;
        row.map(RawEventRow::into_event).transpose()
    }

    /// The next event with `v > after`, or `None`.
    ///
    /// With `no_block` set the answer is immediate; otherwise this suspends,
    /// re-querying at the poll interval and waking early on local `add`.
    pub async fn get_next(
        &self,
        after: Version,
        no_block: bool,
    ) -> Result<Option<Event>> {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.next_after(after)? {
                return Ok(Some(event));
            }
            if no_block {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn next_after(&self, after: Version) -> Result<Option<Event>> {
        let row = self.store.query_row(
            "SELECT v, type, ts, data, result, error, failed_result, events
             FROM events WHERE v > ?1 ORDER BY v LIMIT 1",
            [after as i64],
            RawEventRow::from_row,
        )?;
        row.map(RawEventRow::into_event).transpose()
    }

    /// Upsert the full row by version; used to record processing outcomes.
    pub fn set(&self, event: &Event) -> Result<()> {
        let row = RawEventRow::from_event(event)?;
        self.store.run(UPSERT_SQL, row.params())?;
        Ok(())
    }

    /// Same as [`set`](Self::set), on an open transaction. Used when the
    /// queue shares the read-write connection so the result write commits
    /// with the event's transaction.
    pub fn set_in_txn(&self, txn: &StoreTxn<'_>, event: &Event) -> Result<()> {
        let row = RawEventRow::from_event(event)?;
        txn.run(UPSERT_SQL, row.params())?;
        Ok(())
    }

    /// Highest enqueued version (not necessarily processed).
    pub fn latest_version(&self) -> Result<Version> {
        let v: Option<i64> = self
            .store
            .query_row("SELECT COALESCE(MAX(v), 0) FROM events", [], |row| {
                row.get(0)
            })?;
        Ok(v.unwrap_or(0) as Version)
    }

    /// Truncate the queue. Test/admin tooling; the engine never deletes
    /// events on its own.
    pub fn clear_events(&self) -> Result<()> {
        self.store.run("DELETE FROM events", [])?;
        Ok(())
    }

    /// Wake any blocked [`get_next`](Self::get_next) callers.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.store.close();
    }
}

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO events
    (v, type, ts, data, result, error, failed_result, events)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

/// Row image of an event with the JSON columns still in text form.
struct RawEventRow {
    v: i64,
    event_type: String,
    ts: Option<i64>,
    data: Option<String>,
    result: Option<String>,
    error: Option<String>,
    failed_result: Option<String>,
    events: Option<String>,
}

impl RawEventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            v: row.get(0)?,
            event_type: row.get(1)?,
            ts: row.get(2)?,
            data: row.get(3)?,
            result: row.get(4)?,
            error: row.get(5)?,
            failed_result: row.get(6)?,
            events: row.get(7)?,
        })
    }

    fn from_event(event: &Event) -> Result<Self> {
        Ok(Self {
            v: event.v as i64,
            event_type: event.event_type.clone(),
            ts: Some(event.ts),
            data: Some(to_json_text(&event.data)?),
            result: event.result.as_ref().map(to_json_text).transpose()?,
            error: event.error.as_ref().map(to_json_text).transpose()?,
            failed_result: event.failed_result.as_ref().map(to_json_text).transpose()?,
            events: if event.events.is_empty() {
                None
            } else {
                Some(to_json_text(&event.events)?)
            },
        })
    }

    fn params(&self) -> [&dyn rusqlite::ToSql; 8] {
        [
            &self.v,
            &self.event_type,
            &self.ts,
            &self.data,
            &self.result,
            &self.error,
            &self.failed_result,
            &self.events,
        ]
    }

    fn into_event(self) -> Result<Event> {
        let data = match self.data {
            Some(text) => from_json_text(&text)?,
            None => Value::Null,
        };
        let result: Option<ResultMap> = self
            .result
            .as_deref()
            .map(from_json_text)
            .transpose()?;
        let error: Option<ErrorMap> = self.error.as_deref().map(from_json_text).transpose()?;
        let failed_result: Option<ResultMap> = self
            .failed_result
            .as_deref()
            .map(from_json_text)
            .transpose()?;
        let events: Vec<SubEvent> = self
            .events
            .as_deref()
            .map(from_json_text)
            .transpose()?
            .unwrap_or_default();

        let mut event = Event::new(self.v as Version, self.event_type, data, self.ts.unwrap_or(0));
        event.result = result;
        event.error = error;
        event.failed_result = failed_result;
        event.events = events;
        Ok(event)
    }
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EventideError::Serialization(e.to_string()))
}

fn from_json_text<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| EventideError::Serialization(e.to_string()))
}
