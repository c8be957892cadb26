use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pkgcheck_core::{format_rfc3339, now_utc, CheckError, QueueChannel};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{collect_rows, invalid_column};

const SCHEMA_QUEUE_V1: &str = r"
CREATE TABLE IF NOT EXISTS queues (
  name TEXT PRIMARY KEY,
  declared_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_messages (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  queue TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  enqueued_at TEXT NOT NULL,
  FOREIGN KEY (queue) REFERENCES queues(name)
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_queue_seq
  ON queue_messages(queue, seq);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedJob {
    pub seq: i64,
    pub queue: String,
    pub payload: Value,
    pub enqueued_at: String,
}

/// Durable job queue on SQLite with publisher-confirm semantics: sends are
/// buffered and only become visible to consumers once
/// [`QueueChannel::wait_for_confirms`] commits them.
pub struct SqliteJobQueue {
    conn: Connection,
    unconfirmed: Mutex<Vec<(String, Vec<u8>)>>,
}

impl SqliteJobQueue {
    #[allow(clippy::missing_errors_doc)]
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite queue at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            unconfirmed: Mutex::new(Vec::new()),
        })
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_QUEUE_V1)
            .context("failed to apply queue schema")
    }

    /// Removes and returns the oldest confirmed job on `queue`.
    #[allow(clippy::missing_errors_doc)]
    pub fn take_next(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start take transaction")?;

        let job = tx
            .query_row(
                "SELECT seq, queue, payload_json, enqueued_at
                 FROM queue_messages
                 WHERE queue = ?1
                 ORDER BY seq ASC
                 LIMIT 1",
                params![queue],
                parse_job_row,
            )
            .optional()
            .context("failed to read next queued job")?;

        if let Some(job) = &job {
            tx.execute("DELETE FROM queue_messages WHERE seq = ?1", params![job.seq])
                .context("failed to remove taken job")?;
        }
        tx.commit().context("failed to commit take transaction")?;

        if let Some(job) = &job {
            info!(queue, seq = job.seq, "took queued job");
        }
        Ok(job)
    }

    /// Confirmed jobs on `queue`, oldest first, without consuming them.
    #[allow(clippy::missing_errors_doc)]
    pub fn list(&self, queue: &str) -> Result<Vec<QueuedJob>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, queue, payload_json, enqueued_at
             FROM queue_messages
             WHERE queue = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![queue], parse_job_row)?;
        collect_rows(rows)
    }

    fn commit_unconfirmed(&self, messages: &[(String, Vec<u8>)], timeout: Duration) -> Result<()> {
        self.conn
            .busy_timeout(timeout)
            .context("failed to apply confirm timeout")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start confirm transaction")?;
        for (queue, payload) in messages {
            let payload_json =
                std::str::from_utf8(payload).context("queued payload is not UTF-8 JSON")?;
            serde_json::from_str::<Value>(payload_json)
                .context("queued payload is not valid JSON")?;
            tx.execute(
                "INSERT INTO queue_messages(queue, payload_json, enqueued_at) VALUES (?1, ?2, ?3)",
                params![queue, payload_json, now],
            )
            .with_context(|| format!("failed to persist message for queue {queue}"))?;
        }
        tx.commit().context("failed to commit confirm transaction")?;
        Ok(())
    }
}

impl QueueChannel for SqliteJobQueue {
    fn assert_queue(&self, queue: &str) -> Result<(), CheckError> {
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO queues(name, declared_at) VALUES (?1, ?2)",
                params![queue, now],
            )
            .map_err(|err| CheckError::Dispatch(format!("failed to assert queue {queue}: {err}")))?;
        Ok(())
    }

    fn send_to_queue(&self, queue: &str, payload: &[u8]) -> Result<(), CheckError> {
        let mut unconfirmed = self
            .unconfirmed
            .lock()
            .map_err(|_| CheckError::Dispatch("queue channel lock poisoned".to_string()))?;
        unconfirmed.push((queue.to_string(), payload.to_vec()));
        debug!(queue, bytes = payload.len(), "buffered message");
        Ok(())
    }

    fn wait_for_confirms(&self, timeout: Duration) -> Result<(), CheckError> {
        let messages = {
            let mut unconfirmed = self
                .unconfirmed
                .lock()
                .map_err(|_| CheckError::Dispatch("queue channel lock poisoned".to_string()))?;
            std::mem::take(&mut *unconfirmed)
        };
        if messages.is_empty() {
            return Ok(());
        }

        match self.commit_unconfirmed(&messages, timeout) {
            Ok(()) => {
                debug!(count = messages.len(), "messages confirmed");
                Ok(())
            }
            Err(err) => {
                warn!(count = messages.len(), error = %err, "messages not confirmed");
                Err(CheckError::Dispatch(format!("{err:#}")))
            }
        }
    }
}

fn parse_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedJob> {
    let payload_raw: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_raw)
        .map_err(|err| invalid_column(2, format!("invalid payload_json: {err}")))?;
    Ok(QueuedJob {
        seq: row.get(0)?,
        queue: row.get(1)?,
        payload,
        enqueued_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_ok<T>(result: Result<T, CheckError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_queue() -> SqliteJobQueue {
        let queue = must(SqliteJobQueue::open(Path::new(":memory:")));
        must(queue.migrate());
        queue
    }

    fn confirm_timeout() -> Duration {
        Duration::from_millis(500)
    }

    #[test]
    fn sent_messages_are_invisible_until_confirmed() {
        let queue = fixture_queue();
        must_ok(queue.assert_queue("jobs"));
        must_ok(queue.send_to_queue("jobs", br#"{"cid":"c1","pkg":"left-pad"}"#));
        assert!(must(queue.list("jobs")).is_empty());

        must_ok(queue.wait_for_confirms(confirm_timeout()));
        let jobs = must(queue.list("jobs"));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload, json!({ "cid": "c1", "pkg": "left-pad" }));
    }

    #[test]
    fn take_next_pops_in_fifo_order() {
        let queue = fixture_queue();
        must_ok(queue.assert_queue("jobs"));
        must_ok(queue.send_to_queue("jobs", br#"{"cid":"first"}"#));
        must_ok(queue.send_to_queue("jobs", br#"{"cid":"second"}"#));
        must_ok(queue.wait_for_confirms(confirm_timeout()));

        let first = must(queue.take_next("jobs")).map(|job| job.payload);
        let second = must(queue.take_next("jobs")).map(|job| job.payload);
        assert_eq!(first, Some(json!({ "cid": "first" })));
        assert_eq!(second, Some(json!({ "cid": "second" })));
        assert!(must(queue.take_next("jobs")).is_none());
    }

    #[test]
    fn assert_queue_is_idempotent() {
        let queue = fixture_queue();
        must_ok(queue.assert_queue("jobs"));
        must_ok(queue.assert_queue("jobs"));
    }

    #[test]
    fn undeclared_queue_fails_confirmation_and_drops_batch() {
        let queue = fixture_queue();
        must_ok(queue.assert_queue("jobs"));
        must_ok(queue.send_to_queue("jobs", br#"{"cid":"kept-out"}"#));
        must_ok(queue.send_to_queue("missing", br#"{"cid":"c1"}"#));

        assert!(matches!(
            queue.wait_for_confirms(confirm_timeout()),
            Err(CheckError::Dispatch(_))
        ));
        assert!(must(queue.list("jobs")).is_empty());
        must_ok(queue.wait_for_confirms(confirm_timeout()));
    }

    #[test]
    fn non_json_payload_is_not_confirmed() {
        let queue = fixture_queue();
        must_ok(queue.assert_queue("jobs"));
        must_ok(queue.send_to_queue("jobs", b"not json"));
        assert!(matches!(
            queue.wait_for_confirms(confirm_timeout()),
            Err(CheckError::Dispatch(_))
        ));
    }
}
