//! Persistent message queue.
//!
//! A file-backed store-and-forward queue for messages whose target is
//! currently unreachable. Durability is tuned for throughput over zero-loss:
//! write-ahead logging with `synchronous = NORMAL`, so a power cut may lose
//! the last moments of traffic but never corrupts the store.
//!
//! Status transitions form a DAG, enforced by guarded updates:
//!
//! ```text
//!  pending ──process──▶ processing ──ok────▶ delivered
//!     ▲  ◀──retry────── │
//!     │                 ├─final err─▶ failed
//!     └──ttl─▶ expired ◀┴────ttl──────┘
//! ```
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time;

use localtime::{LocalDuration, LocalTime};
use sqlite as sql;
use thiserror::Error;

use crate::NodeId;

/// Upper bound on undelivered (pending + processing) messages.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
/// Default number of rows returned by [`Queue::next_batch`].
pub const DEFAULT_BATCH: usize = 10;
/// Retry backoff multiplier; the base delay is one second.
pub const BACKOFF_MULTIPLIER: u32 = 2;
/// Retry backoff cap.
pub const MAX_BACKOFF: LocalDuration = LocalDuration::from_mins(5);
/// Delivered rows are deleted after this long.
const KEEP_DELIVERED: LocalDuration = LocalDuration::from_mins(60);
/// Expired rows are deleted after this long.
const KEEP_EXPIRED: LocalDuration = LocalDuration::from_mins(24 * 60);
/// How long to wait on the database lock before failing an operation.
const DB_TIMEOUT: time::Duration = time::Duration::from_secs(6);

#[derive(Error, Debug)]
pub enum Error {
    /// An internal database error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// The queue holds the maximum number of undelivered messages.
    #[error("queue is full ({0} undelivered messages)")]
    QueueFull(usize),
    /// No such message.
    #[error("message `{0}` not found")]
    NotFound(MessageId),
}

/// A queued message id (UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random id.
    fn generate(rng: &mut fastrand::Rng) -> Self {
        let a = rng.u128(..);
        Self(format!(
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (a >> 96) as u32,
            (a >> 80) as u16,
            (a >> 64) as u16 & 0x0fff | 0x4000,
            (a >> 48) as u16 & 0x3fff | 0x8000,
            a & 0xffff_ffff_ffff
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Delivery priority. Higher is dispatched first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i64)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl TryFrom<i64> for Priority {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Urgent),
            other => Err(other),
        }
    }
}

/// Lifecycle state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Processing,
    Delivered,
    Failed,
    Expired,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown queue status `{other}`")),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub message: String,
    pub target_station: Option<String>,
    pub priority: Priority,
    /// Seconds from `created_at` until the message expires.
    pub ttl: u64,
    pub created_at: LocalTime,
    pub scheduled_for: LocalTime,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: Status,
    pub last_error: Option<String>,
}

impl QueuedMessage {
    /// The instant at which this message's TTL runs out.
    pub fn deadline(&self) -> LocalTime {
        self.created_at + LocalDuration::from_secs(self.ttl)
    }
}

/// Options for [`Queue::enqueue`].
#[derive(Debug, Clone)]
pub struct Enqueue {
    pub target_station: Option<String>,
    pub priority: Priority,
    /// Seconds until expiry.
    pub ttl: u64,
    pub max_attempts: u32,
    /// Earliest delivery delay.
    pub delay: LocalDuration,
}

impl Default for Enqueue {
    fn default() -> Self {
        Self {
            target_station: None,
            priority: Priority::Normal,
            ttl: 24 * 60 * 60,
            max_attempts: 10,
            delay: LocalDuration::from_secs(0),
        }
    }
}

/// Result of an enqueue: either a fresh row, or a duplicate of one created
/// in the same millisecond. Duplicates are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Queued(MessageId),
    Duplicate,
}

/// Per-status row counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub pending: usize,
    pub processing: usize,
    pub delivered: usize,
    pub failed: usize,
    pub expired: usize,
}

impl Stats {
    /// Rows counted against the queue size limit.
    pub fn undelivered(&self) -> usize {
        self.pending + self.processing
    }
}

/// The file-backed message queue.
#[derive(Clone)]
pub struct Queue {
    db: Arc<sql::ConnectionThreadSafe>,
    max_size: usize,
    rng: Arc<std::sync::Mutex<fastrand::Rng>>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").finish()
    }
}

impl Queue {
    const SCHEMA: &'static str = include_str!("queue/schema.sql");

    /// Open the queue at the given path, creating it if missing.
    ///
    /// Any rows left in `processing` by a crashed process are reset to
    /// `pending` before the queue serves requests.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut db = sql::Connection::open_thread_safe(path)?;
        db.set_busy_timeout(DB_TIMEOUT.as_millis() as usize)?;
        db.execute("PRAGMA journal_mode = WAL")?;
        db.execute("PRAGMA synchronous = NORMAL")?;
        db.execute(Self::SCHEMA)?;

        let queue = Self {
            db: Arc::new(db),
            max_size: DEFAULT_MAX_QUEUE_SIZE,
            rng: Arc::new(std::sync::Mutex::new(fastrand::Rng::new())),
        };
        let recovered = queue.recover()?;
        if recovered > 0 {
            log::warn!(target: "queue", "Recovered {recovered} message(s) left processing by a previous run");
        }
        Ok(queue)
    }

    /// Create a new in-memory queue, for testing.
    pub fn memory() -> Result<Self, Error> {
        let db = sql::Connection::open_thread_safe(":memory:")?;
        db.execute(Self::SCHEMA)?;

        Ok(Self {
            db: Arc::new(db),
            max_size: DEFAULT_MAX_QUEUE_SIZE,
            rng: Arc::new(std::sync::Mutex::new(fastrand::Rng::with_seed(0xbeef))),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Persist a message for later delivery.
    pub fn enqueue(
        &self,
        from: NodeId,
        to: NodeId,
        message: &str,
        options: Enqueue,
        now: LocalTime,
    ) -> Result<Enqueued, Error> {
        let stats = self.stats()?;
        if stats.undelivered() >= self.max_size {
            return Err(Error::QueueFull(stats.undelivered()));
        }
        let id = MessageId::generate(&mut self.rng.lock().expect("queue: lock poisoned"));
        let scheduled = now + options.delay;

        transaction(&self.db, |db| {
            // The unique constraint on (from, to, message, created_at) backs
            // this check; probing first keeps duplicates out of the error
            // path, since they are an expected outcome.
            let mut stmt = db.prepare(
                "SELECT 1 FROM message_queue
                 WHERE from_node = ?1 AND to_node = ?2 AND message = ?3 AND created_at = ?4",
            )?;
            stmt.bind((1, from as i64))?;
            stmt.bind((2, to as i64))?;
            stmt.bind((3, message))?;
            stmt.bind((4, now.as_millis() as i64))?;

            if stmt.into_iter().next().is_some() {
                return Ok(Enqueued::Duplicate);
            }

            let mut stmt = db.prepare(
                "INSERT INTO message_queue
                   (id, from_node, to_node, message, target_station, priority,
                    ttl, created_at, scheduled_for, attempts, max_attempts, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, 'pending')",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, from as i64))?;
            stmt.bind((3, to as i64))?;
            stmt.bind((4, message))?;
            stmt.bind((5, options.target_station.as_deref()))?;
            stmt.bind((6, options.priority as i64))?;
            stmt.bind((7, options.ttl as i64))?;
            stmt.bind((8, now.as_millis() as i64))?;
            stmt.bind((9, scheduled.as_millis() as i64))?;
            stmt.bind((10, options.max_attempts as i64))?;
            stmt.next()?;

            Ok(Enqueued::Queued(id.clone()))
        })
        .map_err(Error::from)
    }

    /// Pending messages that are due, ordered by priority then schedule.
    pub fn next_batch(&self, limit: usize, now: LocalTime) -> Result<Vec<QueuedMessage>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT * FROM message_queue
             WHERE status = 'pending' AND scheduled_for <= ?1
             ORDER BY priority DESC, scheduled_for ASC
             LIMIT ?2",
        )?;
        stmt.bind((1, now.as_millis() as i64))?;
        stmt.bind((2, limit as i64))?;

        let mut messages = Vec::new();
        for row in stmt.into_iter() {
            messages.push(message_from_row(&row?));
        }
        Ok(messages)
    }

    /// Charge an attempt and move `pending → processing`.
    ///
    /// Returns `false` when the transition is not legal, eg. the message was
    /// concurrently delivered or expired.
    pub fn mark_processing(&self, id: &MessageId) -> Result<bool, Error> {
        let mut stmt = self.db.prepare(
            "UPDATE message_queue SET status = 'processing', attempts = attempts + 1
             WHERE id = ?1 AND status = 'pending'",
        )?;
        stmt.bind((1, id.as_str()))?;
        stmt.next()?;

        Ok(self.db.change_count() > 0)
    }

    /// Mark a message delivered. Idempotent; delivery wins from any state.
    pub fn mark_delivered(&self, id: &MessageId) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE message_queue SET status = 'delivered', last_error = NULL WHERE id = ?1")?;
        stmt.bind((1, id.as_str()))?;
        stmt.next()?;

        Ok(())
    }

    /// Record a delivery failure.
    ///
    /// Returns `true` if the message will be retried: it went back to
    /// `pending` with an exponential backoff. Returns `false` if the failure
    /// was final and the message is now `failed`.
    pub fn mark_failed(
        &self,
        id: &MessageId,
        error: &str,
        now: LocalTime,
    ) -> Result<bool, Error> {
        transaction(&self.db, |db| {
            let mut stmt = db
                .prepare("SELECT status, attempts, max_attempts FROM message_queue WHERE id = ?1")?;
            stmt.bind((1, id.as_str()))?;

            let Some(Ok(row)) = stmt.into_iter().next() else {
                // Deleted under us; nothing to retry.
                return Ok(false);
            };
            // Terminal rows stay terminal; a late failure report must not
            // resurrect a delivered or expired message.
            if !matches!(
                row.read::<&str, _>("status").parse(),
                Ok(Status::Pending) | Ok(Status::Processing)
            ) {
                return Ok(false);
            }
            let attempts = row.read::<i64, _>("attempts") as u32;
            let max_attempts = row.read::<i64, _>("max_attempts") as u32;

            if attempts >= max_attempts {
                let mut stmt = db.prepare(
                    "UPDATE message_queue SET status = 'failed', last_error = ?2 WHERE id = ?1",
                )?;
                stmt.bind((1, id.as_str()))?;
                stmt.bind((2, error))?;
                stmt.next()?;

                return Ok(false);
            }

            let retry_at = now + backoff(attempts);
            let mut stmt = db.prepare(
                "UPDATE message_queue
                 SET status = 'pending', scheduled_for = ?2, last_error = ?3
                 WHERE id = ?1",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, retry_at.as_millis() as i64))?;
            stmt.bind((3, error))?;
            stmt.next()?;

            Ok(true)
        })
        .map_err(Error::from)
    }

    /// Messages routed through the given peer station, newest first.
    pub fn by_station(&self, station_id: &str, limit: usize) -> Result<Vec<QueuedMessage>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT * FROM message_queue WHERE target_station = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        stmt.bind((1, station_id))?;
        stmt.bind((2, limit as i64))?;

        let mut messages = Vec::new();
        for row in stmt.into_iter() {
            messages.push(message_from_row(&row?));
        }
        Ok(messages)
    }

    /// Fetch a single message.
    pub fn get(&self, id: &MessageId) -> Result<Option<QueuedMessage>, Error> {
        let mut stmt = self.db.prepare("SELECT * FROM message_queue WHERE id = ?1")?;
        stmt.bind((1, id.as_str()))?;

        match stmt.into_iter().next() {
            Some(row) => Ok(Some(message_from_row(&row?))),
            None => Ok(None),
        }
    }

    /// Housekeeping sweep:
    ///
    /// 1. delete `delivered` rows older than one hour;
    /// 2. expire undelivered rows past their TTL;
    /// 3. delete `expired` rows older than a day.
    ///
    /// Returns the number of rows deleted. Idempotent for a fixed `now`.
    pub fn cleanup(&self, now: LocalTime) -> Result<usize, Error> {
        transaction(&self.db, |db| {
            let mut deleted = 0;

            let mut stmt = db.prepare(
                "DELETE FROM message_queue WHERE status = 'delivered' AND created_at < ?1",
            )?;
            stmt.bind((1, (now - KEEP_DELIVERED).as_millis() as i64))?;
            stmt.next()?;
            deleted += db.change_count();

            let mut stmt = db.prepare(
                "UPDATE message_queue SET status = 'expired'
                 WHERE status IN ('pending', 'processing') AND created_at + ttl * 1000 <= ?1",
            )?;
            stmt.bind((1, now.as_millis() as i64))?;
            stmt.next()?;
            let expired = db.change_count();
            if expired > 0 {
                log::debug!(target: "queue", "Expired {expired} message(s) past their TTL");
            }

            let mut stmt = db.prepare(
                "DELETE FROM message_queue WHERE status = 'expired' AND created_at < ?1",
            )?;
            stmt.bind((1, (now - KEEP_EXPIRED).as_millis() as i64))?;
            stmt.next()?;
            deleted += db.change_count();

            Ok(deleted)
        })
        .map_err(Error::from)
    }

    /// Row counts per status.
    pub fn stats(&self) -> Result<Stats, Error> {
        let stmt = self
            .db
            .prepare("SELECT status, COUNT(*) AS n FROM message_queue GROUP BY status")?;

        let mut stats = Stats::default();
        for row in stmt.into_iter() {
            let row = row?;
            let count = row.read::<i64, _>("n") as usize;
            match row.read::<&str, _>("status").parse::<Status>() {
                Ok(Status::Pending) => stats.pending = count,
                Ok(Status::Processing) => stats.processing = count,
                Ok(Status::Delivered) => stats.delivered = count,
                Ok(Status::Failed) => stats.failed = count,
                Ok(Status::Expired) => stats.expired = count,
                Err(e) => log::error!(target: "queue", "Corrupt row: {e}"),
            }
        }
        Ok(stats)
    }

    /// Reset crashed `processing` rows to `pending`. Called on open.
    pub fn recover(&self) -> Result<usize, Error> {
        self.db
            .execute("UPDATE message_queue SET status = 'pending' WHERE status = 'processing'")?;

        Ok(self.db.change_count())
    }
}

/// Run a multi-statement queue operation as one write transaction, so a
/// status change and its bookkeeping land together or not at all.
///
/// `BEGIN IMMEDIATE` takes the write lock upfront, keeping the busy handler
/// at the transaction boundary rather than on the first write inside it.
fn transaction<T>(
    db: &sql::Connection,
    operation: impl FnOnce(&sql::Connection) -> Result<T, sql::Error>,
) -> Result<T, sql::Error> {
    db.execute("BEGIN IMMEDIATE")?;

    match operation(db) {
        Ok(result) => {
            db.execute("COMMIT")?;
            Ok(result)
        }
        Err(err) => {
            db.execute("ROLLBACK")?;
            Err(err)
        }
    }
}

/// Backoff before the next retry, given the attempts charged so far.
fn backoff(attempts: u32) -> LocalDuration {
    let exponent = attempts.saturating_sub(1).min(30);
    LocalDuration::from_secs(u64::from(BACKOFF_MULTIPLIER).saturating_pow(exponent)).min(MAX_BACKOFF)
}

fn message_from_row(row: &sql::Row) -> QueuedMessage {
    QueuedMessage {
        id: MessageId::from(row.read::<&str, _>("id")),
        from_node: row.read::<i64, _>("from_node") as NodeId,
        to_node: row.read::<i64, _>("to_node") as NodeId,
        message: row.read::<&str, _>("message").to_owned(),
        target_station: row
            .read::<Option<&str>, _>("target_station")
            .map(str::to_owned),
        priority: Priority::try_from(row.read::<i64, _>("priority")).unwrap_or_default(),
        ttl: row.read::<i64, _>("ttl") as u64,
        created_at: LocalTime::from_millis(row.read::<i64, _>("created_at") as u128),
        scheduled_for: LocalTime::from_millis(row.read::<i64, _>("scheduled_for") as u128),
        attempts: row.read::<i64, _>("attempts") as u32,
        max_attempts: row.read::<i64, _>("max_attempts") as u32,
        status: row
            .read::<&str, _>("status")
            .parse()
            .unwrap_or(Status::Failed),
        last_error: row.read::<Option<&str>, _>("last_error").map(str::to_owned),
    }
}
