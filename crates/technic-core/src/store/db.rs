//! Persistent storage for access requests using redb.
//!
//! # Table design
//!
//! `REQUESTS` maps the 16 uuid bytes to the JSON-encoded record.
//!
//! `DUE` is a secondary index with a 24-byte composite key and no value:
//! ```text
//! [ next_evaluation_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! Because the timestamp occupies the high bytes in big-endian encoding,
//! byte ordering equals timestamp ordering, so `..=due_upper_bound(now)`
//! returns every request due by `now`. Only non-terminal requests have an
//! index entry; a request leaves the index when it reaches a terminal status.
//!
//! Every write happens inside one redb write transaction, and redb allows a
//! single writer at a time, so the version check in `update` is atomic.
//!
//! redb holds an exclusive file lock while a `Database` is open. `RequestDb`
//! therefore opens the file for each operation and closes it again, so the
//! long-running scheduler and short CLI commands can share one store. An
//! open that finds the file locked is retried with backoff for up to
//! `LOCK_WAIT` before failing with `StoreBusy`.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{Result, TechnicError};
use crate::request::AccessRequest;
use crate::types::RequestStatus;

use super::RequestStore;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: uuid bytes. Value: JSON-encoded AccessRequest.
const REQUESTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("requests");

/// Key: 24-byte composite (next_evaluation_ms big-endian ++ uuid bytes).
const DUE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("due");

const EMPTY: &[u8] = &[];

/// How long an open waits for another process to release the file.
const LOCK_WAIT: Duration = Duration::from_secs(10);
const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn due_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Upper bound for a range scan returning all requests due by `now`.
///
/// The UUID suffix is `0xff` × 16, which is greater than any valid UUID,
/// so all entries with `timestamp_ms <= now_ms` are included.
fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = now.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn db_err(e: impl Display) -> TechnicError {
    TechnicError::Store(e.to_string())
}

fn decode(bytes: &[u8]) -> Result<AccessRequest> {
    serde_json::from_slice(bytes).map_err(db_err)
}

// ---------------------------------------------------------------------------
// RequestDb
// ---------------------------------------------------------------------------

/// redb-backed `RequestStore`.
pub struct RequestDb {
    path: PathBuf,
    /// One open handle per process at a time.
    gate: Mutex<()>,
}

impl RequestDb {
    /// Open or create the redb database at `path`.
    ///
    /// Creates both tables if they don't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            path: path.to_path_buf(),
            gate: Mutex::new(()),
        };
        store.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            wt.open_table(REQUESTS).map_err(db_err)?;
            wt.open_table(DUE).map_err(db_err)?;
            wt.commit().map_err(db_err)
        })?;
        Ok(store)
    }

    /// Run `f` against a freshly opened database and close it afterwards.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let _gate = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let db = self.connect()?;
        f(&db)
    }

    fn connect(&self) -> Result<Database> {
        let deadline = Instant::now() + LOCK_WAIT;
        let mut backoff = BACKOFF_START;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    tracing::debug!(path = %self.path.display(), "request store locked, waiting");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(TechnicError::StoreBusy(self.path.display().to_string()))
                }
                Err(e) => return Err(db_err(e)),
            }
        }
    }
}

#[cfg(test)]
impl RequestDb {
    /// Write raw bytes as a due request, bypassing encoding.
    pub(crate) fn insert_raw(&self, id: Uuid, due_at: DateTime<Utc>, value: &[u8]) -> Result<()> {
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            {
                let mut requests = wt.open_table(REQUESTS).map_err(db_err)?;
                requests
                    .insert(id.as_bytes().as_slice(), value)
                    .map_err(db_err)?;
                let mut due = wt.open_table(DUE).map_err(db_err)?;
                due.insert(due_key(due_at, id).as_slice(), EMPTY)
                    .map_err(db_err)?;
            }
            wt.commit().map_err(db_err)
        })
    }
}

impl RequestStore for RequestDb {
    fn create(&self, request: &AccessRequest) -> Result<Uuid> {
        let mut record = request.clone();
        record.version = 1;
        let value = serde_json::to_vec(&record).map_err(db_err)?;

        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            {
                let mut requests = wt.open_table(REQUESTS).map_err(db_err)?;
                if requests
                    .get(record.id.as_bytes().as_slice())
                    .map_err(db_err)?
                    .is_some()
                {
                    return Err(TechnicError::Store(format!(
                        "request {} already exists",
                        record.id
                    )));
                }
                requests
                    .insert(record.id.as_bytes().as_slice(), value.as_slice())
                    .map_err(db_err)?;

                if !record.is_terminal() {
                    let mut due = wt.open_table(DUE).map_err(db_err)?;
                    let key = due_key(record.next_evaluation_at, record.id);
                    due.insert(key.as_slice(), EMPTY).map_err(db_err)?;
                }
            }
            wt.commit().map_err(db_err)?;
            Ok(record.id)
        })
    }

    fn get(&self, id: Uuid) -> Result<AccessRequest> {
        self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(REQUESTS).map_err(db_err)?;
            let entry = table
                .get(id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or(TechnicError::RequestNotFound(id))?;
            decode(entry.value())
        })
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<AccessRequest>> {
        let upper = due_upper_bound(now);
        let mut result = self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let due = rt.open_table(DUE).map_err(db_err)?;
            let requests = rt.open_table(REQUESTS).map_err(db_err)?;

            let mut result = Vec::new();
            for entry in due.range(..=upper.as_slice()).map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                let id = Uuid::from_slice(&k.value()[8..]).map_err(db_err)?;
                // A bad entry only costs its own request, never the scan.
                let Some(v) = requests.get(id.as_bytes().as_slice()).map_err(db_err)? else {
                    tracing::warn!(request_id = %id, "due index points at a missing request");
                    continue;
                };
                let request = match decode(v.value()) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::error!(request_id = %id, error = %e, "skipping unreadable request");
                        continue;
                    }
                };
                if !request.is_terminal() && request.next_evaluation_at <= now {
                    result.push(request);
                }
            }
            Ok(result)
        })?;
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    fn update(&self, request: &AccessRequest) -> Result<AccessRequest> {
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            let stored = {
                let mut requests = wt.open_table(REQUESTS).map_err(db_err)?;
                let current = {
                    let entry = requests
                        .get(request.id.as_bytes().as_slice())
                        .map_err(db_err)?
                        .ok_or(TechnicError::RequestNotFound(request.id))?;
                    decode(entry.value())?
                };

                if current.version != request.version {
                    return Err(TechnicError::Conflict {
                        id: request.id,
                        expected: request.version,
                        found: current.version,
                    });
                }
                if current.owners != request.owners || current.created_at != request.created_at {
                    return Err(TechnicError::Store(format!(
                        "request {}: owners and created_at are immutable",
                        request.id
                    )));
                }

                let mut next = request.clone();
                next.version = current.version + 1;
                next.updated_at = Utc::now();
                let value = serde_json::to_vec(&next).map_err(db_err)?;
                requests
                    .insert(next.id.as_bytes().as_slice(), value.as_slice())
                    .map_err(db_err)?;

                let mut due = wt.open_table(DUE).map_err(db_err)?;
                let old_key = due_key(current.next_evaluation_at, current.id);
                due.remove(old_key.as_slice()).map_err(db_err)?;
                if !next.is_terminal() {
                    let new_key = due_key(next.next_evaluation_at, next.id);
                    due.insert(new_key.as_slice(), EMPTY).map_err(db_err)?;
                }
                next
            };
            wt.commit().map_err(db_err)?;
            Ok(stored)
        })
    }

    fn list(&self, status: Option<RequestStatus>) -> Result<Vec<AccessRequest>> {
        let mut result = self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(REQUESTS).map_err(db_err)?;

            let mut result = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let request = match decode(v.value()) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::error!(key = ?k.value(), error = %e, "skipping unreadable request");
                        continue;
                    }
                };
                if status.map_or(true, |s| s == request.status) {
                    result.push(request);
                }
            }
            Ok(result)
        })?;
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
