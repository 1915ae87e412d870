//! Durable storage for access requests.
//!
//! The store owns every persisted `AccessRequest`. Writers follow a
//! read-modify-write cycle: `get` (or `list_due`), mutate the copy, then
//! `update` with the version that was read. A concurrent writer that got
//! there first makes `update` fail with `Conflict`; the caller re-reads.

pub mod db;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::request::AccessRequest;
use crate::types::RequestStatus;

pub use db::RequestDb;

pub trait RequestStore: Send + Sync {
    /// Persist a new request at version 1 and return its id.
    fn create(&self, request: &AccessRequest) -> Result<Uuid>;

    /// Fetch one request, `RequestNotFound` if absent.
    fn get(&self, id: Uuid) -> Result<AccessRequest>;

    /// Non-terminal requests whose `next_evaluation_at <= now`, oldest
    /// `created_at` first.
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<AccessRequest>>;

    /// Replace the stored record if its version still equals
    /// `request.version`. Returns the stored record with the bumped version.
    fn update(&self, request: &AccessRequest) -> Result<AccessRequest>;

    /// All requests, optionally filtered by status, newest first.
    fn list(&self, status: Option<RequestStatus>) -> Result<Vec<AccessRequest>>;
}
