//! The access request record and its state machine.
//!
//! An `AccessRequest` is the unit of work: one proposed change to a subject's
//! group membership, software entitlement or mailbox archival status, gated
//! by the approval of every listed owner.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{Result, TechnicError};
use crate::types::{ActionKind, Decision, RequestStatus};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

static IDENTITY_RE: OnceLock<Regex> = OnceLock::new();
static TARGET_RE: OnceLock<Regex> = OnceLock::new();

fn identity_re() -> &'static Regex {
    IDENTITY_RE.get_or_init(|| Regex::new(r"^[^\s\p{Cc}]+$").unwrap())
}

fn target_re() -> &'static Regex {
    // Group names may contain inner spaces ("Domain Users"), nothing else may.
    TARGET_RE.get_or_init(|| Regex::new(r"^[^\s\p{Cc}]([^\p{Cc}]*[^\s\p{Cc}])?$").unwrap())
}

pub fn validate_identity(field: &'static str, value: &str) -> Result<()> {
    if identity_re().is_match(value) {
        Ok(())
    } else {
        Err(TechnicError::InvalidIdentity {
            field,
            value: value.to_string(),
        })
    }
}

pub fn validate_target(value: &str) -> Result<()> {
    if target_re().is_match(value) {
        Ok(())
    } else {
        Err(TechnicError::InvalidIdentity {
            field: "target resource",
            value: value.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ApprovalEntry / LastError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalEntry {
    fn pending() -> Self {
        Self {
            decision: Decision::Pending,
            decided_at: None,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => f.write_str("transient"),
            FailureClass::Permanent => f.write_str("permanent"),
        }
    }
}

/// The last failure recorded against a request, shown to the host as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub class: FailureClass,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// NewAccessRequest
// ---------------------------------------------------------------------------

/// Caller-supplied fields for a new request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccessRequest {
    pub subject: String,
    pub action_kind: ActionKind,
    pub target_resource: String,
    pub requested_by: String,
    pub owners: Vec<String>,
    /// Free-text link back to the ticket or asset that raised the request.
    #[serde(default)]
    pub reference: Option<String>,
}

// ---------------------------------------------------------------------------
// AccessRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: Uuid,
    /// Optimistic-concurrency token. Bumped by the store on every update.
    pub version: u64,
    pub subject: String,
    pub action_kind: ActionKind,
    pub target_resource: String,
    pub requested_by: String,
    pub owners: Vec<String>,
    pub approvals: BTreeMap<String, ApprovalEntry>,
    pub status: RequestStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// When the scheduler should next look at this request.
    pub next_evaluation_at: DateTime<Utc>,
}

impl AccessRequest {
    /// Build a validated request in `New`.
    ///
    /// Owners are trimmed and de-duplicated, keeping the first occurrence.
    pub fn new(input: NewAccessRequest, now: DateTime<Utc>) -> Result<Self> {
        let subject = input.subject.trim().to_string();
        let requested_by = input.requested_by.trim().to_string();
        let target_resource = input.target_resource.trim().to_string();
        validate_identity("subject", &subject)?;
        validate_identity("requester", &requested_by)?;
        validate_target(&target_resource)?;

        let mut owners: Vec<String> = Vec::with_capacity(input.owners.len());
        for owner in input.owners {
            let owner = owner.trim().to_string();
            validate_identity("owner", &owner)?;
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        if owners.is_empty() {
            return Err(TechnicError::EmptyOwners);
        }

        let approvals = owners
            .iter()
            .map(|o| (o.clone(), ApprovalEntry::pending()))
            .collect();

        Ok(Self {
            id: Uuid::new_v4(),
            version: 0,
            subject,
            action_kind: input.action_kind,
            target_resource,
            requested_by,
            owners,
            approvals,
            status: RequestStatus::New,
            attempts: 0,
            last_error: None,
            reference: input.reference.filter(|r| !r.trim().is_empty()),
            created_at: now,
            decided_at: None,
            executed_at: None,
            updated_at: now,
            next_evaluation_at: now,
        })
    }

    pub fn is_owner(&self, identity: &str) -> bool {
        self.owners.iter().any(|o| o == identity)
    }

    /// The decision recorded for `owner`, `Pending` if none.
    pub fn decision_of(&self, owner: &str) -> Decision {
        self.approvals
            .get(owner)
            .map(|e| e.decision)
            .unwrap_or(Decision::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// When this request expires if it is still awaiting approval.
    pub fn expires_at(&self, approval_timeout: Duration) -> DateTime<Utc> {
        later(self.created_at, approval_timeout)
    }

    /// Move along one edge of the state machine, stamping the lifecycle
    /// timestamps that belong to the target state.
    pub fn transition(&mut self, to: RequestStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(TechnicError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: format!("no edge from {} to {}", self.status, to),
            });
        }
        match to {
            RequestStatus::Approved | RequestStatus::Rejected | RequestStatus::Expired => {
                set_once(&mut self.decided_at, now);
            }
            RequestStatus::Succeeded => set_once(&mut self.executed_at, now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn record_failure(&mut self, class: FailureClass, reason: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(LastError {
            class,
            reason: reason.into(),
            at: now,
        });
    }
}

/// 9999-12-31T23:59:59Z, the last instant that survives an RFC 3339 round trip.
const LATEST_SECS: i64 = 253_402_300_799;

/// `at + by`, saturating at `LATEST_SECS`.
pub(crate) fn later(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    let latest = DateTime::from_timestamp(LATEST_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
    at.checked_add_signed(by).map_or(latest, |t| t.min(latest))
}

fn set_once(slot: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if slot.is_none() {
        *slot = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
