//! Approval tracking: who has decided what, and what that means for the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TechnicError};
use crate::request::{AccessRequest, ApprovalEntry};
use crate::store::RequestStore;
use crate::types::{Decision, RequestStatus};

/// How many times `record_approval` re-reads after a `Conflict` before
/// surfacing it to the caller.
const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Pending,
    Approved,
    Rejected,
}

/// Combine the owners' decisions.
///
/// Any rejection wins outright. Otherwise a single pending owner keeps the
/// request pending, and only a full set of approvals approves it. Entries
/// for identities outside `owners` are ignored.
pub fn evaluate(request: &AccessRequest) -> ApprovalOutcome {
    let decisions: Vec<Decision> = request
        .owners
        .iter()
        .map(|o| request.decision_of(o))
        .collect();

    if decisions.contains(&Decision::Rejected) {
        ApprovalOutcome::Rejected
    } else if decisions.contains(&Decision::Pending) {
        ApprovalOutcome::Pending
    } else {
        ApprovalOutcome::Approved
    }
}

/// Record an owner's decision and apply its consequence.
///
/// Re-recording the decision an owner already made returns the stored
/// request untouched. A decision that completes the approval set or rejects
/// the request moves it to `Approved` or `Rejected` in the same write; an
/// approved request becomes due for dispatch immediately.
pub fn record_approval(
    store: &dyn RequestStore,
    request_id: Uuid,
    owner_id: &str,
    decision: Decision,
    comment: Option<String>,
    now: DateTime<Utc>,
) -> Result<AccessRequest> {
    if decision == Decision::Pending {
        return Err(TechnicError::InvalidDecision(
            "an owner can only approve or reject".to_string(),
        ));
    }

    let mut attempt = 0;
    loop {
        let request = store.get(request_id)?;
        let Some(updated) = apply_decision(&request, owner_id, decision, comment.clone(), now)?
        else {
            return Ok(request);
        };

        match store.update(&updated) {
            Ok(stored) => {
                tracing::info!(
                    request_id = %stored.id,
                    owner = owner_id,
                    decision = %decision,
                    status = %stored.status,
                    "approval recorded"
                );
                return Ok(stored);
            }
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                tracing::debug!(request_id = %request_id, attempt, "approval write conflicted, re-reading");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Pure part of `record_approval`. `Ok(None)` means "nothing to write".
fn apply_decision(
    request: &AccessRequest,
    owner_id: &str,
    decision: Decision,
    comment: Option<String>,
    now: DateTime<Utc>,
) -> Result<Option<AccessRequest>> {
    if !request.is_owner(owner_id) {
        return Err(TechnicError::OwnerNotFound {
            request: request.id,
            owner: owner_id.to_string(),
        });
    }

    let previous = request.decision_of(owner_id);
    if previous == decision {
        return Ok(None);
    }

    if request.status != RequestStatus::AwaitingApproval {
        return Err(TechnicError::InvalidTransition {
            from: request.status.to_string(),
            to: decision.to_string(),
            reason: format!("request is {}, no longer awaiting approval", request.status),
        });
    }
    if previous != Decision::Pending {
        return Err(TechnicError::InvalidTransition {
            from: previous.to_string(),
            to: decision.to_string(),
            reason: format!("'{owner_id}' has already decided"),
        });
    }

    let mut next = request.clone();
    next.approvals.insert(
        owner_id.to_string(),
        ApprovalEntry {
            decision,
            decided_at: Some(now),
            comment,
        },
    );

    match evaluate(&next) {
        ApprovalOutcome::Approved => {
            next.transition(RequestStatus::Approved, now)?;
            next.next_evaluation_at = now;
        }
        ApprovalOutcome::Rejected => next.transition(RequestStatus::Rejected, now)?,
        ApprovalOutcome::Pending => {}
    }
    Ok(Some(next))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
