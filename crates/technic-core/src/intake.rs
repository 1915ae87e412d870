use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::request::{AccessRequest, NewAccessRequest};
use crate::store::RequestStore;
use crate::types::RequestStatus;

/// Validate, open and persist a new access request.
///
/// The request is handed to the store already in `AwaitingApproval`, due
/// for its expiry check at `created_at + approval_timeout`. Approvals that
/// complete earlier pull that time forward.
pub fn submit(
    store: &dyn RequestStore,
    input: NewAccessRequest,
    approval_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<AccessRequest> {
    let mut request = AccessRequest::new(input, now)?;
    request.transition(RequestStatus::AwaitingApproval, now)?;
    request.next_evaluation_at = request.expires_at(approval_timeout);

    let id = store.create(&request)?;
    tracing::info!(
        request_id = %id,
        action = %request.action_kind,
        subject = %request.subject,
        target = %request.target_resource,
        owners = request.owners.len(),
        "access request opened"
    );
    store.get(id)
}
