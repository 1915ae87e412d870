use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TechnicError;

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    GrantGroup,
    RevokeGroup,
    InstallSoftware,
    ArchiveMailbox,
}

impl ActionKind {
    pub fn all() -> &'static [ActionKind] {
        &[
            ActionKind::GrantGroup,
            ActionKind::RevokeGroup,
            ActionKind::InstallSoftware,
            ActionKind::ArchiveMailbox,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::GrantGroup => "grant_group",
            ActionKind::RevokeGroup => "revoke_group",
            ActionKind::InstallSoftware => "install_software",
            ActionKind::ArchiveMailbox => "archive_mailbox",
        }
    }

    /// The backend system that carries out this kind of action.
    pub fn backend(self) -> Backend {
        match self {
            ActionKind::GrantGroup | ActionKind::RevokeGroup => Backend::Directory,
            ActionKind::InstallSoftware => Backend::Deployment,
            ActionKind::ArchiveMailbox => Backend::Archival,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = TechnicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant_group" | "grant-group" => Ok(ActionKind::GrantGroup),
            "revoke_group" | "revoke-group" => Ok(ActionKind::RevokeGroup),
            "install_software" | "install-software" => Ok(ActionKind::InstallSoftware),
            "archive_mailbox" | "archive-mailbox" => Ok(ActionKind::ArchiveMailbox),
            _ => Err(TechnicError::InvalidActionKind(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Directory,
    Deployment,
    Archival,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Directory => "directory",
            Backend::Deployment => "deployment",
            Backend::Archival => "archival",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RequestStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an access request.
///
/// ```text
/// New → AwaitingApproval → Approved → Dispatching → Succeeded
///                        ↘ Rejected     ↑      ↓  ↘ Failed
///                        ↘ Expired      └──────┘ (transient failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    New,
    AwaitingApproval,
    Approved,
    Rejected,
    Dispatching,
    Succeeded,
    Failed,
    Expired,
}

impl RequestStatus {
    pub fn all() -> &'static [RequestStatus] {
        &[
            RequestStatus::New,
            RequestStatus::AwaitingApproval,
            RequestStatus::Approved,
            RequestStatus::Rejected,
            RequestStatus::Dispatching,
            RequestStatus::Succeeded,
            RequestStatus::Failed,
            RequestStatus::Expired,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::New => "new",
            RequestStatus::AwaitingApproval => "awaiting_approval",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Dispatching => "dispatching",
            RequestStatus::Succeeded => "succeeded",
            RequestStatus::Failed => "failed",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected
                | RequestStatus::Succeeded
                | RequestStatus::Failed
                | RequestStatus::Expired
        )
    }

    /// The edges of the request state machine. Anything not listed here is
    /// an invalid transition.
    pub fn can_transition_to(self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, to),
            (New, AwaitingApproval)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (AwaitingApproval, Expired)
                | (Approved, Dispatching)
                | (Dispatching, Succeeded)
                | (Dispatching, Approved)
                | (Dispatching, Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = TechnicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s || st.as_str().replace('_', "-") == s)
            .ok_or_else(|| TechnicError::InvalidStatus(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// One owner's standing on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Pending => "pending",
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = TechnicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Decision::Pending),
            "approved" | "approve" => Ok(Decision::Approved),
            "rejected" | "reject" => Ok(Decision::Rejected),
            _ => Err(TechnicError::InvalidDecision(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
