//! Backend adapters: one uniform `apply` call per external system.
//!
//! Adapters carry no business logic. They translate an action into calls
//! against their backend and classify what came back. Every adapter must be
//! safe to call again with the same arguments after a success, because
//! dispatch is at-least-once: a tick can crash after the backend applied
//! the change but before the outcome was persisted.
//!
//! # Classification
//! - `Success`: the backend is now in the requested state, whether or not
//!   this call changed anything.
//! - `TransientFailure`: network, timeout, throttling, backend 5xx. Retried
//!   on a later tick up to the attempt limit.
//! - `PermanentFailure`: authorization, malformed target, missing resource.
//!   Never retried.

pub mod archival;
pub mod deployment;
pub mod directory;
mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::request::FailureClass;
use crate::types::{ActionKind, Backend};

pub use archival::ArchivalAdapter;
pub use deployment::DeploymentAdapter;
pub use directory::DirectoryAdapter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "reason", rename_all = "snake_case")]
pub enum DispatchResult {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
}

impl DispatchResult {
    pub fn transient(reason: impl Into<String>) -> Self {
        DispatchResult::TransientFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        DispatchResult::PermanentFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DispatchResult::Success)
    }

    /// `None` for success.
    pub fn failure(&self) -> Option<(FailureClass, &str)> {
        match self {
            DispatchResult::Success => None,
            DispatchResult::TransientFailure(r) => Some((FailureClass::Transient, r)),
            DispatchResult::PermanentFailure(r) => Some((FailureClass::Permanent, r)),
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// The backend this adapter talks to; the dispatcher routes on it.
    fn backend(&self) -> Backend;

    async fn apply(&self, kind: ActionKind, target_resource: &str, subject: &str) -> DispatchResult;
}

/// Result for an action kind routed to the wrong adapter.
pub(crate) fn unsupported(backend: Backend, kind: ActionKind) -> DispatchResult {
    DispatchResult::permanent(format!("{backend} backend does not handle {kind}"))
}
