//! Directory-service group membership over the directory gateway's HTTP API.
//!
//! - `GET    {base}/groups/{group}`                   existence check
//! - `PUT    {base}/groups/{group}/members/{account}` add (409 = already a member)
//! - `DELETE {base}/groups/{group}/members/{account}` remove (404 = not a member)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};

use crate::config::HttpBackendConfig;
use crate::error::Result;
use crate::types::{ActionKind, Backend};

use super::http::{failure_from, HttpBackend};
use super::{unsupported, Adapter, DispatchResult};

pub struct DirectoryAdapter {
    http: HttpBackend,
}

impl DirectoryAdapter {
    pub fn new(cfg: &HttpBackendConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpBackend::new(cfg, timeout)?,
        })
    }

    /// A missing group is permanent; anything else unexpected is classified
    /// by status.
    async fn ensure_group(&self, group: &str) -> std::result::Result<(), DispatchResult> {
        let url = self.http.url(&["groups", group])?;
        let response = self.http.send(self.http.request(Method::GET, url)).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(DispatchResult::permanent(format!(
                "group '{group}' does not exist"
            ))),
            _ => Err(failure_from(response).await),
        }
    }

    async fn add_member(&self, group: &str, account: &str) -> std::result::Result<(), DispatchResult> {
        let url = self.http.url(&["groups", group, "members", account])?;
        let response = self.http.send(self.http.request(Method::PUT, url)).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                tracing::debug!(group, account, "already a member");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(DispatchResult::permanent(format!(
                "account '{account}' does not exist"
            ))),
            _ => Err(failure_from(response).await),
        }
    }

    async fn remove_member(
        &self,
        group: &str,
        account: &str,
    ) -> std::result::Result<(), DispatchResult> {
        let url = self.http.url(&["groups", group, "members", account])?;
        let response = self.http.send(self.http.request(Method::DELETE, url)).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!(group, account, "not a member");
                Ok(())
            }
            _ => Err(failure_from(response).await),
        }
    }
}

#[async_trait]
impl Adapter for DirectoryAdapter {
    fn backend(&self) -> Backend {
        Backend::Directory
    }

    async fn apply(&self, kind: ActionKind, target_resource: &str, subject: &str) -> DispatchResult {
        let result = match kind {
            ActionKind::GrantGroup => match self.ensure_group(target_resource).await {
                Ok(()) => self.add_member(target_resource, subject).await,
                Err(e) => Err(e),
            },
            ActionKind::RevokeGroup => match self.ensure_group(target_resource).await {
                Ok(()) => self.remove_member(target_resource, subject).await,
                Err(e) => Err(e),
            },
            other => return unsupported(Backend::Directory, other),
        };
        result.err().unwrap_or(DispatchResult::Success)
    }
}
