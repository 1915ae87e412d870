//! Software entitlement through deployment-collection membership.
//!
//! `POST {base}/collections/{collection}/members` with `{"resource": subject}`
//! adds a direct membership rule. The console answers 409 when the rule is
//! already present, which counts as success.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Serialize;

use crate::config::HttpBackendConfig;
use crate::error::Result;
use crate::types::{ActionKind, Backend};

use super::http::{failure_from, HttpBackend};
use super::{unsupported, Adapter, DispatchResult};

#[derive(Serialize)]
struct MembershipRule<'a> {
    resource: &'a str,
}

pub struct DeploymentAdapter {
    http: HttpBackend,
}

impl DeploymentAdapter {
    pub fn new(cfg: &HttpBackendConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpBackend::new(cfg, timeout)?,
        })
    }

    async fn add_to_collection(
        &self,
        collection: &str,
        resource: &str,
    ) -> std::result::Result<(), DispatchResult> {
        let url = self.http.url(&["collections", collection, "members"])?;
        let builder = self
            .http
            .request(Method::POST, url)
            .json(&MembershipRule { resource });
        let response = self.http.send(builder).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                tracing::debug!(collection, resource, "membership rule already present");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(DispatchResult::permanent(format!(
                "collection '{collection}' or resource '{resource}' does not exist"
            ))),
            _ => Err(failure_from(response).await),
        }
    }
}

#[async_trait]
impl Adapter for DeploymentAdapter {
    fn backend(&self) -> Backend {
        Backend::Deployment
    }

    async fn apply(&self, kind: ActionKind, target_resource: &str, subject: &str) -> DispatchResult {
        match kind {
            ActionKind::InstallSoftware => match self.add_to_collection(target_resource, subject).await {
                Ok(()) => DispatchResult::Success,
                Err(e) => e,
            },
            other => unsupported(Backend::Deployment, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn adapter(server: &mockito::ServerGuard) -> DeploymentAdapter {
        DeploymentAdapter::new(
            &HttpBackendConfig {
                base_url: format!("{}/AdminService/", server.url()),
                token_env: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn install_posts_membership_rule() {
        let mut server = mockito::Server::new_async().await;
        let post = server
            .mock("POST", "/AdminService/collections/PS100123/members")
            .match_body(Matcher::Json(serde_json::json!({ "resource": "WS-0042" })))
            .with_status(201)
            .create_async()
            .await;

        let result = adapter(&server)
            .apply(ActionKind::InstallSoftware, "PS100123", "WS-0042")
            .await;
        assert_eq!(result, DispatchResult::Success);
        post.assert_async().await;
    }

    #[tokio::test]
    async fn repeated_install_is_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/AdminService/collections/PS100123/members")
            .with_status(409)
            .create_async()
            .await;

        let result = adapter(&server)
            .apply(ActionKind::InstallSoftware, "PS100123", "WS-0042")
            .await;
        assert_eq!(result, DispatchResult::Success);
    }

    #[tokio::test]
    async fn missing_collection_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/AdminService/collections/PS999999/members")
            .with_status(404)
            .create_async()
            .await;

        let result = adapter(&server)
            .apply(ActionKind::InstallSoftware, "PS999999", "WS-0042")
            .await;
        assert!(matches!(result, DispatchResult::PermanentFailure(r) if r.contains("PS999999")));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/AdminService/collections/PS100123/members")
            .with_status(503)
            .with_body("site server busy")
            .create_async()
            .await;

        let result = adapter(&server)
            .apply(ActionKind::InstallSoftware, "PS100123", "WS-0042")
            .await;
        assert!(matches!(result, DispatchResult::TransientFailure(r) if r.contains("site server busy")));
    }

    #[tokio::test]
    async fn group_actions_are_refused() {
        let server = mockito::Server::new_async().await;
        let result = adapter(&server)
            .apply(ActionKind::GrantGroup, "vpn-users", "jdoe")
            .await;
        assert!(matches!(result, DispatchResult::PermanentFailure(_)));
    }
}
