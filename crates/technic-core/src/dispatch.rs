//! Routes a request to the adapter for its backend and bounds the call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{Adapter, ArchivalAdapter, DeploymentAdapter, DirectoryAdapter, DispatchResult};
use crate::config::Config;
use crate::error::Result;
use crate::request::AccessRequest;
use crate::types::Backend;

pub struct Dispatcher {
    adapters: HashMap<Backend, Arc<dyn Adapter>>,
    call_timeout: Duration,
}

impl Dispatcher {
    /// A dispatcher with no adapters; add them with `with_adapter`.
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            adapters: HashMap::new(),
            call_timeout,
        }
    }

    /// Register `adapter` for the backend it reports, replacing any previous one.
    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(adapter.backend(), adapter);
        self
    }

    /// Build the adapters for every backend present in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = config.policy.call_timeout();
        let mut dispatcher = Self::new(timeout);
        if let Some(cfg) = &config.backends.directory {
            dispatcher = dispatcher.with_adapter(Arc::new(DirectoryAdapter::new(cfg, timeout)?));
        }
        if let Some(cfg) = &config.backends.deployment {
            dispatcher = dispatcher.with_adapter(Arc::new(DeploymentAdapter::new(cfg, timeout)?));
        }
        if let Some(cfg) = &config.backends.archival {
            dispatcher = dispatcher.with_adapter(Arc::new(ArchivalAdapter::new(cfg)));
        }
        Ok(dispatcher)
    }

    pub fn has_backend(&self, backend: Backend) -> bool {
        self.adapters.contains_key(&backend)
    }

    /// Run the request's action once. Never fails: every outcome, including
    /// a timeout or a missing adapter, comes back as a `DispatchResult`.
    pub async fn dispatch(&self, request: &AccessRequest) -> DispatchResult {
        let backend = request.action_kind.backend();
        let Some(adapter) = self.adapters.get(&backend) else {
            return DispatchResult::permanent(format!("no {backend} backend configured"));
        };

        let call = adapter.apply(
            request.action_kind,
            &request.target_resource,
            &request.subject,
        );
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => DispatchResult::transient(format!(
                "{backend} call timed out after {}s",
                self.call_timeout.as_secs_f64()
            )),
        }
    }
}
