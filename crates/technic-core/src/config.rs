use crate::error::{Result, TechnicError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PolicyConfig
// ---------------------------------------------------------------------------

/// Approval and dispatch policy. The two limits have no default: an
/// installation has to choose them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Age after which an unapproved request expires.
    pub approval_timeout_hours: u64,
    /// Dispatch attempts before a request that keeps failing transiently is
    /// marked failed.
    pub max_dispatch_attempts: u32,
    #[serde(default)]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    /// How long a request may sit in `dispatching` before a later tick
    /// treats the dispatch as interrupted.
    #[serde(default = "default_dispatch_lease")]
    pub dispatch_lease_seconds: u64,
}

fn default_call_timeout() -> u64 {
    60
}

fn default_dispatch_lease() -> u64 {
    300
}

/// Upper bounds enforced by `validate()`.
pub const MAX_APPROVAL_TIMEOUT_HOURS: u64 = 24 * 365 * 10;
pub const MAX_POLICY_SECONDS: u64 = 7 * 24 * 3600;
pub const MAX_CADENCE_MINUTES: u64 = 7 * 24 * 60;

impl PolicyConfig {
    pub fn approval_timeout(&self) -> chrono::Duration {
        let hours = self.approval_timeout_hours.min(MAX_APPROVAL_TIMEOUT_HOURS);
        i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        bounded_seconds(self.retry_delay_seconds)
    }

    pub fn dispatch_lease(&self) -> chrono::Duration {
        bounded_seconds(self.dispatch_lease_seconds)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds.min(MAX_POLICY_SECONDS))
    }
}

/// Seconds as a chrono duration, clamped to `MAX_POLICY_SECONDS`.
fn bounded_seconds(seconds: u64) -> chrono::Duration {
    i64::try_from(seconds.min(MAX_POLICY_SECONDS))
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_cadence")]
    pub cadence_minutes: u64,
    /// Requests processed in parallel within one tick.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_cadence() -> u64 {
    5
}

fn default_concurrency() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cadence_minutes: default_cadence(),
            concurrency: default_concurrency(),
        }
    }
}

impl SchedulerConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_minutes.min(MAX_CADENCE_MINUTES) * 60)
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Connection settings for an HTTP/JSON backend gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub base_url: String,
    /// Name of the environment variable holding a bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl HttpBackendConfig {
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty())
    }
}

/// Scripting host used for mailbox archival.
///
/// `{mailbox}` and `{subject}` in `args` are substituted per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exit codes meaning "will never succeed" (mailbox missing, access denied).
    #[serde(default)]
    pub permanent_exit_codes: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<HttpBackendConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<HttpBackendConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archival: Option<ArchivalConfig>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

fn default_version() -> u32 {
    1
}

/// Written by `technic init`. Every value is a placeholder to review.
pub const CONFIG_TEMPLATE: &str = r#"version: 1
policy:
  # Unapproved requests older than this expire.
  approval_timeout_hours: 72
  # Transient failures are retried until this many dispatch attempts.
  max_dispatch_attempts: 5
  retry_delay_seconds: 0
  call_timeout_seconds: 60
  dispatch_lease_seconds: 300
scheduler:
  cadence_minutes: 5
  concurrency: 4
backends:
  directory:
    base_url: "https://directory-gateway.example.internal/api/"
    token_env: TECHNIC_DIRECTORY_TOKEN
  deployment:
    base_url: "https://deployment-console.example.internal/api/"
    token_env: TECHNIC_DEPLOYMENT_TOKEN
  archival:
    program: pwsh
    args: ["-NoProfile", "-File", "scripts/archive-mailbox.ps1", "-Mailbox", "{mailbox}", "-Owner", "{subject}"]
    permanent_exit_codes: [2, 3]
"#;

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(TechnicError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// `validate()` reduced to a hard failure on the first error-level entry.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(TechnicError::Config(w.message)),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        // 1. Policy limits
        if self.policy.approval_timeout_hours == 0 {
            error("policy.approval_timeout_hours must be greater than 0".to_string());
        }
        if self.policy.max_dispatch_attempts == 0 {
            error("policy.max_dispatch_attempts must be at least 1".to_string());
        }
        if self.policy.call_timeout_seconds == 0 {
            error("policy.call_timeout_seconds must be greater than 0".to_string());
        }
        if self.scheduler.cadence_minutes == 0 {
            error("scheduler.cadence_minutes must be greater than 0".to_string());
        }
        if self.policy.approval_timeout_hours > MAX_APPROVAL_TIMEOUT_HOURS {
            error(format!(
                "policy.approval_timeout_hours must be at most {MAX_APPROVAL_TIMEOUT_HOURS}"
            ));
        }
        for (name, value) in [
            ("retry_delay_seconds", self.policy.retry_delay_seconds),
            ("call_timeout_seconds", self.policy.call_timeout_seconds),
            ("dispatch_lease_seconds", self.policy.dispatch_lease_seconds),
        ] {
            if value > MAX_POLICY_SECONDS {
                error(format!("policy.{name} must be at most {MAX_POLICY_SECONDS}"));
            }
        }
        if self.scheduler.cadence_minutes > MAX_CADENCE_MINUTES {
            error(format!(
                "scheduler.cadence_minutes must be at most {MAX_CADENCE_MINUTES}"
            ));
        }

        // 2. Backend endpoints
        for (name, http) in [
            ("directory", &self.backends.directory),
            ("deployment", &self.backends.deployment),
        ] {
            if let Some(http) = http {
                if let Err(e) = reqwest::Url::parse(&http.base_url) {
                    error(format!(
                        "backends.{name}.base_url '{}' is not a valid URL: {e}",
                        http.base_url
                    ));
                }
            }
        }
        if let Some(archival) = &self.backends.archival {
            if archival.program.trim().is_empty() {
                error("backends.archival.program is empty".to_string());
            }
        }

        // 3. Warnings
        if self.policy.max_dispatch_attempts > 10 {
            warnings.push(warn(format!(
                "policy.max_dispatch_attempts={} (>10 is unusual)",
                self.policy.max_dispatch_attempts
            )));
        }
        if self.policy.dispatch_lease_seconds <= self.policy.call_timeout_seconds {
            warnings.push(warn(format!(
                "policy.dispatch_lease_seconds ({}) should exceed call_timeout_seconds ({}) \
                 or a slow call may be dispatched twice",
                self.policy.dispatch_lease_seconds, self.policy.call_timeout_seconds
            )));
        }
        if self.scheduler.concurrency == 0 {
            warnings.push(warn(
                "scheduler.concurrency is 0; requests will be processed one at a time".to_string(),
            ));
        }
        for (name, missing) in [
            ("directory", self.backends.directory.is_none()),
            ("deployment", self.backends.deployment.is_none()),
            ("archival", self.backends.archival.is_none()),
        ] {
            if missing {
                warnings.push(warn(format!(
                    "backends.{name} is not configured; its requests will fail permanently"
                )));
            }
        }
        for (name, http) in [
            ("directory", &self.backends.directory),
            ("deployment", &self.backends.deployment),
        ] {
            if let Some(env) = http.as_ref().and_then(|h| h.token_env.as_deref()) {
                if std::env::var(env).is_err() {
                    warnings.push(warn(format!(
                        "backends.{name}.token_env '{env}' is not set in the environment"
                    )));
                }
            }
        }
        if let Some(archival) = &self.backends.archival {
            let program = archival.program.trim();
            if !program.is_empty() && which::which(program).is_err() {
                warnings.push(warn(format!(
                    "backends.archival.program '{program}' was not found on PATH"
                )));
            }
        }

        warnings
    }
}

fn warn(message: String) -> ConfigWarning {
    ConfigWarning {
        level: WarnLevel::Warning,
        message,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
