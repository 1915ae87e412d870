//! The periodic orchestration pass.
//!
//! One tick reads every request that is due, moves each one forward by at
//! most one step and writes the result back. Requests are independent:
//! a store error, a version conflict or a panicking adapter only affects
//! the request it happened on, and the tick always returns a summary.
//!
//! A dispatch is claimed before the adapter is called. The claim moves the
//! request to `Dispatching` and leases it until `now + dispatch_lease`; if
//! the process dies before the outcome is written, the next tick that finds
//! the lease expired treats the dispatch as a transient failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::approval::{self, ApprovalOutcome};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TechnicError};
use crate::request::{later, AccessRequest, FailureClass};
use crate::store::RequestStore;
use crate::types::RequestStatus;

const INTERRUPTED: &str = "dispatch interrupted before its outcome was recorded";

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// The limits a tick works under, resolved from configuration.
#[derive(Debug, Clone)]
pub struct Policy {
    pub approval_timeout: chrono::Duration,
    pub max_dispatch_attempts: u32,
    pub retry_delay: chrono::Duration,
    pub dispatch_lease: chrono::Duration,
    /// Bound on every store call made by the scheduler.
    pub call_timeout: Duration,
    pub concurrency: usize,
}

impl Policy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            approval_timeout: config.policy.approval_timeout(),
            max_dispatch_attempts: config.policy.max_dispatch_attempts,
            retry_delay: config.policy.retry_delay(),
            dispatch_lease: config.policy.dispatch_lease(),
            call_timeout: config.policy.call_timeout(),
            concurrency: config.scheduler.concurrency.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// TickSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Due requests picked up by this tick.
    pub processed: usize,
    pub approved: usize,
    pub rejected: usize,
    pub expired: usize,
    /// Adapter calls made.
    pub dispatched: usize,
    pub succeeded: usize,
    /// Failed transiently and went back to `approved` for another attempt.
    pub retried: usize,
    pub failed: usize,
    /// Skipped after a conflict or an error; picked up again next tick.
    pub deferred: usize,
    pub unchanged: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Approved => self.approved += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::Expired => self.expired += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Succeeded => {
                self.dispatched += 1;
                self.succeeded += 1;
            }
            Outcome::Retried { dispatched } => {
                self.dispatched += usize::from(dispatched);
                self.retried += 1;
            }
            Outcome::Failed { dispatched } => {
                self.dispatched += usize::from(dispatched);
                self.failed += 1;
            }
        }
    }
}

/// What happened to one request during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Approved,
    Rejected,
    Expired,
    Deferred,
    Succeeded,
    Retried { dispatched: bool },
    Failed { dispatched: bool },
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Holds only immutable collaborators; every tick starts from the store.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn RequestStore>,
    dispatcher: Arc<Dispatcher>,
    policy: Policy,
}

impl Scheduler {
    pub fn new(store: Arc<dyn RequestStore>, dispatcher: Arc<Dispatcher>, policy: Policy) -> Self {
        Self {
            store,
            dispatcher,
            policy,
        }
    }

    /// Build the scheduler and its adapters from `config`.
    pub fn from_config(store: Arc<dyn RequestStore>, config: &Config) -> Result<Self> {
        let dispatcher = Dispatcher::from_config(config)?;
        Ok(Self::new(store, Arc::new(dispatcher), Policy::from_config(config)))
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Run one orchestration pass as of `now`.
    ///
    /// Due requests are started oldest first with at most `concurrency` in
    /// flight. Each request runs on its own task so a panic is contained to
    /// that request, which is counted as deferred.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        let due = match self.store_call(move |s| s.list_due(now)).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "tick aborted: could not list due requests");
                return summary;
            }
        };
        if due.is_empty() {
            tracing::debug!("no requests due");
            return summary;
        }
        tracing::debug!(due = due.len(), "tick started");

        let outcomes: Vec<Outcome> = stream::iter(due)
            .map(|request| {
                let scheduler = self.clone();
                let id = request.id;
                async move {
                    let task = tokio::spawn(async move { scheduler.process(request, now).await });
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(request_id = %id, error = %e, "request evaluation aborted");
                            Outcome::Deferred
                        }
                    }
                }
            })
            .buffered(self.policy.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            summary.record(outcome);
        }
        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            deferred = summary.deferred,
            "tick finished"
        );
        summary
    }

    /// Tick now and then every `cadence` until `shutdown` resolves. A tick
    /// in progress runs to completion before the loop exits.
    pub async fn run<F>(&self, cadence: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(cadence_secs = cadence.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.run_tick(Utc::now()).await;
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    // -----------------------------------------------------------------------
    // Per-request steps
    // -----------------------------------------------------------------------

    async fn process(&self, request: AccessRequest, now: DateTime<Utc>) -> Outcome {
        let id = request.id;
        let result = match request.status {
            RequestStatus::New => self.open(request).await,
            RequestStatus::AwaitingApproval => self.evaluate_approval(request, now).await,
            RequestStatus::Approved => self.dispatch(request, now).await,
            RequestStatus::Dispatching => self.recover_interrupted(request, now).await,
            _ => Ok(Outcome::Unchanged),
        };
        result.unwrap_or_else(|e| {
            if e.is_conflict() {
                tracing::debug!(request_id = %id, "modified concurrently, deferring");
            } else {
                tracing::warn!(request_id = %id, error = %e, "deferring request");
            }
            Outcome::Deferred
        })
    }

    /// A request persisted before it reached `AwaitingApproval`.
    async fn open(&self, mut request: AccessRequest) -> Result<Outcome> {
        request.transition(RequestStatus::AwaitingApproval, request.created_at)?;
        request.next_evaluation_at = request.expires_at(self.policy.approval_timeout);
        self.persist(request).await?;
        Ok(Outcome::Unchanged)
    }

    async fn evaluate_approval(&self, mut request: AccessRequest, now: DateTime<Utc>) -> Result<Outcome> {
        let expires_at = request.expires_at(self.policy.approval_timeout);
        let outcome = match approval::evaluate(&request) {
            ApprovalOutcome::Approved => {
                request.transition(RequestStatus::Approved, now)?;
                request.next_evaluation_at = now;
                Outcome::Approved
            }
            ApprovalOutcome::Rejected => {
                request.transition(RequestStatus::Rejected, now)?;
                Outcome::Rejected
            }
            ApprovalOutcome::Pending if now >= expires_at => {
                request.transition(RequestStatus::Expired, now)?;
                Outcome::Expired
            }
            ApprovalOutcome::Pending => {
                if request.next_evaluation_at == expires_at {
                    return Ok(Outcome::Unchanged);
                }
                request.next_evaluation_at = expires_at;
                Outcome::Unchanged
            }
        };

        let stored = self.persist(request).await?;
        if outcome != Outcome::Unchanged {
            tracing::info!(request_id = %stored.id, status = %stored.status, "approval settled");
        }
        Ok(outcome)
    }

    async fn dispatch(&self, request: AccessRequest, now: DateTime<Utc>) -> Result<Outcome> {
        let mut claim = request;
        claim.transition(RequestStatus::Dispatching, now)?;
        claim.attempts += 1;
        claim.next_evaluation_at = later(now, self.policy.dispatch_lease);
        // A conflict here means another tick claimed it first.
        let claimed = self.persist(claim).await?;

        tracing::info!(
            request_id = %claimed.id,
            action = %claimed.action_kind,
            target = %claimed.target_resource,
            subject = %claimed.subject,
            attempt = claimed.attempts,
            "dispatching"
        );
        let result = self.dispatcher.dispatch(&claimed).await;

        let mut done = claimed;
        let outcome = match result.failure() {
            None => {
                done.transition(RequestStatus::Succeeded, now)?;
                Outcome::Succeeded
            }
            Some((FailureClass::Transient, reason)) => {
                self.fail_transiently(&mut done, reason.to_string(), true, now)?
            }
            Some((FailureClass::Permanent, reason)) => {
                done.record_failure(FailureClass::Permanent, reason, now);
                done.transition(RequestStatus::Failed, now)?;
                Outcome::Failed { dispatched: true }
            }
        };

        let id = done.id;
        let stored = match self.persist(done).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(
                    request_id = %id,
                    error = %e,
                    "dispatch outcome not recorded; it will be retried once the lease expires"
                );
                return Err(e);
            }
        };
        match (&outcome, &stored.last_error) {
            (Outcome::Succeeded, _) | (_, None) => {
                tracing::info!(request_id = %stored.id, "dispatch succeeded")
            }
            (_, Some(err)) => tracing::warn!(
                request_id = %stored.id,
                status = %stored.status,
                class = %err.class,
                reason = %err.reason,
                attempt = stored.attempts,
                "dispatch failed"
            ),
        }
        Ok(outcome)
    }

    /// A `Dispatching` request is only due once its lease has run out.
    async fn recover_interrupted(&self, mut request: AccessRequest, now: DateTime<Utc>) -> Result<Outcome> {
        tracing::warn!(
            request_id = %request.id,
            attempt = request.attempts,
            "dispatch lease expired"
        );
        let outcome = self.fail_transiently(&mut request, INTERRUPTED.to_string(), false, now)?;
        self.persist(request).await?;
        Ok(outcome)
    }

    /// Record a transient failure and either send the request back for
    /// another attempt or give up once the attempt budget is spent.
    fn fail_transiently(
        &self,
        request: &mut AccessRequest,
        reason: String,
        dispatched: bool,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        request.record_failure(FailureClass::Transient, reason, now);
        if request.attempts < self.policy.max_dispatch_attempts {
            request.transition(RequestStatus::Approved, now)?;
            request.next_evaluation_at = later(now, self.policy.retry_delay);
            Ok(Outcome::Retried { dispatched })
        } else {
            request.transition(RequestStatus::Failed, now)?;
            Ok(Outcome::Failed { dispatched })
        }
    }

    // -----------------------------------------------------------------------
    // Store access
    // -----------------------------------------------------------------------

    async fn persist(&self, request: AccessRequest) -> Result<AccessRequest> {
        self.store_call(move |s| s.update(&request)).await
    }

    /// Run a blocking store call off the async workers, bounded by the
    /// policy's call timeout.
    async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RequestStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));
        match tokio::time::timeout(self.policy.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(TechnicError::Store(format!("store task failed: {e}"))),
            Err(_) => Err(TechnicError::Store(format!(
                "store call timed out after {}s",
                self.policy.call_timeout.as_secs_f64()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DispatchResult;
    use crate::approval::record_approval;
    use crate::intake::submit;
    use crate::request::NewAccessRequest;
    use crate::store::RequestDb;
    use crate::testing::{Behavior, FakeBackend};
    use crate::types::{ActionKind, Backend, Decision};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        store: Arc<RequestDb>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(RequestDb::open(&dir.path().join("requests.db")).unwrap());
            Self { _dir: dir, store }
        }

        fn scheduler(&self, adapters: &[Arc<FakeBackend>], policy: Policy) -> Scheduler {
            let mut dispatcher = Dispatcher::new(Duration::from_secs(5));
            for adapter in adapters {
                dispatcher = dispatcher.with_adapter(adapter.clone());
            }
            Scheduler::new(self.store.clone(), Arc::new(dispatcher), policy)
        }

        fn submit(&self, kind: ActionKind, target: &str, subject: &str, owners: &[&str], now: DateTime<Utc>) -> AccessRequest {
            submit(
                self.store.as_ref(),
                NewAccessRequest {
                    subject: subject.to_string(),
                    action_kind: kind,
                    target_resource: target.to_string(),
                    requested_by: "helpdesk".to_string(),
                    owners: owners.iter().map(|o| o.to_string()).collect(),
                    reference: None,
                },
                policy().approval_timeout,
                now,
            )
            .unwrap()
        }

        fn decide(&self, req: &AccessRequest, owner: &str, decision: Decision, now: DateTime<Utc>) -> AccessRequest {
            record_approval(self.store.as_ref(), req.id, owner, decision, None, now).unwrap()
        }

        fn get(&self, req: &AccessRequest) -> AccessRequest {
            self.store.get(req.id).unwrap()
        }
    }

    fn policy() -> Policy {
        Policy {
            approval_timeout: chrono::Duration::hours(72),
            max_dispatch_attempts: 3,
            retry_delay: chrono::Duration::zero(),
            dispatch_lease: chrono::Duration::minutes(5),
            call_timeout: Duration::from_secs(5),
            concurrency: 4,
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[tokio::test]
    async fn two_owner_grant_succeeds_on_next_tick() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory));
        let scheduler = h.scheduler(&[directory.clone()], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice", "bob"], t0);
        let after_a = h.decide(&req, "alice", Decision::Approved, t0);
        assert_eq!(after_a.status, RequestStatus::AwaitingApproval);
        let after_b = h.decide(&req, "bob", Decision::Approved, t0 + secs(1));
        assert_eq!(after_b.status, RequestStatus::Approved);

        let summary = scheduler.run_tick(t0 + secs(2)).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.succeeded, 1);

        let done = h.get(&req);
        assert_eq!(done.status, RequestStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.executed_at, Some(t0 + secs(2)));
        assert!(directory.holds("vpn-users", "jdoe"));

        let summary = scheduler.run_tick(t0 + secs(60)).await;
        assert_eq!(summary, TickSummary::default());
        assert_eq!(h.get(&req).executed_at, Some(t0 + secs(2)));
        assert_eq!(directory.calls(), 1);
    }

    #[tokio::test]
    async fn rejected_install_is_never_dispatched() {
        let h = Harness::new();
        let deployment = Arc::new(FakeBackend::new(Backend::Deployment));
        let scheduler = h.scheduler(&[deployment.clone()], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::InstallSoftware, "PS100123", "WS-0042", &["carol"], t0);
        let rejected = h.decide(&req, "carol", Decision::Rejected, t0);
        assert_eq!(rejected.status, RequestStatus::Rejected);

        for n in 1..4 {
            scheduler.run_tick(t0 + chrono::Duration::hours(n * 30)).await;
        }
        let after = h.get(&req);
        assert_eq!(after.status, RequestStatus::Rejected);
        assert_eq!(after.attempts, 0);
        assert_eq!(deployment.calls(), 0);
    }

    #[tokio::test]
    async fn unapproved_request_expires_at_timeout() {
        let h = Harness::new();
        let scheduler = h.scheduler(&[], policy());
        let t0 = Utc::now();
        let timeout = policy().approval_timeout;

        let req = h.submit(ActionKind::RevokeGroup, "vpn-users", "jdoe", &["alice", "bob"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        let early = scheduler.run_tick(t0 + timeout - secs(1)).await;
        assert_eq!(early.processed, 0);
        assert_eq!(h.get(&req).status, RequestStatus::AwaitingApproval);

        let summary = scheduler.run_tick(t0 + timeout).await;
        assert_eq!(summary.expired, 1);
        let expired = h.get(&req);
        assert_eq!(expired.status, RequestStatus::Expired);
        assert_eq!(expired.decided_at, Some(t0 + timeout));

        let err = record_approval(h.store.as_ref(), req.id, "bob", Decision::Approved, None, t0 + timeout)
            .unwrap_err();
        assert!(matches!(err, TechnicError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn transient_failures_stop_at_max_attempts() {
        let h = Harness::new();
        let directory =
            Arc::new(FakeBackend::new(Backend::Directory).with_behavior(Behavior::AlwaysTransient));
        let scheduler = h.scheduler(&[directory.clone()], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        let first = scheduler.run_tick(t0).await;
        assert_eq!(first.retried, 1);
        assert_eq!(h.get(&req).status, RequestStatus::Approved);

        for n in 1..10 {
            scheduler.run_tick(t0 + secs(n)).await;
        }
        let failed = h.get(&req);
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert_eq!(directory.calls(), 3);
        let err = failed.last_error.unwrap();
        assert_eq!(err.class, FailureClass::Transient);
        assert!(err.reason.contains("unavailable"));
        assert_eq!(failed.executed_at, None);
    }

    #[tokio::test]
    async fn retry_waits_for_retry_delay() {
        let h = Harness::new();
        let directory = Arc::new(
            FakeBackend::new(Backend::Directory).then(DispatchResult::transient("gateway busy")),
        );
        let scheduler = h.scheduler(
            &[directory.clone()],
            Policy {
                retry_delay: chrono::Duration::minutes(10),
                ..policy()
            },
        );
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        scheduler.run_tick(t0).await;
        let waiting = h.get(&req);
        assert_eq!(waiting.status, RequestStatus::Approved);
        assert_eq!(waiting.next_evaluation_at, t0 + chrono::Duration::minutes(10));

        assert_eq!(scheduler.run_tick(t0 + chrono::Duration::minutes(5)).await.processed, 0);

        let summary = scheduler.run_tick(t0 + chrono::Duration::minutes(10)).await;
        assert_eq!(summary.succeeded, 1);
        let done = h.get(&req);
        assert_eq!(done.status, RequestStatus::Succeeded);
        assert_eq!(done.attempts, 2);
        assert_eq!(directory.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal_immediately() {
        let h = Harness::new();
        let deployment =
            Arc::new(FakeBackend::new(Backend::Deployment).with_behavior(Behavior::AlwaysPermanent));
        let scheduler = h.scheduler(&[deployment.clone()], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::InstallSoftware, "PS100123", "WS-0042", &["carol"], t0);
        h.decide(&req, "carol", Decision::Approved, t0);

        let summary = scheduler.run_tick(t0).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.dispatched, 1);

        let failed = h.get(&req);
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.unwrap().class, FailureClass::Permanent);

        scheduler.run_tick(t0 + secs(60)).await;
        assert_eq!(deployment.calls(), 1);
    }

    #[tokio::test]
    async fn missing_backend_fails_permanently() {
        let h = Harness::new();
        let scheduler = h.scheduler(&[], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::ArchiveMailbox, "jdoe@corp.example", "jdoe", &["hr"], t0);
        h.decide(&req, "hr", Decision::Approved, t0);
        scheduler.run_tick(t0).await;

        let failed = h.get(&req);
        assert_eq!(failed.status, RequestStatus::Failed);
        assert!(failed.last_error.unwrap().reason.contains("archival"));
    }

    #[tokio::test]
    async fn stale_copy_is_deferred_without_dispatch() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory));
        let scheduler = h.scheduler(&[directory.clone()], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        let stale = h.store.list_due(t0).unwrap().remove(0);
        // Another tick gets there first.
        h.store.update(&stale).unwrap();

        let outcome = scheduler.process(stale, t0).await;
        assert_eq!(outcome, Outcome::Deferred);
        assert_eq!(directory.calls(), 0);
        assert_eq!(h.get(&req).status, RequestStatus::Approved);

        scheduler.run_tick(t0).await;
        assert_eq!(h.get(&req).status, RequestStatus::Succeeded);
        assert_eq!(directory.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_ticks_dispatch_once() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory));
        let a = h.scheduler(&[directory.clone()], policy());
        let b = h.scheduler(&[directory.clone()], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        let (sa, sb) = tokio::join!(a.run_tick(t0), b.run_tick(t0));
        assert_eq!(sa.succeeded + sb.succeeded, 1);
        assert_eq!(directory.calls(), 1);
        assert_eq!(h.get(&req).status, RequestStatus::Succeeded);
    }

    #[tokio::test]
    async fn expired_lease_is_retried() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory));
        let scheduler = h.scheduler(&[directory.clone()], policy());
        let t0 = Utc::now();
        let lease = policy().dispatch_lease;

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        let mut claimed = h.decide(&req, "alice", Decision::Approved, t0);
        // Simulate a crash right after the claim was written.
        claimed.transition(RequestStatus::Dispatching, t0).unwrap();
        claimed.attempts = 1;
        claimed.next_evaluation_at = t0 + lease;
        h.store.update(&claimed).unwrap();

        assert_eq!(scheduler.run_tick(t0 + lease - secs(1)).await.processed, 0);

        let summary = scheduler.run_tick(t0 + lease).await;
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.dispatched, 0);
        let recovered = h.get(&req);
        assert_eq!(recovered.status, RequestStatus::Approved);
        assert!(recovered.last_error.unwrap().reason.contains("interrupted"));

        scheduler.run_tick(t0 + lease + secs(1)).await;
        let done = h.get(&req);
        assert_eq!(done.status, RequestStatus::Succeeded);
        assert_eq!(done.attempts, 2);
        assert_eq!(directory.calls(), 1);
    }

    #[tokio::test]
    async fn interrupted_last_attempt_fails() {
        let h = Harness::new();
        let scheduler = h.scheduler(&[Arc::new(FakeBackend::new(Backend::Directory))], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        let mut claimed = h.decide(&req, "alice", Decision::Approved, t0);
        claimed.transition(RequestStatus::Dispatching, t0).unwrap();
        claimed.attempts = 3;
        claimed.next_evaluation_at = t0;
        h.store.update(&claimed).unwrap();

        let summary = scheduler.run_tick(t0).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(h.get(&req).status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn panicking_adapter_is_isolated() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory).with_behavior(Behavior::Panic));
        let deployment = Arc::new(FakeBackend::new(Backend::Deployment));
        let scheduler = h.scheduler(&[directory, deployment.clone()], policy());
        let t0 = Utc::now();

        let grant = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        let install = h.submit(ActionKind::InstallSoftware, "PS100123", "WS-0042", &["carol"], t0 + secs(1));
        h.decide(&grant, "alice", Decision::Approved, t0 + secs(2));
        h.decide(&install, "carol", Decision::Approved, t0 + secs(2));

        let summary = scheduler.run_tick(t0 + secs(3)).await;
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(h.get(&install).status, RequestStatus::Succeeded);
        // The claim was written before the panic; the lease brings it back.
        assert_eq!(h.get(&grant).status, RequestStatus::Dispatching);
    }

    #[tokio::test]
    async fn due_requests_start_oldest_first() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory));
        let scheduler = h.scheduler(
            &[directory.clone()],
            Policy {
                concurrency: 1,
                ..policy()
            },
        );
        let t0 = Utc::now();

        let subjects = ["first", "second", "third"];
        let reqs: Vec<AccessRequest> = subjects
            .iter()
            .enumerate()
            .map(|(i, s)| h.submit(ActionKind::GrantGroup, "vpn-users", s, &["alice"], t0 + secs(i as i64)))
            .collect();
        // Approve newest first; dispatch order still follows creation.
        for req in reqs.iter().rev() {
            h.decide(req, "alice", Decision::Approved, t0 + secs(10));
        }

        scheduler.run_tick(t0 + secs(11)).await;
        assert_eq!(directory.call_log(), subjects);
    }

    #[tokio::test]
    async fn request_left_in_new_is_opened() {
        let h = Harness::new();
        let scheduler = h.scheduler(&[], policy());
        let t0 = Utc::now();

        let req = AccessRequest::new(
            NewAccessRequest {
                subject: "jdoe".to_string(),
                action_kind: ActionKind::GrantGroup,
                target_resource: "vpn-users".to_string(),
                requested_by: "helpdesk".to_string(),
                owners: vec!["alice".to_string()],
                reference: None,
            },
            t0,
        )
        .unwrap();
        h.store.create(&req).unwrap();

        let summary = scheduler.run_tick(t0).await;
        assert_eq!(summary.unchanged, 1);
        let opened = h.get(&req);
        assert_eq!(opened.status, RequestStatus::AwaitingApproval);
        assert_eq!(opened.next_evaluation_at, t0 + policy().approval_timeout);
    }

    #[tokio::test]
    async fn unreadable_record_does_not_stall_the_tick() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory));
        let scheduler = h.scheduler(&[directory.clone()], policy());
        let t0 = Utc::now();

        h.store
            .insert_raw(uuid::Uuid::new_v4(), t0 - secs(10), b"not json")
            .unwrap();
        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        let summary = scheduler.run_tick(t0 + secs(1)).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(h.get(&req).status, RequestStatus::Succeeded);
    }

    #[tokio::test]
    async fn dispatch_times_saturate_on_huge_delays() {
        let h = Harness::new();
        let directory = Arc::new(
            FakeBackend::new(Backend::Directory).with_behavior(Behavior::AlwaysTransient),
        );
        let scheduler = h.scheduler(
            &[directory.clone()],
            Policy {
                retry_delay: chrono::Duration::MAX,
                ..policy()
            },
        );
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        let summary = scheduler.run_tick(t0 + secs(1)).await;
        assert_eq!(summary.retried, 1);
        let waiting = h.get(&req);
        assert_eq!(waiting.status, RequestStatus::Approved);
        assert_eq!(waiting.next_evaluation_at.format("%Y-%m-%d").to_string(), "9999-12-31");
    }

    #[tokio::test]
    async fn run_ticks_until_shutdown() {
        let h = Harness::new();
        let directory = Arc::new(FakeBackend::new(Backend::Directory));
        let scheduler = h.scheduler(&[directory.clone()], policy());
        let t0 = Utc::now();

        let req = h.submit(ActionKind::GrantGroup, "vpn-users", "jdoe", &["alice"], t0);
        h.decide(&req, "alice", Decision::Approved, t0);

        scheduler
            .run(Duration::from_secs(3600), tokio::time::sleep(Duration::from_millis(200)))
            .await;
        assert_eq!(h.get(&req).status, RequestStatus::Succeeded);
        assert_eq!(directory.calls(), 1);
    }
}
