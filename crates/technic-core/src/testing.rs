//! In-memory backend used by the dispatcher and scheduler tests.
//!
//! `FakeBackend` keeps the backend's effective state (memberships, installs,
//! archived mailboxes) separately from the raw call count, so tests can show
//! that replaying an action calls the backend again without changing it again.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::adapter::{Adapter, DispatchResult};
use crate::types::{ActionKind, Backend};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Apply the action to the in-memory state and report success.
    Apply,
    AlwaysTransient,
    AlwaysPermanent,
    /// Never return; exercises the dispatcher's timeout.
    Hang,
    Panic,
}

pub struct FakeBackend {
    backend: Backend,
    behavior: Behavior,
    /// Results handed out before falling back to `behavior`.
    script: Mutex<VecDeque<DispatchResult>>,
    state: Mutex<HashSet<(String, String)>>,
    calls: AtomicUsize,
    effective_changes: AtomicUsize,
    /// Subjects in call order.
    log: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            behavior: Behavior::Apply,
            script: Mutex::new(VecDeque::new()),
            state: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            effective_changes: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn then(self, result: DispatchResult) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn effective_changes(&self) -> usize {
        self.effective_changes.load(Ordering::SeqCst)
    }

    pub fn call_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn holds(&self, target: &str, subject: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .contains(&(target.to_string(), subject.to_string()))
    }

    fn apply_to_state(&self, kind: ActionKind, target: &str, subject: &str) {
        let key = (target.to_string(), subject.to_string());
        let mut state = self.state.lock().unwrap();
        let changed = match kind {
            ActionKind::RevokeGroup => state.remove(&key),
            ActionKind::GrantGroup | ActionKind::InstallSoftware | ActionKind::ArchiveMailbox => {
                state.insert(key)
            }
        };
        if changed {
            self.effective_changes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Adapter for FakeBackend {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn apply(&self, kind: ActionKind, target_resource: &str, subject: &str) -> DispatchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(subject.to_string());
        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(scripted) = scripted {
            if scripted.is_success() {
                self.apply_to_state(kind, target_resource, subject);
            }
            return scripted;
        }
        match &self.behavior {
            Behavior::Apply => {
                self.apply_to_state(kind, target_resource, subject);
                DispatchResult::Success
            }
            Behavior::AlwaysTransient => DispatchResult::transient("backend unavailable"),
            Behavior::AlwaysPermanent => DispatchResult::permanent("access denied"),
            Behavior::Hang => futures::future::pending::<DispatchResult>().await,
            Behavior::Panic => panic!("fake backend blew up"),
        }
    }
}

#[tokio::test]
async fn replayed_apply_changes_state_once() {
    let backend = FakeBackend::new(Backend::Directory);
    for _ in 0..3 {
        let r = backend.apply(ActionKind::GrantGroup, "vpn-users", "jdoe").await;
        assert_eq!(r, DispatchResult::Success);
    }
    assert_eq!(backend.calls(), 3);
    assert_eq!(backend.effective_changes(), 1);
    assert!(backend.holds("vpn-users", "jdoe"));

    backend.apply(ActionKind::RevokeGroup, "vpn-users", "jdoe").await;
    backend.apply(ActionKind::RevokeGroup, "vpn-users", "jdoe").await;
    assert_eq!(backend.effective_changes(), 2);
    assert!(!backend.holds("vpn-users", "jdoe"));
}
