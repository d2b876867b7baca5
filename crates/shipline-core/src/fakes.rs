//! In-memory fakes for every capability (testing only)
//!
//! Each fake is scriptable and records what it was asked, so tests can drive
//! the orchestrator through whole lifecycles on a paused clock without a
//! repository, CI, scheduler or DNS.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::capability::{
    BuildProvider, DomainRegistrar, ProbeError, Prober, PushOutcome, Remediator, SessionStore,
    SourceControl, StatusSink, StatusUpdate, WorkloadInspector,
};
use crate::domain::{
    is_protected, BuildFailureReason, BuildRun, BuildStatus, CertificateState, ChangeSet,
    FileOp, LifecycleSession, Phase, RecordType, ReplicaStatus, Result, RevisionId, SessionId,
    ShiplineError, WorkloadEvent, WorkloadSelector,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// FakeSourceControl
// ---------------------------------------------------------------------------

type Tree = BTreeMap<String, String>;

#[derive(Debug)]
struct Repo {
    commits: HashMap<RevisionId, Tree>,
    head: RevisionId,
    /// Remote revision the local branch was last synchronized with.
    base: RevisionId,
    remote: RevisionId,
    worktree: Tree,
    staged: Option<Tree>,
    next_id: u64,
    reject_pushes: u32,
    pushes: u32,
    commits_made: u32,
    applies: u32,
    resets: u32,
}

impl Repo {
    fn tree(&self, revision: &RevisionId) -> Tree {
        self.commits.get(revision).cloned().unwrap_or_default()
    }

    fn record(&mut self, tree: Tree) -> RevisionId {
        self.next_id += 1;
        let id = RevisionId::new(format!("{:040x}", self.next_id));
        self.commits.insert(id.clone(), tree);
        id
    }
}

/// A repository with one local branch and one remote, kept as file maps.
#[derive(Debug)]
pub struct FakeSourceControl {
    protected: BTreeSet<String>,
    repo: Mutex<Repo>,
}

impl FakeSourceControl {
    pub fn new<I, S>(protected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = RevisionId::new(format!("{:040x}", 0));
        let mut commits = HashMap::new();
        commits.insert(root.clone(), Tree::new());
        Self {
            protected: protected.into_iter().map(Into::into).collect(),
            repo: Mutex::new(Repo {
                commits,
                head: root.clone(),
                base: root.clone(),
                remote: root,
                worktree: Tree::new(),
                staged: None,
                next_id: 0,
                reject_pushes: 0,
                pushes: 0,
                commits_made: 0,
                applies: 0,
                resets: 0,
            }),
        }
    }

    /// Commit `path` directly on both the local and remote branch.
    pub fn seed(&self, path: &str, content: &str) {
        let mut repo = lock(&self.repo);
        let mut tree = repo.tree(&repo.head.clone());
        tree.insert(path.to_string(), content.to_string());
        let id = repo.record(tree.clone());
        repo.head = id.clone();
        repo.base = id.clone();
        repo.remote = id;
        repo.worktree = tree;
    }

    /// Edit the working tree outside of any change set.
    pub fn dirty(&self, path: &str, content: &str) {
        lock(&self.repo)
            .worktree
            .insert(path.to_string(), content.to_string());
    }

    /// Reject the next `n` pushes as if someone else pushed first.
    pub fn advance_remote_before_next_push(&self, n: u32) {
        lock(&self.repo).reject_pushes = n;
    }

    pub fn remote_head_now(&self) -> RevisionId {
        lock(&self.repo).remote.clone()
    }

    pub fn committed_file(&self, revision: &RevisionId, path: &str) -> Option<String> {
        lock(&self.repo)
            .commits
            .get(revision)
            .and_then(|tree| tree.get(path).cloned())
    }

    pub fn push_count(&self) -> u32 {
        lock(&self.repo).pushes
    }

    pub fn commit_count(&self) -> u32 {
        lock(&self.repo).commits_made
    }

    pub fn apply_count(&self) -> u32 {
        lock(&self.repo).applies
    }

    pub fn reset_count(&self) -> u32 {
        lock(&self.repo).resets
    }

    pub fn head_now(&self) -> RevisionId {
        lock(&self.repo).head.clone()
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn get_head(&self) -> Result<RevisionId> {
        Ok(lock(&self.repo).head.clone())
    }

    async fn remote_head(&self) -> Result<RevisionId> {
        Ok(lock(&self.repo).remote.clone())
    }

    async fn protected_paths(&self) -> Result<BTreeSet<String>> {
        Ok(self.protected.clone())
    }

    async fn apply(&self, change_set: &ChangeSet) -> Result<()> {
        let mut repo = lock(&self.repo);
        repo.applies += 1;
        for change in &change_set.changes {
            match &change.op {
                FileOp::Write { content } => {
                    repo.worktree.insert(change.path.clone(), content.clone());
                }
                FileOp::Delete => {
                    repo.worktree.remove(&change.path);
                }
            }
        }
        Ok(())
    }

    async fn restore(&self, paths: &BTreeSet<String>) -> Result<()> {
        let mut repo = lock(&self.repo);
        let head = repo.tree(&repo.head.clone());
        // Like `git checkout HEAD -- <path>`: tracked files only.
        for (path, content) in head.iter().filter(|(p, _)| is_protected(p, paths)) {
            repo.worktree.insert(path.clone(), content.clone());
        }
        Ok(())
    }

    async fn stage_all(&self) -> Result<Vec<String>> {
        let mut repo = lock(&self.repo);
        let head = repo.tree(&repo.head.clone());
        let staged = repo.worktree.clone();
        let changed: Vec<String> = head
            .keys()
            .chain(staged.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|p| head.get(*p) != staged.get(*p))
            .cloned()
            .collect();
        repo.staged = Some(staged);
        Ok(changed)
    }

    async fn discard(&self) -> Result<()> {
        let mut repo = lock(&self.repo);
        let head = repo.tree(&repo.head.clone());
        let mut tree = head.clone();
        // Untracked files survive, as with `git reset --hard`.
        for (path, content) in &repo.worktree {
            if !head.contains_key(path) {
                tree.insert(path.clone(), content.clone());
            }
        }
        repo.worktree = tree;
        repo.staged = None;
        Ok(())
    }

    async fn commit(&self, _message: &str) -> Result<RevisionId> {
        let mut repo = lock(&self.repo);
        let Some(tree) = repo.staged.take() else {
            return Err(ShiplineError::SourceControl("nothing staged".to_string()));
        };
        let id = repo.record(tree);
        repo.head = id.clone();
        repo.commits_made += 1;
        Ok(id)
    }

    async fn push(&self) -> Result<PushOutcome> {
        let mut repo = lock(&self.repo);
        repo.pushes += 1;
        if repo.reject_pushes > 0 {
            repo.reject_pushes -= 1;
            let mut upstream = repo.tree(&repo.remote.clone());
            upstream.insert(format!("upstream/{}.txt", repo.next_id), "theirs".to_string());
            let id = repo.record(upstream);
            repo.remote = id.clone();
            return Ok(PushOutcome::Rejected { remote_head: id });
        }
        if repo.base != repo.remote {
            return Ok(PushOutcome::Rejected {
                remote_head: repo.remote.clone(),
            });
        }
        repo.remote = repo.head.clone();
        repo.base = repo.head.clone();
        Ok(PushOutcome::Pushed(repo.head.clone()))
    }

    async fn rebase_onto(&self, remote_head: &RevisionId) -> Result<RevisionId> {
        let mut repo = lock(&self.repo);
        let base = repo.tree(&repo.base.clone());
        let head = repo.tree(&repo.head.clone());
        let mut rebased = repo.tree(remote_head);
        for path in base.keys().chain(head.keys()).collect::<BTreeSet<_>>() {
            match (base.get(path), head.get(path)) {
                (before, Some(after)) if before != Some(after) => {
                    rebased.insert(path.clone(), after.clone());
                }
                (Some(_), None) => {
                    rebased.remove(path);
                }
                _ => {}
            }
        }
        let id = repo.record(rebased.clone());
        repo.head = id.clone();
        repo.base = remote_head.clone();
        repo.worktree = rebased;
        Ok(id)
    }
    async fn reset_to_remote(&self) -> Result<RevisionId> {
        let mut repo = lock(&self.repo);
        let remote = repo.remote.clone();
        repo.worktree = repo.tree(&remote);
        repo.staged = None;
        repo.head = remote.clone();
        repo.base = remote.clone();
        repo.resets += 1;
        Ok(remote)
    }
}

// ---------------------------------------------------------------------------
// ScriptedBuildProvider
// ---------------------------------------------------------------------------

/// How the build for one revision behaves.
#[derive(Debug, Clone)]
pub struct BuildScript {
    errors: u32,
    running_polls: u32,
    outcome: Option<(BuildStatus, Option<BuildFailureReason>, String)>,
}

impl BuildScript {
    /// `polls` non-terminal observations, then success.
    pub fn succeeds_after(polls: u32) -> Self {
        Self {
            errors: 0,
            running_polls: polls,
            outcome: Some((BuildStatus::Succeeded, None, String::new())),
        }
    }

    pub fn succeeds() -> Self {
        Self::succeeds_after(1)
    }

    /// One running observation, then failure with `log`.
    pub fn fails_with_log(log: impl Into<String>) -> Self {
        Self {
            errors: 0,
            running_polls: 1,
            outcome: Some((BuildStatus::Failed, None, log.into())),
        }
    }

    /// Never reaches a terminal status.
    pub fn hangs() -> Self {
        Self {
            errors: 0,
            running_polls: 0,
            outcome: None,
        }
    }

    pub fn with_reason(mut self, reason: BuildFailureReason) -> Self {
        if let Some((_, slot, _)) = self.outcome.as_mut() {
            *slot = Some(reason);
        }
        self
    }

    /// Fail the first `n` polls with a provider error.
    pub fn with_errors(mut self, n: u32) -> Self {
        self.errors = n;
        self
    }
}

#[derive(Debug, Default)]
struct BuildBoard {
    queue: VecDeque<BuildScript>,
    assigned: HashMap<RevisionId, (BuildScript, u32)>,
    order: Vec<RevisionId>,
}

/// Assigns scripts to revisions in the order they are first polled.
/// Revisions without a queued script build successfully.
#[derive(Debug, Default)]
pub struct ScriptedBuildProvider {
    board: Mutex<BuildBoard>,
}

impl ScriptedBuildProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: BuildScript) {
        lock(&self.board).queue.push_back(script);
    }

    pub fn polls(&self, revision: &RevisionId) -> u32 {
        lock(&self.board)
            .assigned
            .get(revision)
            .map_or(0, |(_, polls)| *polls)
    }

    /// Revisions observed so far, in first-poll order.
    pub fn revisions(&self) -> Vec<RevisionId> {
        lock(&self.board).order.clone()
    }
}

#[async_trait]
impl BuildProvider for ScriptedBuildProvider {
    async fn get_run_status(&self, revision: &RevisionId) -> Result<BuildRun> {
        let mut board = lock(&self.board);
        if !board.assigned.contains_key(revision) {
            let script = board.queue.pop_front().unwrap_or_else(BuildScript::succeeds);
            board.assigned.insert(revision.clone(), (script, 0));
            board.order.push(revision.clone());
        }
        let Some((script, polls)) = board.assigned.get_mut(revision) else {
            return Err(ShiplineError::BuildProvider("unknown revision".to_string()));
        };
        *polls += 1;
        if *polls <= script.errors {
            return Err(ShiplineError::BuildProvider("scripted outage".to_string()));
        }

        let observed = *polls - script.errors;
        match &script.outcome {
            Some((status, reason, log)) if observed > script.running_polls => {
                let mut run = BuildRun::new(revision.clone(), *status).with_log(log.clone());
                run.failure = *reason;
                Ok(run)
            }
            _ => Ok(BuildRun::new(revision.clone(), BuildStatus::Running)),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeWorkloadInspector
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Workload {
    queued: VecDeque<ReplicaStatus>,
    current: ReplicaStatus,
    events: Vec<WorkloadEvent>,
    reads: u32,
}

/// Scheduler view: queued statuses are served first, then `current` forever.
#[derive(Debug, Default)]
pub struct FakeWorkloadInspector {
    workload: Mutex<Workload>,
}

impl FakeWorkloadInspector {
    pub fn healthy(replicas: u32) -> Self {
        Self::stuck(ReplicaStatus::new(replicas, replicas, 0))
    }

    pub fn stuck(status: ReplicaStatus) -> Self {
        Self {
            workload: Mutex::new(Workload {
                current: status,
                ..Workload::default()
            }),
        }
    }

    pub fn queue(&self, statuses: impl IntoIterator<Item = ReplicaStatus>) {
        lock(&self.workload).queued.extend(statuses);
    }

    pub fn set_status(&self, status: ReplicaStatus) {
        lock(&self.workload).current = status;
    }

    pub fn set_events(&self, events: Vec<WorkloadEvent>) {
        lock(&self.workload).events = events;
    }

    pub fn current(&self) -> ReplicaStatus {
        lock(&self.workload).current
    }

    pub fn replica_reads(&self) -> u32 {
        lock(&self.workload).reads
    }
}

#[async_trait]
impl WorkloadInspector for FakeWorkloadInspector {
    async fn get_replica_status(&self, _selector: &WorkloadSelector) -> Result<ReplicaStatus> {
        let mut workload = lock(&self.workload);
        workload.reads += 1;
        Ok(match workload.queued.pop_front() {
            Some(status) => status,
            None => workload.current,
        })
    }

    async fn get_failure_events(&self, _selector: &WorkloadSelector) -> Result<Vec<WorkloadEvent>> {
        Ok(lock(&self.workload).events.clone())
    }
}

// ---------------------------------------------------------------------------
// ScriptedProber
// ---------------------------------------------------------------------------

type ProbeOutcome = std::result::Result<u16, ProbeError>;

#[derive(Debug)]
struct Probes {
    queued: VecDeque<ProbeOutcome>,
    fallback: ProbeOutcome,
    calls: u32,
}

/// Queued probe results first, then the fallback forever.
#[derive(Debug)]
pub struct ScriptedProber {
    probes: Mutex<Probes>,
}

impl ScriptedProber {
    pub fn always(outcome: ProbeOutcome) -> Self {
        Self {
            probes: Mutex::new(Probes {
                queued: VecDeque::new(),
                fallback: outcome,
                calls: 0,
            }),
        }
    }

    pub fn queue(&self, outcomes: impl IntoIterator<Item = ProbeOutcome>) {
        lock(&self.probes).queued.extend(outcomes);
    }

    pub fn set_fallback(&self, outcome: ProbeOutcome) {
        lock(&self.probes).fallback = outcome;
    }

    pub fn calls(&self) -> u32 {
        lock(&self.probes).calls
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn http_get(&self, _url: &str, _timeout: Duration) -> ProbeOutcome {
        let mut probes = lock(&self.probes);
        probes.calls += 1;
        match probes.queued.pop_front() {
            Some(outcome) => outcome,
            None => probes.fallback.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeDomainRegistrar
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Zone {
    records: Vec<(String, RecordType, String)>,
    certificates: HashMap<String, CertificateState>,
    unavailable: bool,
    lookups: u32,
}

#[derive(Debug, Default)]
pub struct FakeDomainRegistrar {
    zone: Mutex<Zone>,
}

impl FakeDomainRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&self, name: &str, kind: RecordType, value: &str) {
        lock(&self.zone)
            .records
            .push((name.to_ascii_lowercase(), kind, value.to_string()));
    }

    pub fn set_certificate(&self, domain: &str, state: CertificateState) {
        lock(&self.zone)
            .certificates
            .insert(domain.to_ascii_lowercase(), state);
    }

    /// Make every lookup fail with a registrar error.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.zone).unavailable = unavailable;
    }

    pub fn lookups(&self) -> u32 {
        lock(&self.zone).lookups
    }
}

#[async_trait]
impl DomainRegistrar for FakeDomainRegistrar {
    async fn check_record(&self, name: &str, kind: RecordType, expected: &str) -> Result<bool> {
        let mut zone = lock(&self.zone);
        zone.lookups += 1;
        if zone.unavailable {
            return Err(ShiplineError::DomainRegistrar("scripted outage".to_string()));
        }
        Ok(zone
            .records
            .iter()
            .any(|(n, k, v)| n.eq_ignore_ascii_case(name) && *k == kind && v == expected))
    }

    async fn get_certificate_state(&self, domain: &str) -> Result<CertificateState> {
        let mut zone = lock(&self.zone);
        zone.lookups += 1;
        if zone.unavailable {
            return Err(ShiplineError::DomainRegistrar("scripted outage".to_string()));
        }
        Ok(zone
            .certificates
            .get(&domain.to_ascii_lowercase())
            .copied()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// ScriptedRemediator
// ---------------------------------------------------------------------------

/// Hands out queued fixes in order; `None` once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedRemediator {
    fixes: Mutex<VecDeque<Option<ChangeSet>>>,
    seen: Mutex<Vec<BuildRun>>,
}

impl ScriptedRemediator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fix(&self, fix: ChangeSet) {
        lock(&self.fixes).push_back(Some(fix));
    }

    pub fn push_none(&self) {
        lock(&self.fixes).push_back(None);
    }

    /// Failed runs the remediator was asked about.
    pub fn runs(&self) -> Vec<BuildRun> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl Remediator for ScriptedRemediator {
    async fn propose_fix(&self, run: &BuildRun) -> Result<Option<ChangeSet>> {
        lock(&self.seen).push(run.clone());
        Ok(lock(&self.fixes).pop_front().flatten())
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        lock(&self.updates).clone()
    }

    /// Phases entered, in order.
    pub fn phases(&self) -> Vec<Phase> {
        lock(&self.updates)
            .iter()
            .filter_map(|u| match u {
                StatusUpdate::Transition { narration, .. } => Some(narration.phase),
                _ => None,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.updates)
            .iter()
            .filter(|u| matches!(u, StatusUpdate::Live { .. }))
            .count()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&self, update: &StatusUpdate) {
        lock(&self.updates).push(update.clone());
    }
}

// ---------------------------------------------------------------------------
// MemorySessionStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, LifecycleSession>>,
    saves: Mutex<u32>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> u32 {
        *lock(&self.saves)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        lock(&self.sessions).contains_key(id)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &LifecycleSession) -> Result<()> {
        *lock(&self.saves) += 1;
        lock(&self.sessions).insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<LifecycleSession> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| ShiplineError::SessionNotFound(id.to_string()))
    }

    async fn remove(&self, id: &SessionId) -> Result<()> {
        lock(&self.sessions).remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = lock(&self.sessions).keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}
