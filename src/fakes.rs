//! In-memory fakes of the orchestrator's external seams.
//!
//! Useful for fast unit tests and for exercising whole pipelines without
//! cargo, packaging tools, account databases or a service manager.

use crate::cancel::Clock;
use crate::command::{CommandRunner, Invocation, ToolOutput};
use crate::descriptor::ServiceDescriptor;
use crate::orchestrator::HostServices;
use crate::platform::{PlatformTarget, TargetPath};
use crate::provisioner::{CreateError, ProvisionHost, ProvisionedDirectory, SystemPrincipal};
use crate::registrar::ServiceManager;
use anyhow::anyhow;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ------------------------------------------------------------------
// ScriptedRunner
// ------------------------------------------------------------------

enum Reply {
    Output(ToolOutput),
    SpawnError(String),
}

struct Script {
    prefix: String,
    replies: VecDeque<Reply>,
}

/// Command runner answering from a script keyed by command-line prefix.
///
/// The longest matching prefix wins. A script's last reply repeats forever;
/// commands matching nothing succeed with empty output. Every call is
/// recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<Vec<Script>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command starting with `prefix` with `output`
    pub fn respond(&self, prefix: &str, output: ToolOutput) {
        self.push_script(prefix, vec![Reply::Output(output)]);
    }

    /// Answer successive matching commands with `outputs` in order
    pub fn respond_seq(&self, prefix: &str, outputs: Vec<ToolOutput>) {
        self.push_script(prefix, outputs.into_iter().map(Reply::Output).collect());
    }

    /// Make commands starting with `prefix` fail to spawn at all
    pub fn fail_to_spawn(&self, prefix: &str, message: &str) {
        self.push_script(prefix, vec![Reply::SpawnError(message.to_string())]);
    }

    fn push_script(&self, prefix: &str, replies: Vec<Reply>) {
        let mut scripts = lock(&self.scripts);
        scripts.retain(|script| script.prefix != prefix);
        scripts.push(Script {
            prefix: prefix.to_string(),
            replies: replies.into(),
        });
    }

    /// Every invocation seen so far
    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    /// Every command line seen so far
    pub fn command_lines(&self) -> Vec<String> {
        lock(&self.calls).iter().map(Invocation::command_line).collect()
    }

    /// Number of calls whose command line starts with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.command_line().starts_with(prefix))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> anyhow::Result<ToolOutput> {
        let line = invocation.command_line();
        lock(&self.calls).push(invocation.clone());

        let mut scripts = lock(&self.scripts);
        let Some(script) = scripts
            .iter_mut()
            .filter(|script| line.starts_with(&script.prefix))
            .max_by_key(|script| script.prefix.len())
        else {
            return Ok(ToolOutput::ok(""));
        };

        let reply = if script.replies.len() > 1 {
            script.replies.pop_front()
        } else {
            None
        };
        let reply = reply.as_ref().or_else(|| script.replies.front());
        match reply {
            Some(Reply::Output(output)) => Ok(output.clone()),
            Some(Reply::SpawnError(message)) => Err(anyhow!("{}: {}", invocation.program, message)),
            None => Ok(ToolOutput::ok("")),
        }
    }
}

// ------------------------------------------------------------------
// FakeClock
// ------------------------------------------------------------------

/// Manually driven clock. `sleep` advances time instantly.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<Instant>,
    sleeps: AtomicUsize,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            sleeps: AtomicUsize::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *lock(&self.now) += duration;
    }

    /// Number of `sleep` calls so far
    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.advance(duration);
    }
}

// ------------------------------------------------------------------
// MemoryHost
// ------------------------------------------------------------------

/// Observable state of one directory in a [`MemoryHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryState {
    pub owner: Option<String>,
    pub mode: u32,
}

#[derive(Default)]
struct HostState {
    principals: BTreeMap<String, SystemPrincipal>,
    assigned_ids: BTreeSet<u32>,
    directories: BTreeMap<TargetPath, DirectoryState>,
    create_calls: usize,
    conflict_once: BTreeSet<u32>,
    always_conflict: bool,
    creation_failure: Option<String>,
    directory_failure: Option<String>,
}

/// Account database and filesystem held in memory
#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<HostState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose account database already uses `ids`
    pub fn with_assigned_ids(ids: &[u32]) -> Self {
        let host = Self::new();
        lock(&host.state).assigned_ids.extend(ids.iter().copied());
        host
    }

    /// Pre-existing principal
    pub fn add_principal(&self, name: &str, id: Option<u32>) {
        let mut state = lock(&self.state);
        if let Some(id) = id {
            state.assigned_ids.insert(id);
        }
        state.principals.insert(
            name.to_string(),
            SystemPrincipal {
                name: name.to_string(),
                home: PlatformTarget::Linux.layout(name).data_dir,
                id,
            },
        );
    }

    /// Pre-existing directory in an arbitrary state
    pub fn add_directory(&self, path: &TargetPath, owner: Option<&str>, mode: u32) {
        lock(&self.state).directories.insert(
            path.clone(),
            DirectoryState {
                owner: owner.map(str::to_string),
                mode,
            },
        );
    }

    /// The next creation using `id` conflicts, as if another process took it
    pub fn conflict_once_on(&self, id: u32) {
        lock(&self.state).conflict_once.insert(id);
    }

    /// Every creation attempt reports an id conflict
    pub fn always_conflict(&self) {
        lock(&self.state).always_conflict = true;
    }

    /// Every creation attempt fails outright
    pub fn fail_creation(&self, reason: &str) {
        lock(&self.state).creation_failure = Some(reason.to_string());
    }

    /// Every directory operation fails
    pub fn fail_directories(&self, reason: &str) {
        lock(&self.state).directory_failure = Some(reason.to_string());
    }

    pub fn principal(&self, name: &str) -> Option<SystemPrincipal> {
        lock(&self.state).principals.get(name).cloned()
    }

    pub fn principal_count(&self) -> usize {
        lock(&self.state).principals.len()
    }

    pub fn directory(&self, path: &TargetPath) -> Option<DirectoryState> {
        lock(&self.state).directories.get(path).cloned()
    }

    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }
}

impl ProvisionHost for MemoryHost {
    fn lookup_principal(
        &self,
        name: &str,
        _default_home: &TargetPath,
    ) -> anyhow::Result<Option<SystemPrincipal>> {
        Ok(self.principal(name))
    }

    fn max_assigned_id(&self) -> anyhow::Result<u32> {
        Ok(lock(&self.state)
            .assigned_ids
            .iter()
            .copied()
            .filter(|&id| id < 65534)
            .max()
            .unwrap_or(0))
    }

    fn create_principal(&self, principal: &SystemPrincipal) -> Result<(), CreateError> {
        let mut state = lock(&self.state);
        state.create_calls += 1;

        if let Some(reason) = &state.creation_failure {
            return Err(anyhow!("{}", reason).into());
        }
        if state.principals.contains_key(&principal.name) {
            return Err(anyhow!("principal '{}' already exists", principal.name).into());
        }
        if let Some(id) = principal.id {
            if state.always_conflict {
                return Err(CreateError::IdConflict(id));
            }
            if state.conflict_once.remove(&id) {
                state.assigned_ids.insert(id);
                return Err(CreateError::IdConflict(id));
            }
            if !state.assigned_ids.insert(id) {
                return Err(CreateError::IdConflict(id));
            }
        }
        state.principals.insert(principal.name.clone(), principal.clone());
        Ok(())
    }

    fn ensure_directory(&self, path: &TargetPath) -> anyhow::Result<bool> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.directory_failure {
            return Err(anyhow!("{}", reason));
        }
        if state.directories.contains_key(path) {
            return Ok(false);
        }
        state.directories.insert(
            path.clone(),
            DirectoryState {
                owner: None,
                mode: 0o755,
            },
        );
        Ok(true)
    }

    fn apply_ownership(&self, dir: &ProvisionedDirectory) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.directory_failure {
            return Err(anyhow!("{}", reason));
        }
        if !state.principals.contains_key(&dir.owner) {
            return Err(anyhow!("invalid user: '{}'", dir.owner));
        }
        let entry = state
            .directories
            .get_mut(&dir.path)
            .ok_or_else(|| anyhow!("{}: no such directory", dir.path))?;
        entry.owner = Some(dir.owner.clone());
        entry.mode = dir.mode;
        Ok(())
    }
}

// ------------------------------------------------------------------
// FakeServiceManager
// ------------------------------------------------------------------

#[derive(Default)]
struct ManagerState {
    installed: Vec<String>,
    started: Vec<String>,
    status_queries: usize,
    reject_install: Option<String>,
    reject_start: Option<String>,
    status_error: Option<String>,
    /// `None` = never running; `Some(n)` = running from the n-th query on
    running_after: Option<usize>,
}

/// Service manager whose services report running after a configurable
/// number of status queries.
pub struct FakeServiceManager {
    state: Mutex<ManagerState>,
}

impl FakeServiceManager {
    /// Services report running on the first status query
    pub fn new() -> Self {
        Self::running_after(1)
    }

    /// Services report running from the `queries`-th status query on
    pub fn running_after(queries: usize) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                running_after: Some(queries.max(1)),
                ..ManagerState::default()
            }),
        }
    }

    /// Services never report running
    pub fn never_running() -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn reject_install(&self, reason: &str) {
        lock(&self.state).reject_install = Some(reason.to_string());
    }

    pub fn reject_start(&self, reason: &str) {
        lock(&self.state).reject_start = Some(reason.to_string());
    }

    /// Status queries fail instead of answering
    pub fn fail_status(&self, reason: &str) {
        lock(&self.state).status_error = Some(reason.to_string());
    }

    pub fn installed(&self) -> Vec<String> {
        lock(&self.state).installed.clone()
    }

    pub fn started(&self) -> Vec<String> {
        lock(&self.state).started.clone()
    }

    pub fn status_queries(&self) -> usize {
        lock(&self.state).status_queries
    }
}

impl Default for FakeServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager for FakeServiceManager {
    fn install(&self, descriptor: &ServiceDescriptor) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.reject_install {
            return Err(anyhow!("{}", reason));
        }
        state.installed.push(descriptor.id.clone());
        Ok(())
    }

    fn start(&self, id: &str) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.reject_start {
            return Err(anyhow!("{}", reason));
        }
        state.started.push(id.to_string());
        Ok(())
    }

    fn is_running(&self, id: &str) -> anyhow::Result<bool> {
        let mut state = lock(&self.state);
        state.status_queries += 1;
        if let Some(reason) = &state.status_error {
            return Err(anyhow!("{}", reason));
        }
        let started = state.started.iter().any(|started| started == id);
        Ok(started && state.running_after.is_some_and(|n| state.status_queries >= n))
    }
}

// ------------------------------------------------------------------
// FakeHostServices
// ------------------------------------------------------------------

/// Hands out one shared [`MemoryHost`] and [`FakeServiceManager`] for every
/// target
#[derive(Clone, Default)]
pub struct FakeHostServices {
    pub host: Arc<MemoryHost>,
    pub manager: Arc<FakeServiceManager>,
}

impl FakeHostServices {
    pub fn new(host: MemoryHost, manager: FakeServiceManager) -> Self {
        Self {
            host: Arc::new(host),
            manager: Arc::new(manager),
        }
    }
}

impl HostServices for FakeHostServices {
    fn provision_host(&self, _target: PlatformTarget) -> Arc<dyn ProvisionHost> {
        self.host.clone()
    }

    fn service_manager(&self, _target: PlatformTarget) -> Arc<dyn ServiceManager> {
        self.manager.clone()
    }
}
