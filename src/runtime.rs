//! Container runtime adapter: deploy, stop and observe compose stacks
//!
//! Two interchangeable implementations satisfy [`ContainerRuntime`]: the
//! real [`ComposeRuntime`] shelling out to the compose CLI, and an
//! in-memory [`MockRuntime`] for fast deterministic tests. The choice is
//! made once at startup and never switched at runtime.

use crate::error::StackError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, error, trace, warn};

/// The control plane's own project name; never listed, never proxied to
pub const RESERVED_STACK: &str = "stackgate";

/// Lifecycle state of a stack, recomputed on every query.
///
/// `Running` is an intermediate produced while listing the runtime, before
/// container health has been evaluated; the adapter always resolves it to
/// `Starting` or `Available` before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackState {
    Uninitialized,
    Running,
    Starting,
    Available,
    Downloading,
    Stopping,
}

impl StackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackState::Uninitialized => "Uninitialized",
            StackState::Running => "Running",
            StackState::Starting => "Starting",
            StackState::Available => "Available",
            StackState::Downloading => "Downloading",
            StackState::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus the configured frontend path of one stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDetails {
    pub state: StackState,
    pub path: String,
}

impl StackDetails {
    pub fn new(state: StackState) -> Self {
        Self {
            state,
            path: "/".to_string(),
        }
    }
}

/// Contract between the orchestrator and the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start the stack's composition. Idempotent at the runtime level.
    async fn deploy_stack(&self, name: &str) -> Result<(), StackError>;

    /// Tear the stack's composition down.
    async fn stop_stack(&self, name: &str) -> Result<(), StackError>;

    /// Every stack the runtime currently knows about, with health already
    /// folded in: entries are `Uninitialized`, `Starting` or `Available`.
    async fn running_state(&self) -> Result<HashMap<String, StackDetails>, StackError>;
}

/// Real adapter driving `docker compose`
pub struct ComposeRuntime {
    stacks_dir: PathBuf,
}

impl ComposeRuntime {
    pub fn new(stacks_dir: impl Into<PathBuf>) -> Self {
        Self {
            stacks_dir: stacks_dir.into(),
        }
    }

    fn compose_file(&self, name: &str) -> PathBuf {
        self.stacks_dir.join(name).join("docker-compose.yml")
    }

    /// Resolve a `Running` project to `Starting` or `Available` by reading
    /// per-container health markers from `docker compose ps`. Best effort:
    /// any failure to obtain or read the output is logged and treated as
    /// "not yet healthy", never as a hard error for that stack.
    async fn health_state_of(&self, name: &str) -> StackState {
        let compose_file = self.compose_file(name);
        let output = Command::new("docker")
            .args(["compose", "-f"])
            .arg(&compose_file)
            .arg("ps")
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(
                    stack = name,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "Health probe command failed"
                );
                return StackState::Starting;
            }
            Err(e) => {
                warn!(stack = name, error = %e, "Could not run health probe");
                return StackState::Starting;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if all_containers_healthy(&stdout) {
            StackState::Available
        } else {
            StackState::Starting
        }
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn deploy_stack(&self, name: &str) -> Result<(), StackError> {
        let compose_file = self.compose_file(name);
        if !compose_file.exists() {
            error!(stack = name, "Could not find stack definition");
            return Err(StackError::not_found(name));
        }

        // Dedicated per-stack network, create-if-absent. Not atomic, only
        // idempotent in effect; a lost race with a concurrent create is fine.
        let network_cmd = format!(
            "docker network ls | grep -q {name}-net || docker network create {name}-net"
        );
        let _ = Command::new("/bin/sh")
            .args(["-c", &network_cmd])
            .status()
            .await;

        let output = Command::new("docker")
            .args(["compose", "-f"])
            .arg(&compose_file)
            .args(["-p", name, "up", "-d"])
            .output()
            .await
            .map_err(|e| {
                error!(stack = name, error = %e, "Could not invoke compose CLI");
                StackError::RuntimeFailure("failed stack deployment".to_string())
            })?;

        if !output.status.success() {
            warn!(
                stack = name,
                status = %output.status,
                output = %String::from_utf8_lossy(&output.stderr),
                "Failed to deploy stack"
            );
            return Err(StackError::RuntimeFailure(
                "failed stack deployment".to_string(),
            ));
        }

        debug!(stack = name, "Deployed stack");
        Ok(())
    }

    async fn stop_stack(&self, name: &str) -> Result<(), StackError> {
        let compose_file = self.compose_file(name);
        let output = Command::new("docker")
            .args(["compose", "-p", name, "-f"])
            .arg(&compose_file)
            .arg("down")
            .output()
            .await
            .map_err(|e| {
                error!(stack = name, error = %e, "Could not invoke compose CLI");
                StackError::RuntimeFailure("stack stopping error".to_string())
            })?;

        if !output.status.success() {
            error!(
                stack = name,
                status = %output.status,
                output = %String::from_utf8_lossy(&output.stderr),
                "Failed to stop stack"
            );
            return Err(StackError::RuntimeFailure(
                "stack stopping error".to_string(),
            ));
        }

        debug!(stack = name, "Stopped stack");
        Ok(())
    }

    async fn running_state(&self) -> Result<HashMap<String, StackDetails>, StackError> {
        let output = Command::new("docker")
            .args(["compose", "ls", "-a"])
            .output()
            .await
            .map_err(|e| {
                error!(error = %e, "Could not invoke compose CLI");
                StackError::RuntimeFailure("failed to list compose projects".to_string())
            })?;

        if !output.status.success() {
            error!(
                status = %output.status,
                output = %String::from_utf8_lossy(&output.stderr),
                "Listing compose projects failed"
            );
            return Err(StackError::RuntimeFailure(
                "failed to list compose projects".to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut infos = parse_compose_ls(&stdout);

        // Resolve the intermediate Running state through the health probe.
        for (name, details) in infos.iter_mut() {
            if details.state == StackState::Running {
                details.state = self.health_state_of(name).await;
            }
        }

        Ok(infos)
    }
}

/// Parse `docker compose ls -a` output into raw per-project states.
///
/// The reserved control-plane project is filtered here already so no
/// caller ever observes it.
fn parse_compose_ls(output: &str) -> HashMap<String, StackDetails> {
    let mut infos = HashMap::new();
    for line in output.lines() {
        if line.starts_with("NAME") || line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(status)) = (fields.next(), fields.next()) else {
            trace!(line, "Skipping unparseable compose ls line");
            continue;
        };
        if name == RESERVED_STACK {
            continue;
        }
        let state = if status.contains("running") {
            StackState::Running
        } else {
            StackState::Uninitialized
        };
        infos.insert(name.to_string(), StackDetails::new(state));
    }
    infos
}

/// A project is healthy when no container line carries a pending or failed
/// health marker. Containers without health checks never produce a marker
/// and therefore count as healthy.
fn all_containers_healthy(ps_output: &str) -> bool {
    !ps_output
        .lines()
        .skip(1)
        .any(|line| line.contains("(health: starting)") || line.contains("(unhealthy)"))
}

/// Fixture stack that stays `Starting` for one observation interval
pub const SLOW_STARTING_STACK: &str = "nginx-slow-start";
/// Fixture stack whose image download spans one polling interval
pub const SLOW_DOWNLOADING_STACK: &str = "nginx-downloading";
/// Fixture name the mock rejects as unknown
pub const MISSING_STACK: &str = "not-existing-stack";

struct MockRuntimeInner {
    stack_states: HashMap<String, StackState>,
    has_waited_to_pass_download_state: bool,
}

/// In-memory runtime simulation.
///
/// Deploy and stop mutate the map synchronously. The slow fixtures deploy
/// into `Starting` and flip to `Available` after being observed once via
/// [`ContainerRuntime::running_state`], modeling one health-check interval;
/// everything else deploys straight to `Available`.
pub struct MockRuntime {
    inner: Mutex<MockRuntimeInner>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockRuntimeInner {
                stack_states: HashMap::new(),
                has_waited_to_pass_download_state: false,
            }),
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn deploy_stack(&self, name: &str) -> Result<(), StackError> {
        if name == MISSING_STACK {
            error!(stack = name, "Could not find stack definition");
            return Err(StackError::not_found(name));
        }

        let state = if name == SLOW_STARTING_STACK || name == SLOW_DOWNLOADING_STACK {
            StackState::Starting
        } else {
            StackState::Available
        };
        self.inner.lock().stack_states.insert(name.to_string(), state);
        debug!(stack = name, %state, "Mock pretends to have deployed stack");
        Ok(())
    }

    async fn stop_stack(&self, name: &str) -> Result<(), StackError> {
        let mut inner = self.inner.lock();
        match inner.stack_states.get_mut(name) {
            Some(state) => {
                *state = StackState::Uninitialized;
                debug!(stack = name, "Mock pretends to have stopped stack");
                Ok(())
            }
            None => Err(StackError::RuntimeFailure(format!(
                "stack {name} is not managed by the mock runtime"
            ))),
        }
    }

    async fn running_state(&self) -> Result<HashMap<String, StackDetails>, StackError> {
        let mut inner = self.inner.lock();
        trace!("Mock returns state info of virtually managed stacks");

        let snapshot = inner
            .stack_states
            .iter()
            .map(|(name, state)| (name.clone(), StackDetails::new(*state)))
            .collect();

        // Advance one simulated health-check interval after the snapshot,
        // so the caller observes each intermediate state exactly once.
        let names: Vec<String> = inner.stack_states.keys().cloned().collect();
        for name in names {
            if name == SLOW_STARTING_STACK {
                if inner.stack_states[&name] == StackState::Starting {
                    inner.stack_states.insert(name, StackState::Available);
                }
            } else if name == SLOW_DOWNLOADING_STACK {
                if !inner.has_waited_to_pass_download_state {
                    inner.has_waited_to_pass_download_state = true;
                } else if inner.stack_states[&name] == StackState::Starting {
                    inner.stack_states.insert(name, StackState::Available);
                }
            }
        }

        Ok(snapshot)
    }
}
