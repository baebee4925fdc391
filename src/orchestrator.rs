//! Stack lifecycle orchestration
//!
//! [`StackOrchestrator`] reconciles three independent, racy signals into one
//! coherent state per stack: what the container runtime reports, how far the
//! asynchronous image download has progressed, and the last action a user
//! requested. All derived state is recomputed on every query; only the
//! download records and the intent map live in process memory, and both are
//! intentionally lost on restart.

use crate::download::{DownloadState, DownloadTracker, ImageDownloader, MockDownloader};
use crate::error::StackError;
use crate::runtime::{
    ComposeRuntime, ContainerRuntime, MockRuntime, StackDetails, StackState, RESERVED_STACK,
};
use crate::stack_config::StackConfigProvider;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// The most recent user-requested transition for a stack. Used purely to
/// disambiguate transient runtime states while a deploy or stop settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackAction {
    Deploy,
    Stop,
}

/// Composes the runtime adapter, config provider and download tracker into
/// one authoritative view of every stack's state.
pub struct StackOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    downloads: Arc<dyn DownloadTracker>,
    configs: Arc<StackConfigProvider>,
    last_action_on_stack: Mutex<HashMap<String, StackAction>>,
    stacks_dir: PathBuf,
}

impl StackOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        downloads: Arc<dyn DownloadTracker>,
        configs: Arc<StackConfigProvider>,
        stacks_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            downloads,
            configs,
            last_action_on_stack: Mutex::new(HashMap::new()),
            stacks_dir: stacks_dir.into(),
        }
    }

    /// Orchestrator backed by the compose CLI
    pub fn real(configs: Arc<StackConfigProvider>, stacks_dir: impl Into<PathBuf>) -> Self {
        let stacks_dir = stacks_dir.into();
        Self::new(
            Arc::new(ComposeRuntime::new(stacks_dir.clone())),
            Arc::new(ImageDownloader::new(stacks_dir.clone())),
            configs,
            stacks_dir,
        )
    }

    /// Orchestrator backed by the in-memory simulations (test profile)
    pub fn simulated(configs: Arc<StackConfigProvider>, stacks_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(MockRuntime::new()),
            Arc::new(MockDownloader::new()),
            configs,
            stacks_dir,
        )
    }

    /// Deploy a stack: record the intent, kick off the image download and
    /// ask the runtime to bring the composition up.
    ///
    /// An unknown name fails before anything is recorded, so neither the
    /// intent map nor the download tracker pick up residue for it.
    pub async fn deploy(&self, name: &str) -> Result<(), StackError> {
        if !self.has_definition(name) {
            warn!(stack = name, "Deploy requested for unknown stack");
            return Err(StackError::not_found(name));
        }

        self.last_action_on_stack
            .lock()
            .insert(name.to_string(), StackAction::Deploy);
        self.downloads.download(name);
        self.runtime.deploy_stack(name).await
    }

    /// Stop a stack, provided its current composite state allows it
    pub async fn stop(&self, name: &str) -> Result<(), StackError> {
        info!(stack = name, "Stopping stack");
        let state_info = self.list_state().await;

        let details = state_info.get(name).ok_or_else(|| {
            warn!(stack = name, "Stop requested for unknown stack");
            StackError::not_found(name)
        })?;

        match details.state {
            StackState::Starting | StackState::Available | StackState::Stopping => {}
            state => {
                warn!(
                    stack = name,
                    %state,
                    "Only starting or available stacks can be stopped"
                );
                return Err(StackError::InvalidTransition {
                    name: name.to_string(),
                    state,
                });
            }
        }

        self.last_action_on_stack
            .lock()
            .insert(name.to_string(), StackAction::Stop);
        debug!(stack = name, "Stack exists and is now stopped");
        self.runtime.stop_stack(name).await
    }

    /// Stop every stack currently starting or available, aborting on the
    /// first failure.
    pub async fn stop_all(&self) -> Result<(), StackError> {
        let state_info = self.list_state().await;

        for (name, details) in state_info {
            if matches!(details.state, StackState::Starting | StackState::Available) {
                self.stop(&name).await?;
            }
        }
        Ok(())
    }

    /// Reconcile runtime status, definition directories, download progress
    /// and recorded intents into the authoritative per-stack state map.
    ///
    /// Recomputed from scratch on every call; nothing is cached across
    /// queries. Download-derived overrides always win over runtime-derived
    /// state; intent-derived overrides only apply while the runtime state is
    /// still ambiguous for that intent.
    pub async fn list_state(&self) -> HashMap<String, StackDetails> {
        trace!("Stack state info was requested");

        let mut infos = match self.runtime.running_state().await {
            Ok(infos) => infos,
            Err(e) => {
                error!(error = %e, "Container runtime listing failed, assuming nothing runs");
                HashMap::new()
            }
        };

        // Every definition directory is a stack, deployed or not.
        match stack_names_in_dir(&self.stacks_dir) {
            Ok(names) => {
                for name in names {
                    infos
                        .entry(name)
                        .or_insert_with(|| StackDetails::new(StackState::Uninitialized));
                }
            }
            Err(e) => {
                error!(
                    dir = %self.stacks_dir.display(),
                    error = %e,
                    "Could not read stack definitions directory"
                );
            }
        }

        infos.remove(RESERVED_STACK);

        for (name, details) in infos.iter_mut() {
            details.path = self.configs.get(name).url_path;
        }

        let download_states = self.downloads.states();
        let last_actions = self.last_action_on_stack.lock().clone();
        for (name, details) in infos.iter_mut() {
            let Some(download) = download_states.get(name) else {
                continue;
            };
            if *download == DownloadState::Ongoing {
                details.state = StackState::Downloading;
            } else if details.state == StackState::Uninitialized
                && last_actions.get(name) == Some(&StackAction::Deploy)
            {
                // Deploy was triggered but the runtime does not see the
                // containers yet.
                details.state = StackState::Starting;
            } else if details.state != StackState::Uninitialized
                && last_actions.get(name) == Some(&StackAction::Stop)
            {
                // Teardown was triggered but the runtime still reports the
                // containers.
                details.state = StackState::Stopping;
            }
        }

        trace!(states = ?infos, "Stack state info is returned");
        infos
    }

    fn has_definition(&self, name: &str) -> bool {
        self.stacks_dir.join(name).is_dir()
    }
}

fn stack_names_in_dir(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MISSING_STACK, SLOW_DOWNLOADING_STACK, SLOW_STARTING_STACK};
    use tempfile::TempDir;

    const STACK: &str = "nginx-default";
    const OTHER_STACK: &str = "nginx-default-2";
    const CUSTOM_PATH_STACK: &str = "nginx-custom-path";

    /// Definition directories for every fixture stack, including one for
    /// the reserved control-plane name so its exclusion can be exercised.
    fn fixture_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            STACK,
            OTHER_STACK,
            SLOW_STARTING_STACK,
            SLOW_DOWNLOADING_STACK,
            RESERVED_STACK,
        ] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let custom = dir.path().join(CUSTOM_PATH_STACK);
        std::fs::create_dir(&custom).unwrap();
        std::fs::write(custom.join("app.yml"), "urlPath: /custom-path\n").unwrap();
        dir
    }

    fn orchestrator(dir: &TempDir) -> StackOrchestrator {
        let configs = Arc::new(StackConfigProvider::load(dir.path()).unwrap());
        StackOrchestrator::simulated(configs, dir.path())
    }

    async fn assert_state(orchestrator: &StackOrchestrator, name: &str, expected: StackState) {
        let infos = orchestrator.list_state().await;
        match infos.get(name) {
            Some(details) => assert_eq!(
                details.state, expected,
                "stack '{name}' was present but had wrong state"
            ),
            None => panic!("stack '{name}' was not present at all"),
        }
    }

    #[tokio::test]
    async fn test_happy_path_deploy_and_stop() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(STACK).await.unwrap();
        assert_state(&orchestrator, STACK, StackState::Available).await;
        assert_state(&orchestrator, OTHER_STACK, StackState::Uninitialized).await;

        orchestrator.stop(STACK).await.unwrap();
        assert_state(&orchestrator, STACK, StackState::Uninitialized).await;
        assert_state(&orchestrator, OTHER_STACK, StackState::Uninitialized).await;
    }

    #[tokio::test]
    async fn test_stop_all() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(STACK).await.unwrap();
        orchestrator.deploy(OTHER_STACK).await.unwrap();
        assert_state(&orchestrator, STACK, StackState::Available).await;
        assert_state(&orchestrator, OTHER_STACK, StackState::Available).await;

        orchestrator.stop_all().await.unwrap();
        assert_state(&orchestrator, STACK, StackState::Uninitialized).await;
        assert_state(&orchestrator, OTHER_STACK, StackState::Uninitialized).await;
    }

    #[tokio::test]
    async fn test_deploying_twice_is_idempotent() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(STACK).await.unwrap();
        orchestrator.deploy(STACK).await.unwrap();
        assert_state(&orchestrator, STACK, StackState::Available).await;
    }

    #[tokio::test]
    async fn test_stopping_a_never_deployed_stack_fails() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        let err = orchestrator.stop(STACK).await.unwrap_err();
        assert!(matches!(err, StackError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_stack_symmetry() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        let deploy_err = orchestrator.deploy(MISSING_STACK).await.unwrap_err();
        assert!(matches!(deploy_err, StackError::StackNotFound(_)));

        let stop_err = orchestrator.stop(MISSING_STACK).await.unwrap_err();
        assert!(matches!(stop_err, StackError::StackNotFound(_)));

        // Neither attempt may leave residue behind for the unknown name.
        assert!(!orchestrator.downloads.states().contains_key(MISSING_STACK));
        assert!(!orchestrator
            .last_action_on_stack
            .lock()
            .contains_key(MISSING_STACK));
    }

    #[tokio::test]
    async fn test_reserved_stack_is_excluded() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(RESERVED_STACK).await.unwrap();
        let infos = orchestrator.list_state().await;
        assert!(
            !infos.contains_key(RESERVED_STACK),
            "the control plane's own stack must never be listed"
        );
    }

    #[tokio::test]
    async fn test_custom_url_path() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(CUSTOM_PATH_STACK).await.unwrap();
        let infos = orchestrator.list_state().await;
        assert_eq!(infos[CUSTOM_PATH_STACK].path, "/custom-path");
    }

    #[tokio::test]
    async fn test_default_url_path() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(STACK).await.unwrap();
        let infos = orchestrator.list_state().await;
        assert_eq!(infos[STACK].path, "/");
    }

    #[tokio::test]
    async fn test_health_state_handling() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(SLOW_STARTING_STACK).await.unwrap();
        assert_state(&orchestrator, SLOW_STARTING_STACK, StackState::Starting).await;
        assert_state(&orchestrator, SLOW_STARTING_STACK, StackState::Available).await;

        orchestrator.stop(SLOW_STARTING_STACK).await.unwrap();
        assert_state(&orchestrator, SLOW_STARTING_STACK, StackState::Uninitialized).await;

        orchestrator.deploy(SLOW_STARTING_STACK).await.unwrap();
        assert_state(&orchestrator, SLOW_STARTING_STACK, StackState::Starting).await;
        orchestrator.stop(SLOW_STARTING_STACK).await.unwrap();
        assert_state(&orchestrator, SLOW_STARTING_STACK, StackState::Uninitialized).await;
    }

    #[tokio::test]
    async fn test_download_state_handling() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(SLOW_DOWNLOADING_STACK).await.unwrap();
        assert_state(&orchestrator, SLOW_DOWNLOADING_STACK, StackState::Downloading).await;
        assert_state(&orchestrator, SLOW_DOWNLOADING_STACK, StackState::Starting).await;
        assert_state(&orchestrator, SLOW_DOWNLOADING_STACK, StackState::Available).await;

        orchestrator.stop(SLOW_DOWNLOADING_STACK).await.unwrap();
        assert_state(&orchestrator, SLOW_DOWNLOADING_STACK, StackState::Uninitialized).await;
    }

    #[tokio::test]
    async fn test_ongoing_download_wins_over_runtime_state() {
        let dir = fixture_dir();
        let configs = Arc::new(StackConfigProvider::load(dir.path()).unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let downloads = Arc::new(MockDownloader::new());
        let orchestrator = StackOrchestrator::new(
            runtime.clone(),
            downloads.clone(),
            configs,
            dir.path(),
        );

        // The runtime already reports the stack, yet the tracked download
        // must dominate the reported state.
        runtime.deploy_stack(SLOW_DOWNLOADING_STACK).await.unwrap();
        downloads.download(SLOW_DOWNLOADING_STACK);
        assert_state(&orchestrator, SLOW_DOWNLOADING_STACK, StackState::Downloading).await;
    }

    #[tokio::test]
    async fn test_deploy_intent_bridges_runtime_blind_spot() {
        let dir = fixture_dir();
        let configs = Arc::new(StackConfigProvider::load(dir.path()).unwrap());
        // Runtime that never saw the deploy (models the window before the
        // containers become visible).
        let orchestrator = StackOrchestrator::new(
            Arc::new(MockRuntime::new()),
            Arc::new(MockDownloader::new()),
            configs,
            dir.path(),
        );

        orchestrator
            .last_action_on_stack
            .lock()
            .insert(STACK.to_string(), StackAction::Deploy);
        orchestrator.downloads.download(STACK);

        assert_state(&orchestrator, STACK, StackState::Starting).await;
    }

    #[tokio::test]
    async fn test_deploy_does_not_disturb_other_stacks() {
        let dir = fixture_dir();
        let orchestrator = orchestrator(&dir);

        orchestrator.deploy(STACK).await.unwrap();
        let infos = orchestrator.list_state().await;
        assert_eq!(infos[OTHER_STACK].state, StackState::Uninitialized);
        assert_eq!(infos[SLOW_STARTING_STACK].state, StackState::Uninitialized);
        assert_eq!(infos[CUSTOM_PATH_STACK].state, StackState::Uninitialized);
    }
}
