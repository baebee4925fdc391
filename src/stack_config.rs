//! Per-stack static configuration (`app.yml`)

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Static routing configuration of a single stack.
///
/// Lives in an optional `app.yml` inside the stack's definition directory.
/// Both fields fall back to documented defaults; a stack is never broken by
/// a missing or malformed config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StackConfig {
    /// URL path the frontend should link to for this stack
    #[serde(default = "default_url_path", rename = "urlPath")]
    pub url_path: String,

    /// Container port the proxy forwards to, kept as a string as it only
    /// ever ends up interpolated into an authority
    #[serde(default = "default_port")]
    pub port: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            url_path: default_url_path(),
            port: default_port(),
        }
    }
}

fn default_url_path() -> String {
    "/".to_string()
}

fn default_port() -> String {
    "80".to_string()
}

/// Loads and serves the `app.yml` of every stack definition directory.
///
/// All files are read once at construction; lookups afterwards are pure map
/// access and can never fail - unknown stacks get [`StackConfig::default`].
pub struct StackConfigProvider {
    configs: HashMap<String, StackConfig>,
}

impl StackConfigProvider {
    /// Scan `stacks_dir` and load one config per subdirectory.
    ///
    /// Only an unreadable stacks root is an error; per-stack problems are
    /// logged and replaced by defaults.
    pub fn load(stacks_dir: &Path) -> anyhow::Result<Self> {
        let mut configs = HashMap::new();

        let entries = std::fs::read_dir(stacks_dir).map_err(|e| {
            anyhow::anyhow!(
                "failed to read stack definitions directory '{}': {}",
                stacks_dir.display(),
                e
            )
        })?;

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let config = load_stack_config(&entry.path().join("app.yml"));
            configs.insert(name, config);
        }

        debug!(stacks = configs.len(), dir = %stacks_dir.display(), "Loaded stack configs");
        Ok(Self { configs })
    }

    /// Configuration for `name`, defaulting for unknown stacks
    pub fn get(&self, name: &str) -> StackConfig {
        match self.configs.get(name) {
            Some(config) => config.clone(),
            None => {
                debug!(stack = name, "No stack config loaded, using defaults");
                StackConfig::default()
            }
        }
    }
}

fn load_stack_config(path: &Path) -> StackConfig {
    if !path.exists() {
        debug!(path = %path.display(), "No app.yml, using default stack config");
        return StackConfig::default();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read app.yml, using defaults");
            return StackConfig::default();
        }
    };

    match serde_yaml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse app.yml, using defaults");
            StackConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with(stacks: &[(&str, Option<&str>)]) -> StackConfigProvider {
        let dir = tempfile::tempdir().unwrap();
        for (name, yaml) in stacks {
            let stack_dir = dir.path().join(name);
            std::fs::create_dir(&stack_dir).unwrap();
            if let Some(yaml) = yaml {
                std::fs::write(stack_dir.join("app.yml"), yaml).unwrap();
            }
        }
        StackConfigProvider::load(dir.path()).unwrap()
    }

    #[test]
    fn test_custom_config_is_loaded() {
        let provider = provider_with(&[("gitea", Some("urlPath: /custom-path\nport: \"3000\"\n"))]);
        let config = provider.get("gitea");
        assert_eq!(config.url_path, "/custom-path");
        assert_eq!(config.port, "3000");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let provider = provider_with(&[("gitea", Some("urlPath: /custom-path\n"))]);
        let config = provider.get("gitea");
        assert_eq!(config.url_path, "/custom-path");
        assert_eq!(config.port, "80");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let provider = provider_with(&[("plain", None)]);
        assert_eq!(provider.get("plain"), StackConfig::default());
    }

    #[test]
    fn test_unknown_stack_yields_defaults() {
        let provider = provider_with(&[]);
        let config = provider.get("never-heard-of-it");
        assert_eq!(config.url_path, "/");
        assert_eq!(config.port, "80");
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let provider = provider_with(&[("broken", Some(":: not yaml ::\n\t"))]);
        assert_eq!(provider.get("broken"), StackConfig::default());
    }

    #[test]
    fn test_unreadable_root_is_an_error() {
        assert!(StackConfigProvider::load(Path::new("/does/not/exist")).is_err());
    }
}
