use crate::runtime::RESERVED_STACK;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Global configuration for the proxy and control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Stack management configuration
    #[serde(default)]
    pub stacks: StacksConfig,

    /// Session/auth configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Root domain; apps are served at `<stack>.<root_domain>`
    #[serde(default = "default_root_domain")]
    pub root_domain: String,

    /// Exact hostnames served by the control plane instead of being proxied.
    /// When empty, `<reserved>.<root_domain>` and `<root_domain>:<port>`
    /// are derived so both production and local setups work out of the box.
    #[serde(default)]
    pub control_hosts: Vec<String>,
}

impl ServerConfig {
    /// The hostnames that select the control-plane branch of the proxy
    pub fn control_hosts(&self) -> Vec<String> {
        if !self.control_hosts.is_empty() {
            return self.control_hosts.clone();
        }
        vec![
            format!("{}.{}", RESERVED_STACK, self.root_domain),
            format!("{}:{}", self.root_domain, self.port),
        ]
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            root_domain: default_root_domain(),
            control_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StacksConfig {
    /// Directory holding one definition subdirectory per stack
    #[serde(default = "default_stacks_dir")]
    pub dir: PathBuf,

    /// Use the in-memory runtime and download simulations instead of the
    /// compose CLI (test profile). Selected once at startup.
    #[serde(default)]
    pub use_mocks: bool,

    /// Expose POST /api/stacks/wipe-data (non-production setups only)
    #[serde(default)]
    pub enable_wipe_endpoint: bool,
}

impl Default for StacksConfig {
    fn default() -> Self {
        Self {
            dir: default_stacks_dir(),
            use_mocks: false,
            enable_wipe_endpoint: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Name of the session cookie
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Username accepted by the in-memory auth provider
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Password accepted by the in-memory auth provider.
    /// An empty password disables login entirely.
    #[serde(default)]
    pub admin_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            admin_user: default_admin_user(),
            admin_password: String::new(),
        }
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_root_domain() -> String {
    "localhost".to_string()
}

fn default_stacks_dir() -> PathBuf {
    PathBuf::from("stacks")
}

fn default_cookie_name() -> String {
    "stackgate-auth".to_string()
}

fn default_admin_user() -> String {
    "admin".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must not be 0");
        }
        if self.server.root_domain.is_empty() {
            anyhow::bail!("server.root_domain must not be empty");
        }
        if self
            .server
            .root_domain
            .contains(|c: char| c == ':' || c == '/' || c.is_whitespace())
        {
            anyhow::bail!(
                "server.root_domain must be a bare domain, got '{}'",
                self.server.root_domain
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 80
bind = "127.0.0.1"
root_domain = "example.com"

[stacks]
dir = "/var/lib/stackgate/stacks"
use_mocks = false
enable_wipe_endpoint = false

[auth]
cookie_name = "session"
admin_user = "operator"
admin_password = "hunter2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.root_domain, "example.com");
        assert_eq!(config.stacks.dir, PathBuf::from("/var/lib/stackgate/stacks"));
        assert!(!config.stacks.use_mocks);
        assert_eq!(config.auth.cookie_name, "session");
        assert_eq!(config.auth.admin_password, "hunter2");
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.root_domain, "localhost");
        assert_eq!(config.stacks.dir, PathBuf::from("stacks"));
        assert!(!config.stacks.use_mocks);
        assert!(!config.stacks.enable_wipe_endpoint);
        assert_eq!(config.auth.cookie_name, "stackgate-auth");
        assert!(config.auth.admin_password.is_empty());
    }

    #[test]
    fn test_derived_control_hosts() {
        let config: Config = toml::from_str("[server]\nroot_domain = \"example.com\"\n").unwrap();
        let hosts = config.server.control_hosts();
        assert!(hosts.contains(&"stackgate.example.com".to_string()));
        assert!(hosts.contains(&"example.com:8080".to_string()));
    }

    #[test]
    fn test_explicit_control_hosts_win() {
        let toml = r#"
[server]
root_domain = "example.com"
control_hosts = ["admin.example.com"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.control_hosts(), vec!["admin.example.com"]);
    }

    #[test]
    fn test_validate_rejects_bad_domain() {
        let config: Config = toml::from_str("[server]\nroot_domain = \"example.com:80\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
