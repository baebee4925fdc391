//! Sessions and the one-time secret exchange
//!
//! The credential/user store proper is an external collaborator; this module
//! defines the contract the proxy and API consume, plus an in-memory
//! provider used by the test profile and local setups. Durable user storage
//! and password hashing are deliberately out of scope.

use dashmap::DashMap;
use uuid::Uuid;

/// Authenticated caller, as far as this subsystem cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
}

/// Session validation and secret-handoff contract
pub trait AuthProvider: Send + Sync {
    /// Exchange credentials for a new session cookie value
    fn login(&self, user: &str, password: &str) -> Option<String>;

    /// Resolve a session cookie value to the identity it belongs to
    fn validate_session(&self, cookie_value: &str) -> Option<Identity>;

    /// Mint a one-time secret bound to an existing session's cookie value.
    /// Returns `None` when the session is unknown.
    fn issue_secret(&self, cookie_value: &str) -> Option<String>;

    /// Atomically fetch the cookie value associated with a secret and
    /// invalidate the secret. Single use is guaranteed even under
    /// concurrent exchanges of the same secret.
    fn get_and_invalidate_secret(&self, secret: &str) -> Option<String>;
}

/// In-memory provider: sessions and secrets live in process memory only.
pub struct InMemoryAuthProvider {
    /// Dev/test credential; `None` disables login entirely
    credentials: Option<(String, String)>,
    /// session cookie value -> user
    sessions: DashMap<String, String>,
    /// one-time secret -> session cookie value
    secrets: DashMap<String, String>,
}

impl InMemoryAuthProvider {
    pub fn new(admin_user: &str, admin_password: &str) -> Self {
        let credentials = if admin_password.is_empty() {
            None
        } else {
            Some((admin_user.to_string(), admin_password.to_string()))
        };
        Self {
            credentials,
            sessions: DashMap::new(),
            secrets: DashMap::new(),
        }
    }
}

impl AuthProvider for InMemoryAuthProvider {
    fn login(&self, user: &str, password: &str) -> Option<String> {
        let (expected_user, expected_password) = self.credentials.as_ref()?;
        if user != expected_user || password != expected_password {
            return None;
        }
        let cookie_value = Uuid::new_v4().to_string();
        self.sessions.insert(cookie_value.clone(), user.to_string());
        Some(cookie_value)
    }

    fn validate_session(&self, cookie_value: &str) -> Option<Identity> {
        self.sessions.get(cookie_value).map(|entry| Identity {
            user: entry.value().clone(),
        })
    }

    fn issue_secret(&self, cookie_value: &str) -> Option<String> {
        if !self.sessions.contains_key(cookie_value) {
            return None;
        }
        let secret = Uuid::new_v4().to_string();
        self.secrets.insert(secret.clone(), cookie_value.to_string());
        Some(secret)
    }

    fn get_and_invalidate_secret(&self, secret: &str) -> Option<String> {
        // DashMap::remove is the atomic fetch-and-delete that makes the
        // secret single-use.
        self.secrets.remove(secret).map(|(_, cookie_value)| cookie_value)
    }
}

/// Serialize a session cookie for a Set-Cookie header. Host-only (no
/// Domain attribute), so the cookie stays scoped to the subdomain it was
/// issued on.
pub fn session_cookie(name: &str, value: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Strict", name, value)
}

/// Extract the value of the named cookie from a Cookie request header
pub fn cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    for cookie in cookie_header.split(';') {
        let cookie = cookie.trim();
        if let Some(value) = cookie.strip_prefix(&format!("{}=", name)) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> InMemoryAuthProvider {
        InMemoryAuthProvider::new("admin", "correct-password")
    }

    #[test]
    fn test_login_and_validate_session() {
        let auth = provider();
        let cookie_value = auth.login("admin", "correct-password").unwrap();

        let identity = auth.validate_session(&cookie_value).unwrap();
        assert_eq!(identity.user, "admin");
    }

    #[test]
    fn test_login_rejects_bad_credentials() {
        let auth = provider();
        assert!(auth.login("admin", "wrong").is_none());
        assert!(auth.login("intruder", "correct-password").is_none());
    }

    #[test]
    fn test_empty_password_disables_login() {
        let auth = InMemoryAuthProvider::new("admin", "");
        assert!(auth.login("admin", "").is_none());
    }

    #[test]
    fn test_unknown_session_is_invalid() {
        let auth = provider();
        assert!(auth.validate_session("made-up-value").is_none());
    }

    #[test]
    fn test_secret_is_single_use() {
        let auth = provider();
        let cookie_value = auth.login("admin", "correct-password").unwrap();
        let secret = auth.issue_secret(&cookie_value).unwrap();

        assert_eq!(
            auth.get_and_invalidate_secret(&secret).as_deref(),
            Some(cookie_value.as_str())
        );
        // The lookup deleted the secret; replaying the exchange fails.
        assert!(auth.get_and_invalidate_secret(&secret).is_none());
    }

    #[test]
    fn test_secret_requires_valid_session() {
        let auth = provider();
        assert!(auth.issue_secret("not-a-session").is_none());
    }

    #[test]
    fn test_session_cookie_format() {
        let cookie = session_cookie("stackgate-auth", "abc123");
        assert!(cookie.starts_with("stackgate-auth=abc123"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(!cookie.contains("Domain="));
    }

    #[test]
    fn test_cookie_value_extraction() {
        assert_eq!(
            cookie_value("stackgate-auth=abc123; other=x", "stackgate-auth"),
            Some("abc123".to_string())
        );
        assert_eq!(
            cookie_value("other=x; stackgate-auth=xyz", "stackgate-auth"),
            Some("xyz".to_string())
        );
        assert_eq!(cookie_value("other=x", "stackgate-auth"), None);
        assert_eq!(cookie_value("stackgate-auth=", "stackgate-auth"), None);
    }
}
