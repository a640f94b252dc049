//! Credential checks for the login and registration forms.

mod pool;

pub use pool::{ConnPool, PooledConn};

use crate::error::{ServerError, ServerResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(1);

/// Decides whether a login or registration form succeeds.
pub trait CredentialValidator: Send + Sync {
    /// For a login, true iff the stored record matches. For a registration,
    /// true iff the name was unused and has now been recorded.
    fn verify(&self, user: &str, password: &str, is_login: bool) -> bool;
}

impl<F> CredentialValidator for F
where
    F: Fn(&str, &str, bool) -> bool + Send + Sync,
{
    fn verify(&self, user: &str, password: &str, is_login: bool) -> bool {
        self(user, password, is_login)
    }
}

type UserTable = Arc<RwLock<HashMap<String, String>>>;

/// One pooled handle onto the shared user table.
pub struct UserHandle {
    table: UserTable,
}

impl UserHandle {
    pub fn password_of(&self, user: &str) -> Option<String> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user)
            .cloned()
    }

    /// Insert-if-absent under one write lock.
    pub fn register(&self, user: &str, password: &str) -> bool {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if table.contains_key(user) {
            return false;
        }
        table.insert(user.to_string(), password.to_string());
        true
    }
}

/// In-memory user store reached through a bounded pool of handles.
pub struct UserStore {
    pool: ConnPool<UserHandle>,
    table: UserTable,
}

impl UserStore {
    pub fn new(pool_size: usize) -> Self {
        Self::with_users(pool_size, std::iter::empty::<(String, String)>())
    }

    pub fn with_users<I, K, V>(pool_size: usize, users: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let table: UserTable = Arc::new(RwLock::new(
            users.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ));
        let handles = (0..pool_size.max(1))
            .map(|_| UserHandle {
                table: table.clone(),
            })
            .collect();
        Self {
            pool: ConnPool::new(handles),
            table,
        }
    }

    /// Seed from a JSON object of `{"user": "password"}` pairs.
    pub fn from_json_file(pool_size: usize, path: &Path) -> ServerResult<Self> {
        let raw = std::fs::read(path)?;
        let users: HashMap<String, String> = serde_json::from_slice(&raw)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), users = users.len(), "user store seeded");
        Ok(Self::with_users(pool_size, users))
    }

    pub fn pool(&self) -> &ConnPool<UserHandle> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialValidator for UserStore {
    fn verify(&self, user: &str, password: &str, is_login: bool) -> bool {
        if user.is_empty() || password.is_empty() {
            return false;
        }
        let handle = match self.pool.get_timeout(CHECKOUT_TIMEOUT) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(user, error = %e, "credential check skipped");
                return false;
            }
        };

        let ok = if is_login {
            handle.password_of(user).is_some_and(|stored| stored == password)
        } else {
            handle.register(user, password)
        };
        tracing::debug!(user, is_login, ok, "credential check");
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_requires_exact_match() {
        let store = UserStore::with_users(2, [("alice", "secret")]);
        assert!(store.verify("alice", "secret", true));
        assert!(!store.verify("alice", "Secret", true));
        assert!(!store.verify("bob", "secret", true));
    }

    #[test]
    fn registration_is_insert_if_absent() {
        let store = UserStore::new(1);
        assert!(store.verify("carol", "pw", false));
        assert!(!store.verify("carol", "other", false));
        assert!(store.verify("carol", "pw", true));
        assert!(!store.verify("carol", "other", true));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_fields_never_pass() {
        let store = UserStore::with_users(1, [("", ""), ("dave", "")]);
        assert!(!store.verify("", "", true));
        assert!(!store.verify("dave", "", true));
        assert!(!store.verify("", "x", false));
    }

    #[test]
    fn exhausted_pool_fails_safely() {
        let store = UserStore::with_users(1, [("erin", "pw")]);
        let _held = store.pool().get().unwrap();
        assert!(!store.verify("erin", "pw", true));
        assert_eq!(store.pool().free_count(), 0);
    }

    #[test]
    fn seeds_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, br#"{"frank": "pw1", "grace": "pw2"}"#).unwrap();
        let store = UserStore::from_json_file(4, &path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.verify("grace", "pw2", true));

        std::fs::write(&path, b"[1, 2]").unwrap();
        assert!(matches!(
            UserStore::from_json_file(4, &path),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn closures_are_validators() {
        let v: Arc<dyn CredentialValidator> = Arc::new(|u: &str, p: &str, _login: bool| u == p);
        assert!(v.verify("x", "x", true));
        assert!(!v.verify("x", "y", false));
    }
}
