//! In-memory user registry and session tokens.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{AuthError, Identity, Role};

/// Public view of a registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
}

impl User {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.id.clone(),
            role: self.role,
        }
    }
}

/// What register/login hand back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: User,
}

struct Account {
    user: User,
    salt: String,
    digest: String,
}

struct SessionEntry {
    identity: Identity,
    opened: Instant,
}

/// How long a session token stays valid by default.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct UserDirectory {
    /// keyed by lower-cased email
    accounts: RwLock<HashMap<String, Account>>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    session_ttl: Duration,
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::with_session_ttl(DEFAULT_SESSION_TTL)
    }
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens older than `ttl` stop resolving and are dropped on the next
    /// login.
    pub fn with_session_ttl(ttl: Duration) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            session_ttl: ttl,
        }
    }

    /// Register a regular user and sign them in.
    pub fn register(&self, email: &str, password: &str, name: &str) -> Result<Session, AuthError> {
        self.register_with_role(email, password, name, Role::User)
    }

    pub fn register_with_role(
        &self,
        email: &str,
        password: &str,
        name: &str,
        role: Role,
    ) -> Result<Session, AuthError> {
        let key = normalize_email(email)?;
        if password.is_empty() {
            return Err(AuthError::Validation("password must not be empty".to_string()));
        }

        let user = {
            let mut accounts = self.accounts.write();
            if accounts.contains_key(&key) {
                return Err(AuthError::AlreadyExists(key));
            }
            let salt = Uuid::new_v4().simple().to_string();
            let user = User {
                id: Uuid::new_v4().to_string(),
                email: key.clone(),
                name: name.trim().to_string(),
                role,
            };
            accounts.insert(
                key,
                Account {
                    user: user.clone(),
                    digest: digest(&salt, password),
                    salt,
                },
            );
            user
        };

        tracing::info!(user_id = %user.id, role = user.role.as_str(), "user registered");
        Ok(self.open_session(user))
    }

    pub fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let key = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;
        let user = {
            let accounts = self.accounts.read();
            let account = accounts.get(&key).ok_or(AuthError::InvalidCredentials)?;
            if digest(&account.salt, password) != account.digest {
                return Err(AuthError::InvalidCredentials);
            }
            account.user.clone()
        };

        tracing::debug!(user_id = %user.id, "user logged in");
        Ok(self.open_session(user))
    }

    /// Resolve a bearer token. Unknown tokens are anonymous, not an error.
    pub fn identify(&self, token: &str) -> Option<Identity> {
        self.sessions
            .read()
            .get(token)
            .filter(|entry| !self.expired(entry))
            .map(|entry| entry.identity.clone())
    }

    /// Live sessions, expired ones excluded.
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|entry| !self.expired(entry))
            .count()
    }

    pub fn user(&self, user_id: &str) -> Option<User> {
        self.accounts
            .read()
            .values()
            .find(|a| a.user.id == user_id)
            .map(|a| a.user.clone())
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions
            .write()
            .remove(token)
            .is_some_and(|entry| !self.expired(&entry))
    }

    fn open_session(&self, user: User) -> Session {
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| !self.expired(entry));
        if sessions.len() < before {
            tracing::debug!(pruned = before - sessions.len(), "expired sessions dropped");
        }
        sessions.insert(
            token.clone(),
            SessionEntry {
                identity: user.identity(),
                opened: Instant::now(),
            },
        );
        Session { token, user }
    }

    fn expired(&self, entry: &SessionEntry) -> bool {
        entry.opened.elapsed() >= self.session_ttl
    }
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::Validation(format!("invalid email `{email}`")));
    }
    Ok(email)
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}
