//! Cinedex Auth
//!
//! Who is calling, and may they do this?
//!
//! - [`Identity`] is what a bearer token resolves to.
//! - [`Policy`] is checked by the API layer *before* a store mutation runs;
//!   the store itself knows nothing about callers.
//! - [`UserDirectory`] registers users, checks passwords and hands out opaque
//!   session tokens.

mod directory;
mod policy;


pub use directory::{Session, User, UserDirectory, DEFAULT_SESSION_TTL};
pub use policy::Policy;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

/// The caller behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("user already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid input: {0}")]
    Validation(String),
}
