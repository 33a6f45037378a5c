use crate::{AuthError, Identity};

/// Capability required for an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Anyone, signed in or not
    Public,
    /// Any signed-in caller
    Authenticated,
    /// The user who created the record, or an admin. Records without a
    /// recorded creator are admin-only.
    CreatorOrAdmin { creator: Option<String> },
    /// Only the review's author
    ReviewerOnly { reviewer: String },
}

impl Policy {
    pub fn check(&self, caller: Option<&Identity>) -> Result<(), AuthError> {
        let caller = match (self, caller) {
            (Self::Public, _) => return Ok(()),
            (_, None) => return Err(AuthError::AuthenticationRequired),
            (_, Some(caller)) => caller,
        };

        match self {
            Self::Public | Self::Authenticated => Ok(()),
            Self::CreatorOrAdmin { creator } => {
                if caller.is_admin() || creator.as_deref() == Some(caller.user_id.as_str()) {
                    Ok(())
                } else {
                    Err(AuthError::Unauthorized(
                        "only the creator or an admin may change this movie".to_string(),
                    ))
                }
            }
            Self::ReviewerOnly { reviewer } => {
                if *reviewer == caller.user_id {
                    Ok(())
                } else {
                    Err(AuthError::Unauthorized(
                        "only the reviewer may change this review".to_string(),
                    ))
                }
            }
        }
    }
}
