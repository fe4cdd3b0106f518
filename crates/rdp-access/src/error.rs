//! Crate-level error

use rdp_types::ErrorKind;

use crate::audit::AuditStoreError;
use crate::policy::{Denial, PolicyError};
use crate::session::SessionError;
use crate::sink::WriteError;
use crate::token::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Denied(#[from] Denial),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    AuditStore(#[from] AuditStoreError),
}

impl AccessError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Token(err) => err.kind(),
            Self::Denied(denial) => denial.kind(),
            Self::Session(_) | Self::Policy(_) | Self::Write(_) | Self::AuditStore(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Result alias for access operations
pub type AccessResult<T> = Result<T, AccessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(AccessError::from(TokenError::Expired).kind(), ErrorKind::Unauthenticated);
        assert_eq!(AccessError::from(Denial::NoRole).kind(), ErrorKind::Forbidden);
        assert_eq!(
            AccessError::from(SessionError::Unavailable("down".into())).kind(),
            ErrorKind::Internal
        );
    }
}
