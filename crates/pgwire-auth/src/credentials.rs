//! Credential types for authentication.

use std::borrow::Cow;

use crate::error::AuthError;

/// Role name and optional password used to open a session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user: Cow<'static, str>,
    password: Option<Cow<'static, str>>,
}

impl Credentials {
    /// Credentials for a role that authenticates without a password (trust, peer).
    pub fn new(user: impl Into<Cow<'static, str>>) -> Self {
        Self {
            user: user.into(),
            password: None,
        }
    }

    /// Credentials with a password.
    pub fn with_password(
        user: impl Into<Cow<'static, str>>,
        password: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            user: user.into(),
            password: Some(password.into()),
        }
    }

    /// Role name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The password, or [`AuthError::MissingPassword`] when the server asks for one we lack.
    pub fn password(&self) -> Result<&str, AuthError> {
        self.password.as_deref().ok_or(AuthError::MissingPassword)
    }

    /// Whether a password is configured.
    #[must_use]
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
