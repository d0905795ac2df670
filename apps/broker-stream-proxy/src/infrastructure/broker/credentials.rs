//! Streaming Credentials
//!
//! Session credentials handed to an adapter at construction. The core
//! never stores or rotates them; they live only as long as the adapter.

use thiserror::Error;

/// Missing or empty credential fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    /// A required field was empty.
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    /// A required environment variable was absent.
    #[error("{0} environment variable not set")]
    MissingVar(String),
}

/// Broker streaming credentials.
///
/// `Debug` and `Display` never print the session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user_id: String,
    account_id: String,
    session_token: String,
}

impl Credentials {
    /// Credentials whose account id equals the user id.
    ///
    /// # Errors
    ///
    /// Returns an error if the user id or token is empty.
    pub fn new(
        user_id: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let user_id = user_id.into();
        let account_id = user_id.clone();
        Self::with_account(user_id, account_id, session_token)
    }

    /// Credentials with a distinct account id.
    ///
    /// # Errors
    ///
    /// Returns an error if any field is empty.
    pub fn with_account(
        user_id: impl Into<String>,
        account_id: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let user_id = user_id.into().trim().to_string();
        let account_id = account_id.into().trim().to_string();
        let session_token = session_token.into().trim().to_string();

        if user_id.is_empty() {
            return Err(CredentialsError::Empty("user id"));
        }
        if account_id.is_empty() {
            return Err(CredentialsError::Empty("account id"));
        }
        if session_token.is_empty() {
            return Err(CredentialsError::Empty("session token"));
        }

        Ok(Self {
            user_id,
            account_id,
            session_token,
        })
    }

    /// Read `<PREFIX>_UID`, `<PREFIX>_SUSERTOKEN` and the optional
    /// `<PREFIX>_ACTID` through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or empty.
    pub fn from_lookup(
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CredentialsError> {
        let var = |suffix: &str| format!("{prefix}_{suffix}");
        let required = |suffix: &str| {
            let name = var(suffix);
            lookup(&name).ok_or(CredentialsError::MissingVar(name))
        };

        let user_id = required("UID")?;
        let session_token = required("SUSERTOKEN")?;
        match lookup(&var("ACTID")).filter(|v| !v.trim().is_empty()) {
            Some(account_id) => Self::with_account(user_id, account_id, session_token),
            None => Self::new(user_id, session_token),
        }
    }

    /// Login user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Trading account id.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Session token issued by the broker's login flow.
    #[must_use]
    pub fn session_token(&self) -> &str {
        &self.session_token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("account_id", &self.account_id)
            .field("session_token", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials(user_id={})", self.user_id)
    }
}
