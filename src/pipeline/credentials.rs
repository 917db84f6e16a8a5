use std::fmt;

use crate::core::errors::{FanoutError, Result};

/// Username and password handed to the query service
///
/// Both values are opaque secrets: `Debug` redacts them and nothing in the
/// crate logs them.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Read both secrets from the named environment variables
    pub fn from_env(user_var: &str, password_var: &str) -> Result<Self> {
        let read = |var: &str| {
            std::env::var(var).map_err(|_| {
                FanoutError::configuration_field(format!("environment variable {} is not set", var), var)
            })
        };
        Ok(Self::new(read(user_var)?, read(password_var)?))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}
