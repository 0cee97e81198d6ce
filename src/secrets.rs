//! Scoped credential handles.
//!
//! A [`Secret`] is read once at startup and moved into the one component
//! that needs it (the signer or the publisher). It has no `Serialize` impl
//! and its `Debug`/`Display` output is redacted, so it cannot leak into the
//! event log, the step output mapping or tracing fields by accident.

use std::fmt;

/// An opaque credential value
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a raw credential value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read a credential from an environment variable.
    ///
    /// Unset and empty variables both yield `None`.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(Self)
    }

    /// Access the raw value. Only components holding the handle call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_missing_env_is_none() {
        assert!(Secret::from_env("FERRY_TEST_SURELY_UNSET_VARIABLE").is_none());
    }
}
