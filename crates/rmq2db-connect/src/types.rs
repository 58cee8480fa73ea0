//! Common types for rmq2db-connect

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// A wrapper around `SecretString` for connection strings that carry passwords.
///
/// This type:
/// - Redacts the value in `Debug` and `Display` output to prevent credential leaks in logs
/// - Serializes as `"***REDACTED***"` to prevent accidental exposure in config dumps
/// - Provides `expose_secret()` method to access the actual value when needed
///
/// # Example
///
/// ```rust
/// use rmq2db_connect::SensitiveString;
///
/// let url = SensitiveString::new("postgres://bridge:hunter2@db/iot");
///
/// // Safe to log - shows "[REDACTED]"
/// assert_eq!(format!("{:?}", url), "[REDACTED]");
///
/// // Access the actual value when needed
/// assert!(url.expose_secret().contains("hunter2"));
/// ```
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use sparingly - only when the actual value is needed (e.g., for connecting).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Connection string with the password replaced, for logs.
    ///
    /// Keeps scheme, user, host and path so operators can tell endpoints apart.
    pub fn redacted_url(&self) -> String {
        let raw = self.expose_secret();
        let Some((scheme, rest)) = raw.split_once("://") else {
            return "[REDACTED]".to_string();
        };
        match rest.rsplit_once('@') {
            Some((userinfo, host)) => {
                let user = userinfo.split(':').next().unwrap_or_default();
                format!("{}://{}:***@{}", scheme, user, host)
            }
            None => raw.to_string(),
        }
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Serialize as redacted to prevent accidental exposure in config dumps/logs
impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

/// Deserialize from the actual string value
impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}
