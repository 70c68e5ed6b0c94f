use crate::{CommonError, CommonResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque owner token supplied by the authentication layer.
///
/// Scopes which document a session may read, subscribe to and write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerIdentity(String);

impl OwnerIdentity {
    pub fn new(token: impl Into<String>) -> CommonResult<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(CommonError::InvalidIdentity("empty token".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token can be used verbatim as a file stem
    pub fn is_path_safe(&self) -> bool {
        self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for OwnerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for OwnerIdentity {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
