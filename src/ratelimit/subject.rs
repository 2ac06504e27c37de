//! Subject validation and store key generation.

use crate::error::{Result, TierlimitError};

/// A validated identity being rate limited (e.g. a user id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subject<'a>(&'a str);

impl<'a> Subject<'a> {
    /// Validate a raw subject string.
    pub fn parse(raw: &'a str) -> Result<Self> {
        if raw.is_empty() {
            return Err(TierlimitError::Validation("subject cannot be empty".to_string()));
        }
        Ok(Self(raw))
    }

    /// The subject as given by the caller.
    pub fn as_str(&self) -> &'a str {
        self.0
    }

    /// Key under which the shared store keeps this subject's window counter.
    ///
    /// Format: `{prefix}:{subject}`
    pub fn store_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.0)
    }
}

impl std::fmt::Display for Subject<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Validate a per-call limit.
pub fn validate_limit(limit: u64) -> Result<u64> {
    if limit == 0 {
        return Err(TierlimitError::Validation("limit must be greater than 0".to_string()));
    }
    Ok(limit)
}
