//! Stable identifiers for clusters, stripes and nodes.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Opaque, stable identifier of a cluster element.
///
/// Generated identifiers are 22-character URL-safe base64 encodings of a
/// random v4 UUID. Any non-blank string without whitespace is accepted when
/// parsing, so identifiers produced by other tools round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(URL_SAFE_NO_PAD.encode(uuid.as_bytes()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Uid {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(ModelError::malformed("UID", s));
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uids_are_distinct_and_url_safe() {
        let a = Uid::generate();
        let b = Uid::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 22);
        assert!(a
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn parse_rejects_blank_and_whitespace() {
        assert!("".parse::<Uid>().is_err());
        assert!("a b".parse::<Uid>().is_err());
        assert_eq!("abc".parse::<Uid>().unwrap().as_str(), "abc");
    }

    #[test]
    fn serializes_as_plain_string() {
        let uid: Uid = "xyz".parse().unwrap();
        assert_eq!(serde_json::to_string(&uid).unwrap(), "\"xyz\"");
    }
}
