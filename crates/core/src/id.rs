//! Strongly-typed identifiers used across the domain.
//!
//! Messaging identifiers arrive from the host as opaque strings; the
//! newtypes only guarantee they are non-empty once parsed.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a stored message (the owner of attachment records).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

/// Identifier of the conversation a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

/// Identifier of a peer account (the author a backfill request targets).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap an identifier without validation.
            ///
            /// Prefer [`FromStr`] for input coming from outside the process.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                Ok(Self(trimmed.to_owned()))
            }
        }
    };
}

impl_string_newtype!(MessageId, "MessageId");
impl_string_newtype!(ConversationId, "ConversationId");
impl_string_newtype!(ServiceId, "ServiceId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_rejects_blank_ids() {
        assert!(matches!(
            "   ".parse::<MessageId>(),
            Err(DomainError::InvalidId(_))
        ));
        assert_eq!("m-1 ".parse::<MessageId>().unwrap().as_str(), "m-1");
    }

    #[test]
    fn serializes_transparently() {
        let id = ConversationId::new("c-9");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c-9\"");
    }
}
