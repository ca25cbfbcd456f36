//! Opaque identifiers used across the engine.
//!
//! Identifiers are generated from UUIDv7 text but are otherwise opaque: nothing
//! in the engine orders or breaks ties by identifier value.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Identifier of a stored job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identifier of a queue entry (one enqueued reference to a job).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueEntryId(String);

/// Holder token of a distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

macro_rules! impl_opaque_id {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Generate a fresh, unique identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ValidationError::empty($name));
                }
                Ok(Self(s.to_string()))
            }
        }

        impl TryFrom<&str> for $t {
            type Error = ValidationError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl TryFrom<String> for $t {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                if value.trim().is_empty() {
                    return Err(ValidationError::empty($name));
                }
                Ok(Self(value))
            }
        }
    };
}

impl_opaque_id!(JobId, "job_id");
impl_opaque_id!(QueueEntryId, "queue_entry_id");
impl_opaque_id!(LockToken, "lock_token");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn empty_text_is_not_an_id() {
        assert_eq!("".parse::<JobId>(), Err(ValidationError::Empty("job_id")));
        assert_eq!(
            QueueEntryId::try_from(String::from(" ")),
            Err(ValidationError::Empty("queue_entry_id"))
        );
    }

    #[test]
    fn foreign_ids_round_trip_as_text() {
        let id: JobId = "legacy-42".parse().unwrap();
        assert_eq!(id.to_string(), "legacy-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"legacy-42\"");
    }
}
