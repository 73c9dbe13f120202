//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Name of a tenant (a REGARDS project), the unit of scheduling fairness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantName(String);

/// Logical component owning a lock (e.g. `"JobService"`).
///
/// Together with the lock name it forms the unique key of a lock row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LockOwner(String);

macro_rules! impl_name_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier, rejecting blank values.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{} must not be blank", $name)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
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

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_name_newtype!(TenantName, "TenantName");
impl_name_newtype!(LockOwner, "LockOwner");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_names_are_rejected() {
        assert!(matches!(TenantName::new(""), Err(DomainError::InvalidId(_))));
        assert!(matches!(LockOwner::new("   "), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn parse_and_display_round_trip_the_raw_value() {
        let tenant: TenantName = "project-1".parse().unwrap();
        assert_eq!(tenant.as_str(), "project-1");
        assert_eq!(tenant.to_string(), "project-1");
    }

    #[test]
    fn deserialization_validates() {
        let ok: LockOwner = serde_json::from_str("\"JobService\"").unwrap();
        assert_eq!(ok.as_str(), "JobService");
        assert!(serde_json::from_str::<LockOwner>("\"\"").is_err());
    }
}
