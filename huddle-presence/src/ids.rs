//! Identifier newtypes shared by both ends of the wire.
//!
//! `UserId` and `TeamId` are opaque strings. The dashboard frontend sends
//! numeric ids (`"teamId": 7`), so deserialization accepts either a JSON
//! string or an integer; serialization always emits a string.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned identity of one live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                #[derive(serde::Deserialize)]
                #[serde(untagged)]
                enum Raw {
                    Text(String),
                    Number(i64),
                }

                Ok(match Raw::deserialize(deserializer)? {
                    Raw::Text(text) => Self(text),
                    Raw::Number(number) => Self(number.to_string()),
                })
            }
        }
    };
}

string_id!(
    /// Dashboard user identifier, announced by the client.
    UserId
);

string_id!(
    /// Team identifier; one team maps to one broadcast room.
    TeamId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_id_accepts_number_and_string() {
        let from_number: TeamId = serde_json::from_str("7").unwrap();
        let from_string: TeamId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_number.as_str(), "7");
    }

    #[test]
    fn test_user_id_serializes_as_string() {
        let id = UserId::from(42u64);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
    }

    #[test]
    fn test_rejects_non_scalar_id() {
        assert!(serde_json::from_str::<UserId>("{\"id\": 1}").is_err());
        assert!(serde_json::from_str::<TeamId>("null").is_err());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(ConnectionId::from(a.as_uuid()), a);
    }
}
