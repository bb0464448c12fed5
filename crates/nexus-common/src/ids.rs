//! Identity types shared by the voice crates.
//!
//! Nexus identities are UUID v7 values: time-sortable and generated without
//! coordination. Their total order is also what the voice mesh uses to decide
//! which side of a peer pair sends the offer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a new time-sortable ID (UUID v7).
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(generate_id())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// A user account. In a voice channel this doubles as the peer identity.
    UserId
);

id_type!(
    /// A voice channel.
    ChannelId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(UserId::new(), UserId::new());
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let first = UserId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = UserId::new();
        assert!(first < second);
    }

    #[test]
    fn test_parse_and_display() {
        let id = ChannelId::new();
        let parsed: ChannelId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ChannelId>().is_err());
    }

    #[test]
    fn test_serializes_as_bare_uuid() {
        let id = UserId(Uuid::nil());
        let json = serde_json::to_string(&id).expect("should serialize");
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
