//! Branded identifier newtypes.
//!
//! Client-minted IDs (`RequestId`, `TurnId`) carry a prefix and a UUIDv7 so
//! they sort by creation time. Server-minted IDs (`SessionId`,
//! `WorkspaceId`) are wrapped with [`from_raw`](SessionId::from_raw)
//! and never reformatted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh, time-ordered identifier.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an identifier received from elsewhere.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// A logical agent session on the remote host.
    SessionId,
    "sess"
);
branded_id!(
    /// Correlates one outbound command with its reply.
    RequestId,
    "req"
);
branded_id!(
    /// Idempotency token for a user turn; stable across retried sends.
    TurnId,
    "turn"
);
branded_id!(
    /// A workspace on the remote host.
    WorkspaceId,
    "ws"
);
