//! Core identifier types.
//!
//! Every entity the control plane tracks is keyed by a database-assigned
//! 64-bit integer. Wrapping each in its own newtype keeps a daemon ID from
//! being passed where a host ID is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database identifier.
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Return the raw identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }

            /// Encode as an order-preserving key: big-endian with the sign
            /// bit flipped, so negative IDs sort before positive ones.
            #[must_use]
            pub const fn to_key_bytes(self) -> [u8; 8] {
                (self.0 ^ i64::MIN).to_be_bytes()
            }

            /// Decode bytes produced by `to_key_bytes`.
            #[must_use]
            pub const fn from_key_bytes(bytes: [u8; 8]) -> Self {
                Self(i64::from_be_bytes(bytes) ^ i64::MIN)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<i64>()
                    .map(Self)
                    .map_err(|_| IdError::NotANumber(s.to_string()))
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id! {
    /// Identifier of an authenticated user of the control plane.
    UserId
}

numeric_id! {
    /// Identifier of a machine running an agent.
    MachineId
}

numeric_id! {
    /// Identifier of an application (a daemon family instance) on a machine.
    AppId
}

numeric_id! {
    /// Identifier of a single managed DHCP/DNS daemon.
    DaemonId
}

numeric_id! {
    /// Identifier of a host reservation.
    HostId
}

numeric_id! {
    /// Identifier of a configuration transaction context.
    ///
    /// Context IDs are allocated by the transaction manager and are only
    /// unique within one manager's lifetime.
    ContextId
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a decimal integer.
    #[error("not a numeric identifier: {0:?}")]
    NotANumber(String),
}
