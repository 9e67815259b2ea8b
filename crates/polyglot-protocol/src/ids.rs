//! Identifier types for commands.
//!
//! IDs are opaque String wrappers (serde-transparent) so tokens minted by a
//! remote host survive a round trip through the wire envelope unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a string-backed identifier that serializes as the bare string.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing value, e.g. one decoded from a remote envelope.
            pub fn from_string(value: impl Into<String>) -> Self {
                Self(value.into())
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

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identity of one command instance. Unlike the token it is never shared
    /// with child commands.
    CommandId
);
string_id!(
    /// Correlation token carried by a command and every event it produces.
    ///
    /// Root tokens are random; tokens of commands synthesized while handling
    /// another command are `"{parent}.{n}"`, so the command tree can be
    /// rebuilt from tokens alone.
    CommandToken
);

impl CommandId {
    /// Random, unique per command.
    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl CommandToken {
    /// Mint a fresh root token.
    pub fn new_root() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Token of the `index`-th child command of the command holding `self`.
    pub fn child(&self, index: u64) -> Self {
        Self(format!("{}.{index}", self.0))
    }

    /// Token of the parent command, if this token is hierarchical.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| Self(parent.to_owned()))
    }

    /// The root segment shared by every command in one tree.
    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// Whether this token names the same command as `other` or one nested below it.
    pub fn is_self_or_descendant_of(&self, other: &CommandToken) -> bool {
        self.0 == other.0
            || (self.0.len() > other.0.len()
                && self.0.starts_with(other.0.as_str())
                && self.0.as_bytes()[other.0.len()] == b'.')
    }
}
