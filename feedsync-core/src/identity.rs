//! Identity types for FEEDSYNC records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Defines a string-backed document id newtype.
///
/// Backing stores hand out opaque string ids; wrapping each kind in its own
/// type keeps a `UserId` from being passed where a `PostId` is expected.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw document id.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw document id.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the wrapper and return the raw id.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Identifier of a user; the key of the profile cache.
    UserId
);
define_id!(
    /// Identifier of a feed post.
    PostId
);
define_id!(
    /// Identifier of a reply to a post.
    ReplyId
);
define_id!(
    /// Identifier of a tournament.
    TournamentId
);
define_id!(
    /// Identifier of a tournament chat message.
    MessageId
);
define_id!(
    /// Identifier of a tournament participant row.
    ParticipantId
);
