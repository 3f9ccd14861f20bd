//! Newtype wrappers for engine identifiers and cache keys.
//!
//! All newtypes serialize/deserialize as plain strings so they can sit directly
//! inside engine wire documents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Leading 12 characters, as engines print ids in listings.
            /// The `sha256:` algorithm prefix is skipped.
            pub fn short(&self) -> &str {
                let bare = self.0.strip_prefix("sha256:").unwrap_or(&self.0);
                bare.char_indices().nth(12).map_or(bare, |(i, _)| &bare[..i])
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
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

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Engine image identifier, usually `sha256:<hex>`. Imported images use
    /// the caller-chosen name as their id.
    ImageId
);

string_newtype!(
    /// Engine container identifier.
    ContainerId
);

string_newtype!(
    /// Cache key for one build step. Stored as the committed image's comment
    /// and matched against it on later builds.
    Fingerprint
);
