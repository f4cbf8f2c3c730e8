use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    ops::Deref,
    str::FromStr,
};
use uuid::Uuid;

/// Defines an opaque string-backed id type for an entity, assigned at creation
/// and never reused. Modeled on the newtype wrappers `innernet-shared` uses
/// for `Hostname`/`Interface`, generalized from a validated string to a
/// randomly generated one.
macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(NetworkId);
opaque_id!(PeerId);
opaque_id!(GroupId);
opaque_id!(PolicyId);
opaque_id!(RouteId);
opaque_id!(DnsRecordId);
opaque_id!(IncidentId);
opaque_id!(UserId);
