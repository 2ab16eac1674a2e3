//! Identifier newtypes used across the overlay.
//!
//! Rosters and rounds get random ids; protocols, services and message
//! types get ids derived from their registered names so that every host
//! agrees on them without coordination.

use std::fmt;

use arbor_transport::content_id;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// The nil id, used as "unset".
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = self.0.simple().to_string();
                write!(f, "{}({})", stringify!($name), &s[..8])
            }
        }
    };
}

uuid_id!(
    /// Identifies a [`Roster`](crate::Roster). Random.
    RosterId
);
uuid_id!(
    /// Identifies a [`Tree`](crate::Tree): derived from roster and root ids.
    TreeId
);
uuid_id!(
    /// Identifies one position in a tree.
    TreeNodeId
);
uuid_id!(ProtocolId);
uuid_id!(ServiceId);
uuid_id!(
    /// Distinguishes concurrent runs of one protocol on one tree.
    RoundId
);
uuid_id!(
    /// Content hash of a [`Token`](crate::Token).
    TokenId
);
uuid_id!(MessageTypeId);

impl RosterId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl RoundId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl ProtocolId {
    pub fn from_name(name: &str) -> Self {
        Self(content_id("arbor/protocol", &[name.as_bytes()]))
    }
}

impl ServiceId {
    pub fn from_name(name: &str) -> Self {
        Self(content_id("arbor/service", &[name.as_bytes()]))
    }
}

impl MessageTypeId {
    pub fn from_name(name: &str) -> Self {
        Self(content_id("arbor/message", &[name.as_bytes()]))
    }
}
