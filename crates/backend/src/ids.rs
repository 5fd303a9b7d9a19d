use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ensure;

use super::backend::{BackendError, BackendResult, InvalidIdSnafu};

// Server ids are opaque. Depending on the backend build they arrive as JSON
// strings or integers, so both shapes normalize to the same string form.
macro_rules! define_remote_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> BackendResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    InvalidIdSnafu {
                        stage: "parse-remote-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = BackendError;

            fn from_str(raw: &str) -> BackendResult<Self> {
                Self::parse(raw)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = match WireId::deserialize(deserializer)? {
                    WireId::Text(text) => text,
                    WireId::Number(number) => number.to_string(),
                };
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(serde_json::Number),
}

define_remote_id!(ConversationId, "conversation-id");
define_remote_id!(RemoteMessageId, "message-id");
