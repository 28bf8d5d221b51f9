//! Wire envelope published on the bus.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Outer message wrapper.
///
/// `owner_id` addresses a targeted message (a specific driver or rider) and is
/// empty for broadcast events. It is never an authorization input.
/// `data` is the event-specific JSON payload, carried as base64 text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "ownerID", default)]
    pub owner_id: String,
    #[serde(
        default,
        serialize_with = "encode_data",
        deserialize_with = "decode_data"
    )]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Envelope addressed to `owner_id` carrying `payload` as JSON.
    pub fn targeted<T: Serialize>(
        owner_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            owner_id: owner_id.into(),
            data: serde_json::to_vec(payload)?,
        })
    }

    /// Envelope with no recipient.
    pub fn broadcast<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Self::targeted(String::new(), payload)
    }

    /// Deserialize the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    pub fn is_targeted(&self) -> bool {
        !self.owner_id.is_empty()
    }

    /// Serialize the whole envelope for the message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a message body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

fn encode_data<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

fn decode_data<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    // Producers that never set data emit `null`.
    match Option::<String>::deserialize(deserializer)? {
        Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}
