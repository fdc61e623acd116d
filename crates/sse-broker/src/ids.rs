//! Fixed-width client identifiers and secrets.
//!
//! Both encode to URL-safe base64 without padding; padded input is accepted.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::ConnError;

pub const CLIENT_ID_LEN: usize = 16;
pub const CLIENT_SECRET_LEN: usize = 64;

/// Opaque 16-byte client identifier.
///
/// Also used for room identifiers, so a single generator covers both. The
/// all-zeroes value is reserved as the "no client" marker.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    pub fn random() -> Self {
        let mut bytes = [0u8; CLIENT_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; CLIENT_ID_LEN]
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

impl FromStr for ClientId {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_url_safe(s).ok_or(ConnError::InvalidClientId)?;
        let bytes: [u8; CLIENT_ID_LEN] = bytes.try_into().map_err(|_| ConnError::InvalidClientId)?;
        Ok(Self(bytes))
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(ClientIdVisitor)
    }
}

struct ClientIdVisitor;

impl Visitor<'_> for ClientIdVisitor {
    type Value = ClientId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a URL-safe base64 client identifier")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        value.parse().map_err(de::Error::custom)
    }
}

/// 64-byte client secret proving ownership of a client identifier.
///
/// Never logged; the `Debug` form is redacted. Only ever compared.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClientSecret([u8; CLIENT_SECRET_LEN]);

impl ClientSecret {
    pub fn random() -> Self {
        let mut bytes = [0u8; CLIENT_SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Textual form for handing to a client; intentionally not `Display` so
    /// the secret cannot end up in a log line by accident.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret(..)")
    }
}

impl FromStr for ClientSecret {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_url_safe(s).ok_or(ConnError::InvalidClientSecret)?;
        let bytes: [u8; CLIENT_SECRET_LEN] =
            bytes.try_into().map_err(|_| ConnError::InvalidClientSecret)?;
        Ok(Self(bytes))
    }
}

/// Accepts both padded and unpadded URL-safe base64.
fn decode_url_safe(s: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('=')).ok()
}
