//! Hex string (de)serialization for fixed-size key material.

use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

pub(crate) fn serialize<S: Serializer, const N: usize>(
    bytes: &[u8; N],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

pub(crate) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
    deserializer: D,
) -> Result<[u8; N], D::Error> {
    let text = String::deserialize(deserializer)?;
    let raw = hex::decode(text).map_err(D::Error::custom)?;
    raw.try_into()
        .map_err(|v: Vec<u8>| D::Error::invalid_length(v.len(), &"fixed-size key material"))
}

/// Implements hex `Serialize`/`Deserialize` for a key wrapper given its
/// byte conversions.
macro_rules! hex_serde {
    ($ty:ty, $len:literal, $from:expr, $to:expr) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let to: fn(&$ty) -> [u8; $len] = $to;
                $crate::serde_hex::serialize(&to(self), serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let from: fn([u8; $len]) -> Result<$ty, $crate::CryptoError> = $from;
                let bytes = $crate::serde_hex::deserialize::<D, $len>(deserializer)?;
                from(bytes).map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use hex_serde;
