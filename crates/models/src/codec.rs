// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use serde::{de::DeserializeOwned, Serialize};

/// Type tag carried by every data-flow slot. Graph validation compares these
/// across each edge; the worker uses them to decide how a result buffer is
/// stored.
pub trait TypeTag {
    const TYPE_TAG: &'static str;
}

/// Tag for slots whose buffer is the UUID of a data blob rather than an
/// inline value.
pub const DATA_TYPE_TAG: &str = "data";

impl TypeTag for i64 {
    const TYPE_TAG: &'static str = "int";
}

impl TypeTag for f64 {
    const TYPE_TAG: &'static str = "float";
}

impl TypeTag for bool {
    const TYPE_TAG: &'static str = "bool";
}

impl TypeTag for String {
    const TYPE_TAG: &'static str = "str";
}

impl TypeTag for Vec<u8> {
    const TYPE_TAG: &'static str = "bytes";
}

/// Serializes a bound value into the byte buffer stored in task rows and
/// shipped over the executor pipe.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

pub fn decode_value<T: DeserializeOwned>(buffer: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(buffer)
}

/// Base64 representation for byte buffers embedded in JSON columns and pipe
/// frames.
pub mod bytes_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip() {
        let buf = encode_value(&41i64).unwrap();
        assert_eq!(decode_value::<i64>(&buf).unwrap(), 41);

        let buf = encode_value(&"spider".to_owned()).unwrap();
        assert_eq!(decode_value::<String>(&buf).unwrap(), "spider");
    }

    #[test]
    fn tags_are_distinct() {
        let tags = [
            <i64 as TypeTag>::TYPE_TAG,
            <f64 as TypeTag>::TYPE_TAG,
            <bool as TypeTag>::TYPE_TAG,
            <String as TypeTag>::TYPE_TAG,
            <Vec<u8> as TypeTag>::TYPE_TAG,
            DATA_TYPE_TAG,
        ];
        let unique: std::collections::HashSet<_> = tags.iter().collect();
        assert_eq!(unique.len(), tags.len());
    }
}
