// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! Converts typed payloads to message bodies and back. The bus is generic over the
//! codec; JSON is the default.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub trait Codec: Clone + Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, AmqpError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AmqpError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializationError(err.to_string())
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(bytes).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    #[test]
    fn malformed_payloads_are_parse_errors() {
        let res: Result<Order, _> = JsonCodec.decode(b"{\"id\":");
        assert!(matches!(res, Err(AmqpError::ParsePayloadError(_))));
    }

    #[test]
    fn json_content_type() {
        assert_eq!(JsonCodec.content_type(), "application/json");
        assert_eq!(JsonCodec.encode(&Order { id: 3 }).unwrap(), b"{\"id\":3}");
    }
}
