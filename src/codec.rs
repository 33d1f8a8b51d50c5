//! Message codec contract and wire payload bounds
//!
//! A [`Codec`] converts an application message to and from the raw
//! bytes that cross the characteristic. [`RawCodec`] passes bytes
//! through untouched for applications that speak bytes natively;
//! [`BincodeCodec`] gives a compact fixed-layout little-endian framing
//! for the 23-byte baseline MTU; [`JsonCodec`] trades size for
//! debuggability where the link can afford it.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::config::OversizePolicy;
use crate::error::{BleTopicError, Result};

// ----------------------------------------------------------------------------
// Codec Contract
// ----------------------------------------------------------------------------

/// Encode/decode contract between application messages and wire bytes.
///
/// `decode(encode(m))` must reproduce `m` exactly for every message the
/// codec claims to carry; lossy numeric narrowing belongs to the message
/// type itself, not the codec.
pub trait Codec: Send + Sync {
    type Message: Send + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<Self::Message>;
}

// ----------------------------------------------------------------------------
// Codec Implementations
// ----------------------------------------------------------------------------

/// Passthrough codec for applications that already speak bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Message = Vec<u8>;

    fn encode(&self, message: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(message.clone())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Structured-text codec via serde_json.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| BleTopicError::Encoding(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| BleTopicError::Decoding(e.to_string()))
    }
}

/// Fixed-layout binary codec via bincode (little-endian integers,
/// fixed-width fields). The right default for the 23-byte baseline MTU.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Vec<u8>> {
        bincode::serialize(message).map_err(|e| BleTopicError::Encoding(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T> {
        bincode::deserialize(data).map_err(|e| BleTopicError::Decoding(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Wire Payload Bound
// ----------------------------------------------------------------------------

/// Apply the MTU bound to an encoded payload.
///
/// A payload of exactly `mtu` bytes passes unmodified. One byte over
/// triggers the policy: `Reject` fails the publish, `Truncate` cuts the
/// payload down and logs a warning. Never a silent drop.
pub fn enforce_mtu(payload: Vec<u8>, mtu: usize, policy: OversizePolicy) -> Result<Vec<u8>> {
    if payload.len() <= mtu {
        return Ok(payload);
    }
    match policy {
        OversizePolicy::Reject => Err(BleTopicError::MessageTooLarge {
            size: payload.len(),
            max: mtu,
        }),
        OversizePolicy::Truncate => {
            warn!(
                "Truncating oversized payload: {} bytes exceeds MTU {}",
                payload.len(),
                mtu
            );
            let mut payload = payload;
            payload.truncate(mtu);
            Ok(payload)
        }
    }
}
