//! Bridge a named pub/sub topic to a BLE GATT characteristic
//!
//! One side runs a [`BleTopicServer`] (peripheral role): it derives a
//! service/characteristic UUID pair from the topic name, registers the
//! pair with BlueZ and advertises under the topic. The other side runs
//! a [`BleTopicClient`] (central role): it scans for the server,
//! connects, subscribes to notifications on the derived characteristic
//! and exchanges small binary messages with it. Both sides share a
//! [`Codec`] that converts application messages to and from wire
//! bytes, bounded by a configurable MTU.
//!
//! ## Modules
//!
//! - `topic` - deterministic topic-to-UUID derivation
//! - `codec` - message codec contract and MTU enforcement
//! - `config` - timeouts, retry counts and the oversize policy
//! - `error` - error types
//! - `client` - central-role connection lifecycle
//! - `server` - peripheral-role adapter (Linux only)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use topic_ble::{BleTopicClient, BleTopicConfig, RawCodec};
//!
//! # async fn example() -> topic_ble::Result<()> {
//! let config = BleTopicConfig::new().with_connect_retries(5);
//! let mut client = BleTopicClient::new("counter", config, RawCodec);
//!
//! client.start().await?;
//! let mut incoming = client.take_incoming()?;
//!
//! // The client scans, connects and reconnects on its own; writes made
//! // while disconnected are dropped by design.
//! client.update(&vec![0x00, 0x00, 0x00, 0x2A]).await?;
//! if let Some(message) = incoming.recv().await {
//!     println!("received {} bytes", message.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform support
//!
//! The central role works wherever btleplug does (Linux, macOS,
//! Windows). The peripheral role requires BlueZ and is compiled on
//! Linux only.

mod client;
mod codec;
mod config;
mod error;
mod inbound;
#[cfg(target_os = "linux")]
mod server;
mod topic;

// Public API exports
pub use client::{BleTopicClient, ConnectionState};
pub use codec::{enforce_mtu, BincodeCodec, Codec, JsonCodec, RawCodec};
pub use config::{BleTopicConfig, OversizePolicy, CHARACTERISTIC_MAX, MIN_MTU};
pub use error::{BleTopicError, Result};
#[cfg(target_os = "linux")]
pub use server::BleTopicServer;
pub use topic::{characteristic_uuid, service_uuid, NAMESPACE_TAG};
