//! Error types for the topic bridge

use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by the topic bridge
#[derive(Error, Debug)]
pub enum BleTopicError {
    /// No usable BLE adapter or role on this host. Fatal at startup.
    #[error("BLE transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Connection attempt failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to get notifications stream: {0}")]
    NotificationStreamFailed(String),

    #[error("Failed to encode message: {0}")]
    Encoding(String),

    #[error("Failed to decode message: {0}")]
    Decoding(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The incoming-message receiver may be taken only once.
    #[error("Incoming receiver already taken")]
    IncomingAlreadyTaken,

    #[error("Component not started")]
    NotStarted,
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BleTopicError>;
