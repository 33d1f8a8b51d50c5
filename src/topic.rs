//! Deterministic topic-to-UUID derivation
//!
//! A topic name maps to a fixed (service, characteristic) UUID pair so
//! that both ends of the bridge can agree on GATT identifiers without
//! ever transmitting the topic itself. Layout of the 16 UUID bytes:
//! 4-byte ASCII namespace tag, 2-byte discriminator, last 10 bytes of
//! SHA-1 over the UTF-8 topic.

use sha1::{Digest, Sha1};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Namespace and Discriminators
// ----------------------------------------------------------------------------

/// Namespace tag occupying the first four UUID bytes.
pub const NAMESPACE_TAG: [u8; 4] = *b"tble";

const SERVICE_DISCRIMINATOR: [u8; 2] = [0x00, 0x00];
const CHARACTERISTIC_DISCRIMINATOR: [u8; 2] = [0x00, 0x01];

// ----------------------------------------------------------------------------
// Derivation
// ----------------------------------------------------------------------------

fn topic_uuid(topic: &str, discriminator: [u8; 2]) -> Uuid {
    let digest = Sha1::digest(topic.as_bytes());

    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&NAMESPACE_TAG);
    bytes[4..6].copy_from_slice(&discriminator);
    bytes[6..].copy_from_slice(&digest[digest.len() - 10..]);
    Uuid::from_bytes(bytes)
}

/// GATT service UUID for a topic.
pub fn service_uuid(topic: &str) -> Uuid {
    topic_uuid(topic, SERVICE_DISCRIMINATOR)
}

/// GATT characteristic UUID for a topic.
pub fn characteristic_uuid(topic: &str) -> Uuid {
    topic_uuid(topic, CHARACTERISTIC_DISCRIMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        for topic in ["counter", "telemetry", "", "emoji \u{1F980}"] {
            assert_eq!(service_uuid(topic), service_uuid(topic));
            assert_eq!(characteristic_uuid(topic), characteristic_uuid(topic));
        }
    }

    #[test]
    fn test_known_topic_literal() {
        // Pinned so a change to the layout is caught across releases.
        let expected: Uuid = "74626c65-0000-19ba-62d6-83315a930a09".parse().unwrap();
        assert_eq!(service_uuid("counter"), expected);

        let expected: Uuid = "74626c65-0001-19ba-62d6-83315a930a09".parse().unwrap();
        assert_eq!(characteristic_uuid("counter"), expected);
    }

    #[test]
    fn test_discriminator_separation() {
        for topic in ["counter", "a", "b", "long topic with spaces"] {
            assert_ne!(service_uuid(topic), characteristic_uuid(topic));
        }
    }

    #[test]
    fn test_distinct_topics_get_distinct_uuids() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let topic = format!("topic-{i}");
            assert!(seen.insert(service_uuid(&topic)), "collision on {topic}");
        }
    }

    #[test]
    fn test_namespace_tag_prefixes_every_uuid() {
        let uuid = service_uuid("anything");
        assert_eq!(&uuid.as_bytes()[..4], &NAMESPACE_TAG);
        assert_eq!(uuid.as_bytes()[4..6], [0x00, 0x00]);
    }
}
