//! Radio-free tests over the public API: the example scenario from the
//! wire contract (topic "counter", 4-byte payload at MTU 23) plus the
//! client-side drop rules.

use topic_ble::{
    characteristic_uuid, enforce_mtu, service_uuid, BleTopicClient, BleTopicConfig, BleTopicError,
    Codec, ConnectionState, OversizePolicy, RawCodec, MIN_MTU,
};
use tokio_test::assert_ok;
use uuid::Uuid;

#[test]
fn counter_topic_has_a_fixed_identity() {
    let expected: Uuid = "74626c65-0000-19ba-62d6-83315a930a09".parse().unwrap();
    assert_eq!(service_uuid("counter"), expected);
    assert_ne!(service_uuid("counter"), characteristic_uuid("counter"));
}

#[test]
fn small_payload_passes_the_baseline_mtu_unmodified() {
    // The integer 42 as 4 big-endian bytes.
    let payload = vec![0x00, 0x00, 0x00, 0x2A];
    let encoded = RawCodec.encode(&payload).unwrap();
    let out = enforce_mtu(encoded, MIN_MTU, OversizePolicy::Reject).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn large_payload_is_rejected_under_the_baseline_policy() {
    let payload = vec![0u8; 600];
    let err = enforce_mtu(payload, MIN_MTU, OversizePolicy::Reject).unwrap_err();
    assert!(matches!(
        err,
        BleTopicError::MessageTooLarge { size: 600, max } if max == MIN_MTU
    ));
}

#[tokio::test]
async fn client_starts_idle_and_drops_writes() {
    let client = BleTopicClient::new("counter", BleTopicConfig::default(), RawCodec);
    assert_eq!(client.state().await, ConnectionState::Idle);

    // Not connected: the write is dropped without error and without
    // touching any transport.
    tokio_test::assert_ok!(client.update(&vec![0x00, 0x00, 0x00, 0x2A]).await);
    assert_eq!(client.state().await, ConnectionState::Idle);
}

#[tokio::test]
async fn shutdown_before_start_is_safe() {
    let mut client = BleTopicClient::new("counter", BleTopicConfig::default(), RawCodec);
    client.shutdown().await;
    client.shutdown().await;
    assert_eq!(client.state().await, ConnectionState::Idle);
}
