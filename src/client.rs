//! Central-role connection manager
//!
//! `BleTopicClient` owns the connection lifecycle for one topic:
//! scan for the advertised server by name, connect with bounded
//! retries, subscribe to notifications on the derived characteristic,
//! relay inbound frames, and rescan after every disconnect. The
//! lifecycle task owns all state transitions; disconnects arrive as
//! adapter events, never as callbacks mutating shared fields.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use futures::{FutureExt, Stream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::Codec;
use crate::config::BleTopicConfig;
use crate::error::{BleTopicError, Result};
use crate::inbound;
use crate::topic;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle state of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

/// The write path's view of the active connection.
struct Link {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

struct Shared {
    state: RwLock<ConnectionState>,
    link: RwLock<Option<Link>>,
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

/// Connects to a [`BleTopicServer`](crate::BleTopicServer) advertising
/// the same topic and exchanges messages with it.
pub struct BleTopicClient<C: Codec> {
    config: BleTopicConfig,
    device_name: String,
    codec: Arc<C>,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    shared: Arc<Shared>,
    incoming_rx: Option<mpsc::UnboundedReceiver<C::Message>>,
    lifecycle: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl<C: Codec + 'static> BleTopicClient<C> {
    /// Create a client for a topic whose server advertises under the
    /// topic name itself.
    pub fn new(topic: &str, config: BleTopicConfig, codec: C) -> Self {
        Self::for_device(topic, topic, config, codec)
    }

    /// Create a client that scans for `device_name` while deriving the
    /// GATT identifiers from `topic`. Useful when the server advertises
    /// under its hostname rather than the topic.
    pub fn for_device(device_name: &str, topic: &str, config: BleTopicConfig, codec: C) -> Self {
        Self {
            config,
            device_name: device_name.to_string(),
            codec: Arc::new(codec),
            service_uuid: topic::service_uuid(topic),
            characteristic_uuid: topic::characteristic_uuid(topic),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Idle),
                link: RwLock::new(None),
            }),
            incoming_rx: None,
            lifecycle: None,
            reader: None,
            shutdown_tx: None,
        }
    }

    /// Start the connection-lifecycle task.
    ///
    /// Fails with `TransportUnavailable` when no BLE adapter exposes
    /// the central role. Calling `start` on a running client is a
    /// no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.lifecycle.is_some() {
            return Ok(());
        }

        let manager = Manager::new()
            .await
            .map_err(|e| BleTopicError::TransportUnavailable(format!("BLE manager: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| BleTopicError::TransportUnavailable(format!("BLE adapters: {e}")))?;
        let adapter = adapters.into_iter().next().ok_or_else(|| {
            BleTopicError::TransportUnavailable("no BLE adapter available".to_string())
        })?;

        let (raw_tx, raw_rx) = inbound::channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        self.incoming_rx = Some(delivered_rx);
        self.reader = Some(inbound::spawn_decode_loop(
            self.codec.clone(),
            raw_rx,
            delivered_tx,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let task = ConnectionTask {
            adapter,
            config: self.config.clone(),
            device_name: self.device_name.clone(),
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            shared: self.shared.clone(),
            raw_tx,
            shutdown_rx,
        };
        self.lifecycle = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Take the stream of decoded messages received from the server.
    /// May be taken once, after `start`.
    pub fn take_incoming(&mut self) -> Result<mpsc::UnboundedReceiver<C::Message>> {
        if self.lifecycle.is_none() {
            return Err(BleTopicError::NotStarted);
        }
        self.incoming_rx.take().ok_or(BleTopicError::IncomingAlreadyTaken)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Write a message to the server's characteristic.
    ///
    /// While not connected the message is silently dropped; this
    /// transport offers no store-and-forward. Oversized payloads are
    /// warned about but still attempted, since the server may have
    /// negotiated a larger MTU. Writes go out without response, so
    /// delivery is best-effort even while connected.
    pub async fn update(&self, message: &C::Message) -> Result<()> {
        if *self.shared.state.read().await != ConnectionState::Connected {
            debug!("Dropping update while not connected");
            return Ok(());
        }
        // Clone out of the guard; the lock must not be held across the
        // write or a hung transport blocks the lifecycle teardown.
        let link = {
            let guard = self.shared.link.read().await;
            guard
                .as_ref()
                .map(|link| (link.peripheral.clone(), link.characteristic.clone()))
        };
        let Some((peripheral, characteristic)) = link else {
            debug!("Dropping update while not connected");
            return Ok(());
        };

        let payload = self.codec.encode(message)?;
        if payload.len() > self.config.mtu {
            warn!(
                "Update of {} bytes exceeds MTU {}; transport may truncate",
                payload.len(),
                self.config.mtu
            );
        }

        peripheral
            .write(&characteristic, &payload, WriteType::WithoutResponse)
            .await
            .map_err(|e| BleTopicError::WriteFailed(e.to_string()))
    }

    /// Stop the lifecycle task, disconnecting first if connected.
    /// Idempotent and safe to call from any state.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(lifecycle) = self.lifecycle.take() {
            if let Err(e) = lifecycle.await {
                debug!("Connection task join error: {e}");
            }
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                debug!("Reader task join error: {e}");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Lifecycle Task
// ----------------------------------------------------------------------------

struct ConnectionTask {
    adapter: Adapter,
    config: BleTopicConfig,
    device_name: String,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    shared: Arc<Shared>,
    raw_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(self) {
        loop {
            self.set_state(ConnectionState::Scanning).await;
            info!("Looking for BLE topic server: {}", self.device_name);
            let Some(peripheral) = self.find_peripheral().await else {
                break; // shutdown requested mid-scan
            };

            self.set_state(ConnectionState::Connecting).await;
            info!("Attempting connection: {:?}", peripheral.id());
            let established =
                until_shutdown(&self.shutdown_rx, self.establish(&peripheral)).await;
            let (characteristic, mut relay) = match established {
                Some(Ok(link)) => link,
                Some(Err(e)) => {
                    warn!("Failed to reach {}: {e}; rescanning", self.device_name);
                    self.teardown(&peripheral, None).await;
                    self.set_state(ConnectionState::Idle).await;
                    continue;
                }
                None => {
                    // Shutdown landed mid-handshake.
                    self.teardown(&peripheral, None).await;
                    break;
                }
            };

            *self.shared.link.write().await = Some(Link {
                peripheral: peripheral.clone(),
                characteristic: characteristic.clone(),
            });
            self.set_state(ConnectionState::Connected).await;
            info!("Connected to BLE topic server: {}", self.device_name);

            let stop = self.wait_disconnected(&peripheral, &mut relay).await;

            // Cleanup runs on every path out of Connected, shutdown included.
            self.set_state(ConnectionState::Disconnecting).await;
            *self.shared.link.write().await = None;
            self.teardown(&peripheral, Some(&characteristic)).await;
            // The relay ends with its notification stream; abort covers
            // a transport that never closes it.
            relay.abort();
            self.set_state(ConnectionState::Idle).await;

            if stop {
                break;
            }
            info!("Disconnected from {}; rescanning", self.device_name);
        }
        self.set_state(ConnectionState::Idle).await;
        debug!("Connection lifecycle task finished");
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().await = state;
    }

    /// Scan until the server shows up. Each attempt is bounded by the
    /// configured scan timeout; the loop itself never gives up, so a
    /// server that restarts later is still found. Returns `None` only
    /// on shutdown.
    async fn find_peripheral(&self) -> Option<Peripheral> {
        let filter = ScanFilter {
            services: vec![self.service_uuid],
        };
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Err(e) = self.adapter.start_scan(filter.clone()).await {
                warn!("Failed to start BLE scan: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.scan_timeout) => continue,
                    _ = shutdown.wait_for(|stop| *stop) => return None,
                }
            }
            let found = tokio::select! {
                found = self.scan_attempt() => found,
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    let _ = self.adapter.stop_scan().await;
                    return None;
                }
            };
            let _ = self.adapter.stop_scan().await;
            match found {
                Some(peripheral) => return Some(peripheral),
                None => info!("Still looking for BLE topic server: {}", self.device_name),
            }
        }
    }

    /// One bounded scan attempt over the adapter's event stream.
    async fn scan_attempt(&self) -> Option<Peripheral> {
        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to get BLE events: {e}");
                // Same pacing as a failed start_scan; a broken adapter
                // must not spin the scan loop. Cancellable through the
                // caller's shutdown race.
                tokio::time::sleep(self.config.scan_timeout).await;
                return None;
            }
        };
        let deadline = tokio::time::sleep(self.config.scan_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return None,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => {
                        if let Some(peripheral) = self.match_device(&id).await {
                            return Some(peripheral);
                        }
                    }
                    Some(_) => {}
                    None => return None,
                },
            }
        }
    }

    async fn match_device(&self, id: &PeripheralId) -> Option<Peripheral> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        if properties.local_name.as_deref() == Some(self.device_name.as_str()) {
            debug!("Matched topic server {} at {:?}", self.device_name, id);
            return Some(peripheral);
        }
        None
    }

    /// Connect with bounded retries, then discover the characteristic
    /// and subscribe. Any failure sends the caller back to a fresh
    /// scan.
    async fn establish(&self, peripheral: &Peripheral) -> Result<(Characteristic, JoinHandle<()>)> {
        let connected = connect_with_retries(
            self.config.connect_retries,
            self.config.connection_timeout,
            || peripheral.connect(),
        )
        .await;
        if !connected {
            return Err(BleTopicError::ConnectionFailed(format!(
                "{} unreachable after {} attempts",
                self.device_name, self.config.connect_retries
            )));
        }
        self.subscribe(peripheral).await
    }

    /// Discover the derived characteristic, subscribe to notifications
    /// and spawn the relay that feeds the inbound queue. The relay ends
    /// by itself when the notification stream closes on disconnect.
    async fn subscribe(&self, peripheral: &Peripheral) -> Result<(Characteristic, JoinHandle<()>)> {
        peripheral
            .discover_services()
            .await
            .map_err(|e| BleTopicError::ServiceDiscoveryFailed(e.to_string()))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == self.characteristic_uuid)
            .ok_or_else(|| BleTopicError::CharacteristicNotFound {
                characteristic: self.characteristic_uuid.to_string(),
            })?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| BleTopicError::SubscriptionFailed(e.to_string()))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| BleTopicError::NotificationStreamFailed(e.to_string()))?;

        let raw_tx = self.raw_tx.clone();
        let characteristic_uuid = self.characteristic_uuid;
        let relay = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic_uuid
                    && raw_tx.send(notification.value).is_err()
                {
                    break;
                }
            }
            debug!("Notification relay ended");
        });

        Ok((characteristic, relay))
    }

    /// Block until the connection ends or shutdown is requested.
    /// Returns true on shutdown. Two signals count as a disconnect: a
    /// `DeviceDisconnected` adapter event for this peripheral, and the
    /// notification relay ending, since the transport closes the
    /// notification stream on disconnect whether or not the event was
    /// seen.
    async fn wait_disconnected(&self, peripheral: &Peripheral, relay: &mut JoinHandle<()>) -> bool {
        let shutdown = self.shutdown_rx.clone();
        let id = peripheral.id();
        let events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to get BLE events: {e}");
                // The relay ending is the only disconnect signal left.
                let mut shutdown = shutdown;
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => return true,
                    _ = &mut *relay => return false,
                }
            }
        };
        let disconnects = events.filter_map(|event| async move {
            match event {
                CentralEvent::DeviceDisconnected(id) => Some(id),
                _ => None,
            }
        });
        let stop = await_disconnect(shutdown, relay, Box::pin(disconnects), id).await;
        if !stop {
            info!("Unsolicited disconnect from {}", self.device_name);
        }
        stop
    }

    /// Cleanup that runs on every exit path: stop notifications and
    /// close the connection before state is cleared.
    async fn teardown(&self, peripheral: &Peripheral, characteristic: Option<&Characteristic>) {
        if peripheral.is_connected().await.unwrap_or(false) {
            if let Some(characteristic) = characteristic {
                if let Err(e) = peripheral.unsubscribe(characteristic).await {
                    debug!("Failed to stop notifications: {e}");
                }
            }
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect cleanly: {e}");
            }
        }
    }
}

/// Run `task` to completion unless shutdown is requested first.
/// `None` means shutdown won; the partial work is dropped.
async fn until_shutdown<F: Future>(shutdown: &watch::Receiver<bool>, task: F) -> Option<F::Output> {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        output = task => Some(output),
        _ = shutdown.wait_for(|stop| *stop) => None,
    }
}

/// Wait for the first of: shutdown (true), the relay task ending, a
/// disconnect for `id`, or the event stream closing (all false).
/// Disconnects for other peripherals are ignored.
async fn await_disconnect<I, S>(
    mut shutdown: watch::Receiver<bool>,
    relay: &mut JoinHandle<()>,
    mut disconnects: S,
    id: I,
) -> bool
where
    I: PartialEq,
    S: Stream<Item = I> + Unpin,
{
    // Fused: a foreign disconnect loops back here, and a finished
    // relay must not be polled again.
    let mut relay = (&mut *relay).fuse();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return true,
            _ = &mut relay => {
                debug!("Notification stream closed");
                return false;
            }
            event = disconnects.next() => match event {
                Some(other) if other == id => return false,
                Some(_) => {}
                None => return false,
            },
        }
    }
}

/// Drive `attempt` at most `retries` times, each bounded by
/// `per_attempt`. No back-off between attempts; the caller falls back
/// to a fresh scan once the budget is spent.
async fn connect_with_retries<F, Fut, E>(retries: u32, per_attempt: Duration, mut attempt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: Display,
{
    for retry in 1..=retries {
        match timeout(per_attempt, attempt()).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => warn!("Connection attempt {retry}/{retries} failed: {e}"),
            Err(_) => warn!("Connection attempt {retry}/{retries} timed out"),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawCodec;

    #[tokio::test]
    async fn test_retry_budget_is_exhausted_exactly() {
        let mut attempts = 0u32;
        let connected = connect_with_retries(3, Duration::from_millis(50), || {
            attempts += 1;
            async { Err::<(), _>("refused") }
        })
        .await;
        assert!(!connected);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_first_success() {
        let mut attempts = 0u32;
        let connected = connect_with_retries(3, Duration::from_millis(50), || {
            attempts += 1;
            let outcome = if attempts == 1 { Err("refused") } else { Ok(()) };
            async move { outcome }
        })
        .await;
        assert!(connected);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_hung_attempts_count_against_the_budget() {
        let mut attempts = 0u32;
        let connected = connect_with_retries(2, Duration::from_millis(10), || {
            attempts += 1;
            std::future::pending::<std::result::Result<(), &str>>()
        })
        .await;
        assert!(!connected);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_zero_retries_never_attempts() {
        let mut attempts = 0u32;
        let connected = connect_with_retries(0, Duration::from_millis(10), || {
            attempts += 1;
            async { Ok::<(), &str>(()) }
        })
        .await;
        assert!(!connected);
        assert_eq!(attempts, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_a_hung_handshake() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wait = tokio::spawn(async move {
            until_shutdown(&shutdown_rx, std::future::pending::<()>()).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();
        assert!(wait.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handshake_completes_when_no_shutdown_arrives() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert_eq!(until_shutdown(&shutdown_rx, async { 42 }).await, Some(42));
    }

    #[tokio::test]
    async fn test_relay_end_counts_as_disconnect() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut relay = tokio::spawn(async {});
        let stop =
            await_disconnect(shutdown_rx, &mut relay, futures::stream::pending::<u32>(), 7).await;
        assert!(!stop);
    }

    #[tokio::test]
    async fn test_matching_disconnect_event_ends_the_wait() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut relay = tokio::spawn(std::future::pending::<()>());
        let stop =
            await_disconnect(shutdown_rx, &mut relay, futures::stream::iter([3u32, 7]), 7).await;
        assert!(!stop);
        relay.abort();
    }

    #[tokio::test]
    async fn test_foreign_disconnects_are_ignored_until_stream_close() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut relay = tokio::spawn(std::future::pending::<()>());
        let stop =
            await_disconnect(shutdown_rx, &mut relay, futures::stream::iter([1u32, 2, 3]), 7).await;
        // Foreign ids pass by; the stream closing is itself terminal.
        assert!(!stop);
        relay.abort();
    }

    #[tokio::test]
    async fn test_shutdown_wins_over_a_quiet_link() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        let mut relay = tokio::spawn(std::future::pending::<()>());
        let stop =
            await_disconnect(shutdown_rx, &mut relay, futures::stream::pending::<u32>(), 7).await;
        assert!(stop);
        relay.abort();
    }

    #[tokio::test]
    async fn test_update_without_link_releases_the_lock_and_drops() {
        let client = BleTopicClient::new("counter", BleTopicConfig::default(), RawCodec);
        *client.shared.state.write().await = ConnectionState::Connected;

        client.update(&vec![1, 2, 3]).await.unwrap();
        // The link lock must be free again as soon as update returns.
        assert!(client.shared.link.try_write().is_ok());
    }

    #[tokio::test]
    async fn test_update_while_disconnected_is_silently_dropped() {
        let client = BleTopicClient::new("counter", BleTopicConfig::default(), RawCodec);
        assert_eq!(client.state().await, ConnectionState::Idle);
        // No transport exists yet, so a write must be a quiet no-op.
        client.update(&vec![0, 0, 0, 42]).await.unwrap();
    }

    #[tokio::test]
    async fn test_incoming_requires_start() {
        let mut client = BleTopicClient::new("counter", BleTopicConfig::default(), RawCodec);
        assert!(matches!(
            client.take_incoming(),
            Err(BleTopicError::NotStarted)
        ));
    }
}
