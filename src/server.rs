//! Peripheral-role topic adapter (Linux/BlueZ)
//!
//! `BleTopicServer` registers one GATT service and one characteristic
//! derived from the topic name, advertises under the topic so centrals
//! can find it, and bridges the characteristic to the application:
//! remote writes land on the inbound queue, local broadcasts become
//! the characteristic value and a notification to every subscriber.

use std::sync::Arc;

use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{enforce_mtu, Codec};
use crate::config::BleTopicConfig;
use crate::error::{BleTopicError, Result};
use crate::inbound;
use crate::topic;

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

/// Handles owned for the lifetime of a started server. Dropping them
/// stops advertising and unregisters the GATT application.
struct Started {
    _adv: AdvertisementHandle,
    _app: ApplicationHandle,
    _session: bluer::Session,
}

/// Serves one topic as a BLE peripheral.
pub struct BleTopicServer<C: Codec> {
    config: BleTopicConfig,
    topic: String,
    codec: Arc<C>,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    /// Last broadcast or remotely written payload; what read requests see.
    value: Arc<Mutex<Vec<u8>>>,
    /// Fans published payloads out to every live notify session.
    notify_tx: broadcast::Sender<Vec<u8>>,
    incoming_rx: Option<mpsc::UnboundedReceiver<C::Message>>,
    reader: Option<JoinHandle<()>>,
    started: Option<Started>,
}

impl<C: Codec + 'static> BleTopicServer<C> {
    pub fn new(topic: &str, config: BleTopicConfig, codec: C) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            config,
            topic: topic.to_string(),
            codec: Arc::new(codec),
            service_uuid: topic::service_uuid(topic),
            characteristic_uuid: topic::characteristic_uuid(topic),
            value: Arc::new(Mutex::new(Vec::new())),
            notify_tx,
            incoming_rx: None,
            reader: None,
            started: None,
        }
    }

    /// UUID of the registered GATT service.
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// UUID of the registered GATT characteristic.
    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    /// Register the GATT service and begin advertising.
    ///
    /// Fails with `TransportUnavailable` when the host exposes no
    /// BlueZ peripheral role. Calling `start` on a running server is a
    /// no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.started.is_some() {
            return Ok(());
        }

        let session = bluer::Session::new().await.map_err(|e| {
            BleTopicError::TransportUnavailable(format!("BlueZ session: {e}"))
        })?;
        let adapter = session.default_adapter().await.map_err(|e| {
            BleTopicError::TransportUnavailable(format!("BLE adapter: {e}"))
        })?;
        if !adapter.is_powered().await.unwrap_or(false) {
            adapter.set_powered(true).await.map_err(|e| {
                BleTopicError::TransportUnavailable(format!("power on adapter: {e}"))
            })?;
        }

        let (raw_tx, raw_rx) = inbound::channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        self.incoming_rx = Some(delivered_rx);
        self.reader = Some(inbound::spawn_decode_loop(
            self.codec.clone(),
            raw_rx,
            delivered_tx,
        ));

        let value_read = self.value.clone();
        let value_write = self.value.clone();
        let notify_tx = self.notify_tx.clone();

        let app = Application {
            services: vec![Service {
                uuid: self.service_uuid,
                primary: true,
                characteristics: vec![Characteristic {
                    uuid: self.characteristic_uuid,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(move |_req| {
                            let value = value_read.clone();
                            Box::pin(async move { Ok(value.lock().await.clone()) })
                        }),
                        ..Default::default()
                    }),
                    write: Some(CharacteristicWrite {
                        write: true,
                        write_without_response: true,
                        method: CharacteristicWriteMethod::Fun(Box::new(
                            move |new_value, _req| {
                                let value = value_write.clone();
                                let raw_tx = raw_tx.clone();
                                Box::pin(async move {
                                    debug!(
                                        "Write request of {} bytes: {}",
                                        new_value.len(),
                                        hex::encode(&new_value)
                                    );
                                    *value.lock().await = new_value.clone();
                                    // The push must never block the BLE callback.
                                    let _ = raw_tx.send(new_value);
                                    Ok(())
                                })
                            },
                        )),
                        ..Default::default()
                    }),
                    notify: Some(CharacteristicNotify {
                        notify: true,
                        indicate: true,
                        method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                            let mut updates = notify_tx.subscribe();
                            Box::pin(async move {
                                tokio::spawn(async move {
                                    loop {
                                        match updates.recv().await {
                                            Ok(payload) => {
                                                if let Err(e) = notifier.notify(payload).await {
                                                    debug!("Notify session ended: {e}");
                                                    break;
                                                }
                                            }
                                            Err(RecvError::Lagged(skipped)) => {
                                                warn!(
                                                    "Notify session lagging; skipped {skipped} updates"
                                                );
                                            }
                                            Err(RecvError::Closed) => break,
                                        }
                                    }
                                });
                            })
                        })),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let app_handle = adapter.serve_gatt_application(app).await.map_err(|e| {
            BleTopicError::TransportUnavailable(format!("register GATT service: {e}"))
        })?;

        let advertisement = Advertisement {
            advertisement_type: Type::Peripheral,
            service_uuids: vec![self.service_uuid].into_iter().collect(),
            local_name: Some(self.topic.clone()),
            discoverable: Some(true),
            ..Default::default()
        };
        let adv_handle = adapter.advertise(advertisement).await.map_err(|e| {
            BleTopicError::TransportUnavailable(format!("start advertising: {e}"))
        })?;

        self.started = Some(Started {
            _adv: adv_handle,
            _app: app_handle,
            _session: session,
        });
        info!("Advertising BLE topic server: {}", self.topic);
        Ok(())
    }

    /// Publish a message to every subscribed central.
    ///
    /// The encoded payload is checked against the configured MTU bound
    /// first: under the default `Reject` policy an oversized message
    /// fails with `MessageTooLarge`; under `Truncate` it is cut down
    /// with a warning. The payload then becomes the characteristic
    /// value (served to read requests) and is pushed to every live
    /// notify session.
    pub async fn broadcast(&self, message: &C::Message) -> Result<()> {
        if self.started.is_none() {
            return Err(BleTopicError::NotStarted);
        }
        let payload = self.codec.encode(message)?;
        let payload = enforce_mtu(payload, self.config.mtu, self.config.oversize_policy)?;

        *self.value.lock().await = payload.clone();
        // No live subscribers is fine; the value still serves reads.
        let _ = self.notify_tx.send(payload);
        Ok(())
    }

    /// Take the stream of decoded messages written by remote centrals.
    /// May be taken once, after `start`. The underlying queue is
    /// unbounded so the write callback never blocks; a stalled consumer
    /// lets it grow.
    pub fn take_incoming(&mut self) -> Result<mpsc::UnboundedReceiver<C::Message>> {
        if self.started.is_none() {
            return Err(BleTopicError::NotStarted);
        }
        self.incoming_rx.take().ok_or(BleTopicError::IncomingAlreadyTaken)
    }

    /// The current characteristic value, as a read request would see it.
    pub async fn current_value(&self) -> Vec<u8> {
        self.value.lock().await.clone()
    }

    /// Stop advertising and release the service. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(started) = self.started.take() {
            drop(started);
            info!("BLE topic server stopped: {}", self.topic);
        }
        if let Some(reader) = self.reader.take() {
            // The reader drains and exits once the GATT write callback
            // (the last raw sender) is gone.
            if let Err(e) = reader.await {
                debug!("Reader task join error: {e}");
            }
        }
    }
}
