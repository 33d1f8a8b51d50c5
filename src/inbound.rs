//! Inbound hand-off queue between BLE callbacks and the application
//!
//! BLE write callbacks and notification streams must never block, so
//! raw frames land on an unbounded channel and a dedicated reader task
//! decodes and republishes them one at a time, preserving arrival
//! order. If the consumer stalls while a producer keeps writing, the
//! queue grows without bound; that trade-off is deliberate.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::Codec;

/// Create the raw-frame hand-off pair.
pub(crate) fn channel() -> (
    mpsc::UnboundedSender<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
) {
    mpsc::unbounded_channel()
}

/// Spawn the reader task that drains raw frames, decodes each via the
/// codec and forwards the result to the application boundary in FIFO
/// order. A frame that fails to decode is logged and dropped whole; a
/// consumer never sees a partial message. The task ends when either
/// side of the pipeline is dropped.
pub(crate) fn spawn_decode_loop<C>(
    codec: Arc<C>,
    mut raw_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    delivered_tx: mpsc::UnboundedSender<C::Message>,
) -> JoinHandle<()>
where
    C: Codec + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = raw_rx.recv().await {
            match codec.decode(&frame) {
                Ok(message) => {
                    if delivered_tx.send(message).is_err() {
                        debug!("Incoming receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Dropping undecodable frame of {} bytes: {}", frame.len(), e);
                }
            }
        }
        debug!("Inbound reader task finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawCodec;

    #[tokio::test]
    async fn test_fifo_order_is_preserved_under_burst() {
        let (raw_tx, raw_rx) = channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let reader = spawn_decode_loop(Arc::new(RawCodec), raw_rx, out_tx);

        for i in 0u32..512 {
            raw_tx.send(i.to_be_bytes().to_vec()).unwrap();
        }
        drop(raw_tx);

        for i in 0u32..512 {
            let frame = out_rx.recv().await.expect("frame missing");
            assert_eq!(frame, i.to_be_bytes().to_vec());
        }
        assert!(out_rx.recv().await.is_none());
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped_whole() {
        use crate::codec::BincodeCodec;

        let (raw_tx, raw_rx) = channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let reader = spawn_decode_loop(Arc::new(BincodeCodec::<u32>::new()), raw_rx, out_tx);

        raw_tx.send(7u32.to_le_bytes().to_vec()).unwrap();
        raw_tx.send(vec![0xFF]).unwrap(); // too short for a u32
        raw_tx.send(9u32.to_le_bytes().to_vec()).unwrap();
        drop(raw_tx);

        assert_eq!(out_rx.recv().await, Some(7));
        assert_eq!(out_rx.recv().await, Some(9));
        assert!(out_rx.recv().await.is_none());
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_stops_when_consumer_goes_away() {
        let (raw_tx, raw_rx) = channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let reader = spawn_decode_loop(Arc::new(RawCodec), raw_rx, out_tx);

        drop(out_rx);
        raw_tx.send(vec![1, 2, 3]).unwrap();
        reader.await.unwrap();
    }
}
