//! Length-prefixed binary frame transport over subprocess stdio (spec §4.A).
//!
//! Wire format: `[length: u32 big-endian][payload: length bytes]`. The
//! reader side is event-driven (a [`tokio::sync::Notify`] pairs with the
//! underlying async read, the same role the teacher's `tokio::select!` pumps
//! in `driver_zeromq.rs` play over a ZeroMQ socket) rather than polled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{trace, warn};

/// Transport-layer failure. A terminal error here always means the peer is
/// gone; the [`crate::session::Session`] maps it to a `worker_crash` error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {size} bytes exceeds the configured limit of {limit} bytes")]
    FrameTooLarge { size: u32, limit: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads length-prefixed frames from an async byte stream.
///
/// Exposes `receive()` returning the next complete payload. There is no
/// separate condition-variable API at this layer: `receive()` itself
/// suspends the calling task until bytes are available, which is tokio's
/// native event-driven equivalent of the condvar-signaled reader described
/// in the frame transport's contract. [`FrameReader::closed`] lets other
/// tasks observe peer loss without racing a second reader against the sole
/// owner, preserving the single-reader invariant (spec §4.F).
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: u32,
    closed: Arc<AtomicBool>,
}

impl<R: AsyncReadExt + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            max_frame_bytes: max_frame_bytes as u32,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cheap, clonable flag flipped once this reader observes peer
    /// disconnect. Lets the session mark itself down without a second task
    /// touching the stream.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    /// Read the next complete frame payload, or an error on short read /
    /// oversize / peer disconnect.
    pub async fn receive(&mut self) -> Result<Vec<u8>, Error> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(Error::Closed);
            }
            Err(err) => return Err(Error::Io(err)),
        };

        if len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: len,
                limit: self.max_frame_bytes,
            });
        }

        let mut payload = vec![0u8; len as usize];
        if let Err(err) = self.inner.read_exact(&mut payload).await {
            self.closed.store(true, Ordering::SeqCst);
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(Error::Closed);
            }
            return Err(Error::Io(err));
        }

        trace!(bytes = payload.len(), "received frame");
        Ok(payload)
    }
}

/// Writes length-prefixed frames to an async byte stream.
///
/// `send()` serializes the frame under an async lock so concurrent
/// producers (the Session's own writes plus, in the worker, heartbeats
/// interleaved with Output/Result frames) cannot interleave their bytes.
#[derive(Clone)]
pub struct FrameWriter<W> {
    inner: Arc<Mutex<W>>,
    max_frame_bytes: u32,
}

impl<W: AsyncWriteExt + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            max_frame_bytes: max_frame_bytes as u32,
        }
    }

    /// Write one frame atomically with respect to other `send()` callers.
    pub async fn send(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() as u64 > self.max_frame_bytes as u64 {
            return Err(Error::FrameTooLarge {
                size: payload.len() as u32,
                limit: self.max_frame_bytes,
            });
        }

        let mut guard = self.inner.lock().await;
        guard.write_u32(payload.len() as u32).await?;
        if !payload.is_empty() {
            guard.write_all(payload).await?;
        }
        guard.flush().await?;
        Ok(())
    }
}

/// Encode an [`crate::message::Envelope`] and write it as one frame.
pub async fn send_envelope<W: AsyncWriteExt + Unpin>(
    writer: &FrameWriter<W>,
    envelope: &crate::message::Envelope,
) -> Result<(), Error> {
    let bytes = crate::message::codec::encode(envelope).map_err(|err| {
        warn!(error = %err, "failed to encode outgoing envelope");
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    })?;
    writer.send(&bytes).await
}

/// Read the next frame and decode it as an [`crate::message::Envelope`].
/// A payload that fails to decode is a protocol violation, not a transport
/// error, and is returned as `Ok(None)` so the caller can log-and-drop per
/// the message layer's compatibility rule rather than tearing down the
/// transport.
pub async fn receive_envelope<R: AsyncReadExt + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<Option<crate::message::Envelope>, Error> {
    let payload = reader.receive().await?;
    match crate::message::codec::decode(&payload) {
        Ok(envelope) => Ok(Some(envelope)),
        Err(err) => {
            warn!(error = %err, "dropping undecodable frame");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, Envelope};

    #[tokio::test]
    async fn round_trips_an_envelope_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, server_tx) = tokio::io::split(server);

        let writer = FrameWriter::new(client_tx, 1024 * 1024);
        let mut reader = FrameReader::new(server_rx, 1024 * 1024);
        let _unused_pair = (client_rx, server_tx);

        let envelope = Envelope::new(Body::Heartbeat);
        send_envelope(&writer, &envelope).await.unwrap();

        let received = receive_envelope(&mut reader).await.unwrap().unwrap();
        assert_eq!(received.header.id, envelope.header.id);
        assert!(matches!(received.body, Body::Heartbeat));
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_before_reading_payload() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 8);

        tx.write_u32(64).await.unwrap();
        tx.write_all(&[0u8; 64]).await.unwrap();

        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn closed_peer_surfaces_as_closed_error() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = FrameReader::new(rx, 1024);
        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
