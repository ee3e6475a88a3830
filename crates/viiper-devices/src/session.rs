//! The feeder-stream contract between the control plane and a device.
//!
//! Once the control server has routed `bus/{busId}/{deviceId}` and claimed
//! the device's feeder slot, it hands the two halves of the connection to the
//! device's [`FeederSession`]. The session installs an output sink on its
//! device, then pumps input frames and output events until EOF or an I/O
//! error; returning re-arms the device's idle timer.

use async_trait::async_trait;
use std::io;

/// Reading half of a feeder stream (plain or encrypted).
#[async_trait]
pub trait FeederReader: Send {
    /// Fill `buf` completely. EOF before the first byte surfaces as
    /// `UnexpectedEof`, which sessions treat as a clean detach.
    async fn read_frame_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// Writing half of a feeder stream.
#[async_trait]
pub trait FeederWriter: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// A per-device-type stream handler. One session runs per attached feeder;
/// the bus layer guarantees at most one per device.
#[async_trait]
pub trait FeederSession: Send + Sync {
    /// Own the stream until the feeder goes away. A clean EOF returns
    /// `Ok(())`; transport errors are returned for the server to log.
    async fn run(
        &self,
        reader: &mut (dyn FeederReader + '_),
        writer: &mut (dyn FeederWriter + '_),
    ) -> io::Result<()>;
}

/// Classify a read result: `Ok(None)` for clean EOF, `Ok(Some(()))` when the
/// frame arrived, `Err` otherwise.
pub(crate) async fn read_or_eof(
    reader: &mut (dyn FeederReader + '_),
    buf: &mut [u8],
) -> io::Result<Option<()>> {
    match reader.read_frame_exact(buf).await {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Adapter exposing any async byte stream's read half as a [`FeederReader`];
/// used by in-process feeders and tests. The control server supplies its own
/// implementation that spans plaintext and encrypted connections.
pub struct IoFeederReader<R>(pub R);

#[async_trait]
impl<R: tokio::io::AsyncRead + Unpin + Send> FeederReader for IoFeederReader<R> {
    async fn read_frame_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        use tokio::io::AsyncReadExt;
        self.0.read_exact(buf).await.map(|_| ())
    }
}

/// Writing-half counterpart of [`IoFeederReader`].
pub struct IoFeederWriter<W>(pub W);

#[async_trait]
impl<W: tokio::io::AsyncWrite + Unpin + Send> FeederWriter for IoFeederWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.0.write_all(frame).await
    }
}
