//! Control-plane connection halves, uniform over plaintext TCP and the
//! encrypted framing.
//!
//! The reader buffers internally: bytes that arrive after a request's NUL
//! terminator (a feeder pipelining its first frames) stay buffered and are
//! handed to the stream session. On the encrypted path one logical write
//! becomes one sealed record, and received records are drained through the
//! same buffer.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use viiper_auth::{ChannelError, SecureReader, SecureWriter};
use viiper_devices::{FeederReader, FeederWriter};

/// Requests larger than this (before the NUL) are refused with a 400.
pub(crate) const MAX_REQUEST_LEN: usize = 64 * 1024;

/// How reading a request frame can fail. Oversize gets a problem reply;
/// everything else (including a record that failed decryption) terminates
/// the connection without one.
pub(crate) enum RequestError {
    TooLarge,
    Io(io::Error),
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> RequestError {
        RequestError::Io(e)
    }
}

fn channel_to_io(err: ChannelError) -> io::Error {
    match err {
        ChannelError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

enum ReadSource {
    Plain(OwnedReadHalf),
    Secure(SecureReader<OwnedReadHalf>),
}

pub(crate) struct ControlReader {
    source: ReadSource,
    buf: Vec<u8>,
    pos: usize,
}

impl ControlReader {
    pub(crate) fn plain(half: OwnedReadHalf, carried: Vec<u8>) -> ControlReader {
        ControlReader {
            source: ReadSource::Plain(half),
            buf: carried,
            pos: 0,
        }
    }

    pub(crate) fn secure(inner: SecureReader<OwnedReadHalf>) -> ControlReader {
        ControlReader {
            source: ReadSource::Secure(inner),
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    /// Pull more bytes into the buffer; returns how many arrived (0 = EOF).
    async fn fill(&mut self) -> io::Result<usize> {
        match &mut self.source {
            ReadSource::Plain(half) => {
                let mut chunk = [0u8; 4096];
                let n = half.read(&mut chunk).await?;
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            ReadSource::Secure(reader) => match reader.read_frame().await {
                Ok(Some(frame)) => {
                    let n = frame.len();
                    self.buf.extend_from_slice(&frame);
                    Ok(n)
                }
                Ok(None) => Ok(0),
                Err(e) => Err(channel_to_io(e)),
            },
        }
    }

    /// Read one `<request>\x00` frame, returning the bytes before the NUL.
    /// `Ok(None)` means the peer closed (either cleanly or mid-request).
    pub(crate) async fn read_until_nul(&mut self) -> Result<Option<Vec<u8>>, RequestError> {
        loop {
            if let Some(at) = self.buffered().iter().position(|&b| b == 0) {
                let frame = self.buffered()[..at].to_vec();
                self.consume(at + 1);
                return Ok(Some(frame));
            }
            if self.buffered().len() > MAX_REQUEST_LEN {
                return Err(RequestError::TooLarge);
            }
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Discard input up to and including the next NUL (or EOF, or `cap`
    /// bytes). Used before answering a refused request, so the peer never
    /// sees its reply destroyed by a reset over unread bytes.
    pub(crate) async fn discard_until_nul(&mut self, cap: usize) -> io::Result<()> {
        let mut discarded = 0;
        loop {
            if let Some(at) = self.buffered().iter().position(|&b| b == 0) {
                self.consume(at + 1);
                return Ok(());
            }
            discarded += self.buffered().len();
            let len = self.buffered().len();
            self.consume(len);
            if discarded >= cap || self.fill().await? == 0 {
                return Ok(());
            }
        }
    }

    pub(crate) async fn read_exact_buf(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut copied = 0;
        while copied < out.len() {
            let available = self.buffered();
            if available.is_empty() {
                if self.fill().await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                continue;
            }
            let take = available.len().min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&available[..take]);
            self.consume(take);
            copied += take;
        }
        Ok(())
    }
}

pub(crate) enum ControlWriter {
    Plain(OwnedWriteHalf),
    Secure(SecureWriter<OwnedWriteHalf>),
}

impl ControlWriter {
    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            ControlWriter::Plain(half) => half.write_all(bytes).await,
            ControlWriter::Secure(writer) => {
                writer.write_frame(bytes).await.map_err(channel_to_io)
            }
        }
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            ControlWriter::Plain(half) => half.shutdown().await,
            ControlWriter::Secure(writer) => writer.shutdown().await,
        }
    }
}

#[async_trait]
impl FeederReader for ControlReader {
    async fn read_frame_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact_buf(buf).await
    }
}

#[async_trait]
impl FeederWriter for ControlWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame).await
    }
}
