//! Framed encryption: `len:u32-be | nonce[12] | ciphertext`, one record per
//! logical write, with independent per-direction counters.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::SessionKey;

/// Records larger than this (nonce + ciphertext) are protocol violations.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the 2 MiB limit")]
    FrameTooLarge(usize),

    #[error("frame shorter than nonce and tag")]
    FrameTooShort,

    #[error("record nonce does not match the direction counter")]
    NonceMismatch,

    #[error("frame failed authentication")]
    AuthFailed,

    #[error("frame counter exhausted")]
    CounterExhausted,
}

fn aead_key(session: &SessionKey) -> LessSafeKey {
    let unbound =
        UnboundKey::new(&CHACHA20_POLY1305, session.as_bytes()).expect("chacha20 key length");
    LessSafeKey::new(unbound)
}

fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Seal one record: returns `len | nonce | ciphertext` ready for the wire.
pub fn seal_frame(
    session: &SessionKey,
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, ChannelError> {
    let body_len = NONCE_LEN + plaintext.len() + TAG_LEN;
    if body_len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(body_len));
    }
    let nonce_bytes = counter_nonce(counter);
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&nonce_bytes);

    let mut sealed = plaintext.to_vec();
    aead_key(session)
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut sealed,
        )
        .map_err(|_| ChannelError::AuthFailed)?;
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open one record body (`nonce | ciphertext`, the bytes after the length
/// prefix) against the expected direction counter.
pub fn open_frame(
    session: &SessionKey,
    counter: u64,
    body: &[u8],
) -> Result<Vec<u8>, ChannelError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(body.len()));
    }
    if body.len() < NONCE_LEN + TAG_LEN {
        return Err(ChannelError::FrameTooShort);
    }
    let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
    if nonce_bytes != counter_nonce(counter) {
        return Err(ChannelError::NonceMismatch);
    }
    let mut buf = ciphertext.to_vec();
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).expect("nonce length");
    let plaintext_len = aead_key(session)
        .open_in_place(nonce, Aad::empty(), &mut buf)
        .map_err(|_| ChannelError::AuthFailed)?
        .len();
    buf.truncate(plaintext_len);
    Ok(buf)
}

/// Writing half of an encrypted connection.
pub struct SecureWriter<W> {
    inner: W,
    session: SessionKey,
    counter: u64,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    pub fn new(inner: W, session: SessionKey) -> SecureWriter<W> {
        SecureWriter {
            inner,
            session,
            counter: 0,
        }
    }

    /// Seal and send one logical write.
    pub async fn write_frame(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        let record = seal_frame(&self.session, self.counter, plaintext)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(ChannelError::CounterExhausted)?;
        self.inner.write_all(&record).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Reading half of an encrypted connection.
pub struct SecureReader<R> {
    inner: R,
    session: SessionKey,
    counter: u64,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    pub fn new(inner: R, session: SessionKey) -> SecureReader<R> {
        SecureReader {
            inner,
            session,
            counter: 0,
        }
    }

    /// Read and open the next record. `Ok(None)` is a clean EOF on a record
    /// boundary; EOF inside a record is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        let plaintext = open_frame(&self.session, self.counter, &body)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(ChannelError::CounterExhausted)?;
        Ok(Some(plaintext))
    }
}
