//! Server- and client-side handshakes over an arbitrary async byte stream.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    client_auth_proof, random_nonce, session_key, verify_client_auth, AuthKey, SessionKey,
    AUTH_PROOF_LEN, HANDSHAKE_OK, MAGIC, NONCE_LEN,
};

/// Bytes a client sends to open a session: magic, nonce, proof.
pub const CLIENT_HELLO_LEN: usize = MAGIC.len() + NONCE_LEN + AUTH_PROOF_LEN;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid password")]
    InvalidPassword,

    #[error("server rejected the handshake")]
    Rejected,
}

/// Run the server side of the handshake.
///
/// The caller has already consumed the 5-byte magic while sniffing the
/// connection; this reads the remaining `clientNonce | clientAuth`, verifies
/// the proof in constant time, and on success sends `"OK\x00" | serverNonce`
/// and returns the session key. On `InvalidPassword` nothing has been
/// written: the caller owns the plaintext 401 reply.
pub async fn server_handshake<S>(stream: &mut S, key: &AuthKey) -> Result<SessionKey, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rest = [0u8; NONCE_LEN + AUTH_PROOF_LEN];
    stream.read_exact(&mut rest).await?;
    let mut client_nonce = [0u8; NONCE_LEN];
    client_nonce.copy_from_slice(&rest[..NONCE_LEN]);
    let proof = &rest[NONCE_LEN..];

    if !verify_client_auth(key, &client_nonce, proof) {
        return Err(HandshakeError::InvalidPassword);
    }

    let server_nonce = random_nonce()?;
    let mut reply = Vec::with_capacity(HANDSHAKE_OK.len() + NONCE_LEN);
    reply.extend_from_slice(HANDSHAKE_OK);
    reply.extend_from_slice(&server_nonce);
    stream.write_all(&reply).await?;

    Ok(session_key(key, &server_nonce, &client_nonce))
}

/// Run the client side of the handshake (used by tests and feeders). Writes
/// the full hello including the magic.
pub async fn client_handshake<S>(stream: &mut S, key: &AuthKey) -> Result<SessionKey, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_nonce = random_nonce()?;
    let proof = client_auth_proof(key, &client_nonce);

    let mut hello = Vec::with_capacity(CLIENT_HELLO_LEN);
    hello.extend_from_slice(MAGIC);
    hello.extend_from_slice(&client_nonce);
    hello.extend_from_slice(&proof);
    stream.write_all(&hello).await?;

    let mut ok = [0u8; HANDSHAKE_OK.len()];
    match stream.read_exact(&mut ok).await {
        Ok(_) if ok == *HANDSHAKE_OK => {}
        Ok(_) => return Err(HandshakeError::Rejected),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(HandshakeError::Rejected)
        }
        Err(e) => return Err(e.into()),
    }
    let mut server_nonce = [0u8; NONCE_LEN];
    stream.read_exact(&mut server_nonce).await?;

    Ok(session_key(key, &server_nonce, &client_nonce))
}
