//! The control-plane server: authentication gate, NUL-framed one-shot
//! requests and long-lived feeder streams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use viiper_auth::{server_handshake, HandshakeError, SecureReader, SecureWriter, MAGIC};
use viiper_bus::CancelScope;
use viiper_usbip_protocol::parse_request;

use crate::conn::{ControlReader, ControlWriter, RequestError, MAX_REQUEST_LEN};
use crate::handlers::{self, param_decimal, OneShot, StreamKind};
use crate::is_disconnect;
use crate::problem::Problem;
use crate::router::{Params, Router};
use crate::ServerState;

pub(crate) async fn serve(listener: TcpListener, state: Arc<ServerState>, shutdown: CancelScope) {
    let (one_shot, streams) = handlers::routers();
    let routes = Arc::new((one_shot, streams));
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => return,
        };
        match accepted {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, state, routes).await {
                        if is_disconnect(&e) {
                            info!(%peer, "control client disconnected");
                        } else {
                            warn!(%peer, error = %e, "control connection failed");
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "control accept failed");
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    routes: Arc<(Router<OneShot>, Router<StreamKind>)>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;

    // Sniff the first five bytes for the session magic. Consuming them is
    // fine either way: an encrypted session discards them by design, and a
    // plaintext request carries them over into the read buffer.
    let mut opening = [0u8; MAGIC.len()];
    match stream.read_exact(&mut opening).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e),
    }

    let (mut reader, mut writer) = if opening == *MAGIC {
        let Some(key) = &state.auth_key else {
            // Consume the rest of the hello (if the client sent one) so the
            // refusal is not clobbered by a reset over unread bytes.
            let mut rest = [0u8; viiper_auth::NONCE_LEN + viiper_auth::AUTH_PROOF_LEN];
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(250),
                stream.read_exact(&mut rest),
            )
            .await;
            let problem = Problem::bad_request("authentication is not enabled");
            stream.write_all(&problem.to_line()).await?;
            return Ok(());
        };
        match server_handshake(&mut stream, key).await {
            Ok(session) => {
                debug!(%peer, "authenticated session established");
                let (read_half, write_half) = stream.into_split();
                (
                    ControlReader::secure(SecureReader::new(read_half, session.clone())),
                    ControlWriter::Secure(SecureWriter::new(write_half, session)),
                )
            }
            Err(HandshakeError::InvalidPassword) => {
                info!(%peer, "authentication failed");
                let problem = Problem::unauthorized("invalid password");
                stream.write_all(&problem.to_line()).await?;
                return Ok(());
            }
            Err(HandshakeError::Io(e)) => return Err(e),
            Err(HandshakeError::Rejected) => return Ok(()),
        }
    } else {
        let (read_half, write_half) = stream.into_split();
        let mut reader = ControlReader::plain(read_half, opening.to_vec());
        let mut writer = ControlWriter::Plain(write_half);
        if state.requires_auth(&peer) {
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(250),
                reader.discard_until_nul(MAX_REQUEST_LEN),
            )
            .await;
            writer
                .write_all(&Problem::unauthorized("authentication required").to_line())
                .await?;
            return Ok(());
        }
        (reader, writer)
    };

    let frame = match reader.read_until_nul().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(RequestError::TooLarge) => {
            // Drain the rest of the oversized request (bounded) so the
            // refusal arrives before the close.
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                reader.discard_until_nul(16 * MAX_REQUEST_LEN),
            )
            .await;
            writer
                .write_all(&Problem::bad_request("request exceeds the 64 KiB limit").to_line())
                .await?;
            return Ok(());
        }
        // Includes records that failed decryption: protocol violation, no
        // reply.
        Err(RequestError::Io(e)) => return Err(e),
    };

    let request = match parse_request(&frame) {
        Ok(request) => request,
        Err(e) => {
            writer
                .write_all(&Problem::bad_request(e.to_string()).to_line())
                .await?;
            return Ok(());
        }
    };
    let path = request.path.to_lowercase();
    let payload = request.payload;

    if let Some((route, params)) = routes.0.match_path(&path) {
        let response = handlers::dispatch(*route, &params, payload, &state);
        let line = match response {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(mut line) => {
                    line.push(b'\n');
                    line
                }
                Err(e) => {
                    warn!(%peer, %path, error = %e, "response encoding failed");
                    Problem::internal("response encoding failed").to_line()
                }
            },
            Err(problem) => {
                debug!(%peer, %path, status = problem.status, "request refused");
                problem.to_line()
            }
        };
        writer.write_all(&line).await?;
        writer.shutdown().await?;
        return Ok(());
    }

    if let Some((StreamKind::DeviceStream, params)) = routes.1.match_path(&path) {
        return handle_stream(&params, reader, writer, peer, &state).await;
    }

    writer
        .write_all(&Problem::not_found(format!("no route for {path:?}")).to_line())
        .await?;
    Ok(())
}

/// Claim the device's feeder slot and hand the connection to its session.
/// On return (or device removal) the slot is released and the idle timer
/// re-armed by the guard.
async fn handle_stream(
    params: &Params,
    mut reader: ControlReader,
    mut writer: ControlWriter,
    peer: SocketAddr,
    state: &ServerState,
) -> io::Result<()> {
    let result = (|| {
        let bus_id = param_decimal(params, "busid")?;
        let dev_id = param_decimal(params, "deviceid")?;
        let bus = state
            .buses
            .bus(bus_id)
            .ok_or_else(|| Problem::not_found(format!("bus {bus_id} does not exist")))?;
        bus.attach_feeder(dev_id).map_err(Problem::from)
    })();

    let guard = match result {
        Ok(guard) => guard,
        Err(problem) => {
            writer.write_all(&problem.to_line()).await?;
            return Ok(());
        }
    };

    let handle = guard.handle().clone();
    info!(
        %peer,
        busid = %handle.export.usb_bus_id,
        r#type = %handle.type_name,
        "feeder stream attached"
    );

    let session = handle.device.session.clone();
    let outcome = tokio::select! {
        outcome = session.run(&mut reader, &mut writer) => outcome,
        _ = handle.cancel.cancelled() => {
            debug!(busid = %handle.export.usb_bus_id, "device removed, closing feeder stream");
            Ok(())
        }
    };
    drop(guard);

    match &outcome {
        Ok(()) => info!(%peer, busid = %handle.export.usb_bus_id, "feeder stream detached"),
        Err(e) if is_disconnect(e) => {
            info!(%peer, busid = %handle.export.usb_bus_id, "feeder stream disconnected")
        }
        Err(e) => warn!(
            %peer,
            busid = %handle.export.usb_bus_id,
            error = %e,
            "feeder stream failed"
        ),
    }
    outcome
}
