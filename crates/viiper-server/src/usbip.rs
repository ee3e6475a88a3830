//! The USB/IP engine: management-op state machine and the per-import URB
//! loop.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use viiper_bus::{CancelScope, DeviceHandle};
use viiper_usb::hid::{DT_HID, DT_REPORT};
use viiper_usb::{
    encode_configuration, encode_device_descriptor, encode_hid_descriptor,
    encode_string_descriptor, Dir, SetupPacket, UsbDeviceModel, DT_CONFIGURATION, DT_DEVICE,
    DT_STRING, REQ_GET_CONFIGURATION, REQ_GET_DESCRIPTOR, REQ_SET_ADDRESS, REQ_SET_CONFIGURATION,
};
use viiper_usbip_protocol as proto;
use viiper_usbip_protocol::{CmdSubmit, ExportedDevice, InterfaceTriple, RetSubmit, RetUnlink, Urb};

use crate::batch::BatchedWriter;
use crate::is_disconnect;
use crate::ServerState;

/// Host-to-device transfers larger than this are protocol violations; no
/// emulated input device takes buffers anywhere near it.
const MAX_OUT_TRANSFER_LEN: u32 = 8 * 1024 * 1024;

pub(crate) async fn serve(listener: TcpListener, state: Arc<ServerState>, shutdown: CancelScope) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => return,
        };
        match accepted {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        if is_disconnect(&e) {
                            info!(%peer, "usbip client disconnected");
                        } else {
                            warn!(%peer, error = %e, "usbip connection failed");
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "usbip accept failed");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (mut read_half, mut write_half) = stream.into_split();

    // The client must begin enumerating within the connection window; the
    // bound is lifted once the URB loop starts.
    let header = tokio::time::timeout(state.config.connection_timeout, async {
        let mut header = [0u8; proto::OP_HEADER_LEN];
        read_half.read_exact(&mut header).await?;
        Ok::<_, std::io::Error>(header)
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no operation after accept"))??;

    let header = match proto::decode_op_header(&header) {
        Ok(header) => header,
        Err(e) => {
            warn!(%peer, error = %e, "usbip protocol violation");
            return Ok(());
        }
    };

    match header.command {
        proto::OP_REQ_DEVLIST => {
            let devices: Vec<ExportedDevice> = state
                .buses
                .all_devices()
                .iter()
                .map(exported_device)
                .collect();
            let reply = proto::encode_devlist_reply(&devices)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            use tokio::io::AsyncWriteExt;
            write_half.write_all(&reply).await?;
            debug!(%peer, devices = devices.len(), "devlist served");
            Ok(())
        }
        proto::OP_REQ_IMPORT => {
            let mut busid_raw = [0u8; proto::BUS_ID_LEN];
            read_half.read_exact(&mut busid_raw).await?;
            let busid = match proto::decode_import_request(&busid_raw) {
                Ok(busid) => busid,
                Err(e) => {
                    warn!(%peer, error = %e, "bad import request");
                    return Ok(());
                }
            };

            use tokio::io::AsyncWriteExt;
            let Some(handle) = state.buses.find_by_usb_bus_id(&busid) else {
                info!(%peer, %busid, "import refused: no such device");
                let reply = proto::encode_import_reply(None)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                write_half.write_all(&reply).await?;
                return Ok(());
            };

            let reply = proto::encode_import_reply(Some(&exported_device(&handle)))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            write_half.write_all(&reply).await?;
            info!(%peer, %busid, "device imported");

            let writer = BatchedWriter::new(write_half, state.config.write_batch_flush_interval);
            let result = urb_loop(&mut read_half, &writer, &handle).await;
            writer.shutdown().await;
            result
        }
        other => {
            warn!(%peer, command = other, "unexpected reply-side op code");
            Ok(())
        }
    }
}

/// Serialized request/response loop for one imported device. Ends on EOF,
/// connection error, or cancellation of the device context.
async fn urb_loop(
    reader: &mut OwnedReadHalf,
    writer: &BatchedWriter,
    handle: &DeviceHandle,
) -> std::io::Result<()> {
    let model = &handle.device.model;
    loop {
        if writer.is_broken() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }

        let mut header = [0u8; proto::URB_HEADER_LEN];
        tokio::select! {
            read = reader.read_exact(&mut header) => { read?; }
            _ = handle.cancel.cancelled() => {
                debug!(busid = %handle.export.usb_bus_id, "device context cancelled, closing urb loop");
                return Ok(());
            }
        }

        let urb = proto::decode_urb(&header)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        match urb {
            Urb::Unlink(cmd) => {
                writer.write(&proto::encode_ret_unlink(&RetUnlink {
                    seqnum: cmd.seqnum,
                    devid: cmd.devid,
                    direction: cmd.direction,
                    ep: cmd.ep,
                    status: proto::UNLINK_STATUS_ECONNRESET,
                }));
            }
            Urb::Submit(cmd) => {
                let mut out_payload = Vec::new();
                if cmd.direction == proto::DIR_OUT && cmd.transfer_buffer_length > 0 {
                    if cmd.transfer_buffer_length > MAX_OUT_TRANSFER_LEN {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "out transfer of {} bytes exceeds the limit",
                                cmd.transfer_buffer_length
                            ),
                        ));
                    }
                    out_payload = vec![0u8; cmd.transfer_buffer_length as usize];
                    tokio::select! {
                        read = reader.read_exact(&mut out_payload) => { read?; }
                        _ = handle.cancel.cancelled() => return Ok(()),
                    }
                }
                if let Some((ret, payload)) = service_submit(model.as_ref(), &cmd, &out_payload) {
                    let mut response = proto::encode_ret_submit(&ret);
                    response.extend_from_slice(&payload);
                    writer.write(&response);
                }
            }
        }
    }
}

/// Service one CMD_SUBMIT. `None` means "no data available" on an interrupt
/// IN endpoint: the URB stays unanswered.
fn service_submit(
    model: &dyn UsbDeviceModel,
    cmd: &CmdSubmit,
    out_payload: &[u8],
) -> Option<(RetSubmit, Vec<u8>)> {
    let reply_payload: Option<Vec<u8>>;
    let actual_length: u32;

    if cmd.ep == 0 {
        let setup = SetupPacket::parse(&cmd.setup);
        let mut data = handle_ep0(model, setup, out_payload);
        data.truncate(setup.w_length as usize);
        if setup.is_device_to_host() {
            actual_length = data.len() as u32;
            reply_payload = Some(data);
        } else {
            actual_length = out_payload.len() as u32;
            reply_payload = Some(Vec::new());
        }
    } else {
        let dir = Dir::from_usbip(cmd.direction)?;
        let data = model.handle_transfer(cmd.ep as u8, dir, out_payload);
        match dir {
            Dir::In => {
                if data.is_empty() {
                    return None;
                }
                let mut data = data;
                data.truncate(cmd.transfer_buffer_length as usize);
                actual_length = data.len() as u32;
                reply_payload = Some(data);
            }
            Dir::Out => {
                actual_length = out_payload.len() as u32;
                reply_payload = Some(Vec::new());
            }
        }
    }

    let payload = reply_payload.unwrap_or_default();
    Some((
        RetSubmit {
            seqnum: cmd.seqnum,
            devid: cmd.devid,
            direction: cmd.direction,
            ep: cmd.ep,
            status: 0,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        },
        payload,
    ))
}

/// The standard EP0 handler. Unhandled requests (after giving the device a
/// chance) answer zero-length, which the client observes as a stall.
fn handle_ep0(model: &dyn UsbDeviceModel, setup: SetupPacket, payload: &[u8]) -> Vec<u8> {
    let profile = model.profile();
    match (setup.bm_request_type, setup.b_request) {
        (0x00, REQ_SET_ADDRESS) | (0x00, REQ_SET_CONFIGURATION) => Vec::new(),
        (0x80, REQ_GET_CONFIGURATION) => vec![profile.configuration.configuration_value],
        (0x80, REQ_GET_DESCRIPTOR) => match setup.descriptor_type() {
            DT_DEVICE => encode_device_descriptor(profile),
            DT_CONFIGURATION => encode_configuration(profile),
            DT_STRING => {
                encode_string_descriptor(&profile.strings, setup.descriptor_index())
                    .unwrap_or_default()
            }
            _ => delegate(model, setup, payload),
        },
        (0x81, REQ_GET_DESCRIPTOR) => {
            let interface = (setup.w_index & 0xff) as u8;
            match setup.descriptor_type() {
                DT_HID => profile
                    .interfaces
                    .get(interface as usize)
                    .and_then(|intf| intf.hid.as_ref())
                    .map(|hid| encode_hid_descriptor(hid))
                    .unwrap_or_default(),
                DT_REPORT => profile
                    .report_descriptor(interface)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default(),
                _ => delegate(model, setup, payload),
            }
        }
        _ => delegate(model, setup, payload),
    }
}

fn delegate(model: &dyn UsbDeviceModel, setup: SetupPacket, payload: &[u8]) -> Vec<u8> {
    match model.handle_control(setup, payload) {
        Some(response) => response,
        None => {
            debug!(
                request_type = setup.bm_request_type,
                request = setup.b_request,
                "unhandled control request, stalling"
            );
            Vec::new()
        }
    }
}

/// Map a registered device onto its devlist/import wire block.
pub(crate) fn exported_device(handle: &DeviceHandle) -> ExportedDevice {
    let profile = handle.device.model.profile();
    ExportedDevice {
        path: handle.export.path.clone(),
        busid: handle.export.usb_bus_id.clone(),
        busnum: handle.export.bus_id,
        devnum: handle.export.dev_id,
        speed: profile.speed,
        id_vendor: profile.device.id_vendor,
        id_product: profile.device.id_product,
        bcd_device: profile.device.bcd_device,
        device_class: profile.device.device_class,
        device_subclass: profile.device.device_subclass,
        device_protocol: profile.device.device_protocol,
        configuration_value: profile.configuration.configuration_value,
        num_configurations: profile.device.num_configurations,
        interfaces: profile
            .interfaces
            .iter()
            .map(|intf| InterfaceTriple {
                class: intf.class,
                subclass: intf.subclass,
                protocol: intf.protocol,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viiper_devices::{DeviceOptions, Keyboard, Xbox360};

    fn submit(ep: u32, direction: u32, length: u32, setup: [u8; 8]) -> CmdSubmit {
        CmdSubmit {
            seqnum: 1,
            devid: 0x0001_0001,
            direction,
            ep,
            transfer_flags: 0,
            transfer_buffer_length: length,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup,
        }
    }

    #[test]
    fn get_device_descriptor_truncates_to_w_length() {
        let pad = Xbox360::new(&DeviceOptions::default());
        let cmd = submit(0, proto::DIR_IN, 8, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00]);
        let (ret, payload) = service_submit(&pad, &cmd, &[]).unwrap();
        assert_eq!(ret.status, 0);
        assert_eq!(ret.actual_length, 8);
        assert_eq!(payload.len(), 8);
        assert_eq!(payload[0], 18);
    }

    #[test]
    fn get_configuration_descriptor_assembles_the_tree() {
        let pad = Xbox360::new(&DeviceOptions::default());
        let cmd = submit(0, proto::DIR_IN, 255, [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xff, 0x00]);
        let (_, payload) = service_submit(&pad, &cmd, &[]).unwrap();
        let total = u16::from_le_bytes([payload[2], payload[3]]) as usize;
        assert_eq!(total, payload.len());
        // config + interface + 17-byte class blob + two endpoints.
        assert_eq!(total, 9 + 9 + 17 + 7 + 7);
    }

    #[test]
    fn hid_report_descriptor_is_served_per_interface() {
        let kb = Keyboard::new(&DeviceOptions::default());
        let cmd = submit(0, proto::DIR_IN, 255, [0x81, 0x06, 0x00, 0x22, 0x00, 0x00, 0xff, 0x00]);
        let (_, payload) = service_submit(&kb, &cmd, &[]).unwrap();
        assert!(payload.starts_with(&[0x05, 0x01, 0x09, 0x06]));
    }

    #[test]
    fn unknown_string_index_stalls_with_zero_length() {
        let kb = Keyboard::new(&DeviceOptions::default());
        let cmd = submit(0, proto::DIR_IN, 255, [0x80, 0x06, 0x09, 0x03, 0x09, 0x04, 0xff, 0x00]);
        let (ret, payload) = service_submit(&kb, &cmd, &[]).unwrap();
        assert_eq!(ret.status, 0);
        assert_eq!(ret.actual_length, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn set_configuration_acknowledges_without_data() {
        let pad = Xbox360::new(&DeviceOptions::default());
        let cmd = submit(0, proto::DIR_OUT, 0, [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let (ret, payload) = service_submit(&pad, &cmd, &[]).unwrap();
        assert_eq!(ret.actual_length, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn interrupt_in_with_data_replies_and_out_reports_consumed_length() {
        let pad = Xbox360::new(&DeviceOptions::default());
        let cmd = submit(1, proto::DIR_IN, 255, [0; 8]);
        let (ret, payload) = service_submit(&pad, &cmd, &[]).unwrap();
        assert_eq!(ret.actual_length, 20);
        assert_eq!(payload.len(), 20);

        let rumble = [0x00, 0x08, 0x00, 0x10, 0x20, 0x00, 0x00, 0x00];
        let cmd = submit(1, proto::DIR_OUT, rumble.len() as u32, [0; 8]);
        let (ret, payload) = service_submit(&pad, &cmd, &rumble).unwrap();
        assert_eq!(ret.actual_length, rumble.len() as u32);
        assert!(payload.is_empty());
    }

    #[test]
    fn interrupt_in_without_data_stays_unanswered() {
        let kb = Keyboard::new(&DeviceOptions::default());
        // Endpoint 2 is not populated on the keyboard: the model returns no
        // data, so the engine must not respond.
        let cmd = submit(2, proto::DIR_IN, 8, [0; 8]);
        assert!(service_submit(&kb, &cmd, &[]).is_none());
    }
}
