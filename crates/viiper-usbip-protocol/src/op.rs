//! Management-plane operations: device listing and import.

use crate::error::ProtocolError;
use crate::{
    read_u16, read_u32, BUS_ID_LEN, OP_HEADER_LEN, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, PATH_LEN, ST_ERROR, ST_OK, USBIP_VERSION,
};

/// The 8-byte management header opening every operation on a fresh
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub command: u16,
    pub status: u32,
}

/// One `{class, subclass, protocol}` triplet trailing a devlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceTriple {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// The per-device block of `OP_REP_DEVLIST` / `OP_REP_IMPORT`.
///
/// `path` and `busid` are logical strings here; on the wire they occupy fixed
/// NUL-padded fields of 256 and 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceTriple>,
}

pub fn encode_op_header(header: &OpHeader, out: &mut Vec<u8>) {
    out.extend_from_slice(&header.version.to_be_bytes());
    out.extend_from_slice(&header.command.to_be_bytes());
    out.extend_from_slice(&header.status.to_be_bytes());
}

pub fn decode_op_header(buf: &[u8]) -> Result<OpHeader, ProtocolError> {
    ProtocolError::want(buf, OP_HEADER_LEN)?;
    let header = OpHeader {
        version: read_u16(buf, 0),
        command: read_u16(buf, 2),
        status: read_u32(buf, 4),
    };
    if header.version != USBIP_VERSION {
        return Err(ProtocolError::BadVersion(header.version));
    }
    match header.command {
        OP_REQ_DEVLIST | OP_REP_DEVLIST | OP_REQ_IMPORT | OP_REP_IMPORT => Ok(header),
        other => Err(ProtocolError::UnknownOp(other)),
    }
}

fn put_fixed(
    out: &mut Vec<u8>,
    value: &str,
    len: usize,
    field: &'static str,
) -> Result<(), ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.len() > len {
        return Err(ProtocolError::FieldOverflow {
            field,
            len: bytes.len(),
            max: len,
        });
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + (len - bytes.len()), 0);
    Ok(())
}

fn put_device_block(out: &mut Vec<u8>, dev: &ExportedDevice) -> Result<(), ProtocolError> {
    put_fixed(out, &dev.path, PATH_LEN, "path")?;
    put_fixed(out, &dev.busid, BUS_ID_LEN, "busid")?;
    out.extend_from_slice(&dev.busnum.to_be_bytes());
    out.extend_from_slice(&dev.devnum.to_be_bytes());
    out.extend_from_slice(&dev.speed.to_be_bytes());
    out.extend_from_slice(&dev.id_vendor.to_be_bytes());
    out.extend_from_slice(&dev.id_product.to_be_bytes());
    out.extend_from_slice(&dev.bcd_device.to_be_bytes());
    out.push(dev.device_class);
    out.push(dev.device_subclass);
    out.push(dev.device_protocol);
    out.push(dev.configuration_value);
    out.push(dev.num_configurations);
    out.push(dev.interfaces.len() as u8);
    Ok(())
}

/// Encode a full `OP_REP_DEVLIST` reply for the given devices.
pub fn encode_devlist_reply(devices: &[ExportedDevice]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    encode_op_header(
        &OpHeader {
            version: USBIP_VERSION,
            command: OP_REP_DEVLIST,
            status: ST_OK,
        },
        &mut out,
    );
    out.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    for dev in devices {
        put_device_block(&mut out, dev)?;
        for intf in &dev.interfaces {
            out.push(intf.class);
            out.push(intf.subclass);
            out.push(intf.protocol);
            out.push(0);
        }
    }
    Ok(out)
}

/// Encode an `OP_REQ_DEVLIST` request (client side, used by tests).
pub fn encode_devlist_request() -> Vec<u8> {
    let mut out = Vec::new();
    encode_op_header(
        &OpHeader {
            version: USBIP_VERSION,
            command: OP_REQ_DEVLIST,
            status: ST_OK,
        },
        &mut out,
    );
    out
}

/// Encode an `OP_REQ_IMPORT` request for the given bus id (client side).
pub fn encode_import_request(busid: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    encode_op_header(
        &OpHeader {
            version: USBIP_VERSION,
            command: OP_REQ_IMPORT,
            status: ST_OK,
        },
        &mut out,
    );
    put_fixed(&mut out, busid, BUS_ID_LEN, "busid")?;
    Ok(out)
}

/// Decode the 32-byte bus-id payload that follows an `OP_REQ_IMPORT` header.
pub fn decode_import_request(buf: &[u8]) -> Result<String, ProtocolError> {
    ProtocolError::want(buf, BUS_ID_LEN)?;
    let end = buf[..BUS_ID_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(BUS_ID_LEN);
    std::str::from_utf8(&buf[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::BadBusId)
}

/// Encode an `OP_REP_IMPORT` reply.
///
/// `Some(device)` produces a success reply carrying the device block without
/// interface triplets; `None` produces a failure reply with non-zero status
/// and no payload.
pub fn encode_import_reply(device: Option<&ExportedDevice>) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    encode_op_header(
        &OpHeader {
            version: USBIP_VERSION,
            command: OP_REP_IMPORT,
            status: if device.is_some() { ST_OK } else { ST_ERROR },
        },
        &mut out,
    );
    if let Some(dev) = device {
        put_device_block(&mut out, dev)?;
    }
    Ok(out)
}
