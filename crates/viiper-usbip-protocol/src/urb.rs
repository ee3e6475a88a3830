//! URB-plane packets: `CMD_SUBMIT` / `RET_SUBMIT` / `CMD_UNLINK` /
//! `RET_UNLINK`.
//!
//! Every packet starts with the same 20-byte basic header followed by 28
//! command-specific bytes, 48 bytes total. Payload bytes (OUT data after a
//! submit, IN data after a reply) are carried separately by the caller.

use crate::error::ProtocolError;
use crate::{read_u32, CMD_SUBMIT, CMD_UNLINK, RET_SUBMIT, RET_UNLINK, URB_HEADER_LEN};

/// The shared `{command, seqnum, devid, direction, ep}` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub unlink_seqnum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
}

/// A decoded URB command as received by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urb {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

fn decode_basic(buf: &[u8]) -> UrbHeader {
    UrbHeader {
        command: read_u32(buf, 0),
        seqnum: read_u32(buf, 4),
        devid: read_u32(buf, 8),
        direction: read_u32(buf, 12),
        ep: read_u32(buf, 16),
    }
}

fn encode_basic(out: &mut Vec<u8>, command: u32, seqnum: u32, devid: u32, dir: u32, ep: u32) {
    out.extend_from_slice(&command.to_be_bytes());
    out.extend_from_slice(&seqnum.to_be_bytes());
    out.extend_from_slice(&devid.to_be_bytes());
    out.extend_from_slice(&dir.to_be_bytes());
    out.extend_from_slice(&ep.to_be_bytes());
}

/// Decode one 48-byte URB header into the command the server must service.
pub fn decode_urb(buf: &[u8]) -> Result<Urb, ProtocolError> {
    ProtocolError::want(buf, URB_HEADER_LEN)?;
    let basic = decode_basic(buf);
    match basic.command {
        CMD_SUBMIT => {
            let mut setup = [0u8; 8];
            setup.copy_from_slice(&buf[40..48]);
            Ok(Urb::Submit(CmdSubmit {
                seqnum: basic.seqnum,
                devid: basic.devid,
                direction: basic.direction,
                ep: basic.ep,
                transfer_flags: read_u32(buf, 20),
                transfer_buffer_length: read_u32(buf, 24),
                start_frame: read_u32(buf, 28),
                number_of_packets: read_u32(buf, 32),
                interval: read_u32(buf, 36),
                setup,
            }))
        }
        CMD_UNLINK => Ok(Urb::Unlink(CmdUnlink {
            seqnum: basic.seqnum,
            devid: basic.devid,
            direction: basic.direction,
            ep: basic.ep,
            unlink_seqnum: read_u32(buf, 20),
        })),
        other => Err(ProtocolError::UnknownUrbCommand(other)),
    }
}

/// Encode a `CMD_SUBMIT` header (client side, used by tests and feeders).
pub fn encode_cmd_submit(cmd: &CmdSubmit) -> Vec<u8> {
    let mut out = Vec::with_capacity(URB_HEADER_LEN);
    encode_basic(
        &mut out,
        CMD_SUBMIT,
        cmd.seqnum,
        cmd.devid,
        cmd.direction,
        cmd.ep,
    );
    out.extend_from_slice(&cmd.transfer_flags.to_be_bytes());
    out.extend_from_slice(&cmd.transfer_buffer_length.to_be_bytes());
    out.extend_from_slice(&cmd.start_frame.to_be_bytes());
    out.extend_from_slice(&cmd.number_of_packets.to_be_bytes());
    out.extend_from_slice(&cmd.interval.to_be_bytes());
    out.extend_from_slice(&cmd.setup);
    out
}

/// Encode a `CMD_UNLINK` header (client side, used by tests).
pub fn encode_cmd_unlink(cmd: &CmdUnlink) -> Vec<u8> {
    let mut out = Vec::with_capacity(URB_HEADER_LEN);
    encode_basic(
        &mut out,
        CMD_UNLINK,
        cmd.seqnum,
        cmd.devid,
        cmd.direction,
        cmd.ep,
    );
    out.extend_from_slice(&cmd.unlink_seqnum.to_be_bytes());
    out.resize(URB_HEADER_LEN, 0);
    out
}

/// Encode a `RET_SUBMIT` header. Any IN payload follows on the wire.
pub fn encode_ret_submit(ret: &RetSubmit) -> Vec<u8> {
    let mut out = Vec::with_capacity(URB_HEADER_LEN);
    encode_basic(
        &mut out,
        RET_SUBMIT,
        ret.seqnum,
        ret.devid,
        ret.direction,
        ret.ep,
    );
    out.extend_from_slice(&ret.status.to_be_bytes());
    out.extend_from_slice(&ret.actual_length.to_be_bytes());
    out.extend_from_slice(&ret.start_frame.to_be_bytes());
    out.extend_from_slice(&ret.number_of_packets.to_be_bytes());
    out.extend_from_slice(&ret.error_count.to_be_bytes());
    out.resize(URB_HEADER_LEN, 0);
    out
}

/// Decode a `RET_SUBMIT` header (client side, used by tests).
pub fn decode_ret_submit(buf: &[u8]) -> Result<RetSubmit, ProtocolError> {
    ProtocolError::want(buf, URB_HEADER_LEN)?;
    let basic = decode_basic(buf);
    if basic.command != RET_SUBMIT {
        return Err(ProtocolError::UnknownUrbCommand(basic.command));
    }
    Ok(RetSubmit {
        seqnum: basic.seqnum,
        devid: basic.devid,
        direction: basic.direction,
        ep: basic.ep,
        status: read_u32(buf, 20) as i32,
        actual_length: read_u32(buf, 24),
        start_frame: read_u32(buf, 28),
        number_of_packets: read_u32(buf, 32),
        error_count: read_u32(buf, 36),
    })
}

/// Encode a `RET_UNLINK` header.
pub fn encode_ret_unlink(ret: &RetUnlink) -> Vec<u8> {
    let mut out = Vec::with_capacity(URB_HEADER_LEN);
    encode_basic(
        &mut out,
        RET_UNLINK,
        ret.seqnum,
        ret.devid,
        ret.direction,
        ret.ep,
    );
    out.extend_from_slice(&ret.status.to_be_bytes());
    out.resize(URB_HEADER_LEN, 0);
    out
}

/// Decode a `RET_UNLINK` header (client side, used by tests).
pub fn decode_ret_unlink(buf: &[u8]) -> Result<RetUnlink, ProtocolError> {
    ProtocolError::want(buf, URB_HEADER_LEN)?;
    let basic = decode_basic(buf);
    if basic.command != RET_UNLINK {
        return Err(ProtocolError::UnknownUrbCommand(basic.command));
    }
    Ok(RetUnlink {
        seqnum: basic.seqnum,
        devid: basic.devid,
        direction: basic.direction,
        ep: basic.ep,
        status: read_u32(buf, 20) as i32,
    })
}
