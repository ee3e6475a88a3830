use thiserror::Error;

/// Decode-side failures. Encoding is infallible except for oversized fixed
/// fields, which also surface here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unsupported protocol version {0:#06x}")]
    BadVersion(u16),

    #[error("unknown operation code {0:#06x}")]
    UnknownOp(u16),

    #[error("unknown URB command {0}")]
    UnknownUrbCommand(u32),

    #[error("fixed field overflow: {field} is {len} bytes, limit {max}")]
    FieldOverflow {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("bus id is not valid UTF-8")]
    BadBusId,

    #[error("request path is not valid UTF-8")]
    BadPath,

    #[error("request frame is missing the NUL terminator")]
    UnterminatedRequest,
}

impl ProtocolError {
    pub(crate) fn want(buf: &[u8], need: usize) -> Result<(), ProtocolError> {
        if buf.len() < need {
            return Err(ProtocolError::Truncated {
                need,
                have: buf.len(),
            });
        }
        Ok(())
    }
}
