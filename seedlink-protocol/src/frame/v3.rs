use crate::error::{Result, SeedlinkError};
use crate::frame::RawFrame;
use crate::sequence::MessageNumber;

pub const SIGNATURE: &[u8; 2] = b"SL";
pub const HEADER_LEN: usize = 8;
pub const PAYLOAD_LEN: usize = 512;
pub const FRAME_LEN: usize = 520;

/// Header of an INFO frame followed by more INFO frames.
pub const INFO_MORE: &[u8; HEADER_LEN] = b"SLINFO *";
/// Header of the last (or only) INFO frame.
pub const INFO_LAST: &[u8; HEADER_LEN] = b"SLINFO  ";

/// Parse a v3 frame from exactly 520 bytes.
pub fn parse(data: &[u8]) -> Result<RawFrame<'_>> {
    if data.len() < FRAME_LEN {
        return Err(SeedlinkError::FrameTooShort {
            expected: FRAME_LEN,
            actual: data.len(),
        });
    }

    if &data[0..2] != SIGNATURE.as_slice() {
        return Err(SeedlinkError::InvalidSignature {
            expected: "SL",
            actual: [data[0], data[1]],
        });
    }

    let payload = &data[HEADER_LEN..FRAME_LEN];

    if &data[2..6] == b"INFO" {
        return Ok(RawFrame::Info {
            last: data[7] != b'*',
            payload,
        });
    }

    // Message number from 6 hex ASCII chars at bytes 2..8
    let hex_str = std::str::from_utf8(&data[2..8]).map_err(|_| {
        SeedlinkError::InvalidMessageNumber("message number bytes are not valid UTF-8".into())
    })?;
    let sequence = MessageNumber::from_hex(hex_str)?;

    Ok(RawFrame::Data { sequence, payload })
}

/// Write a data frame (520 bytes) from message number and payload.
pub fn write(sequence: MessageNumber, payload: &[u8]) -> Result<Vec<u8>> {
    write_with_header(sequence.to_hex().as_bytes(), payload)
}

/// Write an INFO frame (520 bytes). `last` marks the final frame of a response.
pub fn write_info(last: bool, payload: &[u8]) -> Result<Vec<u8>> {
    let header = if last { INFO_LAST } else { INFO_MORE };
    write_with_header(&header[2..], payload)
}

fn write_with_header(tag: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() != PAYLOAD_LEN {
        return Err(SeedlinkError::PayloadLengthMismatch {
            expected: PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(SIGNATURE);
    frame.extend_from_slice(tag);
    frame.extend_from_slice(payload);

    debug_assert_eq!(frame.len(), FRAME_LEN);
    Ok(frame)
}
