//! Minimal framing shared by the device-command and debugger channels.
//!
//! Control messages are a 4-digit hexadecimal ASCII length followed by the raw
//! payload. Status words (`OKAY` / `FAIL`) are sent bare. The debugger stream
//! starts with a fixed handshake token echoed byte for byte.

use std::io::Write;

use crate::error::WireError;

/// Token exchanged in both directions before any JDWP packet.
pub const JDWP_HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

/// Hex4-framed request a follower sends to the leader before it starts
/// watching. The leader writes nothing back and never times the link out.
pub const FOLLOW_REQUEST: &[u8] = b"proxy:follow";

pub const OKAY: &[u8; 4] = b"OKAY";
pub const FAIL: &[u8; 4] = b"FAIL";

/// Width of the length prefix in bytes.
pub const HEX4_PREFIX_LEN: usize = 4;

/// Largest payload a hex4 prefix can describe.
pub const HEX4_MAX_PAYLOAD: usize = 0xFFFF;

/// Frame `payload` with its hex4 length prefix.
pub fn encode_hex4(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > HEX4_MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(HEX4_PREFIX_LEN + payload.len());
    frame.extend_from_slice(format!("{:04X}", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one hex4 frame to `writer`.
pub fn write_hex4<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), WireError> {
    let frame = encode_hex4(payload)?;
    writer.write_all(&frame)?;
    Ok(())
}

/// `FAIL` followed by the hex4-framed reason.
pub fn encode_fail(reason: &str) -> Result<Vec<u8>, WireError> {
    let mut out = FAIL.to_vec();
    out.extend(encode_hex4(reason.as_bytes())?);
    Ok(out)
}

/// Parse a 4-byte hex length prefix. Both letter cases are accepted.
pub fn parse_hex4_length(prefix: &[u8]) -> Result<usize, WireError> {
    let invalid = || WireError::InvalidLength(String::from_utf8_lossy(prefix).into_owned());

    if prefix.len() != HEX4_PREFIX_LEN || !prefix.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let digits = std::str::from_utf8(prefix).map_err(|_| invalid())?;
    usize::from_str_radix(digits, 16).map_err(|_| invalid())
}

/// Take one complete hex4 frame off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete; the buffer is left
/// untouched so more bytes can be appended to it.
pub fn decode_hex4(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, WireError> {
    if buf.len() < HEX4_PREFIX_LEN {
        return Ok(None);
    }
    let len = parse_hex4_length(&buf[..HEX4_PREFIX_LEN])?;
    if buf.len() < HEX4_PREFIX_LEN + len {
        return Ok(None);
    }
    let payload = buf[HEX4_PREFIX_LEN..HEX4_PREFIX_LEN + len].to_vec();
    buf.drain(..HEX4_PREFIX_LEN + len);
    Ok(Some(payload))
}
