// OSC packet encoding for forwarded state deltas.
//
// Every accepted state update is forwarded to the laser consumers as an OSC
// 1.0 message on the address `/abstract/conf` carrying one string argument:
// the raw message exactly as the control client sent it. On the wire:
//
//   "/abstract/conf\0\0" ",s\0\0" "<raw>\0" + NUL padding
//
// Each OSC string is NUL-terminated and padded with NULs to a multiple of four
// bytes. The firmware-side consumer compares the fixed 20-byte prefix
// (address + type tag) byte for byte, so the encoding here must not vary.
//
// `decode_string_message` is the inverse for the single-string case and
// rejects anything else; it exists for tests and for tools that listen to the
// same UDP port as the hardware.
//
// Like `codec.rs`, this module performs no I/O; errors use `std::io::Error`
// kinds so callers can treat them like any other malformed-input error.

use std::io;

/// OSC address on which state deltas are forwarded.
pub const CONF_ADDRESS: &str = "/abstract/conf";

/// Largest packet we will emit: the maximum IPv4 UDP payload.
pub const MAX_PACKET_SIZE: usize = 65_507;

/// Type tag for a message with exactly one string argument.
const STRING_TYPE_TAG: &str = ",s";

/// Encode an OSC message with a single string argument.
///
/// Fails with `InvalidInput` if either string contains a NUL byte or the
/// packet would exceed `MAX_PACKET_SIZE`.
pub fn encode_string_message(address: &str, arg: &str) -> io::Result<Vec<u8>> {
    if !address.starts_with('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("OSC address must start with '/': {address:?}"),
        ));
    }
    let mut packet =
        Vec::with_capacity(padded_len(address.len()) + 4 + padded_len(arg.len()));
    push_osc_string(&mut packet, address)?;
    push_osc_string(&mut packet, STRING_TYPE_TAG)?;
    push_osc_string(&mut packet, arg)?;
    if packet.len() > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "OSC packet too large: {} bytes (max {MAX_PACKET_SIZE})",
                packet.len()
            ),
        ));
    }
    Ok(packet)
}

/// Decode an OSC message that carries exactly one string argument. Returns
/// `(address, argument)`.
pub fn decode_string_message(packet: &[u8]) -> io::Result<(String, String)> {
    let (address, rest) = read_osc_string(packet)?;
    if !address.starts_with('/') {
        return Err(invalid_data(format!("not an OSC message: {address:?}")));
    }
    let (type_tag, rest) = read_osc_string(rest)?;
    if type_tag != STRING_TYPE_TAG {
        return Err(invalid_data(format!(
            "expected type tag {STRING_TYPE_TAG:?}, got {type_tag:?}"
        )));
    }
    let (arg, rest) = read_osc_string(rest)?;
    if !rest.is_empty() {
        return Err(invalid_data(format!("{} trailing bytes", rest.len())));
    }
    Ok((address.to_owned(), arg.to_owned()))
}

/// Length of an OSC string of `len` bytes once terminated and padded.
fn padded_len(len: usize) -> usize {
    (len / 4 + 1) * 4
}

fn push_osc_string(packet: &mut Vec<u8>, s: &str) -> io::Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "OSC strings cannot contain NUL bytes",
        ));
    }
    packet.extend_from_slice(s.as_bytes());
    let padding = padded_len(s.len()) - s.len();
    packet.extend(std::iter::repeat_n(0u8, padding));
    Ok(())
}

/// Read one padded OSC string from the front of `buf`, returning it and the
/// remaining bytes.
fn read_osc_string(buf: &[u8]) -> io::Result<(&str, &[u8])> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| invalid_data("unterminated OSC string".into()))?;
    let total = padded_len(nul);
    if buf.len() < total {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated OSC string padding",
        ));
    }
    if buf[nul..total].iter().any(|&b| b != 0) {
        return Err(invalid_data("non-NUL OSC string padding".into()));
    }
    let s = std::str::from_utf8(&buf[..nul])
        .map_err(|e| invalid_data(format!("OSC string is not UTF-8: {e}")))?;
    Ok((s, &buf[total..]))
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
