// abstrax_protocol — wire formats for the Abstrax control relay.
//
// This crate defines the text encoding exchanged between browser control
// panels and the relay (`abstrax_relay`), and the OSC packet format the relay
// uses to forward state deltas to laser consumers over UDP. It is shared by
// the relay, its test client, and any tooling that speaks to the hardware;
// nothing here touches sockets or files.
//
// Module overview:
// - `types.rs`:  `SessionId`, the relay-assigned identity of a control client.
// - `codec.rs`:  `key:value` delta encoding (`decode`/`encode`) and the
//                `save:` request classification (`parse_request`).
// - `osc.rs`:    OSC 1.0 single-string messages on `/abstract/conf`.
//
// Design decisions:
// - **Values are opaque strings.** Numeric interpretation of slider values is
//   a client concern; the relay never parses them.
// - **Borrowed decoding.** `decode` returns slices into the message so the
//   relay can merge without allocating per token until it stores a value.

pub mod codec;
pub mod osc;
pub mod types;

pub use codec::{ClientRequest, decode, encode, parse_request};
pub use osc::{CONF_ADDRESS, decode_string_message, encode_string_message};
pub use types::SessionId;

#[cfg(test)]
mod tests {
    use super::*;

    /// A delta goes through the codec and out as an OSC packet without
    /// being re-encoded: the forwarded argument is the raw text.
    #[test]
    fn update_forwarded_verbatim_through_osc() {
        let raw = "x:100  y:200 stray";
        let ClientRequest::Update { raw: body } = parse_request(raw) else {
            panic!("expected an update");
        };
        assert_eq!(decode(body), vec![("x", "100"), ("y", "200")]);

        let packet = encode_string_message(CONF_ADDRESS, body).unwrap();
        let (_, arg) = decode_string_message(&packet).unwrap();
        assert_eq!(arg, raw);
    }

    #[test]
    fn session_id_display() {
        assert_eq!(SessionId(7).to_string(), "session-7");
    }
}
