// Text codec for control-panel state deltas.
//
// Control clients and the relay exchange plain ASCII messages of the form
// `key1:value1 key2:value2 ...`. A message is a partial state update; the
// full state dump served over HTTP and written to snapshot files uses the
// same encoding.
//
// Decoding is lenient: tokens are separated by single ASCII spaces, tokens
// without a `:` are skipped, and each token is split at its *first* colon so
// a value may itself contain colons. Nothing here interprets keys or values;
// the relay treats both as opaque strings.
//
// One message prefix is reserved: `save:<name>` asks the relay to persist a
// snapshot rather than update state. `parse_request` performs that
// classification so the relay and any tooling agree on it.

/// Prefix of a snapshot request.
pub const SAVE_PREFIX: &str = "save:";

/// Prefix of the acknowledgment sent to a session whose snapshot was written.
pub const SAVED_ACK_PREFIX: &str = "saved:";

/// Prefix of the acknowledgment sent to a session whose snapshot failed.
pub const SAVE_FAILED_ACK_PREFIX: &str = "savefailed:";

/// A classified client message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRequest<'a> {
    /// Persist the current state under `name` (unsanitized, as sent).
    Save { name: &'a str },
    /// A state delta to merge and propagate verbatim.
    Update { raw: &'a str },
}

/// Classify a raw client message.
pub fn parse_request(raw: &str) -> ClientRequest<'_> {
    match raw.strip_prefix(SAVE_PREFIX) {
        Some(name) => ClientRequest::Save { name },
        None => ClientRequest::Update { raw },
    }
}

/// Decode a message into `(key, value)` pairs, in message order.
///
/// Duplicate keys are preserved; applying the pairs left to right makes the
/// last occurrence win.
pub fn decode(message: &str) -> Vec<(&str, &str)> {
    message
        .split(' ')
        .filter_map(|token| token.split_once(':'))
        .collect()
}

/// Encode `(key, value)` pairs as a space-joined `key:value` string.
///
/// Output order is the iteration order of `pairs`, so encoding an ordered map
/// is deterministic.
pub fn encode<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = String::new();
    for (key, value) in pairs {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(key.as_ref());
        out.push(':');
        out.push_str(value.as_ref());
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn decode_simple_pairs() {
        assert_eq!(decode("x:100 y:200"), vec![("x", "100"), ("y", "200")]);
    }

    #[test]
    fn decode_empty_message() {
        assert!(decode("").is_empty());
    }

    #[test]
    fn decode_skips_tokens_without_colon() {
        assert_eq!(
            decode("x:1 garbage y:2 alsogarbage"),
            vec![("x", "1"), ("y", "2")]
        );
    }

    #[test]
    fn decode_splits_at_first_colon_only() {
        assert_eq!(decode("url:http://host:80"), vec![("url", "http://host:80")]);
    }

    #[test]
    fn decode_empty_key_and_value() {
        assert_eq!(decode(": k: :v"), vec![("", ""), ("k", ""), ("", "v")]);
    }

    #[test]
    fn decode_ignores_repeated_spaces() {
        assert_eq!(decode("  a:1   b:2 "), vec![("a", "1"), ("b", "2")]);
    }

    #[test]
    fn decode_keeps_duplicate_keys_in_order() {
        assert_eq!(decode("a:1 a:2"), vec![("a", "1"), ("a", "2")]);
    }

    #[test]
    fn decode_is_case_sensitive() {
        assert_eq!(decode("R:1 r:2"), vec![("R", "1"), ("r", "2")]);
    }

    #[test]
    fn encode_empty() {
        let empty: Vec<(&str, &str)> = Vec::new();
        assert_eq!(encode(empty), "");
    }

    #[test]
    fn encode_map_is_ordered() {
        let mut state = BTreeMap::new();
        state.insert("y".to_string(), "200".to_string());
        state.insert("x".to_string(), "100".to_string());
        assert_eq!(encode(&state), "x:100 y:200");
        assert_eq!(encode(&state), encode(&state));
    }

    #[test]
    fn decode_inverts_encode_for_plain_tokens() {
        let mut state = BTreeMap::new();
        for (k, v) in [("hue", "0.25"), ("mode", "spiral"), ("blank", ""), ("x1", "-3")] {
            state.insert(k.to_string(), v.to_string());
        }
        let text = encode(&state);
        let decoded: BTreeMap<String, String> = decode(&text)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(decoded, state);
    }

    #[test]
    fn parse_save_request() {
        assert_eq!(
            parse_request("save:My Show"),
            ClientRequest::Save { name: "My Show" }
        );
        assert_eq!(parse_request("save:"), ClientRequest::Save { name: "" });
    }

    #[test]
    fn parse_update_request() {
        assert_eq!(
            parse_request("x:1 save:2"),
            ClientRequest::Update { raw: "x:1 save:2" }
        );
        // The prefix match is exact and case-sensitive.
        assert_eq!(
            parse_request("Save:show"),
            ClientRequest::Update { raw: "Save:show" }
        );
    }
}
