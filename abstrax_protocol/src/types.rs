// Core ID types for the relay protocol.
//
// `SessionId` is a relay-scoped identifier for one connected control client.
// The relay assigns compact, monotonically increasing IDs as connections are
// accepted; they are never reused within a process lifetime, so a late event
// tagged with a closed session's ID can never be mistaken for a newer client.

use std::fmt;

/// Relay-assigned session ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}
