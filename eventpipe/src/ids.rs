//! 16-byte opaque activity identifiers. A thin wrapper over `uuid::Uuid`
//! since its byte layout already matches the wire format exactly.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityId(pub [u8; 16]);

impl ActivityId {
    pub const NIL: ActivityId = ActivityId([0u8; 16]);

    pub fn new() -> Self {
        ActivityId(*Uuid::new_v4().as_bytes())
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        ActivityId::NIL
    }
}

impl From<[u8; 16]> for ActivityId {
    fn from(bytes: [u8; 16]) -> Self {
        ActivityId(bytes)
    }
}

/// A process-wide, 64-bit opaque handle returned to bootstrap code by
/// `facade::enable`. `0` is never a valid id.
pub type SessionId = u64;
