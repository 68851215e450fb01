//! Closed-set wire constants for the NetTrace v4 stream: tag bytes, block
//! type names, parameter type codes, and the small set of session/format
//! enums an external reader needs to make sense of the byte stream.
//!
//! Kept dependency-free beyond `bytemuck` (for the fixed-layout guard
//! structs) and an optional `serde` derive so a CLI or test harness can
//! round-trip these types through JSON/TOML without pulling the whole
//! engine in.

#![forbid(unsafe_code)]

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const NETTRACE_MAGIC: &[u8; 8] = b"Nettrace";
pub const FAST_SERIALIZATION_SIGNATURE: &str = "!FastSerialization.1";

pub const BUFFER_HEADER_MAGIC: [u8; 8] = *b"EPBFSTRT";
pub const BUFFER_FOOTER_MAGIC: [u8; 8] = *b"EPBFEND!";
pub const BUFFER_FOOTER_SALT: [u8; 8] = *b"EPBFSALT";

/// Type-name strings used as the FastSerializer object descriptor for each
/// concrete block / object kind. These are what a reader matches on to
/// decide how to parse an object's body.
pub mod type_names {
    pub const TRACE: &str = "Trace";
    pub const EVENT_BLOCK: &str = "EventBlock";
    pub const METADATA_BLOCK: &str = "MetadataBlock";
    pub const STACK_BLOCK: &str = "StackBlock";
    pub const SEQUENCE_POINT_BLOCK: &str = "SPBlock";
}

/// FastSerializer tag bytes. Values are wire-binding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    NullReference = 1,
    ObjectReference = 2,
    BeginObject = 4,
    BeginPrivateObject = 5,
    EndObject = 6,
    Byte = 8,
    Int16 = 9,
    Int32 = 10,
    Int64 = 11,
    SkipRegion = 12,
    String = 13,
    Blob = 14,
}

/// Parameter type codes used in event metadata blobs. Closed set,
/// wire-binding.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterTypeCode {
    Empty = 0,
    Object = 1,
    DbNull = 2,
    Boolean = 3,
    Char = 4,
    SByte = 5,
    Byte = 6,
    Int16 = 7,
    UInt16 = 8,
    Int32 = 9,
    UInt32 = 10,
    Int64 = 11,
    UInt64 = 12,
    Single = 13,
    Double = 14,
    Decimal = 15,
    DateTime = 16,
    Guid = 17,
    String = 18,
    Array = 19,
}

/// Optional metadata v2 tag kinds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataTag {
    Opcode = 1,
    Parameters = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SessionType {
    File,
    Listener,
    IpcStream,
    FileStream,
    Synchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SerializationFormat {
    NetPerfV3,
    NetTraceV4,
}

impl Default for SerializationFormat {
    fn default() -> Self {
        SerializationFormat::NetTraceV4
    }
}

/// Severity levels, coarse filter alongside keywords. 0..=5 per spec.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Level {
    LogAlways = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    Verbose = 5,
}

pub const KEYWORDS_ALL: u64 = 0xFFFF_FFFF_FFFF_FFFF;
pub const CATCH_ALL_PROVIDER_NAME: &str = "*";

/// How defensively a Buffer's guard header/footer are written and checked.
/// `None` writes nothing; `Header` writes and validates the magic bytes;
/// `Full` additionally makes the region read-only after conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GuardLevel {
    None,
    Header,
    Full,
}

/// Fixed 32-byte region written at the start of every guarded Buffer.
/// Populated once at allocation and never touched again by the writer.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BufferHeaderLayout {
    pub magic: [u8; 8],
    pub creation_timestamp: i64,
    pub writer_thread_id: u64,
    pub first_event_sequence_number: u32,
    pub _padding: u32,
}

/// Fixed 32-byte region written at the end of every guarded Buffer's
/// reserved capacity, checked on every write when `GuardLevel::Full`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BufferFooterLayout {
    pub magic: [u8; 8],
    pub inverted_magic: [u8; 8],
    pub checksum: u64,
    pub filler: [u8; 8],
}

impl BufferFooterLayout {
    pub fn checksum_for(timestamp: i64, writer_thread_id: u64, sequence_number: u64) -> u64 {
        let salt = u64::from_le_bytes(BUFFER_FOOTER_SALT);
        (timestamp as u64) ^ writer_thread_id ^ sequence_number ^ salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_layout_is_32_bytes() {
        assert_eq!(std::mem::size_of::<BufferFooterLayout>(), 32);
    }

    #[test]
    fn tag_values_are_wire_binding() {
        assert_eq!(Tag::NullReference as u8, 1);
        assert_eq!(Tag::Blob as u8, 14);
    }

    #[test]
    fn parameter_type_codes_are_wire_binding() {
        assert_eq!(ParameterTypeCode::Empty as u32, 0);
        assert_eq!(ParameterTypeCode::Array as u32, 19);
    }
}
