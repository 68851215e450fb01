//! FastSerializer: a tagged, length-prefixed object stream (§4.8, §6).
//! Every concrete block type in `block.rs` implements `FastSerializable`
//! so this module never needs to know about events, buffers, or sessions.
//!
//! Holds an owned `Arc<dyn EventSink>` rather than a borrowed reference:
//! a session's serializer lives for the session's whole lifetime (the
//! stream signature is written exactly once, at construction), so it
//! can't be scoped to a single drain call's borrow.

use std::io;
use std::sync::Arc;

use eventpipe_wire::{Tag, FAST_SERIALIZATION_SIGNATURE};

use crate::sink::EventSink;

/// Anything that can appear as a top-level object in the stream: the
/// `Trace` header object and the four block kinds.
pub trait FastSerializable {
    fn type_name(&self) -> &'static str;
    /// Object body, written between `BeginObject`'s descriptor and the
    /// matching `EndObject` tag.
    fn fast_serialize(&self, serializer: &mut FastSerializer) -> io::Result<()>;
}

pub struct FastSerializer {
    sink: Arc<dyn EventSink>,
    written: u64,
    pub write_error: bool,
}

impl FastSerializer {
    pub fn new(sink: Arc<dyn EventSink>) -> io::Result<Self> {
        let mut s = FastSerializer {
            sink,
            written: 0,
            write_error: false,
        };
        s.write_buffer(FAST_SERIALIZATION_SIGNATURE.as_bytes())?;
        Ok(s)
    }

    pub fn write_buffer(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.sink.write_all(bytes) {
            Ok(()) => {
                self.written += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.write_error = true;
                Err(e)
            }
        }
    }

    pub fn write_tag(&mut self, tag: Tag) -> io::Result<()> {
        self.write_buffer(&[tag as u8])
    }

    pub fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.write_buffer(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> io::Result<()> {
        self.write_buffer(&v.to_le_bytes())
    }

    /// `u32` byte length then the raw bytes; used both for the stream
    /// signature and object type names.
    pub fn write_string(&mut self, s: &str) -> io::Result<()> {
        self.write_u32(s.len() as u32)?;
        self.write_buffer(s.as_bytes())
    }

    /// Bytes needed to bring `self.written` up to the next 4-byte
    /// boundary; every block body is preceded by this much zero padding.
    pub fn required_padding(&self) -> usize {
        (4 - (self.written % 4) as usize) % 4
    }

    pub fn write_padding(&mut self) -> io::Result<()> {
        let n = self.required_padding();
        if n > 0 {
            self.write_buffer(&[0u8; 4][..n])?;
        }
        Ok(())
    }

    pub fn write_object(&mut self, object_version: u32, min_reader_version: u32, obj: &dyn FastSerializable) -> io::Result<()> {
        self.write_tag(Tag::BeginObject)?;
        self.write_tag(Tag::NullReference)?;
        self.write_u32(object_version)?;
        self.write_u32(min_reader_version)?;
        self.write_string(obj.type_name())?;
        obj.fast_serialize(self)?;
        self.write_tag(Tag::EndObject)
    }

    pub fn write_end(&mut self) -> io::Result<()> {
        self.write_tag(Tag::NullReference)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}
