//! Block-oriented wire encoding (§4.7): EventBlock, MetadataBlock,
//! StackBlock, SequencePointBlock, and the root Trace/File object. Every
//! block accumulates records into a byte buffer and is flushed as one
//! FastSerializer object once a drain quantum closes.

use std::io;

use chrono::{Datelike, Timelike};
use eventpipe_wire::{type_names, SerializationFormat};

use crate::serializer::{FastSerializable, FastSerializer};

fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn align4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Shared 20-byte V4 block header: `[u16 header_size][u16 flags][i64
/// min_timestamp][i64 max_timestamp]`. Flag bit 0 marks header
/// compression.
fn write_block_header(min_timestamp: i64, max_timestamp: i64, compressed: bool) -> Vec<u8> {
    let mut h = Vec::with_capacity(20);
    h.extend_from_slice(&20u16.to_le_bytes());
    h.extend_from_slice(&(if compressed { 1u16 } else { 0u16 }).to_le_bytes());
    h.extend_from_slice(&min_timestamp.to_le_bytes());
    h.extend_from_slice(&max_timestamp.to_le_bytes());
    h
}

fn write_framed_block(serializer: &mut FastSerializer, header: &[u8], data: &[u8]) -> io::Result<()> {
    let total = (header.len() + data.len()) as u32;
    serializer.write_u32(total)?;
    serializer.write_padding()?;
    serializer.write_buffer(header)?;
    serializer.write_buffer(data)
}

/// Mirrors `EventPipeEventHeader` (ep-block.c): zero-initialized per
/// block, then overwritten after every compressed record so the next
/// one can diff against it.
#[derive(Clone, Copy, Default)]
struct LastFields {
    metadata_id: u32,
    sequence_number: u32,
    capture_thread_id: u64,
    proc_num: u32,
    stack_id: u32,
    thread_id: u64,
    activity_id: [u8; 16],
    related_activity_id: [u8; 16],
    data_len: u32,
    timestamp: i64,
}

/// One record appended to an EventBlock or MetadataBlock; the two block
/// kinds differ only in their FastSerializer type name.
pub struct EventRecord<'a> {
    pub metadata_id: u32,
    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub proc_num: u32,
    pub stack_id: u32,
    pub is_sorted: bool,
    pub timestamp: i64,
    pub activity_id: [u8; 16],
    pub related_activity_id: [u8; 16],
    pub payload: &'a [u8],
    pub stack: &'a [u64],
}

/// Accumulates EventBlock or MetadataBlock records (§4.7: the two share a
/// header and record format, distinguished only by the enclosing
/// object's type name).
pub struct EventBlockWriter {
    type_name: &'static str,
    format: SerializationFormat,
    data: Vec<u8>,
    min_timestamp: i64,
    max_timestamp: i64,
    last: LastFields,
}

impl EventBlockWriter {
    pub fn new_event_block(format: SerializationFormat) -> Self {
        Self::new(type_names::EVENT_BLOCK, format)
    }

    pub fn new_metadata_block(format: SerializationFormat) -> Self {
        Self::new(type_names::METADATA_BLOCK, format)
    }

    fn new(type_name: &'static str, format: SerializationFormat) -> Self {
        EventBlockWriter {
            type_name,
            format,
            data: Vec::new(),
            min_timestamp: 0,
            max_timestamp: 0,
            last: LastFields::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn uses_compression(&self) -> bool {
        self.format == SerializationFormat::NetTraceV4
    }

    /// Always succeeds (an unbounded `Vec` never rejects a write); kept
    /// as `bool` to mirror the source contract, which lets a fixed-size
    /// block refuse once it's full.
    pub fn write_event(&mut self, record: &EventRecord<'_>) -> bool {
        if self.data.is_empty() {
            self.min_timestamp = record.timestamp;
        }
        self.max_timestamp = record.timestamp;

        if self.uses_compression() {
            self.write_compressed(record);
        } else {
            self.write_uncompressed(record);
        }
        true
    }

    /// Header-compresses one record against `self.last`, following
    /// ep-block.c's `event_block_base_write_event` exactly: field order
    /// is metadata id, the sorted flag (no payload of its own), the
    /// sequence/thread/proc "bundle", thread id, stack id, an
    /// unconditional timestamp delta, the two activity ids, and finally
    /// data length — in that order, not the flag-bit order.
    fn write_compressed(&mut self, r: &EventRecord<'_>) {
        let last = self.last;
        let data_len = r.payload.len() as u32;
        let mut flags: u8 = 0;
        let mut header = Vec::new();

        if last.metadata_id != r.metadata_id {
            write_varint(&mut header, r.metadata_id as u64);
            flags |= 1 << 0;
        }

        if r.is_sorted {
            flags |= 1 << 6;
        }

        let expected_sequence = last.sequence_number.wrapping_add(if r.metadata_id != 0 { 1 } else { 0 });
        if expected_sequence != r.sequence_number || last.capture_thread_id != r.capture_thread_id || last.proc_num != r.proc_num {
            write_varint(&mut header, r.sequence_number.wrapping_sub(last.sequence_number).wrapping_sub(1) as u64);
            write_varint(&mut header, r.capture_thread_id);
            write_varint(&mut header, r.proc_num as u64);
            flags |= 1 << 1;
        }

        if last.thread_id != r.thread_id {
            write_varint(&mut header, r.thread_id);
            flags |= 1 << 2;
        }

        if last.stack_id != r.stack_id {
            write_varint(&mut header, r.stack_id as u64);
            flags |= 1 << 3;
        }

        write_varint(&mut header, (r.timestamp - last.timestamp) as u64);

        if last.activity_id != r.activity_id {
            header.extend_from_slice(&r.activity_id);
            flags |= 1 << 4;
        }

        if last.related_activity_id != r.related_activity_id {
            header.extend_from_slice(&r.related_activity_id);
            flags |= 1 << 5;
        }

        if last.data_len != data_len {
            write_varint(&mut header, data_len as u64);
            flags |= 1 << 7;
        }

        self.data.push(flags);
        self.data.extend_from_slice(&header);
        self.data.extend_from_slice(r.payload);

        self.last = LastFields {
            metadata_id: r.metadata_id,
            sequence_number: r.sequence_number,
            capture_thread_id: r.capture_thread_id,
            proc_num: r.proc_num,
            stack_id: r.stack_id,
            thread_id: r.thread_id,
            activity_id: r.activity_id,
            related_activity_id: r.related_activity_id,
            data_len,
            timestamp: r.timestamp,
        };
    }

    fn write_uncompressed(&mut self, r: &EventRecord<'_>) {
        let mut rec = Vec::new();
        let not_sorted_bit = if r.is_sorted { 0 } else { 0x8000_0000u32 };
        rec.extend_from_slice(&(r.metadata_id | not_sorted_bit).to_le_bytes());
        if self.format == SerializationFormat::NetTraceV4 {
            rec.extend_from_slice(&r.sequence_number.to_le_bytes());
            rec.extend_from_slice(&r.thread_id.to_le_bytes());
            rec.extend_from_slice(&r.capture_thread_id.to_le_bytes());
            rec.extend_from_slice(&r.proc_num.to_le_bytes());
            rec.extend_from_slice(&r.stack_id.to_le_bytes());
        }
        rec.extend_from_slice(&r.timestamp.to_le_bytes());
        rec.extend_from_slice(&r.activity_id);
        rec.extend_from_slice(&r.related_activity_id);
        rec.extend_from_slice(&(r.payload.len() as u32).to_le_bytes());
        rec.extend_from_slice(r.payload);
        if self.format == SerializationFormat::NetPerfV3 {
            rec.extend_from_slice(&((r.stack.len() * 8) as u32).to_le_bytes());
            for ip in r.stack {
                rec.extend_from_slice(&ip.to_le_bytes());
            }
        }
        align4(&mut rec);
        self.data.extend_from_slice(&(rec.len() as u32).to_le_bytes());
        self.data.extend_from_slice(&rec);
    }
}

impl FastSerializable for EventBlockWriter {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn fast_serialize(&self, serializer: &mut FastSerializer) -> io::Result<()> {
        let header = write_block_header(self.min_timestamp, self.max_timestamp, self.uses_compression());
        write_framed_block(serializer, &header, &self.data)
    }
}

/// Accumulates one session's interned call stacks between sequence
/// points (§4.7 StackBlock); stack ids restart at each sequence point.
pub struct StackBlockWriter {
    data: Vec<u8>,
    initial_id: Option<u32>,
    count: u32,
}

impl StackBlockWriter {
    pub fn new() -> Self {
        StackBlockWriter {
            data: Vec::new(),
            initial_id: None,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn write_stack(&mut self, id: u32, stack: &[u64]) -> bool {
        if self.initial_id.is_none() {
            self.initial_id = Some(id);
        }
        self.data.extend_from_slice(&((stack.len() * 8) as u32).to_le_bytes());
        for ip in stack {
            self.data.extend_from_slice(&ip.to_le_bytes());
        }
        self.count += 1;
        true
    }
}

impl Default for StackBlockWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FastSerializable for StackBlockWriter {
    fn type_name(&self) -> &'static str {
        type_names::STACK_BLOCK
    }

    fn fast_serialize(&self, serializer: &mut FastSerializer) -> io::Result<()> {
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&self.initial_id.unwrap_or(0).to_le_bytes());
        header.extend_from_slice(&self.count.to_le_bytes());
        write_framed_block(serializer, &header, &self.data)
    }
}

/// One-shot SequencePointBlock body (§4.7): no header beyond the generic
/// length prefix.
pub struct SequencePointBlockWriter {
    timestamp: i64,
    entries: Vec<(u64, u32)>,
}

impl SequencePointBlockWriter {
    pub fn new(timestamp: i64, entries: Vec<(u64, u32)>) -> Self {
        SequencePointBlockWriter { timestamp, entries }
    }
}

impl FastSerializable for SequencePointBlockWriter {
    fn type_name(&self) -> &'static str {
        type_names::SEQUENCE_POINT_BLOCK
    }

    fn fast_serialize(&self, serializer: &mut FastSerializer) -> io::Result<()> {
        let mut data = Vec::with_capacity(12 + self.entries.len() * 12);
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (os_tid, seq) in &self.entries {
            data.extend_from_slice(&os_tid.to_le_bytes());
            data.extend_from_slice(&seq.to_le_bytes());
        }
        write_framed_block(serializer, &[], &data)
    }
}

/// The root `Trace` object written once at the start of a session's
/// stream (§6 "File object body").
pub struct TraceHeader {
    pub system_time: chrono::DateTime<chrono::Utc>,
    pub file_open_timestamp: i64,
    pub timestamp_frequency: i64,
    pub pointer_size: u32,
    pub current_process_id: u32,
    pub number_of_processors: u32,
    pub sampling_rate_in_ns: u32,
}

impl FastSerializable for TraceHeader {
    fn type_name(&self) -> &'static str {
        type_names::TRACE
    }

    fn fast_serialize(&self, serializer: &mut FastSerializer) -> io::Result<()> {
        let t = self.system_time;
        let fields: [u16; 8] = [
            t.year() as u16,
            t.month() as u16,
            t.weekday().num_days_from_sunday() as u16,
            t.day() as u16,
            t.hour() as u16,
            t.minute() as u16,
            t.second() as u16,
            (t.timestamp_subsec_millis()) as u16,
        ];
        for f in fields {
            serializer.write_buffer(&f.to_le_bytes())?;
        }
        serializer.write_i64(self.file_open_timestamp)?;
        serializer.write_i64(self.timestamp_frequency)?;
        serializer.write_u32(self.pointer_size)?;
        serializer.write_u32(self.current_process_id)?;
        serializer.write_u32(self.number_of_processors)?;
        serializer.write_u32(self.sampling_rate_in_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn record(payload: &[u8], timestamp: i64, sequence_number: u32, is_sorted: bool) -> EventRecord<'_> {
        EventRecord {
            metadata_id: 1,
            sequence_number,
            thread_id: 7,
            capture_thread_id: 7,
            proc_num: 3,
            stack_id: 11,
            is_sorted,
            timestamp,
            activity_id: [9; 16],
            related_activity_id: [5; 16],
            payload,
            stack: &[],
        }
    }

    #[test]
    fn compressed_block_is_compact_for_identical_fields() {
        let mut block = EventBlockWriter::new_event_block(SerializationFormat::NetTraceV4);
        for i in 0..1000i64 {
            block.write_event(&record(&[7], 100 + i, i as u32, i == 0));
        }
        assert!(block.byte_len() <= 5000, "compressed size was {}", block.byte_len());
    }

    #[test]
    fn first_compressed_record_marks_every_field_changed() {
        let mut block = EventBlockWriter::new_event_block(SerializationFormat::NetTraceV4);
        block.write_event(&record(&[9], 5, 0, true));
        assert_eq!(block.data[0], 0xFF);
    }

    #[test]
    fn stack_block_tracks_initial_id_and_count() {
        let mut block = StackBlockWriter::new();
        block.write_stack(5, &[0x1000, 0x2000]);
        block.write_stack(6, &[0x3000]);
        assert_eq!(block.initial_id, Some(5));
        assert_eq!(block.count, 2);
    }

    #[test]
    fn framed_block_length_prefix_matches_body() {
        let sink = std::sync::Arc::new(MemorySink::new());
        let mut s = FastSerializer::new(sink.clone()).unwrap();
        let block = SequencePointBlockWriter::new(42, vec![(1, 2), (3, 4)]);
        write_framed_block(&mut s, &[], &[1, 2, 3]).unwrap();
        let _ = block;
        let bytes = sink.snapshot();
        let total = u32::from_le_bytes(bytes[bytes.len() - 7..bytes.len() - 3].try_into().unwrap());
        assert_eq!(total, 3);
    }
}
