//! Where a session's serialized bytes go (§6 "IPC stream interface").
//! The engine core only ever writes raw bytes through this trait; the
//! file-vs-socket decision lives entirely outside `eventpipe`, in
//! whatever bootstraps a session.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

pub trait EventSink: Send + Sync {
    fn write_all(&self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;
}

/// Writes a NetTrace stream straight to a file, buffered to keep the
/// streaming thread from doing a syscall per block.
pub struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<FileSink> {
        let file = File::create(path)?;
        Ok(FileSink {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for FileSink {
    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        self.writer.lock().unwrap().write_all(bytes)
    }

    fn flush(&self) -> io::Result<()> {
        self.writer.lock().unwrap().flush()
    }
}

/// Accumulates bytes in memory. Used by `Synchronous` sessions and by
/// tests that want to inspect the produced stream directly.
pub struct MemorySink {
    buffer: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink { buffer: Mutex::new(Vec::new()) }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.lock().unwrap().clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        self.buffer.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_accumulates_writes() {
        let sink = MemorySink::new();
        sink.write_all(&[1, 2, 3]).unwrap();
        sink.write_all(&[4, 5]).unwrap();
        assert_eq!(sink.snapshot(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn file_sink_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.nettrace");
        {
            let sink = FileSink::create(&path).unwrap();
            sink.write_all(b"hello").unwrap();
            sink.flush().unwrap();
        }
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"hello");
    }
}
