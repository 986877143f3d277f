//! In-memory sources and sinks
//!
//! Both work synchronously on a single slot and never return `Wait`.

use crate::arena::{Arena, Buffer, SharedMemoryInfo};
use crate::context::EngineContext;
use crate::reader::{ReadResult, Reader, ReaderFactory};
use crate::writer::{WriteBufferResult, Writer, WriterFactory};
use bytes::Bytes;
use ferroxfer_types::{AioHandler, AioId, AioResult, Error, Result, TransferStatus};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Byte vector a [`MemoryWriter`] appends to
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Factory for [`MemoryReader`]s over a fixed byte string
#[derive(Debug, Clone)]
pub struct MemoryReaderFactory {
    name: String,
    data: Bytes,
}

impl MemoryReaderFactory {
    /// Factory over `data`
    pub fn from_bytes(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Factory over an owned byte vector
    pub fn from_vec(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::from_bytes(name, Bytes::from(data))
    }

    /// Factory over the UTF-8 bytes of `data`
    pub fn from_string(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self::from_bytes(name, Bytes::from(data.into()))
    }
}

impl ReaderFactory for MemoryReaderFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &self,
        ctx: &EngineContext,
        offset: u64,
        max_size: Option<u64>,
        _handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
    ) -> Result<Box<dyn Reader>> {
        let reader = MemoryReader::open(
            &self.name,
            self.data.clone(),
            ctx.options().buffer_size,
            offset,
            max_size,
            shm,
        )?;
        Ok(Box::new(reader))
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn clone_box(&self) -> Box<dyn ReaderFactory> {
        Box::new(self.clone())
    }
}

/// Reader copying slices of a byte string into its only slot
pub struct MemoryReader {
    id: AioId,
    name: String,
    arena: Arena,
    data: Bytes,
    current: Option<Buffer>,
    /// Remaining window
    window: Bytes,
    start_offset: u64,
    max_size: Option<u64>,
    size: u64,
    error: bool,
}

impl MemoryReader {
    /// Open a reader over `data` starting at `offset`
    pub fn open(
        name: &str,
        data: Bytes,
        buffer_size: usize,
        offset: u64,
        max_size: Option<u64>,
        shm: Option<&File>,
    ) -> Result<Self> {
        let mut arena = Arena::new(name, buffer_size);
        arena.allocate(true, shm).map_err(|e| {
            error!("Could not allocate memory to open '{}' for reading", name);
            e
        })?;

        let mut reader = Self {
            id: AioId::next(),
            name: name.to_string(),
            current: arena.take(0),
            arena,
            data,
            window: Bytes::new(),
            start_offset: 0,
            max_size: None,
            size: 0,
            error: false,
        };
        if reader.seek(Some(offset), max_size) != AioResult::Ok {
            return Err(Error::io(format!(
                "Could not start reading '{}' at offset {}",
                name, offset
            )));
        }
        Ok(reader)
    }
}

impl Reader for MemoryReader {
    fn id(&self) -> AioId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> ReadResult<'_> {
        if self.error {
            return ReadResult::Error;
        }
        let Some(buffer) = self.current.as_mut() else {
            return ReadResult::Error;
        };

        buffer.clear();
        let n = self.window.len().min(buffer.capacity());
        buffer.extend_from_slice(&self.window.split_to(n));
        ReadResult::Ok(buffer.as_slice())
    }

    fn current(&self) -> &[u8] {
        match &self.current {
            Some(buffer) => buffer.as_slice(),
            None => &[],
        }
    }

    fn seek(&mut self, offset: Option<u64>, max_size: Option<u64>) -> AioResult {
        if self.error {
            return AioResult::Error;
        }
        if let Some(offset) = offset {
            self.start_offset = offset;
            self.max_size = max_size;
        }

        let len = self.data.len() as u64;
        if self.start_offset > len {
            error!(
                "Could not seek to offset {} in '{}' of size {}",
                self.start_offset, self.name, len
            );
            self.error = true;
            return AioResult::Error;
        }

        let mut size = len - self.start_offset;
        if let Some(max_size) = self.max_size {
            size = size.min(max_size);
        }
        self.size = size;

        // Both bounds are within `data`, which lives in memory
        #[allow(clippy::cast_possible_truncation)]
        let start = self.start_offset as usize;
        #[allow(clippy::cast_possible_truncation)]
        let end = start + size as usize;
        self.window = self.data.slice(start..end);
        AioResult::Ok
    }

    fn size(&self) -> Option<u64> {
        (!self.error).then_some(self.size)
    }

    fn set_handler(&mut self, _handler: Option<Arc<dyn AioHandler>>) {}

    fn shared_memory_info(&self) -> Option<SharedMemoryInfo> {
        self.arena.shared_memory_info()
    }

    fn close(&mut self) {
        if let Some(buffer) = self.current.take() {
            self.arena.put(buffer);
        }
        self.window = Bytes::new();
    }
}

impl fmt::Debug for MemoryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Factory for [`MemoryWriter`]s appending to a shared vector
#[derive(Clone)]
pub struct MemoryWriterFactory {
    name: String,
    result: SharedBuffer,
    size_limit: Option<u64>,
}

impl MemoryWriterFactory {
    /// Factory appending to `result`
    pub fn new(name: impl Into<String>, result: SharedBuffer) -> Self {
        Self {
            name: name.into(),
            result,
            size_limit: None,
        }
    }

    /// Fail writes that would grow the result past `limit` bytes
    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = Some(limit);
        self
    }
}

impl fmt::Debug for MemoryWriterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryWriterFactory")
            .field("name", &self.name)
            .field("size_limit", &self.size_limit)
            .finish_non_exhaustive()
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &self,
        ctx: &EngineContext,
        offset: u64,
        _handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
        update_transfer_status: bool,
    ) -> Result<Box<dyn Writer>> {
        if offset != 0 {
            return Err(Error::other(format!(
                "Cannot resume writing '{}' at offset {}",
                self.name, offset
            )));
        }

        let status = update_transfer_status.then(|| Arc::clone(ctx.transfer_status()));
        let writer = MemoryWriter::open(
            &self.name,
            Arc::clone(&self.result),
            self.size_limit,
            ctx.options().buffer_size,
            shm,
            status,
        )?;
        Ok(Box::new(writer))
    }

    fn size(&self) -> Option<u64> {
        Some(self.result.lock().len() as u64)
    }

    fn clone_box(&self) -> Box<dyn WriterFactory> {
        Box::new(self.clone())
    }
}

/// Writer appending every submitted slot to a shared vector
///
/// The result is cleared on open and again on close unless the writer
/// was finalized.
pub struct MemoryWriter {
    id: AioId,
    name: String,
    arena: Arena,
    result: SharedBuffer,
    size_limit: Option<u64>,
    status: Option<Arc<TransferStatus>>,
    processing: bool,
    error: bool,
    finalized: bool,
}

impl MemoryWriter {
    /// Open a writer that appends to `result`
    pub fn open(
        name: &str,
        result: SharedBuffer,
        size_limit: Option<u64>,
        buffer_size: usize,
        shm: Option<&File>,
        status: Option<Arc<TransferStatus>>,
    ) -> Result<Self> {
        result.lock().clear();

        let mut arena = Arena::new(name, buffer_size);
        arena.allocate(true, shm).map_err(|e| {
            error!("Could not allocate memory to open '{}' for writing", name);
            e
        })?;

        debug!("Opened memory buffer '{}' for writing", name);
        Ok(Self {
            id: AioId::next(),
            name: name.to_string(),
            arena,
            result,
            size_limit,
            status,
            processing: false,
            error: false,
            finalized: false,
        })
    }

    /// Append `buffer` and return the slot to the arena
    fn commit(&mut self, mut buffer: Buffer) {
        {
            let mut result = self.result.lock();
            let remaining = self
                .size_limit
                .map(|limit| limit.saturating_sub(result.len() as u64));
            if remaining.is_some_and(|remaining| buffer.len() as u64 > remaining) {
                warn!(
                    "Attempting to write {} bytes to '{}' with only {} remaining",
                    buffer.len(),
                    self.name,
                    remaining.unwrap_or_default()
                );
                self.error = true;
            } else {
                result.extend_from_slice(buffer.as_slice());
                if let Some(status) = &self.status {
                    status.set_made_progress();
                    status.update(buffer.len() as u64);
                }
            }
        }
        buffer.clear();
        self.arena.put(buffer);
        self.processing = false;
    }

    /// Take back `last_written`; false if the caller lost its slot
    fn take_back(&mut self, last_written: Option<Buffer>) -> bool {
        match last_written {
            Some(buffer) => self.commit(buffer),
            None if self.processing => {
                error!("Filled buffer of '{}' was not handed back", self.name);
                self.error = true;
                return false;
            }
            None => {}
        }
        !self.error
    }
}

impl Writer for MemoryWriter {
    fn id(&self) -> AioId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn get_write_buffer(&mut self, last_written: Option<Buffer>) -> WriteBufferResult {
        if self.error {
            if let Some(buffer) = last_written {
                self.arena.put(buffer);
            }
            return WriteBufferResult::Error;
        }
        if !self.take_back(last_written) {
            return WriteBufferResult::Error;
        }

        match self.arena.take(0) {
            Some(buffer) => {
                self.processing = true;
                WriteBufferResult::Ok(buffer)
            }
            None => {
                self.error = true;
                WriteBufferResult::Error
            }
        }
    }

    fn retire(&mut self, last_written: Option<Buffer>) -> AioResult {
        if self.error {
            if let Some(buffer) = last_written {
                self.arena.put(buffer);
            }
            return AioResult::Error;
        }
        if self.take_back(last_written) {
            AioResult::Ok
        } else {
            AioResult::Error
        }
    }

    fn finalize(&mut self, last_written: Option<Buffer>) -> AioResult {
        if self.error {
            if let Some(buffer) = last_written {
                self.arena.put(buffer);
            }
            return AioResult::Error;
        }
        if self.finalized {
            if let Some(buffer) = last_written {
                self.arena.put(buffer);
            }
            return AioResult::Ok;
        }
        if !self.take_back(last_written) {
            return AioResult::Error;
        }

        self.finalized = true;
        AioResult::Ok
    }

    fn preallocate(&mut self, size: u64) -> AioResult {
        if self.error {
            return AioResult::Error;
        }
        let Ok(size) = usize::try_from(size) else {
            return AioResult::Ok;
        };
        self.result.lock().reserve(size);
        AioResult::Ok
    }

    fn size(&self) -> Option<u64> {
        Some(self.result.lock().len() as u64)
    }

    fn set_handler(&mut self, _handler: Option<Arc<dyn AioHandler>>) {}

    fn shared_memory_info(&self) -> Option<SharedMemoryInfo> {
        self.arena.shared_memory_info()
    }

    fn close(&mut self) {
        if !self.finalized {
            self.result.lock().clear();
        }
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MemoryWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryWriter")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain_reader, handler_channel, random_data, write_all};
    use rstest::rstest;

    const MIB: usize = 1024 * 1024;

    fn open_reader(factory: &MemoryReaderFactory, offset: u64, max_size: Option<u64>) -> Box<dyn Reader> {
        factory
            .open(&EngineContext::default(), offset, max_size, None, None)
            .unwrap()
    }

    #[test]
    fn test_reader_yields_full_slots_then_eof() {
        let data = random_data(2 * MIB);
        let factory = MemoryReaderFactory::from_vec("blob", data.clone());
        let mut reader = open_reader(&factory, 0, None);

        let slot = EngineContext::default().options().buffer_size;
        let mut out = Vec::new();
        let mut chunks = 0;
        loop {
            match reader.read() {
                ReadResult::Ok([]) => break,
                ReadResult::Ok(chunk) => {
                    assert_eq!(chunk.len(), slot);
                    out.extend_from_slice(chunk);
                    chunks += 1;
                }
                other => panic!("unexpected {:?}", other.kind()),
            }
        }
        assert_eq!(chunks, 2 * MIB / slot);
        assert_eq!(out, data);

        // End of input is sticky
        assert_eq!(reader.read(), ReadResult::Ok(&[]));
    }

    #[rstest]
    #[case(0, None, b"hello world".as_slice())]
    #[case(6, None, b"world".as_slice())]
    #[case(2, Some(3), b"llo".as_slice())]
    #[case(11, None, b"".as_slice())]
    fn test_reader_window(#[case] offset: u64, #[case] max_size: Option<u64>, #[case] expected: &[u8]) {
        let factory = MemoryReaderFactory::from_string("greeting", "hello world");
        let mut reader = open_reader(&factory, offset, max_size);
        assert_eq!(reader.size(), Some(expected.len() as u64));

        let (_handler, mut rx) = handler_channel();
        assert_eq!(drain_reader(reader.as_mut(), &mut rx), expected);
    }

    #[test]
    fn test_reader_seek_past_end_is_sticky() {
        let factory = MemoryReaderFactory::from_string("short", "abc");
        let mut reader = open_reader(&factory, 0, None);

        assert_eq!(reader.seek(Some(4), None), AioResult::Error);
        assert_eq!(reader.read(), ReadResult::Error);
        assert_eq!(reader.size(), None);
        assert!(factory
            .open(&EngineContext::default(), 4, None, None, None)
            .is_err());
    }

    #[test]
    fn test_reader_rewind() {
        let factory = MemoryReaderFactory::from_string("again", "abcdef");
        let mut reader = open_reader(&factory, 1, Some(3));
        let (_handler, mut rx) = handler_channel();

        assert_eq!(drain_reader(reader.as_mut(), &mut rx), b"bcd");
        assert_eq!(reader.rewind(), AioResult::Ok);
        assert_eq!(drain_reader(reader.as_mut(), &mut rx), b"bcd");
    }

    #[test]
    fn test_writer_collects_and_keeps_result() {
        let result = SharedBuffer::default();
        let factory = MemoryWriterFactory::new("sink", Arc::clone(&result));
        let ctx = EngineContext::default();
        ctx.transfer_status().init(None, 0);
        let data = random_data(600_000);

        let mut writer = factory.open(&ctx, 0, None, None, true).unwrap();
        let (_handler, mut rx) = handler_channel();
        write_all(writer.as_mut(), &mut rx, &data, 70_000);
        writer.close();

        assert_eq!(*result.lock(), data);
        assert_eq!(ctx.transfer_status().transferred(), 600_000);
    }

    #[test]
    fn test_writer_clears_result_unless_finalized() {
        let result: SharedBuffer = Arc::new(Mutex::new(b"stale".to_vec()));
        let factory = MemoryWriterFactory::new("sink", Arc::clone(&result));
        let mut writer = factory
            .open(&EngineContext::default(), 0, None, None, false)
            .unwrap();
        assert!(result.lock().is_empty());

        let WriteBufferResult::Ok(mut buffer) = writer.get_write_buffer(None) else {
            panic!("expected a buffer");
        };
        buffer.extend_from_slice(b"partial");
        assert_eq!(writer.retire(Some(buffer)), AioResult::Ok);
        assert_eq!(writer.size(), Some(7));

        drop(writer);
        assert!(result.lock().is_empty());
    }

    #[test]
    fn test_writer_size_limit() {
        let result = SharedBuffer::default();
        let factory = MemoryWriterFactory::new("limited", Arc::clone(&result)).with_size_limit(10);
        let mut writer = factory
            .open(&EngineContext::default(), 0, None, None, false)
            .unwrap();

        let WriteBufferResult::Ok(mut buffer) = writer.get_write_buffer(None) else {
            panic!("expected a buffer");
        };
        buffer.extend_from_slice(b"0123456789");
        let WriteBufferResult::Ok(mut buffer) = writer.get_write_buffer(Some(buffer)) else {
            panic!("expected a buffer");
        };
        buffer.push(b'x');
        assert!(matches!(
            writer.get_write_buffer(Some(buffer)),
            WriteBufferResult::Error
        ));
        assert_eq!(writer.finalize(None), AioResult::Error);
    }

    #[test]
    fn test_writer_refuses_offset() {
        let factory = MemoryWriterFactory::new("sink", SharedBuffer::default());
        assert!(factory
            .open(&EngineContext::default(), 5, None, None, false)
            .is_err());
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let result = SharedBuffer::default();
        let factory = MemoryWriterFactory::new("sink", Arc::clone(&result));
        let mut writer = factory
            .open(&EngineContext::default(), 0, None, None, false)
            .unwrap();

        let WriteBufferResult::Ok(mut buffer) = writer.get_write_buffer(None) else {
            panic!("expected a buffer");
        };
        buffer.extend_from_slice(b"done");
        assert_eq!(writer.finalize(Some(buffer)), AioResult::Ok);
        assert_eq!(writer.finalize(None), AioResult::Ok);
        writer.close();
        assert_eq!(*result.lock(), b"done");
    }
}
