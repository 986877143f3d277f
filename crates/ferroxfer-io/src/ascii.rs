//! Line ending conversion for ASCII mode transfers
//!
//! [`AsciiReader`] turns local LF line endings into CRLF for the wire.
//! [`AsciiWriter`] strips the CR of every CRLF pair before the data hits
//! the sink. A CR at the end of one slot is held back until the next byte
//! is known.

use crate::arena::{Buffer, SharedMemoryInfo};
use crate::reader::{ReadResult, Reader};
use crate::writer::{WriteBufferResult, Writer};
use ferroxfer_types::{AioHandler, AioId, AioResult};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Reader adapter expanding LF to CRLF
pub struct AsciiReader {
    inner: Box<dyn Reader>,
    out: Vec<u8>,
    was_cr: bool,
}

impl AsciiReader {
    /// Wrap `inner`; slots of `buffer_size` bytes expand to at most twice that
    pub fn new(inner: Box<dyn Reader>, buffer_size: usize) -> Self {
        debug!("Converting line endings while reading '{}'", inner.name());
        Self {
            inner,
            out: Vec::with_capacity(buffer_size.saturating_mul(2)),
            was_cr: false,
        }
    }
}

fn expand_lf(out: &mut Vec<u8>, was_cr: &mut bool, data: &[u8]) {
    out.clear();
    for &c in data {
        if c == b'\n' {
            if !*was_cr {
                out.push(b'\r');
            }
            *was_cr = false;
        } else {
            *was_cr = c == b'\r';
        }
        out.push(c);
    }
}

impl Reader for AsciiReader {
    fn id(&self) -> AioId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read(&mut self) -> ReadResult<'_> {
        match self.inner.read() {
            ReadResult::Ok(data) => {
                expand_lf(&mut self.out, &mut self.was_cr, data);
                ReadResult::Ok(&self.out)
            }
            ReadResult::Wait => ReadResult::Wait,
            ReadResult::Error => ReadResult::Error,
        }
    }

    fn current(&self) -> &[u8] {
        &self.out
    }

    /// Positions in converted data do not map to the source
    fn seek(&mut self, _offset: Option<u64>, _max_size: Option<u64>) -> AioResult {
        AioResult::Error
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    fn set_handler(&mut self, handler: Option<Arc<dyn AioHandler>>) {
        self.inner.set_handler(handler);
    }

    fn shared_memory_info(&self) -> Option<SharedMemoryInfo> {
        None
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for AsciiReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsciiReader")
            .field("name", &self.inner.name())
            .field("was_cr", &self.was_cr)
            .finish_non_exhaustive()
    }
}

/// Writer adapter collapsing CRLF to LF
pub struct AsciiWriter {
    inner: Box<dyn Writer>,
    was_cr: bool,
}

impl AsciiWriter {
    /// Wrap `inner`
    pub fn new(inner: Box<dyn Writer>) -> Self {
        debug!("Converting line endings while writing '{}'", inner.name());
        Self {
            inner,
            was_cr: false,
        }
    }

    /// Strip CR before LF in place; a trailing CR stays pending
    fn collapse_crlf(&mut self, buffer: &mut Buffer) {
        let data = buffer.as_mut_slice();
        let mut w = 0;
        for r in 0..data.len() {
            let c = data[r];
            match c {
                b'\r' => {
                    if self.was_cr {
                        data[w] = b'\r';
                        w += 1;
                    }
                    self.was_cr = true;
                }
                b'\n' => {
                    self.was_cr = false;
                    data[w] = c;
                    w += 1;
                }
                _ => {
                    if self.was_cr {
                        self.was_cr = false;
                        data[w] = b'\r';
                        w += 1;
                    }
                    data[w] = c;
                    w += 1;
                }
            }
        }
        buffer.truncate(w);
    }

    fn convert(&mut self, last_written: &mut Option<Buffer>) {
        if let Some(buffer) = last_written.as_mut() {
            self.collapse_crlf(buffer);
        }
    }
}

impl Writer for AsciiWriter {
    fn id(&self) -> AioId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_write_buffer(&mut self, mut last_written: Option<Buffer>) -> WriteBufferResult {
        self.convert(&mut last_written);
        match self.inner.get_write_buffer(last_written) {
            WriteBufferResult::Ok(mut buffer) => {
                if self.was_cr && buffer.push(b'\r') {
                    self.was_cr = false;
                }
                WriteBufferResult::Ok(buffer)
            }
            other => other,
        }
    }

    fn retire(&mut self, mut last_written: Option<Buffer>) -> AioResult {
        self.convert(&mut last_written);
        self.inner.retire(last_written)
    }

    fn finalize(&mut self, mut last_written: Option<Buffer>) -> AioResult {
        self.convert(&mut last_written);
        if self.was_cr {
            match last_written.as_mut() {
                // Collapsing freed at least the byte of the held back CR
                Some(buffer) => {
                    buffer.push(b'\r');
                    self.was_cr = false;
                }
                None => match self.get_write_buffer(None) {
                    WriteBufferResult::Ok(buffer) => last_written = Some(buffer),
                    WriteBufferResult::Wait => return AioResult::Wait,
                    WriteBufferResult::Error => return AioResult::Error,
                },
            }
        }
        self.inner.finalize(last_written)
    }

    fn preallocate(&mut self, size: u64) -> AioResult {
        self.inner.preallocate(size)
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    fn set_handler(&mut self, handler: Option<Arc<dyn AioHandler>>) {
        self.inner.set_handler(handler);
    }

    fn shared_memory_info(&self) -> Option<SharedMemoryInfo> {
        None
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for AsciiWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsciiWriter")
            .field("name", &self.inner.name())
            .field("was_cr", &self.was_cr)
            .finish_non_exhaustive()
    }
}
