//! Reader engine: sequential byte ranges produced ahead of the consumer
//!
//! A [`Reader`] is polled from the event loop and never blocks. File
//! readers fill the arena from a dedicated worker thread; the consumer
//! gets [`ReadResult::Wait`] when nothing is ready and an
//! [`AioEvent::ReadReady`] once data arrives.

use crate::aio::{AioShared, AioState};
use crate::arena::{Arena, Buffer, SharedMemoryInfo};
use crate::context::EngineContext;
use chrono::{DateTime, Utc};
use ferroxfer_types::{AioEvent, AioHandler, AioId, AioResult, Error, Result};
use parking_lot::MutexGuard;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Outcome of [`Reader::read`]
#[derive(Debug, PartialEq, Eq)]
pub enum ReadResult<'a> {
    /// Next chunk of data; empty at end of input
    Ok(&'a [u8]),
    /// No data ready, an event follows
    Wait,
    /// Sticky failure
    Error,
}

impl ReadResult<'_> {
    /// Result kind without the data
    pub fn kind(&self) -> AioResult {
        match self {
            Self::Ok(_) => AioResult::Ok,
            Self::Wait => AioResult::Wait,
            Self::Error => AioResult::Error,
        }
    }
}

/// Non-blocking source of sequential data
///
/// At most one [`ReadResult::Ok`] slice is outstanding: calling
/// [`Reader::read`] again retires the previous one.
pub trait Reader: Send {
    /// Identity carried by this reader's events
    fn id(&self) -> AioId;

    /// Name of the source, usually a path
    fn name(&self) -> &str;

    /// Fetch the next chunk
    fn read(&mut self) -> ReadResult<'_>;

    /// Chunk returned by the last successful [`Reader::read`]
    ///
    /// Empty once the chunk was retired by a read that did not return data.
    fn current(&self) -> &[u8];

    /// Restart at `offset` limited to `max_size` bytes
    ///
    /// `None` as offset keeps the current window.
    fn seek(&mut self, offset: Option<u64>, max_size: Option<u64>) -> AioResult;

    /// Restart at the current window's start
    fn rewind(&mut self) -> AioResult {
        self.seek(None, None)
    }

    /// Size of the selected window, `None` if unknown or after an error
    fn size(&self) -> Option<u64>;

    /// Replace the event recipient
    fn set_handler(&mut self, handler: Option<Arc<dyn AioHandler>>);

    /// Shared memory backing the buffers, if any
    fn shared_memory_info(&self) -> Option<SharedMemoryInfo>;

    /// Stop background work and release the source
    fn close(&mut self);
}

/// Produces readers for one source
pub trait ReaderFactory: fmt::Debug + Send + Sync {
    /// Name of the source
    fn name(&self) -> &str;

    /// Open a reader positioned at `offset`
    fn open(
        &self,
        ctx: &EngineContext,
        offset: u64,
        max_size: Option<u64>,
        handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
    ) -> Result<Box<dyn Reader>>;

    /// Size of the source if known
    fn size(&self) -> Option<u64> {
        None
    }

    /// Modification time of the source if known
    fn mtime(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Clone into a new box
    fn clone_box(&self) -> Box<dyn ReaderFactory>;
}

impl Clone for Box<dyn ReaderFactory> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub(crate) fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Factory for [`FileReader`]s
#[derive(Debug, Clone)]
pub struct FileReaderFactory {
    path: PathBuf,
    name: String,
    buffer_size: Option<usize>,
}

impl FileReaderFactory {
    /// Factory for the file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            buffer_size: None,
        }
    }

    /// Override the slot size from the engine options
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }
}

impl ReaderFactory for FileReaderFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &self,
        ctx: &EngineContext,
        offset: u64,
        max_size: Option<u64>,
        handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
    ) -> Result<Box<dyn Reader>> {
        let buffer_size = self.buffer_size.unwrap_or(ctx.options().buffer_size);
        let reader = FileReader::open(&self.path, buffer_size, offset, max_size, handler, shm)?;
        Ok(Box::new(reader))
    }

    fn size(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }

    fn mtime(&self) -> Option<DateTime<Utc>> {
        file_mtime(&self.path)
    }

    fn clone_box(&self) -> Box<dyn ReaderFactory> {
        Box::new(self.clone())
    }
}

/// Reader over a local file, filled by a worker thread
pub struct FileReader {
    shared: Arc<AioShared>,
    file: Option<Arc<File>>,
    worker: Option<JoinHandle<()>>,
    current: Option<Buffer>,
    start_offset: u64,
    max_size: Option<u64>,
    size: Option<u64>,
    called_read: bool,
}

impl FileReader {
    /// Open `path` and start reading at `offset`
    pub fn open(
        path: &Path,
        buffer_size: usize,
        offset: u64,
        max_size: Option<u64>,
        handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
    ) -> Result<Self> {
        let name = path.display().to_string();

        let mut arena = Arena::new(name.as_str(), buffer_size);
        arena.allocate(false, shm).map_err(|e| {
            error!("Could not allocate memory to open '{}' for reading", name);
            e
        })?;

        let file = File::open(path).map_err(|e| {
            error!("Could not open '{}' for reading: {}", name, e);
            if e.kind() == io::ErrorKind::NotFound {
                Error::FileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                Error::io(format!("Failed to open file '{}': {}", name, e))
            }
        })?;

        let mut reader = Self {
            shared: AioShared::new(&name, arena, handler),
            file: Some(Arc::new(file)),
            worker: None,
            current: None,
            start_offset: 0,
            max_size: None,
            size: None,
            called_read: false,
        };

        if reader.seek(Some(offset), max_size) != AioResult::Ok {
            return Err(Error::io(format!(
                "Could not start reading '{}' at offset {}",
                name, offset
            )));
        }

        debug!("Opened '{}' for reading at offset {}", name, offset);
        Ok(reader)
    }
}

fn fail(state: &mut AioState) -> AioResult {
    state.error = true;
    AioResult::Error
}

impl Reader for FileReader {
    fn id(&self) -> AioId {
        self.shared.id
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn read(&mut self) -> ReadResult<'_> {
        let mut state = self.shared.state.lock();
        if state.error {
            return ReadResult::Error;
        }

        if state.processing {
            if let Some(buffer) = self.current.take() {
                state.arena.put(buffer);
            }
            state.ready_pos = (state.ready_pos + 1) % state.arena.len();
            if state.is_full() {
                self.shared.cond.notify_one();
            }
            state.ready_count -= 1;
        }

        if state.ready_count == 0 {
            state.handler_waiting = true;
            state.processing = false;
            return ReadResult::Wait;
        }

        let pos = state.ready_pos;
        let Some(buffer) = state.arena.take(pos) else {
            error!("Buffer {} of '{}' is missing", pos, self.shared.name);
            state.error = true;
            return ReadResult::Error;
        };
        self.called_read = true;
        state.processing = true;
        drop(state);

        ReadResult::Ok(self.current.insert(buffer).as_slice())
    }

    fn current(&self) -> &[u8] {
        match &self.current {
            Some(buffer) => buffer.as_slice(),
            None => &[],
        }
    }

    fn seek(&mut self, offset: Option<u64>, max_size: Option<u64>) -> AioResult {
        let mut state = self.shared.state.lock();
        if state.error {
            return AioResult::Error;
        }

        let change = self.worker.is_none()
            || self.called_read
            || offset.is_some_and(|o| o != self.start_offset || max_size != self.max_size);
        if !change {
            return AioResult::Ok;
        }

        if let Some(worker) = self.worker.take() {
            state.quit = true;
            self.shared.cond.notify_all();
            MutexGuard::unlocked(&mut state, || {
                if worker.join().is_err() {
                    error!("Reader thread for '{}' panicked", self.shared.name);
                }
            });
        }

        if let Some(buffer) = self.current.take() {
            state.arena.put(buffer);
        }
        state.reset_cursor();
        state.quit = false;
        self.called_read = false;

        if let Some(offset) = offset {
            self.start_offset = offset;
            self.max_size = max_size;
        }

        let Some(file) = self.file.clone() else {
            return fail(&mut state);
        };

        if let Err(e) = (&*file).seek(SeekFrom::Start(self.start_offset)) {
            error!(
                "Could not seek to offset {} in '{}': {}",
                self.start_offset, self.shared.name, e
            );
            return fail(&mut state);
        }

        let file_size = match file.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                error!("Could not obtain size of '{}': {}", self.shared.name, e);
                return fail(&mut state);
            }
        };
        if file_size < self.start_offset {
            error!(
                "Could not seek to offset {} in '{}' of size {}",
                self.start_offset, self.shared.name, file_size
            );
            return fail(&mut state);
        }

        let mut size = file_size - self.start_offset;
        if let Some(max_size) = self.max_size {
            size = size.min(max_size);
        }
        self.size = Some(size);

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("ferroxfer-reader".to_string())
            .spawn(move || read_worker(&shared, &file, size));
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                AioResult::Ok
            }
            Err(e) => {
                error!(
                    "Could not spawn worker thread for reading '{}': {}",
                    self.shared.name, e
                );
                fail(&mut state)
            }
        }
    }

    fn size(&self) -> Option<u64> {
        if self.shared.state.lock().error {
            return None;
        }
        self.size
    }

    fn set_handler(&mut self, handler: Option<Arc<dyn AioHandler>>) {
        self.shared.set_handler(handler);
    }

    fn shared_memory_info(&self) -> Option<SharedMemoryInfo> {
        self.shared.shared_memory_info()
    }

    fn close(&mut self) {
        self.shared.request_quit();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Reader thread for '{}' panicked", self.shared.name);
            }
        }

        let mut state = self.shared.state.lock();
        if let Some(buffer) = self.current.take() {
            state.arena.put(buffer);
        }
        state.ready_count = 0;
        state.processing = false;
        drop(state);

        self.file = None;
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("shared", &self.shared)
            .field("start_offset", &self.start_offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn read_some(file: &File, buf: &mut [u8]) -> io::Result<usize> {
    let mut reader = file;
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

fn read_worker(shared: &AioShared, file: &File, mut remaining: u64) {
    let mut state = shared.state.lock();
    while !state.quit && !state.error {
        if state.is_full() {
            shared.cond.wait(&mut state);
            continue;
        }

        let pos = state.free_pos();
        let Some(mut buffer) = state.arena.take(pos) else {
            error!("Buffer {} of '{}' is missing", pos, shared.name);
            state.error = true;
            break;
        };
        buffer.clear();

        let to_read = usize::try_from(remaining).map_or(buffer.capacity(), |r| r.min(buffer.capacity()));
        let mut result = Ok(0);
        if to_read > 0 {
            MutexGuard::unlocked(&mut state, || {
                result = read_some(file, &mut buffer.spare_mut()[..to_read]);
            });
            if state.quit {
                state.arena.put(buffer);
                return;
            }
        }

        let read = match result {
            Ok(read) => {
                buffer.commit(read);
                state.arena.put(buffer);
                state.ready_count += 1;
                remaining -= read as u64;
                trace!("Read {} bytes from '{}'", read, shared.name);
                read
            }
            Err(e) => {
                state.arena.put(buffer);
                error!("Could not read from '{}': {}", shared.name, e);
                state.error = true;
                0
            }
        };

        AioShared::wake_handler(&mut state, AioEvent::ReadReady(shared.id));

        if read == 0 {
            break;
        }
    }
}
