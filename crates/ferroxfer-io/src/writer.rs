//! Writer engine: the consumer fills slots, a worker drains them to the sink
//!
//! [`Writer::get_write_buffer`] hands back the previously filled slot and
//! receives an empty one. When every slot is queued the caller gets
//! [`WriteBufferResult::Wait`] and later an [`AioEvent::WriteReady`].

use crate::aio::{AioShared, AioState};
use crate::arena::{Arena, Buffer, SharedMemoryInfo};
use crate::context::EngineContext;
use crate::reader::file_mtime;
use chrono::{DateTime, Utc};
use ferroxfer_types::{
    AioEvent, AioHandler, AioId, AioResult, Error, Notification, Result, TransferStatus,
};
use filetime::FileTime;
use parking_lot::MutexGuard;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Outcome of [`Writer::get_write_buffer`]
#[derive(Debug)]
pub enum WriteBufferResult {
    /// An empty slot to fill
    Ok(Buffer),
    /// Every slot is queued, an event follows
    Wait,
    /// Sticky failure
    Error,
}

impl WriteBufferResult {
    /// Result kind without the buffer
    pub fn kind(&self) -> AioResult {
        match self {
            Self::Ok(_) => AioResult::Ok,
            Self::Wait => AioResult::Wait,
            Self::Error => AioResult::Error,
        }
    }
}

/// Non-blocking sink for sequential data
pub trait Writer: Send {
    /// Identity carried by this writer's events
    fn id(&self) -> AioId;

    /// Name of the sink, usually a path
    fn name(&self) -> &str;

    /// Submit `last_written` and get the next empty slot
    ///
    /// `None` is valid for the first call.
    fn get_write_buffer(&mut self, last_written: Option<Buffer>) -> WriteBufferResult;

    /// Submit `last_written` without requesting a new slot
    fn retire(&mut self, last_written: Option<Buffer>) -> AioResult;

    /// Submit `last_written`, wait for the queue to drain and finish the sink
    ///
    /// Once this returned [`AioResult::Ok`] further calls are no-ops.
    fn finalize(&mut self, last_written: Option<Buffer>) -> AioResult;

    /// Reserve room for `size` more bytes
    fn preallocate(&mut self, _size: u64) -> AioResult {
        AioResult::Ok
    }

    /// Current size of the sink if known
    fn size(&self) -> Option<u64>;

    /// Replace the event recipient
    fn set_handler(&mut self, handler: Option<Arc<dyn AioHandler>>);

    /// Shared memory backing the buffers, if any
    fn shared_memory_info(&self) -> Option<SharedMemoryInfo>;

    /// Stop background work and release the sink
    fn close(&mut self);
}

/// Produces writers for one sink
pub trait WriterFactory: fmt::Debug + Send + Sync {
    /// Name of the sink
    fn name(&self) -> &str;

    /// Open a writer positioned at `offset`
    ///
    /// With `update_transfer_status` the writer reports consumed bytes to
    /// the engine's [`TransferStatus`].
    fn open(
        &self,
        ctx: &EngineContext,
        offset: u64,
        handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
        update_transfer_status: bool,
    ) -> Result<Box<dyn Writer>>;

    /// Current size of the sink if known
    fn size(&self) -> Option<u64> {
        None
    }

    /// Modification time of the sink if known
    fn mtime(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Set the modification time of the sink
    fn set_mtime(&self, _mtime: DateTime<Utc>) -> Result<()> {
        Err(Error::other(format!(
            "'{}' has no modification time",
            self.name()
        )))
    }

    /// Clone into a new box
    fn clone_box(&self) -> Box<dyn WriterFactory>;
}

impl Clone for Box<dyn WriterFactory> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Factory for [`FileWriter`]s
#[derive(Debug, Clone)]
pub struct FileWriterFactory {
    path: PathBuf,
    name: String,
    fsync: Option<bool>,
    buffer_size: Option<usize>,
}

impl FileWriterFactory {
    /// Factory for the file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            fsync: None,
            buffer_size: None,
        }
    }

    /// Override the `fsync` engine option
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = Some(fsync);
        self
    }

    /// Override the slot size from the engine options
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }
}

impl WriterFactory for FileWriterFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &self,
        ctx: &EngineContext,
        offset: u64,
        handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
        update_transfer_status: bool,
    ) -> Result<Box<dyn Writer>> {
        let writer = FileWriter::open(ctx, self, offset, handler, shm, update_transfer_status)?;
        Ok(Box::new(writer))
    }

    fn size(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }

    fn mtime(&self) -> Option<DateTime<Utc>> {
        file_mtime(&self.path)
    }

    fn set_mtime(&self, mtime: DateTime<Utc>) -> Result<()> {
        let time = FileTime::from_unix_time(mtime.timestamp(), mtime.timestamp_subsec_nanos());
        filetime::set_file_mtime(&self.path, time).map_err(|e| {
            Error::io(format!(
                "Failed to set modification time of '{}': {}",
                self.name, e
            ))
        })
    }

    fn clone_box(&self) -> Box<dyn WriterFactory> {
        Box::new(self.clone())
    }
}

/// Put a filled slot at the end of the ready range and wake the worker
pub(crate) fn enqueue(shared: &AioShared, state: &mut AioState, buffer: Buffer) {
    debug_assert_eq!(buffer.index(), state.free_pos());
    state.arena.put(buffer);
    state.processing = false;
    let signal = state.ready_count == 0;
    state.ready_count += 1;
    if signal {
        shared.cond.notify_one();
    }
}

/// Writer to a local file, drained by a worker thread
pub struct FileWriter {
    shared: Arc<AioShared>,
    file: Option<Arc<File>>,
    worker: Option<JoinHandle<()>>,
    fsync: bool,
    from_beginning: bool,
    preallocated: bool,
    finalized: bool,
    syncs: usize,
}

impl FileWriter {
    fn open(
        ctx: &EngineContext,
        factory: &FileWriterFactory,
        offset: u64,
        handler: Option<Arc<dyn AioHandler>>,
        shm: Option<&File>,
        update_transfer_status: bool,
    ) -> Result<Self> {
        let path = factory.path.as_path();
        let name = factory.name.as_str();

        let buffer_size = factory.buffer_size.unwrap_or(ctx.options().buffer_size);
        let mut arena = Arena::new(name, buffer_size);
        arena.allocate(false, shm).map_err(|e| {
            error!("Could not allocate memory to open '{}' for writing", name);
            e
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                match std::fs::create_dir_all(parent) {
                    Ok(()) => {
                        debug!("Created local directory '{}'", parent.display());
                        ctx.notify(Notification::LocalDirCreated(parent.to_path_buf()));
                    }
                    Err(e) => warn!("Could not create '{}': {}", parent.display(), e),
                }
            }
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if offset == 0 {
            options.create(true).truncate(true);
        }
        let mut file = options.open(path).map_err(|e| {
            error!("Could not open '{}' for writing: {}", name, e);
            Error::io(format!("Failed to open file '{}': {}", name, e))
        })?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).map_err(|e| {
                error!("Could not seek to offset {} in '{}': {}", offset, name, e);
                Error::io(format!("Failed to seek '{}': {}", name, e))
            })?;
            file.set_len(offset).map_err(|e| {
                error!("Could not truncate '{}' to offset {}: {}", name, offset, e);
                Error::io(format!("Failed to truncate '{}': {}", name, e))
            })?;
        }

        let file = Arc::new(file);
        let shared = AioShared::new(name, arena, handler);
        let status = update_transfer_status.then(|| Arc::clone(ctx.transfer_status()));

        let worker = {
            let shared = Arc::clone(&shared);
            let file = Arc::clone(&file);
            std::thread::Builder::new()
                .name("ferroxfer-writer".to_string())
                .spawn(move || write_worker(&shared, &file, status.as_deref()))
                .map_err(|e| {
                    error!("Could not spawn worker thread for writing '{}': {}", name, e);
                    Error::io(format!("Failed to spawn writer thread: {}", e))
                })?
        };

        debug!("Opened '{}' for writing at offset {}", name, offset);
        Ok(Self {
            shared,
            file: Some(file),
            worker: Some(worker),
            fsync: factory.fsync.unwrap_or(ctx.options().fsync),
            from_beginning: offset == 0,
            preallocated: false,
            finalized: false,
            syncs: 0,
        })
    }

    /// Number of durable syncs performed
    pub fn sync_count(&self) -> usize {
        self.syncs
    }

    /// Hand `last_written` back to the ring; false if the caller lost its slot
    fn take_back(&self, state: &mut AioState, last_written: Option<Buffer>) -> bool {
        match last_written {
            Some(buffer) if state.processing => enqueue(&self.shared, state, buffer),
            Some(buffer) => state.arena.put(buffer),
            None if state.processing => {
                error!("Filled buffer of '{}' was not handed back", self.shared.name);
                state.error = true;
                return false;
            }
            None => {}
        }
        true
    }
}

impl Writer for FileWriter {
    fn id(&self) -> AioId {
        self.shared.id
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn get_write_buffer(&mut self, last_written: Option<Buffer>) -> WriteBufferResult {
        let mut state = self.shared.state.lock();
        if state.error {
            if let Some(buffer) = last_written {
                state.arena.put(buffer);
            }
            return WriteBufferResult::Error;
        }

        if !self.take_back(&mut state, last_written) {
            return WriteBufferResult::Error;
        }

        if state.is_full() {
            state.handler_waiting = true;
            state.processing = false;
            return WriteBufferResult::Wait;
        }

        let pos = state.free_pos();
        match state.arena.take(pos) {
            Some(mut buffer) => {
                buffer.clear();
                state.processing = true;
                WriteBufferResult::Ok(buffer)
            }
            None => {
                error!("Buffer {} of '{}' is missing", pos, self.shared.name);
                state.error = true;
                WriteBufferResult::Error
            }
        }
    }

    fn retire(&mut self, last_written: Option<Buffer>) -> AioResult {
        let mut state = self.shared.state.lock();
        if state.error {
            if let Some(buffer) = last_written {
                state.arena.put(buffer);
            }
            return AioResult::Error;
        }

        if !state.processing {
            return match last_written {
                None => AioResult::Ok,
                Some(buffer) => {
                    let empty = buffer.is_empty();
                    state.arena.put(buffer);
                    if empty {
                        AioResult::Ok
                    } else {
                        AioResult::Error
                    }
                }
            };
        }

        if self.take_back(&mut state, last_written) {
            AioResult::Ok
        } else {
            AioResult::Error
        }
    }

    fn finalize(&mut self, last_written: Option<Buffer>) -> AioResult {
        let mut state = self.shared.state.lock();
        if state.error {
            if let Some(buffer) = last_written {
                state.arena.put(buffer);
            }
            return AioResult::Error;
        }
        if self.finalized {
            if let Some(buffer) = last_written {
                state.arena.put(buffer);
            }
            return AioResult::Ok;
        }

        if !self.take_back(&mut state, last_written) {
            return AioResult::Error;
        }
        state.processing = false;

        if state.ready_count > 0 {
            state.handler_waiting = true;
            return AioResult::Wait;
        }

        if self.fsync {
            let Some(file) = &self.file else {
                state.error = true;
                return AioResult::Error;
            };
            if let Err(e) = file.sync_all() {
                error!("Could not sync '{}' to disk: {}", self.shared.name, e);
                state.error = true;
                return AioResult::Error;
            }
            self.syncs += 1;
        }

        self.finalized = true;
        debug!("Finalized '{}'", self.shared.name);
        AioResult::Ok
    }

    fn preallocate(&mut self, size: u64) -> AioResult {
        let mut state = self.shared.state.lock();
        if state.error {
            return AioResult::Error;
        }
        let Some(file) = &self.file else {
            return AioResult::Error;
        };

        debug!("Preallocating {} bytes for the file '{}'", size, self.shared.name);

        let position = match (&**file).stream_position() {
            Ok(position) => position,
            Err(e) => {
                error!("Could not query position within '{}': {}", self.shared.name, e);
                state.error = true;
                return AioResult::Error;
            }
        };
        if let Err(e) = file.set_len(position.saturating_add(size)) {
            warn!("Could not preallocate '{}': {}", self.shared.name, e);
        }
        self.preallocated = true;

        AioResult::Ok
    }

    fn size(&self) -> Option<u64> {
        let file = self.file.as_ref()?;
        file.metadata().ok().map(|m| m.len())
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
                error!("Writer thread for '{}' panicked", self.shared.name);
            }
        }

        {
            let mut state = self.shared.state.lock();
            state.ready_count = 0;
            state.processing = false;
        }

        let Some(file) = self.file.take() else {
            return;
        };

        let mut remove = false;
        match (&*file).stream_position() {
            Ok(0) if self.from_beginning && !self.finalized => remove = true,
            Ok(position) if self.preallocated => {
                // Writing may have stopped short of the reserved size
                if let Err(e) = file.set_len(position) {
                    warn!("Could not truncate '{}' to {}: {}", self.shared.name, position, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not query position within '{}': {}", self.shared.name, e),
        }
        drop(file);

        if remove {
            debug!("Deleting empty file '{}'", self.shared.name);
            if let Err(e) = std::fs::remove_file(&self.shared.name) {
                warn!("Could not delete '{}': {}", self.shared.name, e);
            }
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWriter")
            .field("shared", &self.shared)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

fn write_worker(shared: &AioShared, file: &File, status: Option<&TransferStatus>) {
    let mut state = shared.state.lock();
    while !state.quit && !state.error {
        if state.ready_count == 0 {
            shared.cond.wait(&mut state);
            continue;
        }

        let pos = state.ready_pos;
        let Some(mut buffer) = state.arena.take(pos) else {
            error!("Buffer {} of '{}' is missing", pos, shared.name);
            state.error = true;
            break;
        };

        let mut result: io::Result<()> = Ok(());
        if !buffer.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                let mut sink = file;
                result = sink.write_all(buffer.as_slice());
            });
            if state.quit {
                state.arena.put(buffer);
                return;
            }
        }

        match result {
            Ok(()) => {
                trace!("Wrote {} bytes to '{}'", buffer.len(), shared.name);
                if let Some(status) = status {
                    status.set_made_progress();
                    status.update(buffer.len() as u64);
                }
            }
            Err(e) => {
                error!("Could not write to '{}': {}", shared.name, e);
                state.error = true;
            }
        }

        buffer.clear();
        state.arena.put(buffer);
        state.ready_pos = (pos + 1) % state.arena.len();
        state.ready_count -= 1;

        AioShared::wake_handler(&mut state, AioEvent::WriteReady(shared.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{finalize, handler_channel, random_data, write_all};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn open_file_writer(
        ctx: &EngineContext,
        factory: &FileWriterFactory,
        offset: u64,
        handler: Arc<dyn AioHandler>,
    ) -> FileWriter {
        FileWriter::open(ctx, factory, offset, Some(handler), None, true).unwrap()
    }

    #[test]
    fn test_write_and_finalize() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let data = random_data(700_000);
        let ctx = EngineContext::default();
        ctx.transfer_status().init(None, 0);
        let (handler, mut rx) = handler_channel();

        let factory = FileWriterFactory::new(&path).with_buffer_size(16 * 1024);
        let mut writer = open_file_writer(&ctx, &factory, 0, handler);
        write_all(&mut writer, &mut rx, &data, 10_000);
        writer.close();

        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(ctx.transfer_status().transferred(), 700_000);
        assert!(ctx.transfer_status().made_progress());
    }

    #[test]
    fn test_finalize_twice_syncs_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("synced.bin");
        let ctx = EngineContext::default();
        let (handler, mut rx) = handler_channel();

        let factory = FileWriterFactory::new(&path).with_fsync(true);
        let mut writer = open_file_writer(&ctx, &factory, 0, handler);
        write_all(&mut writer, &mut rx, b"durable", 1024);
        assert_eq!(writer.sync_count(), 1);

        assert_eq!(writer.finalize(None), AioResult::Ok);
        assert_eq!(writer.sync_count(), 1);
    }

    #[test]
    fn test_empty_unfinalized_file_removed_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        let ctx = EngineContext::default();
        let (handler, _rx) = handler_channel();

        let mut writer = open_file_writer(&ctx, &FileWriterFactory::new(&path), 0, handler);
        assert!(path.exists());
        writer.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_finalized_file_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kept.bin");
        let ctx = EngineContext::default();
        let (handler, mut rx) = handler_channel();

        let mut writer = open_file_writer(&ctx, &FileWriterFactory::new(&path), 0, handler);
        finalize(&mut writer, &mut rx, None);
        writer.close();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_resume_at_offset_truncates_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let ctx = EngineContext::default();
        let (handler, mut rx) = handler_channel();

        let mut writer = open_file_writer(&ctx, &FileWriterFactory::new(&path), 4, handler);
        assert_eq!(writer.size(), Some(4));
        write_all(&mut writer, &mut rx, b"abc", 1024);
        writer.close();

        assert_eq!(std::fs::read(&path).unwrap(), b"0123abc");
    }

    #[test]
    fn test_resume_requires_existing_file() {
        let dir = TempDir::new().unwrap();
        let factory = FileWriterFactory::new(dir.path().join("absent.bin"));
        let result = factory.open(&EngineContext::default(), 10, None, None, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_preallocated_file_truncated_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prealloc.bin");
        let ctx = EngineContext::default();
        let (handler, mut rx) = handler_channel();

        let mut writer = open_file_writer(&ctx, &FileWriterFactory::new(&path), 0, handler);
        assert_eq!(writer.preallocate(1_000_000), AioResult::Ok);
        assert_eq!(writer.size(), Some(1_000_000));

        let WriteBufferResult::Ok(mut buffer) = writer.get_write_buffer(None) else {
            panic!("expected a buffer");
        };
        buffer.extend_from_slice(b"partial");
        assert_eq!(writer.retire(Some(buffer)), AioResult::Ok);
        finalize(&mut writer, &mut rx, None);
        writer.close();

        assert_eq!(std::fs::read(&path).unwrap(), b"partial");
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("file.bin");
        let (tx, mut notifications) = tokio::sync::mpsc::unbounded_channel();
        let ctx = EngineContext::default().with_notifications(Arc::new(tx));
        let (handler, mut rx) = handler_channel();

        let mut writer = open_file_writer(&ctx, &FileWriterFactory::new(&path), 0, handler);
        write_all(&mut writer, &mut rx, b"x", 16);
        writer.close();

        assert_eq!(
            notifications.try_recv().unwrap(),
            Notification::LocalDirCreated(dir.path().join("a").join("b"))
        );
        assert!(path.exists());
    }

    #[test]
    fn test_retire_without_processing() {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::default();
        let (handler, _rx) = handler_channel();
        let mut writer = open_file_writer(
            &ctx,
            &FileWriterFactory::new(dir.path().join("retire.bin")),
            0,
            handler,
        );

        assert_eq!(writer.retire(None), AioResult::Ok);
    }

    #[test]
    fn test_set_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dated.bin");
        std::fs::write(&path, b"x").unwrap();
        let factory = FileWriterFactory::new(&path);

        let when = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        factory.set_mtime(when).unwrap();
        assert_eq!(factory.mtime(), Some(when));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn test_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..150_000),
            chunk in 1usize..20_000,
            buffer_size in 512usize..32_768,
        ) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("prop.bin");
            let ctx = EngineContext::default();
            let (handler, mut rx) = handler_channel();

            let factory = FileWriterFactory::new(&path).with_buffer_size(buffer_size);
            let mut writer = open_file_writer(&ctx, &factory, 0, handler);
            write_all(&mut writer, &mut rx, &data, chunk);
            writer.close();

            prop_assert_eq!(std::fs::read(&path).unwrap(), data);
        }
    }
}
