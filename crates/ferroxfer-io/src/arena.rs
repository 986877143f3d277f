//! Fixed pool of equally sized transfer buffers
//!
//! An [`Arena`] owns up to [`BUFFER_COUNT`] slots carved from one contiguous
//! region, either private heap memory or a caller-supplied shared memory
//! object. A page of padding separates neighbouring slots so that the
//! worker thread and the event loop never share a prefetched cache line.
//!
//! Slots move in and out of the arena as owned [`Buffer`] values, so the
//! thread currently filling or draining a slot is its only owner.

use bytes::BytesMut;
use ferroxfer_types::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Number of slots in a full arena
pub const BUFFER_COUNT: usize = 8;

/// Operating system page size
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no preconditions and only reads system configuration
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
        }
        #[cfg(not(unix))]
        {
            4096
        }
    })
}

/// Describes a shared-memory backed arena to a cooperating process
///
/// Valid only while the owning reader or writer is alive. The receiving
/// side must duplicate the handle through its own IPC mechanism.
#[derive(Debug, Clone)]
pub struct SharedMemoryInfo {
    /// The shared memory object backing the arena
    pub handle: Arc<File>,
    /// Size of the shared object in bytes
    pub total_size: usize,
    /// Size of each slot in bytes
    pub slot_size: usize,
    /// Offset of each slot within the shared object
    pub slot_offsets: Vec<usize>,
}

#[derive(Debug)]
enum SlotMemory {
    Heap(BytesMut),
    Mapped(MmapMut),
}

impl SlotMemory {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Heap(mem) => mem,
            Self::Mapped(mem) => mem,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(mem) => mem,
            Self::Mapped(mem) => mem,
        }
    }
}

/// One arena slot with a fill level
#[derive(Debug)]
pub struct Buffer {
    index: usize,
    mem: SlotMemory,
    len: usize,
}

impl Buffer {
    /// Slot index within the owning arena
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total slot size
    pub fn capacity(&self) -> usize {
        self.mem.bytes().len()
    }

    /// Number of filled bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes are filled
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still free at the end of the slot
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Filled bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.mem.bytes()[..self.len]
    }

    /// Filled bytes, mutable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.mem.bytes_mut()[..len]
    }

    /// Free space after the filled bytes; follow up with [`Buffer::commit`]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.mem.bytes_mut()[len..]
    }

    /// Mark `n` bytes of the spare space as filled
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.capacity());
    }

    /// Shorten the filled part
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Drop all filled bytes
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append one byte, false if the slot is full
    pub fn push(&mut self, byte: u8) -> bool {
        if self.remaining() == 0 {
            return false;
        }
        let len = self.len;
        self.mem.bytes_mut()[len] = byte;
        self.len += 1;
        true
    }

    /// Append as much of `data` as fits, returning the number of bytes copied
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.spare_mut()[..n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }
}

#[derive(Debug)]
struct SharedMapping {
    file: Arc<File>,
    total_size: usize,
    offsets: Vec<usize>,
}

/// Lazily allocated pool of transfer buffers
#[derive(Debug)]
pub struct Arena {
    name: String,
    buffer_size: usize,
    slots: Vec<Option<Buffer>>,
    shared: Option<SharedMapping>,
}

impl Arena {
    /// Create an unallocated arena aiming for `buffer_size` bytes per slot
    pub fn new(name: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            name: name.into(),
            buffer_size: buffer_size.max(1),
            slots: Vec::new(),
            shared: None,
        }
    }

    /// Allocate the slots
    ///
    /// `single` requests one slot instead of [`BUFFER_COUNT`]. With `shm`
    /// the shared object is resized and mapped, otherwise heap memory is
    /// used. Calling this again after success does nothing.
    pub fn allocate(&mut self, single: bool, shm: Option<&File>) -> Result<()> {
        if self.is_allocated() {
            return Ok(());
        }

        let count = if single { 1 } else { BUFFER_COUNT };
        let page = page_size();

        let result = match shm {
            Some(file) => self.allocate_shared(count, page, file),
            None => self.allocate_heap(count, page),
        };

        if let Err(e) = &result {
            warn!("Buffer allocation for '{}' failed: {}", self.name, e);
        }
        result
    }

    fn layout(&self, count: usize, page: usize, slot_size: usize) -> Result<(usize, Vec<usize>)> {
        let stride = slot_size
            .checked_add(page)
            .ok_or_else(|| Error::allocation("slot size overflows"))?;
        let total = stride
            .checked_mul(count)
            .and_then(|size| size.checked_add(page))
            .ok_or_else(|| Error::allocation("arena size overflows"))?;
        let offsets = (0..count).map(|i| i * stride + page).collect();
        Ok((total, offsets))
    }

    fn allocate_heap(&mut self, count: usize, page: usize) -> Result<()> {
        let (total, offsets) = self.layout(count, page, self.buffer_size)?;
        let mut memory = BytesMut::zeroed(total);

        let mut slots = Vec::with_capacity(count);
        let mut consumed = 0;
        for (index, offset) in offsets.into_iter().enumerate() {
            let _padding = memory.split_to(offset - consumed);
            let slot = memory.split_to(self.buffer_size);
            consumed = offset + self.buffer_size;
            slots.push(Some(Buffer {
                index,
                mem: SlotMemory::Heap(slot),
                len: 0,
            }));
        }

        debug!(
            "Allocated {} heap buffers of {} bytes for '{}'",
            count, self.buffer_size, self.name
        );
        self.slots = slots;
        Ok(())
    }

    fn allocate_shared(&mut self, count: usize, page: usize, shm: &File) -> Result<()> {
        // Mapped slots must start on a page boundary
        let slot_size = self.buffer_size.div_ceil(page) * page;
        let (total, offsets) = self.layout(count, page, slot_size)?;

        let file = shm
            .try_clone()
            .map_err(|e| Error::allocation(format!("Failed to duplicate shared memory handle: {}", e)))?;
        let current = file
            .metadata()
            .map_err(|e| Error::allocation(format!("fstat failed: {}", e)))?
            .len();
        // Some platforms only allow sizing a shared memory object once
        if current < total as u64 {
            file.set_len(total as u64)
                .map_err(|e| Error::allocation(format!("ftruncate failed: {}", e)))?;
        }

        let mut slots = Vec::with_capacity(count);
        for (index, &offset) in offsets.iter().enumerate() {
            // SAFETY: the mapping covers a range inside the object we just sized,
            // offsets are page aligned, and no other mapping in this process
            // aliases a slot. The cooperating process is expected to touch a
            // slot only while it is handed over to it.
            let map = unsafe {
                MmapOptions::new()
                    .offset(offset as u64)
                    .len(slot_size)
                    .map_mut(&file)
            }
            .map_err(|e| Error::allocation(format!("mmap failed: {}", e)))?;

            slots.push(Some(Buffer {
                index,
                mem: SlotMemory::Mapped(map),
                len: 0,
            }));
        }

        debug!(
            "Mapped {} shared buffers of {} bytes for '{}'",
            count, slot_size, self.name
        );
        self.buffer_size = slot_size;
        self.slots = slots;
        self.shared = Some(SharedMapping {
            file: Arc::new(file),
            total_size: total,
            offsets,
        });
        Ok(())
    }

    /// Whether [`Arena::allocate`] succeeded
    pub fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena has no slots yet
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Size of each slot
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a slot out of the arena
    pub fn take(&mut self, index: usize) -> Option<Buffer> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Return a slot to the arena
    pub fn put(&mut self, buffer: Buffer) {
        let index = buffer.index;
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(buffer);
        }
    }

    /// Shared memory description, `None` for heap arenas
    pub fn shared_memory_info(&self) -> Option<SharedMemoryInfo> {
        self.shared.as_ref().map(|shared| SharedMemoryInfo {
            handle: Arc::clone(&shared.file),
            total_size: shared.total_size,
            slot_size: self.buffer_size,
            slot_offsets: shared.offsets.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, BUFFER_COUNT)]
    #[case(true, 1)]
    fn test_heap_allocation(#[case] single: bool, #[case] expected: usize) {
        let mut arena = Arena::new("heap", 64 * 1024);
        assert!(!arena.is_allocated());

        arena.allocate(single, None).unwrap();
        assert_eq!(arena.len(), expected);
        assert!(arena.shared_memory_info().is_none());

        for index in 0..expected {
            let buffer = arena.take(index).unwrap();
            assert_eq!(buffer.index(), index);
            assert_eq!(buffer.capacity(), 64 * 1024);
            assert!(buffer.is_empty());
            arena.put(buffer);
        }
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let mut arena = Arena::new("twice", 4096);
        arena.allocate(true, None).unwrap();
        let mut buffer = arena.take(0).unwrap();
        buffer.extend_from_slice(b"kept");
        arena.put(buffer);

        arena.allocate(false, None).unwrap();
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.take(0).unwrap().as_slice(), b"kept");
    }

    #[test]
    fn test_taken_slot_is_gone_until_returned() {
        let mut arena = Arena::new("take", 4096);
        arena.allocate(false, None).unwrap();
        let buffer = arena.take(3).unwrap();
        assert!(arena.take(3).is_none());
        arena.put(buffer);
        assert!(arena.take(3).is_some());
    }

    #[test]
    fn test_buffer_fill_operations() {
        let mut arena = Arena::new("fill", 8);
        arena.allocate(true, None).unwrap();
        let mut buffer = arena.take(0).unwrap();

        assert_eq!(buffer.extend_from_slice(b"abcdef"), 6);
        assert!(buffer.push(b'g'));
        assert_eq!(buffer.extend_from_slice(b"xyz"), 1);
        assert!(!buffer.push(b'!'));
        assert_eq!(buffer.as_slice(), b"abcdefgx");

        buffer.truncate(3);
        buffer.spare_mut()[0] = b'Z';
        buffer.commit(1);
        assert_eq!(buffer.as_slice(), b"abcZ");

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.remaining(), 8);
    }

    #[test]
    fn test_shared_allocation() {
        let shm = tempfile::tempfile().unwrap();
        let mut arena = Arena::new("shared", 1000);
        arena.allocate(false, Some(&shm)).unwrap();

        let page = page_size();
        let info = arena.shared_memory_info().unwrap();
        assert_eq!(info.slot_size, 1000usize.div_ceil(page) * page);
        assert_eq!(info.slot_offsets.len(), BUFFER_COUNT);
        assert_eq!(info.slot_offsets[0], page);
        assert!(info.slot_offsets.iter().all(|offset| offset % page == 0));
        assert_eq!(info.total_size, (info.slot_size + page) * BUFFER_COUNT + page);
        assert_eq!(shm.metadata().unwrap().len(), info.total_size as u64);

        let mut buffer = arena.take(2).unwrap();
        buffer.extend_from_slice(b"visible through the file");
        arena.put(buffer);

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let mut contents = vec![0u8; 24];
            shm.read_exact_at(&mut contents, info.slot_offsets[2] as u64).unwrap();
            assert_eq!(&contents, b"visible through the file");
        }
    }
}
