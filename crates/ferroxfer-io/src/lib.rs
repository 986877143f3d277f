//! Double-buffered transfer I/O for ferroxfer
//!
//! This crate moves file and memory contents between storage and the
//! network without ever blocking the event loop:
//!
//! - **Buffer arena**: fixed pools of transfer slots, on the heap or in
//!   caller-provided shared memory
//! - **Readers**: sources that fill slots ahead of the consumer
//! - **Writers**: sinks that drain filled slots behind the producer
//! - **ASCII mode**: adapters converting line endings on the fly
//!
//! File readers and writers run one worker thread each. Whenever an
//! operation would block it returns `Wait` and the registered
//! [`AioHandler`](ferroxfer_types::AioHandler) receives an event once
//! progress is possible.
//!
//! # Examples
//!
//! ```rust
//! use ferroxfer_io::{EngineContext, MemoryReaderFactory, ReadResult, ReaderFactory};
//!
//! let factory = MemoryReaderFactory::from_string("greeting", "hello");
//! let ctx = EngineContext::default();
//! let mut reader = factory.open(&ctx, 0, None, None, None).unwrap();
//! assert_eq!(reader.read(), ReadResult::Ok(b"hello".as_slice()));
//! assert_eq!(reader.read(), ReadResult::Ok(&[]));
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod aio;
pub mod arena;
pub mod ascii;
pub mod context;
pub mod memory;
pub mod reader;
pub mod writer;

#[cfg(test)]
mod testing;

pub use arena::{page_size, Arena, Buffer, SharedMemoryInfo, BUFFER_COUNT};
pub use ascii::{AsciiReader, AsciiWriter};
pub use context::EngineContext;
pub use memory::{
    MemoryReader, MemoryReaderFactory, MemoryWriter, MemoryWriterFactory, SharedBuffer,
};
pub use reader::{FileReader, FileReaderFactory, ReadResult, Reader, ReaderFactory};
pub use writer::{FileWriter, FileWriterFactory, WriteBufferResult, Writer, WriterFactory};
