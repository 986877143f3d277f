//! Helpers shared by the unit tests of this crate

use crate::reader::{ReadResult, Reader};
use crate::writer::{WriteBufferResult, Writer};
use ferroxfer_types::{AioEvent, AioHandler, AioResult};
use rand::{RngCore, SeedableRng};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub fn handler_channel() -> (Arc<dyn AioHandler>, UnboundedReceiver<AioEvent>) {
    let (tx, rx) = unbounded_channel();
    (Arc::new(tx), rx)
}

pub fn random_data(len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(len as u64);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Read until EOF, blocking on events whenever the reader waits
pub fn drain_reader(reader: &mut dyn Reader, rx: &mut UnboundedReceiver<AioEvent>) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match reader.read() {
            ReadResult::Ok([]) => return out,
            ReadResult::Ok(chunk) => out.extend_from_slice(chunk),
            ReadResult::Wait => {
                rx.blocking_recv().expect("event channel closed");
            }
            ReadResult::Error => panic!("reader '{}' failed", reader.name()),
        }
    }
}

/// Submit `data` in pieces of at most `chunk` bytes, then finalize
pub fn write_all(
    writer: &mut dyn Writer,
    rx: &mut UnboundedReceiver<AioEvent>,
    data: &[u8],
    chunk: usize,
) {
    let mut pending = None;
    let mut rest = data;
    while !rest.is_empty() {
        match writer.get_write_buffer(pending.take()) {
            WriteBufferResult::Ok(mut buffer) => {
                let n = buffer.extend_from_slice(&rest[..rest.len().min(chunk)]);
                rest = &rest[n..];
                pending = Some(buffer);
            }
            WriteBufferResult::Wait => {
                rx.blocking_recv().expect("event channel closed");
            }
            WriteBufferResult::Error => panic!("writer '{}' failed", writer.name()),
        }
    }
    finalize(writer, rx, pending);
}

pub fn finalize(
    writer: &mut dyn Writer,
    rx: &mut UnboundedReceiver<AioEvent>,
    mut pending: Option<crate::Buffer>,
) {
    loop {
        match writer.finalize(pending.take()) {
            AioResult::Ok => return,
            AioResult::Wait => {
                rx.blocking_recv().expect("event channel closed");
            }
            AioResult::Error => panic!("finalizing '{}' failed", writer.name()),
        }
    }
}
