//! Throughput of the double-buffered file reader and writer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ferroxfer_io::{
    EngineContext, FileReaderFactory, FileWriterFactory, ReadResult, ReaderFactory,
    WriteBufferResult, WriterFactory,
};
use ferroxfer_types::{AioEvent, AioHandler, AioResult};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

const FILE_SIZE: usize = 32 * 1024 * 1024;

fn handler() -> (Arc<dyn AioHandler>, UnboundedReceiver<AioEvent>) {
    let (tx, rx) = unbounded_channel();
    (Arc::new(tx), rx)
}

fn bench_file_reader(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("source.bin");
    std::fs::write(&source, vec![0x5a; FILE_SIZE]).unwrap();

    let mut group = c.benchmark_group("file_reader");
    group.throughput(Throughput::Bytes(FILE_SIZE as u64));
    group.sample_size(10);

    for buffer_size in [64 * 1024, 256 * 1024, 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(buffer_size),
            &buffer_size,
            |b, &buffer_size| {
                let factory = FileReaderFactory::new(&source).with_buffer_size(buffer_size);
                let ctx = EngineContext::default();
                b.iter(|| {
                    let (handler, mut rx) = handler();
                    let mut reader = factory.open(&ctx, 0, None, Some(handler), None).unwrap();
                    let mut total = 0;
                    loop {
                        match reader.read() {
                            ReadResult::Ok([]) => break,
                            ReadResult::Ok(chunk) => total += chunk.len(),
                            ReadResult::Wait => {
                                rx.blocking_recv();
                            }
                            ReadResult::Error => panic!("read failed"),
                        }
                    }
                    black_box(total)
                });
            },
        );
    }

    group.finish();
}

fn bench_file_writer(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let destination = temp_dir.path().join("destination.bin");
    let payload = vec![0xa5; FILE_SIZE];

    let mut group = c.benchmark_group("file_writer");
    group.throughput(Throughput::Bytes(FILE_SIZE as u64));
    group.sample_size(10);

    for buffer_size in [64 * 1024, 256 * 1024, 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(buffer_size),
            &buffer_size,
            |b, &buffer_size| {
                let factory = FileWriterFactory::new(&destination).with_buffer_size(buffer_size);
                let ctx = EngineContext::default();
                b.iter(|| {
                    let (handler, mut rx) = handler();
                    let mut writer = factory.open(&ctx, 0, Some(handler), None, false).unwrap();
                    let mut rest = payload.as_slice();
                    let mut pending = None;
                    while !rest.is_empty() {
                        match writer.get_write_buffer(pending.take()) {
                            WriteBufferResult::Ok(mut buffer) => {
                                let n = buffer.extend_from_slice(rest);
                                rest = &rest[n..];
                                pending = Some(buffer);
                            }
                            WriteBufferResult::Wait => {
                                rx.blocking_recv();
                            }
                            WriteBufferResult::Error => panic!("write failed"),
                        }
                    }
                    loop {
                        match writer.finalize(pending.take()) {
                            AioResult::Ok => break,
                            AioResult::Wait => {
                                rx.blocking_recv();
                            }
                            AioResult::Error => panic!("finalize failed"),
                        }
                    }
                    writer.close();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_file_reader, bench_file_writer);
criterion_main!(benches);
