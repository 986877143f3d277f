//! Loopback throughput of the transfer socket

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ferroxfer_io::{EngineContext, MemoryReaderFactory, ReaderFactory};
use ferroxfer_network::{Command, NetworkContext, TransferMode, TransferSocket};
use ferroxfer_tests::peer::spawn_sink;
use ferroxfer_tests::test_utils::CommonFileSizes;
use ferroxfer_tests::{generate_test_data, TestControl, TestDataPattern};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::unbounded_channel;

async fn upload(data: &[u8], ascii: bool) -> usize {
    let (addr, server) = spawn_sink().await;
    let reader = MemoryReaderFactory::from_vec("bench", data.to_vec())
        .open(&EngineContext::default(), 0, None, None, None)
        .unwrap();
    let mut socket = TransferSocket::new(
        NetworkContext::default(),
        Arc::new(TestControl::loopback()),
        TransferMode::Upload,
    );
    socket.set_reader(reader, ascii);
    socket.setup_passive_transfer("127.0.0.1", addr.port()).unwrap();

    let (tx, mut rx) = unbounded_channel();
    tx.send(Command::SetActive).unwrap();
    let reason = socket.run(&mut rx).await;
    assert!(reason.is_success());
    server.await.unwrap().len()
}

fn bench_upload(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("transfer_upload");
    group.sample_size(10);

    for (name, size) in CommonFileSizes::transfer() {
        let data = generate_test_data(size, TestDataPattern::Binary);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("binary", name), &data, |b, data| {
            b.iter(|| black_box(runtime.block_on(upload(data, false))));
        });

        let text = generate_test_data(size, TestDataPattern::UnixText);
        group.bench_with_input(BenchmarkId::new("ascii", name), &text, |b, text| {
            b.iter(|| black_box(runtime.block_on(upload(text, true))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_upload);
criterion_main!(benches);
