//! Fifo and receive pipeline benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipa_fabric::queue::SkbArray;
use ipa_fabric::*;
use std::sync::Arc;

fn sizing(fifo: FifoId, depth: usize) -> FifoSizing {
    FifoSizing {
        fifo,
        tx: RingSizing::general(depth),
        rx: RingSizing::general(depth),
    }
}

/// Benchmark buffer pool push/pop
fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("skb_array");

    for depth in [64usize, 256, 1024].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::new("fill_drain", depth), depth, |b, &depth| {
            let mut pool: SkbArray<u64> = SkbArray::new(depth).unwrap();
            b.iter(|| {
                for i in 0..depth as u64 {
                    let _ = pool.push(i, 0x1000 + i);
                }
                while let Ok(item) = pool.pop() {
                    black_box(item);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark descriptor post and completion round trips
fn bench_post_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("common_fifo");

    for batch in [1usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::new("post_complete", batch), batch, |b, &batch| {
            let soft = Arc::new(SoftwareFabric::new());
            let hal: Arc<dyn FifoOps> = soft.clone();
            let fifo = CommonFifo::new(sizing(FifoId::UsbDl, 64), 0, hal);
            let allocator = RingAllocator::new(0, 0).unwrap();
            fifo.open(&allocator, false).unwrap();

            let route = fifo.route();
            let buffers: Vec<DmaBuffer> = (0..batch).map(|_| DmaBuffer::alloc(256).unwrap()).collect();
            let descs: Vec<Descriptor> = buffers
                .iter()
                .map(|buf| Descriptor::new(buf.dma_addr(), 256, 0, route.src.id(), route.dst.id()))
                .collect();
            let packets = vec![SoftPacket::new(Terminal::Usb.id(), 0, vec![0u8; 64]); batch];

            b.iter(|| {
                // SAFETY: `buffers` outlives every delivery of the benchmark
                unsafe { fifo.post_receive(&descs) }.unwrap();
                soft.deliver(FifoId::UsbDl, &packets).unwrap();
                while let Ok(desc) = fifo.take_completed() {
                    black_box(desc);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark one full drain/replenish/dispatch cycle
fn bench_receive_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("receiver");

    for packet_size in [64usize, 512, 1400].iter() {
        group.throughput(Throughput::Elements(32));
        group.bench_with_input(
            BenchmarkId::new("cycle_32", packet_size),
            packet_size,
            |b, &packet_size| {
                let soft = Arc::new(SoftwareFabric::new());
                let hal: Arc<dyn FifoOps> = soft.clone();
                let fifo = Arc::new(CommonFifo::new(sizing(FifoId::ApIpDl, 64), 0, hal));
                let allocator = RingAllocator::new(0, 0).unwrap();
                fifo.open(&allocator, false).unwrap();

                let receiver =
                    Receiver::new(EndpointId::ApIp, fifo, ReceiverConfig::default()).unwrap();
                receiver.prefill().unwrap();
                receiver
                    .add_nic(Arc::new(VirtualNic::new(
                        NicConfig::new("bench", TermMask::all(), FlowFilter::Any),
                        Arc::new(|packet: RecvPacket| {
                            black_box(packet.len);
                        }),
                    )))
                    .unwrap();

                let packets =
                    vec![SoftPacket::new(Terminal::Vap0.id(), 0, vec![0xa5u8; packet_size]); 32];

                b.iter(|| {
                    soft.deliver(FifoId::ApIpDl, &packets).unwrap();
                    black_box(receiver.run_cycle());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_pool, bench_post_complete, bench_receive_cycle);
criterion_main!(benches);
