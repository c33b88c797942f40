//! Block layer benchmarks

use std::sync::Arc;

use core::hint::black_box;
use criterion::{Criterion, criterion_group, criterion_main};
use nos_block::*;

const DISK: DeviceId = DeviceId::new(3, 0);

/// Finishes every dispatched request on the spot
struct Instant;

impl BlockDriver for Instant {
    fn request(&self, layer: &BlockLayer, device: DeviceId) {
        while let Ok(Some(head)) = layer.current_request(device) {
            let _ = layer.end_request(head.handle, true);
        }
    }
}

fn setup() -> BlockLayer {
    let layer = BlockLayer::new(BlockLayerConfig::default(), Arc::new(SpinSleeper::new())).unwrap();
    layer.register_device(DISK, DeviceConfig::new(1 << 24), Arc::new(Instant)).unwrap();
    layer
}

fn extent(sector: u64, sectors: u32) -> MemoryExtent {
    MemoryExtent::new(0x1000_0000 + sector as usize * SECTOR_SIZE, sectors as usize * SECTOR_SIZE)
}

fn bench_sequential_merge(c: &mut Criterion) {
    let layer = setup();
    c.bench_function("submit_sequential_batch", |b| {
        b.iter(|| {
            layer.plug(DISK).unwrap();
            for i in 0..32u64 {
                black_box(layer.submit(DISK, Direction::Read, Submission::detached(i * 8, 8, extent(i * 8, 8))).unwrap());
            }
            layer.unplug(DISK).unwrap();
        })
    });
}

fn bench_scattered_insert(c: &mut Criterion) {
    let layer = setup();
    let sectors: Vec<u64> = (0..48u64).map(|i| (i * 7919) % 100_000 * 8).collect();
    c.bench_function("submit_scattered_batch", |b| {
        b.iter(|| {
            layer.plug(DISK).unwrap();
            for &sector in &sectors {
                black_box(layer.submit(DISK, Direction::Write, Submission::detached(sector, 1, extent(sector, 1))).unwrap());
            }
            layer.unplug(DISK).unwrap();
        })
    });
}

fn bench_submit_and_wait(c: &mut Criterion) {
    let layer = setup();
    c.bench_function("submit_and_wait", |b| {
        b.iter(|| black_box(layer.submit_and_wait(DISK, Direction::Read, 64, 8, extent(64, 8)).unwrap()))
    });
}

criterion_group!(block_benchmarks, bench_sequential_merge, bench_scattered_insert, bench_submit_and_wait);

criterion_main!(block_benchmarks);
