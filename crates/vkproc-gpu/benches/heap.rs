use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vkproc_gpu::heap::MemoryHeap;

const HEAP_SIZE: u64 = 24 * 1024 * 1024;

fn churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_churn");
    for &block in &[256_u64, 4096, 64 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(block), &block, |b, &block| {
            b.iter(|| {
                let mut heap = MemoryHeap::new(HEAP_SIZE, 0);
                let mut live = Vec::new();
                for i in 0..512_u64 {
                    if let Some(allocation) = heap.allocate(block + (i % 7) * 16, 256) {
                        live.push(allocation);
                    }
                    if i % 3 == 0 {
                        if let Some(allocation) = live.pop() {
                            let _ = heap.free(&allocation);
                        }
                    }
                }
                for allocation in live.drain(..) {
                    let _ = heap.free(&allocation);
                }
                black_box(heap.is_unused())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, churn);
criterion_main!(benches);
