use criterion::{criterion_group, criterion_main, Criterion};

use zgc::{Generation, Heap, HeapConfig, Slot};

fn allocate_only(c: &mut Criterion) {
    c.bench_function("allocate_young_single_slot", |b| {
        let heap = Heap::new(HeapConfig::default());
        b.iter(|| {
            let h = heap.allocate(1, Generation::Young).unwrap();
            h.decref();
        });
    });
}

fn allocate_store_load(c: &mut Criterion) {
    c.bench_function("allocate_store_load_roundtrip", |b| {
        let heap = Heap::new(HeapConfig::default());
        b.iter(|| {
            let h = heap.allocate(1, Generation::Young).unwrap();
            heap.store(h, 0, Slot::Foreign(1)).unwrap();
            let _ = heap.load(h, 0).unwrap();
            h.decref();
        });
    });
}

fn minor_gc_with_garbage(c: &mut Criterion) {
    c.bench_function("minor_gc_1000_unrooted", |b| {
        let heap = Heap::new(HeapConfig::default());
        b.iter(|| {
            for _ in 0..1000 {
                let h = heap.allocate(1, Generation::Young).unwrap();
                h.decref();
            }
            heap.minor_gc();
        });
    });
}

criterion_group!(benches, allocate_only, allocate_store_load, minor_gc_with_garbage);
criterion_main!(benches);
