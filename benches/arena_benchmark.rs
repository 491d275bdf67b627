use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, Criterion};
use nalloc_arena::{
    ArenaAllocator, Bitmap, Options, OsMemory, SystemOs, ARENA_BLOCK_SIZE, BITMAP_FIELD_BITS,
    SEGMENT_ALIGN,
};

/// Allocator with one arena over reserved (never touched) address space.
fn arena_allocator(blocks: usize) -> ArenaAllocator<SystemOs> {
    let os = SystemOs::new();
    let size = blocks * ARENA_BLOCK_SIZE;
    let region = os
        .alloc_aligned(size, SEGMENT_ALIGN, false, false)
        .expect("failed to reserve arena address space");
    let arenas = ArenaAllocator::with_os(os, Options::default());
    unsafe {
        arenas
            .manage_os_memory(region.ptr, size, false, true, None)
            .expect("failed to publish arena");
    }
    arenas
}

fn bench_bitmap(c: &mut Criterion) {
    let bitmap = Bitmap::try_new(4).unwrap();
    c.bench_function("bitmap_claim_unclaim_8", |b| {
        b.iter(|| {
            let idx = bitmap.try_claim_field(black_box(0), 8).unwrap();
            bitmap.unclaim(8, idx);
        })
    });
}

fn bench_arena_alloc_free(c: &mut Criterion) {
    let arenas = arena_allocator(BITMAP_FIELD_BITS);
    let size = 2 * ARENA_BLOCK_SIZE;
    c.bench_function("arena_alloc_free_2_blocks", |b| {
        b.iter(|| {
            let a = arenas.alloc(black_box(size), false, false).unwrap();
            unsafe { arenas.free(a.ptr.as_ptr(), size, a.memid).unwrap() };
        })
    });
}

fn bench_contended(c: &mut Criterion) {
    let arenas = Arc::new(arena_allocator(4 * BITMAP_FIELD_BITS));
    c.bench_function("arena_alloc_free_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let arenas = Arc::clone(&arenas);
                    thread::spawn(move || {
                        for _ in 0..100 {
                            let a = arenas.alloc(ARENA_BLOCK_SIZE, false, false).unwrap();
                            unsafe { arenas.free(a.ptr.as_ptr(), ARENA_BLOCK_SIZE, a.memid).unwrap() };
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_bitmap, bench_arena_alloc_free, bench_contended);
criterion_main!(benches);
