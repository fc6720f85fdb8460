use criterion::{criterion_group, criterion_main, Criterion};
use flow_math::comm::{Communicator, LocalComm, SelfComm};
use flow_math::sparse::{AssembledSystem, DistributedSparseSystem, SpRow};
use std::hint::black_box;

/// 5-point Laplacian on an n × n grid, rows split evenly over `nranks`.
fn laplacian_rows(n: usize, nranks: usize, rank: usize) -> (DistributedSparseSystem, Vec<i64>) {
    let total = n * n;
    let row_cumsum: Vec<i64> = (0..=nranks).map(|r| (r * total / nranks) as i64).collect();
    let owner = |g: i64| row_cumsum.partition_point(|&c| c <= g) - 1;
    let mut sys = DistributedSparseSystem::new(rank, nranks);
    let (lo, hi) = (row_cumsum[rank], row_cumsum[rank + 1]);
    sys.reserve((hi - lo) as usize);
    for g in lo..hi {
        let (i, j) = ((g as usize) % n, (g as usize) / n);
        let mut row = SpRow::new(g);
        row.push(g, -4.0);
        let mut nb = Vec::new();
        if i > 0 {
            nb.push(g - 1);
        }
        if i + 1 < n {
            nb.push(g + 1);
        }
        if j > 0 {
            nb.push(g - n as i64);
        }
        if j + 1 < n {
            nb.push(g + n as i64);
        }
        for c in nb {
            if (lo..hi).contains(&c) {
                row.push(c, 1.0);
            } else {
                row.push_remote(owner(c), c, 1.0);
            }
        }
        sys.push_row(&row).expect("row");
    }
    (sys, row_cumsum)
}

fn finalize_single(n: usize) -> AssembledSystem {
    let comm = SelfComm::new();
    let (sys, cumsum) = laplacian_rows(n, 1, 0);
    sys.finalize(&cumsum, &comm).expect("finalize")
}

fn bench_spmv_single(c: &mut Criterion) {
    let comm = SelfComm::new();
    let sys = finalize_single(128);
    let x = vec![1.0; sys.owned_rows()];
    let mut y = vec![0.0; sys.owned_rows()];
    let mut ext = Vec::new();
    c.bench_function("spmv_128x128_1rank", |b| {
        b.iter(|| {
            sys.spmv(&comm, &x, &mut y, &mut ext).expect("spmv");
            black_box(y[0]);
        })
    });
}

fn bench_finalize_4ranks(c: &mut Criterion) {
    let mut group = c.benchmark_group("finalize_64x64");
    group.sample_size(20);
    group.bench_function("4ranks", |b| {
        b.iter(|| {
            let world = LocalComm::world(4);
            std::thread::scope(|s| {
                for comm in world {
                    s.spawn(move || {
                        let (sys, cumsum) = laplacian_rows(64, 4, comm.rank());
                        let sys = sys.finalize(&cumsum, &comm).expect("finalize");
                        black_box(sys.ext_len());
                    });
                }
            });
        })
    });
    group.finish();
}

criterion_group!(benches, bench_spmv_single, bench_finalize_4ranks);
criterion_main!(benches);
