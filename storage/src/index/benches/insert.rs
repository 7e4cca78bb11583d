use super::{get_index, random_locators, temp_path};
use criterion::{criterion_group, Criterion, Throughput};
use std::time::{Duration, Instant};

fn bench_insert(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group(module_path!());
    for items in [1_000, 10_000, 100_000] {
        let locators = random_locators(items);
        group.throughput(Throughput::Elements(items as u64));
        group.bench_function(format!("items={items}"), |b| {
            b.iter_custom(|iters| {
                runtime.block_on(async {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let path = temp_path("insert");
                        // Sized so inserts never observe a full buffer
                        let mut index = get_index(path.clone(), items).await;

                        let start = Instant::now();
                        for locator in &locators {
                            index
                                .insert(locator.key, locator.offset, locator.size)
                                .unwrap();
                        }
                        index.sync().await.unwrap();
                        total += start.elapsed();

                        index.close().unwrap().await.unwrap();
                        std::fs::remove_file(path).unwrap();
                    }
                    total
                })
            });
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_insert
}
