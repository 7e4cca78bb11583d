#![no_main]

use arbitrary::{Arbitrary, Result, Unstructured};
use haystack_storage::{
    index::{Config, Index},
    Locator,
};
use libfuzzer_sys::fuzz_target;
use std::num::NonZeroUsize;

/// Largest needle size accepted by the fuzzed index.
const MAX_RECORD_SIZE: u32 = 4096;

fn bounded_size(u: &mut Unstructured<'_>) -> Result<i32> {
    u.int_in_range(1..=MAX_RECORD_SIZE as i32)
}

fn bounded_capacity(u: &mut Unstructured<'_>) -> Result<usize> {
    u.int_in_range(1..=64)
}

#[derive(Arbitrary, Debug, Clone)]
enum IndexOperation {
    Insert {
        key: i64,
        offset: u32,
        #[arbitrary(with = bounded_size)]
        size: i32,
    },
    Flush,
    Sync,
    Recover,
    CloseReopen,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    #[arbitrary(with = bounded_capacity)]
    capacity: usize,
    operations: Vec<IndexOperation>,
}

async fn recover(index: &Index) -> Vec<Locator> {
    let mut recovered = Vec::new();
    index
        .recover(|locator| {
            recovered.push(locator);
            Ok(())
        })
        .await
        .unwrap();
    recovered
}

fn fuzz(input: FuzzInput) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let path = std::env::temp_dir().join(format!("haystack_fuzz_{}", rand::random::<u64>()));
    runtime.block_on(async {
        let mut cfg = Config::new(
            path.clone(),
            NonZeroUsize::new(input.capacity).unwrap(),
            MAX_RECORD_SIZE,
        );
        cfg.preallocate = 0;
        let mut index = Index::init(cfg).await.unwrap();
        let mut expected = Vec::new();

        for op in input.operations {
            match op {
                IndexOperation::Insert { key, offset, size } => {
                    // Make room instead of wedging the index
                    if index.pending() == input.capacity {
                        index.sync().await.unwrap();
                    }
                    index.insert(key, offset, size).unwrap();
                    expected.push(Locator::new(key, offset, size));
                }
                IndexOperation::Flush => {
                    index.flush().await.unwrap();
                }
                IndexOperation::Sync => {
                    index.sync().await.unwrap();
                    assert_eq!(index.pending(), 0);
                    assert_eq!(recover(&index).await, expected);
                }
                IndexOperation::Recover => {
                    // Whatever has been drained so far is a prefix of what was inserted
                    let recovered = recover(&index).await;
                    assert!(recovered.len() <= expected.len());
                    assert_eq!(recovered[..], expected[..recovered.len()]);
                }
                IndexOperation::CloseReopen => {
                    index.close().unwrap().await.unwrap();
                    index.reopen().await.unwrap();
                    assert_eq!(recover(&index).await, expected);
                }
            }
        }

        index.close().unwrap().await.unwrap();
        assert!(index.fault().is_none());
    });
    std::fs::remove_file(&path).unwrap();
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
