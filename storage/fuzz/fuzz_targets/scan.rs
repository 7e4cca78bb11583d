#![no_main]

use arbitrary::Arbitrary;
use haystack_storage::{index::scan, Locator};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    max_record_size: u32,
    data: Vec<u8>,
}

fn fuzz(input: FuzzInput) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut seen = Vec::new();
        let result = scan(Cursor::new(&input.data), input.max_record_size, |locator| {
            seen.push(locator);
            Ok(())
        })
        .await;

        // Every record handed out is valid and was read from its aligned position
        for (i, locator) in seen.iter().enumerate() {
            assert!(locator.is_valid(input.max_record_size));
            let start = i * Locator::SIZE;
            let raw: [u8; Locator::SIZE] =
                input.data[start..start + Locator::SIZE].try_into().unwrap();
            assert_eq!(Locator::decode(&raw), *locator);
        }

        match result {
            Ok(consumed) => {
                assert_eq!(consumed, seen.len() as u64 * Locator::SIZE_U64);
                assert!(input.data.len() as u64 - consumed < Locator::SIZE_U64);
            }
            Err(haystack_storage::Error::InvalidSize { offset, .. }) => {
                assert_eq!(offset, seen.len() as u64 * Locator::SIZE_U64);
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    });
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
