//! Property-based tests for value log chunk chains.
//!
//! Any sequence of appends to one logical value must read back as the
//! concatenation in append order, before and after chunk compaction, in both
//! plain and compressed mode and across a reopen.

use indexio::storage::{CreationOptions, ValueLog};
use proptest::prelude::*;
use tempfile::tempdir;

fn chunks_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..300), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn chunk_chain_reads_back_in_append_order(
        chunks in chunks_strategy(),
        compression in any::<bool>(),
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values");
        let options = CreationOptions::default().with_compression(compression);
        let expected: Vec<u8> = chunks.concat();

        let compacted = {
            let mut log = ValueLog::open(&path, options.clone()).unwrap();
            let mut tail = 0;
            for chunk in &chunks {
                let next = log.append_bytes(chunk, tail).unwrap();
                prop_assert!(next > tail);
                tail = next;
            }

            let result = log.read_bytes(tail).unwrap();
            prop_assert_eq!(&result.bytes, &expected);
            prop_assert_eq!(result.chunk_count as usize, chunks.len());

            let address = if log.performs_chunk_compaction(result.chunk_count) {
                log.compact_chunks(None, &result).unwrap()
            } else {
                tail
            };
            log.close().unwrap();
            address
        };

        let mut log = ValueLog::open(&path, options).unwrap();
        let reread = log.read_bytes(compacted).unwrap();
        prop_assert_eq!(reread.bytes, expected);
        prop_assert_eq!(reread.chunk_count, 1);
    }
}
