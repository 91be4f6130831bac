mod common;

use std::io::Cursor;

use common::{TestDisks, payload};
use strata_common::error::StrataError;
use strata_storage::Erasure;

const BLOCK_SIZE: usize = 1024;

async fn write_file(disks: &TestDisks, erasure: &Erasure, path: &str, data: &[u8]) {
    let mut reader = Cursor::new(data.to_vec());
    let outcome = erasure
        .create_file(
            &disks.slots(),
            "bucket",
            path,
            &mut reader,
            erasure.config().write_quorum(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.size, data.len() as u64);
    assert!(outcome.checksums.iter().all(Option::is_some));
}

async fn setup(disk_count: usize) -> (TestDisks, Erasure) {
    let disks = TestDisks::new(disk_count).await;
    disks.make_vol("bucket").await;
    let erasure = Erasure::new(disks.storage(), BLOCK_SIZE).unwrap();
    (disks, erasure)
}

#[tokio::test]
async fn round_trips_assorted_sizes() {
    let (disks, erasure) = setup(4).await;

    for (idx, len) in [0, 1, 700, BLOCK_SIZE, 3 * BLOCK_SIZE + 17].into_iter().enumerate() {
        let data = payload(len, idx as u8);
        let path = format!("object/part.{idx}");
        write_file(&disks, &erasure, &path, &data).await;

        let read = erasure
            .read_file("bucket", &path, 0, len as u64)
            .await
            .unwrap()
            .read_all()
            .await
            .unwrap();
        assert_eq!(read, data, "length {len}");
    }
}

#[tokio::test]
async fn serves_ranges_across_block_boundaries() {
    let (disks, erasure) = setup(4).await;
    let data = payload(4 * BLOCK_SIZE + 100, 9);
    write_file(&disks, &erasure, "ranged", &data).await;

    for (offset, length) in [
        (0, 10),
        (BLOCK_SIZE - 5, 10),
        (BLOCK_SIZE, BLOCK_SIZE),
        (2 * BLOCK_SIZE + 1, 2 * BLOCK_SIZE + 99),
        (data.len() - 1, 1),
    ] {
        let read = erasure
            .read_file("bucket", "ranged", offset as u64, length as u64)
            .await
            .unwrap()
            .read_all()
            .await
            .unwrap();
        assert_eq!(read, data[offset..offset + length], "range {offset}+{length}");
    }
}

#[tokio::test]
async fn serves_suffixes_starting_in_later_blocks() {
    let (disks, erasure) = setup(4).await;
    let data = payload(4 * BLOCK_SIZE + 100, 11);
    write_file(&disks, &erasure, "suffix", &data).await;

    for offset in [2 * BLOCK_SIZE + 300, 3 * BLOCK_SIZE, 4 * BLOCK_SIZE + 50, data.len()] {
        let read = erasure
            .read_file("bucket", "suffix", offset as u64, (data.len() - offset) as u64)
            .await
            .unwrap()
            .read_all()
            .await
            .unwrap();
        assert_eq!(read, data[offset..], "suffix from {offset}");
    }
}

#[tokio::test]
async fn short_shard_is_treated_as_missing() {
    let (disks, erasure) = setup(4).await;
    let data = payload(3 * BLOCK_SIZE + 100, 12);
    write_file(&disks, &erasure, "short", &data).await;

    // Two data shards per block of 1024 bytes: 512 bytes each. Keep the
    // first block whole and cut the second one short.
    disks.disks[1].truncate("bucket", "short", 700);
    let read = erasure
        .read_file("bucket", "short", 0, data.len() as u64)
        .await
        .unwrap()
        .read_all()
        .await
        .unwrap();
    assert_eq!(read, data);

    let read = erasure
        .read_file("bucket", "short", BLOCK_SIZE as u64 + 10, 2 * BLOCK_SIZE as u64)
        .await
        .unwrap()
        .read_all()
        .await
        .unwrap();
    assert_eq!(read, data[BLOCK_SIZE + 10..3 * BLOCK_SIZE + 10]);
}

#[tokio::test]
async fn tolerates_losing_parity_count_disks() {
    let (disks, erasure) = setup(6).await;
    let data = payload(5 * BLOCK_SIZE / 2, 3);
    write_file(&disks, &erasure, "resilient", &data).await;

    disks.set_offline(&[0, 2, 5]);
    let read = erasure
        .read_file("bucket", "resilient", 0, data.len() as u64)
        .await
        .unwrap()
        .read_all()
        .await
        .unwrap();
    assert_eq!(read, data);
}

#[tokio::test]
async fn fails_below_read_quorum() {
    let (disks, erasure) = setup(6).await;
    let data = payload(2 * BLOCK_SIZE, 4);
    write_file(&disks, &erasure, "fragile", &data).await;

    disks.set_offline(&[0, 1, 2, 3]);
    let result = erasure
        .read_file("bucket", "fragile", 0, data.len() as u64)
        .await
        .unwrap()
        .read_all()
        .await;
    assert!(matches!(result, Err(StrataError::InsufficientReadQuorum)));
}

#[tokio::test]
async fn nothing_readable_is_data_corrupt() {
    let (disks, erasure) = setup(4).await;
    let data = payload(100, 5);
    write_file(&disks, &erasure, "gone", &data).await;

    disks.set_offline(&[0, 1, 2, 3]);
    let result = erasure
        .read_file("bucket", "gone", 0, data.len() as u64)
        .await
        .unwrap()
        .read_all()
        .await;
    assert!(matches!(result, Err(StrataError::DataCorrupt)));
}

#[tokio::test]
async fn corrupted_shard_fails_verification() {
    let (disks, erasure) = setup(6).await;
    let data = payload(BLOCK_SIZE + 10, 6);
    write_file(&disks, &erasure, "tampered", &data).await;

    disks.disks[1].corrupt("bucket", "tampered");
    let result = erasure
        .read_file("bucket", "tampered", 0, data.len() as u64)
        .await
        .unwrap()
        .read_all()
        .await;
    assert!(matches!(result, Err(StrataError::VerificationFailed)));
}

#[tokio::test]
async fn corruption_with_missing_shards_is_detected() {
    let (disks, erasure) = setup(6).await;
    let data = payload(BLOCK_SIZE, 7);
    write_file(&disks, &erasure, "tampered", &data).await;

    disks.set_offline(&[4]);
    disks.disks[0].corrupt("bucket", "tampered");
    let result = erasure
        .read_file("bucket", "tampered", 0, data.len() as u64)
        .await
        .unwrap()
        .read_all()
        .await;
    assert!(matches!(result, Err(StrataError::VerificationFailed)));
}

#[tokio::test]
async fn write_fails_without_quorum() {
    let (disks, erasure) = setup(4).await;
    disks.set_offline(&[0, 1]);

    let mut reader = Cursor::new(payload(BLOCK_SIZE, 8));
    let result = erasure
        .create_file(
            &disks.slots(),
            "bucket",
            "unwritable",
            &mut reader,
            erasure.config().write_quorum(),
        )
        .await;
    assert!(matches!(result, Err(StrataError::InsufficientWriteQuorum)));
}
