use std::sync::Arc;

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use serde::{Deserialize, Serialize};
use strata_common::error::{Result, StrataError};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::traits::StorageAPI;

pub mod objects;
pub mod read;
pub mod write;

pub use read::ErasureReader;
pub use write::WriteOutcome;

pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub block_size: usize,
}

impl ErasureConfig {
    /// Splits a disk set evenly between data and parity. With an odd disk
    /// count the last disk is left out of the set.
    pub fn for_disks(disk_count: usize, block_size: usize) -> Self {
        Self {
            data_shards: disk_count / 2,
            parity_shards: disk_count / 2,
            block_size,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Per-disk shard length for a block of `len` bytes. The codec works on
    /// even shard sizes, so the length is rounded up.
    pub fn encoded_block_len(&self, len: usize) -> usize {
        if self.data_shards == 0 {
            return 0;
        }
        let shard_len = len.div_ceil(self.data_shards);
        shard_len + shard_len % 2
    }

    pub fn read_quorum(&self) -> usize {
        self.data_shards
    }

    pub fn write_quorum(&self) -> usize {
        self.data_shards + 1
    }

    fn validate(&self) -> Result<()> {
        if self.data_shards == 0 {
            return Err(StrataError::ErasureConfig(
                "data_shards must be greater than zero".to_string(),
            ));
        }
        if self.parity_shards == 0 {
            return Err(StrataError::ErasureConfig(
                "parity_shards must be greater than zero".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(StrataError::ErasureConfig(
                "block_size must be greater than zero".to_string(),
            ));
        }
        ReedSolomonEncoder::new(self.data_shards, self.parity_shards, 2)
            .map_err(|err| StrataError::ErasureConfig(err.to_string()))?;
        Ok(())
    }
}

/// Codec engine for one erasure set: shard `i` of every block lives on
/// disk `i`.
#[derive(Debug, Clone)]
pub struct Erasure {
    config: ErasureConfig,
    disks: Vec<Arc<dyn StorageAPI>>,
}

impl Erasure {
    pub fn new(mut disks: Vec<Arc<dyn StorageAPI>>, block_size: usize) -> Result<Self> {
        let config = ErasureConfig::for_disks(disks.len(), block_size);
        config.validate()?;
        disks.truncate(config.total_shards());
        Ok(Self { config, disks })
    }

    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// The same disk set with the block layout of an existing file, as
    /// recorded in its metadata.
    pub fn with_block_size(&self, block_size: usize) -> Result<Self> {
        let config = ErasureConfig {
            block_size,
            ..self.config.clone()
        };
        config.validate()?;
        Ok(Self {
            config,
            disks: self.disks.clone(),
        })
    }

    pub fn disks(&self) -> &[Arc<dyn StorageAPI>] {
        &self.disks
    }

    /// Splits one block into `data_shards + parity_shards` equally sized shards.
    pub fn encode_block(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let total = self.config.total_shards();
        if data.is_empty() {
            return Ok(vec![Vec::new(); total]);
        }
        if data.len() > self.config.block_size {
            return Err(StrataError::InvalidArgument(format!(
                "block of {} bytes exceeds block_size {}",
                data.len(),
                self.config.block_size
            )));
        }

        let shard_len = self.config.encoded_block_len(data.len());
        let mut payload = vec![0_u8; shard_len * self.config.data_shards];
        payload[..data.len()].copy_from_slice(data);

        let mut shards: Vec<Vec<u8>> = payload.chunks(shard_len).map(<[u8]>::to_vec).collect();
        let parity = {
            let data_refs: Vec<&[u8]> = shards.iter().map(Vec::as_slice).collect();
            self.encode_parity(&data_refs, shard_len)?
        };
        shards.extend(parity);
        Ok(shards)
    }

    /// Recomputes parity from the data shards and compares it with the
    /// stored parity. Any missing shard makes the block unverified.
    pub fn verify_block(&self, shards: &[Option<Vec<u8>>]) -> Result<bool> {
        let Some(shard_len) = self.shard_len(shards)? else {
            return Ok(false);
        };
        if shards.iter().any(Option::is_none) {
            return Ok(false);
        }
        if shard_len == 0 {
            return Ok(true);
        }

        let data_shards = self.config.data_shards;
        let data_refs: Vec<&[u8]> = shards[..data_shards].iter().flatten().map(Vec::as_slice).collect();
        let expected = self.encode_parity(&data_refs, shard_len)?;
        Ok(shards[data_shards..]
            .iter()
            .flatten()
            .zip(expected.iter())
            .all(|(stored, computed)| stored == computed))
    }

    /// Fills every missing shard in place from the surviving ones.
    pub fn reconstruct_block(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let data_shards = self.config.data_shards;
        let present = shards.iter().filter(|shard| shard.is_some()).count();
        let Some(shard_len) = self.shard_len(shards)? else {
            return Err(StrataError::InsufficientReadQuorum);
        };
        if present == shards.len() {
            return Ok(());
        }
        if present < data_shards {
            return Err(StrataError::InsufficientReadQuorum);
        }
        if shard_len == 0 {
            shards.iter_mut().for_each(|shard| *shard = Some(Vec::new()));
            return Ok(());
        }

        if shards[..data_shards].iter().any(Option::is_none) {
            let mut decoder =
                ReedSolomonDecoder::new(data_shards, self.config.parity_shards, shard_len)
                    .map_err(map_reed_solomon_error)?;
            for (idx, shard) in shards[..data_shards].iter().enumerate() {
                if let Some(bytes) = shard {
                    decoder
                        .add_original_shard(idx, bytes)
                        .map_err(map_reed_solomon_error)?;
                }
            }
            for (idx, shard) in shards[data_shards..].iter().enumerate() {
                if let Some(bytes) = shard {
                    decoder
                        .add_recovery_shard(idx, bytes)
                        .map_err(map_reed_solomon_error)?;
                }
            }

            let decoded = decoder.decode().map_err(map_reed_solomon_error)?;
            let restored: Vec<(usize, Vec<u8>)> = decoded
                .restored_original_iter()
                .map(|(idx, bytes)| (idx, bytes.to_vec()))
                .collect();
            for (idx, bytes) in restored {
                if idx < data_shards {
                    shards[idx] = Some(bytes);
                }
            }
        }

        if shards[data_shards..].iter().any(Option::is_none) {
            let data_refs = shards[..data_shards]
                .iter()
                .map(|shard| shard.as_deref())
                .collect::<Option<Vec<&[u8]>>>()
                .ok_or_else(|| {
                    StrataError::Codec("decoder did not restore all data shards".to_string())
                })?;
            let parity = self.encode_parity(&data_refs, shard_len)?;
            for (slot, bytes) in shards[data_shards..].iter_mut().zip(parity) {
                if slot.is_none() {
                    *slot = Some(bytes);
                }
            }
        }

        Ok(())
    }

    /// Concatenated data shards of a complete block, padding included.
    pub fn get_data_blocks(&self, shards: &[Option<Vec<u8>>]) -> Result<Vec<u8>> {
        let data_shards = self.config.data_shards;
        let mut block = Vec::with_capacity(
            shards
                .iter()
                .take(data_shards)
                .flatten()
                .map(Vec::len)
                .sum(),
        );
        for shard in shards.iter().take(data_shards) {
            let bytes = shard
                .as_ref()
                .ok_or_else(|| StrataError::Codec("missing data shard".to_string()))?;
            block.extend_from_slice(bytes);
        }
        Ok(block)
    }

    fn encode_parity(&self, data: &[&[u8]], shard_len: usize) -> Result<Vec<Vec<u8>>> {
        let mut encoder =
            ReedSolomonEncoder::new(self.config.data_shards, self.config.parity_shards, shard_len)
                .map_err(map_reed_solomon_error)?;
        for shard in data {
            encoder
                .add_original_shard(shard)
                .map_err(map_reed_solomon_error)?;
        }
        let encoded = encoder.encode().map_err(map_reed_solomon_error)?;
        Ok(encoded.recovery_iter().map(<[u8]>::to_vec).collect())
    }

    /// Common length of the present shards, `None` when every shard is missing.
    fn shard_len(&self, shards: &[Option<Vec<u8>>]) -> Result<Option<usize>> {
        if shards.len() != self.config.total_shards() {
            return Err(StrataError::Codec(format!(
                "invalid shard count: expected {}, got {}",
                self.config.total_shards(),
                shards.len()
            )));
        }

        let mut lengths = shards.iter().flatten().map(Vec::len);
        let Some(first) = lengths.next() else {
            return Ok(None);
        };
        if let Some(other) = lengths.find(|len| *len != first) {
            return Err(StrataError::Codec(format!(
                "inconsistent shard sizes: {first} and {other}"
            )));
        }
        Ok(Some(first))
    }
}

/// Fills `buf` from `reader`, stopping early only at end of stream.
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn map_reed_solomon_error(error: reed_solomon_simd::Error) -> StrataError {
    StrataError::Codec(format!("reed-solomon error: {error}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::xl::storage::XlStorage;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|idx| (idx * 31 % 251) as u8).collect()
    }

    async fn erasure_set(disk_count: usize, block_size: usize) -> (tempfile::TempDir, Result<Erasure>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut disks: Vec<Arc<dyn StorageAPI>> = Vec::new();
        for idx in 0..disk_count {
            let root: PathBuf = temp_dir.path().join(format!("disk{idx}"));
            disks.push(Arc::new(XlStorage::new(root).await.unwrap()));
        }
        let erasure = Erasure::new(disks, block_size);
        (temp_dir, erasure)
    }

    #[test]
    fn config_splits_disks_evenly() {
        let config = ErasureConfig::for_disks(7, 1024);
        assert_eq!(config.data_shards, 3);
        assert_eq!(config.parity_shards, 3);
        assert_eq!(config.total_shards(), 6);
        assert_eq!(config.encoded_block_len(10), 4);
        assert_eq!(config.encoded_block_len(12), 4);
        assert_eq!(config.encoded_block_len(13), 6);
        assert_eq!(config.read_quorum(), 3);
        assert_eq!(config.write_quorum(), 4);
    }

    #[tokio::test]
    async fn rejects_configurations_without_data_shards() {
        let (_temp_dir, result) = erasure_set(1, 1024).await;
        assert!(matches!(result, Err(StrataError::ErasureConfig(_))));

        let (_temp_dir, result) = erasure_set(4, 0).await;
        assert!(matches!(result, Err(StrataError::ErasureConfig(_))));
    }

    #[tokio::test]
    async fn odd_disk_count_leaves_last_disk_out() {
        let (_temp_dir, result) = erasure_set(5, 1024).await;
        let erasure = result.unwrap();
        assert_eq!(erasure.disks().len(), 4);
        assert_eq!(erasure.config().data_shards, 2);
    }

    #[tokio::test]
    async fn block_size_override_keeps_shard_layout() {
        let (_temp_dir, result) = erasure_set(4, 4096).await;
        let erasure = result.unwrap();

        let narrow = erasure.with_block_size(1024).unwrap();
        assert_eq!(narrow.config().block_size, 1024);
        assert_eq!(narrow.config().data_shards, 2);
        assert_eq!(narrow.disks().len(), 4);
        assert_eq!(erasure.config().block_size, 4096);

        assert!(matches!(erasure.with_block_size(0), Err(StrataError::ErasureConfig(_))));
    }

    #[tokio::test]
    async fn reconstructs_any_loss_within_parity() {
        for disk_count in [2, 4, 6, 8] {
            let (_temp_dir, result) = erasure_set(disk_count, 1000).await;
            let erasure = result.unwrap();
            let data = sample(997);
            let shards = erasure.encode_block(&data).unwrap();
            let total = shards.len();
            let parity = erasure.config().parity_shards;

            let complete: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
            assert!(erasure.verify_block(&complete).unwrap());

            for mask in 0_u32..(1 << total) {
                if mask.count_ones() as usize > parity {
                    continue;
                }
                let mut damaged = complete.clone();
                for (idx, shard) in damaged.iter_mut().enumerate() {
                    if mask & (1 << idx) != 0 {
                        *shard = None;
                    }
                }

                erasure.reconstruct_block(&mut damaged).unwrap();
                assert!(erasure.verify_block(&damaged).unwrap());
                assert_eq!(damaged, complete, "disks={disk_count} mask={mask:b}");
                let block = erasure.get_data_blocks(&damaged).unwrap();
                assert_eq!(&block[..data.len()], data.as_slice());
            }
        }
    }

    #[tokio::test]
    async fn reconstruction_needs_data_shards() {
        let (_temp_dir, result) = erasure_set(4, 64).await;
        let erasure = result.unwrap();
        let mut shards: Vec<Option<Vec<u8>>> =
            erasure.encode_block(&sample(64)).unwrap().into_iter().map(Some).collect();
        shards[0] = None;
        shards[1] = None;
        shards[3] = None;

        assert!(matches!(
            erasure.reconstruct_block(&mut shards),
            Err(StrataError::InsufficientReadQuorum)
        ));
    }

    #[tokio::test]
    async fn verify_detects_tampering_and_bad_input() {
        let (_temp_dir, result) = erasure_set(4, 64).await;
        let erasure = result.unwrap();
        let mut shards: Vec<Option<Vec<u8>>> =
            erasure.encode_block(&sample(50)).unwrap().into_iter().map(Some).collect();

        if let Some(bytes) = shards[1].as_mut() {
            bytes[0] ^= 0xff;
        }
        assert!(!erasure.verify_block(&shards).unwrap());

        assert!(matches!(
            erasure.verify_block(&shards[..3]),
            Err(StrataError::Codec(_))
        ));

        if let Some(bytes) = shards[2].as_mut() {
            bytes.push(0);
        }
        assert!(matches!(
            erasure.verify_block(&shards),
            Err(StrataError::Codec(_))
        ));
    }
}
