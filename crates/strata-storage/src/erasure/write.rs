use std::sync::Arc;

use futures::future::join_all;
use sha2::{Digest, Sha256};
use strata_common::error::{Result, StrataError};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use super::{Erasure, read_full};
use crate::naming::{is_valid_path, is_valid_volname};
use crate::traits::{StorageAPI, WriteSink};

/// Result of streaming one file into the erasure set.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// SHA-256 of the shard file per disk, `None` where the disk dropped out.
    pub checksums: Vec<Option<String>>,
    /// Bytes consumed from the input.
    pub size: u64,
}

struct ShardWriter {
    sink: WriteSink,
    hasher: Sha256,
}

impl Erasure {
    /// Encodes `reader` block by block and writes shard `i` to
    /// `online_disks[i]`. Disks that fail are dropped; the write fails once
    /// fewer than `write_quorum` remain.
    pub async fn create_file<R>(
        &self,
        online_disks: &[Option<Arc<dyn StorageAPI>>],
        volume: &str,
        path: &str,
        reader: &mut R,
        write_quorum: usize,
    ) -> Result<WriteOutcome>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        if !is_valid_volname(volume) || !is_valid_path(path) {
            return Err(StrataError::InvalidArgument(format!(
                "invalid write target: {volume}/{path}"
            )));
        }
        if online_disks.len() != self.config.total_shards() {
            return Err(StrataError::InternalError(format!(
                "expected {} disks, got {}",
                self.config.total_shards(),
                online_disks.len()
            )));
        }

        let opens = online_disks.iter().map(|disk| async move {
            match disk {
                Some(disk) => match disk.create_file(volume, path).await {
                    Ok(sink) => Some(ShardWriter {
                        sink,
                        hasher: Sha256::new(),
                    }),
                    Err(err) => {
                        warn!(disk = %disk.endpoint(), volume, path, error = %err, "failed to create shard file");
                        None
                    }
                },
                None => None,
            }
        });
        let mut writers: Vec<Option<ShardWriter>> = join_all(opens).await;
        check_write_quorum(&writers, write_quorum)?;

        let mut buf = vec![0_u8; self.config.block_size];
        let mut size = 0_u64;
        loop {
            let n = read_full(reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            size += n as u64;

            let shards = self.encode_block(&buf[..n])?;
            let writes = writers
                .iter_mut()
                .zip(shards.iter())
                .map(|(writer, shard)| async move {
                    match writer {
                        Some(writer) => Some(writer.sink.write_all(shard).await),
                        None => None,
                    }
                });
            let results = join_all(writes).await;

            for (idx, result) in results.into_iter().enumerate() {
                match result {
                    Some(Ok(())) => {
                        if let Some(writer) = writers[idx].as_mut() {
                            writer.hasher.update(&shards[idx]);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(shard = idx, volume, path, error = %err, "dropping disk after write failure");
                        writers[idx] = None;
                    }
                    None => {}
                }
            }
            check_write_quorum(&writers, write_quorum)?;

            if n < buf.len() {
                break;
            }
        }

        let shutdowns = writers.iter_mut().map(|writer| async move {
            match writer {
                Some(writer) => Some(writer.sink.shutdown().await),
                None => None,
            }
        });
        let results = join_all(shutdowns).await;
        for (idx, result) in results.into_iter().enumerate() {
            if let Some(Err(err)) = result {
                warn!(shard = idx, volume, path, error = %err, "dropping disk after flush failure");
                writers[idx] = None;
            }
        }
        check_write_quorum(&writers, write_quorum)?;

        let checksums = writers
            .into_iter()
            .map(|writer| writer.map(|writer| hex::encode(writer.hasher.finalize())))
            .collect();
        debug!(volume, path, size, "erasure coded file written");
        Ok(WriteOutcome { checksums, size })
    }
}

fn check_write_quorum(writers: &[Option<ShardWriter>], write_quorum: usize) -> Result<()> {
    let online = writers.iter().filter(|writer| writer.is_some()).count();
    if online < write_quorum {
        warn!(online, write_quorum, "write quorum lost");
        return Err(StrataError::InsufficientWriteQuorum);
    }
    Ok(())
}
