use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::future::join_all;
use strata_common::error::{Result, StrataError};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Erasure, read_full};
use crate::naming::{is_valid_path, is_valid_volname};
use crate::traits::{ReadStream, StorageAPI};

/// Decoded blocks buffered between the decode task and the consumer.
const READ_AHEAD_BLOCKS: usize = 4;

/// Consumer side of a decode pipeline. Yields decoded bytes in order and
/// surfaces the first decode error.
pub struct ErasureReader {
    rx: mpsc::Receiver<Result<Bytes>>,
    pending: Bytes,
}

impl ErasureReader {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }

    /// Builds a reader and the sender that feeds it.
    pub(crate) fn channel() -> (mpsc::Sender<Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(READ_AHEAD_BLOCKS);
        (tx, Self::new(rx))
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        loop {
            match self.rx.recv().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Ok(Some(chunk)),
                Some(Err(err)) => return Err(err),
                None => return Ok(None),
            }
        }
    }

    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl AsyncRead for ErasureReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !self.pending.is_empty() {
                let n = buf.remaining().min(self.pending.len());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl Erasure {
    /// Streams `length` bytes of a file starting at `start_offset`, reading
    /// shards from every disk of the set.
    pub async fn read_file(
        &self,
        volume: &str,
        path: &str,
        start_offset: u64,
        length: u64,
    ) -> Result<ErasureReader> {
        let disks: Vec<Option<Arc<dyn StorageAPI>>> =
            self.disks.iter().cloned().map(Some).collect();
        self.read_file_from(&disks, volume, path, start_offset, length)
            .await
    }

    /// Same as [`Erasure::read_file`] restricted to `online_disks`; `None`
    /// entries count as missing shards.
    pub async fn read_file_from(
        &self,
        online_disks: &[Option<Arc<dyn StorageAPI>>],
        volume: &str,
        path: &str,
        start_offset: u64,
        length: u64,
    ) -> Result<ErasureReader> {
        if !is_valid_volname(volume) || !is_valid_path(path) {
            return Err(StrataError::InvalidArgument(format!(
                "invalid read target: {volume}/{path}"
            )));
        }
        if online_disks.len() != self.config.total_shards() {
            return Err(StrataError::InternalError(format!(
                "expected {} disks, got {}",
                self.config.total_shards(),
                online_disks.len()
            )));
        }

        // Shards are block interleaved, so every stream starts at offset 0
        // and slicing happens after decoding.
        let opens = online_disks.iter().map(|disk| async move {
            let disk = disk.as_ref()?;
            match disk.read_file(volume, path, 0).await {
                Ok(stream) => Some(stream),
                Err(err) => {
                    debug!(disk = %disk.endpoint(), volume, path, error = %err, "shard unavailable");
                    None
                }
            }
        });
        let streams: Vec<Option<ReadStream>> = join_all(opens).await;

        let (tx, reader) = ErasureReader::channel();
        let erasure = self.clone();
        let label = format!("{volume}/{path}");
        tokio::spawn(async move {
            let mut streams = streams;
            let result =
                decode_blocks(&erasure, &mut streams, start_offset, length, &tx, &label).await;
            if let Err(err) = result {
                warn!(file = %label, error = %err, "erasure read failed");
                let _ = tx.send(Err(err)).await;
            }
        });

        Ok(reader)
    }
}

async fn decode_blocks(
    erasure: &Erasure,
    streams: &mut [Option<ReadStream>],
    start_offset: u64,
    length: u64,
    tx: &mpsc::Sender<Result<Bytes>>,
    label: &str,
) -> Result<()> {
    let block_size = erasure.config().block_size;
    let shard_len = erasure.config().encoded_block_len(block_size);
    let mut skip = start_offset;
    let mut remaining = length;

    while remaining > 0 {
        if streams.iter().all(Option::is_none) {
            return Err(StrataError::DataCorrupt);
        }

        let reads = streams.iter_mut().map(|stream| async move {
            let stream = stream.as_mut()?;
            let mut buf = vec![0_u8; shard_len];
            Some(read_full(stream, &mut buf).await.map(|n| {
                buf.truncate(n);
                buf
            }))
        });
        let results = join_all(reads).await;

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(results.len());
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(buf)) => shards.push(Some(buf)),
                Some(Err(err)) => {
                    warn!(file = %label, shard = idx, error = %err, "dropping shard stream after read error");
                    streams[idx] = None;
                    shards.push(None);
                }
                None => shards.push(None),
            }
        }

        match shards.iter().flatten().map(Vec::len).max() {
            None => return Err(StrataError::DataCorrupt),
            // Every live stream is at end of data.
            Some(0) => return Ok(()),
            Some(len) => {
                for (idx, shard) in shards.iter_mut().enumerate() {
                    if shard.as_ref().is_some_and(|bytes| bytes.len() != len) {
                        warn!(file = %label, shard = idx, "shard truncated, treating as missing");
                        *shard = None;
                        streams[idx] = None;
                    }
                }
            }
        }

        if !erasure.verify_block(&shards)? {
            let missing = shards.iter().filter(|shard| shard.is_none()).count();
            erasure.reconstruct_block(&mut shards)?;
            if !erasure.verify_block(&shards)? {
                return Err(StrataError::VerificationFailed);
            }
            debug!(file = %label, missing, "block reconstructed");
        }

        let mut block = erasure.get_data_blocks(&shards)?;
        block.truncate(block_size);
        let block_len = block.len() as u64;
        if skip >= block_len {
            skip -= block_len;
            continue;
        }

        let begin = skip as usize;
        skip = 0;
        let end = block_len.min(begin as u64 + remaining) as usize;
        remaining -= (end - begin) as u64;

        if tx.send(Ok(Bytes::from(block).slice(begin..end))).await.is_err() {
            // Consumer went away.
            return Ok(());
        }
    }

    Ok(())
}
