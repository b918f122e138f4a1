//! Reassembly of chunked FILE transfers.
//!
//! One partial transfer is buffered per sender. Chunks may arrive in any
//! order; the file is released only once every index in `0..total` is
//! present. Buffers are capped in bytes and evicted when they stall.
//!
//! `total` comes off the wire, so it is checked against the largest chunk
//! count a within-limits file can have before anything is buffered. Chunks
//! are stored sparsely; nothing is sized by `total`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, warn};
use trellis_common::config::MIN_FILE_CHUNK_SIZE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FileError {
    #[error("chunk {index} out of range for {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("file exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("{total} chunks exceeds the limit of {limit}")]
    TooManyChunks { total: u32, limit: u32 },
}

/// Most chunks a file of at most `max_file_bytes` can be split into.
pub fn chunk_limit(max_file_bytes: u64) -> u32 {
    let count = max_file_bytes.div_ceil(MIN_FILE_CHUNK_SIZE as u64).max(1);
    u32::try_from(count).unwrap_or(u32::MAX)
}

struct PartialFile {
    total: u32,
    chunks: BTreeMap<u32, Bytes>,
    bytes: u64,
    last_chunk_at: Instant,
}

impl PartialFile {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            total,
            chunks: BTreeMap::new(),
            bytes: 0,
            last_chunk_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u64 == u64::from(self.total)
    }

    fn assemble(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.bytes as usize);
        for chunk in self.chunks.into_values() {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

pub struct FileAssembler {
    partials: HashMap<String, PartialFile>,
    max_file_bytes: u64,
    max_chunks: u32,
    stall_timeout: Duration,
}

impl FileAssembler {
    pub fn new(max_file_bytes: u64, stall_timeout: Duration) -> Self {
        Self {
            partials: HashMap::new(),
            max_file_bytes,
            max_chunks: chunk_limit(max_file_bytes),
            stall_timeout,
        }
    }

    /// Buffer one chunk. Returns the whole file when this chunk completes it.
    pub fn accept(
        &mut self,
        sender: &str,
        index: u32,
        total: u32,
        data: Bytes,
    ) -> Result<Option<Bytes>, FileError> {
        if total == 0 || index >= total {
            return Err(FileError::ChunkOutOfRange { index, total });
        }
        if total > self.max_chunks {
            self.partials.remove(sender);
            return Err(FileError::TooManyChunks {
                total,
                limit: self.max_chunks,
            });
        }

        let now = Instant::now();
        self.evict_stalled(now);

        let restart = self
            .partials
            .get(sender)
            .map(|partial| partial.total != total)
            .unwrap_or(false);
        if restart {
            warn!(sender = %sender, "new transfer replaces incomplete one");
            self.partials.remove(sender);
        }

        let partial = self
            .partials
            .entry(sender.to_string())
            .or_insert_with(|| PartialFile::new(total, now));

        if partial.chunks.contains_key(&index) {
            debug!(sender = %sender, index, "duplicate chunk ignored");
            return Ok(None);
        }

        let bytes = partial.bytes.saturating_add(data.len() as u64);
        if bytes > self.max_file_bytes {
            self.partials.remove(sender);
            return Err(FileError::TooLarge {
                limit: self.max_file_bytes,
            });
        }

        partial.chunks.insert(index, data);
        partial.bytes = bytes;
        partial.last_chunk_at = now;

        if !partial.is_complete() {
            return Ok(None);
        }
        Ok(self.partials.remove(sender).map(PartialFile::assemble))
    }

    /// Drop transfers that have not received a chunk within the stall timeout.
    pub fn evict_stalled(&mut self, now: Instant) -> usize {
        let timeout = self.stall_timeout;
        let before = self.partials.len();
        self.partials.retain(|sender, partial| {
            let keep = now.duration_since(partial.last_chunk_at) <= timeout;
            if !keep {
                debug!(sender = %sender, received = partial.chunks.len(), total = partial.total, "stalled transfer evicted");
            }
            keep
        });
        before - self.partials.len()
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

/// Split `data` into chunks of at most `chunk_size` bytes. An empty file
/// still travels as one empty chunk.
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    let chunk_size = chunk_size.max(1);
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> FileAssembler {
        FileAssembler::new(1024, Duration::from_secs(30))
    }

    #[test]
    fn out_of_order_chunks_reassemble_exactly() {
        let original = Bytes::from((0u8..=250).collect::<Vec<_>>());
        let chunks = split_chunks(&original, 64);
        assert_eq!(chunks.len(), 4);

        let mut files = assembler();
        let total = chunks.len() as u32;
        for index in [2u32, 0, 3] {
            let out = files
                .accept("alice", index, total, chunks[index as usize].clone())
                .unwrap();
            assert!(out.is_none());
        }
        let done = files.accept("alice", 1, total, chunks[1].clone()).unwrap();
        assert_eq!(done, Some(original));
        assert_eq!(files.pending(), 0);
    }

    #[test]
    fn partial_set_never_assembles() {
        let mut files = assembler();
        assert_eq!(files.accept("a", 0, 3, Bytes::from_static(b"x")), Ok(None));
        assert_eq!(files.accept("a", 0, 3, Bytes::from_static(b"x")), Ok(None));
        assert_eq!(files.accept("a", 2, 3, Bytes::from_static(b"z")), Ok(None));
        assert_eq!(files.pending(), 1);
    }

    #[test]
    fn senders_are_buffered_separately() {
        let mut files = assembler();
        assert_eq!(files.accept("a", 0, 2, Bytes::from_static(b"a0")), Ok(None));
        assert_eq!(files.accept("b", 1, 2, Bytes::from_static(b"b1")), Ok(None));
        assert_eq!(
            files.accept("a", 1, 2, Bytes::from_static(b"a1")),
            Ok(Some(Bytes::from_static(b"a0a1")))
        );
        assert_eq!(files.pending(), 1);
    }

    #[test]
    fn oversized_transfer_is_dropped() {
        let mut files = FileAssembler::new(600, Duration::from_secs(30));
        assert_eq!(files.accept("a", 0, 2, Bytes::from(vec![1u8; 300])), Ok(None));
        assert_eq!(
            files.accept("a", 1, 2, Bytes::from(vec![2u8; 301])),
            Err(FileError::TooLarge { limit: 600 })
        );
        assert_eq!(files.pending(), 0);
    }

    #[test]
    fn chunk_count_beyond_the_size_limit_is_refused() {
        let max = 64 * 1024 * 1024;
        let limit = chunk_limit(max);
        assert_eq!(limit, 262_144);

        let mut files = FileAssembler::new(max, Duration::from_secs(30));
        assert_eq!(
            files.accept("mallory", 0, i32::MAX as u32, Bytes::from_static(b"x")),
            Err(FileError::TooManyChunks {
                total: i32::MAX as u32,
                limit,
            })
        );
        assert_eq!(files.pending(), 0);

        assert_eq!(
            files.accept("mallory", limit - 1, limit, Bytes::from_static(b"x")),
            Ok(None)
        );
        assert_eq!(files.pending(), 1);
    }

    #[test]
    fn chunk_limit_never_hits_zero() {
        assert_eq!(chunk_limit(0), 1);
        assert_eq!(chunk_limit(1), 1);
        assert_eq!(chunk_limit(u64::MAX), u32::MAX);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut files = assembler();
        assert!(files.accept("a", 3, 3, Bytes::new()).is_err());
        assert!(files.accept("a", 0, 0, Bytes::new()).is_err());
    }

    #[test]
    fn empty_file_is_one_chunk() {
        let chunks = split_chunks(&Bytes::new(), 16);
        assert_eq!(chunks.len(), 1);
        let mut files = assembler();
        assert_eq!(files.accept("a", 0, 1, chunks[0].clone()), Ok(Some(Bytes::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transfers_are_evicted() {
        let mut files = FileAssembler::new(1024, Duration::from_secs(5));
        files.accept("a", 0, 2, Bytes::from_static(b"x")).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(files.evict_stalled(Instant::now()), 1);

        // The late second chunk starts a fresh, incomplete transfer.
        assert_eq!(files.accept("a", 1, 2, Bytes::from_static(b"y")), Ok(None));
    }
}
