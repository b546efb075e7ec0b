// Reader for the companion data file holding memory snapshots

use super::error::{Result, SyncError};
use super::point::{DataBlock, DataKind};
use super::stream::ByteStream;
use super::types::{SYNC_DATA_END, SYNC_POINT_DATA_MAGIC};
use memmap2::Mmap;

/// Resolves the data blocks a record points at.
pub struct DataReader<B = Mmap> {
    stream: ByteStream<B>,
}

impl<B: AsRef<[u8]>> DataReader<B> {
    /// Wrap the bytes of a data file, checking its magic.
    pub fn from_bytes(bytes: B) -> Result<Self> {
        let mut stream = ByteStream::new(bytes);

        let Some(magic) = stream.read_u64() else {
            return Err(SyncError::DataFileTooSmall {
                expected: 8,
                actual: stream.len(),
            });
        };

        if magic != SYNC_POINT_DATA_MAGIC {
            return Err(SyncError::InvalidDataMagic {
                expected: SYNC_POINT_DATA_MAGIC,
                got: magic,
            });
        }

        Ok(Self { stream })
    }

    /// Decode the block list starting at `offset`. Offset 0 means the record
    /// has no data. A block cut off by the end of the file is dropped.
    pub fn blocks_at(&mut self, offset: u64) -> Vec<DataBlock> {
        let mut blocks = Vec::new();
        if offset == 0 {
            return blocks;
        }

        self.stream.seek(offset);
        while let Some(block) = self.read_block() {
            blocks.push(block);
        }
        blocks
    }

    fn read_block(&mut self) -> Option<DataBlock> {
        let tag = self.stream.read_u32()?;
        if tag == SYNC_DATA_END {
            return None;
        }

        let offset = self.stream.read_u64()?;
        let data = self.stream.read_prefixed_bytes()?;

        Some(DataBlock {
            kind: DataKind::from_tag(tag),
            offset,
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }
}
