// Writer producing record/data file pairs in any supported layout

use super::error::Result;
use super::index::RecordIndex;
use super::point::RawPoint;
use super::record::RecordLayout;
use super::stream::StreamWriter;
use super::types::{
    SyncFileHeader, DEFAULT_RECORD_SIZE, LEGACY_RECORD_SIZE, SYNC_DATA_END, SYNC_HEADER_SIZE,
    SYNC_POINT_DATA_MAGIC, SYNC_POINT_FILE_VERSION, SYNC_POINT_MAGIC,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Header values of the file being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    pub version: u32,
    pub tool_version: u32,
    pub record_size: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            version: SYNC_POINT_FILE_VERSION,
            tool_version: 0,
            record_size: DEFAULT_RECORD_SIZE,
        }
    }
}

impl WriterConfig {
    /// 32-bit layout of versions 0 to 2.
    pub fn legacy(version: u32) -> Self {
        Self {
            version,
            tool_version: 0,
            record_size: LEGACY_RECORD_SIZE,
        }
    }
}

/// Appends sync points to a record file and their data blocks to the
/// companion data file.
pub struct SyncFileWriter<W: Write, D: Write> {
    records: StreamWriter<W>,
    data: StreamWriter<D>,
    layout: RecordLayout,
    with_data: bool,
    count: u64,
}

impl SyncFileWriter<BufWriter<File>, BufWriter<File>> {
    pub fn create(record_path: &Path, data_path: &Path, config: WriterConfig) -> Result<Self> {
        let records = BufWriter::new(File::create(record_path)?);
        let data = BufWriter::new(File::create(data_path)?);
        Self::new(records, data, config)
    }
}

impl<W: Write, D: Write> SyncFileWriter<W, D> {
    /// Write both file headers. Rejects versions and record sizes a reader
    /// would refuse.
    pub fn new(records: W, data: D, config: WriterConfig) -> Result<Self> {
        let header = SyncFileHeader {
            magic: SYNC_POINT_MAGIC,
            version: config.version,
            tool_version: config.tool_version,
            record_size: config.record_size,
        };
        let index = RecordIndex::from_header(&header, 0)?;

        let mut records = StreamWriter::new(records);
        records.write_layout(&header)?;
        records.write_zeros(SYNC_HEADER_SIZE as usize - std::mem::size_of::<SyncFileHeader>())?;

        let mut data = StreamWriter::new(data);
        data.write_u64(SYNC_POINT_DATA_MAGIC)?;

        Ok(Self {
            records,
            data,
            layout: index.layout(),
            // Version 0 traces have no data file
            with_data: config.version > 0,
            count: 0,
        })
    }

    /// Append one record. Its data blocks go to the data file unless the
    /// point has none.
    pub fn write_point(&mut self, point: &RawPoint) -> Result<()> {
        let data_offset = if self.with_data && !point.data.is_empty() {
            self.write_blocks(point)?
        } else {
            0
        };

        self.layout.encode(&mut self.records, point, data_offset)?;
        self.count += 1;
        Ok(())
    }

    fn write_blocks(&mut self, point: &RawPoint) -> Result<u32> {
        let offset = u32::try_from(self.data.position()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "data file exceeds 32-bit offsets",
            )
        })?;

        for block in &point.data {
            self.data.write_u32(block.kind.tag())?;
            self.data.write_u64(block.offset)?;
            self.data.write_prefixed_bytes(&block.data)?;
        }
        self.data.write_u32(SYNC_DATA_END)?;

        Ok(offset)
    }

    /// Records written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush both files and hand back the underlying writers.
    pub fn finish(mut self) -> Result<(W, D)> {
        self.records.flush()?;
        self.data.flush()?;
        Ok((self.records.into_inner(), self.data.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::sync::error::SyncError;
    use crate::sync::point::{DataBlock, DataKind, ExitReason, PointKind};
    use crate::sync::stream::ByteStream;
    use crate::sync::types::{SYNC_DATA_MEMORY_LOGICAL, SYNC_POINT_RECORD_SIZE};

    fn point_with_data(tsc: u64) -> RawPoint {
        let mut point = RawPoint {
            kind: PointKind::VmExit(ExitReason::IoInstruction),
            rip: 0x1000,
            ..Default::default()
        };
        point.context.tsc = tsc;
        point.data.push(DataBlock {
            kind: DataKind::MemoryLogical,
            offset: 0x10,
            data: vec![0xab; 3],
        });
        point
    }

    #[test]
    fn test_sync_file_writer__current_layout__then_header_and_padded_records() {
        let mut writer = SyncFileWriter::new(Vec::new(), Vec::new(), WriterConfig::default()).unwrap();
        writer.write_point(&point_with_data(1)).unwrap();
        writer.write_point(&point_with_data(2)).unwrap();
        assert_eq!(writer.count(), 2);

        let (records, data) = writer.finish().unwrap();
        assert_eq!(records.len(), 1024 + 2 * 256);

        let mut stream = ByteStream::new(records);
        let header: SyncFileHeader = stream.read_layout().unwrap();
        let (magic, version, record_size) = (header.magic, header.version, header.record_size);
        assert_eq!(magic, SYNC_POINT_MAGIC);
        assert_eq!(version, 3);
        assert_eq!(record_size, 256);

        // Magic, then one block list per record
        let mut data_stream = ByteStream::new(data);
        assert_eq!(data_stream.read_u64(), Some(SYNC_POINT_DATA_MAGIC));
        assert_eq!(data_stream.read_u32(), Some(SYNC_DATA_MEMORY_LOGICAL));
        assert_eq!(data_stream.read_u64(), Some(0x10));
        assert_eq!(data_stream.read_prefixed_bytes(), Some(vec![0xab; 3]));
        assert_eq!(data_stream.read_u32(), Some(SYNC_DATA_END));
    }

    #[test]
    fn test_sync_file_writer__data_offset__then_points_at_block_list() {
        let mut writer = SyncFileWriter::new(Vec::new(), Vec::new(), WriterConfig::default()).unwrap();
        writer.write_point(&RawPoint::default()).unwrap();
        writer.write_point(&point_with_data(2)).unwrap();
        let (records, _) = writer.finish().unwrap();

        let layout = RecordLayout::Current { record_size: 256 };
        let mut stream = ByteStream::new(records);
        stream.seek(SYNC_HEADER_SIZE);
        assert_eq!(layout.decode(&mut stream).unwrap().data_offset(), 0);
        assert_eq!(layout.decode(&mut stream).unwrap().data_offset(), 8);
    }

    #[test]
    fn test_sync_file_writer__version_zero__then_no_data_written() {
        let mut writer = SyncFileWriter::new(Vec::new(), Vec::new(), WriterConfig::legacy(0)).unwrap();
        writer.write_point(&point_with_data(1)).unwrap();
        let (records, data) = writer.finish().unwrap();

        assert_eq!(records.len(), 1024 + 80);
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn test_sync_file_writer__invalid_config__then_rejected() {
        let config = WriterConfig {
            record_size: SYNC_POINT_RECORD_SIZE - 1,
            ..Default::default()
        };
        let result = SyncFileWriter::new(Vec::new(), Vec::new(), config);
        assert!(matches!(result, Err(SyncError::InvalidRecordSize { .. })));

        let config = WriterConfig {
            version: 4,
            ..Default::default()
        };
        let result = SyncFileWriter::new(Vec::new(), Vec::new(), config);
        assert!(matches!(result, Err(SyncError::UnsupportedVersion { .. })));
    }
}
