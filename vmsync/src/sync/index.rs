// Record file header validation and ordinal <-> offset mapping

use super::error::{Result, SyncError};
use super::record::RecordLayout;
use super::stream::ByteStream;
use super::types::{SyncFileHeader, SYNC_HEADER_SIZE, SYNC_POINT_FILE_VERSION, SYNC_POINT_MAGIC};

/// Fixed-size record addressing for a loaded record file.
///
/// Ordinals are 1-based; ordinal 0 stands for "before the first record".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIndex {
    version: u32,
    tool_version: u32,
    record_size: u32,
    record_count: u64,
}

impl RecordIndex {
    /// Read and validate the header, then count records from the file size.
    /// Leaves the stream positioned on the first record.
    pub fn load<B: AsRef<[u8]>>(stream: &mut ByteStream<B>) -> Result<Self> {
        stream.seek(0);

        let magic = stream.read_u64().ok_or(SyncError::FileTooSmall {
            expected: 8,
            actual: stream.len(),
        })?;

        if magic != SYNC_POINT_MAGIC {
            return Err(SyncError::InvalidMagic {
                expected: SYNC_POINT_MAGIC,
                got: magic,
            });
        }

        stream.seek(0);
        let header: SyncFileHeader = stream.read_layout().ok_or(SyncError::FileTooSmall {
            expected: std::mem::size_of::<SyncFileHeader>(),
            actual: stream.len(),
        })?;

        let index = Self::from_header(&header, 0)?;

        stream.seek_from_end(0);
        let record_count = stream.pos().saturating_sub(SYNC_HEADER_SIZE) / index.record_size as u64;

        // Skip the rest of the header
        stream.seek(SYNC_HEADER_SIZE);

        Ok(Self {
            record_count,
            ..index
        })
    }

    /// Validate a header whose file holds `record_count` records.
    pub fn from_header(header: &SyncFileHeader, record_count: u64) -> Result<Self> {
        let version = header.version;
        let record_size = header.record_size;

        if version > SYNC_POINT_FILE_VERSION {
            return Err(SyncError::UnsupportedVersion {
                version,
                supported: SYNC_POINT_FILE_VERSION,
            });
        }

        let minimum = RecordLayout::for_version(version, record_size).minimum_record_size();
        if record_size < minimum {
            return Err(SyncError::InvalidRecordSize {
                record_size,
                minimum,
            });
        }

        Ok(Self {
            version,
            tool_version: header.tool_version,
            record_size,
            record_count,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn tool_version(&self) -> u32 {
        self.tool_version
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Number of complete records in the file.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn layout(&self) -> RecordLayout {
        RecordLayout::for_version(self.version, self.record_size)
    }

    /// Byte offset of the record with the given ordinal. Ordinal 0 maps to
    /// the end of the header. `None` when the offset does not fit in a u64.
    pub fn offset_of(&self, ordinal: u64) -> Option<u64> {
        (self.record_size as u64)
            .checked_mul(ordinal.saturating_sub(1))?
            .checked_add(SYNC_HEADER_SIZE)
    }

    /// Number of whole records stored before `offset`.
    pub fn records_before(&self, offset: u64) -> u64 {
        offset.saturating_sub(SYNC_HEADER_SIZE) / self.record_size as u64
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::sync::stream::StreamWriter;

    fn create_test_record_file(version: u32, record_size: u32, records: u64) -> Vec<u8> {
        let header = SyncFileHeader {
            magic: SYNC_POINT_MAGIC,
            version,
            tool_version: 0x60010,
            record_size,
        };

        let mut writer = StreamWriter::new(Vec::new());
        writer.write_layout(&header).unwrap();
        writer
            .write_zeros(SYNC_HEADER_SIZE as usize - std::mem::size_of::<SyncFileHeader>())
            .unwrap();
        writer
            .write_zeros((record_size as u64 * records) as usize)
            .unwrap();
        writer.into_inner()
    }

    #[test]
    fn test_record_index__valid_header__then_parsed() {
        let mut stream = ByteStream::new(create_test_record_file(3, 256, 10));
        let index = RecordIndex::load(&mut stream).unwrap();

        assert_eq!(index.version(), 3);
        assert_eq!(index.tool_version(), 0x60010);
        assert_eq!(index.record_size(), 256);
        assert_eq!(index.record_count(), 10);
        assert_eq!(index.layout(), RecordLayout::Current { record_size: 256 });
        assert_eq!(stream.pos(), SYNC_HEADER_SIZE);
    }

    #[test]
    fn test_record_index__trailing_partial_record__then_not_counted() {
        let mut bytes = create_test_record_file(3, 256, 4);
        bytes.extend_from_slice(&[0u8; 100]);
        let mut stream = ByteStream::new(bytes);

        assert_eq!(RecordIndex::load(&mut stream).unwrap().record_count(), 4);
    }

    #[test]
    fn test_record_index__invalid_magic__then_error() {
        let mut bytes = create_test_record_file(3, 256, 1);
        bytes[0..8].copy_from_slice(&0x64636e79734e5652u64.to_le_bytes());
        let mut stream = ByteStream::new(bytes);

        let result = RecordIndex::load(&mut stream);
        assert!(matches!(
            result,
            Err(SyncError::InvalidMagic { got: 0x64636e79734e5652, .. })
        ));
    }

    #[test]
    fn test_record_index__newer_version__then_unsupported() {
        let mut stream = ByteStream::new(create_test_record_file(4, 256, 1));
        let result = RecordIndex::load(&mut stream);
        assert!(matches!(
            result,
            Err(SyncError::UnsupportedVersion { version: 4, supported: 3 })
        ));
    }

    #[test]
    fn test_record_index__record_size_below_layout__then_error() {
        let mut stream = ByteStream::new(create_test_record_file(3, 200, 1));
        assert!(matches!(
            RecordIndex::load(&mut stream),
            Err(SyncError::InvalidRecordSize { record_size: 200, minimum: 201 })
        ));

        let mut stream = ByteStream::new(create_test_record_file(2, 0, 0));
        assert!(matches!(
            RecordIndex::load(&mut stream),
            Err(SyncError::InvalidRecordSize { record_size: 0, minimum: 80 })
        ));
    }

    #[test]
    fn test_record_index__truncated_header__then_too_small() {
        let mut bytes = create_test_record_file(3, 256, 0);
        bytes.truncate(12);
        let mut stream = ByteStream::new(bytes);

        assert!(matches!(
            RecordIndex::load(&mut stream),
            Err(SyncError::FileTooSmall { expected: 20, actual: 12 })
        ));
    }

    #[test]
    fn test_record_index__offsets__then_header_plus_records() {
        let mut stream = ByteStream::new(create_test_record_file(2, 80, 3));
        let index = RecordIndex::load(&mut stream).unwrap();

        assert_eq!(index.layout(), RecordLayout::Legacy);
        assert_eq!(index.offset_of(0), Some(1024));
        assert_eq!(index.offset_of(1), Some(1024));
        assert_eq!(index.offset_of(3), Some(1024 + 160));
        assert_eq!(index.records_before(1024 + 160), 2);
        assert_eq!(index.records_before(10), 0);
    }

    #[test]
    fn test_record_index__huge_ordinal__then_no_offset() {
        let mut stream = ByteStream::new(create_test_record_file(3, 256, 3));
        let index = RecordIndex::load(&mut stream).unwrap();

        assert_eq!(index.offset_of((1 << 56) + 1), None);
        assert_eq!(index.offset_of(u64::MAX), None);
        // Largest multiple that still fits, before the header is added
        let last = u64::MAX / 256 + 1;
        assert_eq!(index.offset_of(last), None);
        assert_eq!(index.offset_of(1 << 40), Some(1024 + 256 * ((1 << 40) - 1)));
    }
}
