// Cursor over sync points and reconstruction of sync events

use super::data::DataReader;
use super::error::{Result, SyncError, Violation};
use super::event::{InterruptInfo, SyncEvent};
use super::index::RecordIndex;
use super::point::{PointKind, RawPoint};
use super::stream::{map_file, ByteStream};
use super::types::{LEGACY_RECORD_SIZE, SYNC_HEADER_SIZE, SYNC_POINT_FILE_VERSION};
use memmap2::Mmap;
use std::path::Path;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Require cycles that were not emulated to leave every general and
    /// control register untouched.
    pub strict_verification: bool,
}

/// Reader over one record file and its optional data file.
///
/// Holds a single current sync point and a single cached event; records are
/// decoded on demand from the mapped file. Positions are 1-based record
/// ordinals, 0 meaning nothing has been read yet.
pub struct SyncReader<B = Mmap> {
    records: ByteStream<B>,
    data: Option<DataReader<B>>,
    index: RecordIndex,
    options: ReaderOptions,
    current: RawPoint,
    current_event: Option<SyncEvent>,
    position: u64,
    last_valid_position: u64,
}

impl SyncReader<Mmap> {
    /// Open a record file and, when given and present, its data file.
    pub fn open(record_path: &Path, data_path: Option<&Path>, options: ReaderOptions) -> Result<Self> {
        let records = map_file(record_path)?;

        let data = match data_path {
            Some(path) if path.exists() => Some(map_file(path)?),
            Some(path) => {
                warn!(path = %path.display(), "Sync data file not found, records carry no data");
                None
            }
            None => None,
        };

        Self::from_bytes(records, data, options)
    }
}

impl<B: AsRef<[u8]>> SyncReader<B> {
    /// Validate the record file header, and the data file magic unless the
    /// record file predates data files.
    pub fn from_bytes(records: B, data: Option<B>, options: ReaderOptions) -> Result<Self> {
        let mut records = ByteStream::new(records);
        let index = RecordIndex::load(&mut records)?;

        debug!(
            version = index.version(),
            tool_version = index.tool_version(),
            record_size = index.record_size(),
            count = index.record_count(),
            "Loaded sync file"
        );

        if index.version() < SYNC_POINT_FILE_VERSION {
            warn!(
                version = index.version(),
                "Deprecated sync file layout, some features are missing"
            );
            if index.record_size() != LEGACY_RECORD_SIZE {
                warn!(
                    record_size = index.record_size(),
                    "Legacy records are read as {} bytes", LEGACY_RECORD_SIZE
                );
            }
        }

        let data = match data {
            Some(bytes) if index.version() > 0 => Some(DataReader::from_bytes(bytes)?),
            _ => None,
        };

        Ok(Self {
            records,
            data,
            index,
            options,
            current: RawPoint::default(),
            current_event: None,
            position: 0,
            last_valid_position: 0,
        })
    }

    pub fn version(&self) -> u32 {
        self.index.version()
    }

    pub fn tool_version(&self) -> u32 {
        self.index.tool_version()
    }

    pub fn record_size(&self) -> u32 {
        self.index.record_size()
    }

    /// The file lacks features of the current layout.
    pub fn is_deprecated_file(&self) -> bool {
        self.index.version() < SYNC_POINT_FILE_VERSION
    }

    /// Fault error codes of interrupt records are meaningful.
    pub fn has_fault_error_codes(&self) -> bool {
        self.index.version() >= 2
    }

    pub fn sync_point_count(&self) -> u64 {
        self.index.record_count()
    }

    pub fn has_data_file(&self) -> bool {
        self.data.is_some()
    }

    pub fn options(&self) -> ReaderOptions {
        self.options
    }

    /// No more records can be read without seeking.
    pub fn is_eof(&self) -> bool {
        self.records.is_eof()
    }

    pub fn current(&self) -> &RawPoint {
        &self.current
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn last_valid_position(&self) -> u64 {
        self.last_valid_position
    }

    /// Mark the current position as confirmed good.
    pub fn validate(&mut self) {
        self.last_valid_position = self.position;
    }

    /// Move to the next record that differs from the current one. At the end
    /// of the file the current point becomes invalid and stays so.
    pub fn next(&mut self) -> &RawPoint {
        if self.records.is_eof() {
            return &self.current;
        }

        let previous = std::mem::take(&mut self.current);
        while let Some(point) = self.read_record() {
            self.position += 1;
            if point == previous {
                trace!(position = self.position, "Skipping duplicated sync point");
                continue;
            }
            self.current = point;
            break;
        }

        self.current_event = None;
        &self.current
    }

    fn read_record(&mut self) -> Option<RawPoint> {
        let record = self.index.layout().decode(&mut self.records)?;
        let mut point = record.to_point();

        if let Some(data) = self.data.as_mut() {
            point.data = data.blocks_at(record.data_offset() as u64);
        }
        Some(point)
    }

    /// Load the record at `ordinal`. Ordinal 0 rewinds before the first
    /// record without reading anything.
    pub fn seek(&mut self, ordinal: u64) {
        self.load(ordinal);
        self.last_valid_position = self.position.saturating_sub(1);
    }

    fn load(&mut self, ordinal: u64) {
        self.current = RawPoint::default();
        self.current_event = None;

        if ordinal == 0 {
            self.records.seek(SYNC_HEADER_SIZE);
            self.position = 0;
            return;
        }

        self.position = ordinal - 1;
        // An offset past u64 range lies past the end of the file as well
        let offset = self.index.offset_of(ordinal).unwrap_or(u64::MAX);
        self.records.seek(offset);
        self.next();
    }

    /// Seek to `ordinal`, and when it lands inside a cycle on its VM enter,
    /// walk back to the opening exit and rebuild that cycle's event.
    pub fn advance_to(&mut self, ordinal: u64) -> Result<()> {
        self.seek(ordinal);

        if ordinal == 0 || !self.current.is_valid() || !self.current.is_vmenter() {
            return Ok(());
        }

        let mut target = ordinal;
        while !self.current.is_vmexit() && self.position > 1 {
            target = target.saturating_sub(1);
            self.seek(target);
        }

        self.current_event()?;
        Ok(())
    }

    /// Position the cursor `count` records before the last one; the next
    /// read returns that record.
    pub fn seek_from_end(&mut self, count: u64) {
        self.current = RawPoint::default();
        self.current_event = None;

        let record_size = self.index.record_size() as u64;
        self.records.seek_from_end(record_size.saturating_mul(count.saturating_add(1)));
        if self.records.is_eof() {
            self.records.seek(SYNC_HEADER_SIZE);
        }

        self.position = self.index.records_before(self.records.pos());
        // Snap to a record boundary when the file ends with a partial record
        let offset = self.index.offset_of(self.position + 1).unwrap_or(u64::MAX);
        self.records.seek(offset);
        self.last_valid_position = self.position;
    }

    /// The event the cursor is in, built on first access and cached until
    /// the cursor moves.
    pub fn current_event(&mut self) -> Result<&SyncEvent> {
        let event = match self.current_event.take() {
            Some(event) => event,
            None if self.records.is_eof() => SyncEvent::default(),
            None => self.build_event()?,
        };
        Ok(&*self.current_event.insert(event))
    }

    /// Fetch an event and fold following events into it while it is a no-op
    /// the recorder split from the next cycle.
    fn build_event(&mut self) -> Result<SyncEvent> {
        let mut event = self.fetch_new_event()?;

        while event.is_noop() {
            let next = self.fetch_new_event()?;
            if !next.is_valid {
                break;
            }

            let rewind = next.start_position.saturating_sub(1);
            match SyncEvent::coalesce(&event, next) {
                Some(merged) => {
                    debug!(
                        from = event.position,
                        into = merged.position,
                        "Coalescing no-op sync event"
                    );
                    event = merged;
                }
                None => {
                    debug!(position = event.position, rewind, "Keeping no-op sync event");
                    self.load(rewind);
                    break;
                }
            }
        }

        Ok(event)
    }

    fn fetch_new_event(&mut self) -> Result<SyncEvent> {
        // Recording starts on a VM enter, so the first exit may be missing
        let bootstrap = self.position == 1 && self.current.is_valid() && !self.current.is_vmexit();

        if !bootstrap {
            while !self.current.is_vmexit() {
                if !self.next().is_valid() {
                    return Ok(SyncEvent::default());
                }
            }
        }

        let mut event = if bootstrap {
            SyncEvent::bootstrap()
        } else {
            let exit = &self.current;
            SyncEvent {
                start_position: self.position,
                start_context: Some(exit.context),
                start_rip: exit.rip,
                start_reason: exit.kind.exit_reason().unwrap_or_default(),
                data: exit.data.clone(),
                ..Default::default()
            }
        };
        event.position = self.position;

        if !bootstrap && !self.advance_cycle(&mut event) {
            return Ok(event);
        }
        event.data.extend_from_slice(&self.current.data);

        if let PointKind::Interrupt { vector } = self.current.kind {
            event.interrupt = Some(InterruptInfo {
                vector,
                rip: self.current.rip,
                fault_error_code: self.current.fault_error_code,
            });

            let interrupt = self.current.clone();
            if !self.advance_cycle(&mut event) {
                return Ok(event);
            }

            // The recorder sometimes reports an interrupt twice
            if self.current.is_interrupt() {
                if !self.current.is_equivalent(&interrupt) {
                    return Err(SyncError::malformed(
                        self.position,
                        Violation::DuplicateInterruptMismatch,
                    ));
                }
                trace!(position = self.position, "Skipping duplicated interrupt");
                event.data.extend_from_slice(&self.current.data);

                if !self.advance_cycle(&mut event) {
                    return Ok(event);
                }
            }

            event.data.extend_from_slice(&self.current.data);

            // Only the TSC may differ
            if !self.current.is_equivalent(&interrupt) {
                return Err(SyncError::malformed(
                    self.position,
                    Violation::InterruptContextMismatch,
                ));
            }
        }

        if !self.current.is_vmenter() {
            return Err(SyncError::malformed(
                self.position,
                Violation::MissingVmEnter {
                    found: self.current.kind,
                },
            ));
        }

        event.new_context = self.current.context;
        event.new_rip = self.current.rip;
        event.rflags = self.current.rflags;
        event.apply_emulation_policy();
        event
            .check_sanity(self.options.strict_verification)
            .map_err(|violation| SyncError::malformed(self.position, violation))?;

        event.is_valid = true;
        Ok(event)
    }

    /// Step to the next record of a cycle. When the trace ends, `event`
    /// becomes the valid but unfinished last event and false is returned.
    fn advance_cycle(&mut self, event: &mut SyncEvent) -> bool {
        if self.next().is_valid() {
            event.position = self.position;
            return true;
        }

        event.is_last_event = true;
        event.is_valid = true;
        false
    }

    /// Iterate over the remaining sync points with their ordinals.
    pub fn points(&mut self) -> Points<'_, B> {
        Points { reader: self }
    }

    /// Iterate over the remaining sync events. Iteration ends after the
    /// first error.
    pub fn events(&mut self) -> Events<'_, B> {
        Events {
            reader: self,
            failed: false,
        }
    }
}

pub struct Points<'a, B> {
    reader: &'a mut SyncReader<B>,
}

impl<B: AsRef<[u8]>> Iterator for Points<'_, B> {
    type Item = (u64, RawPoint);

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.reader.next();
        if !point.is_valid() {
            return None;
        }
        let point = point.clone();
        Some((self.reader.position(), point))
    }
}

pub struct Events<'a, B> {
    reader: &'a mut SyncReader<B>,
    failed: bool,
}

impl<B: AsRef<[u8]>> Iterator for Events<'_, B> {
    type Item = Result<SyncEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.reader.next().is_valid() {
            return None;
        }

        match self.reader.current_event() {
            Ok(event) if event.is_valid => Some(Ok(event.clone())),
            Ok(_) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
