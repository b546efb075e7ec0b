// Versioned record layouts and their conversion to the canonical sync point

use super::point::{PointKind, RawPoint, RegisterContext};
use super::stream::{ByteStream, StreamWriter};
use super::types::{LegacySyncPoint, SyncPointRecord, LEGACY_RECORD_SIZE, SYNC_POINT_RECORD_SIZE};
use std::io::{self, Write};

/// How records of a given file are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Versions 0 to 2: 32-bit registers and one byte of padding.
    Legacy,
    /// Version 3: 64-bit registers padded up to `record_size`.
    Current { record_size: u32 },
}

impl RecordLayout {
    pub fn for_version(version: u32, record_size: u32) -> Self {
        if version < 3 {
            Self::Legacy
        } else {
            Self::Current { record_size }
        }
    }

    /// Smallest record size this layout can be decoded from.
    pub fn minimum_record_size(self) -> u32 {
        match self {
            Self::Legacy => LEGACY_RECORD_SIZE,
            Self::Current { .. } => SYNC_POINT_RECORD_SIZE,
        }
    }

    /// Decode one record at the stream position. `None` means the stream
    /// ended before the record did.
    pub fn decode<B: AsRef<[u8]>>(self, stream: &mut ByteStream<B>) -> Option<RawRecord> {
        match self {
            Self::Legacy => stream.read_layout().map(RawRecord::Legacy),
            Self::Current { record_size } => {
                let record = stream.read_layout()?;
                stream.skip(record_size.saturating_sub(SYNC_POINT_RECORD_SIZE) as usize)?;
                Some(RawRecord::Current(record))
            }
        }
    }

    /// Encode a point with this layout. Legacy encoding truncates registers
    /// to 32 bits and drops r8..r15.
    pub fn encode<W: Write>(
        self,
        writer: &mut StreamWriter<W>,
        point: &RawPoint,
        data_offset: u32,
    ) -> io::Result<()> {
        match self {
            Self::Legacy => writer.write_layout(&narrow_legacy(point, data_offset)),
            Self::Current { record_size } => {
                writer.write_layout(&to_current(point, data_offset))?;
                writer.write_zeros(record_size.saturating_sub(SYNC_POINT_RECORD_SIZE) as usize)
            }
        }
    }
}

/// A record exactly as stored, before widening.
#[derive(Debug, Clone, Copy)]
pub enum RawRecord {
    Legacy(LegacySyncPoint),
    Current(SyncPointRecord),
}

impl RawRecord {
    pub fn data_offset(&self) -> u32 {
        match self {
            Self::Legacy(record) => record.data_offset,
            Self::Current(record) => record.data_offset,
        }
    }

    /// Canonical point without attached data; blocks are resolved separately.
    pub fn to_point(&self) -> RawPoint {
        match self {
            Self::Legacy(record) => widen_legacy(record),
            Self::Current(record) => from_current(record),
        }
    }
}

/// Zero-extend a legacy record. r8..r15 do not exist there and read as zero.
pub fn widen_legacy(record: &LegacySyncPoint) -> RawPoint {
    RawPoint {
        context: RegisterContext {
            rax: record.eax as u64,
            rbx: record.ebx as u64,
            rcx: record.ecx as u64,
            rdx: record.edx as u64,
            rsi: record.esi as u64,
            rdi: record.edi as u64,
            rbp: record.ebp as u64,
            rsp: record.esp as u64,
            cr0: record.cr0 as u64,
            cr2: record.cr2 as u64,
            cr3: record.cr3 as u64,
            cr4: record.cr4 as u64,
            fpu_sw: record.fpu_sw,
            fpu_cw: record.fpu_cw,
            fpu_tags: record.fpu_tags,
            tsc: record.tsc,
            ..Default::default()
        },
        rip: record.eip as u64,
        rflags: record.eflags as u64,
        cs: record.cs,
        fault_error_code: record.fault_error_code as u32,
        kind: PointKind::from_type_field(record.kind),
        data: Vec::new(),
    }
}

pub fn from_current(record: &SyncPointRecord) -> RawPoint {
    RawPoint {
        context: RegisterContext {
            rax: record.rax,
            rbx: record.rbx,
            rcx: record.rcx,
            rdx: record.rdx,
            rsi: record.rsi,
            rdi: record.rdi,
            rbp: record.rbp,
            rsp: record.rsp,
            r8: record.r8,
            r9: record.r9,
            r10: record.r10,
            r11: record.r11,
            r12: record.r12,
            r13: record.r13,
            r14: record.r14,
            r15: record.r15,
            cr0: record.cr0,
            cr2: record.cr2,
            cr3: record.cr3,
            cr4: record.cr4,
            fpu_sw: record.fpu_sw,
            fpu_cw: record.fpu_cw,
            fpu_tags: record.fpu_tags,
            tsc: record.tsc,
        },
        rip: record.rip,
        rflags: record.rflags,
        cs: record.cs,
        fault_error_code: record.fault_error_code,
        kind: PointKind::from_type_field(record.kind),
        data: Vec::new(),
    }
}

fn to_current(point: &RawPoint, data_offset: u32) -> SyncPointRecord {
    let c = &point.context;
    SyncPointRecord {
        tsc: c.tsc,
        kind: point.kind.to_type_field(),
        cs: point.cs,
        rax: c.rax,
        rbx: c.rbx,
        rcx: c.rcx,
        rdx: c.rdx,
        rsi: c.rsi,
        rdi: c.rdi,
        rbp: c.rbp,
        rsp: c.rsp,
        r8: c.r8,
        r9: c.r9,
        r10: c.r10,
        r11: c.r11,
        r12: c.r12,
        r13: c.r13,
        r14: c.r14,
        r15: c.r15,
        rip: point.rip,
        rflags: point.rflags,
        cr0: c.cr0,
        cr2: c.cr2,
        cr3: c.cr3,
        cr4: c.cr4,
        data_offset,
        fpu_sw: c.fpu_sw,
        fpu_cw: c.fpu_cw,
        fpu_tags: c.fpu_tags,
        fault_error_code: point.fault_error_code,
    }
}

fn narrow_legacy(point: &RawPoint, data_offset: u32) -> LegacySyncPoint {
    let c = &point.context;
    LegacySyncPoint {
        tsc: c.tsc,
        kind: point.kind.to_type_field(),
        cs: point.cs,
        eax: c.rax as u32,
        ebx: c.rbx as u32,
        ecx: c.rcx as u32,
        edx: c.rdx as u32,
        esi: c.rsi as u32,
        edi: c.rdi as u32,
        ebp: c.rbp as u32,
        esp: c.rsp as u32,
        eip: point.rip as u32,
        eflags: point.rflags as u32,
        cr0: c.cr0 as u32,
        cr2: c.cr2 as u32,
        cr3: c.cr3 as u32,
        cr4: c.cr4 as u32,
        data_offset,
        fpu_sw: c.fpu_sw,
        fpu_cw: c.fpu_cw,
        fpu_tags: c.fpu_tags,
        fault_error_code: point.fault_error_code as u16,
        _padding: 0,
    }
}
