// On-disk layouts for sync record files (zero-copy parsing)
//
// All layouts are little-endian and read with `read_unaligned`, so they are
// only decoded correctly on little-endian hosts (the recorder's own target).

/// Record file header prefix. The header occupies `SYNC_HEADER_SIZE` bytes,
/// the rest is reserved.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct SyncFileHeader {
    pub magic: u64,        // SYNC_POINT_MAGIC
    pub version: u32,      // SYNC_POINT_FILE_VERSION or older
    pub tool_version: u32, // Recorder build, passed through untouched
    pub record_size: u32,  // Bytes per record, padding included
}

const _: () = assert!(std::mem::size_of::<SyncFileHeader>() == 20);

/// Record layout for versions 0 to 2 (32-bit registers) - 80 bytes
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Default)]
pub struct LegacySyncPoint {
    pub tsc: u64,
    pub kind: u16, // low byte: reason or vector, bit 8: interrupt
    pub cs: u16,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub data_offset: u32, // Absolute offset in the data file, 0 = none
    pub fpu_sw: u16,
    pub fpu_cw: u16,
    pub fpu_tags: u8,
    pub fault_error_code: u16,
    pub _padding: u8,
}

const _: () = assert!(std::mem::size_of::<LegacySyncPoint>() == LEGACY_RECORD_SIZE as usize);

/// Record layout for version 3 - 201 meaningful bytes, followed by
/// `record_size - 201` bytes of padding
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Default)]
pub struct SyncPointRecord {
    pub tsc: u64,
    pub kind: u16,
    pub cs: u16,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub data_offset: u32,
    pub fpu_sw: u16,
    pub fpu_cw: u16,
    pub fpu_tags: u8,
    pub fault_error_code: u32,
}

const _: () = assert!(std::mem::size_of::<SyncPointRecord>() == SYNC_POINT_RECORD_SIZE as usize);

/// Marker for plain packed layouts that may be read from and written to raw
/// bytes.
///
/// # Safety
///
/// Implementors must be `repr(C, packed)` and made only of integer fields, so
/// that every bit pattern is a valid value.
pub unsafe trait PackedLayout: Copy + 'static {}

unsafe impl PackedLayout for SyncFileHeader {}
unsafe impl PackedLayout for LegacySyncPoint {}
unsafe impl PackedLayout for SyncPointRecord {}

// File identification
pub const SYNC_POINT_MAGIC: u64 = 0x70636e79734e5652; // "RVNsyncp"
pub const SYNC_POINT_DATA_MAGIC: u64 = 0x64636e79734e5652; // "RVNsyncd"
pub const SYNC_POINT_FILE_VERSION: u32 = 3;
pub const SYNC_HEADER_SIZE: u64 = 1024;

// Record sizes
pub const LEGACY_RECORD_SIZE: u32 = 80;
pub const SYNC_POINT_RECORD_SIZE: u32 = 201;
pub const DEFAULT_RECORD_SIZE: u32 = 256;

// Record type field
pub const SYNC_TYPE_IRQ_MASK: u16 = 0xff;
pub const SYNC_TYPE_IS_IRQ: u16 = 0x100;
pub const SYNC_TYPE_VMENTER: u8 = 0xff;
pub const SYNC_TYPE_INTERRUPT: u8 = 0xfe;

// Data block tags
pub const SYNC_DATA_END: u32 = 0;
pub const SYNC_DATA_MEMORY_LOGICAL: u32 = 1;
pub const SYNC_DATA_MEMORY_PHYSICAL: u32 = 2;

// Interrupt vectors
pub const PAGE_FAULT_VECTOR: u8 = 0x0e;
pub const FIRST_EXTERNAL_VECTOR: u8 = 0x20;
