// Sync trace reader: memory-mapped record files with lazily rebuilt events

pub mod data;
pub mod error;
pub mod event;
pub mod index;
pub mod point;
pub mod reader;
pub mod record;
pub mod stream;
pub mod types;
pub mod writer;

// Re-export main types
pub use data::DataReader;
pub use error::{Result, SyncError, Violation};
pub use event::{EmulationPolicy, InterruptInfo, SyncEvent};
pub use index::RecordIndex;
pub use point::{
    DataBlock, DataKind, ExitReason, PointKind, RawPoint, RegisterClass, RegisterContext,
    RegisterDef, REGISTERS,
};
pub use reader::{Events, Points, ReaderOptions, SyncReader};
pub use record::{RawRecord, RecordLayout};
pub use writer::{SyncFileWriter, WriterConfig};
