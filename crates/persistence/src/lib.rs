// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod error;
pub mod varint;
pub mod record;
pub mod log_writer;
pub mod log_reader;
pub mod naming;
pub mod lock;
pub mod metadata;
pub mod fixtures;

pub use error::{PersistenceError, Result};
pub use log_reader::{LogReader, LogRecord, ReadOutcome};
pub use log_writer::LogWriter;
pub use metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use naming::LogLayout;
pub use record::{RecordHeader, Watermark, WatermarkTables};
