//! Data acquisition and storage modules.
//!
//! - [`acquisition`]: fuses robot position samples with sensor snapshots into rows
//! - [`storage`]: output file creation and the batching writer task
//! - [`calibration`]: positioning reference table lookup

pub mod acquisition;
pub mod calibration;
pub mod storage;

pub use acquisition::Acquisition;
pub use calibration::{CalibrationEntry, CalibrationTable};
pub use storage::{create_output, StorageWriter, WriterStats};
