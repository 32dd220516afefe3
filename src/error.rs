//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole sweep system.
//! Using the `thiserror` crate, it provides a centralized way to classify the faults
//! that can occur between the robot link, the sensor buses and the output file.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: opening the robot socket or the greeting round-trip failed. Fatal to
//!   the connect attempt only; partially-opened resources are released.
//! - **`Link`**: a non-timeout socket fault during an established session. Aborts the
//!   workflow step in progress.
//! - **`Timeout`**: a read timeout on the robot link. Retried transparently and never
//!   surfaced to the operator.
//! - **`SensorDecode`** / **`SensorDevice`**: localized to one sensor reader, which degrades
//!   its snapshot to the error sentinel and keeps running.
//! - **`CalibrationLookup`**: no reference pose within tolerance of the requested distance.
//! - **`Storage`**: a flush batch could not be written; only that batch is lost.
//!
//! Only `Connection`, `Link` and `CalibrationLookup` cross into the workflow layer, see
//! [`DaqError::is_workflow_fatal`].

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Opening the robot link or the sensors failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Socket fault on an established robot link.
    #[error("Robot link error: {0}")]
    Link(#[source] std::io::Error),

    /// The controller closed the connection.
    #[error("Robot link closed by peer")]
    LinkClosed,

    /// A robot read timed out; retried by motion waits.
    #[error("Robot link read timed out")]
    Timeout,

    /// Robot reply that could not be parsed.
    #[error("Malformed robot response: {0}")]
    Protocol(String),

    /// Sensor frame that could not be decoded.
    #[error("Sensor decode error: {0}")]
    SensorDecode(String),

    /// Serial or USB device fault.
    #[error("Sensor device error: {0}")]
    SensorDevice(String),

    /// No reference pose near the requested distance.
    #[error("No calibration pose within {tolerance} of distance {target}")]
    CalibrationLookup {
        /// Requested distance
        target: f64,
        /// Accepted deviation
        tolerance: f64,
    },

    /// Reference table missing or malformed.
    #[error("Calibration table error: {0}")]
    Calibration(String),

    /// Appending rows to the output file failed.
    #[error("Storage error: {0}")]
    Storage(#[source] std::io::Error),

    /// Output file could not be created.
    #[error("Cannot open output file '{path}': {source}")]
    FileOpen {
        /// Output path as given
        path: String,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// A sweep needs a ground level that was never saved.
    #[error("Ground level for field {0} has not been saved")]
    GroundNotSet(usize),

    /// Request does not fit the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Console line that does not parse.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values that fail validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// CSV encoding or decoding failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Support for a device was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Errors collected while shutting down.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// The robot session is unusable and must be dropped.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, DaqError::Link(_) | DaqError::LinkClosed)
    }

    /// Missing or unmatched positioning calibration.
    pub fn is_calibration_fault(&self) -> bool {
        matches!(
            self,
            DaqError::CalibrationLookup { .. } | DaqError::Calibration(_)
        )
    }

    /// Faults that abort the workflow in progress and return the orchestrator to idle.
    pub fn is_workflow_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Connection(_)
                | DaqError::Link(_)
                | DaqError::LinkClosed
                | DaqError::Protocol(_)
                | DaqError::CalibrationLookup { .. }
                | DaqError::Calibration(_)
        )
    }
}
