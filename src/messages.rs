//! Message types for actor-based communication
//!
//! This module defines the requests the control surface sends to the
//! [`ScanOrchestrator`](crate::app_actor::ScanOrchestrator) and the notifications it
//! sends back. Every request carries its own typed parameters, so the orchestrator
//! never has to interpret a loosely-typed parameter list.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::{AcquisitionMode, FieldSpec, Quantity};

/// Parameters of a `connect` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Robot controller `host:port`
    pub address: String,
    /// Quantities whose sensor buses must be opened
    pub quantities: Vec<Quantity>,
}

/// How long a recording runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunLimit {
    /// `repetitions` passes over every field, each doing `cycles` up/down sweeps
    Count {
        /// Passes over the field list
        repetitions: usize,
        /// Up/down sweeps per field and pass
        cycles: usize,
    },
    /// Sweep fields in order until `duration` has elapsed
    Duration(Duration),
}

/// Parameters of a `start` request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Output CSV path, truncated at start
    pub output: PathBuf,
    /// Quantities recorded in each row
    pub quantities: Vec<Quantity>,
    /// Header row 2 label per quantity
    pub annotations: BTreeMap<Quantity, String>,
    /// Continuous or point sampling
    pub mode: AcquisitionMode,
    /// Steps per direction of one sweep
    pub sample_count: usize,
    /// When the run ends
    pub limit: RunLimit,
}

/// Requests accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanCommand {
    /// Open the robot link and sensors
    Connect(ConnectionParams),
    /// Stop the robot and close the link
    Unconnect,
    /// Move to the approach pose of one field
    GotoField(FieldSpec),
    /// Ground-finding over the listed fields, in order
    Find(Vec<FieldSpec>),
    /// Move the tool to this absolute height while ground-finding
    AdjustGround(f64),
    /// Save the ground for the current field using this operator height
    SaveGround(f64),
    /// Record over every located field
    Start(RunConfig),
    /// Change the run limit of the recording in progress
    AdjustRun(RunLimit),
    /// Cancel the workflow in progress
    Stop,
    /// Shut the orchestrator down
    Close,
}

impl ScanCommand {
    /// Request name used in logs and rejections.
    pub fn name(&self) -> &'static str {
        match self {
            ScanCommand::Connect(_) => "connect",
            ScanCommand::Unconnect => "unconnect",
            ScanCommand::GotoField(_) => "goto-field",
            ScanCommand::Find(_) => "find",
            ScanCommand::AdjustGround(_) => "adjust-ground",
            ScanCommand::SaveGround(_) => "save-ground",
            ScanCommand::Start(_) => "start",
            ScanCommand::AdjustRun(_) => "adjust-run",
            ScanCommand::Stop => "stop",
            ScanCommand::Close => "close",
        }
    }
}

/// Terminal and milestone events pushed to the control surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Link and sensors are open
    Connected,
    /// Connect failed; everything opened was released
    ConnectionError(String),
    /// Output file could not be created
    FileOpenError(PathBuf),
    /// Ground saved for a field, with the resulting level
    GroundLevelSaved {
        /// Field number
        field: usize,
        /// Saved ground level
        level: f64,
    },
    /// Every field has a ground level
    GroundDone,
    /// Recording ended; absolute path of the output file
    ScanComplete(PathBuf),
    /// A workflow finished or was unwound after a stop request
    WorkflowEnded,
    /// A workflow aborted with an error
    WorkflowError(String),
    /// Request refused in the current state
    Rejected {
        /// Name of the refused request
        command: &'static str,
        /// Why it was refused
        reason: String,
    },
}
