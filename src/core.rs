//! Core data types shared by the robot link, the sensor readers, the acquisition
//! pipeline and the scan orchestrator.
//!
//! # Data Flow
//!
//! ```text
//! RobotLink --[telemetry line]--> Acquisition --[Row]--> mpsc --> StorageWriter --> CSV
//!                                     ^
//!               SensorSnapshot (watch, last-known value, one writer per reader)
//! ```
//!
//! Column layout of the output file is a pure function of the enabled quantities and
//! the acquisition mode, see [`RecordLayout`]. Header rows and data rows are both
//! produced from the same layout so they can never disagree in width or order.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Value written for every column of a snapshot that failed to decode.
pub const ERROR_SENTINEL: &str = "Error";

/// Annotation used in header row 2 for the time, position and field columns.
pub const FIXED_COLUMN_MARK: &str = "X";

// =============================================================================
// Robot geometry
// =============================================================================

/// Six joint or Cartesian coordinates of the arm.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose(pub [f64; 6]);

impl Pose {
    /// Index of the vertical tool axis in a Cartesian pose.
    pub const VERTICAL_AXIS: usize = 2;

    /// Parses exactly six comma-free numeric tokens.
    pub fn from_tokens<'a, I>(tokens: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut values = [0.0; 6];
        let mut count = 0;
        for token in tokens {
            if count == 6 {
                return Err(DaqError::Protocol(format!(
                    "expected 6 pose values, got more (extra '{}')",
                    token
                )));
            }
            values[count] = token.trim().parse::<f64>().map_err(|_| {
                DaqError::Protocol(format!("pose value '{}' is not a number", token.trim()))
            })?;
            count += 1;
        }
        if count != 6 {
            return Err(DaqError::Protocol(format!(
                "expected 6 pose values, got {}",
                count
            )));
        }
        Ok(Self(values))
    }

    /// Height of the tool.
    pub fn vertical(&self) -> f64 {
        self.0[Self::VERTICAL_AXIS]
    }

    /// Same pose at another tool height.
    pub fn with_vertical(mut self, height: f64) -> Self {
        self.0[Self::VERTICAL_AXIS] = height;
        self
    }

    /// Replaces the base joint, which sets the approach angle of a joint pose.
    pub fn with_base_angle(mut self, angle: f64) -> Self {
        self.0[0] = angle;
        self
    }

    /// Comma-separated wire form, e.g. `0,0,140,0,-50,180`.
    pub fn to_wire(&self) -> String {
        self.0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_wire())
    }
}

// =============================================================================
// Fields and ground levels
// =============================================================================

/// Operator description of one sampling field.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// 1-based field number, written to the `Field number` column.
    pub index: usize,
    /// Horizontal distance used to look up the approach pose.
    pub target_distance: f64,
    /// Base-joint angle substituted into the approach pose.
    pub target_angle: f64,
}

/// Ground offsets established by ground-finding, one slot per field number.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroundLevels {
    levels: BTreeMap<usize, f64>,
}

impl GroundLevels {
    /// No field has a ground level yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every saved level.
    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Records `initial_height - operator_height` for `field`.
    pub fn save(&mut self, field: usize, initial_height: f64, operator_height: f64) -> f64 {
        let level = initial_height - operator_height;
        self.levels.insert(field, level);
        level
    }

    /// Saved level of `field`, or [`DaqError::GroundNotSet`].
    pub fn get(&self, field: usize) -> AppResult<f64> {
        self.levels
            .get(&field)
            .copied()
            .ok_or(DaqError::GroundNotSet(field))
    }
}

// =============================================================================
// Sensor quantities and snapshots
// =============================================================================

/// Physical bus a quantity is read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorFamily {
    /// Serial line anemometer with temperature/pressure.
    Line,
    /// USB bulk gas analyzer (CO2/H2O/pressure/temperature).
    Framed,
}

/// One selectable measured quantity. Declaration order is the column order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Three wind components plus magnetic heading.
    Wind,
    /// Air temperature from the line sensor.
    Temperature,
    /// Air pressure from the line sensor.
    Pressure,
    /// CO2 concentration.
    Co2,
    /// H2O concentration.
    Humidity,
    /// Analyzer cell pressure and temperature.
    GasInternal,
}

impl Quantity {
    /// Every quantity in declared order.
    pub const ALL: [Quantity; 6] = [
        Quantity::Wind,
        Quantity::Temperature,
        Quantity::Pressure,
        Quantity::Co2,
        Quantity::Humidity,
        Quantity::GasInternal,
    ];

    /// Bus the quantity is read from.
    pub fn family(self) -> SensorFamily {
        match self {
            Quantity::Wind | Quantity::Temperature | Quantity::Pressure => SensorFamily::Line,
            Quantity::Co2 | Quantity::Humidity | Quantity::GasInternal => SensorFamily::Framed,
        }
    }

    /// Header cells the quantity contributes.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Quantity::Wind => &["Wind (U)", "Wind (V)", "Wind (W)", "Magnetic"],
            Quantity::Temperature => &["Temperature"],
            Quantity::Pressure => &["Pressure"],
            Quantity::Co2 => &["CO2"],
            Quantity::Humidity => &["Humidity"],
            Quantity::GasInternal => &["Pressure CO2", "Temperature CO2"],
        }
    }

    /// Slice of the owning family's snapshot this quantity contributes.
    pub fn snapshot_range(self) -> std::ops::Range<usize> {
        match self {
            Quantity::Wind => 0..4,
            Quantity::Temperature => 4..5,
            Quantity::Pressure => 5..6,
            Quantity::Co2 => 0..1,
            Quantity::Humidity => 1..2,
            Quantity::GasInternal => 2..4,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Wind => "wind",
            Quantity::Temperature => "temperature",
            Quantity::Pressure => "pressure",
            Quantity::Co2 => "co2",
            Quantity::Humidity => "humidity",
            Quantity::GasInternal => "gas_internal",
        };
        f.write_str(name)
    }
}

/// Latest decoded reading of one sensor family.
///
/// Last-known-value semantics: readers overwrite it in place, nobody tracks staleness.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorSnapshot {
    /// Decoded values in snapshot order
    pub values: Vec<f64>,
    /// False when the last read failed to decode
    pub valid: bool,
}

impl SensorSnapshot {
    /// Width of the line-sensor snapshot: U, V, W, magnetic, temperature, pressure.
    pub const LINE_WIDTH: usize = 6;
    /// Width of the framed-sensor snapshot: CO2, H2O, pressure, temperature.
    pub const FRAMED_WIDTH: usize = 4;

    /// Snapshot of freshly decoded values.
    pub fn valid(values: Vec<f64>) -> Self {
        Self {
            values,
            valid: true,
        }
    }

    /// Sentinel snapshot of `width` invalid values.
    pub fn error(width: usize) -> Self {
        Self {
            values: vec![f64::NAN; width],
            valid: false,
        }
    }

    /// Snapshot width of a family.
    pub fn width_for(family: SensorFamily) -> usize {
        match family {
            SensorFamily::Line => Self::LINE_WIDTH,
            SensorFamily::Framed => Self::FRAMED_WIDTH,
        }
    }

    /// Renders one slice as cells, using the sentinel when the reading is invalid.
    pub fn render(&self, range: std::ops::Range<usize>) -> Vec<String> {
        range
            .map(|i| match self.values.get(i) {
                Some(v) if self.valid => v.to_string(),
                _ => ERROR_SENTINEL.to_string(),
            })
            .collect()
    }
}

// =============================================================================
// Acquisition mode and output layout
// =============================================================================

/// How samples are taken during the vertical passes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Robot streams telemetry; samples are gated to `frequency_hz`.
    Continuous {
        /// Target sample rate in Hz
        frequency_hz: f64,
    },
    /// One explicit sample after every discrete step.
    Point,
}

impl AcquisitionMode {
    /// Name written in the `Mode` column.
    pub fn label(&self) -> &'static str {
        match self {
            AcquisitionMode::Continuous { .. } => "Continuous",
            AcquisitionMode::Point => "Discontinuous",
        }
    }

    /// Whether the robot streams telemetry during the sweep.
    pub fn is_continuous(&self) -> bool {
        matches!(self, AcquisitionMode::Continuous { .. })
    }

    /// Minimum spacing of continuous samples; `None` in point mode.
    ///
    /// Fails for a frequency that is not positive or whose period does not fit a
    /// [`Duration`].
    pub fn sample_period(&self) -> AppResult<Option<Duration>> {
        match *self {
            AcquisitionMode::Continuous { frequency_hz } if frequency_hz > 0.0 => {
                Duration::try_from_secs_f64(1.0 / frequency_hz)
                    .map(Some)
                    .map_err(|_| {
                        DaqError::InvalidState(format!(
                            "frequency {} Hz is too low to sample",
                            frequency_hz
                        ))
                    })
            }
            AcquisitionMode::Continuous { frequency_hz } => Err(DaqError::InvalidState(
                format!("frequency must be positive, got {}", frequency_hz),
            )),
            AcquisitionMode::Point => Ok(None),
        }
    }
}

/// Column layout of one output file.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordLayout {
    quantities: Vec<Quantity>,
    annotations: BTreeMap<Quantity, String>,
    mode: AcquisitionMode,
    sample_count: usize,
}

impl RecordLayout {
    /// Builds a layout; quantities are de-duplicated and put in declared order.
    pub fn new(
        quantities: &[Quantity],
        annotations: &BTreeMap<Quantity, String>,
        mode: AcquisitionMode,
        sample_count: usize,
    ) -> Self {
        let mut quantities = quantities.to_vec();
        quantities.sort();
        quantities.dedup();
        Self {
            quantities,
            annotations: annotations.clone(),
            mode,
            sample_count,
        }
    }

    /// Enabled quantities in column order.
    pub fn quantities(&self) -> &[Quantity] {
        &self.quantities
    }

    /// Acquisition mode of the run.
    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    /// Whether any enabled quantity is read from `family`.
    pub fn needs(&self, family: SensorFamily) -> bool {
        self.quantities.iter().any(|q| q.family() == family)
    }

    fn mode_parameter(&self) -> String {
        match self.mode {
            AcquisitionMode::Continuous { frequency_hz } => frequency_hz.to_string(),
            AcquisitionMode::Point => self.sample_count.to_string(),
        }
    }

    /// Column names, then per-column sensor/mode annotations.
    pub fn header_rows(&self) -> [Vec<String>; 2] {
        let mut names: Vec<String> = ["Time", "Position", "Field number"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut marks = vec![FIXED_COLUMN_MARK.to_string(); 3];

        for quantity in &self.quantities {
            let mark = self
                .annotations
                .get(quantity)
                .cloned()
                .unwrap_or_else(|| quantity.to_string());
            for column in quantity.columns() {
                names.push((*column).to_string());
                marks.push(mark.clone());
            }
        }

        names.push("Mode".to_string());
        marks.push(self.mode.label().to_string());
        names.push(match self.mode {
            AcquisitionMode::Continuous { .. } => "Frequency".to_string(),
            AcquisitionMode::Point => "Number of points".to_string(),
        });
        marks.push(self.mode_parameter());

        [names, marks]
    }

    /// Number of columns in every row.
    pub fn width(&self) -> usize {
        5 + self
            .quantities
            .iter()
            .map(|q| q.columns().len())
            .sum::<usize>()
    }

    /// Fuses a position sample with the latest snapshots into a row.
    pub fn build_row(
        &self,
        timestamp: DateTime<Local>,
        position: f64,
        field: usize,
        line: &SensorSnapshot,
        framed: &SensorSnapshot,
    ) -> Row {
        let mut values = Vec::with_capacity(self.width() - 5);
        for quantity in &self.quantities {
            let snapshot = match quantity.family() {
                SensorFamily::Line => line,
                SensorFamily::Framed => framed,
            };
            values.extend(snapshot.render(quantity.snapshot_range()));
        }
        Row {
            timestamp,
            position,
            field,
            values,
            mode: self.mode.label(),
            mode_parameter: self.mode_parameter(),
        }
    }
}

/// One acquired sample, immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Wall-clock time of the sample
    pub timestamp: DateTime<Local>,
    /// Tool height
    pub position: f64,
    /// Field number
    pub field: usize,
    /// Sensor cells in layout order
    pub values: Vec<String>,
    /// `Mode` column
    pub mode: &'static str,
    /// Frequency or number of points
    pub mode_parameter: String,
}

impl Row {
    /// Timestamp with centisecond resolution, e.g. `2024-06-01 12:30:05.42`.
    pub fn format_timestamp(&self) -> String {
        format!(
            "{}.{:02}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.timestamp.timestamp_subsec_millis() / 10
        )
    }

    /// Cells in output column order.
    pub fn to_record(&self) -> Vec<String> {
        let mut record = Vec::with_capacity(self.values.len() + 5);
        record.push(self.format_timestamp());
        record.push(self.position.to_string());
        record.push(self.field.to_string());
        record.extend(self.values.iter().cloned());
        record.push(self.mode.to_string());
        record.push(self.mode_parameter.clone());
        record
    }
}

// =============================================================================
// Workflow state
// =============================================================================

/// Where the scan workflow currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Waiting for a request.
    Idle,
    /// Opening the robot link and sensors.
    Connecting,
    /// Link and sensors open.
    Connected,
    /// Moving to a field's approach pose.
    Positioning,
    /// Waiting for the operator to find the ground.
    GroundSeek,
    /// Moving the tool to an operator height.
    GroundAdjust,
    /// Ground level stored for the current field.
    GroundSaved,
    /// Every field has a ground level.
    GroundDone,
    /// Preparing the output file.
    Scanning,
    /// Sweeping fields and writing rows.
    Recording,
    /// Ground-finding is being cancelled.
    CancelSeek,
    /// Recording is being cancelled.
    CancelScan,
    /// Stop with no workflow running.
    CancelSimple,
    /// Final close sequence.
    ShuttingDown,
}

impl ScanState {
    /// Cancel state matching the busy state a stop request arrives in.
    pub fn cancel_state(self) -> Option<ScanState> {
        match self {
            ScanState::GroundSeek | ScanState::GroundAdjust | ScanState::GroundSaved => {
                Some(ScanState::CancelSeek)
            }
            ScanState::Recording | ScanState::Scanning => Some(ScanState::CancelScan),
            ScanState::Idle | ScanState::Connected | ScanState::GroundDone => {
                Some(ScanState::CancelSimple)
            }
            _ => None,
        }
    }

    /// Snake-case name used on the control surface.
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Connecting => "connecting",
            ScanState::Connected => "connected",
            ScanState::Positioning => "positioning",
            ScanState::GroundSeek => "ground_seek",
            ScanState::GroundAdjust => "ground_adjust",
            ScanState::GroundSaved => "ground_saved",
            ScanState::GroundDone => "ground_done",
            ScanState::Scanning => "scanning",
            ScanState::Recording => "recording",
            ScanState::CancelSeek => "cancel_seek",
            ScanState::CancelScan => "cancel_scan",
            ScanState::CancelSimple => "cancel_simple",
            ScanState::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus progress fraction, mirrored to the control surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanStatus {
    /// Current workflow state
    pub state: ScanState,
    /// Completed fraction of the current run, 0 to 1
    pub progress: f64,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            state: ScanState::Idle,
            progress: 0.0,
        }
    }
}
