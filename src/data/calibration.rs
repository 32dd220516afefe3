//! Positioning reference table.
//!
//! A CSV file whose header names an offset column (by default `TY`). Every data row
//! carries a six-value joint pose in its first six columns plus the measured linear
//! offset reached with that pose. Rows that do not parse are skipped.

use std::path::Path;

use tracing::{debug, info};

use crate::config::CalibrationConfig;
use crate::core::Pose;
use crate::error::{AppResult, DaqError};

/// One reference row.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationEntry {
    /// Joint pose that reaches `offset`
    pub pose: Pose,
    /// Measured linear offset
    pub offset: f64,
}

/// Reference poses searched by offset.
#[derive(Clone, Debug)]
pub struct CalibrationTable {
    entries: Vec<CalibrationEntry>,
    tolerance: f64,
}

impl CalibrationTable {
    /// Table over already-parsed entries.
    pub fn new(entries: Vec<CalibrationEntry>, tolerance: f64) -> Self {
        Self { entries, tolerance }
    }

    /// Loads the configured table.
    pub fn load(config: &CalibrationConfig) -> AppResult<Self> {
        Self::from_path(&config.path, &config.offset_column, config.tolerance)
    }

    /// Reads a table from CSV, skipping unparsable rows.
    ///
    /// Fails with [`DaqError::Calibration`] when the file cannot be opened or has no
    /// `offset_column` header.
    pub fn from_path(path: &Path, offset_column: &str, tolerance: f64) -> AppResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| {
                DaqError::Calibration(format!("cannot open '{}': {}", path.display(), e))
            })?;

        let offset_index = reader
            .headers()?
            .iter()
            .position(|h| h.trim() == offset_column)
            .ok_or_else(|| {
                DaqError::Calibration(format!(
                    "'{}' has no '{}' column",
                    path.display(),
                    offset_column
                ))
            })?;

        let mut entries = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    debug!("Skipping calibration row {}: {}", line + 2, e);
                    continue;
                }
            };
            let offset = record
                .get(offset_index)
                .and_then(|v| v.trim().parse::<f64>().ok());
            let pose = Pose::from_tokens(record.iter().take(6));
            match (offset, pose) {
                (Some(offset), Ok(pose)) => entries.push(CalibrationEntry { pose, offset }),
                _ => debug!("Skipping calibration row {}", line + 2),
            }
        }

        info!(
            "Loaded {} calibration poses from '{}'",
            entries.len(),
            path.display()
        );
        Ok(Self::new(entries, tolerance))
    }

    /// Number of usable rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no row parsed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First pose whose offset is within tolerance of `target_distance`.
    pub fn find_start_pose(&self, target_distance: f64) -> AppResult<Pose> {
        self.entries
            .iter()
            .find(|entry| (entry.offset - target_distance).abs() <= self.tolerance)
            .map(|entry| entry.pose)
            .ok_or(DaqError::CalibrationLookup {
                target: target_distance,
                tolerance: self.tolerance,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn table(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const TABLE: &str = "\
J1,J2,J3,J4,J5,J6,TX,TY
0,10,20,0,60,0,5,300
0,15,25,0,55,0,5,400
bad,row,here,0,0,0,5,450
0,20,30,0,50,0,5,500
";

    #[test]
    fn test_lookup_returns_unique_match() {
        let file = table(TABLE);
        let table = CalibrationTable::from_path(file.path(), "TY", 50.0).unwrap();
        assert_eq!(table.len(), 3);
        let pose = table.find_start_pose(420.0).unwrap();
        assert_eq!(pose.0, [0.0, 15.0, 25.0, 0.0, 55.0, 0.0]);
    }

    #[test]
    fn test_lookup_tolerance_is_inclusive_and_first_wins() {
        let file = table(TABLE);
        let table = CalibrationTable::from_path(file.path(), "TY", 50.0).unwrap();
        assert_eq!(table.find_start_pose(350.0).unwrap().0[1], 10.0);
        assert_eq!(table.find_start_pose(550.0).unwrap().0[1], 20.0);
    }

    #[test]
    fn test_lookup_miss_is_an_error() {
        let file = table(TABLE);
        let table = CalibrationTable::from_path(file.path(), "TY", 50.0).unwrap();
        assert!(matches!(
            table.find_start_pose(1000.0),
            Err(DaqError::CalibrationLookup { .. })
        ));
    }

    #[test]
    fn test_missing_file_or_column() {
        assert!(matches!(
            CalibrationTable::from_path(Path::new("/nonexistent/table.csv"), "TY", 50.0),
            Err(DaqError::Calibration(_))
        ));
        let file = table("A,B\n1,2\n");
        assert!(matches!(
            CalibrationTable::from_path(file.path(), "TY", 50.0),
            Err(DaqError::Calibration(_))
        ));
    }
}
