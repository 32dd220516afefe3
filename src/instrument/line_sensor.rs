//! Serial anemometer / temperature sensor reader.
//!
//! Each frame is one text line of whitespace-separated tokens. Values are taken from
//! fixed token positions; a line that cannot be decoded turns the whole snapshot into
//! the error sentinel and the reader carries on with the next line.

use tracing::{debug, warn};

use super::SensorReader;
use crate::adapters::LineSource;
use crate::config::LineSensorConfig;
use crate::core::{SensorFamily, SensorSnapshot};
use crate::error::{AppResult, DaqError};

/// Line decoder: whitespace-separated tokens, one reading per line.
pub struct LineSensorReader {
    device: Box<dyn LineSource>,
    positions: [usize; SensorSnapshot::LINE_WIDTH],
}

impl LineSensorReader {
    /// Reader over an opened line source.
    pub fn new(device: Box<dyn LineSource>, config: &LineSensorConfig) -> Self {
        Self {
            device,
            positions: config.tokens.positions(),
        }
    }

    /// Gives the source back after the reader stopped.
    pub fn into_device(self) -> Box<dyn LineSource> {
        self.device
    }
}

/// Picks the configured token positions out of one line.
pub fn decode_line(line: &str, positions: &[usize]) -> AppResult<SensorSnapshot> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let values = positions
        .iter()
        .map(|&i| {
            let token = tokens.get(i).ok_or_else(|| {
                DaqError::SensorDecode(format!(
                    "line has {} tokens, need index {}",
                    tokens.len(),
                    i
                ))
            })?;
            token
                .parse::<f64>()
                .map_err(|_| DaqError::SensorDecode(format!("token '{}' is not a number", token)))
        })
        .collect::<AppResult<Vec<f64>>>()?;
    Ok(SensorSnapshot::valid(values))
}

impl SensorReader for LineSensorReader {
    const FAMILY: SensorFamily = SensorFamily::Line;

    fn poll(&mut self) -> Option<SensorSnapshot> {
        match self.device.read_line() {
            Ok(Some(line)) if line.trim().is_empty() => None,
            Ok(Some(line)) => match decode_line(&line, &self.positions) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    debug!("Discarding line sensor frame: {}", e);
                    Some(SensorSnapshot::error(SensorSnapshot::LINE_WIDTH))
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Line sensor read failed: {}", e);
                std::thread::sleep(std::time::Duration::from_millis(10));
                Some(SensorSnapshot::error(SensorSnapshot::LINE_WIDTH))
            }
        }
    }
}
