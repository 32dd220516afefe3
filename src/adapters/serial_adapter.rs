//! Serial line adapter
//!
//! Wraps the `serialport` crate behind [`LineSource`]. The port is opened with a short
//! internal timeout; a read that times out with no complete line returns `Ok(None)`.

use crate::adapters::LineSource;
use crate::config::LineSensorConfig;
use crate::error::{AppResult, DaqError};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use tracing::{debug, info};

/// Serial port producing newline-terminated text frames.
pub struct SerialLineSource {
    port_name: String,
    #[cfg(feature = "instrument_serial")]
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialLineSource {
    /// Opens the configured port and writes the optional initialization command.
    #[cfg(feature = "instrument_serial")]
    pub fn open(config: &LineSensorConfig) -> AppResult<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout)
            .open()
            .map_err(|e| {
                DaqError::SensorDevice(format!(
                    "failed to open serial port '{}' at {} baud: {}",
                    config.port, config.baud_rate, e
                ))
            })?;
        info!(
            "Serial port '{}' opened at {} baud",
            config.port, config.baud_rate
        );

        let mut source = Self {
            port_name: config.port.clone(),
            port,
            pending: Vec::new(),
        };
        if let Some(init) = &config.init_command {
            source.write_all(init.as_bytes())?;
            debug!("Sent init command to '{}'", config.port);
        }
        Ok(source)
    }

    /// Always fails: serial support is compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(config: &LineSensorConfig) -> AppResult<Self> {
        let _ = config;
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    /// Device path the source was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

#[cfg(feature = "instrument_serial")]
impl LineSource for SerialLineSource {
    fn read_line(&mut self) -> AppResult<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        let mut chunk = [0u8; 128];
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(self.take_line())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(DaqError::SensorDevice(format!(
                "serial read on '{}' failed: {}",
                self.port_name, e
            ))),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(|e| {
                DaqError::SensorDevice(format!(
                    "serial write on '{}' failed: {}",
                    self.port_name, e
                ))
            })
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl LineSource for SerialLineSource {
    fn read_line(&mut self) -> AppResult<Option<String>> {
        Ok(self.take_line())
    }

    fn write_all(&mut self, _data: &[u8]) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn test_open_missing_port_is_a_device_error() {
        let config = LineSensorConfig {
            port: "/dev/does-not-exist-sweep".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SerialLineSource::open(&config),
            Err(DaqError::SensorDevice(_))
        ));
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[test]
    fn test_open_without_feature() {
        assert!(matches!(
            SerialLineSource::open(&LineSensorConfig::default()),
            Err(DaqError::FeatureNotEnabled(_))
        ));
    }
}
