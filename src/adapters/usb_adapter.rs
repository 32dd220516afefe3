//! USB bulk adapter
//!
//! Opens the gas analyzer by vendor/product id through `rusb`, claims interface 0,
//! writes the configuration request to the OUT endpoint and reads fixed-size packets
//! from the IN endpoint. [`BulkEndpoint::reopen`] drops the handle and repeats the whole
//! acquisition sequence.

use crate::adapters::BulkEndpoint;
use crate::config::FramedSensorConfig;
use crate::error::{AppResult, DaqError};

#[cfg(feature = "instrument_usb")]
use rusb::{Context, DeviceHandle, UsbContext};
#[cfg(feature = "instrument_usb")]
use tracing::{debug, info};

/// Gas analyzer bulk endpoints on a claimed USB interface.
pub struct UsbBulkEndpoint {
    config: FramedSensorConfig,
    #[cfg(feature = "instrument_usb")]
    context: Context,
    #[cfg(feature = "instrument_usb")]
    handle: Option<DeviceHandle<Context>>,
}

#[cfg(feature = "instrument_usb")]
fn usb_error(action: &str, e: rusb::Error) -> DaqError {
    DaqError::SensorDevice(format!("USB {} failed: {}", action, e))
}

/// Repeats partial bulk writes until `data` is sent; a zero-length write is a fault.
#[cfg_attr(not(feature = "instrument_usb"), allow(dead_code))]
fn write_chunked<F>(data: &[u8], mut write: F) -> AppResult<()>
where
    F: FnMut(&[u8]) -> AppResult<usize>,
{
    let mut written = 0;
    while written < data.len() {
        match write(&data[written..])? {
            0 => {
                return Err(DaqError::SensorDevice(format!(
                    "USB bulk write stalled after {} of {} bytes",
                    written,
                    data.len()
                )))
            }
            n => written += n,
        }
    }
    Ok(())
}

impl UsbBulkEndpoint {
    /// Finds the configured device, claims it and writes the optional init command.
    #[cfg(feature = "instrument_usb")]
    pub fn open(config: &FramedSensorConfig) -> AppResult<Self> {
        let context = Context::new().map_err(|e| usb_error("context init", e))?;
        let mut endpoint = Self {
            config: config.clone(),
            context,
            handle: None,
        };
        endpoint.acquire()?;
        Ok(endpoint)
    }

    /// Always fails: USB support is compiled out.
    #[cfg(not(feature = "instrument_usb"))]
    pub fn open(config: &FramedSensorConfig) -> AppResult<Self> {
        let _ = config;
        Err(DaqError::FeatureNotEnabled("instrument_usb".to_string()))
    }

    /// Configuration the endpoint was opened with.
    pub fn config(&self) -> &FramedSensorConfig {
        &self.config
    }

    #[cfg(feature = "instrument_usb")]
    fn acquire(&mut self) -> AppResult<()> {
        self.handle = None;
        let mut handle = self
            .context
            .open_device_with_vid_pid(self.config.vendor_id, self.config.product_id)
            .ok_or_else(|| {
                DaqError::SensorDevice(format!(
                    "USB device {:04x}:{:04x} not found",
                    self.config.vendor_id, self.config.product_id
                ))
            })?;
        // Not supported on every platform
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle
            .set_active_configuration(1)
            .map_err(|e| usb_error("set configuration", e))?;
        handle
            .claim_interface(0)
            .map_err(|e| usb_error("claim interface", e))?;
        info!(
            "USB device {:04x}:{:04x} opened",
            self.config.vendor_id, self.config.product_id
        );

        self.handle = Some(handle);
        if let Some(init) = self.config.init_command.clone() {
            self.write_all(init.as_bytes())?;
            debug!("Sent init command to USB device");
        }
        Ok(())
    }

    #[cfg(feature = "instrument_usb")]
    fn handle(&self) -> AppResult<&DeviceHandle<Context>> {
        self.handle
            .as_ref()
            .ok_or_else(|| DaqError::SensorDevice("USB device is not open".to_string()))
    }
}

#[cfg(feature = "instrument_usb")]
impl BulkEndpoint for UsbBulkEndpoint {
    fn read_packet(&mut self, buffer: &mut [u8]) -> AppResult<usize> {
        let handle = self.handle()?;
        match handle.read_bulk(self.config.in_endpoint, buffer, self.config.read_timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(usb_error("bulk read", e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        let handle = self.handle()?;
        write_chunked(data, |chunk| {
            handle
                .write_bulk(self.config.out_endpoint, chunk, self.config.read_timeout)
                .map_err(|e| usb_error("bulk write", e))
        })
    }

    fn reopen(&mut self) -> AppResult<()> {
        self.acquire()
    }
}

#[cfg(not(feature = "instrument_usb"))]
impl BulkEndpoint for UsbBulkEndpoint {
    fn read_packet(&mut self, _buffer: &mut [u8]) -> AppResult<usize> {
        Err(DaqError::FeatureNotEnabled("instrument_usb".to_string()))
    }

    fn write_all(&mut self, _data: &[u8]) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_usb".to_string()))
    }

    fn reopen(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_usb".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_writes_are_continued() {
        let mut sent = Vec::new();
        write_chunked(b"RATE 20\n", |chunk| {
            let n = chunk.len().min(3);
            sent.extend_from_slice(&chunk[..n]);
            Ok(n)
        })
        .unwrap();
        assert_eq!(sent, b"RATE 20\n");
    }

    #[test]
    fn test_zero_length_write_is_a_device_error() {
        let mut calls = 0;
        let result = write_chunked(b"RATE 20\n", |_| {
            calls += 1;
            Ok(if calls == 1 { 2 } else { 0 })
        });
        assert!(matches!(result, Err(DaqError::SensorDevice(_))));
        assert_eq!(calls, 2);
    }

    #[cfg(not(feature = "instrument_usb"))]
    #[test]
    fn test_open_without_feature() {
        assert!(matches!(
            UsbBulkEndpoint::open(&FramedSensorConfig::default()),
            Err(DaqError::FeatureNotEnabled(_))
        ));
    }

    #[cfg(feature = "instrument_usb")]
    #[test]
    fn test_open_absent_device_is_a_device_error() {
        let config = FramedSensorConfig {
            vendor_id: 0xFFFE,
            product_id: 0xFFFE,
            ..Default::default()
        };
        assert!(matches!(
            UsbBulkEndpoint::open(&config),
            Err(DaqError::SensorDevice(_))
        ));
    }
}
