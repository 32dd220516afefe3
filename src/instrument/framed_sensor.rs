//! USB gas analyzer reader.
//!
//! The analyzer streams tab-separated text frames terminated by `\n`, split over
//! fixed-size bulk packets. Bytes are accumulated until a full frame is available.
//! A device fault triggers an in-place reopen; the snapshot reads as the sentinel until
//! a good frame arrives again.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::SensorReader;
use crate::adapters::BulkEndpoint;
use crate::config::FramedSensorConfig;
use crate::core::{SensorFamily, SensorSnapshot};
use crate::error::{AppResult, DaqError};

/// Gas analyzer decoder: tab-separated frames delimited by newlines.
pub struct FramedSensorReader {
    device: Box<dyn BulkEndpoint>,
    positions: [usize; SensorSnapshot::FRAMED_WIDTH],
    packet: Vec<u8>,
    pending: Vec<u8>,
    faulted: bool,
    reopen_backoff: Duration,
}

impl FramedSensorReader {
    /// Reader over an opened endpoint.
    pub fn new(device: Box<dyn BulkEndpoint>, config: &FramedSensorConfig) -> Self {
        Self {
            device,
            positions: config.fields.positions(),
            packet: vec![0; config.packet_size],
            pending: Vec::new(),
            faulted: false,
            reopen_backoff: Duration::from_millis(500),
        }
    }

    /// Pause after a failed reopen.
    pub fn with_reopen_backoff(mut self, backoff: Duration) -> Self {
        self.reopen_backoff = backoff;
        self
    }

    /// Gives the endpoint back after the reader stopped.
    pub fn into_device(self) -> Box<dyn BulkEndpoint> {
        self.device
    }

    fn take_frame(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let frame: Vec<u8> = self.pending.drain(..=end).collect();
        Some(
            String::from_utf8_lossy(&frame[..end])
                .trim_end_matches('\r')
                .to_string(),
        )
    }

    /// Decodes every complete frame in the buffer; the newest good one wins.
    fn drain_frames(&mut self) -> Option<SensorSnapshot> {
        let mut latest = None;
        while let Some(frame) = self.take_frame() {
            match decode_frame(&frame, &self.positions) {
                Ok(snapshot) => latest = Some(snapshot),
                Err(e) => {
                    debug!("Discarding gas analyzer frame: {}", e);
                    if latest.is_none() {
                        latest = Some(SensorSnapshot::error(SensorSnapshot::FRAMED_WIDTH));
                    }
                }
            }
        }
        latest
    }

    fn recover(&mut self) {
        self.pending.clear();
        match self.device.reopen() {
            Ok(()) => {
                info!("Gas analyzer re-acquired");
                self.faulted = false;
            }
            Err(e) => {
                debug!("Gas analyzer reopen failed: {}", e);
                std::thread::sleep(self.reopen_backoff);
            }
        }
    }
}

/// Picks the configured tab-separated fields out of one frame.
pub fn decode_frame(frame: &str, positions: &[usize]) -> AppResult<SensorSnapshot> {
    let fields: Vec<&str> = frame.split('\t').collect();
    let values = positions
        .iter()
        .map(|&i| {
            let field = fields.get(i).ok_or_else(|| {
                DaqError::SensorDecode(format!(
                    "frame has {} fields, need index {}",
                    fields.len(),
                    i
                ))
            })?;
            field
                .trim()
                .parse::<f64>()
                .map_err(|_| DaqError::SensorDecode(format!("field '{}' is not a number", field)))
        })
        .collect::<AppResult<Vec<f64>>>()?;
    Ok(SensorSnapshot::valid(values))
}

impl SensorReader for FramedSensorReader {
    const FAMILY: SensorFamily = SensorFamily::Framed;

    fn poll(&mut self) -> Option<SensorSnapshot> {
        if self.faulted {
            self.recover();
            return None;
        }

        match self.device.read_packet(&mut self.packet) {
            Ok(0) => None,
            Ok(n) => {
                self.pending.extend_from_slice(&self.packet[..n]);
                self.drain_frames()
            }
            Err(e) => {
                warn!("Gas analyzer read failed, re-acquiring: {}", e);
                self.faulted = true;
                Some(SensorSnapshot::error(SensorSnapshot::FRAMED_WIDTH))
            }
        }
    }
}
