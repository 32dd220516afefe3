//! Scripted adapters for reader tests.
//!
//! Each mock replays a queue of events and then behaves like an idle device
//! (timeouts forever). Writes are recorded so tests can check initialization traffic.

use std::collections::VecDeque;

use super::{BulkEndpoint, LineSource};
use crate::error::{AppResult, DaqError};

/// One scripted outcome of a read call.
#[derive(Clone, Debug, PartialEq)]
pub enum MockEvent {
    /// Bytes returned by the read, split if larger than the buffer.
    Data(Vec<u8>),
    /// Read timed out with nothing received.
    Timeout,
    /// Device error.
    Fault,
}

impl MockEvent {
    /// Data event from a string.
    pub fn text(s: &str) -> Self {
        MockEvent::Data(s.as_bytes().to_vec())
    }
}

/// Line source replaying a script of events.
#[derive(Debug, Default)]
pub struct MockLineSource {
    script: VecDeque<MockEvent>,
    /// Everything written to the device.
    pub written: Vec<u8>,
}

impl MockLineSource {
    /// Creates a source that replays `script` in order.
    pub fn new(script: impl IntoIterator<Item = MockEvent>) -> Self {
        Self {
            script: script.into_iter().collect(),
            written: Vec::new(),
        }
    }

    /// Events not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl LineSource for MockLineSource {
    fn read_line(&mut self) -> AppResult<Option<String>> {
        match self.script.pop_front() {
            Some(MockEvent::Data(bytes)) => Ok(Some(
                String::from_utf8_lossy(&bytes).trim_end().to_string(),
            )),
            Some(MockEvent::Fault) => Err(DaqError::SensorDevice("scripted fault".to_string())),
            Some(MockEvent::Timeout) | None => Ok(None),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        self.written.extend_from_slice(data);
        Ok(())
    }
}

/// Bulk endpoint replaying a script of events.
#[derive(Debug, Default)]
pub struct MockBulkEndpoint {
    script: VecDeque<MockEvent>,
    /// Everything written to the OUT endpoint.
    pub written: Vec<u8>,
    /// Calls to `reopen`, successful or not.
    pub reopen_count: usize,
    /// Reopen attempts that fail before one succeeds
    pub failing_reopens: usize,
}

impl MockBulkEndpoint {
    /// Creates an endpoint that replays `script` in order.
    pub fn new(script: impl IntoIterator<Item = MockEvent>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Events not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl BulkEndpoint for MockBulkEndpoint {
    fn read_packet(&mut self, buffer: &mut [u8]) -> AppResult<usize> {
        match self.script.pop_front() {
            Some(MockEvent::Data(bytes)) => {
                let n = bytes.len().min(buffer.len());
                buffer[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.script.push_front(MockEvent::Data(bytes[n..].to_vec()));
                }
                Ok(n)
            }
            Some(MockEvent::Fault) => Err(DaqError::SensorDevice("scripted fault".to_string())),
            Some(MockEvent::Timeout) | None => Ok(0),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        self.written.extend_from_slice(data);
        Ok(())
    }

    fn reopen(&mut self) -> AppResult<()> {
        self.reopen_count += 1;
        if self.failing_reopens > 0 {
            self.failing_reopens -= 1;
            return Err(DaqError::SensorDevice("scripted reopen failure".to_string()));
        }
        Ok(())
    }
}
