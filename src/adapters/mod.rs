//! Hardware adapter implementations
//!
//! Low-level byte transports the sensor readers run on. Both traits are blocking:
//! readers own their adapter on a dedicated blocking thread and poll it with a bounded
//! timeout so they can observe their stop flag.

pub mod mock;
pub mod serial_adapter;
pub mod usb_adapter;

pub use mock::{MockBulkEndpoint, MockLineSource};
pub use serial_adapter::SerialLineSource;
pub use usb_adapter::UsbBulkEndpoint;

use crate::error::AppResult;

/// Line-framed byte stream, e.g. a serial port.
pub trait LineSource: Send {
    /// Reads one `\n`-terminated line without its terminator.
    ///
    /// Returns `Ok(None)` when the read timed out before a full line arrived; any
    /// partial line stays buffered for the next call.
    fn read_line(&mut self) -> AppResult<Option<String>>;

    /// Writes all of `data` to the device.
    fn write_all(&mut self, data: &[u8]) -> AppResult<()>;
}

/// Packet-oriented bulk transport, e.g. a USB IN/OUT endpoint pair.
pub trait BulkEndpoint: Send {
    /// Reads one packet into `buffer`. Returns `Ok(0)` on timeout.
    fn read_packet(&mut self, buffer: &mut [u8]) -> AppResult<usize>;

    /// Writes all of `data` to the OUT endpoint.
    fn write_all(&mut self, data: &[u8]) -> AppResult<()>;

    /// Re-acquires the device after a fault, including any configuration writes.
    fn reopen(&mut self) -> AppResult<()>;
}

impl<T: LineSource + ?Sized> LineSource for Box<T> {
    fn read_line(&mut self) -> AppResult<Option<String>> {
        (**self).read_line()
    }

    fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        (**self).write_all(data)
    }
}

impl<T: BulkEndpoint + ?Sized> BulkEndpoint for Box<T> {
    fn read_packet(&mut self, buffer: &mut [u8]) -> AppResult<usize> {
        (**self).read_packet(buffer)
    }

    fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        (**self).write_all(data)
    }

    fn reopen(&mut self) -> AppResult<()> {
        (**self).reopen()
    }
}
