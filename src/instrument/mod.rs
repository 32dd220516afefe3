//! Sensor readers
//!
//! One background reader per physical sensor bus. A reader owns its device adapter on a
//! blocking thread, polls it in a loop until its stop flag is raised, and publishes the
//! latest decoded [`SensorSnapshot`] through a `watch` channel. It is the only writer of
//! that channel; everyone else reads the last value.
//!
//! Stopping a reader always joins its thread, and the device comes back out of the join
//! so it is never released while the thread could still touch it.
//!
//! Device handles live in a [`SensorBus`] between sweeps. A sweep borrows them with
//! [`SensorBus::start`] and returns them with [`SensorBus::restore`].

pub mod framed_sensor;
pub mod line_sensor;

pub use framed_sensor::FramedSensorReader;
pub use line_sensor::LineSensorReader;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{BulkEndpoint, LineSource, SerialLineSource, UsbBulkEndpoint};
use crate::config::{FramedSensorConfig, LineSensorConfig};
use crate::core::{Quantity, RecordLayout, SensorFamily, SensorSnapshot};
use crate::error::{AppResult, DaqError};

/// Pause between polls, keeps an idle device from spinning the thread.
const POLL_PAUSE: Duration = Duration::from_millis(2);

/// A decoder loop body run on a reader thread.
pub trait SensorReader: Send + 'static {
    /// Family whose snapshot the reader publishes.
    const FAMILY: SensorFamily;

    /// One read attempt. Returns a snapshot when the published value should change.
    fn poll(&mut self) -> Option<SensorSnapshot>;
}

/// Running reader: stop flag, snapshot receiver and the thread that returns the reader.
pub struct ReaderHandle<R> {
    stop: Arc<AtomicBool>,
    snapshot: watch::Receiver<SensorSnapshot>,
    task: JoinHandle<R>,
}

impl<R: SensorReader> ReaderHandle<R> {
    /// Moves `reader` onto a blocking thread and starts polling.
    pub fn spawn(mut reader: R) -> Self {
        let width = SensorSnapshot::width_for(R::FAMILY);
        let (tx, rx) = watch::channel(SensorSnapshot::error(width));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let task = tokio::task::spawn_blocking(move || {
            info!("{:?} sensor reader started", R::FAMILY);
            while !thread_stop.load(Ordering::Relaxed) {
                if let Some(snapshot) = reader.poll() {
                    tx.send_replace(snapshot);
                }
                std::thread::sleep(POLL_PAUSE);
            }
            info!("{:?} sensor reader exiting", R::FAMILY);
            reader
        });

        Self {
            stop,
            snapshot: rx,
            task,
        }
    }

    /// Receiver of the published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.snapshot.clone()
    }

    /// Raises the stop flag and joins the thread.
    pub async fn stop(self) -> AppResult<R> {
        self.stop.store(true, Ordering::Relaxed);
        self.task
            .await
            .map_err(|e| DaqError::SensorDevice(format!("reader thread failed: {}", e)))
    }
}

/// Latest snapshot of each family; families without a running reader read as the sentinel.
#[derive(Clone)]
pub struct SnapshotFeed {
    line: watch::Receiver<SensorSnapshot>,
    framed: watch::Receiver<SensorSnapshot>,
}

impl SnapshotFeed {
    /// Feed over running readers; a missing one reads as the sentinel.
    pub fn new(
        line: Option<watch::Receiver<SensorSnapshot>>,
        framed: Option<watch::Receiver<SensorSnapshot>>,
    ) -> Self {
        let idle = |width| watch::channel(SensorSnapshot::error(width)).1;
        Self {
            line: line.unwrap_or_else(|| idle(SensorSnapshot::LINE_WIDTH)),
            framed: framed.unwrap_or_else(|| idle(SensorSnapshot::FRAMED_WIDTH)),
        }
    }

    /// Feed with no readers at all.
    pub fn idle() -> Self {
        Self::new(None, None)
    }

    /// Latest line-sensor snapshot.
    pub fn line(&self) -> SensorSnapshot {
        self.line.borrow().clone()
    }

    /// Latest gas-analyzer snapshot.
    pub fn framed(&self) -> SensorSnapshot {
        self.framed.borrow().clone()
    }
}

/// Readers running for one sweep.
pub struct ActiveReaders {
    line: Option<ReaderHandle<LineSensorReader>>,
    framed: Option<ReaderHandle<FramedSensorReader>>,
}

impl ActiveReaders {
    /// Snapshot feed for the acquisition pipeline.
    pub fn feed(&self) -> SnapshotFeed {
        SnapshotFeed::new(
            self.line.as_ref().map(ReaderHandle::subscribe),
            self.framed.as_ref().map(ReaderHandle::subscribe),
        )
    }
}

/// Device handles opened at connect time.
pub struct SensorBus {
    line_config: LineSensorConfig,
    framed_config: FramedSensorConfig,
    line: Option<Box<dyn LineSource>>,
    framed: Option<Box<dyn BulkEndpoint>>,
}

impl SensorBus {
    /// Bus without devices; sweeps run with sentinel snapshots.
    pub fn empty(line_config: LineSensorConfig, framed_config: FramedSensorConfig) -> Self {
        Self {
            line_config,
            framed_config,
            line: None,
            framed: None,
        }
    }

    /// Opens the devices backing `quantities`.
    pub fn open(
        line_config: &LineSensorConfig,
        framed_config: &FramedSensorConfig,
        quantities: &[Quantity],
    ) -> AppResult<Self> {
        let mut bus = Self::empty(line_config.clone(), framed_config.clone());
        if quantities.iter().any(|q| q.family() == SensorFamily::Line) {
            bus.line = Some(Box::new(SerialLineSource::open(line_config)?));
        }
        if quantities.iter().any(|q| q.family() == SensorFamily::Framed) {
            bus.framed = Some(Box::new(UsbBulkEndpoint::open(framed_config)?));
        }
        Ok(bus)
    }

    /// Installs a line device, e.g. a mock.
    pub fn with_line(mut self, device: Box<dyn LineSource>) -> Self {
        self.line = Some(device);
        self
    }

    /// Installs a bulk device, e.g. a mock.
    pub fn with_framed(mut self, device: Box<dyn BulkEndpoint>) -> Self {
        self.framed = Some(device);
        self
    }

    /// Whether a device of `family` is held by the bus.
    pub fn has(&self, family: SensorFamily) -> bool {
        match family {
            SensorFamily::Line => self.line.is_some(),
            SensorFamily::Framed => self.framed.is_some(),
        }
    }

    /// Lends the devices the layout needs to freshly spawned readers.
    pub fn start(&mut self, layout: &RecordLayout) -> ActiveReaders {
        let line = if layout.needs(SensorFamily::Line) {
            self.line
                .take()
                .map(|device| ReaderHandle::spawn(LineSensorReader::new(device, &self.line_config)))
        } else {
            None
        };
        let framed = if layout.needs(SensorFamily::Framed) {
            self.framed.take().map(|device| {
                ReaderHandle::spawn(FramedSensorReader::new(device, &self.framed_config))
            })
        } else {
            None
        };
        if layout.needs(SensorFamily::Line) && line.is_none() {
            warn!("Line sensor quantities enabled but no port is open, writing sentinels");
        }
        if layout.needs(SensorFamily::Framed) && framed.is_none() {
            warn!("Gas analyzer quantities enabled but no device is open, writing sentinels");
        }
        ActiveReaders { line, framed }
    }

    /// Stops and joins the readers, taking their devices back.
    pub async fn restore(&mut self, readers: ActiveReaders) -> AppResult<()> {
        let mut errors = Vec::new();
        if let Some(handle) = readers.line {
            match handle.stop().await {
                Ok(reader) => self.line = Some(reader.into_device()),
                Err(e) => errors.push(e),
            }
        }
        if let Some(handle) = readers.framed {
            match handle.stop().await {
                Ok(reader) => self.framed = Some(reader.into_device()),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockEvent, MockLineSource};
    use crate::core::AcquisitionMode;
    use std::collections::BTreeMap;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bus_lends_and_recovers_devices() {
        let line = MockLineSource::new([MockEvent::text(
            "S 1.0 x 2.0 x 3.0 x 20.5 x x x 1013.2 x 45.0",
        )]);
        let mut bus = SensorBus::empty(LineSensorConfig::default(), FramedSensorConfig::default())
            .with_line(Box::new(line));

        let layout = RecordLayout::new(
            &[Quantity::Wind, Quantity::Co2],
            &BTreeMap::new(),
            AcquisitionMode::Point,
            1,
        );
        let readers = bus.start(&layout);
        assert!(!bus.has(SensorFamily::Line));

        let feed = readers.feed();
        let mut waited = 0;
        while !feed.line().valid && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(feed.line().values, vec![1.0, 2.0, 3.0, 45.0, 20.5, 1013.2]);
        assert!(!feed.framed().valid);

        bus.restore(readers).await.unwrap();
        assert!(bus.has(SensorFamily::Line));
        assert!(!bus.has(SensorFamily::Framed));
    }

    #[test]
    fn test_idle_feed_reads_sentinels() {
        let feed = SnapshotFeed::idle();
        assert_eq!(feed.line().values.len(), SensorSnapshot::LINE_WIDTH);
        assert!(!feed.framed().valid);
    }
}
