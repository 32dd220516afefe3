//! Acquisition pipeline.
//!
//! Turns robot position samples into output rows. In continuous mode the robot link
//! hands every line seen during a slow vertical move to [`Acquisition`] through the
//! [`TelemetrySink`] trait; a position line becomes a row only if at least one sample
//! period has passed since the previous accepted sample of the same move. In point mode
//! the sweep calls [`Acquisition::sample`] once after each step instead.
//!
//! Rows are pushed into an unbounded channel, so the robot wait loop never blocks on
//! storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::core::{RecordLayout, Row};
use crate::error::AppResult;
use crate::instrument::SnapshotFeed;
use crate::robot::{is_position_line, parse_position, TelemetrySink};

/// Converts robot positions of one field's sweep into rows.
pub struct Acquisition {
    layout: Arc<RecordLayout>,
    field: usize,
    feed: SnapshotFeed,
    rows: mpsc::UnboundedSender<Row>,
    period: Option<Duration>,
    last_sample: Instant,
    emitted: usize,
    sink_closed: bool,
}

impl Acquisition {
    /// Pipeline for `field` writing into `rows`.
    ///
    /// Fails when the layout's frequency has no usable sample period.
    pub fn new(
        layout: Arc<RecordLayout>,
        field: usize,
        feed: SnapshotFeed,
        rows: mpsc::UnboundedSender<Row>,
    ) -> AppResult<Self> {
        let period = layout.mode().sample_period()?;
        Ok(Self {
            layout,
            field,
            feed,
            rows,
            period,
            last_sample: Instant::now(),
            emitted: 0,
            sink_closed: false,
        })
    }

    /// Rate-gated conversion of one telemetry line.
    ///
    /// Returns whether the line became a row, and the sample time to gate the next
    /// line against.
    pub fn on_telemetry(&mut self, line: &str, last_sample: Instant) -> (bool, Instant) {
        let Some(period) = self.period else {
            return (false, last_sample);
        };
        if !is_position_line(line) {
            return (false, last_sample);
        }
        let now = Instant::now();
        if now.duration_since(last_sample) < period {
            return (false, last_sample);
        }
        match parse_position(line) {
            Ok(pose) => {
                self.emit(pose.vertical());
                (true, now)
            }
            Err(e) => {
                trace!("Ignoring telemetry line: {}", e);
                (false, last_sample)
            }
        }
    }

    /// Ungated sample at `position`, used after every step in point mode.
    pub fn sample(&mut self, position: f64) {
        self.emit(position);
    }

    /// Rows produced so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn emit(&mut self, position: f64) {
        let row = self.layout.build_row(
            Local::now(),
            position,
            self.field,
            &self.feed.line(),
            &self.feed.framed(),
        );
        if self.rows.send(row).is_err() {
            if !self.sink_closed {
                warn!("Storage writer is gone, dropping acquired rows");
                self.sink_closed = true;
            }
            return;
        }
        self.emitted += 1;
    }
}

impl TelemetrySink for Acquisition {
    fn begin_move(&mut self) {
        self.last_sample = Instant::now();
    }

    fn on_line(&mut self, line: &str) {
        let (_, last) = self.on_telemetry(line, self.last_sample);
        self.last_sample = last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AcquisitionMode, Quantity};
    use std::collections::BTreeMap;

    fn acquisition(mode: AcquisitionMode) -> (Acquisition, mpsc::UnboundedReceiver<Row>) {
        let layout = Arc::new(RecordLayout::new(
            &[Quantity::Temperature],
            &BTreeMap::new(),
            mode,
            10,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Acquisition::new(layout, 2, SnapshotFeed::idle(), tx).unwrap(),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_accepts_one_line_per_period() {
        let (mut acq, mut rx) =
            acquisition(AcquisitionMode::Continuous { frequency_hz: 2.0 });
        let start = Instant::now();

        let (consumed, last) = acq.on_telemetry("posx,0,0,10,0,0,0,2", start);
        assert!(!consumed);
        assert_eq!(last, start);

        tokio::time::advance(Duration::from_millis(500)).await;
        let (consumed, last) = acq.on_telemetry("posx,0,0,9,0,0,0,2", start);
        assert!(consumed);
        assert!(last > start);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!acq.on_telemetry("posx,0,0,8,0,0,0,2", last).0);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(!acq.on_telemetry("sgoto,done", last).0);
        assert!(acq.on_telemetry("posx,0,0,7,0,0,0,2", last).0);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.position, 9.0);
        assert_eq!(first.field, 2);
        assert_eq!(first.values, vec!["Error"]);
        assert_eq!(rx.try_recv().unwrap().position, 7.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_resets_gate_per_move() {
        let (mut acq, mut rx) =
            acquisition(AcquisitionMode::Continuous { frequency_hz: 1.0 });
        acq.begin_move();
        for _ in 0..6 {
            tokio::time::advance(Duration::from_millis(250)).await;
            acq.on_line("posx,0,0,1,0,0,0,2");
        }
        assert_eq!(acq.emitted(), 1);

        acq.begin_move();
        tokio::time::advance(Duration::from_millis(250)).await;
        acq.on_line("posx,0,0,1,0,0,0,2");
        assert_eq!(acq.emitted(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_point_mode_ignores_telemetry() {
        let (mut acq, mut rx) = acquisition(AcquisitionMode::Point);
        assert!(!acq.on_telemetry("posx,0,0,1,0,0,0,2", Instant::now()).0);
        acq.sample(-4.5);
        let row = rx.try_recv().unwrap();
        assert_eq!(row.position, -4.5);
        assert_eq!(row.mode, "Discontinuous");
        assert_eq!(row.mode_parameter, "10");
    }

    #[test]
    fn test_unrepresentable_frequency_is_an_error() {
        let layout = Arc::new(RecordLayout::new(
            &[],
            &BTreeMap::new(),
            AcquisitionMode::Continuous { frequency_hz: 1e-20 },
            10,
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(Acquisition::new(layout, 1, SnapshotFeed::idle(), tx).is_err());
    }
}
