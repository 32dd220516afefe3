//! Vertical sweep primitive.
//!
//! One call sweeps one field: down by the field's ground level in `sample_count`
//! equal steps, then back up. Sensor readers and the storage writer exist only for the
//! duration of the call and are always stopped and joined before it returns, also when
//! the robot link fails midway.
//!
//! A sweep is never interrupted once started; callers check for cancellation between
//! sweeps.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::{RobotConfig, StorageConfig};
use crate::core::{Pose, RecordLayout};
use crate::data::{Acquisition, StorageWriter};
use crate::error::{AppResult, DaqError};
use crate::instrument::SensorBus;
use crate::robot::{Discard, RobotLink};

/// What to sweep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepRequest {
    /// Field number written in every row
    pub field: usize,
    /// Joint pose above the field, from the calibration table
    pub start_pose: Pose,
    /// Vertical travel of each pass
    pub ground_level: f64,
    /// Steps per pass
    pub sample_count: usize,
}

impl SweepRequest {
    /// Height of one vertical step.
    pub fn step(&self) -> f64 {
        self.ground_level / self.sample_count as f64
    }
}

/// Resources a sweep borrows from the orchestrator.
pub struct Sweeper<'a, S> {
    /// Robot session
    pub link: &'a mut RobotLink<S>,
    /// Devices lent to the readers for the sweep
    pub sensors: &'a mut SensorBus,
    /// Column layout of the output file
    pub layout: Arc<RecordLayout>,
    /// File the rows are appended to
    pub output: PathBuf,
    /// Safe pose and settle time
    pub robot: &'a RobotConfig,
    /// Writer batching
    pub storage: &'a StorageConfig,
}

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows produced by the pipeline
    pub rows_acquired: usize,
    /// Rows persisted
    pub rows_written: usize,
    /// Rows lost to failed flushes
    pub rows_dropped: usize,
}

impl<'a, S> Sweeper<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs one down-and-up sweep; always completes once started.
    ///
    /// Readers and the writer are joined before returning, also when a robot call fails.
    pub async fn sweep(&mut self, request: SweepRequest) -> AppResult<SweepReport> {
        if request.sample_count == 0 {
            return Err(DaqError::InvalidState(
                "sweep needs at least one sample per pass".to_string(),
            ));
        }
        info!(
            "Sweeping field {} over {} in {} steps",
            request.field, request.ground_level, request.sample_count
        );

        let readers = self.sensors.start(&self.layout);
        let writer = StorageWriter::spawn(self.output.clone(), self.storage);
        let mut rows_acquired = 0;
        let motion = match Acquisition::new(
            self.layout.clone(),
            request.field,
            readers.feed(),
            writer.sender(),
        ) {
            Ok(mut acquisition) => {
                let motion = self.run_passes(&request, &mut acquisition).await;
                rows_acquired = acquisition.emitted();
                motion
            }
            Err(e) => Err(e),
        };

        let stats = writer.finish().await;
        if let Err(e) = self.sensors.restore(readers).await {
            warn!("Sensor readers did not stop cleanly: {}", e);
        }
        motion?;
        let stats = stats?;

        debug!(
            "Field {} sweep done: {} rows acquired, {} written",
            request.field, rows_acquired, stats.written
        );
        Ok(SweepReport {
            rows_acquired,
            rows_written: stats.written,
            rows_dropped: stats.dropped,
        })
    }

    async fn run_passes(
        &mut self,
        request: &SweepRequest,
        acquisition: &mut Acquisition,
    ) -> AppResult<()> {
        let continuous = self.layout.mode().is_continuous();
        let safe = self.robot.safe_pose.with_base_angle(request.start_pose.0[0]);
        let step = request.step();

        self.link.move_joint(&safe).await?;
        if continuous {
            self.link.start_stream().await?;
        }
        tokio::time::sleep(self.robot.stream_settle).await;

        self.link
            .move_joint_slow(&request.start_pose, &mut Discard)
            .await?;
        let mut position = self.link.query_position().await?;

        for direction in [-1.0, 1.0] {
            for _ in 0..request.sample_count {
                position = position.with_vertical(position.vertical() + direction * step);
                self.link
                    .move_cartesian_slow(&position, &mut *acquisition)
                    .await?;
                if !continuous {
                    let reached = self.link.query_position().await?;
                    acquisition.sample(reached.vertical());
                }
            }
        }

        self.link.move_joint_slow(&safe, &mut Discard).await?;
        if continuous {
            self.link.stop_stream().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FramedSensorConfig, LineSensorConfig};
    use crate::core::{AcquisitionMode, Quantity};
    use crate::data::create_output;
    use crate::robot::{MockRobot, MockRobotConfig};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn run(mode: AcquisitionMode) -> (SweepReport, Vec<String>, usize) {
        let robot = MockRobot::start(MockRobotConfig {
            slow_move_duration: Duration::from_millis(1500),
            telemetry_interval: Duration::from_millis(250),
            ..Default::default()
        })
        .await
        .unwrap();
        let mut link = RobotLink::connect(&robot.address(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut sensors =
            SensorBus::empty(LineSensorConfig::default(), FramedSensorConfig::default());

        let dir = tempdir().unwrap();
        let output = dir.path().join("sweep.csv");
        let layout = Arc::new(RecordLayout::new(
            &[Quantity::Wind],
            &BTreeMap::new(),
            mode,
            4,
        ));
        create_output(&output, &layout).unwrap();

        let robot_config = RobotConfig::default();
        let storage = StorageConfig::default();
        let mut sweeper = Sweeper {
            link: &mut link,
            sensors: &mut sensors,
            layout,
            output: output.clone(),
            robot: &robot_config,
            storage: &storage,
        };
        let report = sweeper
            .sweep(SweepRequest {
                field: 3,
                start_pose: Pose([30.0, 10.0, 20.0, 0.0, 60.0, 0.0]),
                ground_level: 100.0,
                sample_count: 4,
            })
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&output).unwrap();
        let lines = contents.lines().map(str::to_string).collect();
        let commands = robot.commands().await;
        let slow = commands.iter().filter(|c| c.starts_with("sgoto,")).count();
        (report, lines, slow)
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_sweep_one_row_per_step() {
        let (report, lines, slow_cartesian) =
            run(AcquisitionMode::Continuous { frequency_hz: 1.0 }).await;
        assert_eq!(slow_cartesian, 8);
        assert_eq!(report.rows_acquired, 8);
        assert_eq!(report.rows_written, 8);
        assert_eq!(lines.len(), 2 + 8);
        assert!(lines[2..].iter().all(|l| l.split(',').nth(2) == Some("3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_point_sweep_samples_after_each_step() {
        let (report, lines, _) = run(AcquisitionMode::Point).await;
        assert_eq!(report.rows_acquired, 8);
        let positions: Vec<f64> = lines[2..]
            .iter()
            .map(|l| l.split(',').nth(1).unwrap().parse().unwrap())
            .collect();
        assert_eq!(
            positions,
            vec![-5.0, -30.0, -55.0, -80.0, -55.0, -30.0, -5.0, 20.0]
        );
    }
}
