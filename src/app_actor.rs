//! Actor-based scan orchestration
//!
//! The [`ScanOrchestrator`] owns the robot link, the sensor bus, the ground levels and
//! the workflow state. It runs as a single task and is driven only through typed
//! [`ScanCommand`]s arriving on its mailbox; nothing else mutates its state. It publishes
//! [`ScanStatus`] through a `watch` channel (it is the only writer) and pushes
//! [`Notification`]s for terminal and milestone events.
//!
//! Workflows run inline in the actor task. Long workflows read the mailbox at their own
//! check points: ground-finding waits on it for `adjust`/`save`/`stop`, recording drains
//! it between sweep units. A robot call in flight is never interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::core::{
    FieldSpec, GroundLevels, Pose, Quantity, RecordLayout, ScanState, ScanStatus,
};
use crate::data::{create_output, CalibrationTable};
use crate::error::{AppResult, DaqError};
use crate::experiment::{RunPlan, SweepRequest, Sweeper};
use crate::instrument::SensorBus;
use crate::messages::{ConnectionParams, Notification, RunConfig, ScanCommand};
use crate::robot::RobotLink;

const MAILBOX_CAPACITY: usize = 32;

/// Opens the sensor devices for a quantity list at connect time.
pub type SensorOpener = Box<dyn FnMut(&[Quantity]) -> AppResult<SensorBus> + Send>;

/// Control-surface side of a running orchestrator.
pub struct ScanHandle {
    commands: mpsc::Sender<ScanCommand>,
    status: watch::Receiver<ScanStatus>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    task: JoinHandle<AppResult<()>>,
}

impl ScanHandle {
    /// Queues a request; fails once the orchestrator has stopped.
    pub async fn send(&self, command: ScanCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DaqError::InvalidState("orchestrator has stopped".to_string()))
    }

    /// Cloneable command sender, e.g. for a console task.
    pub fn sender(&self) -> mpsc::Sender<ScanCommand> {
        self.commands.clone()
    }

    /// Latest published state and progress.
    pub fn status(&self) -> ScanStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.clone()
    }

    /// Waits for the next notification; `None` after shutdown.
    pub async fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_notification(&mut self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    /// Waits for the orchestrator task to end and returns its result.
    pub async fn join(self) -> AppResult<()> {
        drop(self.commands);
        self.task
            .await
            .map_err(|e| DaqError::InvalidState(format!("orchestrator task failed: {}", e)))?
    }
}

enum Flow {
    Continue,
    Exit,
}

/// How a long workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
}

/// A located field and the approach pose found for it.
#[derive(Debug, Clone, Copy)]
struct LocatedField {
    spec: FieldSpec,
    pose: Pose,
}

/// Actor running the connect, ground-finding and recording workflows.
pub struct ScanOrchestrator {
    settings: Arc<Settings>,
    commands: mpsc::Receiver<ScanCommand>,
    status_tx: watch::Sender<ScanStatus>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    open_sensors: SensorOpener,
    calibration: Option<CalibrationTable>,
    link: Option<RobotLink>,
    sensors: Option<SensorBus>,
    located: Vec<LocatedField>,
    ground: GroundLevels,
    state: ScanState,
    progress: f64,
    close_requested: bool,
}

impl ScanOrchestrator {
    /// Starts an orchestrator that opens real sensor devices.
    pub fn spawn(settings: Settings) -> ScanHandle {
        let line = settings.line_sensor.clone();
        let framed = settings.framed_sensor.clone();
        let opener: SensorOpener =
            Box::new(move |quantities| SensorBus::open(&line, &framed, quantities));
        Self::spawn_with_sensors(settings, opener)
    }

    /// Starts an orchestrator with a custom sensor opener.
    pub fn spawn_with_sensors(settings: Settings, open_sensors: SensorOpener) -> ScanHandle {
        let (command_tx, command_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ScanStatus::default());
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let actor = Self {
            settings: Arc::new(settings),
            commands: command_rx,
            status_tx,
            notify_tx,
            open_sensors,
            calibration: None,
            link: None,
            sensors: None,
            located: Vec::new(),
            ground: GroundLevels::new(),
            state: ScanState::Idle,
            progress: 0.0,
            close_requested: false,
        };
        let task = tokio::spawn(actor.run());

        ScanHandle {
            commands: command_tx,
            status: status_rx,
            notifications: notify_rx,
            task,
        }
    }

    /// Runs the actor event loop, processing commands until shutdown.
    pub async fn run(mut self) -> AppResult<()> {
        info!("ScanOrchestrator started");
        let tick = self.settings.application.tick;

        loop {
            let command = match tokio::time::timeout(tick, self.commands.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => {
                    info!("All command senders dropped, closing");
                    self.close_sequence().await;
                    break;
                }
                Err(_) => {
                    self.publish();
                    continue;
                }
            };

            debug!("Processing '{}' in state {}", command.name(), self.state);
            match self.dispatch(command).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(e) => {
                    error!("Fatal error, shutting down: {}", e);
                    self.notify(Notification::WorkflowError(e.to_string()));
                    self.close_sequence().await;
                    return Err(e);
                }
            }

            if self.close_requested {
                self.close_sequence().await;
                break;
            }
        }

        info!("ScanOrchestrator shutting down");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Status and notifications
    // ---------------------------------------------------------------------

    fn set_state(&mut self, state: ScanState) {
        if self.state != state {
            info!("State {} -> {}", self.state, state);
        }
        self.state = state;
        self.publish();
    }

    fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 1.0);
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(ScanStatus {
            state: self.state,
            progress: self.progress,
        });
    }

    fn notify(&self, notification: Notification) {
        if self.notify_tx.send(notification).is_err() {
            debug!("No control surface listening for notifications");
        }
    }

    fn reject(&self, command: &'static str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Rejected '{}' in state {}: {}", command, self.state, reason);
        self.notify(Notification::Rejected { command, reason });
    }

    fn is_process_fatal(&self, error: &DaqError) -> bool {
        self.settings.calibration.fatal_on_miss && error.is_calibration_fault()
    }

    /// Moves to the cancel state matching the current one.
    fn enter_cancel(&mut self) {
        if let Some(cancel) = self.state.cancel_state() {
            self.set_state(cancel);
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    async fn dispatch(&mut self, command: ScanCommand) -> AppResult<Flow> {
        let result = match command {
            ScanCommand::Connect(params) => {
                self.connect(params).await;
                Ok(())
            }
            ScanCommand::Unconnect => {
                self.unconnect().await;
                Ok(())
            }
            ScanCommand::GotoField(field) => self.goto_field(field).await,
            ScanCommand::Find(fields) => self.find(fields).await,
            ScanCommand::Start(run) => self.start(run).await,
            ScanCommand::Stop => {
                self.enter_cancel();
                self.notify(Notification::WorkflowEnded);
                self.set_state(ScanState::Idle);
                Ok(())
            }
            ScanCommand::Close => {
                self.close_sequence().await;
                return Ok(Flow::Exit);
            }
            other @ (ScanCommand::AdjustGround(_) | ScanCommand::SaveGround(_)) => {
                self.reject(other.name(), "no ground-finding in progress");
                Ok(())
            }
            ScanCommand::AdjustRun(_) => {
                self.reject(command.name(), "no recording in progress");
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if self.is_process_fatal(&e) => Err(e),
            Err(e) => {
                self.abort_workflow(e).await;
                Ok(Flow::Continue)
            }
        }
    }

    async fn abort_workflow(&mut self, error: DaqError) {
        if error.is_workflow_fatal() {
            error!("Workflow aborted: {}", error);
        } else {
            warn!("Workflow aborted: {}", error);
        }
        if error.is_link_fault() {
            if let Some(link) = self.link.take() {
                let _ = link.close().await;
            }
            self.sensors = None;
        }
        self.notify(Notification::WorkflowError(error.to_string()));
        self.set_state(ScanState::Idle);
    }

    fn require_link(&self, command: &'static str) -> bool {
        if self.link.is_none() {
            self.reject(command, "robot is not connected");
            return false;
        }
        true
    }

    fn link(&mut self) -> AppResult<&mut RobotLink> {
        self.link
            .as_mut()
            .ok_or_else(|| DaqError::InvalidState("robot is not connected".to_string()))
    }

    fn lookup_pose(&mut self, field: &FieldSpec) -> AppResult<Pose> {
        if self.calibration.is_none() {
            self.calibration = Some(CalibrationTable::load(&self.settings.calibration)?);
        }
        let table = self
            .calibration
            .as_ref()
            .ok_or_else(|| DaqError::Calibration("calibration table not loaded".to_string()))?;
        Ok(table
            .find_start_pose(field.target_distance)?
            .with_base_angle(field.target_angle))
    }

    // ---------------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------------

    async fn connect(&mut self, params: ConnectionParams) {
        if self.link.is_some() {
            self.reject("connect", "already connected");
            return;
        }
        self.set_state(ScanState::Connecting);

        match self.open_resources(&params).await {
            Ok((link, sensors)) => {
                self.link = Some(link);
                self.sensors = Some(sensors);
                info!("Connected to robot at {}", params.address);
                self.set_state(ScanState::Connected);
                self.notify(Notification::Connected);
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                self.notify(Notification::ConnectionError(e.to_string()));
                self.set_state(ScanState::Idle);
            }
        }
    }

    /// Opens the link and the sensors; whatever was opened is released on failure.
    async fn open_resources(
        &mut self,
        params: &ConnectionParams,
    ) -> AppResult<(RobotLink, SensorBus)> {
        let mut link =
            RobotLink::connect(&params.address, self.settings.robot.read_timeout).await?;
        if let Err(e) = link.greet().await {
            let _ = link.close().await;
            return Err(e);
        }
        match (self.open_sensors)(&params.quantities) {
            Ok(sensors) => Ok((link, sensors)),
            Err(e) => {
                let _ = link.close().await;
                Err(DaqError::Connection(format!("sensor setup failed: {}", e)))
            }
        }
    }

    async fn unconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.stop().await {
                warn!("Stop before disconnect failed: {}", e);
            }
            tokio::time::sleep(self.settings.robot.stop_grace).await;
            if let Err(e) = link.close().await {
                warn!("Closing robot link failed: {}", e);
            }
        }
        self.sensors = None;
        self.set_state(ScanState::Idle);
    }

    async fn close_sequence(&mut self) {
        self.set_state(ScanState::ShuttingDown);
        let grace = self.settings.robot.stop_grace;
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.stop_stream().await {
                warn!("stop_stream during close failed: {}", e);
            }
            tokio::time::sleep(grace).await;
            if let Err(e) = link.stop().await {
                warn!("stop during close failed: {}", e);
            }
            tokio::time::sleep(grace).await;
            if let Err(e) = link.close().await {
                warn!("Closing robot link failed: {}", e);
            }
        }
        self.sensors = None;
        info!("Close sequence complete");
    }

    // ---------------------------------------------------------------------
    // Positioning
    // ---------------------------------------------------------------------

    async fn goto_field(&mut self, field: FieldSpec) -> AppResult<()> {
        if !self.require_link("goto-field") {
            return Ok(());
        }
        self.set_state(ScanState::Positioning);
        let pose = self.lookup_pose(&field)?;
        info!("Moving to field {} approach pose {}", field.index, pose);
        self.link()?.move_joint(&pose).await?;
        self.set_state(ScanState::Idle);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Ground-finding
    // ---------------------------------------------------------------------

    async fn find(&mut self, fields: Vec<FieldSpec>) -> AppResult<()> {
        if !self.require_link("find") {
            return Ok(());
        }
        if fields.is_empty() {
            self.reject("find", "no fields given");
            return Ok(());
        }
        self.ground.clear();
        self.located.clear();
        self.set_state(ScanState::GroundSeek);

        let seek = self.seek_fields(&fields).await;
        let home = self.settings.robot.home_pose;
        let homed = match self.link.as_mut() {
            Some(link) if !matches!(&seek, Err(e) if e.is_link_fault()) => {
                link.move_joint(&home).await
            }
            _ => Ok(()),
        };

        match seek? {
            Outcome::Completed => {
                homed?;
                self.set_state(ScanState::GroundDone);
                self.notify(Notification::GroundDone);
            }
            Outcome::Cancelled => {
                homed?;
                self.notify(Notification::WorkflowEnded);
                self.set_state(ScanState::Idle);
            }
        }
        Ok(())
    }

    async fn seek_fields(&mut self, fields: &[FieldSpec]) -> AppResult<Outcome> {
        let home = self.settings.robot.home_pose;
        self.link()?.move_joint(&home).await?;

        for field in fields {
            let pose = self.lookup_pose(field)?;
            self.link()?.move_joint(&pose).await?;
            let initial = self.link()?.query_position().await?;
            self.located.push(LocatedField { spec: *field, pose });
            self.set_state(ScanState::GroundSeek);
            info!(
                "Field {} located, tool at height {}; waiting for ground",
                field.index,
                initial.vertical()
            );

            loop {
                let Some(command) = self.commands.recv().await else {
                    self.close_requested = true;
                    self.enter_cancel();
                    return Ok(Outcome::Cancelled);
                };
                match command {
                    ScanCommand::AdjustGround(height) => {
                        self.set_state(ScanState::GroundAdjust);
                        let link = self.link()?;
                        let current = link.query_position().await?;
                        link.move_cartesian(&current.with_vertical(height)).await?;
                        self.set_state(ScanState::GroundSeek);
                    }
                    ScanCommand::SaveGround(height) => {
                        let level = self.ground.save(field.index, initial.vertical(), height);
                        self.link()?.move_cartesian(&initial).await?;
                        info!("Field {} ground level {}", field.index, level);
                        self.set_state(ScanState::GroundSaved);
                        self.notify(Notification::GroundLevelSaved {
                            field: field.index,
                            level,
                        });
                        break;
                    }
                    ScanCommand::Stop => {
                        self.enter_cancel();
                        return Ok(Outcome::Cancelled);
                    }
                    ScanCommand::Close => {
                        self.close_requested = true;
                        self.enter_cancel();
                        return Ok(Outcome::Cancelled);
                    }
                    other => self.reject(other.name(), "ground-finding in progress"),
                }
            }
        }
        Ok(Outcome::Completed)
    }

    // ---------------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------------

    fn validate_run(&self, run: &RunConfig) -> AppResult<Vec<(LocatedField, f64)>> {
        if run.sample_count == 0 {
            return Err(DaqError::InvalidState(
                "sample count must be at least 1".to_string(),
            ));
        }
        run.mode.sample_period()?;
        if self.located.is_empty() {
            return Err(DaqError::InvalidState(
                "no fields located; run find first".to_string(),
            ));
        }
        self.located
            .iter()
            .map(|field| Ok((*field, self.ground.get(field.spec.index)?)))
            .collect()
    }

    async fn start(&mut self, run: RunConfig) -> AppResult<()> {
        if !self.require_link("start") {
            return Ok(());
        }
        let fields = match self.validate_run(&run) {
            Ok(fields) => fields,
            Err(e) => {
                self.reject("start", e.to_string());
                return Ok(());
            }
        };

        self.set_state(ScanState::Scanning);
        let layout = Arc::new(RecordLayout::new(
            &run.quantities,
            &run.annotations,
            run.mode,
            run.sample_count,
        ));
        if let Err(e) = create_output(&run.output, &layout) {
            warn!("{}", e);
            self.notify(Notification::FileOpenError(run.output.clone()));
            self.set_state(ScanState::Idle);
            return Ok(());
        }

        self.set_progress(0.0);
        self.set_state(ScanState::Recording);
        let recorded = self.record(&run, layout, &fields).await;

        let home = self.settings.robot.home_pose;
        let homed = match (&recorded, self.link.as_mut()) {
            (Err(e), _) if e.is_link_fault() => Ok(()),
            (_, None) => Ok(()),
            (_, Some(link)) => link.move_joint(&home).await,
        };
        let outcome = recorded?;
        homed?;

        info!("Recording finished ({:?}), data in '{}'", outcome, run.output.display());
        self.notify(Notification::ScanComplete(absolute(&run.output)));
        if outcome == Outcome::Cancelled {
            self.notify(Notification::WorkflowEnded);
        }
        self.set_state(ScanState::Idle);
        Ok(())
    }

    async fn record(
        &mut self,
        run: &RunConfig,
        layout: Arc<RecordLayout>,
        fields: &[(LocatedField, f64)],
    ) -> AppResult<Outcome> {
        let mut plan = RunPlan::new(run.limit, fields.len());
        let settings = self.settings.clone();
        let mut repetition = 0;

        while plan.wants_repetition(repetition) {
            for (field, ground_level) in fields {
                let mut cycle = 0;
                while cycle < plan.cycles() {
                    if self.check_point(&mut plan) == Outcome::Cancelled {
                        return Ok(Outcome::Cancelled);
                    }
                    if plan.is_expired() {
                        return Ok(Outcome::Completed);
                    }

                    let link = self
                        .link
                        .as_mut()
                        .ok_or_else(|| DaqError::InvalidState("robot is not connected".to_string()))?;
                    let sensors = self.sensors.get_or_insert_with(|| {
                        SensorBus::empty(
                            settings.line_sensor.clone(),
                            settings.framed_sensor.clone(),
                        )
                    });
                    let mut sweeper = Sweeper {
                        link,
                        sensors,
                        layout: layout.clone(),
                        output: run.output.clone(),
                        robot: &settings.robot,
                        storage: &settings.storage,
                    };
                    let report = sweeper
                        .sweep(SweepRequest {
                            field: field.spec.index,
                            start_pose: field.pose,
                            ground_level: *ground_level,
                            sample_count: run.sample_count,
                        })
                        .await?;
                    if report.rows_dropped > 0 {
                        warn!(
                            "Field {}: {} rows lost to failed flushes",
                            field.spec.index, report.rows_dropped
                        );
                    }

                    plan.record_unit();
                    self.set_progress(plan.progress());
                    cycle += 1;
                }
            }
            repetition += 1;
        }
        Ok(Outcome::Completed)
    }

    /// Drains the mailbox between sweep units.
    fn check_point(&mut self, plan: &mut RunPlan) -> Outcome {
        let mut outcome = Outcome::Completed;
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.close_requested = true;
                    outcome = Outcome::Cancelled;
                    break;
                }
            };
            match command {
                ScanCommand::Stop => {
                    info!("Stop requested, finishing after the current sweep");
                    outcome = Outcome::Cancelled;
                }
                ScanCommand::Close => {
                    self.close_requested = true;
                    outcome = Outcome::Cancelled;
                }
                ScanCommand::AdjustRun(limit) => {
                    info!("Run limit changed to {:?}", limit);
                    plan.adjust(limit);
                    self.set_progress(plan.progress());
                }
                other => self.reject(other.name(), "recording in progress"),
            }
        }
        if outcome == Outcome::Cancelled {
            self.enter_cancel();
        }
        outcome
    }
}

fn absolute(path: &std::path::Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AcquisitionMode;
    use crate::messages::RunLimit;
    use crate::robot::{MockRobot, MockRobotConfig};
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        robot: MockRobot,
        handle: ScanHandle,
        dir: TempDir,
    }

    async fn fixture(fatal_on_miss: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("max_positions.csv");
        let mut file = std::fs::File::create(&table).unwrap();
        writeln!(file, "J1,J2,J3,J4,J5,J6,TY").unwrap();
        writeln!(file, "0,10,200,0,60,0,300").unwrap();

        let robot = MockRobot::start(MockRobotConfig {
            slow_move_duration: Duration::from_millis(100),
            telemetry_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut settings = Settings::default();
        settings.robot.address = robot.address();
        settings.robot.stream_settle = Duration::from_millis(10);
        settings.calibration.path = table;
        settings.calibration.fatal_on_miss = fatal_on_miss;
        settings.application.tick = Duration::from_millis(50);

        let handle = ScanOrchestrator::spawn_with_sensors(
            settings,
            Box::new(|_: &[Quantity]| {
                Ok(SensorBus::empty(Default::default(), Default::default()))
            }),
        );
        Fixture { robot, handle, dir }
    }

    async fn connect(fx: &mut Fixture) {
        fx.handle
            .send(ScanCommand::Connect(ConnectionParams {
                address: fx.robot.address(),
                quantities: vec![],
            }))
            .await
            .unwrap();
        assert_eq!(
            fx.handle.next_notification().await,
            Some(Notification::Connected)
        );
    }

    fn field(distance: f64) -> FieldSpec {
        FieldSpec {
            index: 1,
            target_distance: distance,
            target_angle: 15.0,
        }
    }

    #[tokio::test]
    async fn test_goto_field_substitutes_angle() {
        let mut fx = fixture(true).await;
        connect(&mut fx).await;
        fx.handle
            .send(ScanCommand::GotoField(field(310.0)))
            .await
            .unwrap();
        fx.handle.send(ScanCommand::Close).await.unwrap();
        fx.handle.join().await.unwrap();

        let commands = fx.robot.wait_closed(1).await;
        assert!(commands.contains(&"gotoj,15,10,200,0,60,0".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some("end"));
    }

    #[tokio::test]
    async fn test_find_saves_ground_and_returns_home() {
        let mut fx = fixture(true).await;
        connect(&mut fx).await;
        fx.handle
            .send(ScanCommand::Find(vec![field(300.0)]))
            .await
            .unwrap();
        fx.handle
            .send(ScanCommand::AdjustGround(120.0))
            .await
            .unwrap();
        fx.handle.send(ScanCommand::SaveGround(120.0)).await.unwrap();

        assert_eq!(
            fx.handle.next_notification().await,
            Some(Notification::GroundLevelSaved {
                field: 1,
                level: 80.0
            })
        );
        assert_eq!(
            fx.handle.next_notification().await,
            Some(Notification::GroundDone)
        );
        assert_eq!(fx.handle.status().state, ScanState::GroundDone);

        let commands = fx.robot.commands().await;
        assert_eq!(
            commands.last().map(String::as_str),
            Some("gotoj,0,0,140,0,-50,180")
        );
        assert!(commands.contains(&"goto,15,10,120,0,60,0".to_string()));
        fx.handle.send(ScanCommand::Close).await.unwrap();
        fx.handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_ground_is_rejected() {
        let mut fx = fixture(true).await;
        connect(&mut fx).await;
        fx.handle
            .send(ScanCommand::Start(RunConfig {
                output: fx.dir.path().join("out.csv"),
                quantities: vec![],
                annotations: BTreeMap::new(),
                mode: AcquisitionMode::Point,
                sample_count: 2,
                limit: RunLimit::Count {
                    repetitions: 1,
                    cycles: 1,
                },
            }))
            .await
            .unwrap();
        assert!(matches!(
            fx.handle.next_notification().await,
            Some(Notification::Rejected {
                command: "start",
                ..
            })
        ));
        assert!(!fx.dir.path().join("out.csv").exists());
        fx.handle.send(ScanCommand::Close).await.unwrap();
        fx.handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_calibration_miss_is_process_fatal_by_default() {
        let mut fx = fixture(true).await;
        connect(&mut fx).await;
        fx.handle
            .send(ScanCommand::GotoField(field(5000.0)))
            .await
            .unwrap();
        assert!(matches!(
            fx.handle.next_notification().await,
            Some(Notification::WorkflowError(_))
        ));
        assert!(matches!(
            fx.handle.join().await,
            Err(DaqError::CalibrationLookup { .. })
        ));
    }

    #[tokio::test]
    async fn test_calibration_miss_can_abort_only_the_workflow() {
        let mut fx = fixture(false).await;
        connect(&mut fx).await;
        fx.handle
            .send(ScanCommand::GotoField(field(5000.0)))
            .await
            .unwrap();
        assert!(matches!(
            fx.handle.next_notification().await,
            Some(Notification::WorkflowError(_))
        ));
        assert_eq!(fx.handle.status().state, ScanState::Idle);
        fx.handle.send(ScanCommand::Close).await.unwrap();
        fx.handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_needing_a_link_are_rejected_when_disconnected() {
        let mut fx = fixture(true).await;
        fx.handle
            .send(ScanCommand::GotoField(field(300.0)))
            .await
            .unwrap();
        assert!(matches!(
            fx.handle.next_notification().await,
            Some(Notification::Rejected {
                command: "goto-field",
                ..
            })
        ));
        fx.handle.send(ScanCommand::SaveGround(1.0)).await.unwrap();
        assert!(matches!(
            fx.handle.next_notification().await,
            Some(Notification::Rejected { .. })
        ));
        fx.handle.send(ScanCommand::Close).await.unwrap();
        fx.handle.join().await.unwrap();
    }
}
