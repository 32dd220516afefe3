//! Mock robot controller for testing
//!
//! Listens on a loopback TCP port and answers the wire protocol the way the real
//! controller does: `Hello` is echoed, motion commands are acknowledged with
//! `<verb>,done`, `get_current_posx` replies with the tracked pose, and while streaming
//! is enabled every slow move emits `posx` telemetry with an interpolated vertical
//! coordinate until it completes.
//!
//! Joint and Cartesian targets are tracked in the same pose, which is enough for the
//! workflows to observe consistent positions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Motion;
use crate::core::Pose;
use crate::error::{AppResult, DaqError};

/// Timing and initial state of the mock controller.
#[derive(Clone, Debug)]
pub struct MockRobotConfig {
    /// Wall time of every slow move
    pub slow_move_duration: Duration,
    /// Gap between telemetry lines while streaming
    pub telemetry_interval: Duration,
    /// Wall time of every fast move
    pub fast_move_duration: Duration,
    /// Pose reported before the first move
    pub initial_pose: Pose,
    /// Reported as the last token of every position line
    pub solution_space: u8,
}

impl Default for MockRobotConfig {
    fn default() -> Self {
        Self {
            slow_move_duration: Duration::from_millis(1500),
            telemetry_interval: Duration::from_millis(250),
            fast_move_duration: Duration::ZERO,
            initial_pose: Pose([0.0, 0.0, 140.0, 0.0, -50.0, 180.0]),
            solution_space: 2,
        }
    }
}

#[derive(Debug)]
struct MockState {
    pose: Pose,
    streaming: bool,
    commands: Vec<String>,
    connections: usize,
    finished: usize,
}

/// Handle to a running mock controller. Dropping it stops the server.
pub struct MockRobot {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    task: JoinHandle<()>,
}

impl MockRobot {
    /// Binds `127.0.0.1:0` and starts serving connections one at a time.
    pub async fn start(config: MockRobotConfig) -> AppResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState {
            pose: config.initial_pose,
            streaming: false,
            commands: Vec::new(),
            connections: 0,
            finished: 0,
        }));

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Mock robot accept failed: {}", e);
                        return;
                    }
                };
                info!("Mock robot accepted connection from {}", peer);
                task_state.lock().await.connections += 1;
                if let Err(e) = serve(socket, &config, &task_state).await {
                    debug!("Mock robot session ended: {}", e);
                }
                let mut state = task_state.lock().await;
                state.streaming = false;
                state.finished += 1;
            }
        });

        Ok(Self { addr, state, task })
    }

    /// Listening socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening address as `host:port`.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Every command received so far, without terminators.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    /// Pose after the last completed move.
    pub async fn pose(&self) -> Pose {
        self.state.lock().await.pose
    }

    /// Number of accepted TCP sessions.
    pub async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }

    /// Waits until `sessions` sessions have ended, then returns the command log.
    pub async fn wait_closed(&self, sessions: usize) -> Vec<String> {
        loop {
            {
                let state = self.state.lock().await;
                if state.finished >= sessions {
                    return state.commands.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for MockRobot {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn position_line(pose: &Pose, solution_space: u8) -> String {
    format!("posx,{},{}\r", pose.to_wire(), solution_space)
}

async fn serve(
    socket: TcpStream,
    config: &MockRobotConfig,
    state: &Arc<Mutex<MockState>>,
) -> AppResult<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if reader.read_until(b'\r', &mut raw).await? == 0 {
            return Ok(());
        }
        let command = String::from_utf8_lossy(&raw).trim().to_string();
        if command.is_empty() {
            continue;
        }
        state.lock().await.commands.push(command.clone());

        let (verb, args) = match command.split_once(',') {
            Some((verb, args)) => (verb, Some(args)),
            None => (command.as_str(), None),
        };

        if let Some(motion) = Motion::from_verb(verb) {
            let target = Pose::from_tokens(args.unwrap_or_default().split(','))?;
            if motion.is_slow() {
                slow_move(&mut writer, config, state, target).await?;
            } else {
                if !config.fast_move_duration.is_zero() {
                    tokio::time::sleep(config.fast_move_duration).await;
                }
                state.lock().await.pose = target;
            }
            writer
                .write_all(format!("{}\r", motion.done_line()).as_bytes())
                .await?;
            continue;
        }

        match verb {
            "Hello" => writer.write_all(b"Hello\r").await?,
            "get_current_posx" => {
                let pose = state.lock().await.pose;
                writer
                    .write_all(position_line(&pose, config.solution_space).as_bytes())
                    .await?
            }
            "stream_pos" => state.lock().await.streaming = true,
            "stop_stream" => state.lock().await.streaming = false,
            "stop" => {}
            "end" => return Ok(()),
            other => {
                return Err(DaqError::Protocol(format!(
                    "mock robot got unknown command '{}'",
                    other
                )))
            }
        }
    }
}

async fn slow_move(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    config: &MockRobotConfig,
    state: &Arc<Mutex<MockState>>,
    target: Pose,
) -> AppResult<()> {
    let start = state.lock().await.pose;
    let total = config.slow_move_duration;
    let interval = config.telemetry_interval.max(Duration::from_millis(1));
    let mut elapsed = Duration::ZERO;

    while elapsed + interval < total {
        tokio::time::sleep(interval).await;
        elapsed += interval;
        let fraction = elapsed.as_secs_f64() / total.as_secs_f64();
        let height = start.vertical() + (target.vertical() - start.vertical()) * fraction;
        let (streaming, solution_space) = (state.lock().await.streaming, config.solution_space);
        if streaming {
            let line = position_line(&start.with_vertical(height), solution_space);
            writer.write_all(line.as_bytes()).await?;
        }
    }
    tokio::time::sleep(total.saturating_sub(elapsed)).await;
    state.lock().await.pose = target;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::link::{RobotLink, TelemetrySink};

    #[derive(Default)]
    struct Count(usize);

    impl TelemetrySink for Count {
        fn on_line(&mut self, _line: &str) {
            self.0 += 1;
        }
    }

    #[tokio::test]
    async fn test_mock_answers_protocol() {
        let robot = MockRobot::start(MockRobotConfig {
            slow_move_duration: Duration::from_millis(100),
            telemetry_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut link = RobotLink::connect(&robot.address(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(link.greet().await.unwrap(), "Hello");

        let target = Pose([10.0, 0.0, 50.0, 0.0, 180.0, 0.0]);
        link.move_cartesian(&target).await.unwrap();
        assert_eq!(link.query_position().await.unwrap(), target);

        let mut quiet = Count::default();
        link.move_cartesian_slow(&target.with_vertical(40.0), &mut quiet)
            .await
            .unwrap();
        assert_eq!(quiet.0, 0);

        link.start_stream().await.unwrap();
        let mut streamed = Count::default();
        link.move_cartesian_slow(&target, &mut streamed)
            .await
            .unwrap();
        assert!(streamed.0 >= 3, "got {} telemetry lines", streamed.0);
        link.stop_stream().await.unwrap();
        link.close().await.unwrap();

        let commands = robot.wait_closed(1).await;
        assert_eq!(commands.first().map(String::as_str), Some("Hello"));
        assert_eq!(commands.last().map(String::as_str), Some("end"));
        assert_eq!(robot.connections().await, 1);
    }
}
