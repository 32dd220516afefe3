//! Robot wire-protocol client
//!
//! Commands are `\r`-terminated text lines sent over a single TCP connection. Every
//! motion command blocks the caller until the controller answers `<verb>,done`; lines
//! received in between are either discarded or, for slow moves, handed to a
//! [`TelemetrySink`] before the wait continues.
//!
//! Response lines may arrive split across reads or several to a read. Incoming bytes
//! are kept in a buffer and cut at line terminators, so ordering is preserved and a
//! partial line is never lost between reads.
//!
//! A read timeout is not an error for motion waits: the read is retried indefinitely,
//! which means a controller that never answers stalls the workflow. Any other socket
//! fault is returned as [`DaqError::Link`].

use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use super::{is_position_line, parse_position, Motion};
use crate::core::Pose;
use crate::error::{AppResult, DaqError};

const READ_CHUNK: usize = 255;

/// Receives lines observed while a slow move is in progress.
pub trait TelemetrySink: Send {
    /// Called once when a slow move starts waiting for its acknowledgement.
    fn begin_move(&mut self) {}

    /// Called for every line that is not the acknowledgement.
    fn on_line(&mut self, line: &str);
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl TelemetrySink for Discard {
    fn on_line(&mut self, _line: &str) {}
}

/// Client for the robot controller protocol.
pub struct RobotLink<S = TcpStream> {
    stream: S,
    buffer: BytesMut,
    read_timeout: Duration,
}

impl RobotLink<TcpStream> {
    /// Opens the TCP connection to the controller.
    pub async fn connect(address: &str, read_timeout: Duration) -> AppResult<Self> {
        let stream = tokio::time::timeout(read_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DaqError::Connection(format!("connect to {} timed out", address)))?
            .map_err(|e| DaqError::Connection(format!("connect to {} failed: {}", address, e)))?;
        stream.set_nodelay(true).map_err(DaqError::Link)?;
        info!("Robot link connected to {}", address);
        Ok(Self::from_stream(stream, read_timeout))
    }
}

impl<S> RobotLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already connected stream.
    pub fn from_stream(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4 * READ_CHUNK),
            read_timeout,
        }
    }

    /// Writes one command followed by the `\r` terminator.
    pub async fn send(&mut self, command: &str) -> AppResult<()> {
        let mut framed = String::with_capacity(command.len() + 1);
        framed.push_str(command);
        framed.push('\r');
        self.stream
            .write_all(framed.as_bytes())
            .await
            .map_err(DaqError::Link)?;
        self.stream.flush().await.map_err(DaqError::Link)?;
        debug!("robot <- {}", command);
        Ok(())
    }

    /// Returns the next complete line, or [`DaqError::Timeout`] if none arrived in time.
    pub async fn receive(&mut self) -> AppResult<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = tokio::time::timeout(self.read_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| DaqError::Timeout)?;
            match read {
                Ok(0) => return Err(DaqError::LinkClosed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(DaqError::Timeout)
                }
                Err(e) => return Err(DaqError::Link(e)),
            }
        }
    }

    /// Like [`receive`](Self::receive) but treats timeouts as no-op reads.
    pub async fn next_line(&mut self) -> AppResult<String> {
        loop {
            match self.receive().await {
                Err(DaqError::Timeout) => {
                    trace!("robot read timed out, waiting again");
                }
                other => return other,
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        loop {
            let end = self.buffer.iter().position(|&b| b == b'\r' || b == b'\n')?;
            let raw = self.buffer.split_to(end);
            self.buffer.advance(1);
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                debug!("robot -> {}", line);
                return Some(line);
            }
        }
    }

    async fn execute_motion(
        &mut self,
        motion: Motion,
        pose: &Pose,
        sink: &mut dyn TelemetrySink,
    ) -> AppResult<()> {
        self.send(&format!("{},{}", motion.verb(), pose.to_wire()))
            .await?;
        let done = motion.done_line();
        sink.begin_move();
        loop {
            let line = self.next_line().await?;
            if line == done {
                return Ok(());
            }
            if motion.is_slow() {
                sink.on_line(&line);
            }
        }
    }

    /// `goto`: Cartesian move, intermediate lines discarded.
    pub async fn move_cartesian(&mut self, pose: &Pose) -> AppResult<()> {
        self.execute_motion(Motion::Cartesian, pose, &mut Discard)
            .await
    }

    /// `gotoj`: joint move, intermediate lines discarded.
    pub async fn move_joint(&mut self, pose: &Pose) -> AppResult<()> {
        self.execute_motion(Motion::Joint, pose, &mut Discard).await
    }

    /// `sgoto`: slow Cartesian move, intermediate lines go to `sink`.
    pub async fn move_cartesian_slow(
        &mut self,
        pose: &Pose,
        sink: &mut dyn TelemetrySink,
    ) -> AppResult<()> {
        self.execute_motion(Motion::CartesianSlow, pose, sink)
            .await
    }

    /// `sgotoj`: slow joint move, intermediate lines go to `sink`.
    pub async fn move_joint_slow(
        &mut self,
        pose: &Pose,
        sink: &mut dyn TelemetrySink,
    ) -> AppResult<()> {
        self.execute_motion(Motion::JointSlow, pose, sink).await
    }

    /// Current Cartesian tool position.
    pub async fn query_position(&mut self) -> AppResult<Pose> {
        self.send("get_current_posx").await?;
        loop {
            let line = self.next_line().await?;
            if is_position_line(&line) {
                return parse_position(&line);
            }
        }
    }

    /// Greeting round-trip; any reply within the read timeout counts as success.
    pub async fn greet(&mut self) -> AppResult<String> {
        self.send("Hello").await?;
        match self.receive().await {
            Ok(reply) => Ok(reply),
            Err(DaqError::Timeout) => Err(DaqError::Connection(
                "robot did not answer the greeting".to_string(),
            )),
            Err(DaqError::LinkClosed) => Err(DaqError::Connection(
                "robot closed the connection during the greeting".to_string(),
            )),
            Err(e) => Err(DaqError::Connection(e.to_string())),
        }
    }

    /// Asks the controller to stream position telemetry. Not acknowledged.
    pub async fn start_stream(&mut self) -> AppResult<()> {
        self.send("stream_pos").await
    }

    /// Ends position telemetry. Not acknowledged.
    pub async fn stop_stream(&mut self) -> AppResult<()> {
        self.send("stop_stream").await
    }

    /// Fire-and-forget stop of any motion.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.send("stop").await
    }

    /// Sends `end` and shuts the socket down.
    pub async fn close(mut self) -> AppResult<()> {
        let result = self.send("end").await;
        let _ = self.stream.shutdown().await;
        info!("Robot link closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, DuplexStream};

    struct Collect(Arc<Mutex<Vec<String>>>);

    impl TelemetrySink for Collect {
        fn on_line(&mut self, line: &str) {
            if let Ok(mut lines) = self.0.lock() {
                lines.push(line.to_string());
            }
        }
    }

    fn pair() -> (RobotLink<DuplexStream>, DuplexStream) {
        let (client, server) = duplex(1024);
        (
            RobotLink::from_stream(client, Duration::from_millis(50)),
            server,
        )
    }

    async fn read_command(server: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            server.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\r' {
                return String::from_utf8(out).unwrap();
            }
            out.push(byte[0]);
        }
    }

    #[tokio::test]
    async fn test_lines_split_across_reads_are_reassembled() {
        let (mut link, mut server) = pair();
        server.write_all(b"first\rsec").await.unwrap();
        assert_eq!(link.receive().await.unwrap(), "first");
        server.write_all(b"ond\r\rthird\r").await.unwrap();
        assert_eq!(link.receive().await.unwrap(), "second");
        assert_eq!(link.receive().await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_receive_reports_timeout_and_next_line_retries() {
        let (mut link, mut server) = pair();
        assert!(matches!(link.receive().await, Err(DaqError::Timeout)));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            server.write_all(b"late\r").await.unwrap();
            server
        });
        assert_eq!(link.next_line().await.unwrap(), "late");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_peer_is_a_link_fault() {
        let (mut link, server) = pair();
        drop(server);
        assert!(matches!(
            link.next_line().await,
            Err(DaqError::LinkClosed) | Err(DaqError::Link(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_move_forwards_telemetry_until_done() {
        let (mut link, mut server) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sink = Collect(seen.clone());

        let robot = tokio::spawn(async move {
            let cmd = read_command(&mut server).await;
            server
                .write_all(b"posx,1,2,3,4,5,6,2\rposx,1,2,4,4,5,6,2\rsgoto,done\r")
                .await
                .unwrap();
            (cmd, server)
        });

        let pose = Pose([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        link.move_cartesian_slow(&pose, &mut sink).await.unwrap();
        let (cmd, _server) = robot.await.unwrap();

        assert_eq!(cmd, "sgoto,1,2,3,4,5,6");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_move_runs_on_a_spawned_task() {
        let (mut link, mut server) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sink = Collect(seen.clone());

        // The orchestrator drives motions from a spawned task, so the future must be Send
        let motion = tokio::spawn(async move {
            let pose = Pose([0.0; 6]);
            link.move_joint_slow(&pose, &mut sink).await
        });
        assert_eq!(read_command(&mut server).await, "sgotoj,0,0,0,0,0,0");
        server
            .write_all(b"posx,1,2,3,4,5,6,2\rsgotoj,done\r")
            .await
            .unwrap();
        motion.await.unwrap().unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["posx,1,2,3,4,5,6,2"]);
    }

    #[tokio::test]
    async fn test_fast_move_discards_other_lines() {
        let (mut link, mut server) = pair();
        let robot = tokio::spawn(async move {
            let cmd = read_command(&mut server).await;
            server
                .write_all(b"posx,0,0,1,0,0,0,2\rgotoj,done\r")
                .await
                .unwrap();
            (cmd, server)
        });
        link.move_joint(&Pose([0.0, 0.0, 140.0, 0.0, -50.0, 180.0]))
            .await
            .unwrap();
        let (cmd, _server) = robot.await.unwrap();
        assert_eq!(cmd, "gotoj,0,0,140,0,-50,180");
    }

    #[tokio::test]
    async fn test_query_position_skips_unrelated_lines() {
        let (mut link, mut server) = pair();
        let robot = tokio::spawn(async move {
            let cmd = read_command(&mut server).await;
            server
                .write_all(b"gotoj,done\rposx,10,20,30,0,180,0,2\r")
                .await
                .unwrap();
            (cmd, server)
        });
        let pose = link.query_position().await.unwrap();
        let (cmd, _server) = robot.await.unwrap();
        assert_eq!(cmd, "get_current_posx");
        assert_eq!(pose.vertical(), 30.0);
    }

    #[tokio::test]
    async fn test_greeting_without_reply_is_a_connection_error() {
        let (mut link, _server) = pair();
        assert!(matches!(link.greet().await, Err(DaqError::Connection(_))));
    }

    #[tokio::test]
    async fn test_greeting_and_shutdown_wire_sequence() {
        let stream = tokio_test::io::Builder::new()
            .write(b"Hello\r")
            .read(b"Hello\r")
            .write(b"stop_stream\r")
            .write(b"stop\r")
            .write(b"end\r")
            .build();
        let mut link = RobotLink::from_stream(stream, Duration::from_secs(1));
        assert_eq!(link.greet().await.unwrap(), "Hello");
        link.stop_stream().await.unwrap();
        link.stop().await.unwrap();
        link.close().await.unwrap();
    }
}
