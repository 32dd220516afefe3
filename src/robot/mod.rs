//! Robot controller access
//!
//! - [`link`]: line-oriented TCP protocol client with blocking motion primitives
//! - [`mock`]: in-process controller speaking the same protocol, for tests and dry runs

pub mod link;
pub mod mock;

pub use link::{Discard, RobotLink, TelemetrySink};
pub use mock::{MockRobot, MockRobotConfig};

/// Tag present in every position line, both query replies and streamed telemetry.
pub const POSITION_TAG: &str = "posx";

/// Motion verbs understood by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Motion {
    /// `goto`: Cartesian move
    Cartesian,
    /// `gotoj`: joint move
    Joint,
    /// `sgoto`: slow Cartesian move, telemetry forwarded while waiting
    CartesianSlow,
    /// `sgotoj`: slow joint move, telemetry forwarded while waiting
    JointSlow,
}

impl Motion {
    /// Command word on the wire.
    pub fn verb(self) -> &'static str {
        match self {
            Motion::Cartesian => "goto",
            Motion::Joint => "gotoj",
            Motion::CartesianSlow => "sgoto",
            Motion::JointSlow => "sgotoj",
        }
    }

    /// Inverse of [`Motion::verb`].
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "goto" => Some(Motion::Cartesian),
            "gotoj" => Some(Motion::Joint),
            "sgoto" => Some(Motion::CartesianSlow),
            "sgotoj" => Some(Motion::JointSlow),
            _ => None,
        }
    }

    /// Slow moves forward telemetry while waiting.
    pub fn is_slow(self) -> bool {
        matches!(self, Motion::CartesianSlow | Motion::JointSlow)
    }

    /// Acknowledgement line that ends the wait, e.g. `sgoto,done`.
    pub fn done_line(self) -> String {
        format!("{},done", self.verb())
    }
}

/// Parses `posx,<x>,<y>,<z>,<rx>,<ry>,<rz>,<solution space>` into a pose.
///
/// The trailing solution-space indicator is discarded.
pub fn parse_position(line: &str) -> crate::error::AppResult<crate::core::Pose> {
    let tokens: Vec<&str> = line.trim().split(',').collect();
    let start = tokens
        .iter()
        .position(|t| t.trim() == POSITION_TAG)
        .ok_or_else(|| {
            crate::error::DaqError::Protocol(format!("no '{}' tag in '{}'", POSITION_TAG, line))
        })?;
    let values = &tokens[start + 1..];
    if values.len() < 7 {
        return Err(crate::error::DaqError::Protocol(format!(
            "position line '{}' has {} fields, expected 7",
            line,
            values.len()
        )));
    }
    crate::core::Pose::from_tokens(values[..6].iter().copied())
}

/// Whether `line` carries position data.
pub fn is_position_line(line: &str) -> bool {
    line.contains(POSITION_TAG)
}
