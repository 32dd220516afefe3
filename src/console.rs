//! Line-oriented operator console.
//!
//! Each input line is one request. Words are separated by whitespace.
//!
//! ```text
//! connect [host:port]
//! unconnect
//! goto <field> <distance> <angle>
//! find <distance>:<angle> [<distance>:<angle> ...]
//! adjust <height>
//! save <height>
//! start <file> point <samples> count <repetitions> <cycles>
//! start <file> <hz>hz <samples> duration <time>
//! limit count <repetitions> <cycles>
//! limit duration <time>
//! stop
//! close
//! status
//! ```
//!
//! Fields given to `find` are numbered from 1 in the order listed.

use std::path::PathBuf;
use std::str::FromStr;

use crate::config::Settings;
use crate::core::{AcquisitionMode, FieldSpec};
use crate::error::{AppResult, DaqError};
use crate::messages::{ConnectionParams, RunConfig, RunLimit, ScanCommand};

/// What the operator asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    /// Request for the orchestrator.
    Command(ScanCommand),
    /// Print the current status.
    Status,
    /// Print the command list.
    Help,
    /// Blank line.
    Empty,
}

/// Command list shown by `help`.
pub const HELP: &str = "\
commands:
  connect [host:port]
  unconnect
  goto <field> <distance> <angle>
  find <distance>:<angle> [...]
  adjust <height> | save <height>
  start <file> point|<hz>hz <samples> count <reps> <cycles>
  start <file> point|<hz>hz <samples> duration <time>
  limit count <reps> <cycles> | limit duration <time>
  stop | close | status | help";

fn invalid(message: impl Into<String>) -> DaqError {
    DaqError::InvalidCommand(message.into())
}

fn number<T: FromStr>(word: Option<&str>, what: &str) -> AppResult<T> {
    let word = word.ok_or_else(|| invalid(format!("missing {}", what)))?;
    word.parse()
        .map_err(|_| invalid(format!("{} '{}' is not a valid number", what, word)))
}

fn parse_limit<'a>(mut words: impl Iterator<Item = &'a str>) -> AppResult<RunLimit> {
    match words.next() {
        Some("count") => Ok(RunLimit::Count {
            repetitions: number(words.next(), "repetitions")?,
            cycles: number(words.next(), "cycles")?,
        }),
        Some("duration") => {
            let text = words
                .next()
                .ok_or_else(|| invalid("missing duration"))?;
            let duration = humantime_serde::re::humantime::parse_duration(text)
                .map_err(|e| invalid(format!("duration '{}': {}", text, e)))?;
            Ok(RunLimit::Duration(duration))
        }
        Some(other) => Err(invalid(format!(
            "run limit must be 'count' or 'duration', got '{}'",
            other
        ))),
        None => Err(invalid("missing run limit")),
    }
}

fn parse_mode(word: Option<&str>) -> AppResult<AcquisitionMode> {
    match word {
        Some("point") => Ok(AcquisitionMode::Point),
        Some(word) => {
            let hz = word.strip_suffix("hz").unwrap_or(word);
            Ok(AcquisitionMode::Continuous {
                frequency_hz: number(Some(hz), "frequency")?,
            })
        }
        None => Err(invalid("missing acquisition mode")),
    }
}

/// Parses one console line against the loaded settings.
pub fn parse_line(line: &str, settings: &Settings) -> AppResult<ConsoleInput> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(ConsoleInput::Empty);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "help" | "?" => return Ok(ConsoleInput::Help),
        "status" => return Ok(ConsoleInput::Status),
        "connect" => ScanCommand::Connect(ConnectionParams {
            address: words
                .next()
                .map(str::to_string)
                .unwrap_or_else(|| settings.robot.address.clone()),
            quantities: settings.sensors.enabled.clone(),
        }),
        "unconnect" | "disconnect" => ScanCommand::Unconnect,
        "goto" => ScanCommand::GotoField(FieldSpec {
            index: number(words.next(), "field")?,
            target_distance: number(words.next(), "distance")?,
            target_angle: number(words.next(), "angle")?,
        }),
        "find" => {
            let fields = words
                .by_ref()
                .enumerate()
                .map(|(i, word)| -> AppResult<FieldSpec> {
                    let (distance, angle) = word
                        .split_once(':')
                        .ok_or_else(|| invalid(format!("field '{}' is not distance:angle", word)))?;
                    Ok(FieldSpec {
                        index: i + 1,
                        target_distance: number(Some(distance), "distance")?,
                        target_angle: number(Some(angle), "angle")?,
                    })
                })
                .collect::<AppResult<Vec<_>>>()?;
            if fields.is_empty() {
                return Err(invalid("find needs at least one field"));
            }
            ScanCommand::Find(fields)
        }
        "adjust" => ScanCommand::AdjustGround(number(words.next(), "height")?),
        "save" => ScanCommand::SaveGround(number(words.next(), "height")?),
        "start" => {
            let output = PathBuf::from(
                words
                    .next()
                    .ok_or_else(|| invalid("missing output file"))?,
            );
            let mode = parse_mode(words.next())?;
            let sample_count = number(words.next(), "sample count")?;
            let limit = parse_limit(words.by_ref())?;
            ScanCommand::Start(RunConfig {
                output,
                quantities: settings.sensors.enabled.clone(),
                annotations: settings.sensors.annotations.clone(),
                mode,
                sample_count,
                limit,
            })
        }
        "limit" => ScanCommand::AdjustRun(parse_limit(words.by_ref())?),
        "stop" => ScanCommand::Stop,
        "close" | "quit" | "exit" => ScanCommand::Close,
        other => return Err(invalid(format!("unknown command '{}'", other))),
    };

    if let Some(extra) = words.next() {
        return Err(invalid(format!("unexpected argument '{}'", extra)));
    }
    Ok(ConsoleInput::Command(command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Quantity;
    use std::time::Duration;

    fn command(line: &str) -> ScanCommand {
        let mut settings = Settings::default();
        settings.sensors.enabled = vec![Quantity::Wind];
        match parse_line(line, &settings).unwrap() {
            ConsoleInput::Command(command) => command,
            other => panic!("expected a command, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_defaults_to_configured_address() {
        assert_eq!(
            command("connect"),
            ScanCommand::Connect(ConnectionParams {
                address: "127.0.0.1:20002".to_string(),
                quantities: vec![Quantity::Wind],
            })
        );
        assert!(matches!(
            command("connect 10.0.0.2:20002"),
            ScanCommand::Connect(ConnectionParams { ref address, .. }) if address == "10.0.0.2:20002"
        ));
    }

    #[test]
    fn test_find_numbers_fields_in_order() {
        assert_eq!(
            command("find 300:10 450:-20"),
            ScanCommand::Find(vec![
                FieldSpec {
                    index: 1,
                    target_distance: 300.0,
                    target_angle: 10.0
                },
                FieldSpec {
                    index: 2,
                    target_distance: 450.0,
                    target_angle: -20.0
                },
            ])
        );
    }

    #[test]
    fn test_start_and_limit() {
        match command("start run.csv 2hz 10 duration 5min") {
            ScanCommand::Start(run) => {
                assert_eq!(run.mode, AcquisitionMode::Continuous { frequency_hz: 2.0 });
                assert_eq!(run.sample_count, 10);
                assert_eq!(run.limit, RunLimit::Duration(Duration::from_secs(300)));
                assert_eq!(run.quantities, vec![Quantity::Wind]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            command("limit count 3 2"),
            ScanCommand::AdjustRun(RunLimit::Count {
                repetitions: 3,
                cycles: 2
            })
        );
    }

    #[test]
    fn test_rejects_malformed_lines() {
        let settings = Settings::default();
        for line in [
            "goto 1 300",
            "find 300",
            "adjust high",
            "start out.csv point 10",
            "start out.csv point 10 forever",
            "stop now",
            "dance",
        ] {
            assert!(
                matches!(parse_line(line, &settings), Err(DaqError::InvalidCommand(_))),
                "{}",
                line
            );
        }
        assert_eq!(parse_line("   ", &settings).unwrap(), ConsoleInput::Empty);
    }
}
