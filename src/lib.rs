//! Core library for the sweep_daq application.
//!
//! Drives a robotic arm through vertical sweeps above a set of sampling fields while
//! environmental sensors stream readings, and writes one fused row per position sample
//! to a CSV file. The binary wraps this library with a line-oriented console; tests
//! drive it through [`app_actor::ScanHandle`] against the in-process
//! [`robot::MockRobot`].

pub mod adapters;
pub mod app_actor;
pub mod config;
pub mod console;
pub mod core;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod messages;
pub mod robot;
