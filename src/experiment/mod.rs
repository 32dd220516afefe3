//! Scan execution
//!
//! - [`sweep`]: the up/down sweep primitive over one field
//! - [`RunPlan`]: termination policy and progress of a recording, either a fixed number
//!   of sweep units or a fixed duration
//!
//! A sweep unit is one call of the sweep primitive. A count-based run has
//! `repetitions × cycles × fields` units; a duration-based run keeps sweeping fields in
//! order until its deadline, one unit per field per pass.

pub mod sweep;

pub use sweep::{SweepReport, SweepRequest, Sweeper};

use tokio::time::Instant;

use crate::messages::RunLimit;

/// Progress and termination bookkeeping of one recording.
#[derive(Clone, Debug)]
pub struct RunPlan {
    limit: RunLimit,
    fields: usize,
    started: Instant,
    completed: usize,
}

impl RunPlan {
    /// Starts the clock for a run over `fields` fields.
    pub fn new(limit: RunLimit, fields: usize) -> Self {
        Self {
            limit,
            fields,
            started: Instant::now(),
            completed: 0,
        }
    }

    /// Replaces the limit; the start time and completed units are kept.
    pub fn adjust(&mut self, limit: RunLimit) {
        self.limit = limit;
    }

    /// Counts one finished sweep unit.
    pub fn record_unit(&mut self) {
        self.completed += 1;
    }

    /// Planned units of a count-based run, `None` for a duration-based run.
    pub fn total_units(&self) -> Option<usize> {
        match self.limit {
            RunLimit::Count {
                repetitions,
                cycles,
            } => Some(repetitions * cycles * self.fields),
            RunLimit::Duration(_) => None,
        }
    }

    /// Sweeps per field in one repetition.
    pub fn cycles(&self) -> usize {
        match self.limit {
            RunLimit::Count { cycles, .. } => cycles,
            RunLimit::Duration(_) => 1,
        }
    }

    /// Whether repetition `index` (0-based) should start.
    pub fn wants_repetition(&self, index: usize) -> bool {
        match self.limit {
            RunLimit::Count { repetitions, .. } => index < repetitions,
            RunLimit::Duration(_) => !self.is_expired(),
        }
    }

    /// Whether the run is over before the next unit starts.
    pub fn is_expired(&self) -> bool {
        match self.limit {
            RunLimit::Count { .. } => self
                .total_units()
                .map_or(true, |total| self.completed >= total),
            RunLimit::Duration(duration) => self.started.elapsed() >= duration,
        }
    }

    /// Completed fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let fraction = match self.limit {
            RunLimit::Count { .. } => match self.total_units() {
                Some(0) | None => 1.0,
                Some(total) => self.completed as f64 / total as f64,
            },
            RunLimit::Duration(duration) if duration.is_zero() => 1.0,
            RunLimit::Duration(duration) => {
                self.started.elapsed().as_secs_f64() / duration.as_secs_f64()
            }
        };
        fraction.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_count_plan_units_and_progress() {
        let mut plan = RunPlan::new(
            RunLimit::Count {
                repetitions: 2,
                cycles: 3,
            },
            2,
        );
        assert_eq!(plan.total_units(), Some(12));
        assert!(plan.wants_repetition(1));
        assert!(!plan.wants_repetition(2));
        for _ in 0..6 {
            plan.record_unit();
        }
        assert_eq!(plan.progress(), 0.5);
        assert!(!plan.is_expired());

        plan.adjust(RunLimit::Count {
            repetitions: 1,
            cycles: 2,
        });
        assert_eq!(plan.total_units(), Some(4));
        assert!(plan.is_expired());
        assert_eq!(plan.progress(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_plan_expires() {
        let plan = RunPlan::new(RunLimit::Duration(Duration::from_secs(5)), 3);
        assert_eq!(plan.total_units(), None);
        assert_eq!(plan.cycles(), 1);
        assert!(plan.wants_repetition(100));

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert!((plan.progress() - 0.5).abs() < 1e-9);

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert!(plan.is_expired());
        assert!(!plan.wants_repetition(0));
        assert_eq!(plan.progress(), 1.0);
    }
}
