//! Ramp plan structures and functions.
//!
//! A simulation's user population is described by a [`RampPlan`]: an ordered series of
//! [`Stage`]s, each linearly moving the number of active virtual users from where the
//! previous stage ended to a new target over a duration. The population starts at 0.
//!
//! For example, `--stages "2m,200;5m,200;1m,0"` launches 200 users over 2 minutes,
//! holds 200 users for 5 minutes, then retires all users over 1 minute.

use chrono::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::util;
use crate::TrackloadError;

/// How long retired users may keep running to complete their current session, if not
/// otherwise configured.
pub const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);

/// One stage of a ramp plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// How long the stage takes to reach its target.
    pub duration: Duration,
    /// The number of active users at the end of the stage.
    pub target: usize,
}
impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Stage { duration, target }
    }
}

/// An ordered series of stages, plus the time retired users get to finish their session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RampPlan {
    pub stages: Vec<Stage>,
    pub graceful_ramp_down: Duration,
}

impl RampPlan {
    /// Build a ramp plan with the default graceful ramp-down, rejecting invalid plans.
    ///
    /// # Example
    /// ```rust
    /// use std::time::Duration;
    /// use trackload::ramp::{RampPlan, Stage};
    ///
    /// let plan = RampPlan::new(vec![
    ///     Stage::new(Duration::from_secs(10), 100),
    ///     Stage::new(Duration::from_secs(10), 0),
    /// ])
    /// .unwrap();
    ///
    /// // Halfway through the first stage, half the users are running.
    /// assert_eq!(plan.target_at(Duration::from_secs(5)), 50.0);
    /// assert_eq!(plan.total_duration(), Duration::from_secs(20));
    /// ```
    pub fn new(stages: Vec<Stage>) -> Result<Self, TrackloadError> {
        let plan = RampPlan {
            stages,
            graceful_ramp_down: DEFAULT_GRACEFUL_RAMP_DOWN,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Replace the graceful ramp-down window.
    pub fn with_graceful_ramp_down(mut self, graceful_ramp_down: Duration) -> Self {
        self.graceful_ramp_down = graceful_ramp_down;
        self
    }

    /// A plan needs at least one stage, and every stage must take time.
    pub fn validate(&self) -> Result<(), TrackloadError> {
        if self.stages.is_empty() {
            return Err(TrackloadError::NoStages {
                detail: "The ramp plan must contain at least one stage.".to_string(),
            });
        }
        if let Some((index, _)) = self
            .stages
            .iter()
            .enumerate()
            .find(|(_, stage)| stage.duration.is_zero())
        {
            return Err(TrackloadError::InvalidOption {
                option: "`configuration.stages`".to_string(),
                value: self.to_string(),
                detail: format!("stage {} has a duration of 0, stages must take time.", index + 1),
            });
        }
        Ok(())
    }

    /// The time from the start of the simulation to the end of the last stage.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// The highest population any stage targets.
    pub fn max_target(&self) -> usize {
        self.stages
            .iter()
            .map(|stage| stage.target)
            .max()
            .unwrap_or(0)
    }

    /// The index of the stage running at `elapsed`, or `None` once all stages ended.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration;
            if elapsed < stage_end {
                return Some(index);
            }
        }
        None
    }

    /// The population at the start of the stage at `index`.
    pub fn starting_population(&self, index: usize) -> usize {
        match index {
            0 => 0,
            _ => self.stages[index - 1].target,
        }
    }

    /// The exact (fractional) population the plan calls for at `elapsed`.
    ///
    /// Within a stage the population moves linearly from the previous stage's target to
    /// this stage's target. After the last stage the last target is held.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut stage_start = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let from = self.starting_population(index) as f64;
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                return from + (stage.target as f64 - from) * progress;
            }
            stage_start = stage_end;
        }
        self.stages.last().map_or(0.0, |stage| stage.target as f64)
    }

    /// How the population changes during the stage at `index`.
    pub fn stage_action(&self, index: usize) -> RampStepAction {
        match self
            .starting_population(index)
            .cmp(&self.stages[index].target)
        {
            Ordering::Less => RampStepAction::Increasing,
            Ordering::Greater => RampStepAction::Decreasing,
            Ordering::Equal => RampStepAction::Maintaining,
        }
    }
}

impl fmt::Display for RampPlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|stage| format!("{}ms,{}", stage.duration.as_millis(), stage.target))
            .collect();
        write!(f, "{}", stages.join(";"))
    }
}

/// Implement [`FromStr`] to convert `"{duration},{target};..."` formatted ramp plans.
///
/// The target is an integer number of users. The duration can be an integer, indicating
/// seconds, or use integers together with one or more of "h", "m", "s" and "ms", in that
/// order. Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 500ms, etc.
///
/// Parsing only checks the format, [`RampPlan::validate`] checks the stages.
impl FromStr for RampPlan {
    type Err = TrackloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let re = Regex::new(r"^\s*(\w+)\s*,\s*(\d+)\s*$").map_err(|e| {
            TrackloadError::InvalidOption {
                option: "`configuration.stages`".to_string(),
                value: s.to_string(),
                detail: e.to_string(),
            }
        })?;

        let mut stages = Vec::new();
        // Stages are separated by semicolons, a trailing semicolon is allowed.
        for line in s.split(';').filter(|line| !line.trim().is_empty()) {
            let stage = re.captures(line).and_then(|cap| {
                let duration = util::parse_timespan(&cap[1])?;
                let target = cap[2].parse::<usize>().ok()?;
                Some(Stage::new(duration, target))
            });
            match stage {
                Some(stage) => stages.push(stage),
                None => {
                    // Logger isn't initialized yet, provide helpful debug output.
                    eprintln!("ERROR: invalid `configuration.stages` value: '{}'", line);
                    eprintln!("  Expected format: --stages \"{{duration}},{{target}};{{duration}},{{target}}\"");
                    eprintln!("    {{duration}} can be integer seconds or \"30s\", \"20m\", \"3h\", \"1h30m\", \"500ms\", etc");
                    eprintln!("    {{target}} must be an integer, ie \"100\"");
                    return Err(TrackloadError::InvalidOption {
                        option: "`configuration.stages`".to_string(),
                        value: line.to_string(),
                        detail: "invalid `configuration.stages` value.".to_string(),
                    });
                }
            }
        }

        Ok(RampPlan {
            stages,
            graceful_ramp_down: DEFAULT_GRACEFUL_RAMP_DOWN,
        })
    }
}

/// What the population is doing during a step of the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RampStepAction {
    /// A stage that is increasing the number of virtual users.
    Increasing,
    /// A stage that holds the number of virtual users.
    Maintaining,
    /// A stage that is decreasing the number of virtual users.
    Decreasing,
    /// All stages ended, remaining users are completing their sessions.
    Draining,
    /// The simulation was canceled, all users are told to exit.
    Canceling,
    /// The final step indicating that the simulation is finished.
    Finished,
}

/// A historical record of a single step of the simulation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RampHistory {
    /// What happened in this step.
    pub action: RampStepAction,
    /// When the step started.
    pub timestamp: DateTime<Utc>,
    /// The number of active users when the step started.
    pub users: usize,
    /// The stage (starting at 1) this step belongs to, if any.
    pub stage: Option<usize>,
}
impl RampHistory {
    /// A helper to record a new step in the historical record.
    pub(crate) fn step(action: RampStepAction, users: usize, stage: Option<usize>) -> RampHistory {
        RampHistory {
            action,
            timestamp: Utc::now(),
            users,
            stage,
        }
    }
}
