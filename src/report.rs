//! The result of a simulation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::metrics::{format_number, MetricsSummary};
use crate::ramp::RampHistory;
use crate::threshold::ThresholdResult;
use crate::TrackloadError;

/// Exit code of a run where at least one threshold failed.
pub const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

/// The population at one moment of the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PopulationSample {
    /// Milliseconds since the simulation started.
    pub elapsed_ms: u64,
    /// The population the ramp plan called for.
    pub target: usize,
    /// Users generating traffic.
    pub active: usize,
    /// Retired users completing their last session.
    pub draining: usize,
}

/// Everything known about a finished simulation.
#[derive(Clone, Debug, Serialize)]
pub struct SimulationReport {
    pub started: DateTime<Utc>,
    pub stopped: DateTime<Utc>,
    /// Time from launching the first user until the metrics were sealed.
    pub duration: Duration,
    /// The most users active at once.
    pub max_users: usize,
    /// Whether the simulation was stopped early.
    pub canceled: bool,
    pub metrics: MetricsSummary,
    pub thresholds: Vec<ThresholdResult>,
    pub history: Vec<RampHistory>,
    pub population: Vec<PopulationSample>,
}

impl SimulationReport {
    /// True if every threshold passed, also without thresholds.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|result| result.passed)
    }

    /// The process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            THRESHOLDS_FAILED_EXIT_CODE
        }
    }

    /// Write the report as JSON.
    pub async fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), TrackloadError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            TrackloadError::InvalidOption {
                option: "`configuration.report_file`".to_string(),
                value: path.as_ref().display().to_string(),
                detail: format!("failed to serialize report: {}", e),
            }
        })?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    fn fmt_overview(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            " === OVERVIEW ===\n ------------------------------------------------------------------------------"
        )?;
        for step in &self.history {
            let stage = match step.stage {
                Some(stage) => format!("stage {}", stage),
                None => "-".to_string(),
            };
            writeln!(
                fmt,
                " {:<12} {:<10} {} ({} users)",
                format!("{:?}:", step.action),
                stage,
                step.timestamp.format("%Y-%m-%d %H:%M:%S"),
                format_number(step.users),
            )?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " Ran for {:.1}s with at most {} users{}",
            self.duration.as_secs_f64(),
            format_number(self.max_users),
            if self.canceled { ", canceled" } else { "" }
        )
    }

    fn fmt_thresholds(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.thresholds.is_empty() {
            return Ok(());
        }
        writeln!(
            fmt,
            "\n === THRESHOLDS ===\n ------------------------------------------------------------------------------"
        )?;
        for result in &self.thresholds {
            let observed = match result.observed {
                Some(observed) => format!("{:.3}", observed),
                None => "no data".to_string(),
            };
            writeln!(
                fmt,
                " {} {:<44} {:>16}",
                if result.passed { "PASS" } else { "FAIL" },
                result.rule.to_string(),
                observed,
            )?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {}",
            if self.passed() {
                "All thresholds passed."
            } else {
                "At least one threshold failed."
            }
        )
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_overview(fmt)?;
        write!(fmt, "{}", self.metrics)?;
        self.fmt_thresholds(fmt)
    }
}
