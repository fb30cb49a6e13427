//! Collecting the outcome of every tracking request.
//!
//! All virtual users share one [`MetricsAggregator`]. Each sample is applied under a
//! single short lock that is never held across an `.await`, so samples are never lost
//! and a [`MetricsSummary`] snapshot only ever contains whole samples.
//!
//! The aggregator collects these metrics:
//!
//! | Metric | Kind | Description |
//! |---|---|---|
//! | `http_reqs` | counter | tracking requests sent |
//! | `http_req_failed` | rate | requests without a 2xx response |
//! | `http_req_duration` | trend | request latency in milliseconds |
//! | `successful_tracking_requests` | counter | requests that passed the tracking check |
//! | `failed_tracking_requests` | counter | requests that failed the tracking check |
//! | `tracking_request_error_rate` | rate | requests that failed the tracking check |
//! | `session_depth_page_views` | trend | page views per completed session |
//! | `sessions` | counter | completed sessions |
//!
//! Trends are stored in a bounded histogram: values below 100 are exact, values below
//! 500 are rounded to the nearest 10, values below 1,000 to the nearest 100, and larger
//! values to the nearest 1,000.

use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A distribution of values, such as response times.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    /// Rounded value, and how many times it was seen.
    pub histogram: BTreeMap<usize, usize>,
    pub min: usize,
    pub max: usize,
    /// Sum of all unrounded values.
    pub total: usize,
    pub count: usize,
}
impl Trend {
    pub fn new() -> Self {
        Trend::default()
    }

    pub fn record(&mut self, value: usize) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.total += value;
        self.count += 1;

        let rounded = match value {
            // No rounding below 100.
            0..=99 => value,
            // Nearest 10 below 500.
            100..=499 => ((value as f64 / 10.0).round() * 10.0) as usize,
            // Nearest 100 below 1,000.
            500..=999 => ((value as f64 / 100.0).round() * 100.0) as usize,
            // Nearest 1,000 above.
            _ => ((value as f64 / 1_000.0).round() * 1_000.0) as usize,
        };
        *self.histogram.entry(rounded).or_insert(0) += 1;
    }

    /// The mean of all unrounded values, 0 if nothing was recorded.
    pub fn average(&self) -> f64 {
        match self.count {
            0 => 0.0,
            _ => self.total as f64 / self.count as f64,
        }
    }

    /// The value that `percent` (0.0 to 1.0) of all samples are less than or equal to.
    ///
    /// Computed from the rounded histogram, clamped to the real minimum and maximum.
    pub fn percentile(&self, percent: f64) -> usize {
        let percentile_sample = (self.count as f64 * percent).round() as usize;
        let mut seen: usize = 0;
        for (value, counter) in &self.histogram {
            seen += counter;
            if seen >= percentile_sample {
                return (*value).clamp(self.min, self.max);
            }
        }
        0
    }

    pub fn median(&self) -> usize {
        self.percentile(0.5)
    }
}

/// How often something was true.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    /// Samples that were true.
    pub passes: usize,
    pub total: usize,
}
impl Rate {
    pub fn add(&mut self, value: bool) {
        if value {
            self.passes += 1;
        }
        self.total += 1;
    }

    /// The fraction of true samples, `None` without samples.
    pub fn value(&self) -> Option<f64> {
        match self.total {
            0 => None,
            _ => Some(self.passes as f64 / self.total as f64),
        }
    }
}

/// Request and failure counts of one tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCounts {
    pub requests: usize,
    pub failures: usize,
}

/// What is known about one request when it is recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricTags {
    /// The action tag, such as `page_view_article`.
    pub tag: &'static str,
    /// `None` when no response was received.
    pub status_code: Option<u16>,
    /// Whether the response passed the tracking check.
    pub check_passed: bool,
}

/// A snapshot of all collected metrics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub http_reqs: usize,
    pub http_req_failed: Rate,
    /// Milliseconds.
    pub http_req_duration: Trend,
    pub successful_tracking_requests: usize,
    pub failed_tracking_requests: usize,
    pub tracking_request_error_rate: Rate,
    pub session_depth_page_views: Trend,
    pub sessions: usize,
    pub requests_by_tag: BTreeMap<String, TagCounts>,
    pub status_codes: BTreeMap<u16, usize>,
    /// Requests that got no response at all.
    pub transport_errors: usize,
    /// Samples that arrived after the aggregator was sealed.
    pub dropped_samples: usize,
}

#[derive(Debug, Default)]
struct MetricsState {
    summary: MetricsSummary,
    sealed: bool,
}

/// Thread safe collector of request and session samples.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    state: Mutex<MetricsState>,
}
impl MetricsAggregator {
    pub fn new() -> Self {
        MetricsAggregator::default()
    }

    // A worker panicking while holding the lock can't leave a half-applied sample
    // behind, every update is a handful of integer additions.
    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of one tracking request, returns false if it was dropped.
    pub fn record_request(&self, success: bool, latency: Duration, tags: &MetricTags) -> bool {
        let mut state = self.lock();
        if state.sealed {
            state.summary.dropped_samples += 1;
            return false;
        }

        let summary = &mut state.summary;
        summary.http_reqs += 1;
        summary.http_req_failed.add(!success);
        summary
            .http_req_duration
            .record(latency.as_millis() as usize);
        if tags.check_passed {
            summary.successful_tracking_requests += 1;
        } else {
            summary.failed_tracking_requests += 1;
        }
        summary.tracking_request_error_rate.add(!tags.check_passed);

        let tag = summary
            .requests_by_tag
            .entry(tags.tag.to_string())
            .or_default();
        tag.requests += 1;
        if !success {
            tag.failures += 1;
        }
        match tags.status_code {
            Some(status_code) => *summary.status_codes.entry(status_code).or_insert(0) += 1,
            None => summary.transport_errors += 1,
        }
        true
    }

    /// Record how many page views a completed session had, returns false if it was dropped.
    pub fn record_session_depth(&self, page_views: usize) -> bool {
        let mut state = self.lock();
        if state.sealed {
            state.summary.dropped_samples += 1;
            return false;
        }
        state.summary.session_depth_page_views.record(page_views);
        state.summary.sessions += 1;
        true
    }

    /// Stop accepting samples, anything recorded from now on is dropped.
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn snapshot(&self) -> MetricsSummary {
        self.lock().summary.clone()
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    number.to_formatted_string(&Locale::en)
}

fn format_rate(rate: &Rate) -> String {
    match rate.value() {
        Some(value) => format!("{:.2}%", value * 100.0),
        None => "-".to_string(),
    }
}

impl MetricsSummary {
    fn fmt_requests(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "\n === PER TAG METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>11} | {:>10}",
            "Request", "# reqs", "# fails", "fail %"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        // Busiest tags first.
        for (tag, counts) in self
            .requests_by_tag
            .iter()
            .sorted_by(|a, b| b.1.requests.cmp(&a.1.requests).then(a.0.cmp(b.0)))
        {
            let fail_percent = match counts.requests {
                0 => 0.0,
                requests => counts.failures as f64 / requests as f64 * 100.0,
            };
            writeln!(
                fmt,
                " {:<24} | {:>11} | {:>11} | {:>9.2}%",
                tag,
                format_number(counts.requests),
                format_number(counts.failures),
                fail_percent,
            )?;
        }
        writeln!(
            fmt,
            " -------------------------+-------------+-------------+-----------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>11} | {:>10}",
            "Aggregated",
            format_number(self.http_reqs),
            format_number(self.http_req_failed.passes),
            format_rate(&self.http_req_failed),
        )
    }

    fn fmt_trends(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "\n === TRENDS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>9} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7}",
            "Trend", "Avg", "Min", "Max", "Median", "p(95)", "p(99)"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, trend) in [
            ("http_req_duration (ms)", &self.http_req_duration),
            ("session_depth_page_views", &self.session_depth_page_views),
        ] {
            writeln!(
                fmt,
                " {:<24} | {:>9.2} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7}",
                name,
                trend.average(),
                format_number(trend.min),
                format_number(trend.max),
                format_number(trend.median()),
                format_number(trend.percentile(0.95)),
                format_number(trend.percentile(0.99)),
            )?;
        }
        Ok(())
    }

    fn fmt_tracking(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "\n === TRACKING ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<30} {:>14}",
            "successful_tracking_requests",
            format_number(self.successful_tracking_requests)
        )?;
        writeln!(
            fmt,
            " {:<30} {:>14}",
            "failed_tracking_requests",
            format_number(self.failed_tracking_requests)
        )?;
        writeln!(
            fmt,
            " {:<30} {:>14}",
            "tracking_request_error_rate",
            format_rate(&self.tracking_request_error_rate)
        )?;
        writeln!(
            fmt,
            " {:<30} {:>14}",
            "sessions",
            format_number(self.sessions)
        )?;
        if !self.status_codes.is_empty() || self.transport_errors > 0 {
            let mut codes: Vec<String> = self
                .status_codes
                .iter()
                .map(|(code, count)| format!("{} [{}]", format_number(*count), code))
                .collect();
            if self.transport_errors > 0 {
                codes.push(format!(
                    "{} [no response]",
                    format_number(self.transport_errors)
                ));
            }
            writeln!(fmt, " {:<30} {:>14}", "status codes", codes.join(", "))?;
        }
        if self.dropped_samples > 0 {
            writeln!(
                fmt,
                " {:<30} {:>14}",
                "dropped after shutdown",
                format_number(self.dropped_samples)
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.http_reqs == 0 {
            return writeln!(fmt, " No tracking requests were sent.");
        }
        self.fmt_requests(fmt)?;
        self.fmt_trends(fmt)?;
        self.fmt_tracking(fmt)
    }
}
