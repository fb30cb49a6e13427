//! Pass/fail thresholds on the collected metrics.
//!
//! Thresholds use the familiar `metric:aggregation<comparison>value` syntax, for example:
//!
//! ```text
//! http_req_duration:p(95)<350
//! http_req_failed:rate<0.003
//! successful_tracking_requests:count>100000
//! session_depth_page_views:avg>=4.5
//! ```
//!
//! Counters support `count`, rates support `rate`, and trends support `avg`, `min`,
//! `max`, `med` and `p(N)`. A rule evaluated without any data fails.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::metrics::{MetricsSummary, Rate, Trend};
use crate::TrackloadError;

lazy_static! {
    static ref THRESHOLD: Regex = Regex::new(
        r"^\s*(?P<metric>[a-z_]+)\s*:\s*(?P<aggregation>count|rate|avg|min|max|med|p\(\s*(?P<percent>\d+(\.\d+)?)\s*\))\s*(?P<comparison><=|>=|==|!=|<|>)\s*(?P<value>-?\d+(\.\d+)?)\s*$"
    )
    .expect("invalid threshold regex");
}

/// A metric thresholds can be set on.
#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Metric {
    HttpReqs,
    HttpReqFailed,
    HttpReqDuration,
    SuccessfulTrackingRequests,
    FailedTrackingRequests,
    TrackingRequestErrorRate,
    SessionDepthPageViews,
    Sessions,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::HttpReqs
            | Metric::SuccessfulTrackingRequests
            | Metric::FailedTrackingRequests
            | Metric::Sessions => MetricKind::Counter,
            Metric::HttpReqFailed | Metric::TrackingRequestErrorRate => MetricKind::Rate,
            Metric::HttpReqDuration | Metric::SessionDepthPageViews => MetricKind::Trend,
        }
    }

    fn counter(&self, summary: &MetricsSummary) -> usize {
        match self {
            Metric::HttpReqs => summary.http_reqs,
            Metric::SuccessfulTrackingRequests => summary.successful_tracking_requests,
            Metric::FailedTrackingRequests => summary.failed_tracking_requests,
            _ => summary.sessions,
        }
    }

    fn rate<'a>(&self, summary: &'a MetricsSummary) -> &'a Rate {
        match self {
            Metric::HttpReqFailed => &summary.http_req_failed,
            _ => &summary.tracking_request_error_rate,
        }
    }

    fn trend<'a>(&self, summary: &'a MetricsSummary) -> &'a Trend {
        match self {
            Metric::HttpReqDuration => &summary.http_req_duration,
            _ => &summary.session_depth_page_views,
        }
    }
}

/// How a metric is reduced to a single value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregation {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    /// A percentile between 0 and 100.
    Percentile(f64),
}
impl Aggregation {
    fn supports(&self, kind: MetricKind) -> bool {
        match self {
            Aggregation::Count => kind == MetricKind::Counter,
            Aggregation::Rate => kind == MetricKind::Rate,
            _ => kind == MetricKind::Trend,
        }
    }
}
impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Aggregation::Count => write!(f, "count"),
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(percent) => write!(f, "p({})", percent),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum Comparison {
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
}
impl Comparison {
    pub fn holds(&self, observed: f64, value: f64) -> bool {
        match self {
            Comparison::Lt => observed < value,
            Comparison::Le => observed <= value,
            Comparison::Gt => observed > value,
            Comparison::Ge => observed >= value,
            Comparison::Eq => observed == value,
            Comparison::Ne => observed != value,
        }
    }
}

/// A pass/fail rule on one aggregated metric.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdRule {
    pub metric: Metric,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub value: f64,
}

impl ThresholdRule {
    /// The aggregated value of the metric, `None` without data.
    pub fn observe(&self, summary: &MetricsSummary) -> Option<f64> {
        match self.metric.kind() {
            MetricKind::Counter => Some(self.metric.counter(summary) as f64),
            MetricKind::Rate => self.metric.rate(summary).value(),
            MetricKind::Trend => {
                let trend = self.metric.trend(summary);
                if trend.count == 0 {
                    return None;
                }
                Some(match self.aggregation {
                    Aggregation::Avg => trend.average(),
                    Aggregation::Min => trend.min as f64,
                    Aggregation::Max => trend.max as f64,
                    Aggregation::Med => trend.median() as f64,
                    Aggregation::Percentile(percent) => trend.percentile(percent / 100.0) as f64,
                    Aggregation::Count | Aggregation::Rate => trend.count as f64,
                })
            }
        }
    }

    pub fn evaluate(&self, summary: &MetricsSummary) -> ThresholdResult {
        let observed = self.observe(summary);
        let passed = observed.is_some_and(|observed| self.comparison.holds(observed, self.value));
        if !passed {
            debug!("threshold {} failed, observed {:?}", self, observed);
        }
        ThresholdResult {
            rule: self.clone(),
            observed,
            passed,
        }
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}{}{}",
            self.metric, self.aggregation, self.comparison, self.value
        )
    }
}

impl Serialize for ThresholdRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for ThresholdRule {
    type Err = TrackloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: String| TrackloadError::InvalidThreshold {
            threshold: s.to_string(),
            detail,
        };

        let captures = THRESHOLD.captures(s).ok_or_else(|| {
            invalid("expected format \"{metric}:{aggregation}{comparison}{value}\", ie \"http_req_duration:p(95)<350\"".to_string())
        })?;

        let metric = Metric::from_str(&captures["metric"])
            .map_err(|_| {
                invalid(format!(
                    "unknown metric '{}', expected one of: {}",
                    &captures["metric"],
                    Metric::iter().join(", ")
                ))
            })?;
        let aggregation = match &captures["aggregation"] {
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            _ => {
                let percent = captures["percent"]
                    .parse::<f64>()
                    .map_err(|e| invalid(e.to_string()))?;
                if percent > 100.0 {
                    return Err(invalid(format!("percentile {} is above 100", percent)));
                }
                Aggregation::Percentile(percent)
            }
        };
        if !aggregation.supports(metric.kind()) {
            return Err(invalid(format!(
                "{} does not support the {} aggregation",
                metric, aggregation
            )));
        }
        let comparison = Comparison::from_str(&captures["comparison"])
            .map_err(|_| invalid(format!("unknown comparison '{}'", &captures["comparison"])))?;
        let value = captures["value"]
            .parse::<f64>()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(ThresholdRule {
            metric,
            aggregation,
            comparison,
            value,
        })
    }
}

/// The outcome of one rule.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub rule: ThresholdRule,
    /// `None` when the metric had no data.
    pub observed: Option<f64>,
    pub passed: bool,
}

/// Evaluate all rules, the run passes only if every rule passes.
pub fn evaluate_all(rules: &[ThresholdRule], summary: &MetricsSummary) -> Vec<ThresholdResult> {
    rules.iter().map(|rule| rule.evaluate(summary)).collect()
}

/// The standard tracking thresholds, added with `--default-thresholds`.
///
/// These are sized for a long, high-volume run with the aggressive profile: over a hundred
/// thousand successful requests, and sessions of 4-6 page views.
pub fn default_thresholds() -> Vec<&'static str> {
    vec![
        "http_req_duration:p(95)<350",
        "http_req_duration:p(99)<600",
        "http_req_failed:rate<0.003",
        "successful_tracking_requests:count>100000",
        "tracking_request_error_rate:rate<0.01",
        "session_depth_page_views:avg>=4.5",
    ]
}
