//! Functions and structures related to configuring a simulation.
//!
//! A simulation can be configured at run time by passing in the options and flags
//! defined by the [`TrackloadConfiguration`] structure.
//!
//! A simulation can be configured programmatically with
//! [`TrackloadDefaultType::set_default`]. Options passed at run time always take
//! precedence over programmatic defaults, which take precedence over the selected
//! [`PacingProfile`].

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::action::SiteSettings;
use crate::behavior::BehaviorWeights;
use crate::dispatcher::RequestMethod;
use crate::pacer::PacingProfile;
use crate::ramp::{RampPlan, DEFAULT_GRACEFUL_RAMP_DOWN};
use crate::session::{IdentityPolicy, SessionSettings};
use crate::threshold::{default_thresholds, ThresholdRule};
use crate::util;
use crate::{Simulation, TrackloadError};

/// How long to wait for a tracking request, if not otherwise configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime options available when launching a simulation.
///
/// Custom defaults can be programmatically set for all of these options using
/// [`TrackloadDefault`].
///
/// Help is generated for all of these options by passing a `-h` flag.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"trackload simulates realistic analytics tracking traffic against a Matomo
compatible tracker, to validate its capacity and latency under load.

The following runtime options are available when launching a simulation:"#
)]
pub struct TrackloadConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,

    /// Defines the tracker endpoint (ie http://10.21.32.33/matomo.php)
    #[options(short = "H")]
    pub host: String,
    /// Sets ramp stages (ie "1m,200;5m,200;1m,0")
    #[options(short = "s", meta = "\"STAGES\"")]
    pub stages: Option<RampPlan>,
    /// Lets retired users finish their session for up to (default: 30s)
    #[options(no_short, meta = "TIME")]
    pub graceful_ramp_down: String,
    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a 'Visitors:' header after this option
        help = "Increases verbosity (-v, -vv, etc)\n\nVisitors:"
    )]
    pub verbose: u8,

    /// Selects pacing preset (realistic, aggressive)
    #[options(short = "p", meta = "PROFILE")]
    pub profile: Option<PacingProfile>,
    /// Sets visitor identity policy (persistent, per-session)
    #[options(no_short, meta = "POLICY")]
    pub identity: Option<IdentityPolicy>,
    /// Sets page views per session (ie 3-6)
    #[options(no_short, meta = "MIN-MAX")]
    pub session_length: String,
    /// Sets pause between actions (ie 5s-15s)
    #[options(no_short, meta = "TIME-TIME")]
    pub think_time: String,
    /// Sets pause between sessions (ie 30s-60s)
    #[options(no_short, meta = "TIME-TIME")]
    pub session_gap: String,
    /// Loads behavior weights from a JSON file
    #[options(short = "w", meta = "FILE")]
    pub weights_file: String,
    /// Sets probability an action is a page view (default: 0.95)
    #[options(no_short, meta = "PROBABILITY")]
    pub page_view_probability: Option<f64>,
    /// Sets probability a visitor is logged in (default: 0.07)
    #[options(
        no_short,
        meta = "PROBABILITY",
        help = "Sets probability a visitor is logged in (default: 0.07)\n\nTracking:"
    )]
    pub user_id_probability: Option<f64>,

    /// Sets the tracked site id (default: 1)
    #[options(short = "i", meta = "ID")]
    pub site_id: Option<usize>,
    /// Sets goal id of newsletter signups (default: 1)
    #[options(no_short, meta = "ID")]
    pub goal_id: Option<usize>,
    /// Sets token_auth sent with every request
    #[options(no_short, meta = "TOKEN")]
    pub auth_token: String,
    /// Sets request method (GET, POST)
    #[options(short = "m", meta = "METHOD")]
    pub method: Option<RequestMethod>,
    /// Sets per-request timeout (default: 60s)
    #[options(no_short, meta = "TIME")]
    pub timeout: String,
    /// Requires a response body containing this text (repeatable)
    #[options(no_short, meta = "TEXT")]
    pub expect_body: Vec<String>,
    /// Sets page host of simulated urls (default: https://connect.detik.com)
    #[options(no_short, meta = "URL")]
    pub page_host: String,
    /// Sets reported browser language (default: en-US)
    #[options(no_short, meta = "LANG")]
    pub locale: String,
    /// Sets reported screen resolution (default: 1920x1080)
    #[options(
        no_short,
        meta = "WxH",
        help = "Sets reported screen resolution (default: 1920x1080)\n\nResults:"
    )]
    pub resolution: String,

    /// Adds a pass/fail threshold (ie "http_req_duration:p(95)<350", repeatable)
    #[options(short = "t", meta = "RULE")]
    pub threshold: Vec<String>,
    /// Adds the standard tracking thresholds
    #[options(no_short)]
    pub default_thresholds: bool,
    /// Writes a JSON report to this file
    #[options(no_short, meta = "NAME")]
    pub report_file: String,
    /// Doesn't display metrics at end of simulation
    #[options(no_short)]
    pub no_print_metrics: bool,
}

/// Optional default values for run-time options.
#[derive(Clone, Debug, Default)]
pub(crate) struct TrackloadDefaults {
    /// An optional default tracker endpoint.
    pub host: Option<String>,
    /// An optional default ramp plan.
    pub stages: Option<RampPlan>,
    pub graceful_ramp_down: Option<String>,
    /// An optional default for the log file name.
    pub log_file: Option<String>,
    /// An optional default log level.
    pub log_level: Option<u8>,
    /// An optional default value for quiet level.
    pub quiet: Option<u8>,
    /// An optional default value for verbosity level.
    pub verbose: Option<u8>,
    pub profile: Option<PacingProfile>,
    pub identity: Option<IdentityPolicy>,
    pub session_length: Option<String>,
    pub think_time: Option<String>,
    pub session_gap: Option<String>,
    pub weights_file: Option<String>,
    pub page_view_probability: Option<f64>,
    pub user_id_probability: Option<f64>,
    pub site_id: Option<usize>,
    pub goal_id: Option<usize>,
    pub auth_token: Option<String>,
    pub method: Option<RequestMethod>,
    pub timeout: Option<String>,
    /// Expected body markers, added to any set at run time.
    pub expect_body: Vec<String>,
    pub page_host: Option<String>,
    pub locale: Option<String>,
    pub resolution: Option<String>,
    /// Thresholds, added to any set at run time.
    pub threshold: Vec<String>,
    pub default_thresholds: Option<bool>,
    pub report_file: Option<String>,
    pub no_print_metrics: Option<bool>,
}

/// Allows the optional configuration of defaults for run-time options.
#[derive(Clone, Copy, Debug)]
pub enum TrackloadDefault {
    /// An optional default tracker endpoint.
    Host,
    /// An optional default ramp plan, as `"{duration},{target};..."`.
    Stages,
    /// An optional default graceful ramp-down window.
    GracefulRampDown,
    /// An optional default log file name.
    LogFile,
    /// An optional default log file level.
    LogLevel,
    /// An optional default for how quiet to be.
    Quiet,
    /// An optional default for how verbose to be.
    Verbose,
    /// An optional default pacing profile.
    Profile,
    /// An optional default identity policy.
    Identity,
    /// An optional default range of page views per session.
    SessionLength,
    /// An optional default range of pauses between actions.
    ThinkTime,
    /// An optional default range of pauses between sessions.
    SessionGap,
    /// An optional default behavior weights file.
    WeightsFile,
    /// An optional default probability that an action is a page view.
    PageViewProbability,
    /// An optional default probability that a visitor is logged in.
    UserIdProbability,
    /// An optional default site id.
    SiteId,
    /// An optional default goal id of newsletter signups.
    GoalId,
    /// An optional default `token_auth`.
    AuthToken,
    /// An optional default request method.
    Method,
    /// An optional default request timeout.
    Timeout,
    /// An additional expected body marker.
    ExpectBody,
    /// An optional default host of simulated page urls.
    PageHost,
    /// An optional default browser language.
    Locale,
    /// An optional default screen resolution.
    Resolution,
    /// An additional threshold rule.
    Threshold,
    /// An optional default for adding the standard thresholds.
    DefaultThresholds,
    /// An optional default JSON report file name.
    ReportFile,
    /// An optional default for not printing metrics at the end.
    NoPrintMetrics,
}

/// Most run-time options can be programmatically configured with custom defaults.
///
/// For example, you can optionally configure a default tracker endpoint, and a default
/// ramp plan. Run-time options always override programmatic defaults.
///
/// The following defaults can be configured with a `&str`:
///  - [`TrackloadDefault::Host`], [`TrackloadDefault::Stages`],
///    [`TrackloadDefault::GracefulRampDown`], [`TrackloadDefault::LogFile`],
///    [`TrackloadDefault::SessionLength`], [`TrackloadDefault::ThinkTime`],
///    [`TrackloadDefault::SessionGap`], [`TrackloadDefault::WeightsFile`],
///    [`TrackloadDefault::AuthToken`], [`TrackloadDefault::Timeout`],
///    [`TrackloadDefault::ExpectBody`], [`TrackloadDefault::PageHost`],
///    [`TrackloadDefault::Locale`], [`TrackloadDefault::Resolution`],
///    [`TrackloadDefault::Threshold`], [`TrackloadDefault::ReportFile`]
///
/// The following defaults can be configured with a `usize` integer:
///  - [`TrackloadDefault::LogLevel`], [`TrackloadDefault::Quiet`],
///    [`TrackloadDefault::Verbose`], [`TrackloadDefault::SiteId`], [`TrackloadDefault::GoalId`],
///    [`TrackloadDefault::GracefulRampDown`] (seconds), [`TrackloadDefault::Timeout`] (seconds)
///
/// The following defaults can be configured with a `bool`:
///  - [`TrackloadDefault::DefaultThresholds`], [`TrackloadDefault::NoPrintMetrics`]
///
/// The following defaults can be configured with an `f64`:
///  - [`TrackloadDefault::PageViewProbability`], [`TrackloadDefault::UserIdProbability`]
///
/// [`TrackloadDefault::Profile`] is configured with a [`PacingProfile`],
/// [`TrackloadDefault::Identity`] with an [`IdentityPolicy`], and
/// [`TrackloadDefault::Method`] with a [`RequestMethod`].
pub trait TrackloadDefaultType<T> {
    /// Sets a [`TrackloadDefault`] to the provided value.
    ///
    /// # Example
    /// ```rust
    /// use trackload::prelude::*;
    ///
    /// fn main() -> Result<(), TrackloadError> {
    ///     Simulation::initialize()?
    ///         .set_default(TrackloadDefault::Host, "http://localhost/matomo.php")?
    ///         .set_default(TrackloadDefault::Stages, "30s,10;1m,10;30s,0")?
    ///         .set_default(TrackloadDefault::Profile, PacingProfile::Aggressive)?
    ///         .set_default(TrackloadDefault::SiteId, 3)?;
    ///
    ///     Ok(())
    /// }
    /// ```
    fn set_default(self, key: TrackloadDefault, value: T) -> Result<Box<Self>, TrackloadError>;
}

// Display a helpful and explicit error when a default is set to the wrong type.
fn wrong_type(
    key: TrackloadDefault,
    value: impl fmt::Display,
    received: &str,
) -> TrackloadError {
    let expected = match key {
        TrackloadDefault::LogLevel
        | TrackloadDefault::Quiet
        | TrackloadDefault::Verbose
        | TrackloadDefault::SiteId
        | TrackloadDefault::GoalId => "usize",
        TrackloadDefault::DefaultThresholds | TrackloadDefault::NoPrintMetrics => "bool",
        TrackloadDefault::PageViewProbability | TrackloadDefault::UserIdProbability => "f64",
        TrackloadDefault::Profile => "PacingProfile",
        TrackloadDefault::Identity => "IdentityPolicy",
        TrackloadDefault::Method => "RequestMethod",
        _ => "&str",
    };
    TrackloadError::InvalidOption {
        option: format!("TrackloadDefault::{:?}", key),
        value: value.to_string(),
        detail: format!(
            "set_default(TrackloadDefault::{:?}, {}) expected {} value, received {}",
            key, value, expected, received
        ),
    }
}

impl TrackloadDefaultType<&str> for Simulation {
    /// Sets [`TrackloadDefault`] to a [`&str`] value.
    fn set_default(
        mut self,
        key: TrackloadDefault,
        value: &str,
    ) -> Result<Box<Self>, TrackloadError> {
        let text = || Some(value.to_string());
        match key {
            TrackloadDefault::Host => {
                self.defaults.host = if value.is_empty() { None } else { text() }
            }
            TrackloadDefault::Stages => self.defaults.stages = Some(RampPlan::from_str(value)?),
            TrackloadDefault::GracefulRampDown => self.defaults.graceful_ramp_down = text(),
            TrackloadDefault::LogFile => self.defaults.log_file = text(),
            TrackloadDefault::SessionLength => self.defaults.session_length = text(),
            TrackloadDefault::ThinkTime => self.defaults.think_time = text(),
            TrackloadDefault::SessionGap => self.defaults.session_gap = text(),
            TrackloadDefault::WeightsFile => self.defaults.weights_file = text(),
            TrackloadDefault::AuthToken => self.defaults.auth_token = text(),
            TrackloadDefault::Timeout => self.defaults.timeout = text(),
            TrackloadDefault::ExpectBody => self.defaults.expect_body.push(value.to_string()),
            TrackloadDefault::PageHost => self.defaults.page_host = text(),
            TrackloadDefault::Locale => self.defaults.locale = text(),
            TrackloadDefault::Resolution => self.defaults.resolution = text(),
            TrackloadDefault::Threshold => {
                // Reject invalid rules right away.
                ThresholdRule::from_str(value)?;
                self.defaults.threshold.push(value.to_string())
            }
            TrackloadDefault::ReportFile => self.defaults.report_file = text(),
            TrackloadDefault::Profile => {
                self.defaults.profile = Some(
                    PacingProfile::from_str(value)
                        .map_err(|_| wrong_type(key, value, "an unknown profile"))?,
                )
            }
            TrackloadDefault::Identity => {
                self.defaults.identity = Some(
                    IdentityPolicy::from_str(value)
                        .map_err(|_| wrong_type(key, value, "an unknown policy"))?,
                )
            }
            TrackloadDefault::Method => {
                self.defaults.method = Some(
                    RequestMethod::from_str(value)
                        .map_err(|_| wrong_type(key, value, "an unknown method"))?,
                )
            }
            TrackloadDefault::LogLevel
            | TrackloadDefault::Quiet
            | TrackloadDefault::Verbose
            | TrackloadDefault::SiteId
            | TrackloadDefault::GoalId
            | TrackloadDefault::DefaultThresholds
            | TrackloadDefault::NoPrintMetrics
            | TrackloadDefault::PageViewProbability
            | TrackloadDefault::UserIdProbability => return Err(wrong_type(key, value, "&str")),
        }
        Ok(Box::new(self))
    }
}
impl TrackloadDefaultType<usize> for Simulation {
    /// Sets [`TrackloadDefault`] to a [`usize`] value.
    fn set_default(
        mut self,
        key: TrackloadDefault,
        value: usize,
    ) -> Result<Box<Self>, TrackloadError> {
        match key {
            TrackloadDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            TrackloadDefault::Quiet => self.defaults.quiet = Some(value as u8),
            TrackloadDefault::Verbose => self.defaults.verbose = Some(value as u8),
            TrackloadDefault::SiteId => self.defaults.site_id = Some(value),
            TrackloadDefault::GoalId => self.defaults.goal_id = Some(value),
            TrackloadDefault::GracefulRampDown => {
                self.defaults.graceful_ramp_down = Some(value.to_string())
            }
            TrackloadDefault::Timeout => self.defaults.timeout = Some(value.to_string()),
            _ => return Err(wrong_type(key, value, "usize")),
        }
        Ok(Box::new(self))
    }
}
impl TrackloadDefaultType<bool> for Simulation {
    /// Sets [`TrackloadDefault`] to a [`bool`] value.
    fn set_default(
        mut self,
        key: TrackloadDefault,
        value: bool,
    ) -> Result<Box<Self>, TrackloadError> {
        match key {
            TrackloadDefault::DefaultThresholds => {
                self.defaults.default_thresholds = Some(value)
            }
            TrackloadDefault::NoPrintMetrics => self.defaults.no_print_metrics = Some(value),
            _ => return Err(wrong_type(key, value, "bool")),
        }
        Ok(Box::new(self))
    }
}
impl TrackloadDefaultType<f64> for Simulation {
    /// Sets [`TrackloadDefault`] to an [`f64`] value.
    fn set_default(
        mut self,
        key: TrackloadDefault,
        value: f64,
    ) -> Result<Box<Self>, TrackloadError> {
        match key {
            TrackloadDefault::PageViewProbability => {
                self.defaults.page_view_probability = Some(value)
            }
            TrackloadDefault::UserIdProbability => self.defaults.user_id_probability = Some(value),
            _ => return Err(wrong_type(key, value, "f64")),
        }
        Ok(Box::new(self))
    }
}
impl TrackloadDefaultType<PacingProfile> for Simulation {
    /// Sets [`TrackloadDefault`] to a [`PacingProfile`] value.
    fn set_default(
        mut self,
        key: TrackloadDefault,
        value: PacingProfile,
    ) -> Result<Box<Self>, TrackloadError> {
        match key {
            TrackloadDefault::Profile => self.defaults.profile = Some(value),
            _ => return Err(wrong_type(key, value, "PacingProfile")),
        }
        Ok(Box::new(self))
    }
}
impl TrackloadDefaultType<IdentityPolicy> for Simulation {
    /// Sets [`TrackloadDefault`] to an [`IdentityPolicy`] value.
    fn set_default(
        mut self,
        key: TrackloadDefault,
        value: IdentityPolicy,
    ) -> Result<Box<Self>, TrackloadError> {
        match key {
            TrackloadDefault::Identity => self.defaults.identity = Some(value),
            _ => return Err(wrong_type(key, value, "IdentityPolicy")),
        }
        Ok(Box::new(self))
    }
}
impl TrackloadDefaultType<RequestMethod> for Simulation {
    /// Sets [`TrackloadDefault`] to a [`RequestMethod`] value.
    fn set_default(
        mut self,
        key: TrackloadDefault,
        value: RequestMethod,
    ) -> Result<Box<Self>, TrackloadError> {
        match key {
            TrackloadDefault::Method => self.defaults.method = Some(value),
            _ => return Err(wrong_type(key, value, "RequestMethod")),
        }
        Ok(Box::new(self))
    }
}

/// Used internally to configure [`TrackloadConfiguration`] values based on precedence rules.
#[derive(Debug, Clone)]
pub(crate) struct TrackloadValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Filter using this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait TrackloadConfigure<T> {
    /// Set [`TrackloadValue`] with supported type.
    fn get_value(&self, values: Vec<TrackloadValue<T>>) -> Option<T>;
}

impl<T: fmt::Debug> TrackloadConfigure<T> for TrackloadConfiguration {
    /// Use the first [`TrackloadValue`] that is set and not filtered.
    fn get_value(&self, values: Vec<TrackloadValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                }
                if !value.message.is_empty() {
                    info!("{} = {:?}", value.message, v)
                }
                return Some(v);
            }
        }
        None
    }
}

// A run-time string option that is unset when empty.
fn cli_text(value: &str) -> TrackloadValue<'static, String> {
    TrackloadValue {
        value: Some(value.to_string()),
        filter: value.is_empty(),
        message: "",
    }
}

// A programmatic default, logged under `message` when used.
fn default_value<'a, T: Clone>(value: &Option<T>, message: &'a str) -> TrackloadValue<'a, T> {
    TrackloadValue {
        value: value.clone(),
        filter: value.is_none(),
        message,
    }
}

// A run-time option that is unset when None.
fn cli_option<'a, T: Clone>(value: &Option<T>, message: &'a str) -> TrackloadValue<'a, T> {
    default_value(value, message)
}

// A run-time count or flag that is unset when 0 or false.
fn cli_count<T: Default + PartialEq + Copy>(value: T) -> TrackloadValue<'static, T> {
    TrackloadValue {
        value: Some(value),
        filter: value == T::default(),
        message: "",
    }
}

impl TrackloadConfiguration {
    /// Implement precedence rules for all [`TrackloadConfiguration`] values.
    pub(crate) fn configure(&mut self, defaults: &TrackloadDefaults) {
        // Configure `quiet`.
        self.quiet = self
            .get_value(vec![cli_count(self.quiet), default_value(&defaults.quiet, "")])
            .unwrap_or(0);

        // Configure `verbose`.
        self.verbose = self
            .get_value(vec![
                cli_count(self.verbose),
                default_value(&defaults.verbose, ""),
            ])
            .unwrap_or(0);

        // Configure `log_level`.
        self.log_level = self
            .get_value(vec![
                cli_count(self.log_level),
                default_value(&defaults.log_level, ""),
            ])
            .unwrap_or(0);

        // Configure `log_file`.
        self.log_file = self
            .get_value(vec![
                cli_text(&self.log_file),
                default_value(&defaults.log_file, ""),
            ])
            .unwrap_or_default();

        // Initialize the logger before anything else is logged.
        self.initialize_logger();

        self.host = self
            .get_value(vec![
                cli_text(&self.host),
                default_value(&defaults.host, "host"),
            ])
            .unwrap_or_default();

        self.stages = self.get_value(vec![
            cli_option(&self.stages, "stages"),
            default_value(&defaults.stages, "stages"),
        ]);

        self.graceful_ramp_down = self
            .get_value(vec![
                cli_text(&self.graceful_ramp_down),
                default_value(&defaults.graceful_ramp_down, "graceful_ramp_down"),
            ])
            .unwrap_or_default();

        // The profile must be known before anything it provides presets for.
        self.profile = Some(
            self.get_value(vec![
                cli_option(&self.profile, "profile"),
                default_value(&defaults.profile, "profile"),
            ])
            .unwrap_or_default(),
        );

        self.identity = self.get_value(vec![
            cli_option(&self.identity, "identity"),
            default_value(&defaults.identity, "identity"),
        ]);

        self.session_length = self
            .get_value(vec![
                cli_text(&self.session_length),
                default_value(&defaults.session_length, "session_length"),
            ])
            .unwrap_or_default();

        self.think_time = self
            .get_value(vec![
                cli_text(&self.think_time),
                default_value(&defaults.think_time, "think_time"),
            ])
            .unwrap_or_default();

        self.session_gap = self
            .get_value(vec![
                cli_text(&self.session_gap),
                default_value(&defaults.session_gap, "session_gap"),
            ])
            .unwrap_or_default();

        self.weights_file = self
            .get_value(vec![
                cli_text(&self.weights_file),
                default_value(&defaults.weights_file, "weights_file"),
            ])
            .unwrap_or_default();

        self.page_view_probability = self.get_value(vec![
            cli_option(&self.page_view_probability, "page_view_probability"),
            default_value(&defaults.page_view_probability, "page_view_probability"),
        ]);

        self.user_id_probability = self.get_value(vec![
            cli_option(&self.user_id_probability, "user_id_probability"),
            default_value(&defaults.user_id_probability, "user_id_probability"),
        ]);

        self.site_id = Some(
            self.get_value(vec![
                cli_option(&self.site_id, "site_id"),
                default_value(&defaults.site_id, "site_id"),
            ])
            .unwrap_or(1),
        );

        self.goal_id = self.get_value(vec![
            cli_option(&self.goal_id, "goal_id"),
            default_value(&defaults.goal_id, "goal_id"),
        ]);

        self.auth_token = self
            .get_value(vec![
                cli_text(&self.auth_token),
                default_value(&defaults.auth_token, ""),
            ])
            .unwrap_or_default();

        self.method = Some(
            self.get_value(vec![
                cli_option(&self.method, "method"),
                default_value(&defaults.method, "method"),
            ])
            .unwrap_or_default(),
        );

        self.timeout = self
            .get_value(vec![
                cli_text(&self.timeout),
                default_value(&defaults.timeout, "timeout"),
            ])
            .unwrap_or_default();

        // Expected body markers and thresholds accumulate.
        self.expect_body.extend(defaults.expect_body.iter().cloned());
        self.threshold.extend(defaults.threshold.iter().cloned());

        self.page_host = self
            .get_value(vec![
                cli_text(&self.page_host),
                default_value(&defaults.page_host, "page_host"),
            ])
            .unwrap_or_default();

        self.locale = self
            .get_value(vec![
                cli_text(&self.locale),
                default_value(&defaults.locale, "locale"),
            ])
            .unwrap_or_default();

        self.resolution = self
            .get_value(vec![
                cli_text(&self.resolution),
                default_value(&defaults.resolution, "resolution"),
            ])
            .unwrap_or_default();

        self.default_thresholds = self
            .get_value(vec![
                cli_count(self.default_thresholds),
                default_value(&defaults.default_thresholds, ""),
            ])
            .unwrap_or(false);

        self.report_file = self
            .get_value(vec![
                cli_text(&self.report_file),
                default_value(&defaults.report_file, "report_file"),
            ])
            .unwrap_or_default();

        self.no_print_metrics = self
            .get_value(vec![
                cli_count(self.no_print_metrics),
                default_value(&defaults.no_print_metrics, ""),
            ])
            .unwrap_or(false);
    }

    /// The selected pacing profile.
    pub fn pacing_profile(&self) -> PacingProfile {
        self.profile.unwrap_or_default()
    }

    /// The identity policy, from the profile unless configured.
    pub fn identity_policy(&self) -> IdentityPolicy {
        self.identity
            .unwrap_or_else(|| self.pacing_profile().identity_policy())
    }

    /// The validated ramp plan, including the graceful ramp-down window.
    pub fn ramp_plan(&self) -> Result<RampPlan, TrackloadError> {
        let plan = self.stages.clone().ok_or_else(|| TrackloadError::NoStages {
            detail: "Ramp stages must be defined via the --stages flag or TrackloadDefault::Stages."
                .to_string(),
        })?;
        plan.validate()?;
        let graceful_ramp_down = match self.graceful_ramp_down.as_str() {
            "" => DEFAULT_GRACEFUL_RAMP_DOWN,
            value => util::parse_timespan(value).ok_or_else(|| TrackloadError::InvalidOption {
                option: "`configuration.graceful_ramp_down`".to_string(),
                value: value.to_string(),
                detail: "`configuration.graceful_ramp_down` must be a time span, ie \"30s\"."
                    .to_string(),
            })?,
        };
        Ok(plan.with_graceful_ramp_down(graceful_ramp_down))
    }

    /// The page views per session, from the profile unless configured.
    pub fn session_settings(&self) -> Result<SessionSettings, TrackloadError> {
        if self.session_length.is_empty() {
            return Ok(self.pacing_profile().session_length());
        }
        let (min_length, max_length) = util::parse_count_range(&self.session_length)
            .ok_or_else(|| invalid_range("session_length", &self.session_length))?;
        if min_length == 0 || min_length > max_length {
            return Err(TrackloadError::InvalidRange {
                option: "`configuration.session_length`".to_string(),
                value: self.session_length.clone(),
                detail: "sessions need at least 1 page view, and min must not exceed max."
                    .to_string(),
            });
        }
        Ok(SessionSettings {
            min_length,
            max_length,
        })
    }

    /// The pause between actions, from the profile unless configured.
    pub fn think_time(&self) -> Result<(Duration, Duration), TrackloadError> {
        match self.think_time.as_str() {
            "" => Ok(self.pacing_profile().think_time()),
            value => delay_range("think_time", value),
        }
    }

    /// The pause between sessions, from the profile unless configured.
    pub fn session_gap(&self) -> Result<(Duration, Duration), TrackloadError> {
        match self.session_gap.as_str() {
            "" => Ok(self.pacing_profile().session_gap()),
            value => delay_range("session_gap", value),
        }
    }

    /// The per-request timeout.
    pub fn request_timeout(&self) -> Result<Duration, TrackloadError> {
        if self.timeout.is_empty() {
            return Ok(DEFAULT_TIMEOUT);
        }
        match util::parse_timespan(&self.timeout) {
            Some(timeout) if !timeout.is_zero() => Ok(timeout),
            _ => Err(TrackloadError::InvalidOption {
                option: "`configuration.timeout`".to_string(),
                value: self.timeout.clone(),
                detail: "`configuration.timeout` must be a time span greater than 0.".to_string(),
            }),
        }
    }

    /// Behavior weights loaded from the weights file if configured, otherwise `weights`
    /// or the built in defaults. Configured probabilities and goal id apply on top.
    pub fn behavior_weights(
        &self,
        weights: Option<BehaviorWeights>,
    ) -> Result<BehaviorWeights, TrackloadError> {
        let mut weights = if !self.weights_file.is_empty() {
            info!("loading behavior weights from {}", self.weights_file);
            BehaviorWeights::from_file(&self.weights_file)?
        } else {
            weights.unwrap_or_default()
        };
        if let Some(probability) = self.page_view_probability {
            weights.page_view_probability = probability;
        }
        if let Some(probability) = self.user_id_probability {
            weights.user_id_probability = probability;
        }
        if let Some(goal_id) = self.goal_id {
            weights.newsletter_goal_id =
                u32::try_from(goal_id).map_err(|e| TrackloadError::InvalidOption {
                    option: "`configuration.goal_id`".to_string(),
                    value: goal_id.to_string(),
                    detail: e.to_string(),
                })?;
        }
        Ok(weights)
    }

    /// Where and how the simulated pages are tracked.
    pub fn site_settings(&self) -> SiteSettings {
        let mut site = SiteSettings::default();
        if let Some(site_id) = self.site_id {
            site.site_id = site_id;
        }
        if !self.page_host.is_empty() {
            site.page_host = self.page_host.clone();
        }
        if !self.locale.is_empty() {
            site.locale = self.locale.clone();
        }
        if !self.resolution.is_empty() {
            site.resolution = self.resolution.clone();
        }
        if !self.auth_token.is_empty() {
            site.auth_token = Some(self.auth_token.clone());
        }
        site
    }

    /// All configured thresholds, plus the standard ones if enabled.
    pub fn thresholds(&self) -> Result<Vec<ThresholdRule>, TrackloadError> {
        let mut rules: Vec<&str> = self.threshold.iter().map(String::as_str).collect();
        if self.default_thresholds {
            rules.extend(default_thresholds());
        }
        rules.into_iter().map(ThresholdRule::from_str).collect()
    }

    /// Validate configured [`TrackloadConfiguration`] values.
    pub(crate) fn validate(&self) -> Result<(), TrackloadError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(TrackloadError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // A tracker endpoint is required.
        if self.host.is_empty() {
            return Err(TrackloadError::InvalidOption {
                option: "`configuration.host`".to_string(),
                value: self.host.clone(),
                detail: "A tracker endpoint must be defined via the --host flag or TrackloadDefault::Host."
                    .to_string(),
            });
        }
        util::is_valid_host(&self.host)?;
        if !self.page_host.is_empty() {
            util::is_valid_host(&self.page_host)?;
        }

        if self.site_id == Some(0) {
            return Err(TrackloadError::InvalidOption {
                option: "`configuration.site_id`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.site_id` must be set to at least 1.".to_string(),
            });
        }

        for (option, probability) in [
            ("page_view_probability", self.page_view_probability),
            ("user_id_probability", self.user_id_probability),
        ] {
            if let Some(probability) = probability {
                if !(0.0..=1.0).contains(&probability) {
                    return Err(TrackloadError::InvalidOption {
                        option: format!("`configuration.{}`", option),
                        value: probability.to_string(),
                        detail: format!("`configuration.{}` must be between 0 and 1.", option),
                    });
                }
            }
        }

        // Validate everything that is parsed later, so the simulation never starts
        // with an invalid configuration.
        self.ramp_plan()?;
        self.session_settings()?;
        self.think_time()?;
        self.session_gap()?;
        self.request_timeout()?;
        self.thresholds()?;

        Ok(())
    }

    /// Optionally initialize the logger which writes to standard out and/or to a
    /// configurable log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!(
                    "failed to create log file {}: {}",
                    log_to_file.display(),
                    e
                ),
            }
        }
        if let Err(e) = CombinedLogger::init(loggers) {
            // Only one logger can be installed per process.
            debug!("failed to initialize CombinedLogger: {}", e);
        }

        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }
        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

fn invalid_range(option: &str, value: &str) -> TrackloadError {
    TrackloadError::InvalidRange {
        option: format!("`configuration.{}`", option),
        value: value.to_string(),
        detail: format!(
            "`configuration.{}` must be formatted as \"{{min}}-{{max}}\".",
            option
        ),
    }
}

fn delay_range(option: &str, value: &str) -> Result<(Duration, Duration), TrackloadError> {
    let (min, max) =
        util::parse_timespan_range(value).ok_or_else(|| invalid_range(option, value))?;
    if min > max {
        return Err(TrackloadError::InvalidRange {
            option: format!("`configuration.{}`", option),
            value: value.to_string(),
            detail: "min must not exceed max.".to_string(),
        });
    }
    Ok((min, max))
}
