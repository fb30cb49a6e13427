//! # Trackload
//!
//! Trackload generates synthetic web-analytics tracking traffic, to find out how much
//! load a [Matomo](https://matomo.org/) compatible tracking collector can take.
//!
//! A population of virtual users browses a simulated news site. Each virtual user has
//! a visitor identity, runs sessions of several page views, and between page views
//! sometimes scrolls, plays videos, sees and clicks ads, or shares articles. Every
//! action is sent to the tracker as one tracking request. The number of running virtual
//! users follows a [`RampPlan`](ramp::RampPlan) of linear stages.
//!
//! While the simulation runs, every request is measured. When it ends, the collected
//! metrics are compared against pass/fail [`ThresholdRule`](threshold::ThresholdRule)s.
//!
//! ## Running a simulation
//!
//! Trackload ships with a binary that accepts all run-time options:
//!
//! ```bash
//! $ trackload --host http://localhost/matomo.php --stages "1m,200;5m,200;1m,0" \
//!     --default-thresholds --report-file report.json
//! ```
//!
//! The same simulation can be configured programmatically:
//!
//! ```rust,no_run
//! use trackload::prelude::*;
//!
//! fn main() -> Result<(), TrackloadError> {
//!     let report = Simulation::initialize()?
//!         .set_default(TrackloadDefault::Host, "http://localhost/matomo.php")?
//!         .set_default(TrackloadDefault::Stages, "1m,200;5m,200;1m,0")?
//!         .set_default(TrackloadDefault::Threshold, "http_req_duration:p(95)<350")?
//!         .execute()?;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```
//!
//! Run-time options always take precedence over programmatic defaults.
//!
//! ## Pacing
//!
//! Two pacing profiles are available. The `realistic` profile (the default) pauses 5 to
//! 15 seconds between actions and 30 to 60 seconds between sessions, and keeps one
//! visitor identity per virtual user. The `aggressive` profile pauses 50 to 150
//! milliseconds and starts every session as a new visitor. Any range can be overridden
//! with `--think-time`, `--session-gap` and `--session-length`.
//!
//! ## Exit codes
//!
//! - `0`: all thresholds passed, or none were configured
//! - `99`: at least one threshold failed
//! - `1`: the simulation could not start

#[macro_use]
extern crate log;

pub mod action;
pub mod behavior;
pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod pacer;
pub mod prelude;
pub mod ramp;
pub mod report;
pub mod session;
pub mod threshold;
mod user;
pub mod util;

use chrono::Utc;
use gumdrop::Options;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::action::ActionGenerator;
use crate::behavior::{BehaviorModel, BehaviorWeights};
use crate::config::{TrackloadConfiguration, TrackloadDefaults};
use crate::dispatcher::{Dispatcher, HttpDispatcher};
use crate::metrics::MetricsAggregator;
use crate::pacer::Pacer;
use crate::ramp::{RampHistory, RampStepAction};
use crate::report::{PopulationSample, SimulationReport};
use crate::threshold::evaluate_all;
use crate::user::{UserCommand, UserContext, VirtualUser};

/// How often the scheduler compares the running population with the ramp plan.
const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// How often the population is sampled for the report.
const POPULATION_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// An enumeration of all errors a [`Simulation`] can return.
#[derive(Debug)]
pub enum TrackloadError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Failed to parse the tracker endpoint or page host.
    InvalidHost {
        /// The invalid host that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid behavior weights specified.
    InvalidWeight {
        /// The weighted table with invalid weights.
        table: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid range specified, such as a minimum above its maximum.
    InvalidRange {
        /// The option configured with an invalid range.
        option: String,
        /// The invalid range.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A threshold rule that can't be parsed or evaluated.
    InvalidThreshold {
        /// The invalid threshold rule.
        threshold: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`Simulation`] has no ramp stages defined.
    NoStages {
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl TrackloadError {
    fn describe(&self) -> &str {
        match *self {
            TrackloadError::Io(_) => "io::Error",
            TrackloadError::Reqwest(_) => "reqwest::Error",
            TrackloadError::InvalidHost { .. } => "failed to parse host",
            TrackloadError::InvalidOption { .. } => "invalid option or value specified",
            TrackloadError::InvalidWeight { .. } => "invalid weight specified",
            TrackloadError::InvalidRange { .. } => "invalid range specified",
            TrackloadError::InvalidThreshold { .. } => "invalid threshold specified",
            TrackloadError::NoStages { .. } => "no ramp stages defined",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for TrackloadError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TrackloadError::Io(ref source) => {
                write!(f, "TrackloadError: {} ({})", self.describe(), source)
            }
            TrackloadError::Reqwest(ref source) => {
                write!(f, "TrackloadError: {} ({})", self.describe(), source)
            }
            TrackloadError::InvalidHost {
                ref host,
                ref parse_error,
                ..
            } => write!(
                f,
                "TrackloadError: {} ({}: {})",
                self.describe(),
                host,
                parse_error
            ),
            TrackloadError::InvalidOption { ref detail, .. }
            | TrackloadError::InvalidRange { ref detail, .. } => {
                write!(f, "TrackloadError: {} ({})", self.describe(), detail)
            }
            TrackloadError::InvalidWeight {
                ref table,
                ref detail,
            } => write!(
                f,
                "TrackloadError: {} ({}: {})",
                self.describe(),
                table,
                detail
            ),
            TrackloadError::InvalidThreshold {
                ref threshold,
                ref detail,
            } => write!(
                f,
                "TrackloadError: {} ({}: {})",
                self.describe(),
                threshold,
                detail
            ),
            TrackloadError::NoStages { ref detail } => {
                write!(f, "TrackloadError: {} ({})", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for TrackloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            TrackloadError::Io(ref source) => Some(source),
            TrackloadError::Reqwest(ref source) => Some(source),
            TrackloadError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for TrackloadError {
    fn from(err: reqwest::Error) -> TrackloadError {
        TrackloadError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for TrackloadError {
    fn from(err: io::Error) -> TrackloadError {
        TrackloadError::Io(err)
    }
}


/// A virtual user launched by the scheduler.
struct RunningUser {
    number: usize,
    sender: flume::Sender<UserCommand>,
    task: JoinHandle<()>,
    /// When the user was told to finish its session.
    retired_at: Option<Instant>,
}
impl RunningUser {
    // Stop the user immediately, abandoning any request in flight.
    fn cancel(self) -> JoinHandle<()> {
        let _ = self.sender.send(UserCommand::Exit);
        self.task.abort();
        self.task
    }
}

/// The virtual users of a running simulation. Only the scheduler launches and stops
/// virtual users.
struct Population {
    context: Arc<UserContext>,
    seed: Option<u64>,
    launched: usize,
    /// Users generating traffic, in launch order.
    active: Vec<RunningUser>,
    /// Retired users completing their last session.
    draining: Vec<RunningUser>,
}
impl Population {
    fn new(context: Arc<UserContext>, seed: Option<u64>) -> Self {
        Population {
            context,
            seed,
            launched: 0,
            active: Vec::new(),
            draining: Vec::new(),
        }
    }

    fn launch(&mut self) {
        self.launched += 1;
        let number = self.launched;
        let user = match self.seed {
            Some(seed) => VirtualUser::with_rng(
                number,
                self.context.clone(),
                StdRng::seed_from_u64(seed.wrapping_add(number as u64)),
            ),
            None => VirtualUser::new(number, self.context.clone()),
        };
        let (sender, receiver) = flume::unbounded();
        let task = tokio::spawn(user::user_main(user, receiver));
        self.active.push(RunningUser {
            number,
            sender,
            task,
            retired_at: None,
        });
    }

    // The most recently launched user is retired first.
    fn retire(&mut self, now: Instant) {
        if let Some(mut user) = self.active.pop() {
            debug!("retiring user {}", user.number);
            let _ = user.sender.send(UserCommand::Finish);
            user.retired_at = Some(now);
            self.draining.push(user);
        }
    }

    fn retire_all(&mut self, now: Instant) {
        while !self.active.is_empty() {
            self.retire(now);
        }
    }

    /// Launch or retire users until `target` users are active.
    fn adjust(&mut self, target: usize, now: Instant) {
        while self.active.len() < target {
            self.launch();
        }
        while self.active.len() > target {
            self.retire(now);
        }
    }

    /// Forget users that completed their last session, and cancel those still running
    /// `graceful_ramp_down` after they were retired. Active users that stopped on their
    /// own are removed, so the next adjustment launches replacements.
    async fn reap(&mut self, now: Instant, graceful_ramp_down: Duration) {
        let mut stopped = Vec::new();
        let active = std::mem::take(&mut self.active);
        for user in active {
            if user.task.is_finished() {
                warn!("user {} stopped unexpectedly, replacing it", user.number);
                stopped.push(user);
            } else {
                self.active.push(user);
            }
        }

        let mut canceled = Vec::new();
        let draining = std::mem::take(&mut self.draining);
        for user in draining {
            let expired = user
                .retired_at
                .map_or(false, |retired_at| {
                    now.duration_since(retired_at) >= graceful_ramp_down
                });
            if user.task.is_finished() {
                stopped.push(user);
            } else if expired {
                info!(
                    "user {} still running after graceful ramp-down, canceling",
                    user.number
                );
                canceled.push(user.cancel());
            } else {
                self.draining.push(user);
            }
        }

        // A user that panicked only takes itself down, its requests stay recorded.
        for user in stopped {
            if let Err(e) = user.task.await {
                warn!("user {} failed: {}", user.number, e);
            }
        }
        // Canceled tasks resolve with a cancellation error, which is expected.
        futures::future::join_all(canceled).await;
    }

    /// Cancel every remaining user, returning their tasks.
    fn cancel_all(&mut self) -> Vec<JoinHandle<()>> {
        self.active
            .drain(..)
            .chain(self.draining.drain(..))
            .map(RunningUser::cancel)
            .collect()
    }

    fn sample(&self, elapsed: Duration, target: usize) -> PopulationSample {
        PopulationSample {
            elapsed_ms: elapsed.as_millis() as u64,
            target,
            active: self.active.len(),
            draining: self.draining.len(),
        }
    }
}

/// Global internal state for the simulation.
pub struct Simulation {
    /// Optional default values for run-time options.
    pub(crate) defaults: TrackloadDefaults,
    /// Configuration object holding options set when launching the simulation.
    pub(crate) configuration: TrackloadConfiguration,
    /// Behavior weights set programmatically, a weights file takes precedence.
    weights: Option<BehaviorWeights>,
    /// Replaces the HTTP dispatcher, if set.
    dispatcher: Option<Arc<dyn Dispatcher>>,
    /// Seeds the random number generator of every virtual user, if set.
    seed: Option<u64>,
}
/// Simulation configuration and execution.
impl Simulation {
    /// Load configuration from the command line, and initialize a [`Simulation`].
    ///
    /// Prints usage and exits if `-h` is passed.
    ///
    /// # Example
    /// ```rust
    /// use trackload::prelude::*;
    ///
    /// let simulation = Simulation::initialize();
    /// ```
    pub fn initialize() -> Result<Simulation, TrackloadError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let configuration = TrackloadConfiguration::parse_args_default(&args).map_err(|e| {
            TrackloadError::InvalidOption {
                option: "arguments".to_string(),
                value: args.join(" "),
                detail: e.to_string(),
            }
        })?;
        if configuration.help_requested() {
            println!("{}", TrackloadConfiguration::usage());
            std::process::exit(0);
        }
        Simulation::initialize_with_config(configuration)
    }

    /// Initialize a [`Simulation`] with an already loaded configuration.
    ///
    /// This is generally used by tests.
    ///
    /// # Example
    /// ```rust
    /// use trackload::Simulation;
    /// use trackload::config::TrackloadConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = TrackloadConfiguration::parse_args_default(&[
    ///     "--host",
    ///     "http://localhost/matomo.php",
    ///     "--stages",
    ///     "10s,5",
    /// ])
    /// .unwrap();
    /// let simulation = Simulation::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(
        configuration: TrackloadConfiguration,
    ) -> Result<Simulation, TrackloadError> {
        Ok(Simulation {
            defaults: TrackloadDefaults::default(),
            configuration,
            weights: None,
            dispatcher: None,
            seed: None,
        })
    }

    /// Replace the HTTP dispatcher, for example to send tracking requests somewhere
    /// other than an HTTP endpoint.
    pub fn set_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the behavior weights. A configured weights file takes precedence.
    pub fn set_behavior_weights(mut self, weights: BehaviorWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Seed the random number generators, making the generated actions of every
    /// virtual user reproducible.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Execute the [`Simulation`] on a new tokio runtime, and print the report.
    ///
    /// # Example
    /// ```rust,no_run
    /// use trackload::prelude::*;
    ///
    /// fn main() -> Result<(), TrackloadError> {
    ///     let report = Simulation::initialize()?
    ///         .set_default(TrackloadDefault::Host, "http://localhost/matomo.php")?
    ///         .set_default(TrackloadDefault::Stages, "10s,5;10s,0")?
    ///         .execute()?;
    ///     assert!(report.passed());
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn execute(mut self) -> Result<SimulationReport, TrackloadError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        self.configuration.configure(&self.defaults);
        self.configuration.validate()?;
        let print_metrics = !self.configuration.no_print_metrics;

        let rt = Runtime::new()?;
        let report = rt.block_on(self.simulate())?;

        if print_metrics {
            println!("{}", report);
        }
        Ok(report)
    }

    /// Run the [`Simulation`] on the current tokio runtime.
    pub async fn run(mut self) -> Result<SimulationReport, TrackloadError> {
        self.configuration.configure(&self.defaults);
        self.configuration.validate()?;
        self.simulate().await
    }

    // Build the shared state of all virtual users. Nothing runs yet, so configuration
    // errors are returned before any request is sent.
    fn user_context(
        &mut self,
        metrics: Arc<MetricsAggregator>,
    ) -> Result<Arc<UserContext>, TrackloadError> {
        let weights = self.configuration.behavior_weights(self.weights.take())?;
        let model = BehaviorModel::new(&weights)?;
        let dispatcher: Arc<dyn Dispatcher> = match self.dispatcher.take() {
            Some(dispatcher) => dispatcher,
            None => Arc::new(HttpDispatcher::new(
                &self.configuration.host,
                self.configuration.method.unwrap_or_default(),
                self.configuration.request_timeout()?,
                !self.configuration.expect_body.is_empty(),
            )?),
        };
        Ok(Arc::new(UserContext {
            generator: ActionGenerator::new(model, self.configuration.site_settings()),
            pacer: Pacer::new(
                self.configuration.think_time()?,
                self.configuration.session_gap()?,
            ),
            identity_policy: self.configuration.identity_policy(),
            session_settings: self.configuration.session_settings()?,
            dispatcher,
            metrics,
            expect_body: self.configuration.expect_body.clone(),
        }))
    }

    // Drive the population through the ramp plan, then let retired users finish.
    async fn simulate(mut self) -> Result<SimulationReport, TrackloadError> {
        let plan = self.configuration.ramp_plan()?;
        let thresholds = self.configuration.thresholds()?;
        let metrics = Arc::new(MetricsAggregator::new());
        let context = self.user_context(metrics.clone())?;
        info!(
            "simulating {} ({:?}) with up to {} users, pacing: {}, identity: {}",
            plan,
            plan.total_duration(),
            plan.max_target(),
            self.configuration.pacing_profile(),
            context.identity_policy,
        );

        let canceled = Arc::new(AtomicBool::new(false));
        util::setup_ctrlc_handler(&canceled);

        let started = Utc::now();
        let start = Instant::now();
        let mut population = Population::new(context, self.seed);
        let mut history: Vec<RampHistory> = Vec::new();
        let mut samples: Vec<PopulationSample> = Vec::new();
        let mut next_sample = start;
        let mut current_stage = None;
        let mut max_users = 0;
        let mut was_canceled = false;
        let mut drift_timer = start;

        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(start);
            if canceled.load(Ordering::SeqCst) {
                was_canceled = true;
                break;
            }
            let stage = match plan.stage_at(elapsed) {
                Some(stage) => stage,
                None => break,
            };
            if current_stage != Some(stage) {
                let action = plan.stage_action(stage);
                info!(
                    "stage {}: {:?} to {} users over {:?}",
                    stage + 1,
                    action,
                    plan.stages[stage].target,
                    plan.stages[stage].duration
                );
                history.push(RampHistory::step(
                    action,
                    population.active.len(),
                    Some(stage + 1),
                ));
                current_stage = Some(stage);
            }

            population.reap(now, plan.graceful_ramp_down).await;
            let target = plan.target_at(elapsed).round() as usize;
            population.adjust(target, now);
            max_users = max_users.max(population.active.len());

            if now >= next_sample {
                samples.push(population.sample(elapsed, target));
                next_sample += POPULATION_SAMPLE_INTERVAL;
            }
            drift_timer = util::sleep_minus_drift(SCHEDULER_TICK, drift_timer).await;
        }

        if was_canceled {
            history.push(RampHistory::step(
                RampStepAction::Canceling,
                population.active.len(),
                None,
            ));
            futures::future::join_all(population.cancel_all()).await;
        } else {
            let now = Instant::now();
            history.push(RampHistory::step(
                RampStepAction::Draining,
                population.active.len(),
                None,
            ));
            info!(
                "all stages complete, {} users finishing their session",
                population.active.len() + population.draining.len()
            );
            population.retire_all(now);

            // Every retired user is canceled once its graceful window expires.
            while !population.draining.is_empty() {
                let now = Instant::now();
                if canceled.load(Ordering::SeqCst) {
                    was_canceled = true;
                    history.push(RampHistory::step(RampStepAction::Canceling, 0, None));
                    break;
                }
                population.reap(now, plan.graceful_ramp_down).await;
                if now >= next_sample {
                    samples.push(population.sample(now.duration_since(start), 0));
                    next_sample += POPULATION_SAMPLE_INTERVAL;
                }
                drift_timer = util::sleep_minus_drift(SCHEDULER_TICK, drift_timer).await;
            }
        }

        // No sample is recorded after this point.
        metrics.seal();
        let duration = start.elapsed();
        futures::future::join_all(population.cancel_all()).await;
        samples.push(population.sample(duration, 0));
        history.push(RampHistory::step(RampStepAction::Finished, 0, None));
        info!("simulation finished after {:?}", duration);

        let summary = metrics.snapshot();
        let results = evaluate_all(&thresholds, &summary);
        for result in &results {
            if result.passed {
                info!("threshold passed: {}", result.rule);
            } else {
                warn!("threshold failed: {} ({:?})", result.rule, result.observed);
            }
        }

        let report = SimulationReport {
            started,
            stopped: Utc::now(),
            duration,
            max_users,
            canceled: was_canceled,
            metrics: summary,
            thresholds: results,
            history,
            population: samples,
        };

        if !self.configuration.report_file.is_empty() {
            report.write_json(&self.configuration.report_file).await?;
            info!("wrote report to {}", self.configuration.report_file);
        }

        Ok(report)
    }
}
