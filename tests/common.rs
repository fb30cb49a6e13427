use async_trait::async_trait;
use gumdrop::Options;
use httpmock::MockServer;
use std::sync::Mutex;
use std::time::Duration;

use trackload::config::TrackloadConfiguration;
use trackload::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The path of the mocked tracker endpoint.
#[allow(dead_code)]
pub const TRACKER_PATH: &str = "/matomo.php";

/// The following options are configured by default, if not set to a custom value:
///  --host <mock-server>/matomo.php
///  --stages 2s,2
///  --profile aggressive
///  --quiet
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> TrackloadConfiguration {
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.url(TRACKER_PATH);
    build_configuration_for(&server_url, custom)
}

/// Build a configuration for a simulation with a stub dispatcher, which never sends
/// anything to the configured host.
#[allow(dead_code)]
pub fn build_stub_configuration(custom: Vec<&str>) -> TrackloadConfiguration {
    build_configuration_for("http://tracker.invalid/matomo.php", custom)
}

fn build_configuration_for(host: &str, custom: Vec<&str>) -> TrackloadConfiguration {
    // Merge in all custom options first.
    let mut configuration: Vec<&str> = custom;

    // Default to the provided host if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", host]);
    }

    // Default to 2 users for 2 seconds if not otherwise configured.
    if !configuration.contains(&"--stages") {
        configuration.extend_from_slice(&["--stages", "2s,2"]);
    }

    // Default to fast pacing if not otherwise configured.
    if !configuration.contains(&"--profile") {
        configuration.extend_from_slice(&["--profile", "aggressive"]);
    }

    // Keep test output readable unless verbosity was requested.
    if !configuration.contains(&"--verbose") && !configuration.contains(&"-v") {
        configuration.push("--quiet");
    }

    // Parse these options to generate a TrackloadConfiguration.
    TrackloadConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// A dispatcher answering every request with the same response after a fixed latency,
/// remembering everything it received.
#[allow(dead_code)]
pub struct StubDispatcher {
    pub status_code: u16,
    pub latency: Duration,
    requests: Mutex<Vec<TrackingRequest>>,
}

#[allow(dead_code)]
impl StubDispatcher {
    pub fn new(status_code: u16, latency: Duration) -> Self {
        StubDispatcher {
            status_code,
            latency,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// All requests answered so far.
    pub fn requests(&self) -> Vec<TrackingRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn sent(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Dispatcher for StubDispatcher {
    async fn send(&self, request: &TrackingRequest) -> Result<DispatchResponse, DispatchError> {
        tokio::time::sleep(self.latency).await;
        self.requests.lock().unwrap().push(request.clone());
        Ok(DispatchResponse {
            status_code: self.status_code,
            latency: self.latency,
            body: String::new(),
        })
    }
}

/// The number of user-seconds a linear ramp plan amounts to, which times the action
/// rate of one user estimates the number of requests.
#[allow(dead_code)]
pub fn user_seconds(plan: &RampPlan) -> f64 {
    let mut previous = 0.0;
    let mut total = 0.0;
    for stage in &plan.stages {
        let target = stage.target as f64;
        total += (previous + target) / 2.0 * stage.duration.as_secs_f64();
        previous = target;
    }
    total
}
