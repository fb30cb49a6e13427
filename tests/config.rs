use gumdrop::Options;
use httpmock::MockServer;
use serial_test::serial;

mod common;

use trackload::config::TrackloadConfiguration;
use trackload::prelude::*;

// Configuration errors are returned before anything is sent.
fn execute_error(server: &MockServer, custom: Vec<&str>) -> TrackloadError {
    let tracker = server.mock(|when, then| {
        when.path(common::TRACKER_PATH);
        then.status(200);
    });
    let configuration = common::build_configuration(server, custom);
    let result = Simulation::initialize_with_config(configuration)
        .unwrap()
        .execute();
    assert_eq!(tracker.hits(), 0);
    match result {
        Ok(_) => panic!("expected a configuration error"),
        Err(e) => e,
    }
}

#[test]
#[serial]
fn test_no_stages() {
    let configuration =
        TrackloadConfiguration::parse_args_default(&["--host", "http://localhost/matomo.php"])
            .unwrap();
    let result = Simulation::initialize_with_config(configuration)
        .unwrap()
        .execute();
    assert!(matches!(result, Err(TrackloadError::NoStages { .. })));
}

#[test]
#[serial]
fn test_invalid_configuration() {
    let server = MockServer::start();

    let error = execute_error(&server, vec!["--stages", "10s,5;0s,5"]);
    assert!(matches!(error, TrackloadError::InvalidOption { ref option, .. } if option == "`configuration.stages`"));

    let error = execute_error(&server, vec!["--host", "not-a-url"]);
    assert!(matches!(error, TrackloadError::InvalidHost { .. }));

    let error = execute_error(&server, vec!["--think-time", "2s-1s"]);
    assert!(matches!(error, TrackloadError::InvalidRange { .. }));

    let error = execute_error(&server, vec!["--threshold", "http_reqs:p(95)<10"]);
    assert!(matches!(error, TrackloadError::InvalidThreshold { .. }));

    let error = execute_error(&server, vec!["-v", "-q"]);
    assert!(matches!(error, TrackloadError::InvalidOption { ref option, .. } if option == "`configuration.verbose`"));

    let error = execute_error(&server, vec!["--user-id-probability", "2"]);
    assert!(matches!(error, TrackloadError::InvalidOption { .. }));

    // Weights are validated before the first user starts.
    let path = std::env::temp_dir().join(format!(
        "trackload-bad-weights-{}.json",
        std::process::id()
    ));
    std::fs::write(&path, r#"{ "interaction_families": [] }"#).unwrap();
    let path_name = path.display().to_string();
    let error = execute_error(&server, vec!["--weights-file", &path_name]);
    assert!(matches!(error, TrackloadError::InvalidWeight { .. }));
    std::fs::remove_file(&path).unwrap();
}

#[test]
#[serial]
/// Programmatic defaults configure the simulation, run-time options win.
fn test_defaults() {
    let server = MockServer::start();
    let tracker = server.mock(|when, then| {
        when.path(common::TRACKER_PATH).query_param("idsite", "5");
        then.status(200);
    });

    let configuration = TrackloadConfiguration::parse_args_default(&["--site-id", "5"]).unwrap();
    let report = Simulation::initialize_with_config(configuration)
        .unwrap()
        .set_default(TrackloadDefault::Host, server.url(common::TRACKER_PATH).as_str())
        .unwrap()
        .set_default(TrackloadDefault::Stages, "1s,1;1s,1")
        .unwrap()
        .set_default(TrackloadDefault::Profile, PacingProfile::Aggressive)
        .unwrap()
        .set_default(TrackloadDefault::SiteId, 9)
        .unwrap()
        .set_default(TrackloadDefault::Threshold, "http_reqs:count>0")
        .unwrap()
        .set_default(TrackloadDefault::Quiet, 1)
        .unwrap()
        .set_default(TrackloadDefault::NoPrintMetrics, true)
        .unwrap()
        .execute()
        .unwrap();

    assert!(tracker.hits() > 0);
    assert_eq!(tracker.hits(), report.metrics.http_reqs);
    assert_eq!(report.thresholds.len(), 1);
    assert!(report.passed());
}
