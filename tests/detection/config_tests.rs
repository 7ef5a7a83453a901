use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use cardguard::common::config::DetectorConfig;
use cardguard::common::exception::DetectorError;
use cardguard::detection::{Detector, Dimensions};
use tempfile::NamedTempFile;

use crate::common::clock::MockTimeSource;
use crate::common::logger::init_test_logger;

#[test]
fn detector_runs_from_config_file() {
    init_test_logger();
    let mut file = assert_ok!(NamedTempFile::new());
    writeln!(
        file,
        r#"
operation = "AttachInstrument"
dimensions = ["DeviceId"]

[policy]
root_min_observations = 10
leaf_min_observations = 3
"#
    )
    .unwrap();

    let config = assert_ok!(DetectorConfig::load(file.path()), "loading config file");
    assert_eq!(config.operation, "AttachInstrument");
    assert_eq!(config.policy.leaf_failure_percent, 85);

    let detector = assert_ok!(Detector::with_time_source(
        config,
        Arc::new(MockTimeSource::new())
    ));
    let good = Dimensions::from([("DeviceId".to_string(), "phone".to_string())]);
    let bad = Dimensions::from([("DeviceId".to_string(), "emulator".to_string())]);
    for _ in 0..10 {
        detector.add_data(&good, false);
    }
    for _ in 0..3 {
        detector.add_data(&bad, true);
    }

    let flagged = detector.is_card_testing(&bad, &["unrelated-flight"]);
    assert_eq!(flagged.into_iter().collect::<Vec<_>>(), vec!["DeviceId"]);
    assert_eq!(detector.stats().children.len(), 1);
}

#[test]
fn missing_config_file_is_an_io_error() {
    let result = DetectorConfig::load(Path::new("/nonexistent/cardguard.toml"));
    assert_err!(result, "missing config file");
    assert!(matches!(result, Err(DetectorError::ConfigIo(_))));
}

#[test]
fn invalid_values_in_file_are_rejected() {
    let mut file = assert_ok!(NamedTempFile::new());
    writeln!(file, "window_buckets = 0").unwrap();

    assert!(matches!(
        DetectorConfig::load(file.path()),
        Err(DetectorError::InvalidConfig(_))
    ));
}
