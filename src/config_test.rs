use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::error::ConfigError;
use crate::models::{AuthMode, ReachabilityScope};
use crate::pipeline::consumer::{StartingPosition, Thresholds};

fn env(vars: &[(&str, &str)]) -> Vec<(String, String)> {
    vars.iter().map(|(key, val)| (key.to_string(), val.to_string())).collect()
}

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(env(&[
        ("RUST_LOG", "error"),
        ("CLUSTER_NAME", "telemetry"),
        ("BROKER_COUNT", "3"),
        ("SUBNETS", "subnet-a,subnet-b,subnet-c"),
        ("AUTH_MODES", "sasl_iam,mutual_tls"),
        ("CERTIFICATE_AUTHORITY_ARN", "arn:sim:acm-pca:authority/ca"),
        ("CONNECTIVITY_SCOPE", "public"),
        ("PRODUCER_AUTH_MODE", "mutual_tls"),
        ("ALERT_MIN_THRESHOLD", "10.5"),
        ("ALERT_MAX_THRESHOLD", "40"),
        ("POLL_INITIAL_INTERVAL_MS", "250"),
        ("POLL_DEADLINE_SECONDS", "120"),
        ("CONSUMER_STARTING_POSITION", "latest"),
        ("CONSUMER_TIME_BUDGET_SECONDS", "60"),
        ("ARCHIVE_PATH", "/tmp/sensorstream/archive"),
    ]))?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}", config.rust_log);
    assert!(config.cluster_name == "telemetry", "unexpected value parsed for CLUSTER_NAME, got {}", config.cluster_name);
    assert!(config.broker_count == 3, "unexpected value parsed for BROKER_COUNT, got {}", config.broker_count);
    assert!(config.subnets.len() == 3, "unexpected value parsed for SUBNETS, got {:?}", config.subnets);
    assert!(
        config.auth_modes == vec![AuthMode::SaslIam, AuthMode::MutualTls],
        "unexpected value parsed for AUTH_MODES, got {:?}",
        config.auth_modes
    );
    assert!(
        config.connectivity().scope == ReachabilityScope::Public,
        "unexpected value parsed for CONNECTIVITY_SCOPE, got {}",
        config.connectivity().scope
    );
    assert!(
        config.producer_auth_mode == AuthMode::MutualTls && config.consumer_auth_mode == AuthMode::SaslIam,
        "unexpected actor auth modes, got producer {} and consumer {}",
        config.producer_auth_mode,
        config.consumer_auth_mode
    );
    assert_eq!(config.thresholds()?, Thresholds { min: 10.5, max: 40.0 }, "unexpected thresholds");

    let policy = config.backoff_policy();
    assert_eq!(policy.initial_interval, Duration::from_millis(250), "unexpected initial poll interval");
    assert_eq!(policy.deadline, Duration::from_secs(120), "unexpected poll deadline");

    let trigger = config.trigger_settings();
    assert_eq!(trigger.starting_position, StartingPosition::Latest, "unexpected starting position");
    assert_eq!(trigger.time_budget, Duration::from_secs(60), "unexpected consumer time budget");
    assert!(config.archive_path == "/tmp/sensorstream/archive", "unexpected value parsed for ARCHIVE_PATH, got {}", config.archive_path);
    Ok(())
}

#[test]
fn config_defaults_describe_a_valid_deployment() -> Result<()> {
    let config: Config = envy::from_iter(Vec::<(String, String)>::new())?;
    config.validate()?;

    assert_eq!(config.input_topic, "kfp_sensor_topic", "unexpected default input topic");
    assert_eq!(config.sink_topic, "kfp_sns_topic", "unexpected default sink topic");
    assert_eq!(config.thresholds()?, Thresholds { min: 27.0, max: 32.0 }, "unexpected default thresholds");
    assert_eq!(config.auth_modes, vec![AuthMode::SaslIam], "unexpected default auth modes");
    assert_eq!(config.producer_interval(), Duration::from_secs(300), "unexpected default producer interval");
    assert_eq!(config.trigger_settings().starting_position, StartingPosition::TrimHorizon);
    assert_eq!(config.trigger_settings().time_budget, Duration::from_secs(300));
    Ok(())
}

#[test]
fn invalid_cluster_spec_is_rejected() -> Result<()> {
    let config: Config = envy::from_iter(env(&[("BROKER_COUNT", "3"), ("SUBNETS", "subnet-a,subnet-b")]))?;
    match config.validate() {
        Err(err) if err.downcast_ref::<ConfigError>().is_some() => Ok(()),
        Err(err) => bail!("expected a configuration error, got {:?}", err),
        Ok(()) => bail!("expected broker count not divisible by subnets to be rejected"),
    }
}

#[test]
fn mutual_tls_requires_a_certificate_authority() -> Result<()> {
    let config: Config = envy::from_iter(env(&[("AUTH_MODES", "sasl_iam,mutual_tls")]))?;
    assert!(config.validate().is_err(), "expected mutual_tls without a certificate authority to be rejected");
    Ok(())
}

#[test]
fn inverted_thresholds_are_rejected() -> Result<()> {
    let config: Config = envy::from_iter(env(&[("ALERT_MIN_THRESHOLD", "40"), ("ALERT_MAX_THRESHOLD", "30")]))?;
    assert!(config.thresholds().is_err(), "expected inverted thresholds to be rejected");
    assert!(config.validate().is_err(), "expected validation to fail on inverted thresholds");
    Ok(())
}

#[test]
fn zero_and_inverted_intervals_are_rejected() -> Result<()> {
    let cases: &[&[(&str, &str)]] = &[
        &[("PRODUCER_INTERVAL_SECONDS", "0")],
        &[("CONSUMER_TIME_BUDGET_SECONDS", "0")],
        &[("POLL_INITIAL_INTERVAL_MS", "0")],
        &[("POLL_INITIAL_INTERVAL_MS", "5000"), ("POLL_MAX_INTERVAL_MS", "1000")],
    ];
    for case in cases {
        let config: Config = envy::from_iter(env(case))?;
        match config.validate() {
            Err(err) if err.downcast_ref::<ConfigError>().is_some() => (),
            Err(err) => bail!("expected a configuration error for {:?}, got {:?}", case, err),
            Ok(()) => bail!("expected {:?} to be rejected", case),
        }
    }

    let config: Config = envy::from_iter(env(&[("POLL_INITIAL_INTERVAL_MS", "1000"), ("POLL_MAX_INTERVAL_MS", "1000")]))?;
    config.validate()?;
    Ok(())
}

#[tokio::test]
async fn cluster_spec_reads_server_properties() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp")?;
    let path = dir.path().join("server.properties");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(b"auto.create.topics.enable=true\nlog.retention.hours=8\n")?;

    let path_str = path.to_string_lossy().to_string();
    let config: Config = envy::from_iter(env(&[
        ("CLUSTER_CONFIGURATION_NAME", "sensor-config"),
        ("CLUSTER_CONFIGURATION_REVISION", "2"),
        ("SERVER_PROPERTIES_PATH", path_str.as_str()),
    ]))?;
    let spec = config.cluster_spec().await?;

    let cfg = match spec.configuration {
        Some(cfg) => cfg,
        None => bail!("expected a cluster configuration"),
    };
    assert_eq!(cfg.name, "sensor-config", "unexpected configuration name");
    assert_eq!(cfg.revision, 2, "unexpected configuration revision");
    assert!(cfg.server_properties.contains("auto.create.topics.enable=true"), "unexpected server properties {}", cfg.server_properties);
    Ok(())
}

#[tokio::test]
async fn missing_server_properties_file_is_an_error() -> Result<()> {
    let config: Config = envy::from_iter(env(&[
        ("CLUSTER_CONFIGURATION_NAME", "sensor-config"),
        ("SERVER_PROPERTIES_PATH", "/tmp/sensorstream-does-not-exist/server.properties"),
    ]))?;
    assert!(config.cluster_spec().await.is_err(), "expected an error reading a missing properties file");
    Ok(())
}
