use std::io::Write;

use pvi::optimiser::OptimiserKind;
use pvi::{ClientConfig, PviError, Result, RunConfig, ServerConfig};
use tempfile::NamedTempFile;

fn json_file(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test]
fn run_config_from_partial_json() -> Result<()> {
    let file = json_file(
        r#"{
            "client": { "epochs": 7, "optimiser": "sgd", "optimiser_params": { "lr": 0.2 } },
            "server": { "max_iterations": 3, "damping_factor": 0.25 }
        }"#,
    )?;
    let config = RunConfig::from_json_file(file.path())?;

    assert_eq!(config.client.epochs, 7);
    assert_eq!(config.client.optimiser_kind()?, OptimiserKind::Sgd);
    assert_eq!(config.client.optimiser_params.lr, 0.2);
    assert_eq!(config.client.batch_size, ClientConfig::default().batch_size);
    assert_eq!(config.server.max_iterations, Some(3));
    assert_eq!(config.server.damping_factor, 0.25);
    assert!(!config.server.stop_when_exhausted);
    Ok(())
}

#[test]
fn out_of_range_values_are_rejected() -> Result<()> {
    let file = json_file(r#"{ "damping_factor": 1.5 }"#)?;
    assert!(matches!(
        ServerConfig::from_json_file(file.path()),
        Err(PviError::Config(_))
    ));

    let file = json_file(r#"{ "optimiser": "RMSprop" }"#)?;
    assert!(matches!(
        ClientConfig::from_json_file(file.path()),
        Err(PviError::Config(_))
    ));

    let file = json_file(r#"{ "client": { "batch_size": 0 } }"#)?;
    assert!(matches!(
        RunConfig::from_json_file(file.path()),
        Err(PviError::Config(_))
    ));
    Ok(())
}

#[test]
fn malformed_json_is_reported() -> Result<()> {
    let file = json_file("{ not json")?;
    assert!(matches!(
        RunConfig::from_json_file(file.path()),
        Err(PviError::Json(_))
    ));
    assert!(matches!(
        RunConfig::from_json_file("/nonexistent/pvi.json"),
        Err(PviError::Io(_))
    ));
    Ok(())
}

#[test]
fn configs_round_trip_through_json() -> Result<()> {
    let config = RunConfig {
        server: ServerConfig {
            max_iterations: Some(9),
            ..Default::default()
        },
        ..Default::default()
    };
    let file = json_file(&serde_json::to_string(&config)?)?;
    assert_eq!(RunConfig::from_json_file(file.path())?, config);
    Ok(())
}
