use std::io::Write;

use anyhow::Result;
use attention::core::config::{ENV_DISABLE_DROPOUT, ENV_PINV_ITERS};
use attention::{AttentionConfig, AttentionError, AttentionKind, AttentionLayer, NystromConfig};
use candle_core::Device;
use tempfile::NamedTempFile;

fn write_config(suffix: &str, contents: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test]
fn loads_nystrom_config_from_toml() -> Result<()> {
    let file = write_config(
        ".toml",
        r#"
            n_head = 4
            n_feat = 16
            n_attn = 16
            dtype = "f32"

            [kind]
            type = "nystrom"
            n_landmarks = 4
            d_kernel = 3
            pinv_iterations = 8
        "#,
    )?;

    let config = AttentionConfig::from_path(file.path())?;

    let mut expected = NystromConfig::new(4, 3);
    expected.pinv_iterations = 8;
    assert_eq!(config.kind, AttentionKind::Nystrom(expected));
    let layer = AttentionLayer::from_config(&config, &Device::Cpu)?;
    assert_eq!(layer.kind_name(), "nystrom");
    Ok(())
}

#[test]
fn loads_standard_config_from_json() -> Result<()> {
    let file = write_config(
        ".json",
        r#"{"n_head": 2, "n_feat": 8, "n_attn": 8, "dropout_rate": 0.1}"#,
    )?;

    let config = AttentionConfig::from_path(file.path())?;

    assert_eq!(config, AttentionConfig::standard(2, 8, 8, 0.1));
    Ok(())
}

#[test]
fn invalid_files_are_reported_before_construction() -> Result<()> {
    let even_kernel = write_config(
        ".toml",
        r#"
            n_head = 4
            n_feat = 16
            n_attn = 16

            [kind]
            type = "nystrom"
            n_landmarks = 4
            d_kernel = 4
        "#,
    )?;
    let err = AttentionConfig::from_path(even_kernel.path()).unwrap_err();
    assert!(matches!(err, AttentionError::Config(_)), "{err}");

    let garbage = write_config(".json", "{ not json")?;
    let err = AttentionConfig::from_path(garbage.path()).unwrap_err();
    assert!(matches!(err, AttentionError::ConfigFormat(_)), "{err}");

    let yaml = write_config(".yaml", "n_head: 4")?;
    let err = AttentionConfig::from_path(yaml.path()).unwrap_err();
    assert!(matches!(err, AttentionError::ConfigFormat(_)), "{err}");

    let err = AttentionConfig::from_path("/nonexistent/attention.toml").unwrap_err();
    assert!(matches!(err, AttentionError::Io(_)), "{err}");
    Ok(())
}

// The only test in this binary that touches the process environment.
#[test]
fn environment_overrides_iterations_and_dropout() {
    std::env::set_var(ENV_PINV_ITERS, "12");
    std::env::set_var(ENV_DISABLE_DROPOUT, "1");

    let mut nystrom = AttentionConfig::nystrom(4, 16, 16, 4, 3);
    nystrom.apply_env_overrides();
    let mut standard = AttentionConfig::standard(4, 16, 16, 0.2);
    standard.apply_env_overrides();

    std::env::remove_var(ENV_PINV_ITERS);
    std::env::remove_var(ENV_DISABLE_DROPOUT);

    match nystrom.kind {
        AttentionKind::Nystrom(cfg) => assert_eq!(cfg.pinv_iterations, 12),
        AttentionKind::Standard => panic!("kind changed"),
    }
    assert_eq!(standard.dropout_rate, 0.0);
    assert_eq!(standard.kind, AttentionKind::Standard);
}
