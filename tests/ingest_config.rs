// tests/ingest_config.rs
use dugtrio_trends::config::{load_config_default, load_config_from, PipelineConfig};
use std::{env, fs};

#[test]
fn parse_toml_and_json_paths() {
    let dir = tempfile::tempdir().unwrap();

    let p_toml = dir.path().join("pipeline.toml");
    fs::write(
        &p_toml,
        r#"
rate_limit_calls = 1
worker_pool_size = 8
default_assets = [" bonk ", "", "$WIF"]
"#,
    )
    .unwrap();
    let c = load_config_from(&p_toml).unwrap();
    assert_eq!(c.rate_limit_calls, 1);
    assert_eq!(c.worker_pool_size, 8);
    assert_eq!(c.default_assets, vec!["BONK".to_string(), "WIF".to_string()]);
    assert_eq!(c.trend_window_secs, PipelineConfig::default().trend_window_secs);

    let p_json = dir.path().join("pipeline.json");
    fs::write(&p_json, r#"{"scoring_max_retries": 0, "fetch_limit": 50}"#).unwrap();
    let cj = load_config_from(&p_json).unwrap();
    assert_eq!(cj.fetch_limit, 50);
    assert!(cj.scoring_max_retries >= 1);
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("pipeline.toml");
    fs::write(&p, "rate_limit_calls = \"many\"").unwrap();
    assert!(load_config_from(&p).is_err());
    assert!(load_config_from(&dir.path().join("missing.toml")).is_err());
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    // Run from an empty dir so the repo's own config/ is not picked up.
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var("PIPELINE_CONFIG_PATH");

    // 1) nothing on disk: built-in defaults
    let c = load_config_default().unwrap();
    assert_eq!(c.default_assets, PipelineConfig::default().default_assets);

    // 2) ./config/pipeline.json
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(cfg_dir.join("pipeline.json"), r#"{"fetch_limit": 20}"#).unwrap();
    assert_eq!(load_config_default().unwrap().fetch_limit, 20);

    // 3) TOML wins over JSON
    fs::write(cfg_dir.join("pipeline.toml"), "fetch_limit = 30").unwrap();
    assert_eq!(load_config_default().unwrap().fetch_limit, 30);

    // 4) env var wins over both
    let p_env = tmp.path().join("custom.toml");
    fs::write(&p_env, "fetch_limit = 40").unwrap();
    env::set_var("PIPELINE_CONFIG_PATH", p_env.display().to_string());
    assert_eq!(load_config_default().unwrap().fetch_limit, 40);

    // 5) env var pointing nowhere is an error, not a silent fallback
    env::set_var("PIPELINE_CONFIG_PATH", tmp.path().join("nope.toml").display().to_string());
    assert!(load_config_default().is_err());
    env::remove_var("PIPELINE_CONFIG_PATH");

    env::set_current_dir(&old).unwrap();
}
