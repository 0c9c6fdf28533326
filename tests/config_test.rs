use sparkq::config::Config;
use sparkq::config::secrets::ExposeSecret as _;
use sparkq::error::Error;

// Environment variables are process-wide, so every env-driven case lives in
// this one test to keep them from racing each other.
#[test]
fn config_from_env() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("custom.toml");
    std::fs::write(
        &settings_path,
        "project_name = \"demo\"\n\n[runner]\npoll_interval_secs = 2\n",
    )
    .unwrap();

    unsafe {
        std::env::set_var("SPARKQ_CONFIG", &settings_path);
        std::env::set_var("SPARKQ_DB", dir.path().join("q.db"));
        std::env::set_var("SPARKQ_LOCK_DIR", dir.path().join("locks"));
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test-key");
        std::env::remove_var("OTEL_ENDPOINT");
        std::env::remove_var("LOG_LEVEL");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.database_path, dir.path().join("q.db"));
    assert_eq!(config.lock_dir, dir.path().join("locks"));
    assert_eq!(config.log_level, "info");
    assert!(config.otel_endpoint.is_none());
    assert_eq!(config.settings.project_name, "demo");
    assert_eq!(config.settings.runner.poll_interval_secs, 2);
    assert_eq!(config.settings.watchdog.fail_multiplier, 2.0);
    assert_eq!(
        config.require_api_key().unwrap().expose_secret(),
        "sk-test-key"
    );
    assert!(!format!("{config:?}").contains("sk-test-key"));

    // Set but empty is a mistake, not a request for the default.
    unsafe { std::env::set_var("SPARKQ_DB", "") };
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));
    unsafe { std::env::remove_var("SPARKQ_DB") };

    // Invalid settings fail fast.
    std::fs::write(
        &settings_path,
        "[watchdog]\nwarn_multiplier = 2.0\nfail_multiplier = 1.5\n",
    )
    .unwrap();
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    // Missing settings file named explicitly is an error too.
    unsafe { std::env::set_var("SPARKQ_CONFIG", dir.path().join("absent.toml")) };
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));
    unsafe { std::env::remove_var("SPARKQ_CONFIG") };

    // Without a key, config loads but model invocation is refused.
    unsafe { std::env::remove_var("ANTHROPIC_API_KEY") };
    let config = Config::from_env().unwrap();
    assert_eq!(config.database_path.to_str(), Some("sparkq.db"));
    assert!(matches!(config.require_api_key(), Err(Error::Config(_))));

    unsafe { std::env::remove_var("SPARKQ_LOCK_DIR") };
}
