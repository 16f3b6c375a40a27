//! Sessions opened with `Session::new` follow the environment
//!
//! Kept in its own test binary: it mutates process-wide environment
//! variables, so nothing else may run alongside it.

use arbiter_core::{ArbiterConfig, Registry, Session};
use tempfile::TempDir;

#[test]
fn test_session_new_uses_configured_lock_dir() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_dir = temp_dir.path().join("config");
    let file_dir = temp_dir.path().join("from-file");
    let env_dir = temp_dir.path().join("from-env");
    let key = format!("env-test-{}", std::process::id());

    std::fs::create_dir_all(&config_dir).unwrap();
    let config = ArbiterConfig::default().with_lock_dir(&file_dir);
    std::fs::write(config_dir.join("config.toml"), config.to_toml().unwrap()).unwrap();

    // SAFETY: this is the only test in this binary
    unsafe {
        std::env::set_var("ARBITER_CONFIG_DIR", &config_dir);
        std::env::remove_var("ARBITER_LOCK_DIR");
    }

    // The config file names the registry
    {
        let mut session = Session::new("file", key.as_str()).unwrap();
        assert!(session.start().unwrap());
        let record = Registry::open(&file_dir).unwrap().read(&key).unwrap();
        assert_eq!(record.as_ref(), session.record());
        session.stop().unwrap();
    }

    // ARBITER_LOCK_DIR overrides the file
    unsafe {
        std::env::set_var("ARBITER_LOCK_DIR", &env_dir);
    }
    let mut holder = Session::new("env", key.as_str()).unwrap();
    assert!(holder.start().unwrap());
    let record = Registry::open(&env_dir).unwrap().read(&key).unwrap();
    assert_eq!(record.as_ref(), holder.record());
    assert_eq!(Registry::open(&file_dir).unwrap().read(&key).unwrap(), None);

    // A second session in the same environment is excluded
    let mut contender = Session::new("contender", key.as_str()).unwrap();
    assert!(!contender.start().unwrap());
    holder.stop().unwrap();
    assert!(contender.start().unwrap());
    contender.stop().unwrap();

    // An invalid config file is reported rather than ignored
    std::fs::write(config_dir.join("config.toml"), "poll_interval_ms = 0\n").unwrap();
    let err = Session::new("broken", key.as_str()).unwrap_err();
    assert_eq!(err.code(), "E304");

    unsafe {
        std::env::remove_var("ARBITER_LOCK_DIR");
        std::env::remove_var("ARBITER_CONFIG_DIR");
    }
}
