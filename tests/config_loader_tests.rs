use powergate::config::{ConfigLoader, MinerSelectorStrategy};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const KEYS: &[&str] = &[
    "POWERGATE_PROFILE",
    "POWERGATE_HEALTH_BIND_ADDR",
    "POWERGATE_LOG_LEVEL",
    "POWERGATE_LOTUS_TOKEN",
    "POWERGATE_SCHEDULER_MAX_PARALLEL_STORAGE",
    "POWERGATE_FAULTS_INDEX_ENABLED",
    "POWERGATE_MINER_SELECTOR_STRATEGY",
    "POWERGATE_MINER_SELECTOR_SR2_URL",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    for key in KEYS {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.health_bind_addr, "0.0.0.0:6060");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.scheduler.max_parallel_storage, 4);
    assert!(!cfg.faults_index.enabled);
    assert_eq!(cfg.miner_selector.strategy, MinerSelectorStrategy::Reptop);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "POWERGATE_HEALTH_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "POWERGATE_HEALTH_BIND_ADDR=192.168.0.10:5000\nPOWERGATE_SCHEDULER_MAX_PARALLEL_STORAGE=8\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "POWERGATE_HEALTH_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "POWERGATE_PROFILE=test\nPOWERGATE_HEALTH_BIND_ADDR=127.0.0.1:4000\nPOWERGATE_FAULTS_INDEX_ENABLED=true\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.health_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.scheduler.max_parallel_storage, 8);
    assert!(cfg.faults_index.enabled);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "POWERGATE_HEALTH_BIND_ADDR=127.0.0.1:3000\nPOWERGATE_LOTUS_TOKEN=file-token\n",
    );

    unsafe {
        env::set_var("POWERGATE_HEALTH_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("POWERGATE_LOTUS_TOKEN", "env-token");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.health_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.lotus.token.as_deref(), Some("env-token"));

    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("env-token"));

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("POWERGATE_HEALTH_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid health bind address"));

    clear_env();
}

#[test]
fn sr2_strategy_requires_bucket_url() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("POWERGATE_MINER_SELECTOR_STRATEGY", "sr2");
    }
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("sr2 without url should fail");
    assert!(format!("{}", err).contains("SR2_URL"));

    unsafe {
        env::set_var(
            "POWERGATE_MINER_SELECTOR_SR2_URL",
            "https://example.com/buckets.json",
        );
    }
    let cfg = loader.load().expect("sr2 with url loads");
    assert_eq!(cfg.miner_selector.strategy, MinerSelectorStrategy::Sr2);

    unsafe {
        env::set_var("POWERGATE_MINER_SELECTOR_STRATEGY", "random");
    }
    assert!(loader.load().is_err());

    clear_env();
}
