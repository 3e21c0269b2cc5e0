use rim_weighting::config::ConfigLoader;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

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
    unsafe {
        env::remove_var("RIM_WEIGHTING_PROFILE");
        env::remove_var("RIM_WEIGHTING_LOG_LEVEL");
        env::remove_var("RIM_WEIGHTING_MAX_ITERATIONS");
        env::remove_var("RIM_WEIGHTING_GROUP_CONCURRENCY");
        env::remove_var("RIM_WEIGHTING_BUCKET_FACTOR");
        env::remove_var("RIM_WEIGHTING_REQUIRE_CONVERGENCE");
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
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.weighting.max_iterations, 50);
    assert_eq!(cfg.weighting.max_quota_cells, 2_000_000);
    assert!((cfg.weighting.convergence_tolerance - 0.00005).abs() < 1e-12);
    assert!(!cfg.weighting.require_convergence);
    assert_eq!(cfg.distribution.max_buckets, 40);
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "RIM_WEIGHTING_MAX_ITERATIONS=20\n");
    write_env_file(&temp_dir, ".env.test", "RIM_WEIGHTING_MAX_ITERATIONS=30\n");
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "RIM_WEIGHTING_MAX_ITERATIONS=40\nRIM_WEIGHTING_BUCKET_FACTOR=0.5\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "RIM_WEIGHTING_PROFILE=test\nRIM_WEIGHTING_MAX_ITERATIONS=25\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.weighting.max_iterations, 40);
    assert!((cfg.distribution.bucket_factor - 0.5).abs() < 1e-12);
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
        "RIM_WEIGHTING_GROUP_CONCURRENCY=2\nRIM_WEIGHTING_REQUIRE_CONVERGENCE=false\n",
    );

    unsafe {
        env::set_var("RIM_WEIGHTING_GROUP_CONCURRENCY", "8");
        env::set_var("RIM_WEIGHTING_REQUIRE_CONVERGENCE", "true");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.weighting.group_concurrency, 8);
    assert!(cfg.weighting.require_convergence);

    clear_env();
}

#[test]
fn zero_group_concurrency_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RIM_WEIGHTING_GROUP_CONCURRENCY", "0");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("zero workers should fail");
    assert!(format!("{}", err).contains("group concurrency"));

    clear_env();
}

#[test]
fn unparseable_values_fall_back_to_defaults() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RIM_WEIGHTING_MAX_ITERATIONS", "lots");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("bad numbers are ignored");
    assert_eq!(cfg.weighting.max_iterations, 50);

    clear_env();
}
