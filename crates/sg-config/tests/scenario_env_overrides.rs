use sg_config::{DataPlaneConfig, ENV_DATABASE_URL};

/// `SG_*` variables overlay the defaults; malformed numeric values fail
/// with an error naming the variable (never a secret value).
///
/// All environment mutation lives in this one test so parallel test
/// binaries never race on process environment.
#[test]
fn scenario_env_overrides() {
    std::env::set_var(ENV_DATABASE_URL, "postgres://sg:pw@db:5432/router");
    std::env::set_var("SG_LOG_BATCH_SIZE", "250");
    std::env::set_var("SG_AUTH_CACHE_TTL_SECS", "0");

    let mut cfg = DataPlaneConfig::default();
    cfg.apply_env_overrides().expect("valid overrides");
    assert_eq!(cfg.database_url, "postgres://sg:pw@db:5432/router");
    assert_eq!(cfg.log_batch_size, 250);
    // Non-positive TTLs are accepted here; the cache applies the fallback.
    assert_eq!(cfg.auth_cache_ttl_secs, 0);
    // Untouched options keep their defaults.
    assert_eq!(cfg.max_conns, 10);
    cfg.validate().expect("config with DSN validates");

    std::env::set_var("SG_DB_MAX_CONNS", "not-a-number");
    let err = cfg.apply_env_overrides().expect_err("bad integer rejected");
    assert!(format!("{err:#}").contains("SG_DB_MAX_CONNS"));

    std::env::remove_var(ENV_DATABASE_URL);
    std::env::remove_var("SG_LOG_BATCH_SIZE");
    std::env::remove_var("SG_AUTH_CACHE_TTL_SECS");
    std::env::remove_var("SG_DB_MAX_CONNS");
}
