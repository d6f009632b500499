// Configuration loading

use std::io::Write;
use tempfile::NamedTempFile;

use nockvault::config;

#[test]
fn test_shipped_config_parses() {
    let cfg = config::load_from_str(include_str!("../config.toml")).expect("shipped config parses");
    assert_eq!(cfg.fees.fee_rate, 1);
    assert_eq!(cfg.fees.min_fee, 256);
    assert_eq!(cfg.polling.acceptance_attempts, 15);
    assert_eq!(cfg.oracle.query_retry_attempts, 3);
    assert_eq!(cfg.metrics.bind, "0.0.0.0:9100");
}

#[test]
fn test_partial_config_uses_defaults() {
    let cfg = config::load_from_str("[fees]\nfee_rate = 3\n").expect("partial config");
    assert_eq!(cfg.fees.fee_rate, 3);
    assert_eq!(cfg.fees.min_fee, 256, "Missing keys take defaults");
    assert_eq!(cfg.storage.path, "./data");
    assert_eq!(cfg.polling.inclusion_budget().as_secs(), 1_800);

    let policy = cfg.fees.policy();
    assert_eq!(policy.fee_for_words(1_000), 3_000);

    let empty = config::load_from_str("").expect("empty config");
    assert_eq!(empty.oracle.signer_settle_ms, 500);
}

#[test]
fn test_load_from_file_and_errors() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "[storage]\npath = \"/tmp/vault\"").expect("write");
    let cfg = config::load(file.path()).expect("load");
    assert_eq!(cfg.storage.path, "/tmp/vault");

    let err = config::load("/definitely/not/here.toml").unwrap_err();
    assert!(format!("{err:#}").contains("couldn’t read config file"));

    assert!(config::load_from_str("[fees\nfee_rate = ").is_err());
}
