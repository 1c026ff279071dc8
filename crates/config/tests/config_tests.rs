//! Tests for configuration loading and validation.

use triad_config::Config;

const FULL_CONFIG: &str = r#"
[chain]
chain_id = 7
data_proto_ver = "1.2.0"
consensus_proto_ver = "1.0.0"

[consensus]
epoch_ms = 20000
min_num_validators = 3
max_consensus_states = 10
ntp_probe_interval_epochs = 100
max_time_adjustment_ms = 500

[network]
max_outbound = 8
max_inbound = 32
message_window_ms = 600000
handshake_timeout_ms = 10000

[logging]
level = "info"

[lightweight]
strict_state_proof = true
strict_sharding_rules = true

[genesis]
timestamp = 1700000000000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000aa"
stake = 100000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000ab"
stake = 100000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000ac"
stake = 100000
"#;

#[test]
fn full_config_parses_and_validates() {
    let config = Config::from_toml(FULL_CONFIG).unwrap();
    assert_eq!(config.chain.chain_id, 7);
    assert_eq!(config.consensus.epoch_ms, 20_000);
    assert_eq!(config.genesis.validators.len(), 3);
    assert_eq!(config.genesis.total_stake(), 300_000);
    assert!(!config.sharding.reporting_enabled());
}

#[test]
fn defaults_fill_missing_sections() {
    let config = Config::from_toml(
        r#"
[genesis]
timestamp = 1700000000000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000aa"
stake = 1

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000ab"
stake = 1

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000ac"
stake = 1
"#,
    )
    .unwrap();
    assert_eq!(config.chain.chain_id, 1);
    assert!(config.lightweight.strict_state_proof);
    assert_eq!(config.consensus.max_consensus_states, 10);
}

#[test]
fn rejects_too_few_validators() {
    let err = Config::from_toml(
        r#"
[genesis]
timestamp = 1700000000000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000aa"
stake = 1
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("minimum"));
}

#[test]
fn rejects_duplicate_validator() {
    let err = Config::from_toml(
        r#"
[consensus]
min_num_validators = 1

[genesis]
timestamp = 1700000000000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000aa"
stake = 1

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000aa"
stake = 2
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn rejects_bad_semver() {
    let err = Config::from_toml(
        r#"
[chain]
data_proto_ver = "not-a-version"

[consensus]
min_num_validators = 1

[genesis]
timestamp = 1700000000000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000aa"
stake = 1
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("semver"));
}

#[test]
fn rejects_sharding_endpoint_without_path() {
    let err = Config::from_toml(
        r#"
[consensus]
min_num_validators = 1

[sharding]
parent_chain_endpoint = "http://parent:8545"

[genesis]
timestamp = 1700000000000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000aa"
stake = 1
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("sharding_path"));
}

#[test]
fn whitelist_is_address_ordered() {
    let config = Config::from_toml(
        r#"
[consensus]
min_num_validators = 1

[genesis]
timestamp = 1700000000000

[[genesis.validators]]
address = "0x00000000000000000000000000000000000000ff"
stake = 5

[[genesis.validators]]
address = "0x0000000000000000000000000000000000000001"
stake = 7
"#,
    )
    .unwrap();
    let whitelist = config.genesis.whitelist();
    let addrs: Vec<_> = whitelist.keys().map(|a| a.to_hex()).collect();
    assert_eq!(
        addrs,
        vec![
            "0x0000000000000000000000000000000000000001",
            "0x00000000000000000000000000000000000000ff"
        ]
    );
}
