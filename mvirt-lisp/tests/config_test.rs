use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use mvirt_lisp::config::{Config, ConfigError};

const FULL: &str = r#"
tun_name = "lisp1"
source_rloc = "192.0.2.1"
map_resolvers = ["192.0.2.100", "192.0.2.101"]
map_servers = ["192.0.2.200"]
proxy_reply = true

[timers]
tick_ms = 250
map_request_timeout_secs = 3
map_request_attempts = 5
negative_ttl_secs = 30
map_register_interval_secs = 90
expire_interval_secs = 2
register_ttl_minutes = 60

[[database]]
eid_prefix = "10.0.0.0/24"
locators = [
    { address = "192.0.2.1", priority = 1, weight = 50 },
    { address = "192.0.2.2", priority = 1, weight = 50 },
]

[[database]]
eid_prefix = "2001:db8:1::/48"
locators = [{ address = "2001:db8::1", priority = 2, weight = 100 }]
"#;

#[test]
fn test_load_full_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.tun_name, "lisp1");
    assert_eq!(config.source_rloc, "192.0.2.1".parse::<IpAddr>().unwrap());
    assert_eq!(config.map_resolvers.len(), 2);
    assert_eq!(config.map_servers.len(), 1);
    assert!(config.proxy_reply);

    assert_eq!(config.timers.tick, Duration::from_millis(250));
    assert_eq!(config.timers.request_timeout, Duration::from_secs(3));
    assert_eq!(config.timers.max_attempts, 5);
    assert_eq!(config.timers.negative_ttl, Duration::from_secs(30));
    assert_eq!(config.timers.register_interval, Duration::from_secs(90));
    assert_eq!(config.timers.expire_interval, Duration::from_secs(2));
    assert_eq!(config.timers.register_ttl_minutes, 60);

    assert_eq!(config.database.len(), 2);
    assert_eq!(config.database[0].locators.len(), 2);
    assert_eq!(config.database[1].prefix.to_string(), "2001:db8:1::/48");
}

#[test]
fn test_missing_file() {
    let err = Config::load(Path::new("/nonexistent/mvirt-lisp.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_syntax_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"map_resolvers = [").unwrap();

    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_entry_without_locators() {
    let content = FULL.replace(
        r#"locators = [{ address = "2001:db8::1", priority = 2, weight = 100 }]"#,
        "locators = []",
    );
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::NoLocators(p) if p == "2001:db8:1::/48"));
}

#[test]
fn test_zero_tick_rejected() {
    let content = FULL.replace("tick_ms = 250", "tick_ms = 0");
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::ZeroTimer("tick_ms")));
}

#[test]
fn test_missing_map_server() {
    let content = FULL.replace(r#"map_servers = ["192.0.2.200"]"#, "map_servers = []");
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::NoMapServer));
}

#[test]
fn test_oversized_attempt_count_rejected() {
    let content = FULL.replace("map_request_attempts = 5", "map_request_attempts = 4294967295");
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::TooManyAttempts(4294967295)));
}

#[test]
fn test_oversized_timers_rejected() {
    let content = FULL.replace("negative_ttl_secs = 30", "negative_ttl_secs = 9223372036854775807");
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::TimerTooLarge {
            name: "negative_ttl_secs",
            ..
        }
    ));

    let content = FULL.replace("tick_ms = 250", "tick_ms = 3600000");
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(err, ConfigError::TimerTooLarge { name: "tick_ms", .. }));
}

#[test]
fn test_too_many_locators_rejected() {
    let locators: Vec<String> = (0..256)
        .map(|i| format!(r#"{{ address = "2001:db8::{i:x}" }}"#))
        .collect();
    let content = FULL.replace(
        r#"locators = [{ address = "2001:db8::1", priority = 2, weight = 100 }]"#,
        &format!("locators = [{}]", locators.join(", ")),
    );
    let err = Config::parse(&content).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::TooManyLocators { count: 256, .. }
    ));
}
