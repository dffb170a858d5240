use super::*;
use std::io::Write;

#[test]
fn defaults_match_sync_policy() {
    let settings = SyncSettings::default();
    assert_eq!(settings.sync_interval(), Duration::from_secs(900));
    assert_eq!(settings.max_retries, 5);
    assert_eq!(settings.refresh_timeout(), Duration::from_secs(10));
    assert_eq!(settings.max_auth_chain, 3);
    assert_eq!(settings.retry_policy().stale_after, Duration::from_secs(300));
    settings.validate().expect("defaults are valid");
}

#[test]
fn file_and_env_layers_override_defaults() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("tempfile");
    writeln!(
        file,
        "api_base_url = \"https://api.example.test/v1\"\nmax_retries = 3\nuser_id = \"u1\""
    )
    .expect("write");

    let env = HashMap::from([
        ("APP__MAX_RETRIES".to_string(), "7".to_string()),
        (
            "APP__DATABASE_URL".to_string(),
            "sqlite::memory:".to_string(),
        ),
    ]);
    let settings = load_settings_with_env(Some(file.path()), Some(env)).expect("load");

    assert_eq!(settings.api_base_url, "https://api.example.test/v1");
    assert_eq!(settings.max_retries, 7);
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(settings.user_id.as_deref(), Some("u1"));
    assert_eq!(settings.reconnect_max_ms, 30_000);
}

#[test]
fn retry_backoff_doubles_from_one_second() {
    let policy = RetryPolicy::default();
    let delays: Vec<_> = (0..5).map(|n| policy.backoff_for(n).as_millis()).collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
}

#[test]
fn reconnect_delay_is_capped_at_thirty_seconds() {
    let policy = ReconnectPolicy::default();
    let delays: Vec<_> = (0..7).map(|n| policy.delay_for(n).as_millis()).collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    assert_eq!(policy.delay_for(64), Duration::from_secs(30));
}

#[test]
fn websocket_url_follows_api_scheme() {
    let secure = api_base_url("https://api.example.test").expect("base");
    assert_eq!(ws_url(&secure).expect("ws").as_str(), "wss://api.example.test/ws");

    let nested = api_base_url("http://127.0.0.1:8080/api/v1").expect("base");
    assert_eq!(nested.as_str(), "http://127.0.0.1:8080/api/v1/");
    assert_eq!(
        ws_url(&nested).expect("ws").as_str(),
        "ws://127.0.0.1:8080/api/v1/ws"
    );

    assert!(api_base_url("ftp://example.test").is_err());
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite:data/test.db"), "sqlite://data/test.db");
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), SyncSettings::default().database_url);
}
