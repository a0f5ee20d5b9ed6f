use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn backoff_doubles_and_caps_at_max_delay() {
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(1_000),
        max_attempts: 10,
        max_duration: Duration::from_secs(60),
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
    assert_eq!(policy.delay_for(64), Duration::from_millis(1_000));
}

#[test]
fn hub_url_switches_http_scheme_to_websocket() {
    let settings = Settings {
        server_url: "https://chat.example.com".into(),
        ..Settings::default()
    };
    assert_eq!(
        settings.hub_url().expect("hub url").as_str(),
        "wss://chat.example.com/hubs/chat"
    );

    let settings = Settings {
        server_url: "http://127.0.0.1:9000".into(),
        hub_path: "/ws".into(),
        ..Settings::default()
    };
    assert_eq!(
        settings.hub_url().expect("hub url").as_str(),
        "ws://127.0.0.1:9000/ws"
    );
}

#[test]
fn rejects_non_http_server_urls() {
    let settings = Settings {
        server_url: "ftp://files.example.com".into(),
        ..Settings::default()
    };
    assert!(settings.hub_url().is_err());
    assert!(settings.api_url().is_err());
}

#[test]
fn env_overrides_take_precedence_and_ignore_garbage() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("SYNC_SERVER_URL", "http://legacy:1"),
        ("APP__SERVER_URL", "http://primary:2"),
        ("APP__PAGE_SIZE", "50"),
        ("APP__TYPING_WINDOW_MS", "not-a-number"),
        ("APP__OUTBOUND_QUEUE_CAPACITY", "0"),
    ]);
    let mut settings = Settings::default();
    settings.apply_env(|key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.server_url, "http://primary:2");
    assert_eq!(settings.page_size, 50);
    assert_eq!(settings.typing_window, Duration::from_secs(3));
    assert_eq!(settings.outbound, OutboundPolicy::FailFast);
}

#[test]
fn file_settings_are_layered_over_defaults() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("sync_core_config_test_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp root");
    let path = temp_root.join("sync.toml");
    fs::write(
        &path,
        "server_url = \"https://feed.example.com\"\nreconnect_max_attempts = 3\noutbound_queue_capacity = 8\n",
    )
    .expect("write settings");

    let file = load_file_settings(&path)
        .expect("parse settings")
        .expect("file present");
    let mut settings = Settings::default();
    settings.apply_file(file);

    assert_eq!(settings.server_url, "https://feed.example.com");
    assert_eq!(settings.reconnect.max_attempts, 3);
    assert_eq!(settings.outbound, OutboundPolicy::Queue { capacity: 8 });
    assert_eq!(settings.page_size, 20);

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn missing_settings_file_is_not_an_error() {
    let path = env::temp_dir().join("sync_core_config_test_definitely_missing.toml");
    assert!(load_file_settings(&path).expect("missing is ok").is_none());
}
