//! Config loading and route-law checks against the public API.

use qqbridge::config::{Config, InterruptPolicy, ResolvePrefer};
use qqbridge::route::{is_valid_qq_route, normalize_target, parse_target, session_key};
use tempfile::TempDir;

const SAMPLE: &str = r#"
workspace_dir = "/var/lib/qqbridge/workspace"

[reliability]
component_initial_backoff_secs = 2
component_max_backoff_secs = 30

[automation]
enabled = true
reconcile_interval_ms = 120000
strict_agent_only = true

[[automation.targets]]
id = "morning-checkin"
route = "user:2151539153"

[automation.targets.job]
type = "cron-agent-turn"
message = "早上好，问候一下"

[automation.targets.job.schedule]
kind = "cron"
expr = "*/30 9-22 * * *"
tz = "Asia/Shanghai"

[automation.targets.job.smart]
enabled = true
minSilenceMinutes = 30
activeConversationMinutes = 25

[[accounts]]
account_id = "qq-main"
ws_url = "ws://127.0.0.1:3001"
access_token = "secret-token"
owner_user_id = "2151539153"
admins = ["2151539153"]
allowed_groups = ["100001"]
enable_deduplication = true
require_mention = true
keyword_triggers = ["小助手"]
interrupt_policy = "adaptive"
reply_run_timeout_ms = 600000

[accounts.aggregate]
window_ms = 900
dm_window_ms = 600

[accounts.send]
base_delay_ms = 1000
jitter_ms = 400
max_retries = 3

[accounts.inbound_media]
resolve_prefer = "napcat-first"
http_timeout_ms = 8000
http_retries = 2
max_per_message = 8

[accounts.tasks]
max_runtime_ms = 120000
max_retries = 1
max_concurrency = 1

[accounts.proactive_dm]
enabled = true
route = "user:2151539153"
"#;

#[test]
fn full_sample_config_loads() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("qqbridge.toml");
    std::fs::write(&path, SAMPLE).unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.accounts.len(), 1);
    let account = &config.accounts[0];
    assert_eq!(account.interrupt_policy, InterruptPolicy::Adaptive);
    assert_eq!(account.inbound_media.resolve_prefer, ResolvePrefer::NapcatFirst);
    assert_eq!(account.aggregate.window_for("user:1"), 600);
    assert_eq!(account.aggregate.window_for("group:1"), 900);
    assert!(account.proactive_dm.enabled);

    assert_eq!(config.automation.targets.len(), 1);
    let target = &config.automation.targets[0];
    assert_eq!(target.id, "morning-checkin");
    let smart = target.job.smart.as_ref().unwrap();
    assert_eq!(smart.min_silence_minutes, 30);
    assert_eq!(smart.active_conversation_minutes, 25);
}

#[test]
fn invalid_automation_route_is_rejected_at_load() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("qqbridge.toml");
    let bad = SAMPLE.replace("route = \"user:2151539153\"\n\n[automation.targets.job]", "route = \"user:12\"\n\n[automation.targets.job]");
    std::fs::write(&path, bad).unwrap();
    assert!(Config::load(&path).is_err());
}

#[test]
fn normalize_is_idempotent_for_all_forms() {
    for raw in [
        "user:2151539153",
        "group:100001",
        "guild:g1:c2",
        "channel:private:2151539153",
        "session:qq:user:2151539153",
        "2151539153",
    ] {
        let once = normalize_target(raw);
        assert_eq!(normalize_target(&once), once, "raw={raw}");
    }
}

#[test]
fn parse_of_normalize_recovers_route() {
    for route in ["user:2151539153", "group:100001", "guild:g-1:c.2"] {
        let target = parse_target(&normalize_target(route)).unwrap();
        assert_eq!(target.route(), route);
    }
}

#[test]
fn session_keys_are_stable_per_route() {
    assert_eq!(
        session_key("user:2151539153", Some("2151539153")).as_deref(),
        Some("agent:main:main")
    );
    assert_eq!(
        session_key("user:2151539153", None).as_deref(),
        Some("agent:qq-user-2151539153:main")
    );
    assert!(!is_valid_qq_route("session:qq:user:2151539153"));
    assert!(is_valid_qq_route(&normalize_target(
        "session:qq:user:2151539153"
    )));
}
