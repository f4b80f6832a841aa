//! Admin operations over the configured automation targets.
//!
//! Backs the `qqbridge targets` CLI: list, upsert, disable, remove, audit,
//! the per-target health probe, and the one-shot agent-only migration.

use super::{AutomationTarget, ExecutionMode, Schedule};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// JSON summary of all targets, one row per target.
pub fn list_targets(targets: &[AutomationTarget]) -> Value {
    let rows: Vec<Value> = targets
        .iter()
        .map(|target| {
            let cron = match &target.job.schedule {
                Schedule::Cron { expr, .. } => expr.clone(),
                Schedule::Every { every_ms } => format!("every:{every_ms}ms"),
                Schedule::At { at } => format!("at:{at}"),
            };
            json!({
                "id": target.id,
                "enabled": target.enabled,
                "route": target.route,
                "cron": cron,
                "executionMode": match target.execution_mode {
                    ExecutionMode::AgentOnly => "agent-only",
                    ExecutionMode::LegacyDeliver => "legacy-deliver",
                },
            })
        })
        .collect();
    json!({ "targets": rows })
}

/// Insert or replace a target by id. Returns `"created"` or `"updated"`.
pub fn upsert_target(targets: &mut Vec<AutomationTarget>, item: AutomationTarget) -> &'static str {
    for existing in targets.iter_mut() {
        if existing.id == item.id {
            *existing = item;
            return "updated";
        }
    }
    targets.push(item);
    "created"
}

pub fn disable_target(targets: &mut [AutomationTarget], target_id: &str) -> bool {
    for target in targets.iter_mut() {
        if target.id == target_id {
            target.enabled = false;
            return true;
        }
    }
    false
}

pub fn remove_target(targets: &mut Vec<AutomationTarget>, target_id: &str) -> bool {
    let before = targets.len();
    targets.retain(|target| target.id != target_id);
    targets.len() != before
}

/// Force every target to agent-only execution. Returns the change count.
pub fn migrate_agent_only(targets: &mut [AutomationTarget]) -> usize {
    let mut changed = 0;
    for target in targets.iter_mut() {
        if target.execution_mode != ExecutionMode::AgentOnly {
            target.execution_mode = ExecutionMode::AgentOnly;
            changed += 1;
        }
    }
    changed
}

/// Meta dir for a route, preferring a still-unmigrated legacy direct-form
/// directory so the probe never mutates the tree.
fn route_meta_dir(workspace_root: &Path, route: &str) -> PathBuf {
    let direct = workspace_root.join("qq_sessions").join(route).join("meta");
    if direct.exists() {
        return direct;
    }
    workspace_root
        .join("qq_sessions")
        .join(crate::route::route_dir_name(route))
        .join("meta")
}

fn preview_fields(value: &Value, keys: &[&str]) -> Value {
    let mut preview = serde_json::Map::new();
    for key in keys {
        if let Some(field) = value.get(key) {
            preview.insert((*key).to_string(), field.clone());
        }
    }
    Value::Object(preview)
}

/// Read-only health probe for one target: selection by id, else route, else
/// the first configured target; then check the persisted automation state
/// under the route's meta dir.
pub fn verify_target(
    targets: &[AutomationTarget],
    workspace_root: &Path,
    target_id: Option<&str>,
    route: Option<&str>,
) -> Value {
    let selected = if let Some(target_id) = target_id {
        targets.iter().find(|t| t.id == target_id)
    } else if let Some(route) = route {
        targets.iter().find(|t| t.route == route)
    } else {
        targets.first()
    };
    let Some(selected) = selected else {
        return json!({
            "ok": false,
            "error": "target_not_found",
            "targetId": target_id,
            "route": route,
        });
    };

    let meta = route_meta_dir(workspace_root, &selected.route);
    let latest_path = meta.join("automation-latest.json");
    let ndjson_path = meta.join("automation-state.ndjson");

    let mut latest_exists = false;
    let mut latest_fields_ok = false;
    let mut latest_preview = json!({});
    if let Ok(raw) = std::fs::read_to_string(&latest_path) {
        if let Ok(states) = serde_json::from_str::<Value>(&raw) {
            latest_exists = true;
            if let Some(state) = states.get(&selected.id) {
                const REQUIRED: &[&str] = &[
                    "lastTriggeredAtMs",
                    "lastSentAtMs",
                    "nextEligibleAtMs",
                    "lastRunResult",
                ];
                latest_fields_ok = REQUIRED.iter().all(|key| state.get(key).is_some());
                latest_preview = preview_fields(
                    state,
                    &[
                        "lastTriggeredAtMs",
                        "lastSentAtMs",
                        "nextEligibleAtMs",
                        "lastRunResult",
                        "lastSkipReason",
                        "lastError",
                    ],
                );
            }
        }
    }

    // Most recent state line for this target.
    let ndjson_exists = ndjson_path.exists();
    let last_state_line = std::fs::read_to_string(&ndjson_path)
        .ok()
        .and_then(|raw| {
            raw.lines()
                .filter_map(|line| serde_json::from_str::<Value>(line).ok())
                .filter(|line| {
                    line.get("targetId").and_then(Value::as_str) == Some(selected.id.as_str())
                })
                .last()
        })
        .map(|line| preview_fields(&line, &["at", "targetId", "triggered", "produced", "skipped", "note"]))
        .unwrap_or_else(|| json!(null));

    json!({
        "ok": true,
        "target": {
            "id": selected.id,
            "enabled": selected.enabled,
            "route": selected.route,
            "executionMode": match selected.execution_mode {
                ExecutionMode::AgentOnly => "agent-only",
                ExecutionMode::LegacyDeliver => "legacy-deliver",
            },
            "schedule": serde_json::to_value(&selected.job.schedule).unwrap_or(Value::Null),
        },
        "checks": {
            "agentOnly": selected.execution_mode == ExecutionMode::AgentOnly,
            "metaDir": meta.display().to_string(),
            "automationLatestExists": latest_exists,
            "automationLatestRequiredFields": latest_fields_ok,
            "automationStateNdjsonExists": ndjson_exists,
        },
        "latestPreview": latest_preview,
        "lastStateLine": last_state_line,
    })
}

/// Configuration audit: execution-mode, route validity, schedule sanity.
pub fn audit_targets(targets: &[AutomationTarget]) -> Value {
    let mut issues: Vec<Value> = Vec::new();
    for target in targets {
        if target.execution_mode != ExecutionMode::AgentOnly {
            issues.push(json!({"id": target.id, "issue": "executionMode_not_agent_only"}));
        }
        if !crate::route::is_valid_qq_route(&target.route) {
            issues.push(json!({"id": target.id, "issue": "invalid_route"}));
        }
        match &target.job.schedule {
            Schedule::Cron { expr, .. } => {
                if super::normalize_cron_expr(expr).is_err() {
                    issues.push(json!({"id": target.id, "issue": "invalid_cron_expr"}));
                }
            }
            Schedule::Every { every_ms } => {
                if *every_ms < 60_000 {
                    issues.push(json!({"id": target.id, "issue": "every_ms_below_minimum"}));
                }
            }
            Schedule::At { at } => {
                if chrono::DateTime::parse_from_rfc3339(at).is_err() {
                    issues.push(json!({"id": target.id, "issue": "invalid_at_instant"}));
                }
            }
        }
        if let Some(smart) = &target.job.smart {
            if let Some(max_chars) = smart.max_chars {
                if !(8..=200).contains(&max_chars) {
                    issues.push(json!({"id": target.id, "issue": "max_chars_out_of_range"}));
                }
            }
        }
    }
    json!({ "targetCount": targets.len(), "issues": issues })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationJob;

    fn target(id: &str, route: &str) -> AutomationTarget {
        AutomationTarget {
            id: id.to_string(),
            enabled: true,
            route: route.to_string(),
            execution_mode: ExecutionMode::AgentOnly,
            job: AutomationJob {
                job_type: "cron-agent-turn".into(),
                schedule: Schedule::Cron {
                    expr: "0 9 * * *".into(),
                    tz: None,
                },
                message: "check in".into(),
                thinking: None,
                model: None,
                timeout_seconds: None,
                smart: None,
            },
        }
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut targets = vec![target("a", "user:1001")];
        assert_eq!(upsert_target(&mut targets, target("b", "user:1002")), "created");
        let mut replacement = target("a", "user:1003");
        replacement.enabled = false;
        assert_eq!(upsert_target(&mut targets, replacement), "updated");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].route, "user:1003");
        assert!(!targets[0].enabled);
    }

    #[test]
    fn disable_and_remove() {
        let mut targets = vec![target("a", "user:1001"), target("b", "user:1002")];
        assert!(disable_target(&mut targets, "a"));
        assert!(!targets[0].enabled);
        assert!(!disable_target(&mut targets, "missing"));

        assert!(remove_target(&mut targets, "b"));
        assert_eq!(targets.len(), 1);
        assert!(!remove_target(&mut targets, "b"));
    }

    #[test]
    fn migrate_forces_agent_only() {
        let mut targets = vec![target("a", "user:1001"), target("b", "user:1002")];
        targets[1].execution_mode = ExecutionMode::LegacyDeliver;
        assert_eq!(migrate_agent_only(&mut targets), 1);
        assert_eq!(migrate_agent_only(&mut targets), 0);
    }

    #[test]
    fn audit_flags_problems() {
        let mut bad = target("bad", "not-a-route");
        bad.execution_mode = ExecutionMode::LegacyDeliver;
        bad.job.schedule = Schedule::Every { every_ms: 1_000 };
        let report = audit_targets(&[target("ok", "user:1001"), bad]);
        let issues = report["issues"].as_array().unwrap();
        let kinds: Vec<&str> = issues.iter().map(|i| i["issue"].as_str().unwrap()).collect();
        assert!(kinds.contains(&"executionMode_not_agent_only"));
        assert!(kinds.contains(&"invalid_route"));
        assert!(kinds.contains(&"every_ms_below_minimum"));
        assert_eq!(report["targetCount"], 2);
    }

    #[test]
    fn list_renders_summary_rows() {
        let listing = list_targets(&[target("a", "user:1001")]);
        assert_eq!(listing["targets"][0]["id"], "a");
        assert_eq!(listing["targets"][0]["cron"], "0 9 * * *");
        assert_eq!(listing["targets"][0]["executionMode"], "agent-only");
    }

    #[test]
    fn verify_reports_target_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let report = verify_target(&[], tmp.path(), None, None);
        assert_eq!(report["ok"], false);
        assert_eq!(report["error"], "target_not_found");

        let report = verify_target(
            &[target("a", "user:1001")],
            tmp.path(),
            Some("missing"),
            None,
        );
        assert_eq!(report["error"], "target_not_found");
    }

    #[test]
    fn verify_selects_by_id_then_route_then_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let targets = vec![target("a", "user:1001"), target("b", "user:1002")];

        let by_id = verify_target(&targets, tmp.path(), Some("b"), None);
        assert_eq!(by_id["target"]["id"], "b");

        let by_route = verify_target(&targets, tmp.path(), None, Some("user:1002"));
        assert_eq!(by_route["target"]["id"], "b");

        let first = verify_target(&targets, tmp.path(), None, None);
        assert_eq!(first["target"]["id"], "a");
    }

    #[test]
    fn verify_flags_missing_state_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let report = verify_target(&[target("a", "user:1001")], tmp.path(), Some("a"), None);
        assert_eq!(report["ok"], true);
        assert_eq!(report["checks"]["agentOnly"], true);
        assert_eq!(report["checks"]["automationLatestExists"], false);
        assert_eq!(report["checks"]["automationLatestRequiredFields"], false);
        assert_eq!(report["checks"]["automationStateNdjsonExists"], false);
        assert!(report["lastStateLine"].is_null());
    }

    #[test]
    fn verify_reads_back_persisted_state() {
        use crate::automation::TargetState;
        use crate::store::{append_ndjson, write_json_atomic};
        use std::collections::HashMap;

        let tmp = tempfile::TempDir::new().unwrap();
        let meta = tmp
            .path()
            .join("qq_sessions")
            .join("user__1001")
            .join("meta");

        let mut states: HashMap<String, TargetState> = HashMap::new();
        states.insert(
            "a".to_string(),
            TargetState {
                last_triggered_at_ms: Some(1_000),
                last_sent_at_ms: Some(1_100),
                next_eligible_at_ms: None,
                last_run_result: Some("ok".to_string()),
                last_skip_reason: None,
                last_error: None,
                last_cron_bucket: Some("202608021000".to_string()),
            },
        );
        write_json_atomic(&meta.join("automation-latest.json"), &states).unwrap();
        append_ndjson(
            &meta.join("automation-state.ndjson"),
            &json!({
                "at": "2026-08-02T10:00:10Z",
                "targetId": "other",
                "triggered": true, "produced": false, "skipped": true,
                "note": "skip:active_conversation",
            }),
        )
        .unwrap();
        append_ndjson(
            &meta.join("automation-state.ndjson"),
            &json!({
                "at": "2026-08-02T10:30:05Z",
                "targetId": "a",
                "triggered": true, "produced": true, "skipped": false,
                "note": "fired",
            }),
        )
        .unwrap();

        let report = verify_target(&[target("a", "user:1001")], tmp.path(), Some("a"), None);
        assert_eq!(report["ok"], true);
        assert_eq!(report["checks"]["automationLatestExists"], true);
        assert_eq!(report["checks"]["automationLatestRequiredFields"], true);
        assert_eq!(report["checks"]["automationStateNdjsonExists"], true);
        assert_eq!(report["latestPreview"]["lastRunResult"], "ok");
        assert_eq!(report["latestPreview"]["lastTriggeredAtMs"], 1_000);
        // The newest line belonging to this target, not the file's last line
        // for another target.
        assert_eq!(report["lastStateLine"]["note"], "fired");
        assert_eq!(report["lastStateLine"]["targetId"], "a");
    }

    #[test]
    fn verify_prefers_legacy_direct_dir_when_present() {
        let tmp = tempfile::TempDir::new().unwrap();
        let legacy_meta = tmp.path().join("qq_sessions").join("user:1001").join("meta");
        std::fs::create_dir_all(&legacy_meta).unwrap();
        std::fs::write(legacy_meta.join("automation-state.ndjson"), b"").unwrap();

        let report = verify_target(&[target("a", "user:1001")], tmp.path(), Some("a"), None);
        assert_eq!(report["checks"]["automationStateNdjsonExists"], true);
        assert!(report["checks"]["metaDir"]
            .as_str()
            .unwrap()
            .contains("user:1001"));
    }
}
