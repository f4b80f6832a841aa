//! Route identifiers.
//!
//! A route is the immutable identity key for one conversation:
//! `user:<id>`, `group:<id>`, or `guild:<guild>:<channel>`. Everything
//! per-conversation — metadata, usage, traces, media — is keyed by it, so the
//! parse/validate functions here are the sole gate at every boundary.

use serde::{Deserialize, Serialize};

/// Typed view of a parsed route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    User { id: String },
    Group { id: String },
    Guild { guild_id: String, channel_id: String },
}

impl Target {
    /// Canonical route string for this target.
    pub fn route(&self) -> String {
        match self {
            Self::User { id } => format!("user:{id}"),
            Self::Group { id } => format!("group:{id}"),
            Self::Guild {
                guild_id,
                channel_id,
            } => format!("guild:{guild_id}:{channel_id}"),
        }
    }
}

fn is_qq_number(s: &str) -> bool {
    (5..=12).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_guild_id(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Parse a canonical route string into its typed form.
pub fn parse_target(route: &str) -> Option<Target> {
    if let Some(id) = route.strip_prefix("user:") {
        return is_qq_number(id).then(|| Target::User { id: id.to_string() });
    }
    if let Some(id) = route.strip_prefix("group:") {
        return is_qq_number(id).then(|| Target::Group { id: id.to_string() });
    }
    if let Some(rest) = route.strip_prefix("guild:") {
        let (guild_id, channel_id) = rest.split_once(':')?;
        if is_guild_id(guild_id) && is_guild_id(channel_id) {
            return Some(Target::Guild {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
            });
        }
        return None;
    }
    None
}

/// Sole validity gate for route-typed boundaries.
pub fn is_valid_qq_route(route: &str) -> bool {
    parse_target(route).is_some()
}

/// Collapse legacy target spellings into a canonical route.
///
/// Accepted legacy forms: `channel:private:<id>` / `channel:group:<id>`,
/// `session:qq:user:<id>` (and `group`/`guild`), and bare digit strings
/// (treated as a private user). Already-canonical routes pass through, so the
/// function is idempotent. Unrecognized input is returned trimmed but
/// untouched; validity is the caller's check via [`is_valid_qq_route`].
pub fn normalize_target(raw: &str) -> String {
    let raw = raw.trim();

    if let Some(rest) = raw.strip_prefix("channel:") {
        if let Some(id) = rest.strip_prefix("private:") {
            return format!("user:{id}");
        }
        if let Some(id) = rest.strip_prefix("group:") {
            return format!("group:{id}");
        }
    }

    if let Some(rest) = raw.strip_prefix("session:qq:") {
        if let Some(id) = rest.strip_prefix("user:") {
            return format!("user:{id}");
        }
        if let Some(id) = rest.strip_prefix("group:") {
            return format!("group:{id}");
        }
        if let Some(rest) = rest.strip_prefix("guild:") {
            return format!("guild:{rest}");
        }
    }

    if is_qq_number(raw) {
        return format!("user:{raw}");
    }

    raw.to_string()
}

/// The resident agent identity bound to a route. The configured owner's
/// private route always maps to `main`.
pub fn resident_agent_id(route: &str, owner_user_id: Option<&str>) -> Option<String> {
    match parse_target(route)? {
        Target::User { id } => {
            if owner_user_id == Some(id.as_str()) {
                Some("main".to_string())
            } else {
                Some(format!("qq-user-{id}"))
            }
        }
        Target::Group { id } => Some(format!("qq-group-{id}")),
        Target::Guild {
            guild_id,
            channel_id,
        } => Some(format!("qq-guild-{guild_id}-{channel_id}")),
    }
}

/// Canonical session key for a route's resident agent.
pub fn session_key(route: &str, owner_user_id: Option<&str>) -> Option<String> {
    resident_agent_id(route, owner_user_id).map(|agent| format!("agent:{agent}:main"))
}

/// Directory name for a route under `qq_sessions/`: `:` becomes `__`, any
/// other non-identifier character becomes `_`.
pub fn route_dir_name(route: &str) -> String {
    let mut out = String::with_capacity(route.len() + 4);
    for ch in route.chars() {
        if ch == ':' {
            out.push_str("__");
        } else if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_routes() {
        assert_eq!(
            parse_target("user:2151539153"),
            Some(Target::User {
                id: "2151539153".into()
            })
        );
        assert_eq!(
            parse_target("group:100001"),
            Some(Target::Group {
                id: "100001".into()
            })
        );
        assert_eq!(
            parse_target("guild:g1.x:chan-2"),
            Some(Target::Guild {
                guild_id: "g1.x".into(),
                channel_id: "chan-2".into()
            })
        );
    }

    #[test]
    fn rejects_malformed_routes() {
        for bad in [
            "user:12",            // too short
            "user:1234567890123", // too long
            "user:12a45",
            "group:",
            "guild:only-guild",
            "guild:a:b:c:d/e",
            "channel:private:123",
            "",
            "user:12345 ",
            "guild:g:c:extra",
        ] {
            assert!(!is_valid_qq_route(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn normalize_collapses_legacy_forms() {
        assert_eq!(normalize_target("channel:private:123456"), "user:123456");
        assert_eq!(normalize_target("channel:group:987654"), "group:987654");
        assert_eq!(normalize_target("session:qq:user:123456"), "user:123456");
        assert_eq!(normalize_target("session:qq:guild:g:c"), "guild:g:c");
        assert_eq!(normalize_target("2151539153"), "user:2151539153");
        assert_eq!(normalize_target("  user:123456  "), "user:123456");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "channel:private:123456",
            "session:qq:group:987654",
            "2151539153",
            "guild:g:c",
            "not-a-route",
        ] {
            let once = normalize_target(raw);
            assert_eq!(normalize_target(&once), once, "raw={raw}");
        }
    }

    #[test]
    fn parse_of_normalized_round_trips() {
        for route in ["user:2151539153", "group:100001", "guild:gid:cid"] {
            let target = parse_target(&normalize_target(route)).unwrap();
            assert_eq!(target.route(), route);
        }
    }

    #[test]
    fn resident_agent_and_session_key() {
        assert_eq!(
            resident_agent_id("user:11111", Some("11111")).as_deref(),
            Some("main")
        );
        assert_eq!(
            resident_agent_id("user:22222", Some("11111")).as_deref(),
            Some("qq-user-22222")
        );
        assert_eq!(
            session_key("group:100001", None).as_deref(),
            Some("agent:qq-group-100001:main")
        );
        assert_eq!(
            session_key("guild:g1:c2", None).as_deref(),
            Some("agent:qq-guild-g1-c2:main")
        );
        assert_eq!(session_key("bogus", None), None);
    }

    #[test]
    fn route_dir_name_is_filesystem_safe() {
        assert_eq!(route_dir_name("user:2151539153"), "user__2151539153");
        assert_eq!(route_dir_name("guild:g1:c/2"), "guild__g1__c_2");
    }
}
