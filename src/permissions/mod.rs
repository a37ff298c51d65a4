//! Authorization (§4.3/§6): scope hierarchy expansion and skill-risk-to-scope mapping.
//! Grounded on `api/permissions.py`.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// The closed scope set (§6): coarse scopes plus one `skill:*` scope per risk-gated skill,
/// plus chat/tool-call scopes.
pub const READ: &str = "read";
pub const WRITE: &str = "write";
pub const EXECUTE: &str = "execute";
pub const ADMIN: &str = "admin";
pub const CHAT: &str = "chat";
pub const CHAT_STREAM: &str = "chat:stream";
pub const TOOL_CALL: &str = "tool:call";

pub const DEFAULT_SCOPES: &[&str] = &[READ, CHAT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkillRiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A scope implies the scopes reachable by following this table, transitively (§4.3).
static SCOPE_HIERARCHY: LazyLock<HashMap<&'static str, Vec<&'static str>>> = LazyLock::new(|| {
    HashMap::from([
        (ADMIN, vec![READ, WRITE, EXECUTE, CHAT, CHAT_STREAM, TOOL_CALL]),
        (EXECUTE, vec![READ, WRITE]),
        (WRITE, vec![READ]),
    ])
});

/// Per-skill required scope, ported verbatim from `SKILL_SCOPES` in `api/permissions.py`.
static SKILL_SCOPES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("datetime", READ),
        ("math", READ),
        ("text", READ),
        ("json", READ),
        ("yaml", READ),
        ("csv", READ),
        ("weather", READ),
        ("translate", READ),
        ("qr", READ),
        ("barcode", READ),
        ("fs", WRITE),
        ("archive", WRITE),
        ("pdf", WRITE),
        ("image", WRITE),
        ("video", WRITE),
        ("audio", WRITE),
        ("ocr", WRITE),
        ("voice", WRITE),
        ("code", EXECUTE),
        ("sql", EXECUTE),
        ("git", EXECUTE),
        ("http", EXECUTE),
        ("regex", EXECUTE),
        ("crypto", EXECUTE),
        ("email", EXECUTE),
        ("docker", ADMIN),
        ("ssh", ADMIN),
    ])
});

/// Per-skill risk classification, ported verbatim from `SKILL_RISK_LEVELS`.
static SKILL_RISK_LEVELS: LazyLock<HashMap<&'static str, SkillRiskLevel>> = LazyLock::new(|| {
    use SkillRiskLevel::*;
    HashMap::from([
        ("datetime", Low),
        ("math", Low),
        ("text", Low),
        ("json", Low),
        ("yaml", Low),
        ("csv", Low),
        ("weather", Low),
        ("translate", Low),
        ("qr", Low),
        ("barcode", Low),
        ("fs", Medium),
        ("archive", Medium),
        ("pdf", Medium),
        ("image", Medium),
        ("video", Medium),
        ("audio", Medium),
        ("ocr", Medium),
        ("voice", Medium),
        ("code", High),
        ("sql", High),
        ("git", High),
        ("http", High),
        ("regex", High),
        ("crypto", High),
        ("email", High),
        ("docker", Critical),
        ("ssh", Critical),
    ])
});

/// Minimum scope implied by a risk level, used when a skill has no explicit entry in
/// `SKILL_SCOPES`.
static RISK_LEVEL_SCOPES: LazyLock<HashMap<SkillRiskLevel, &'static str>> = LazyLock::new(|| {
    use SkillRiskLevel::*;
    HashMap::from([(Low, READ), (Medium, WRITE), (High, EXECUTE), (Critical, ADMIN)])
});

pub fn skill_risk_level(skill: &str) -> SkillRiskLevel {
    SKILL_RISK_LEVELS.get(skill).copied().unwrap_or(SkillRiskLevel::Medium)
}

pub fn skill_required_scope(skill: &str) -> &'static str {
    if let Some(scope) = SKILL_SCOPES.get(skill) {
        return scope;
    }
    RISK_LEVEL_SCOPES
        .get(&skill_risk_level(skill))
        .copied()
        .unwrap_or(READ)
}

/// The per-skill scope string `skill:<name>`, e.g. `skill:fs` (§4.4 clause 2). Holding this
/// exact scope grants the skill regardless of the caller's coarse-scope/risk-tier standing.
pub fn skill_scope(skill: &str) -> String {
    format!("skill:{skill}")
}

/// Expands a caller's granted scopes by the hierarchy, so e.g. holding `admin` satisfies a
/// `read` check without the caller needing `read` listed explicitly.
pub struct PermissionChecker {
    expanded: HashSet<String>,
}

impl PermissionChecker {
    pub fn new(scopes: &[String]) -> Self {
        let mut expanded: HashSet<String> = scopes.iter().cloned().collect();
        let mut frontier: Vec<String> = scopes.to_vec();
        while let Some(scope) = frontier.pop() {
            if let Some(implied) = SCOPE_HIERARCHY.get(scope.as_str()) {
                for s in implied {
                    if expanded.insert(s.to_string()) {
                        frontier.push(s.to_string());
                    }
                }
            }
        }
        Self { expanded }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.expanded.contains(scope)
    }

    pub fn has_any_scope(&self, scopes: &[&str]) -> bool {
        scopes.iter().any(|s| self.has_scope(s))
    }

    pub fn has_all_scopes(&self, scopes: &[&str]) -> bool {
        scopes.iter().all(|s| self.has_scope(s))
    }

    /// A skill is usable if the caller holds the literal `skill:<name>` scope, OR holds the
    /// coarse/risk-tier scope that skill requires (§4.4 clause 2).
    pub fn can_use_skill(&self, skill: &str) -> bool {
        self.has_scope(&skill_scope(skill)) || self.has_scope(skill_required_scope(skill))
    }

    pub fn can_call_tool(&self, skill: &str) -> bool {
        self.has_scope(TOOL_CALL) && self.can_use_skill(skill)
    }

    pub fn can_chat(&self, streaming: bool) -> bool {
        if streaming {
            self.has_scope(CHAT_STREAM) || self.has_scope(CHAT)
        } else {
            self.has_scope(CHAT)
        }
    }

    pub fn allowed_skills<'a>(&self, all_skills: &[&'a str]) -> Vec<&'a str> {
        all_skills.iter().copied().filter(|s| self.can_use_skill(s)).collect()
    }

    pub fn denied_skills<'a>(&self, all_skills: &[&'a str]) -> Vec<&'a str> {
        all_skills.iter().copied().filter(|s| !self.can_use_skill(s)).collect()
    }
}

/// Per-user/key override policy layered on top of scope checks (§4.3 style deny/allow lists).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PermissionPolicy {
    pub allowed_skills: Option<Vec<String>>,
    #[serde(default)]
    pub denied_skills: Vec<String>,
    pub max_requests_per_minute: Option<u32>,
    pub max_tokens_per_request: Option<u32>,
    #[serde(default = "default_true")]
    pub allow_streaming: bool,
    #[serde(default = "default_true")]
    pub allow_tool_calls: bool,
    #[serde(default)]
    pub require_confirmation_for: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl PermissionPolicy {
    /// Deny-list first, then allow-list if configured, else fall back to scope-based checks.
    pub fn can_use_skill(&self, skill: &str, checker: &PermissionChecker) -> bool {
        if self.denied_skills.iter().any(|s| s == skill) {
            return false;
        }
        if let Some(allowed) = &self.allowed_skills {
            return allowed.iter().any(|s| s == skill);
        }
        checker.can_use_skill(skill)
    }
}

/// Returns `(allowed, reason)` following the same deny → allow → scope precedence.
pub fn check_skill_permission(skill: &str, policy: &PermissionPolicy, checker: &PermissionChecker) -> (bool, String) {
    if policy.denied_skills.iter().any(|s| s == skill) {
        return (false, format!("skill '{skill}' is explicitly denied by policy"));
    }
    if let Some(allowed) = &policy.allowed_skills {
        return if allowed.iter().any(|s| s == skill) {
            (true, "allowed by policy allow-list".to_string())
        } else {
            (false, format!("skill '{skill}' is not in the policy allow-list"))
        };
    }
    if checker.can_use_skill(skill) {
        (true, "allowed by scope".to_string())
    } else {
        (false, format!("missing scope '{}' for skill '{skill}'", skill_required_scope(skill)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_scope_expands_to_full_hierarchy() {
        let checker = PermissionChecker::new(&[ADMIN.to_string()]);
        assert!(checker.has_scope(READ));
        assert!(checker.has_scope(WRITE));
        assert!(checker.has_scope(EXECUTE));
        assert!(checker.has_scope(CHAT));
        assert!(checker.has_scope(TOOL_CALL));
    }

    #[test]
    fn execute_scope_does_not_imply_admin() {
        let checker = PermissionChecker::new(&[EXECUTE.to_string()]);
        assert!(checker.has_scope(READ));
        assert!(checker.has_scope(WRITE));
        assert!(!checker.has_scope(ADMIN));
    }

    #[test]
    fn read_only_caller_cannot_use_write_tier_skill() {
        let checker = PermissionChecker::new(&[READ.to_string()]);
        assert!(checker.can_use_skill("datetime"));
        assert!(!checker.can_use_skill("fs"));
    }

    #[test]
    fn per_skill_scope_grants_access_without_coarse_scope() {
        let checker = PermissionChecker::new(&["skill:fs".to_string()]);
        assert!(checker.can_use_skill("fs"));
        assert!(!checker.can_use_skill("ssh"));
        assert!(!checker.has_scope(WRITE));
    }

    #[test]
    fn deny_list_overrides_allow_list_and_scope() {
        let checker = PermissionChecker::new(&[ADMIN.to_string()]);
        let policy = PermissionPolicy {
            denied_skills: vec!["ssh".to_string()],
            ..Default::default()
        };
        let (allowed, _) = check_skill_permission("ssh", &policy, &checker);
        assert!(!allowed);
    }
}
