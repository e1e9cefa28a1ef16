use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::classes::class_path_chain;
use crate::registry::ToolSpec;

/// Git tools that mutate repository or remote state. Members under a
/// restrictive security policy get these blocked wholesale.
pub const GIT_WRITE_TOOLS: &[&str] = &[
    "git_checkout_branch",
    "git_create_branch",
    "git_stage_files",
    "git_unstage_files",
    "git_commit",
    "git_push",
    "git_pull",
    "git_fetch",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Viewer,
    Member,
    Admin,
}

impl UserRole {
    /// Unknown or empty role strings fall back to the least-trusted role.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => UserRole::Admin,
            "member" => UserRole::Member,
            _ => UserRole::Viewer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Viewer => "viewer",
            UserRole::Member => "member",
            UserRole::Admin => "admin",
        }
    }
}

/// Project-level security knobs that shape the role-derived policy layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub read_only_for_non_admin: bool,
    pub allow_write_tools_for_members: bool,
    pub allow_git_write_tools_for_non_admin: bool,
}

/// Effective tool policy: the merged output of role, project, chat and
/// approval layers. All sets are sorted for deterministic wire output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    pub allowed_tools: BTreeSet<String>,
    pub allowed_classes: BTreeSet<String>,
    pub blocked_tools: BTreeSet<String>,
    pub blocked_classes: BTreeSet<String>,
    pub strict_allowlist: bool,
    pub read_only_only: bool,
    pub dry_run: bool,
    pub require_approval_for_write_tools: bool,
    pub timeout_overrides: BTreeMap<String, u64>,
    pub rate_limit_overrides: BTreeMap<String, u32>,
    pub retry_overrides: BTreeMap<String, u32>,
    pub cache_ttl_overrides: BTreeMap<String, u64>,
    pub approved_tools: BTreeSet<String>,
}

impl ToolPolicy {
    /// Base policy derived from the caller's role before project and chat
    /// fragments are layered on. Admins start unrestricted.
    pub fn for_role(role: UserRole, security: &SecurityPolicy) -> Self {
        let mut policy = ToolPolicy::default();
        match role {
            UserRole::Admin => {}
            UserRole::Viewer => {
                policy.read_only_only = true;
            }
            UserRole::Member => {
                if security.read_only_for_non_admin && !security.allow_write_tools_for_members {
                    policy.read_only_only = true;
                }
                if security.read_only_for_non_admin && !security.allow_git_write_tools_for_non_admin
                {
                    for name in GIT_WRITE_TOOLS {
                        policy.blocked_tools.insert((*name).to_string());
                    }
                }
            }
        }
        policy
    }

    /// Layers `overlay` over `self`. Block sets union unconditionally.
    /// Allow sets union in normal mode; strict mode intersects the layers'
    /// explicit allow lists, an absent list imposing no restriction. Boolean
    /// restrictions are OR'd; numeric overrides are last-writer-wins.
    /// Merging a policy with itself is a no-op.
    pub fn merge(&self, overlay: &ToolPolicy) -> ToolPolicy {
        let strict_allowlist = self.strict_allowlist || overlay.strict_allowlist;

        let allowed_tools = merge_allow(strict_allowlist, &self.allowed_tools, &overlay.allowed_tools);
        let allowed_classes =
            merge_allow(strict_allowlist, &self.allowed_classes, &overlay.allowed_classes);

        let blocked_tools: BTreeSet<String> =
            self.blocked_tools.union(&overlay.blocked_tools).cloned().collect();
        let blocked_classes: BTreeSet<String> =
            self.blocked_classes.union(&overlay.blocked_classes).cloned().collect();

        let mut timeout_overrides = self.timeout_overrides.clone();
        timeout_overrides.extend(overlay.timeout_overrides.clone());
        let mut rate_limit_overrides = self.rate_limit_overrides.clone();
        rate_limit_overrides.extend(overlay.rate_limit_overrides.clone());
        let mut retry_overrides = self.retry_overrides.clone();
        retry_overrides.extend(overlay.retry_overrides.clone());
        let mut cache_ttl_overrides = self.cache_ttl_overrides.clone();
        cache_ttl_overrides.extend(overlay.cache_ttl_overrides.clone());

        ToolPolicy {
            allowed_tools,
            allowed_classes,
            blocked_tools,
            blocked_classes,
            strict_allowlist,
            read_only_only: self.read_only_only || overlay.read_only_only,
            dry_run: self.dry_run || overlay.dry_run,
            require_approval_for_write_tools: self.require_approval_for_write_tools
                || overlay.require_approval_for_write_tools,
            timeout_overrides,
            rate_limit_overrides,
            retry_overrides,
            cache_ttl_overrides,
            approved_tools: self.approved_tools.union(&overlay.approved_tools).cloned().collect(),
        }
    }

    /// Full resolution pipeline: role → project → chat → approvals.
    pub fn resolve(
        role: UserRole,
        security: &SecurityPolicy,
        project: &ToolPolicy,
        chat: &ToolPolicy,
        approved: &BTreeSet<String>,
    ) -> ToolPolicy {
        let mut merged = ToolPolicy::for_role(role, security).merge(project).merge(chat);
        merged.approved_tools.extend(approved.iter().cloned());
        merged
    }

    pub fn gate(&self, spec: &ToolSpec) -> PolicyGate {
        if self.blocked_tools.contains(&spec.name) {
            return PolicyGate::Denied(DenyReason::BlockedTool);
        }
        for key in class_path_chain(&spec.class_key) {
            if self.blocked_classes.contains(&key) {
                return PolicyGate::Denied(DenyReason::BlockedClass(key));
            }
        }
        if self.strict_allowlist
            && !(self.allowed_tools.is_empty() && self.allowed_classes.is_empty())
        {
            let name_ok =
                self.allowed_tools.contains(&spec.name) || self.approved_tools.contains(&spec.name);
            let class_ok = class_path_chain(&spec.class_key)
                .iter()
                .any(|key| self.allowed_classes.contains(key));
            if !name_ok && !class_ok {
                return PolicyGate::Denied(DenyReason::NotAllowlisted);
            }
        }
        if self.read_only_only && !spec.read_only && !self.approved_tools.contains(&spec.name) {
            return PolicyGate::Denied(DenyReason::ReadOnlyOnly);
        }
        PolicyGate::Allowed
    }

    pub fn effective_timeout(&self, spec: &ToolSpec) -> Duration {
        self.timeout_overrides
            .get(&spec.name)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or(spec.timeout)
    }

    pub fn effective_rate_limit(&self, spec: &ToolSpec) -> u32 {
        self.rate_limit_overrides
            .get(&spec.name)
            .copied()
            .unwrap_or(spec.rate_limit_per_min)
    }

    pub fn effective_retries(&self, spec: &ToolSpec) -> u32 {
        self.retry_overrides.get(&spec.name).copied().unwrap_or(spec.max_retries)
    }

    pub fn effective_cache_ttl(&self, spec: &ToolSpec) -> Duration {
        self.cache_ttl_overrides
            .get(&spec.name)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or(spec.cache_ttl)
    }

    /// Approval is needed when the descriptor demands it, or when the policy
    /// demands it for every non-read-only tool.
    pub fn needs_approval(&self, spec: &ToolSpec) -> bool {
        let required =
            spec.require_approval || (self.require_approval_for_write_tools && !spec.read_only);
        required && !self.approved_tools.contains(&spec.name)
    }
}

fn merge_allow(
    strict: bool,
    base: &BTreeSet<String>,
    overlay: &BTreeSet<String>,
) -> BTreeSet<String> {
    if !strict {
        return base.union(overlay).cloned().collect();
    }
    match (base.is_empty(), overlay.is_empty()) {
        (true, true) => BTreeSet::new(),
        (true, false) => overlay.clone(),
        (false, true) => base.clone(),
        (false, false) => base.intersection(overlay).cloned().collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyGate {
    Allowed,
    Denied(DenyReason),
}

impl PolicyGate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyGate::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    BlockedTool,
    BlockedClass(String),
    NotAllowlisted,
    ReadOnlyOnly,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::BlockedTool => "blocked_tool",
            DenyReason::BlockedClass(_) => "blocked_class",
            DenyReason::NotAllowlisted => "not_allowlisted",
            DenyReason::ReadOnlyOnly => "read_only_only",
        }
    }
}

/// One time-boxed tool approval granted to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub tool_name: String,
    pub user_id: String,
    pub approved: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub expires_at: Option<OffsetDateTime>,
}

/// Filters approval rows down to the tools currently approved for `user`.
/// Rows for other users, unapproved rows, and expired rows are dropped.
pub fn active_approved_tools(
    rows: &[ApprovalRow],
    user: &str,
    now: OffsetDateTime,
) -> BTreeSet<String> {
    let user_norm = user.trim().to_ascii_lowercase();
    let mut out = BTreeSet::new();
    for row in rows {
        let row_user = row.user_id.trim().to_ascii_lowercase();
        if !row_user.is_empty() && !user_norm.is_empty() && row_user != user_norm {
            continue;
        }
        if !row.approved {
            continue;
        }
        if let Some(exp) = row.expires_at {
            if exp <= now {
                continue;
            }
        }
        let name = row.tool_name.trim();
        if !name.is_empty() {
            out.insert(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::*;
    use crate::registry::{ArgSchema, ToolHandler, ToolSpec};
    use crate::types::CallContext;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl ToolHandler for NoopHandler {
        async fn run(
            &self,
            _args: serde_json::Value,
            _ctx: &CallContext,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    fn spec(name: &str, class_key: &str, read_only: bool) -> ToolSpec {
        let mut s = ToolSpec::new(name, "test tool", ArgSchema::default(), Arc::new(NoopHandler))
            .with_class(class_key);
        s.read_only = read_only;
        s
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_is_idempotent() {
        let mut p = ToolPolicy::default();
        p.allowed_tools = set(&["repo_grep", "open_file"]);
        p.blocked_classes = set(&["git.sync"]);
        p.strict_allowlist = true;
        p.read_only_only = true;
        p.timeout_overrides.insert("repo_grep".into(), 10);
        assert_eq!(p.merge(&p), p);
    }

    #[test]
    fn block_wins_over_allow_across_layers() {
        let mut project = ToolPolicy::default();
        project.allowed_tools = set(&["git_push"]);
        let mut chat = ToolPolicy::default();
        chat.blocked_tools = set(&["git_push"]);
        let merged = project.merge(&chat);
        assert!(!merged.gate(&spec("git_push", "git.sync", false)).is_allowed());
    }

    #[test]
    fn strict_merge_intersects_explicit_allow_lists() {
        let mut base = ToolPolicy::default();
        base.strict_allowlist = true;
        base.allowed_tools = set(&["repo_grep", "open_file"]);
        let mut overlay = ToolPolicy::default();
        overlay.allowed_tools = set(&["open_file", "git_status"]);
        let merged = base.merge(&overlay);
        assert_eq!(merged.allowed_tools, set(&["open_file"]));

        // Absent overlay list imposes no restriction.
        let merged = base.merge(&ToolPolicy::default());
        assert_eq!(merged.allowed_tools, set(&["repo_grep", "open_file"]));
    }

    #[test]
    fn non_strict_merge_unions_allow_lists() {
        let mut base = ToolPolicy::default();
        base.allowed_tools = set(&["repo_grep"]);
        let mut overlay = ToolPolicy::default();
        overlay.allowed_tools = set(&["open_file"]);
        assert_eq!(base.merge(&overlay).allowed_tools, set(&["open_file", "repo_grep"]));
    }

    #[test]
    fn blocking_a_class_blocks_descendants() {
        let mut p = ToolPolicy::default();
        p.blocked_classes = set(&["git"]);
        assert_eq!(
            p.gate(&spec("git_push", "git.sync", false)),
            PolicyGate::Denied(DenyReason::BlockedClass("git".into()))
        );
        assert!(p.gate(&spec("repo_grep", "repository.read", true)).is_allowed());
    }

    #[test]
    fn read_only_only_spares_approved_tools() {
        let mut p = ToolPolicy::default();
        p.read_only_only = true;
        assert_eq!(
            p.gate(&spec("write_docs_file", "documentation.write", false)),
            PolicyGate::Denied(DenyReason::ReadOnlyOnly)
        );
        p.approved_tools = set(&["write_docs_file"]);
        assert!(p.gate(&spec("write_docs_file", "documentation.write", false)).is_allowed());
    }

    #[test]
    fn role_policy_for_member_blocks_git_writes() {
        let security = SecurityPolicy {
            read_only_for_non_admin: true,
            allow_write_tools_for_members: true,
            allow_git_write_tools_for_non_admin: false,
        };
        let p = ToolPolicy::for_role(UserRole::Member, &security);
        assert!(!p.read_only_only);
        assert!(p.blocked_tools.contains("git_push"));
        assert!(ToolPolicy::for_role(UserRole::Viewer, &security).read_only_only);
        assert!(ToolPolicy::for_role(UserRole::Admin, &security).blocked_tools.is_empty());
    }

    #[test]
    fn numeric_overrides_are_last_writer_wins() {
        let mut base = ToolPolicy::default();
        base.timeout_overrides.insert("repo_grep".into(), 10);
        let mut overlay = ToolPolicy::default();
        overlay.timeout_overrides.insert("repo_grep".into(), 5);
        let merged = base.merge(&overlay);
        let s = spec("repo_grep", "repository.read", true);
        assert_eq!(merged.effective_timeout(&s), Duration::from_secs(5));
    }

    #[test]
    fn expired_and_foreign_approvals_are_dropped() {
        let now = OffsetDateTime::now_utc();
        let rows = vec![
            ApprovalRow {
                tool_name: "git_push".into(),
                user_id: "dev@example.com".into(),
                approved: true,
                expires_at: Some(now + time::Duration::hours(1)),
            },
            ApprovalRow {
                tool_name: "git_pull".into(),
                user_id: "dev@example.com".into(),
                approved: true,
                expires_at: Some(now - time::Duration::hours(1)),
            },
            ApprovalRow {
                tool_name: "git_fetch".into(),
                user_id: "other@example.com".into(),
                approved: true,
                expires_at: None,
            },
            ApprovalRow {
                tool_name: "git_commit".into(),
                user_id: "dev@example.com".into(),
                approved: false,
                expires_at: None,
            },
        ];
        let out = active_approved_tools(&rows, "Dev@Example.com", now);
        assert_eq!(out, set(&["git_push"]));
    }
}
