//! Hierarchical classification keys for coarse-grained tool policy rules.
//!
//! Keys are dot-separated paths (`git.sync`, `repository.read`). Blocking a
//! key blocks every descendant; unknown keys referenced by a rule simply
//! match nothing.

#[derive(Debug, Clone, Copy)]
pub struct ToolClass {
    pub key: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub parent_key: Option<&'static str>,
}

pub const BUILTIN_CLASSES: &[ToolClass] = &[
    ToolClass {
        key: "system",
        display_name: "System",
        description: "Core runtime and orchestration helpers.",
        parent_key: None,
    },
    ToolClass {
        key: "system.discovery",
        display_name: "Discovery",
        description: "Tool discovery and metadata.",
        parent_key: Some("system"),
    },
    ToolClass {
        key: "system.context",
        display_name: "Context",
        description: "Context and chat state helpers.",
        parent_key: Some("system"),
    },
    ToolClass {
        key: "util",
        display_name: "Utilities",
        description: "Fallback class for uncategorized tools.",
        parent_key: None,
    },
    ToolClass {
        key: "repository",
        display_name: "Repository",
        description: "Repository read/search operations.",
        parent_key: None,
    },
    ToolClass {
        key: "repository.read",
        display_name: "Repository Read",
        description: "Repository traversal and code reading.",
        parent_key: Some("repository"),
    },
    ToolClass {
        key: "git",
        display_name: "Git",
        description: "Git operations.",
        parent_key: None,
    },
    ToolClass {
        key: "git.branches",
        display_name: "Branches",
        description: "Branch management operations.",
        parent_key: Some("git"),
    },
    ToolClass {
        key: "git.sync",
        display_name: "Sync",
        description: "Remote sync operations (fetch/pull/push).",
        parent_key: Some("git"),
    },
    ToolClass {
        key: "git.changes",
        display_name: "Changes",
        description: "Working tree inspection and comparison.",
        parent_key: Some("git"),
    },
    ToolClass {
        key: "git.commit",
        display_name: "Commit",
        description: "Staging and commit operations.",
        parent_key: Some("git"),
    },
    ToolClass {
        key: "documentation",
        display_name: "Documentation",
        description: "Documentation read/write operations.",
        parent_key: None,
    },
    ToolClass {
        key: "documentation.read",
        display_name: "Docs Read",
        description: "Read documentation content.",
        parent_key: Some("documentation"),
    },
    ToolClass {
        key: "documentation.write",
        display_name: "Docs Write",
        description: "Generate and write documentation.",
        parent_key: Some("documentation"),
    },
];

/// Collapses slashes and duplicate dots so `git/sync` and `git..sync` both
/// resolve to `git.sync`. Empty input yields `None`.
pub fn normalize_class_key(raw: &str) -> Option<String> {
    let mut key = raw.trim().replace('/', ".");
    if key.is_empty() {
        return None;
    }
    while key.contains("..") {
        key = key.replace("..", ".");
    }
    let key = key.trim_matches('.').to_string();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

fn lookup(key: &str) -> Option<&'static ToolClass> {
    BUILTIN_CLASSES.iter().find(|c| c.key == key)
}

/// Root-first chain of ancestor keys ending at `key` itself. An unknown key
/// yields a one-element chain: policy rules against unknown parents match
/// nothing, not everything.
pub fn class_path_chain(key: &str) -> Vec<String> {
    let Some(start) = normalize_class_key(key) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut cur = Some(start);
    while let Some(k) = cur {
        if !seen.insert(k.clone()) {
            break;
        }
        cur = lookup(&k).and_then(|c| c.parent_key).map(str::to_string);
        out.push(k);
    }
    out.reverse();
    out
}

/// The key itself plus every descendant key.
pub fn class_descendants(key: &str) -> std::collections::HashSet<String> {
    let mut out = std::collections::HashSet::new();
    let Some(needle) = normalize_class_key(key) else {
        return out;
    };
    let mut stack = vec![needle];
    while let Some(current) = stack.pop() {
        if !out.insert(current.clone()) {
            continue;
        }
        for c in BUILTIN_CLASSES {
            if c.parent_key == Some(current.as_str()) {
                stack.push(c.key.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{class_descendants, class_path_chain, normalize_class_key};

    #[test]
    fn normalizes_separators() {
        assert_eq!(normalize_class_key("git/sync"), Some("git.sync".to_string()));
        assert_eq!(normalize_class_key(".git..sync."), Some("git.sync".to_string()));
        assert_eq!(normalize_class_key("  "), None);
    }

    #[test]
    fn chain_runs_root_first() {
        assert_eq!(class_path_chain("git.sync"), vec!["git", "git.sync"]);
        assert_eq!(class_path_chain("system.discovery"), vec!["system", "system.discovery"]);
    }

    #[test]
    fn unknown_key_is_its_own_chain() {
        assert_eq!(class_path_chain("no.such.class"), vec!["no.such.class"]);
    }

    #[test]
    fn descendants_include_self_and_children() {
        let d = class_descendants("git");
        assert!(d.contains("git"));
        assert!(d.contains("git.sync"));
        assert!(d.contains("git.commit"));
        assert!(!d.contains("repository"));
    }
}
