use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::RegexBuilder;
use serde_json::{json, Value};
use tokio::process::Command;
use uuid::Uuid;

use crate::registry::{
    handler_fn, ArgField, ArgSchema, ArgType, CatalogRow, ToolRegistry, ToolSpec,
};
use crate::types::{AnswerMode, PendingUserQuestion};

/// Directory names never traversed by repository read tools.
const IGNORE_PARTS: &[&str] = &[
    ".git",
    "node_modules",
    ".next",
    "dist",
    "build",
    ".venv",
    "venv",
    "__pycache__",
    "target",
];

const GIT_TIMEOUT: Duration = Duration::from_secs(40);
const OUTPUT_LIMIT: usize = 50_000;
const DEFAULT_DOCS_ROOT: &str = "documentation";

#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub repo_root: PathBuf,
    pub docs_root: String,
}

impl ToolsConfig {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            docs_root: DEFAULT_DOCS_ROOT.to_string(),
        }
    }
}

/// Catalog metadata the discovery tools serve. Filled in after every tool
/// is registered, so the discovery tools describe themselves too.
struct CatalogIndex {
    rows: Vec<CatalogRow>,
    details: BTreeMap<String, String>,
}

/// Builds the full builtin registry: discovery, repository read, git and
/// documentation tools, all rooted at `cfg.repo_root`.
pub fn builtin_registry(cfg: &ToolsConfig) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    let index: Arc<OnceLock<CatalogIndex>> = Arc::new(OnceLock::new());

    register_discovery_tools(&mut reg, index.clone());
    register_repo_tools(&mut reg, cfg);
    register_git_tools(&mut reg, cfg);
    register_docs_tools(&mut reg, cfg);

    let rows = reg.catalog();
    let mut details = BTreeMap::new();
    for name in reg.names() {
        if let Some(text) = reg.render_tool_details(&name) {
            details.insert(name, text);
        }
    }
    let _ = index.set(CatalogIndex { rows, details });
    reg
}

fn register_discovery_tools(reg: &mut ToolRegistry, index: Arc<OnceLock<CatalogIndex>>) {
    let idx = index.clone();
    reg.register(
        ToolSpec::new(
            "list_tools",
            "List every available tool with its classification and flags.",
            ArgSchema::default(),
            handler_fn(move |_args, _ctx| {
                let idx = idx.clone();
                async move {
                    let rows = idx.get().map(|i| i.rows.clone()).unwrap_or_default();
                    Ok(json!({ "tools": rows }))
                }
            }),
        )
        .with_class("system.discovery"),
    );

    let idx = index.clone();
    reg.register(
        ToolSpec::new(
            "search_tools",
            "Search tool names and descriptions for a substring.",
            ArgSchema::new(vec![ArgField::required(
                "query",
                ArgType::String,
                "Case-insensitive substring to look for.",
            )]),
            handler_fn(move |args, _ctx| {
                let idx = idx.clone();
                async move {
                    let query = args["query"].as_str().unwrap_or_default().to_lowercase();
                    let hits: Vec<CatalogRow> = idx
                        .get()
                        .map(|i| {
                            i.rows
                                .iter()
                                .filter(|row| {
                                    row.name.to_lowercase().contains(&query)
                                        || row.description.to_lowercase().contains(&query)
                                })
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    Ok(json!({ "query": args["query"], "tools": hits }))
                }
            }),
        )
        .with_class("system.discovery"),
    );

    let idx = index.clone();
    reg.register(
        ToolSpec::new(
            "get_tool_details",
            "Show the full parameter schema for one tool.",
            ArgSchema::new(vec![ArgField::required(
                "name",
                ArgType::String,
                "Tool name.",
            )]),
            handler_fn(move |args, _ctx| {
                let idx = idx.clone();
                async move {
                    let name = args["name"].as_str().unwrap_or_default();
                    match idx.get().and_then(|i| i.details.get(name)) {
                        Some(text) => Ok(json!({ "name": name, "details": text })),
                        None => bail!("no such tool: {name}"),
                    }
                }
            }),
        )
        .with_class("system.discovery"),
    );

    reg.register(
        ToolSpec::new(
            "request_user_input",
            "Pause the run and ask the user a clarifying question.",
            ArgSchema::new(vec![
                ArgField::required("question", ArgType::String, "Question to show the user."),
                ArgField::optional(
                    "answer_mode",
                    ArgType::String,
                    "open_text (default) or single_choice.",
                ),
                ArgField::optional("options", ArgType::Array, "Choices for single_choice."),
            ]),
            handler_fn(|args, _ctx| async move {
                let question = args["question"].as_str().unwrap_or_default().trim().to_string();
                if question.is_empty() {
                    bail!("question must not be empty");
                }
                let answer_mode = match args.get("answer_mode").and_then(Value::as_str) {
                    Some("single_choice") => AnswerMode::SingleChoice,
                    _ => AnswerMode::OpenText,
                };
                let options = args
                    .get("options")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let pending = PendingUserQuestion::normalized(
                    Uuid::new_v4().to_string(),
                    question,
                    answer_mode,
                    options,
                );
                Ok(serde_json::to_value(pending)?)
            }),
        )
        .with_class("system.discovery"),
    );
}

fn register_repo_tools(reg: &mut ToolRegistry, cfg: &ToolsConfig) {
    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "repo_grep",
            "Search repository files for a regex pattern.",
            ArgSchema::new(vec![
                ArgField::required("pattern", ArgType::String, "Regex to search for."),
                ArgField::optional("max_results", ArgType::Integer, "Match cap.")
                    .with_default(json!(50)),
                ArgField::optional("context_lines", ArgType::Integer, "Lines of context.")
                    .with_default(json!(2)),
                ArgField::optional("case_sensitive", ArgType::Boolean, "Match case.")
                    .with_default(json!(false)),
                ArgField::optional(
                    "include_file_patterns",
                    ArgType::Array,
                    "Globs a file path must match.",
                ),
                ArgField::optional(
                    "exclude_file_patterns",
                    ArgType::Array,
                    "Globs that exclude a file path.",
                ),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move { run_scan(move || repo_grep(&root, &args)).await }
            }),
        )
        .with_class("repository.read")
        .with_rate_limit(60),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "open_file",
            "Read a file, optionally sliced to a line range.",
            ArgSchema::new(vec![
                ArgField::required("path", ArgType::String, "Path relative to the repo root.")
                    .with_alias("file_path"),
                ArgField::optional("start_line", ArgType::Integer, "First line, 1-based."),
                ArgField::optional("end_line", ArgType::Integer, "Last line, inclusive."),
                ArgField::optional("max_chars", ArgType::Integer, "Character cap.")
                    .with_default(json!(200_000)),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move { run_scan(move || open_file(&root, &args)).await }
            }),
        )
        .with_class("repository.read")
        .with_rate_limit(60),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "repo_tree",
            "List files and directories under a path.",
            ArgSchema::new(vec![
                ArgField::optional("path", ArgType::String, "Subtree to list.")
                    .with_default(json!("")),
                ArgField::optional("max_depth", ArgType::Integer, "Depth cap.")
                    .with_default(json!(4)),
                ArgField::optional("max_entries", ArgType::Integer, "Entry cap.")
                    .with_default(json!(800)),
                ArgField::optional("glob", ArgType::String, "Glob filter on paths."),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move { run_scan(move || repo_tree(&root, &args)).await }
            }),
        )
        .with_class("repository.read")
        .with_rate_limit(60),
    );
}

fn register_git_tools(reg: &mut ToolRegistry, cfg: &ToolsConfig) {
    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_status",
            "Show the working tree status.",
            ArgSchema::default(),
            handler_fn(move |_args, _ctx| {
                let root = root.clone();
                async move {
                    let branch = current_branch(&root).await?;
                    let out = run_git(&root, &["status", "--porcelain=v1"]).await?;
                    let changes: Vec<&str> =
                        out.lines().map(str::trim_end).filter(|l| !l.is_empty()).collect();
                    Ok(json!({ "branch": branch, "clean": changes.is_empty(), "changes": changes }))
                }
            }),
        )
        .with_class("git.changes"),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_log",
            "Show recent commits.",
            ArgSchema::new(vec![ArgField::optional(
                "max_count",
                ArgType::Integer,
                "Number of commits.",
            )
            .with_default(json!(20))]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move {
                    let n = clamp_i64(args.get("max_count"), 1, 200, 20);
                    let out = run_git(
                        &root,
                        &[
                            "log",
                            "--pretty=format:%H%x09%an%x09%aI%x09%s",
                            "-n",
                            &n.to_string(),
                        ],
                    )
                    .await?;
                    let commits: Vec<Value> = out
                        .lines()
                        .filter_map(|line| {
                            let mut parts = line.splitn(4, '\t');
                            Some(json!({
                                "commit": parts.next()?,
                                "author": parts.next()?,
                                "date": parts.next()?,
                                "subject": parts.next().unwrap_or(""),
                            }))
                        })
                        .collect();
                    Ok(json!({ "commits": commits }))
                }
            }),
        )
        .with_class("git.commit"),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_list_branches",
            "List local and origin branches.",
            ArgSchema::default(),
            handler_fn(move |_args, _ctx| {
                let root = root.clone();
                async move {
                    let active = current_branch(&root).await?;
                    let out = run_git(
                        &root,
                        &[
                            "for-each-ref",
                            "--format=%(refname:short)%09%(objectname)",
                            "refs/heads",
                            "refs/remotes/origin",
                        ],
                    )
                    .await?;
                    let mut seen = std::collections::BTreeSet::new();
                    let mut branches = Vec::new();
                    for line in out.lines() {
                        let mut parts = line.splitn(2, '\t');
                        let mut name = parts.next().unwrap_or("").trim().to_string();
                        let commit = parts.next().unwrap_or("").trim().to_string();
                        if name == "origin/HEAD" {
                            continue;
                        }
                        if let Some(stripped) = name.strip_prefix("origin/") {
                            name = stripped.to_string();
                        }
                        if name.is_empty() || !seen.insert(name.clone()) {
                            continue;
                        }
                        branches.push(json!({ "name": name, "commit": commit }));
                    }
                    Ok(json!({ "active_branch": active, "branches": branches }))
                }
            }),
        )
        .with_class("git.branches"),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_diff",
            "Show a diff against a ref or the working tree.",
            ArgSchema::new(vec![
                ArgField::optional("ref", ArgType::String, "Ref to diff against."),
                ArgField::optional("path", ArgType::String, "Limit the diff to one path."),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move {
                    let mut cmd: Vec<String> = vec!["diff".to_string()];
                    if let Some(r) = args.get("ref").and_then(Value::as_str) {
                        cmd.push(sanitize_branch_name(r)?);
                    }
                    if let Some(p) = args.get("path").and_then(Value::as_str) {
                        cmd.push("--".to_string());
                        cmd.push(sanitize_rel_path(p)?);
                    }
                    let refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
                    let out = run_git(&root, &refs).await?;
                    let (diff, truncated) = limit_text(&out, OUTPUT_LIMIT);
                    Ok(json!({ "diff": diff, "truncated": truncated }))
                }
            }),
        )
        .with_class("git.changes"),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_checkout_branch",
            "Check out a branch, optionally creating it.",
            ArgSchema::new(vec![
                ArgField::required("branch", ArgType::String, "Branch name."),
                ArgField::optional("create_if_missing", ArgType::Boolean, "Create when absent.")
                    .with_default(json!(false)),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move {
                    let branch =
                        sanitize_branch_name(args["branch"].as_str().unwrap_or_default())?;
                    let previous = current_branch(&root).await?;
                    let exists = branch_exists(&root, &branch).await;
                    let created = !exists && args["create_if_missing"].as_bool().unwrap_or(false);
                    if created {
                        run_git(&root, &["checkout", "-b", &branch]).await?;
                    } else {
                        run_git(&root, &["checkout", &branch]).await?;
                    }
                    Ok(json!({
                        "branch": branch,
                        "previous_branch": previous,
                        "created": created,
                    }))
                }
            }),
        )
        .with_class("git.branches")
        .writable(),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_create_branch",
            "Create a branch from an optional source ref.",
            ArgSchema::new(vec![
                ArgField::required("branch", ArgType::String, "New branch name."),
                ArgField::optional("source_ref", ArgType::String, "Starting point."),
                ArgField::optional("checkout", ArgType::Boolean, "Switch to it after creating.")
                    .with_default(json!(true)),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move {
                    let branch =
                        sanitize_branch_name(args["branch"].as_str().unwrap_or_default())?;
                    let checkout = args["checkout"].as_bool().unwrap_or(true);
                    let source = match args.get("source_ref").and_then(Value::as_str) {
                        Some(s) => Some(sanitize_branch_name(s)?),
                        None => None,
                    };
                    let mut cmd: Vec<&str> = if checkout {
                        vec!["checkout", "-b", &branch]
                    } else {
                        vec!["branch", &branch]
                    };
                    if let Some(src) = &source {
                        cmd.push(src);
                    }
                    run_git(&root, &cmd).await?;
                    Ok(json!({
                        "branch": branch,
                        "source_ref": source,
                        "created": true,
                        "checked_out": checkout,
                    }))
                }
            }),
        )
        .with_class("git.branches")
        .writable(),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_stage_files",
            "Stage files for the next commit.",
            ArgSchema::new(vec![ArgField::required(
                "paths",
                ArgType::Array,
                "Paths relative to the repo root.",
            )]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move {
                    let paths = sanitize_rel_paths(&args["paths"])?;
                    let mut cmd: Vec<&str> = vec!["add", "--"];
                    cmd.extend(paths.iter().map(String::as_str));
                    run_git(&root, &cmd).await?;
                    Ok(json!({ "staged": paths }))
                }
            }),
        )
        .with_class("git.changes")
        .writable(),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_unstage_files",
            "Remove files from the index.",
            ArgSchema::new(vec![ArgField::required(
                "paths",
                ArgType::Array,
                "Paths relative to the repo root.",
            )]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move {
                    let paths = sanitize_rel_paths(&args["paths"])?;
                    let mut cmd: Vec<&str> = vec!["reset", "HEAD", "--"];
                    cmd.extend(paths.iter().map(String::as_str));
                    run_git(&root, &cmd).await?;
                    Ok(json!({ "unstaged": paths }))
                }
            }),
        )
        .with_class("git.changes")
        .writable(),
    );

    let root = cfg.repo_root.clone();
    reg.register(
        ToolSpec::new(
            "git_commit",
            "Commit staged changes.",
            ArgSchema::new(vec![ArgField::required(
                "message",
                ArgType::String,
                "Commit message.",
            )]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move {
                    let message = args["message"].as_str().unwrap_or_default().trim().to_string();
                    if message.is_empty() {
                        bail!("commit message must not be empty");
                    }
                    run_git(&root, &["commit", "-m", &message]).await?;
                    let sha = run_git(&root, &["rev-parse", "HEAD"]).await?.trim().to_string();
                    Ok(json!({ "committed": true, "commit": sha, "message": message }))
                }
            }),
        )
        .with_class("git.commit")
        .writable(),
    );

    for (name, verb, description) in [
        ("git_push", "push", "Push the current branch to a remote."),
        ("git_pull", "pull", "Pull a branch from a remote."),
        ("git_fetch", "fetch", "Fetch refs from a remote."),
    ] {
        let root = cfg.repo_root.clone();
        reg.register(
            ToolSpec::new(
                name,
                description,
                ArgSchema::new(vec![
                    ArgField::optional("remote", ArgType::String, "Remote name.")
                        .with_default(json!("origin")),
                    ArgField::optional("branch", ArgType::String, "Branch name."),
                ]),
                handler_fn(move |args, _ctx| {
                    let root = root.clone();
                    async move {
                        let remote = sanitize_branch_name(
                            args.get("remote").and_then(Value::as_str).unwrap_or("origin"),
                        )?;
                        let mut cmd: Vec<String> = vec![verb.to_string(), remote.clone()];
                        if verb != "fetch" {
                            let branch = match args.get("branch").and_then(Value::as_str) {
                                Some(b) => sanitize_branch_name(b)?,
                                None => "HEAD".to_string(),
                            };
                            cmd.push(branch);
                        }
                        let refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
                        let out = run_git(&root, &refs).await?;
                        let (output, truncated) = limit_text(&out, OUTPUT_LIMIT);
                        Ok(json!({ "remote": remote, "output": output, "truncated": truncated }))
                    }
                }),
            )
            .with_class("git.sync")
            .writable()
            .with_retries(1),
        );
    }
}

fn register_docs_tools(reg: &mut ToolRegistry, cfg: &ToolsConfig) {
    let root = cfg.repo_root.clone();
    let docs_root = cfg.docs_root.clone();
    reg.register(
        ToolSpec::new(
            "read_docs_folder",
            "Read every markdown file under the documentation folder.",
            ArgSchema::new(vec![
                ArgField::optional("max_files", ArgType::Integer, "File cap.")
                    .with_default(json!(200)),
                ArgField::optional("max_chars_per_file", ArgType::Integer, "Per-file cap.")
                    .with_default(json!(12_000)),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                let docs_root = docs_root.clone();
                async move { run_scan(move || read_docs_folder(&root, &docs_root, &args)).await }
            }),
        )
        .with_class("documentation.read"),
    );

    let root = cfg.repo_root.clone();
    let docs_root = cfg.docs_root.clone();
    reg.register(
        ToolSpec::new(
            "write_docs_file",
            "Write one markdown file under the documentation folder.",
            ArgSchema::new(vec![
                ArgField::required("path", ArgType::String, "Markdown path, docs-root relative."),
                ArgField::required("content", ArgType::String, "File content."),
            ]),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                let docs_root = docs_root.clone();
                async move {
                    let raw = args["path"].as_str().unwrap_or_default();
                    let mut rel = sanitize_rel_path(raw)?;
                    if !rel.starts_with(&format!("{docs_root}/")) {
                        rel = format!("{docs_root}/{rel}");
                    }
                    if !rel.to_lowercase().ends_with(".md") {
                        bail!("documentation files must end in .md: {rel}");
                    }
                    let mut content = args["content"].as_str().unwrap_or_default().to_string();
                    if content.trim().is_empty() {
                        bail!("content must not be empty");
                    }
                    if !content.ends_with('\n') {
                        content.push('\n');
                    }
                    let target = root.join(&rel);
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&target, content.as_bytes()).await?;
                    Ok(json!({ "path": rel, "bytes_written": content.len() }))
                }
            }),
        )
        .with_class("documentation.write")
        .writable(),
    );
}

// ---- repository read handlers ----

/// Runs a synchronous filesystem scan on the blocking pool so the executor's
/// deadline stays responsive; a panicking scan surfaces as an error value
/// instead of unwinding through the run.
async fn run_scan<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => bail!("scan task failed: {e}"),
    }
}

fn repo_grep(root: &Path, args: &Value) -> anyhow::Result<Value> {
    let pattern = args["pattern"].as_str().unwrap_or_default();
    if pattern.trim().is_empty() {
        bail!("pattern must not be empty");
    }
    let case_sensitive = args["case_sensitive"].as_bool().unwrap_or(false);
    let max_results = clamp_i64(args.get("max_results"), 1, 500, 50) as usize;
    let context_lines = clamp_i64(args.get("context_lines"), 0, 10, 2) as usize;

    let re = RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .with_context(|| format!("invalid pattern: {pattern}"))?;
    let include = build_globset(args.get("include_file_patterns"))?;
    let exclude = build_globset(args.get("exclude_file_patterns"))?;

    let mut matches = Vec::new();
    'files: for path in walk_files(root) {
        let rel = rel_display(root, &path);
        if let Some(set) = &include {
            if !set.is_match(&rel) {
                continue;
            }
        }
        if let Some(set) = &exclude {
            if set.is_match(&rel) {
                continue;
            }
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            // Binary or unreadable file, skip it.
            continue;
        };
        let lines: Vec<&str> = text.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if !re.is_match(line) {
                continue;
            }
            let start = i.saturating_sub(context_lines);
            let end = (i + context_lines + 1).min(lines.len());
            matches.push(json!({
                "path": rel,
                "line": i + 1,
                "text": line,
                "context": lines[start..end].to_vec(),
            }));
            if matches.len() >= max_results {
                break 'files;
            }
        }
    }
    Ok(json!({ "pattern": pattern, "matches": matches }))
}

fn open_file(root: &Path, args: &Value) -> anyhow::Result<Value> {
    let rel = sanitize_rel_path(args["path"].as_str().unwrap_or_default())?;
    let max_chars = clamp_i64(args.get("max_chars"), 1000, 400_000, 200_000) as usize;
    let path = root.join(&rel);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {rel}"))?;
    let (text, truncated) = limit_text(&text, max_chars);

    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Ok(json!({
            "path": rel,
            "start_line": 0,
            "end_line": 0,
            "total_lines": 0,
            "truncated": truncated,
            "content": "",
        }));
    }
    let total = lines.len();
    let start = clamp_i64(args.get("start_line"), 1, total as i64, 1) as usize;
    let end = match args.get("end_line").and_then(Value::as_i64) {
        Some(e) => (e.max(start as i64) as usize).min(total),
        None => total,
    };
    let content = lines[start - 1..end].join("\n");
    Ok(json!({
        "path": rel,
        "start_line": start,
        "end_line": end,
        "total_lines": total,
        "truncated": truncated,
        "content": content,
    }))
}

fn read_docs_folder(root: &Path, docs_root: &str, args: &Value) -> anyhow::Result<Value> {
    let max_files = clamp_i64(args.get("max_files"), 1, 500, 200) as usize;
    let max_chars = clamp_i64(args.get("max_chars_per_file"), 100, 30_000, 12_000) as usize;
    let docs_dir = root.join(docs_root);
    let mut files = Vec::new();
    for path in walk_files(&docs_dir) {
        if files.len() >= max_files {
            break;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let (content, truncated) = limit_text(&text, max_chars);
        let rel = rel_display(root, &path);
        files.push(json!({ "path": rel, "content": content, "truncated": truncated }));
    }
    Ok(json!({ "root": docs_root, "files": files }))
}

fn repo_tree(root: &Path, args: &Value) -> anyhow::Result<Value> {
    let base = args
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .trim_matches('/')
        .to_string();
    let max_depth = clamp_i64(args.get("max_depth"), 1, 12, 4) as usize;
    let max_entries = clamp_i64(args.get("max_entries"), 1, 3000, 800) as usize;
    let glob = match args.get("glob").and_then(Value::as_str) {
        Some(g) if !g.trim().is_empty() => Some(
            Glob::new(g.trim())
                .with_context(|| format!("invalid glob: {g}"))?
                .compile_matcher(),
        ),
        _ => None,
    };

    let mut dirs = std::collections::BTreeSet::new();
    let mut files = Vec::new();
    for path in walk_files(root) {
        let rel = rel_display(root, &path);
        if !base.is_empty() && rel != base && !rel.starts_with(&format!("{base}/")) {
            continue;
        }
        if let Some(matcher) = &glob {
            if !matcher.is_match(&rel) {
                continue;
            }
        }
        let depth = depth_from_base(&rel, &base);
        if depth <= max_depth {
            files.push((rel.clone(), depth));
        }
        let mut parts: Vec<&str> = rel.split('/').collect();
        while parts.len() > 1 {
            parts.pop();
            let dir = parts.join("/");
            if !base.is_empty() && dir != base && !dir.starts_with(&format!("{base}/")) {
                continue;
            }
            let d = depth_from_base(&dir, &base);
            if d <= max_depth {
                dirs.insert((dir, d));
            }
        }
    }

    let mut entries: Vec<Value> = dirs
        .into_iter()
        .map(|(path, depth)| json!({ "path": path, "type": "dir", "depth": depth }))
        .chain(
            files
                .into_iter()
                .map(|(path, depth)| json!({ "path": path, "type": "file", "depth": depth })),
        )
        .collect();
    entries.sort_by(|a, b| {
        let da = a["depth"].as_u64().unwrap_or(0);
        let db = b["depth"].as_u64().unwrap_or(0);
        da.cmp(&db).then_with(|| {
            a["path"]
                .as_str()
                .unwrap_or("")
                .cmp(b["path"].as_str().unwrap_or(""))
        })
    });
    entries.truncate(max_entries);
    let shown = if base.is_empty() { ".".to_string() } else { base };
    Ok(json!({ "root": shown, "entries": entries }))
}

// ---- shared helpers ----

/// Recursive file walk skipping ignored directory names. Returns sorted
/// paths for deterministic output.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !IGNORE_PARTS.contains(&name.as_str()) {
                    stack.push(path);
                }
            } else if path.is_file() {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

fn rel_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn depth_from_base(rel: &str, base: &str) -> usize {
    let from_base = if !base.is_empty() && rel.starts_with(&format!("{base}/")) {
        &rel[base.len() + 1..]
    } else if rel == base {
        ""
    } else {
        rel
    };
    if from_base.is_empty() {
        1
    } else {
        from_base.split('/').count()
    }
}

fn build_globset(raw: Option<&Value>) -> anyhow::Result<Option<GlobSet>> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return Ok(None);
    };
    let patterns: Vec<&str> = items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        builder.add(Glob::new(pat).with_context(|| format!("invalid glob: {pat}"))?);
    }
    Ok(Some(builder.build()?))
}

pub fn limit_text(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let cut: String = text.chars().take(max_chars).collect();
    (format!("{cut}\n... (truncated)\n"), true)
}

/// Rejects absolute paths and traversal components so tool arguments can
/// never escape the repo root.
pub fn sanitize_rel_path(raw: &str) -> anyhow::Result<String> {
    let p = raw.trim().trim_matches('`').trim_matches('\'').trim_matches('"').replace('\\', "/");
    let p = p.strip_prefix("./").unwrap_or(&p).to_string();
    if p.is_empty() || p == "." {
        bail!("path is required");
    }
    if p.starts_with('/') || p.split('/').any(|part| part == "..") {
        bail!("path escapes repo root: {raw}");
    }
    Ok(p)
}

fn sanitize_rel_paths(raw: &Value) -> anyhow::Result<Vec<String>> {
    let items = raw.as_array().context("paths must be an array")?;
    let mut out = Vec::new();
    for item in items {
        let p = sanitize_rel_path(item.as_str().unwrap_or_default())?;
        if !out.contains(&p) {
            out.push(p);
        }
    }
    if out.is_empty() {
        bail!("at least one path is required");
    }
    Ok(out)
}

pub fn sanitize_branch_name(raw: &str) -> anyhow::Result<String> {
    let branch = raw.trim();
    if branch.is_empty() {
        bail!("branch is required");
    }
    if branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.contains("..")
        || branch.contains(' ')
    {
        bail!("invalid branch name: {raw}");
    }
    if !branch
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        bail!("invalid branch name: {raw}");
    }
    Ok(branch.to_string())
}

async fn run_git(root: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git").arg("-C").arg(root).args(args).output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("git {} timed out", args.join(" ")))?
    .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        let detail = if detail.is_empty() { stdout.trim() } else { detail };
        bail!("git {} failed: {detail}", args.join(" "));
    }
    Ok(stdout)
}

async fn current_branch(root: &Path) -> anyhow::Result<String> {
    let out = run_git(root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let branch = out.trim();
    Ok(if branch.is_empty() { "main".to_string() } else { branch.to_string() })
}

async fn branch_exists(root: &Path, branch: &str) -> bool {
    run_git(root, &["rev-parse", "--verify", branch]).await.is_ok()
}

fn clamp_i64(raw: Option<&Value>, min: i64, max: i64, default: i64) -> i64 {
    raw.and_then(Value::as_i64).unwrap_or(default).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::policy::ToolPolicy;
    use crate::types::CallContext;

    fn ctx() -> CallContext {
        CallContext::new("proj-1", "main", "dev@example.com", "conv-1", ToolPolicy::default())
    }

    fn seed_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("documentation/guides")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/junk")).unwrap();
        std::fs::write(
            dir.path().join("src/main.rs"),
            "fn main() {\n    println!(\"hello\");\n}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn add(a: i32, b: i32) -> i32 { a + b }\n").unwrap();
        std::fs::write(
            dir.path().join("documentation/guides/setup.md"),
            "# Setup\nInstall things.\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("node_modules/junk/skip.js"), "var hello = 1;\n").unwrap();
        dir
    }

    #[test]
    fn grep_finds_matches_and_skips_ignored_dirs() {
        let dir = seed_repo();
        let out = repo_grep(dir.path(), &json!({"pattern": "hello", "max_results": 10})).unwrap();
        let matches = out["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["path"], "src/main.rs");
        assert_eq!(matches[0]["line"], 2);
    }

    #[test]
    fn grep_respects_include_and_exclude_patterns() {
        let dir = seed_repo();
        let out = repo_grep(
            dir.path(),
            &json!({"pattern": "fn", "include_file_patterns": ["src/*.rs"], "exclude_file_patterns": ["src/lib.rs"]}),
        )
        .unwrap();
        let matches = out["matches"].as_array().unwrap();
        assert!(matches.iter().all(|m| m["path"] == "src/main.rs"));
        assert!(!matches.is_empty());
    }

    #[test]
    fn open_file_slices_lines() {
        let dir = seed_repo();
        let out = open_file(
            dir.path(),
            &json!({"path": "src/main.rs", "start_line": 2, "end_line": 2}),
        )
        .unwrap();
        assert_eq!(out["content"], "    println!(\"hello\");");
        assert_eq!(out["start_line"], 2);
        assert_eq!(out["total_lines"], 3);
    }

    #[tokio::test]
    async fn open_file_handles_empty_files() {
        let dir = seed_repo();
        std::fs::write(dir.path().join("src/empty.rs"), "").unwrap();

        let out = open_file(dir.path(), &json!({"path": "src/empty.rs"})).unwrap();
        assert_eq!(out["total_lines"], 0);
        assert_eq!(out["content"], "");
        assert_eq!(out["start_line"], 0);
        assert_eq!(out["end_line"], 0);

        // Same result through the registered handler.
        let reg = builtin_registry(&ToolsConfig::new(dir.path()));
        let tool = reg.get("open_file").unwrap();
        let out = tool
            .handler
            .run(json!({"path": "src/empty.rs"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["total_lines"], 0);
    }

    #[tokio::test]
    async fn scan_panics_become_errors_not_unwinds() {
        let err = run_scan(|| -> anyhow::Result<serde_json::Value> { panic!("boom") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scan task failed"));
    }

    #[test]
    fn open_file_rejects_escaping_paths() {
        let dir = seed_repo();
        assert!(open_file(dir.path(), &json!({"path": "../etc/passwd"})).is_err());
        assert!(open_file(dir.path(), &json!({"path": "/etc/passwd"})).is_err());
    }

    #[test]
    fn repo_tree_lists_dirs_before_deeper_files() {
        let dir = seed_repo();
        let out = repo_tree(dir.path(), &json!({"path": "src"})).unwrap();
        let entries = out["entries"].as_array().unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e["path"].as_str().unwrap()).collect();
        assert!(paths.contains(&"src/main.rs"));
        assert!(paths.contains(&"src/lib.rs"));
        assert!(!paths.iter().any(|p| p.contains("node_modules")));
    }

    #[test]
    fn limit_text_appends_truncation_marker() {
        let (out, truncated) = limit_text("abcdef", 3);
        assert!(truncated);
        assert!(out.starts_with("abc"));
        assert!(out.contains("... (truncated)"));
        let (out, truncated) = limit_text("abc", 10);
        assert_eq!(out, "abc");
        assert!(!truncated);
    }

    #[test]
    fn branch_and_path_sanitizers_reject_hostile_input() {
        assert!(sanitize_branch_name("feature/login").is_ok());
        assert!(sanitize_branch_name("-rf").is_err());
        assert!(sanitize_branch_name("a b").is_err());
        assert!(sanitize_branch_name("a..b").is_err());
        assert!(sanitize_rel_path("src/main.rs").is_ok());
        assert_eq!(sanitize_rel_path("./src/main.rs").unwrap(), "src/main.rs");
        assert!(sanitize_rel_path("a/../../b").is_err());
    }

    #[tokio::test]
    async fn discovery_tools_serve_the_full_catalog() {
        let dir = seed_repo();
        let reg = builtin_registry(&ToolsConfig::new(dir.path()));
        assert!(reg.has("repo_grep"));
        assert!(reg.has("git_commit"));
        assert!(reg.has("write_docs_file"));

        let list = reg.get("list_tools").unwrap();
        let out = list.handler.run(json!({}), &ctx()).await.unwrap();
        let tools = out["tools"].as_array().unwrap();
        assert_eq!(tools.len(), reg.len());
        // The discovery tools describe themselves too.
        assert!(tools.iter().any(|t| t["name"] == "list_tools"));

        let details = reg.get("get_tool_details").unwrap();
        let out = details
            .handler
            .run(json!({"name": "repo_grep"}), &ctx())
            .await
            .unwrap();
        assert!(out["details"].as_str().unwrap().contains("pattern (string, REQUIRED)"));
    }

    #[tokio::test]
    async fn search_tools_matches_name_and_description() {
        let dir = seed_repo();
        let reg = builtin_registry(&ToolsConfig::new(dir.path()));
        let search = reg.get("search_tools").unwrap();
        let out = search
            .handler
            .run(json!({"query": "branch"}), &ctx())
            .await
            .unwrap();
        let names: Vec<&str> = out["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"git_list_branches"));
        assert!(names.contains(&"git_checkout_branch"));
        assert!(!names.contains(&"git_status"));
    }

    #[tokio::test]
    async fn request_user_input_normalizes_choices() {
        let dir = seed_repo();
        let reg = builtin_registry(&ToolsConfig::new(dir.path()));
        let tool = reg.get("request_user_input").unwrap();
        let out = tool
            .handler
            .run(
                json!({
                    "question": "Which branch?",
                    "answer_mode": "single_choice",
                    "options": ["main", "Main", "dev"],
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out["question"], "Which branch?");
        assert_eq!(out["answer_mode"], "single_choice");
        assert_eq!(out["options"], json!(["main", "dev"]));

        // A single distinct option demotes to open_text.
        let out = tool
            .handler
            .run(
                json!({"question": "Sure?", "answer_mode": "single_choice", "options": ["yes"]}),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out["answer_mode"], "open_text");
        assert_eq!(out["options"], json!([]));
    }

    #[tokio::test]
    async fn write_docs_file_confines_paths_to_docs_root() {
        let dir = seed_repo();
        let reg = builtin_registry(&ToolsConfig::new(dir.path()));
        let tool = reg.get("write_docs_file").unwrap();
        let out = tool
            .handler
            .run(json!({"path": "guides/new.md", "content": "# New"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["path"], "documentation/guides/new.md");
        let written =
            std::fs::read_to_string(dir.path().join("documentation/guides/new.md")).unwrap();
        assert_eq!(written, "# New\n");

        assert!(tool
            .handler
            .run(json!({"path": "notes.txt", "content": "x"}), &ctx())
            .await
            .is_err());
        assert!(tool
            .handler
            .run(json!({"path": "../escape.md", "content": "x"}), &ctx())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn read_docs_folder_returns_markdown_only() {
        let dir = seed_repo();
        std::fs::write(dir.path().join("documentation/ignore.txt"), "not md").unwrap();
        let reg = builtin_registry(&ToolsConfig::new(dir.path()));
        let tool = reg.get("read_docs_folder").unwrap();
        let out = tool.handler.run(json!({}), &ctx()).await.unwrap();
        let files = out["files"].as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["path"], "documentation/guides/setup.md");
        assert!(files[0]["content"].as_str().unwrap().contains("# Setup"));
    }
}
