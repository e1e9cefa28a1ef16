use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::types::CallContext;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ArgType {
    pub fn label(self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Integer => "integer",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
            ArgType::Array => "array",
            ArgType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgField {
    pub name: String,
    pub arg_type: ArgType,
    pub required: bool,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl ArgField {
    pub fn required(name: impl Into<String>, arg_type: ArgType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg_type,
            required: true,
            description: description.into(),
            default: None,
            aliases: Vec::new(),
        }
    }

    pub fn optional(name: impl Into<String>, arg_type: ArgType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg_type,
            required: false,
            description: description.into(),
            default: None,
            aliases: Vec::new(),
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

/// Argument schema for one tool: a flat field list plus an escape hatch for
/// tools that accept arbitrary extra keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArgSchema {
    pub fields: Vec<ArgField>,
    pub allow_extra: bool,
}

impl ArgSchema {
    pub fn new(fields: Vec<ArgField>) -> Self {
        Self {
            fields,
            allow_extra: false,
        }
    }

    pub fn allowing_extra(mut self) -> Self {
        self.allow_extra = true;
        self
    }

    /// Canonical names plus declared aliases.
    pub fn allowed_names(&self) -> HashSet<&str> {
        let mut out = HashSet::new();
        for f in &self.fields {
            out.insert(f.name.as_str());
            for a in &f.aliases {
                out.insert(a.as_str());
            }
        }
        out
    }

    pub fn field(&self, name: &str) -> Option<&ArgField> {
        self.fields
            .iter()
            .find(|f| f.name == name || f.aliases.iter().any(|a| a == name))
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, args: Value, ctx: &CallContext) -> anyhow::Result<Value>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(&self, args: Value, ctx: &CallContext) -> anyhow::Result<Value> {
        (self.f)(args, ctx.clone()).await
    }
}

/// Wraps an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    Builtin,
    UserDefined,
}

/// Immutable capability descriptor. Retry, cache and approval knobs are
/// always present and default to disabled; builtin and user-defined tools go
/// through identical enforcement.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: ArgSchema,
    pub handler: Arc<dyn ToolHandler>,
    pub timeout: Duration,
    pub rate_limit_per_min: u32,
    pub read_only: bool,
    pub max_retries: u32,
    pub cache_ttl: Duration,
    pub require_approval: bool,
    pub class_key: String,
    pub origin: ToolOrigin,
    pub version: String,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ArgSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler,
            timeout: DEFAULT_TIMEOUT,
            rate_limit_per_min: DEFAULT_RATE_LIMIT_PER_MIN,
            read_only: true,
            max_retries: 0,
            cache_ttl: Duration::ZERO,
            require_approval: false,
            class_key: "util".to_string(),
            origin: ToolOrigin::Builtin,
            version: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, per_min: u32) -> Self {
        self.rate_limit_per_min = per_min;
        self
    }

    pub fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn with_class(mut self, class_key: impl Into<String>) -> Self {
        self.class_key = class_key.into();
        self
    }

    pub fn with_origin(mut self, origin: ToolOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("class_key", &self.class_key)
            .field("read_only", &self.read_only)
            .field("origin", &self.origin)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogRow {
    pub name: String,
    pub description: String,
    pub class_key: String,
    pub read_only: bool,
    pub timeout_sec: u64,
    pub rate_limit_per_min: u32,
    pub max_retries: u32,
    pub cache_ttl_sec: u64,
    pub require_approval: bool,
    pub origin: ToolOrigin,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Tool name → descriptor map. Last registration for a name wins; shadowing
/// a builtin with a user-defined tool is logged as a collision, not an error.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<ToolSpec>>,
    collisions: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        if let Some(existing) = self.tools.get(&spec.name) {
            eprintln!(
                "tool.name_override name={} prior_origin={:?} new_origin={:?}",
                spec.name, existing.origin, spec.origin
            );
            self.collisions.push(spec.name.clone());
        }
        self.tools.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn collisions(&self) -> &[String] {
        &self.collisions
    }

    pub fn catalog(&self) -> Vec<CatalogRow> {
        self.tools
            .values()
            .map(|spec| CatalogRow {
                name: spec.name.clone(),
                description: spec.description.clone(),
                class_key: spec.class_key.clone(),
                read_only: spec.read_only,
                timeout_sec: spec.timeout.as_secs(),
                rate_limit_per_min: spec.rate_limit_per_min,
                max_retries: spec.max_retries,
                cache_ttl_sec: spec.cache_ttl.as_secs(),
                require_approval: spec.require_approval,
                origin: spec.origin,
                version: spec.version.clone(),
            })
            .collect()
    }

    /// Renders the full catalog as prompt text, one block per tool.
    pub fn render_catalog_text(&self) -> String {
        let mut out = String::new();
        for spec in self.tools.values() {
            out.push_str(&render_tool_block(spec));
            out.push('\n');
        }
        out.trim_end().to_string() + "\n"
    }

    pub fn render_tool_details(&self, name: &str) -> Option<String> {
        self.tools.get(name).map(|spec| render_tool_block(spec))
    }
}

fn render_default(default: &Value) -> String {
    match default {
        Value::String(s) => {
            let shown = if s.chars().count() > 40 {
                let cut: String = s.chars().take(37).collect();
                format!("{cut}...")
            } else {
                s.clone()
            };
            format!(", default=\"{shown}\"")
        }
        Value::Null => ", default=null".to_string(),
        other => format!(", default={other}"),
    }
}

fn render_tool_block(spec: &ToolSpec) -> String {
    let mut lines = vec![
        spec.name.clone(),
        format!("  Description: {}", spec.description),
    ];
    if spec.schema.fields.is_empty() {
        lines.push("  Parameters: none".to_string());
    } else {
        lines.push("  Parameters:".to_string());
        for f in &spec.schema.fields {
            let req = if f.required { "REQUIRED" } else { "OPTIONAL" };
            let default = f.default.as_ref().map(render_default).unwrap_or_default();
            lines.push(format!(
                "    - {} ({}, {}{}): {}",
                f.name,
                f.arg_type.label(),
                req,
                default,
                f.description
            ));
        }
    }
    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{handler_fn, ArgField, ArgSchema, ArgType, ToolOrigin, ToolRegistry, ToolSpec};

    fn echo_spec(name: &str) -> ToolSpec {
        ToolSpec::new(
            name,
            "Echo the supplied text.",
            ArgSchema::new(vec![ArgField::required(
                "text",
                ArgType::String,
                "Text to echo back.",
            )]),
            handler_fn(|args, _ctx| async move { Ok(args) }),
        )
    }

    #[test]
    fn last_registration_wins_and_collision_is_recorded() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_spec("echo"));
        reg.register(echo_spec("echo").with_origin(ToolOrigin::UserDefined));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.collisions(), ["echo"]);
        assert_eq!(reg.get("echo").unwrap().origin, ToolOrigin::UserDefined);
    }

    #[test]
    fn allowed_names_include_aliases() {
        let schema = ArgSchema::new(vec![ArgField::required(
            "project_id",
            ArgType::String,
            "Project identifier.",
        )
        .with_alias("projectId")]);
        let names = schema.allowed_names();
        assert!(names.contains("project_id"));
        assert!(names.contains("projectId"));
    }

    #[test]
    fn catalog_text_marks_required_and_defaults() {
        let mut reg = ToolRegistry::new();
        let spec = ToolSpec::new(
            "grep",
            "Search the repository.",
            ArgSchema::new(vec![
                ArgField::required("pattern", ArgType::String, "Pattern to search for."),
                ArgField::optional("max_results", ArgType::Integer, "Result cap.")
                    .with_default(json!(50)),
            ]),
            handler_fn(|args, _ctx| async move { Ok(args) }),
        );
        reg.register(spec);
        let text = reg.render_catalog_text();
        assert!(text.contains("grep"));
        assert!(text.contains("pattern (string, REQUIRED)"));
        assert!(text.contains("max_results (integer, OPTIONAL, default=50)"));
    }
}
