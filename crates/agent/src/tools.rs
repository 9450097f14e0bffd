//! Tool handler registry for server-routed `execution_request`s.
//!
//! Concrete tools (shell, Discord, OCR, GUI automation) plug in from
//! outside through [`ToolHandler`]; the agent core only owns lookup and
//! the built-in filesystem handlers that back the vault and the
//! collection cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use dotbot_domain::tool::ToolDefinition;

/// Result of running one tool on the device.
pub struct HandlerResult {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
}

impl HandlerResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(message.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn call(&self, args: Value) -> HandlerResult;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        self.handlers.insert(name, handler);
    }

    /// The manifest advertised in `auth` / `register_device`.
    pub fn manifest(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(&self, name: &str, args: Value) -> HandlerResult {
        match self.handlers.get(name) {
            Some(handler) => handler.call(args).await,
            None => HandlerResult::error(format!("unknown tool: {name}")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in filesystem handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `filesystem.create_file` / `filesystem.read_file` rooted under the
/// bot directory. The collection navigator's research cache writes land
/// here. `~` expands to the bot root's parent (the home directory).
pub struct FilesystemTools {
    home: PathBuf,
}

impl FilesystemTools {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        if let Some(rest) = raw.strip_prefix("~/") {
            return self.home.join(rest);
        }
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.home.join(path)
        }
    }

    pub fn create_handler(self: &Arc<Self>) -> Arc<dyn ToolHandler> {
        Arc::new(CreateFile(self.clone()))
    }

    pub fn read_handler(self: &Arc<Self>) -> Arc<dyn ToolHandler> {
        Arc::new(ReadFile(self.clone()))
    }
}

struct CreateFile(Arc<FilesystemTools>);

#[async_trait::async_trait]
impl ToolHandler for CreateFile {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "filesystem.create_file".into(),
            description: "Write a file on this device (parents created).".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
            category: "filesystem".into(),
        }
    }

    async fn call(&self, args: Value) -> HandlerResult {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return HandlerResult::error("missing path");
        };
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        let resolved = self.0.resolve(path);
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return HandlerResult::error(format!("mkdir failed: {e}"));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => HandlerResult::ok(serde_json::json!({ "written": content.len() })),
            Err(e) => HandlerResult::error(format!("write failed: {e}")),
        }
    }
}

struct ReadFile(Arc<FilesystemTools>);

#[async_trait::async_trait]
impl ToolHandler for ReadFile {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "filesystem.read_file".into(),
            description: "Read a file from this device.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "path": {"type": "string"} },
                "required": ["path"]
            }),
            category: "filesystem".into(),
        }
    }

    async fn call(&self, args: Value) -> HandlerResult {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return HandlerResult::error("missing path");
        };
        match tokio::fs::read_to_string(self.0.resolve(path)).await {
            Ok(content) => HandlerResult::ok(Value::String(content)),
            Err(e) => HandlerResult::error(format!("read failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(home: &Path) -> ToolRegistry {
        let fs = Arc::new(FilesystemTools::new(home));
        let mut registry = ToolRegistry::new();
        registry.register(fs.create_handler());
        registry.register(fs.read_handler());
        registry
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry(dir.path());

        let write = registry
            .execute(
                "filesystem.create_file",
                serde_json::json!({
                    "path": "~/.bot/memory/research-cache/t-1.json",
                    "content": "{\"items\": []}"
                }),
            )
            .await;
        assert!(write.success);

        let read = registry
            .execute(
                "filesystem.read_file",
                serde_json::json!({ "path": "~/.bot/memory/research-cache/t-1.json" }),
            )
            .await;
        assert!(read.success);
        assert_eq!(read.result, Value::String("{\"items\": []}".into()));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = registry(dir.path())
            .execute("ocr.scan", serde_json::json!({}))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[test]
    fn manifest_is_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = registry(dir.path()).manifest();
        let names: Vec<&str> = manifest.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["filesystem.create_file", "filesystem.read_file"]
        );
    }
}
