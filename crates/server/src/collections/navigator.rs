//! The navigator pipeline and the `result.*` tools.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use dotbot_domain::config::CollectionConfig;
use dotbot_domain::error::{Error, Result};

use super::introspect::{self, field_value, render_value, OutputHints};
use super::query;
use super::{CollectionRef, CollectionStore, HintStore};

/// Cell values in overview tables are clipped to this.
const CELL_MAX: usize = 80;
/// `result.get` / `result.query` output cap.
const OUTPUT_CAP: usize = 8000;
/// `result.filter` returns at most this many matches.
const FILTER_MAX: usize = 50;

/// Client-side file access used for the cache. The real implementation
/// routes `filesystem.*` tool calls over the channel; tests use an
/// in-memory map.
#[async_trait::async_trait]
pub trait ClientFiles: Send + Sync {
    /// Fire-and-forget write of the raw cache file.
    async fn write_file(&self, path: &str, content: &str);
    /// Read a cache file back.
    async fn read_file(&self, path: &str) -> Result<String>;
}

/// Outcome of feeding a tool result through the pipeline.
pub enum ProcessedResult {
    /// Small result — hand it to the LLM unchanged.
    Passthrough(String),
    /// Oversized result — cached and summarized.
    Overview {
        collection_id: String,
        markdown: String,
    },
}

pub struct Navigator {
    store: Arc<CollectionStore>,
    hints: Arc<HintStore>,
    files: Arc<dyn ClientFiles>,
    config: CollectionConfig,
    /// Client-side directory for raw cache files.
    cache_dir: String,
}

impl Navigator {
    pub fn new(
        store: Arc<CollectionStore>,
        hints: Arc<HintStore>,
        files: Arc<dyn ClientFiles>,
        config: CollectionConfig,
        cache_dir: impl Into<String>,
    ) -> Self {
        Self {
            store,
            hints,
            files,
            config,
            cache_dir: cache_dir.into(),
        }
    }

    /// Intercept a tool result. Anything at or under the threshold passes
    /// through; larger results are cached client-side, introspected, and
    /// replaced by a markdown overview.
    pub async fn process_result(
        &self,
        tool_id: &str,
        raw: &str,
        now: DateTime<Utc>,
    ) -> ProcessedResult {
        if raw.len() <= self.config.threshold_chars {
            return ProcessedResult::Passthrough(raw.to_string());
        }

        let collection_id = format!("col-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let safe_tool = safe_tool_id(tool_id);
        let cache_path = format!(
            "{}/{}-{}.json",
            self.cache_dir,
            safe_tool,
            now.timestamp_millis()
        );

        // The LLM sees only the overview; the raw bytes go to the client.
        self.files.write_file(&cache_path, raw).await;

        // Reuse stored hints while they still describe the data.
        let mut hints = match self.hints.get(tool_id) {
            Some(stored) => {
                let items = introspect::extract_items(raw, &stored);
                if !items.is_empty() && introspect::hints_match(&stored, &items) {
                    stored
                } else {
                    let fresh = introspect::introspect(raw, now);
                    self.hints.put(tool_id, fresh.clone());
                    fresh
                }
            }
            None => {
                let fresh = introspect::introspect(raw, now);
                self.hints.put(tool_id, fresh.clone());
                fresh
            }
        };
        hints.verified_at = now;

        let items = introspect::extract_items(raw, &hints);
        self.store.insert(CollectionRef {
            id: collection_id.clone(),
            cache_path,
            tool_id: tool_id.to_string(),
            hints: hints.clone(),
            item_count: items.len(),
            last_access: now,
        });

        let markdown = render_overview(
            &collection_id,
            tool_id,
            &items,
            &hints,
            self.config.overview_rows,
        );
        ProcessedResult::Overview {
            collection_id,
            markdown,
        }
    }

    async fn load(&self, collection_id: &str, now: DateTime<Utc>) -> Result<(CollectionRef, Vec<Value>)> {
        self.store.purge(now);
        let reference = self.store.touch(collection_id, now).ok_or_else(|| {
            Error::Tool {
                tool: "result".into(),
                message: format!(
                    "collection '{collection_id}' not found — it may have expired (30 min idle)"
                ),
            }
        })?;
        let raw = self.files.read_file(&reference.cache_path).await?;
        let items = introspect::extract_items(&raw, &reference.hints);
        Ok((reference, items))
    }

    /// `result.overview` — re-render the summary table.
    pub async fn overview(&self, collection_id: &str, now: DateTime<Utc>) -> Result<String> {
        let (reference, items) = self.load(collection_id, now).await?;
        Ok(render_overview(
            collection_id,
            &reference.tool_id,
            &items,
            &reference.hints,
            self.config.overview_rows,
        ))
    }

    /// `result.get` — one full item, or a field subset of it.
    pub async fn get(
        &self,
        collection_id: &str,
        index: usize,
        fields: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let (reference, items) = self.load(collection_id, now).await?;
        let item = items.get(index).ok_or_else(|| Error::Tool {
            tool: "result.get".into(),
            message: format!(
                "index {index} out of range (collection has {} items)",
                items.len()
            ),
        })?;

        let rendered = match fields {
            Some(fields) if !fields.is_empty() => {
                let mut obj = serde_json::Map::new();
                for f in fields {
                    if let Some(v) = field_value(item, f) {
                        obj.insert(f.clone(), v.clone());
                    }
                }
                serde_json::to_string_pretty(&Value::Object(obj))?
            }
            _ => serde_json::to_string_pretty(item)?,
        };

        if rendered.len() <= OUTPUT_CAP {
            return Ok(rendered);
        }
        let mut clipped = rendered[..OUTPUT_CAP].to_string();
        clipped.push_str("\n... [truncated]");
        if !reference.hints.noise_fields.is_empty() {
            clipped.push_str(&format!(
                "\nOmitted large fields: {}. Retrieve one with \
                 result.get(index={index}, fields=[\"{}\"]).",
                reference.hints.noise_fields.join(", "),
                reference.hints.noise_fields[0]
            ));
        }
        Ok(clipped)
    }

    /// `result.filter` — field/op/value match, summary-table output.
    pub async fn filter(
        &self,
        collection_id: &str,
        field: &str,
        op: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        const OPS: &[&str] = &["contains", "equals", "not_equals", "gt", "lt"];
        if !OPS.contains(&op) {
            return Err(Error::Tool {
                tool: "result.filter".into(),
                message: format!("unknown op '{op}' (expected one of {OPS:?})"),
            });
        }
        let dsl_op = match op {
            "equals" => "==",
            "not_equals" => "!=",
            "gt" => ">",
            "lt" => "<",
            other => other,
        };

        let (reference, items) = self.load(collection_id, now).await?;
        let quoted = if value.parse::<f64>().is_ok() {
            value.to_string()
        } else {
            format!("\"{value}\"")
        };
        let expr = format!("[?{field} {dsl_op} {quoted}]");
        let filtered = match query::evaluate(&items, &expr) {
            Ok(Value::Array(matched)) => matched,
            Ok(other) => vec![other],
            Err(e) => {
                return Err(Error::Tool {
                    tool: "result.filter".into(),
                    message: e,
                })
            }
        };

        let total = filtered.len();
        let shown: Vec<Value> = filtered.into_iter().take(FILTER_MAX).collect();
        let mut table = render_table(&shown, &reference.hints, shown.len());
        if total > FILTER_MAX {
            table.push_str(&format!("\n…and {} more matches.", total - FILTER_MAX));
        } else if total == 0 {
            table = "No items matched.".to_string();
        }
        Ok(table)
    }

    /// `result.query` — evaluate a DSL expression.
    pub async fn query(
        &self,
        collection_id: &str,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let (_, items) = self.load(collection_id, now).await?;
        let result = query::evaluate(&items, expression).map_err(|e| Error::Tool {
            tool: "result.query".into(),
            message: e,
        })?;
        let mut rendered = serde_json::to_string_pretty(&result)?;
        if rendered.len() > OUTPUT_CAP {
            rendered.truncate(OUTPUT_CAP);
            rendered.push_str("\n... [truncated]");
        }
        Ok(rendered)
    }
}

/// The `result.*` tool definitions exposed to every agent.
pub fn navigator_tool_defs() -> Vec<dotbot_domain::tool::ToolDefinition> {
    use dotbot_domain::tool::ToolDefinition;
    let object = |props: serde_json::Value, required: &[&str]| {
        serde_json::json!({"type": "object", "properties": props, "required": required})
    };
    vec![
        ToolDefinition {
            name: "result.overview".into(),
            description: "Re-render the summary table for a cached collection.".into(),
            parameters: object(
                serde_json::json!({
                    "collection_id": {"type": "string"}
                }),
                &["collection_id"],
            ),
            category: "result".into(),
        },
        ToolDefinition {
            name: "result.get".into(),
            description: "Fetch one full item from a collection by index, optionally only \
                          selected fields."
                .into(),
            parameters: object(
                serde_json::json!({
                    "collection_id": {"type": "string"},
                    "index": {"type": "integer"},
                    "fields": {"type": "array", "items": {"type": "string"}}
                }),
                &["collection_id", "index"],
            ),
            category: "result".into(),
        },
        ToolDefinition {
            name: "result.filter".into(),
            description: "Filter collection items by field/op/value. Ops: contains, equals, \
                          not_equals, gt, lt. Returns up to 50 matches."
                .into(),
            parameters: object(
                serde_json::json!({
                    "collection_id": {"type": "string"},
                    "field": {"type": "string"},
                    "op": {"type": "string"},
                    "value": {"type": "string"},
                    "fields": {"type": "array", "items": {"type": "string"}}
                }),
                &["collection_id", "field", "op", "value"],
            ),
            category: "result".into(),
        },
        ToolDefinition {
            name: "result.query".into(),
            description: "Evaluate a query over a collection: [*].field, [0:5].field, \
                          [?field==\"x\"], field1,field2, pipes unique/count/sum/avg/min/max, \
                          .length."
                .into(),
            parameters: object(
                serde_json::json!({
                    "collection_id": {"type": "string"},
                    "expression": {"type": "string"}
                }),
                &["collection_id", "expression"],
            ),
            category: "result".into(),
        },
    ]
}

fn safe_tool_id(tool_id: &str) -> String {
    tool_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn render_overview(
    collection_id: &str,
    tool_id: &str,
    items: &[Value],
    hints: &OutputHints,
    max_rows: usize,
) -> String {
    let mut out = format!(
        "Result from `{tool_id}` is large ({} items) — cached as collection `{collection_id}`.\n\n",
        items.len()
    );
    out.push_str(&render_table(items, hints, max_rows));
    if items.len() > max_rows {
        out.push_str(&format!("\n…and {} more.", items.len() - max_rows));
    }
    out.push_str(&format!(
        "\n\nDrill in with result.get(collection_id=\"{collection_id}\", index=N), \
         result.filter(...), or result.query(...)."
    ));
    out
}

fn render_table(items: &[Value], hints: &OutputHints, max_rows: usize) -> String {
    let fields = &hints.summary_fields;
    let mut out = String::new();
    out.push_str("| # |");
    for f in fields {
        out.push_str(&format!(" {f} |"));
    }
    out.push('\n');
    out.push_str("|---|");
    for _ in fields {
        out.push_str("---|");
    }
    out.push('\n');
    for (i, item) in items.iter().take(max_rows).enumerate() {
        out.push_str(&format!("| {i} |"));
        for f in fields {
            let cell = field_value(item, f)
                .map(render_value)
                .unwrap_or_default()
                .replace('|', "\\|")
                .replace('\n', " ");
            let cell = if cell.len() > CELL_MAX {
                let mut cut = CELL_MAX;
                while !cell.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}…", &cell[..cut])
            } else {
                cell
            };
            out.push_str(&format!(" {cell} |"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemFiles {
        files: Mutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl ClientFiles for MemFiles {
        async fn write_file(&self, path: &str, content: &str) {
            self.files.lock().insert(path.into(), content.into());
        }
        async fn read_file(&self, path: &str) -> Result<String> {
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::Tool {
                    tool: "filesystem.read_file".into(),
                    message: format!("no such file {path}"),
                })
        }
    }

    fn navigator() -> (Navigator, Arc<CollectionStore>) {
        let store = Arc::new(CollectionStore::new(30));
        let dir = tempfile::TempDir::new().unwrap();
        let hints = Arc::new(HintStore::open(dir.path().join("hints.json")));
        std::mem::forget(dir); // keep the tempdir alive for the test process
        let files = Arc::new(MemFiles {
            files: Mutex::new(HashMap::new()),
        });
        (
            Navigator::new(
                store.clone(),
                hints,
                files,
                CollectionConfig::default(),
                "~/.bot/memory/research-cache",
            ),
            store,
        )
    }

    fn big_raw(n: usize) -> String {
        let items: Vec<Value> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "id": format!("msg-{i}"),
                    "snippet": format!("snippet {i}"),
                    "body": "x".repeat(1200),
                })
            })
            .collect();
        serde_json::json!({ "messages": items }).to_string()
    }

    #[tokio::test]
    async fn exactly_threshold_passes_through() {
        let (nav, store) = navigator();
        let raw = "y".repeat(10_000);
        match nav.process_result("t.small", &raw, Utc::now()).await {
            ProcessedResult::Passthrough(text) => assert_eq!(text.len(), 10_000),
            _ => panic!("10,000 chars must pass through"),
        }
        assert!(store.is_empty());

        let raw = "y".repeat(10_001);
        match nav.process_result("t.small", &raw, Utc::now()).await {
            ProcessedResult::Overview { .. } => {}
            _ => panic!("10,001 chars must become a collection"),
        }
    }

    #[tokio::test]
    async fn overview_caps_rows_with_footer() {
        let (nav, _) = navigator();
        let raw = big_raw(40);
        let ProcessedResult::Overview { markdown, .. } =
            nav.process_result("gmail.list_messages", &raw, Utc::now()).await
        else {
            panic!("expected overview");
        };
        let data_rows = markdown
            .lines()
            .filter(|l| l.starts_with("| ") && !l.starts_with("| #"))
            .count();
        assert_eq!(data_rows, 25);
        assert!(markdown.contains("…and 15 more."));
        assert!(markdown.contains("result.get"));
    }

    #[tokio::test]
    async fn get_filter_query_round_trip() {
        let (nav, _) = navigator();
        let raw = big_raw(30);
        let now = Utc::now();
        let ProcessedResult::Overview { collection_id, .. } =
            nav.process_result("gmail.list_messages", &raw, now).await
        else {
            panic!("expected overview");
        };

        let item = nav.get(&collection_id, 3, None, now).await.unwrap();
        assert!(item.contains("msg-3"));

        let subset = nav
            .get(&collection_id, 3, Some(&["id".to_string()]), now)
            .await
            .unwrap();
        assert!(subset.contains("msg-3"));
        assert!(!subset.contains("snippet 3"));

        let filtered = nav
            .filter(&collection_id, "id", "equals", "msg-7", now)
            .await
            .unwrap();
        assert!(filtered.contains("msg-7"));

        let count = nav
            .query(&collection_id, "[*].id | count", now)
            .await
            .unwrap();
        assert!(count.contains("30"));
    }

    #[tokio::test]
    async fn unknown_collection_is_a_tool_error() {
        let (nav, _) = navigator();
        let err = nav.overview("col-missing", Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn filter_rejects_unknown_op() {
        let (nav, _) = navigator();
        let raw = big_raw(30);
        let now = Utc::now();
        let ProcessedResult::Overview { collection_id, .. } =
            nav.process_result("t", &raw, now).await
        else {
            panic!("expected overview");
        };
        let err = nav
            .filter(&collection_id, "id", "regex", "x", now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown op"));
    }
}
