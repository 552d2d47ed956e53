//! Worker subprocess contract: prompt rendering, environment policy, and
//! parsing of the `MC_RESULT:` terminal record and stream-json output.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{EnvConfig, PricingConfig};
use mc_db::models::WorkUnit;

pub const RESULT_MARKER: &str = "MC_RESULT:";

/// Env var name fragments that are never forwarded to workers.
const SECRET_NAME_FRAGMENTS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

/// A worker's parsed terminal report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerReport {
    pub status: String,
    pub summary: String,
    pub commits: Vec<String>,
    pub discoveries: Vec<String>,
    pub concerns: Vec<String>,
    pub files_changed: Vec<String>,
}

/// Parse the last `MC_RESULT:` record from worker output.
///
/// Tries the strict schema first; on mismatch falls back to a lenient pass
/// that takes whatever fields are present and defaults missing or
/// non-list values to empty. Returns `None` only when no parseable record
/// exists -- the caller then falls back to exit-code semantics rather than
/// failing the unit on a parse error alone.
pub fn parse_mc_result(output: &str) -> Option<WorkerReport> {
    let idx = output.rfind(RESULT_MARKER)?;
    let remainder = &output[idx + RESULT_MARKER.len()..];
    let line = remainder.lines().next().unwrap_or(remainder).trim();

    if let Ok(report) = serde_json::from_str::<WorkerReport>(line) {
        return Some(report);
    }

    // Lenient pass: the record may span lines, carry markdown fences, or
    // hold scalar values where lists belong.
    let value = extract_json(remainder)?;
    let obj = value.as_object()?;

    let string_of = |key: &str| -> String {
        obj.get(key)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    };
    let list_of = |key: &str| -> Vec<String> {
        match obj.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    };

    Some(WorkerReport {
        status: string_of("status"),
        summary: string_of("summary"),
        commits: list_of("commits"),
        discoveries: list_of("discoveries"),
        concerns: list_of("concerns"),
        files_changed: list_of("files_changed"),
    })
}

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").unwrap());

/// Extract a JSON object from text that may contain markdown fences or
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(captures) = FENCE_RE.captures(trimmed) {
        if let Ok(value) = serde_json::from_str(captures[1].trim()) {
            return Some(value);
        }
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Bare object somewhere in the text: scan from the first brace and let
    // the parser find the end.
    let start = trimmed.find('{')?;
    let candidate = &trimmed[start..];
    let mut deserializer = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
    match deserializer.next() {
        Some(Ok(value)) => Some(value),
        _ => None,
    }
}

/// Tail of a string, used as the output summary when no marker is present.
pub fn output_tail(output: &str, max_chars: usize) -> String {
    if output.is_empty() {
        return "No output".to_owned();
    }
    let count = output.chars().count();
    if count <= max_chars {
        return output.to_owned();
    }
    output.chars().skip(count - max_chars).collect()
}

// ---------------------------------------------------------------------------
// Token accounting
// ---------------------------------------------------------------------------

/// Accumulated token counts from one worker session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

fn add_usage(usage: &mut TokenUsage, value: &Value) {
    let count = |key: &str| value.get(key).and_then(Value::as_i64).unwrap_or(0);
    usage.input_tokens += count("input_tokens");
    usage.output_tokens += count("output_tokens");
    usage.cache_creation_tokens += count("cache_creation_input_tokens");
    usage.cache_read_tokens += count("cache_read_input_tokens");
}

fn collect_text(texts: &mut Vec<String>, content: &Value) {
    if let Some(blocks) = content.as_array() {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text.to_owned());
                }
            }
        }
    }
}

/// Parsed NDJSON stream output: accumulated tokens plus concatenated
/// assistant text (the `MC_RESULT:` marker is searched in the text).
#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    pub usage: TokenUsage,
    pub text: String,
}

/// Parse NDJSON stream output from the worker CLI. Unparseable lines are
/// skipped; plain-text output yields zero usage and empty text.
pub fn parse_stream_json(output: &str) -> StreamResult {
    let mut usage = TokenUsage::default();
    let mut texts: Vec<String> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(event_type) = event.get("type").and_then(Value::as_str) else {
            continue;
        };

        match event_type {
            "result" => {
                if let Some(u) = event.get("usage") {
                    add_usage(&mut usage, u);
                }
                if let Some(content) = event.get("content") {
                    collect_text(&mut texts, content);
                }
            }
            "assistant" => {
                let msg = event.get("message").unwrap_or(&event);
                if let Some(u) = msg.get("usage") {
                    add_usage(&mut usage, u);
                }
                if let Some(content) = msg.get("content") {
                    collect_text(&mut texts, content);
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.get("delta") {
                    if delta.get("type").and_then(Value::as_str) == Some("text_delta") {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            texts.push(text.to_owned());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    StreamResult {
        usage,
        text: texts.concat(),
    }
}

/// Compute USD cost from token usage and per-million rates.
pub fn compute_token_cost(usage: TokenUsage, pricing: &PricingConfig) -> f64 {
    usage.input_tokens as f64 * pricing.input_per_million / 1_000_000.0
        + usage.output_tokens as f64 * pricing.output_per_million / 1_000_000.0
        + usage.cache_creation_tokens as f64 * pricing.cache_write_per_million / 1_000_000.0
        + usage.cache_read_tokens as f64 * pricing.cache_read_per_million / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Prompt and environment
// ---------------------------------------------------------------------------

/// Render the fresh-start prompt for one worker session.
pub fn render_worker_prompt(
    unit: &WorkUnit,
    target_name: &str,
    workspace_path: &str,
    branch_name: &str,
    verification_command: &str,
    context: &str,
) -> String {
    let files_hint = if unit.files_hint.is_empty() {
        "Not specified"
    } else {
        &unit.files_hint
    };
    let verification_hint = if unit.verification_hint.is_empty() {
        "Run the full verification suite"
    } else {
        &unit.verification_hint
    };
    let context_block = if context.is_empty() {
        "No additional context."
    } else {
        context
    };

    format!(
        "You are a parallel worker agent for {target_name} at {workspace_path}.\n\
         \n\
         ## Task\n\
         {title}\n\
         \n\
         {description}\n\
         \n\
         ## Scope\n\
         ONLY modify files related to this task.\n\
         Files likely involved: {files_hint}\n\
         \n\
         ## Branch\n\
         Work on branch {branch_name}; it is already checked out.\n\
         \n\
         ## Verification Focus\n\
         {verification_hint}\n\
         \n\
         ## Context\n\
         {context_block}\n\
         \n\
         ## Instructions\n\
         1. Implement the task described above\n\
         2. ONLY modify files listed in the scope (or closely related files)\n\
         3. Run verification: {verification_command}\n\
         4. If verification passes, commit with a descriptive message\n\
         5. If verification fails after 3 attempts, stop and report what went wrong\n\
         6. Do NOT modify unrelated files or tests\n\
         \n\
         ## Output\n\
         When done, write a summary as the LAST line of output:\n\
         MC_RESULT:{{\"status\":\"completed|failed|blocked\",\"commits\":[\"hash\"],\
         \"summary\":\"what you did\",\"files_changed\":[\"list\"]}}\n",
        title = unit.title,
        description = unit.description,
    )
}

fn looks_secret(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_NAME_FRAGMENTS.iter().any(|frag| upper.contains(frag))
}

/// Build the environment for a worker subprocess.
///
/// Forwards `PATH`, `HOME`, `VIRTUAL_ENV` when present, plus the
/// project-declared allowlist. Names that look secret-bearing are always
/// blocked, allowlisted or not.
pub fn build_worker_env(env_config: &EnvConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for name in ["PATH", "HOME", "VIRTUAL_ENV"] {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.to_owned(), value);
        }
    }

    for name in &env_config.extra_env {
        if looks_secret(name) {
            tracing::warn!(name = %name, "refusing to forward secret-bearing env var");
            continue;
        }
        if let Ok(value) = std::env::var(name) {
            env.insert(name.clone(), value);
        }
    }

    env
}
