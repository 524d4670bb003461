//! Forgiving parser for model-emitted tool arguments.
//!
//! Models regularly produce almost-JSON: single-quoted strings, bare keys,
//! doubly-escaped payloads. The parser tries an ordered list of strategies and
//! falls back to wrapping the raw text, so it never fails.

use crate::llm::ToolArguments;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedToolArguments {
    pub args: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Signature for per-tool parser overrides registered in tool metadata.
pub type ArgumentParser = fn(&ToolArguments) -> ParsedToolArguments;

struct Strategy {
    parse: fn(&str) -> Result<Map<String, Value>, String>,
    failure: &'static str,
    success_note: Option<&'static str>,
}

const STRATEGIES: &[Strategy] = &[
    Strategy {
        parse: parse_strict,
        failure: "Failed to parse arguments as JSON",
        success_note: None,
    },
    Strategy {
        parse: parse_sanitized,
        failure: "Failed to parse sanitized arguments",
        success_note: Some("Parsed arguments after sanitizing malformed JSON."),
    },
];

pub fn parse_tool_arguments(input: &ToolArguments) -> ParsedToolArguments {
    match input {
        ToolArguments::Structured(map) => ParsedToolArguments {
            args: map.clone(),
            warnings: vec![],
        },
        ToolArguments::Raw(raw) => parse_argument_str(raw),
    }
}

pub fn parse_argument_str(input: &str) -> ParsedToolArguments {
    let mut warnings = Vec::new();

    if input.trim().is_empty() {
        warnings.push("Tool arguments were an empty string; defaulting to empty object.".to_string());
        return ParsedToolArguments {
            args: Map::new(),
            warnings,
        };
    }

    for strategy in STRATEGIES {
        match (strategy.parse)(input) {
            Ok(args) => {
                if let Some(note) = strategy.success_note {
                    warnings.push(note.to_string());
                }
                return ParsedToolArguments { args, warnings };
            }
            Err(e) => warnings.push(format!("{}: {}", strategy.failure, e)),
        }
    }

    warnings.push("Falling back to text argument payload.".to_string());
    let mut args = Map::new();
    args.insert("text".to_string(), Value::String(input.to_string()));
    ParsedToolArguments { args, warnings }
}

fn parse_strict(input: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(input) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_sanitized(input: &str) -> Result<Map<String, Value>, String> {
    let cleaned = sanitize(input)?;
    parse_strict(&cleaned)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

type CachedRegex = OnceLock<Result<Regex, regex::Error>>;

fn cached(cell: &'static CachedRegex, pattern: &str) -> Result<&'static Regex, String> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| e.to_string())
}

static SINGLE_QUOTED_KEY: CachedRegex = OnceLock::new();
static BARE_KEY: CachedRegex = OnceLock::new();
static SINGLE_QUOTED_VALUE: CachedRegex = OnceLock::new();

/// Rewrites common almost-JSON into JSON: wrapping quotes, escaped quotes,
/// single-quoted or bare keys, single-quoted string values.
fn sanitize(input: &str) -> Result<String, String> {
    let mut s = input;
    if let Some(rest) = s.strip_prefix(['\'', '"']) {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix(['\'', '"']) {
        s = rest;
    }
    let s = s.replace("\\\"", "\"");

    let s = cached(&SINGLE_QUOTED_KEY, r#"([{,])\s*'([^']+)'\s*:"#)?
        .replace_all(&s, r#"${1}"${2}":"#);
    let s = cached(&BARE_KEY, r#"([{,])\s*(\w+)\s*:"#)?.replace_all(&s, r#"${1}"${2}":"#);
    let s = cached(&SINGLE_QUOTED_VALUE, r#"([:\[,]\s*)'([^']*)'"#)?
        .replace_all(&s, r#"${1}"${2}""#);

    Ok(s.into_owned())
}
