//! Response parser (C4): turns a provider's `ChatResponse` into either
//! structured tool calls or a final answer, trying successively looser
//! strategies until one succeeds.
//!
//! Grounded on `sa_providers::traits::ChatResponse` (`content`, `tool_calls`)
//! — provider adapters already populate `tool_calls` natively when the
//! wire format supports it (Anthropic/OpenAI function-calling); this module
//! covers everything else: models that only ever speak text, and models
//! that emit malformed or fenced JSON instead of well-formed tool calls.

use std::collections::HashMap;

use regex::Regex;
use sa_providers::traits::ChatResponse;

use crate::model::ToolCall;

/// Which strategy produced the parsed result, recorded for diagnostics and
/// for the parser-idempotence test (re-parsing the canonical form chosen by
/// one strategy must not be picked up by a looser one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Native,
    StrictJson,
    FencedJson,
    RegexSalvage,
    PartialJsonRepair,
    PlainText,
}

#[derive(Debug, Clone)]
pub enum ParsedResponse {
    ToolCalls {
        calls: Vec<ToolCall>,
        strategy: ParseStrategy,
    },
    FinalAnswer {
        text: String,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("no tool call or usable text content found in response")]
    Empty,
    #[error("argument '{arg}' on tool '{tool}' contains a path-traversal segment")]
    PathTraversal { tool: String, arg: String },
    #[error("argument '{arg}' on tool '{tool}' contains a shell metacharacter sequence")]
    ShellInjection { tool: String, arg: String },
}

/// Argument names that signal "this value is a filesystem path" for the
/// traversal check below. Substring match so `file_path`, `dest_dir`,
/// `source_file` etc. all qualify.
const PATH_ARG_NAMES: &[&str] = &["path", "file", "dir", "dest", "source", "target"];

fn looks_like_path_arg(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    PATH_ARG_NAMES.iter().any(|marker| lower.contains(marker))
}

/// Reject (not merely clean up) a `..` segment in any argument whose name
/// signals a path. This runs before dispatch ever sees the call, so a
/// rejected call never reaches the Safety Gate or a tool handler.
fn reject_path_traversal(tool_name: &str, args: &HashMap<String, serde_json::Value>) -> Result<(), ParseError> {
    for (name, value) in args {
        if !looks_like_path_arg(name) {
            continue;
        }
        if let Some(s) = value.as_str() {
            if s.contains("..") {
                return Err(ParseError::PathTraversal {
                    tool: tool_name.to_string(),
                    arg: name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Cap argument string length. Applied to every parsed tool call
/// regardless of which strategy produced it.
fn sanitize_arguments(args: &mut HashMap<String, serde_json::Value>) {
    const MAX_ARG_CHARS: usize = 200_000;
    for value in args.values_mut() {
        if let serde_json::Value::String(s) = value {
            if s.len() > MAX_ARG_CHARS {
                s.truncate(MAX_ARG_CHARS);
            }
        }
    }
}

/// Tool-name markers that identify a command-execution tool (shell,
/// subprocess, script runner). Substring match, same convention as
/// `PATH_ARG_NAMES` above.
const COMMAND_TOOL_NAME_MARKERS: &[&str] = &["exec", "shell", "command", "bash", "cmd"];

fn is_command_execution_tool(tool_name: &str) -> bool {
    let lower = tool_name.to_ascii_lowercase();
    COMMAND_TOOL_NAME_MARKERS.iter().any(|m| lower.contains(m))
}

/// Shell metacharacter sequences that indicate an argument is attempting
/// to break out of a single command into something else entirely
/// (command substitution, chaining into a destructive command, piping
/// into an interpreter). Checked only against arguments of tools that
/// `is_command_execution_tool` identifies — per §4.4 this is scoped to
/// "arguments bound for command-execution tools", not prose.
const SHELL_INJECTION_MARKERS: &[&str] = &["; rm -rf", "$(", "`", "&& curl", "| sh", "| bash"];

/// Reject (not merely clean up) a shell-injection marker in any string
/// argument of a command-execution tool. Unlike path traversal, this is
/// scoped by tool identity rather than argument name, since the risk is
/// in what the tool *does* with the whole argument, not which field it's
/// in.
fn reject_shell_injection(tool_name: &str, args: &HashMap<String, serde_json::Value>) -> Result<(), ParseError> {
    if !is_command_execution_tool(tool_name) {
        return Ok(());
    }
    for (name, value) in args {
        if let Some(s) = value.as_str() {
            if SHELL_INJECTION_MARKERS.iter().any(|m| s.contains(m)) {
                return Err(ParseError::ShellInjection {
                    tool: tool_name.to_string(),
                    arg: name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn to_kernel_tool_call(
    call_id: String,
    tool_name: String,
    mut arguments: HashMap<String, serde_json::Value>,
    origin_turn: u64,
) -> Result<ToolCall, ParseError> {
    reject_path_traversal(&tool_name, &arguments)?;
    reject_shell_injection(&tool_name, &arguments)?;
    sanitize_arguments(&mut arguments);
    Ok(ToolCall {
        call_id,
        tool_name,
        arguments,
        origin_turn,
    })
}

fn value_to_args(value: serde_json::Value) -> Option<HashMap<String, serde_json::Value>> {
    match value {
        serde_json::Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

/// Strategy 2: the entire `content` string is a single JSON object of the
/// shape `{"tool": "...", "arguments": {...}}`.
fn try_strict_json(content: &str, origin_turn: u64) -> Result<Option<ParsedResponse>, ParseError> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(content.trim()) else {
        return Ok(None);
    };
    parse_tool_envelope(value, origin_turn, ParseStrategy::StrictJson)
}

/// Returns `Ok(None)` when `value` doesn't have the shape of a tool
/// envelope (so the caller can fall through to a looser strategy), and
/// `Err` when it does but fails the path-traversal check — a structural
/// match is never silently demoted to plain text.
fn parse_tool_envelope(
    value: serde_json::Value,
    origin_turn: u64,
    strategy: ParseStrategy,
) -> Result<Option<ParsedResponse>, ParseError> {
    let Some(obj) = value.as_object() else {
        return Ok(None);
    };
    let Some(tool_name) = obj.get("tool").or_else(|| obj.get("tool_name")).and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let arguments = obj
        .get("arguments")
        .or_else(|| obj.get("args"))
        .cloned()
        .unwrap_or(serde_json::Value::Object(Default::default()));
    let Some(args) = value_to_args(arguments) else {
        return Ok(None);
    };
    let call = to_kernel_tool_call(uuid::Uuid::new_v4().to_string(), tool_name.to_string(), args, origin_turn)?;
    Ok(Some(ParsedResponse::ToolCalls {
        calls: vec![call],
        strategy,
    }))
}

/// Strategy 3: a fenced ```json ... ``` (or bare ```) code block anywhere
/// in the content.
fn try_fenced_json(content: &str, origin_turn: u64) -> Result<Option<ParsedResponse>, ParseError> {
    let Some(fence_re) = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok() else {
        return Ok(None);
    };
    let Some(captures) = fence_re.captures(content) else {
        return Ok(None);
    };
    let candidate = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) else {
        return Ok(None);
    };
    parse_tool_envelope(value, origin_turn, ParseStrategy::FencedJson)
}

/// Strategy 4: find the first `{...}` balanced-brace span in the text and
/// try to parse it directly, ignoring any surrounding prose.
fn try_regex_salvage(content: &str, origin_turn: u64) -> Result<Option<ParsedResponse>, ParseError> {
    let Some(start) = content.find('{') else {
        return Ok(None);
    };
    let mut depth = 0i32;
    let mut end = None;
    for (i, ch) in content[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(end) = end else {
        return Ok(None);
    };
    let candidate = &content[start..end];
    let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) else {
        return Ok(None);
    };
    parse_tool_envelope(value, origin_turn, ParseStrategy::RegexSalvage)
}

/// Strategy 5: the content looks like a truncated JSON object (stream cut
/// off mid-generation) — try appending closing braces/brackets until it
/// parses, up to a small bound.
fn try_partial_json_repair(content: &str, origin_turn: u64) -> Result<Option<ParsedResponse>, ParseError> {
    let trimmed = content.trim();
    if !trimmed.starts_with('{') {
        return Ok(None);
    }
    let opens_curly = trimmed.matches('{').count();
    let closes_curly = trimmed.matches('}').count();
    let opens_square = trimmed.matches('[').count();
    let closes_square = trimmed.matches(']').count();
    if opens_curly <= closes_curly && opens_square <= closes_square {
        return Ok(None);
    }
    let mut repaired = trimmed.to_string();
    for _ in 0..opens_square.saturating_sub(closes_square) {
        repaired.push(']');
    }
    for _ in 0..opens_curly.saturating_sub(closes_curly) {
        repaired.push('}');
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&repaired) else {
        return Ok(None);
    };
    parse_tool_envelope(value, origin_turn, ParseStrategy::PartialJsonRepair)
}

/// Parse a provider response into either tool calls or a final answer,
/// trying each strategy in order of strictness (native first, plain text
/// last). §8 invariant: parsing is idempotent — re-running `parse` on the
/// `content` of a `FinalAnswer` never yields `ToolCalls`.
pub fn parse(response: &ChatResponse, origin_turn: u64) -> Result<ParsedResponse, ParseError> {
    if !response.tool_calls.is_empty() {
        let mut calls = Vec::with_capacity(response.tool_calls.len());
        for tc in &response.tool_calls {
            let args = value_to_args(tc.arguments.clone()).unwrap_or_default();
            calls.push(to_kernel_tool_call(tc.call_id.clone(), tc.tool_name.clone(), args, origin_turn)?);
        }
        return Ok(ParsedResponse::ToolCalls {
            calls,
            strategy: ParseStrategy::Native,
        });
    }

    let content = response.content.trim();
    if content.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some(parsed) = try_strict_json(content, origin_turn)? {
        return Ok(parsed);
    }
    if let Some(parsed) = try_fenced_json(content, origin_turn)? {
        return Ok(parsed);
    }
    if let Some(parsed) = try_regex_salvage(content, origin_turn)? {
        return Ok(parsed);
    }
    if let Some(parsed) = try_partial_json_repair(content, origin_turn)? {
        return Ok(parsed);
    }

    Ok(ParsedResponse::FinalAnswer {
        text: content.to_string(),
    })
}
