//! Output Reader (§4.H): bounded, multi-format access to an agent's raw
//! `stream` log, with a fallback to the Process Host's last-output capture
//! when the log itself is missing.

use crate::error::Result;
use crate::eventlog::{self, stream_parser, StreamKind, TruncationMode};
use crate::process_host::{Handle, ProcessHost};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Jsonl,
    Parsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Full,
    Summary,
    Compact,
}

pub struct OutputRequest<'a> {
    pub agent_id: &'a str,
    pub tail: Option<usize>,
    pub filter: Option<&'a str>,
    pub format: OutputFormat,
    pub response_format: ResponseFormat,
    pub max_bytes: usize,
    pub aggressive_truncate: bool,
    pub include_thinking: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputResponse {
    pub source: &'static str,
    pub text: Option<String>,
    pub lines: Option<Vec<String>>,
    pub parsed: Option<stream_parser::ParsedStream>,
}

pub async fn read_agent_output(
    process_host: &dyn ProcessHost,
    workspace: &Path,
    handle: Option<&Handle>,
    request: OutputRequest<'_>,
) -> Result<OutputResponse> {
    let log_path = eventlog::log_path(workspace, request.agent_id, StreamKind::Stream);

    if !log_path.exists() {
        let fallback = match handle {
            Some(h) => process_host.last_output(h).await,
            None => None,
        };
        return Ok(OutputResponse {
            source: "fallback",
            text: fallback,
            lines: None,
            parsed: None,
        });
    }

    let mut lines = match request.tail {
        Some(n) => eventlog::read_tail(&log_path, n)?,
        None => eventlog::read_full(&log_path)?.0,
    };

    if let Some(pattern) = request.filter {
        lines = eventlog::filter_lines(lines, pattern)?;
    }

    match request.format {
        OutputFormat::Jsonl => {
            let lines = apply_response_format(lines, &request);
            Ok(OutputResponse {
                source: "log",
                text: None,
                lines: Some(lines),
                parsed: None,
            })
        }
        OutputFormat::Parsed => {
            let parsed = stream_parser::parse_stream(&lines, request.include_thinking);
            Ok(OutputResponse {
                source: "log",
                text: None,
                lines: None,
                parsed: Some(parsed),
            })
        }
        OutputFormat::Text => {
            let parsed = stream_parser::parse_stream(&lines, request.include_thinking);
            let text = parsed.assistant_text.join("\n");
            let capped = cap_response_text(text, &request);
            Ok(OutputResponse {
                source: "log",
                text: Some(capped),
                lines: None,
                parsed: None,
            })
        }
    }
}

fn apply_response_format(lines: Vec<String>, request: &OutputRequest) -> Vec<String> {
    match request.response_format {
        ResponseFormat::Full => lines,
        ResponseFormat::Summary => dedupe_repetitive_tool_calls(lines),
        ResponseFormat::Compact => lines,
    }
}

fn cap_response_text(text: String, request: &OutputRequest) -> String {
    let mode = match request.response_format {
        ResponseFormat::Summary => TruncationMode::Summary,
        ResponseFormat::Compact => TruncationMode::Aggressive,
        ResponseFormat::Full if request.aggressive_truncate => TruncationMode::Aggressive,
        ResponseFormat::Full => TruncationMode::PreservePrefix,
    };
    eventlog::truncate_response(vec![text], request.max_bytes, mode)
}

/// Detects repetitive tool invocations (same tool kind repeated many times)
/// and keeps only the first N, last N, and one of each distinct kind, per
/// the summary sampler described in §4.H.
fn dedupe_repetitive_tool_calls(lines: Vec<String>) -> Vec<String> {
    const KEEP_EDGE: usize = 3;
    if lines.len() <= KEEP_EDGE * 2 {
        return lines;
    }

    let mut seen_kinds = std::collections::HashSet::new();
    let mut kept = Vec::new();
    kept.extend(lines[..KEEP_EDGE].iter().cloned());

    for line in &lines[KEEP_EDGE..lines.len() - KEEP_EDGE] {
        let kind = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str().map(str::to_string)));
        if let Some(kind) = kind {
            if seen_kinds.insert(kind) {
                kept.push(line.clone());
            }
        }
    }

    kept.extend(lines[lines.len() - KEEP_EDGE..].iter().cloned());
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_host::direct::DirectProcessBackend;

    #[tokio::test]
    async fn falls_back_to_process_host_when_log_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectProcessBackend::new();
        let response = read_agent_output(
            &backend,
            dir.path(),
            None,
            OutputRequest {
                agent_id: "a-1",
                tail: None,
                filter: None,
                format: OutputFormat::Text,
                response_format: ResponseFormat::Full,
                max_bytes: 10_000,
                aggressive_truncate: false,
                include_thinking: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.source, "fallback");
    }

    #[tokio::test]
    async fn parsed_format_returns_merged_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectProcessBackend::new();
        let log_path = eventlog::log_path(dir.path(), "a-1", StreamKind::Stream);
        eventlog::append_line(
            &log_path,
            &serde_json::json!({"type": "assistant", "message": {"content": [{"type":"text","text":"hi"}]}}),
        )
        .unwrap();

        let response = read_agent_output(
            &backend,
            dir.path(),
            None,
            OutputRequest {
                agent_id: "a-1",
                tail: None,
                filter: None,
                format: OutputFormat::Parsed,
                response_format: ResponseFormat::Full,
                max_bytes: 10_000,
                aggressive_truncate: false,
                include_thinking: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.source, "log");
        assert_eq!(response.parsed.unwrap().assistant_text, vec!["hi".to_string()]);
    }

    #[test]
    fn summary_mode_keeps_edges_and_distinct_kinds() {
        let mut lines: Vec<String> = Vec::new();
        for i in 0..20 {
            lines.push(format!(r#"{{"type":"tool_call","n":{i}}}"#));
        }
        let kept = dedupe_repetitive_tool_calls(lines.clone());
        assert!(kept.len() < lines.len());
        assert_eq!(kept[0], lines[0]);
        assert_eq!(*kept.last().unwrap(), *lines.last().unwrap());
    }
}
