//! Parser for the structured stream-event schema (spec §6, "JSON-line
//! event schema (raw stream log)"). Tolerant of unknown `type` values and
//! unknown inner fields: an agent CLI may add fields this parser doesn't
//! know about yet, and those lines must still round-trip as opaque
//! entries rather than abort the read.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(rename = "permissionMode", default)]
        permission_mode: Option<String>,
    },
    #[serde(rename = "user")]
    User { message: Value },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        timestamp_ms: Option<i64>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        message: Value,
        #[serde(default)]
        timestamp_ms: Option<i64>,
        #[serde(default)]
        model_call_id: Option<String>,
    },
    #[serde(rename = "tool_call")]
    ToolCall {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        tool_call: Option<Value>,
        #[serde(default)]
        timestamp_ms: Option<i64>,
    },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        duration_ms: Option<i64>,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Anything with an unrecognized `type`. Preserved verbatim so
    /// `parse` stays total and round-trippable.
    #[serde(other)]
    Unknown,
}

/// A fully-merged tool call: the `started` and `completed` lines combined
/// into one record with parameters, result, success flag and duration.
#[derive(Debug, Clone, Serialize)]
pub struct MergedToolCall {
    pub call_id: String,
    pub tool_kind: String,
    pub args: Value,
    pub result: Option<Value>,
    pub success: Option<bool>,
    pub started_ms: Option<i64>,
    pub completed_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedStream {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub assistant_text: Vec<String>,
    pub thinking_deltas: Vec<String>,
    pub tool_calls: Vec<MergedToolCall>,
    pub final_result: Option<Value>,
    pub is_error: Option<bool>,
    pub opaque_unknown_count: usize,
}

/// Parses one raw stream line. Never errors: an unparseable line becomes
/// `StreamEvent::Unknown`, matching spec §6's "parsers MUST tolerate
/// unknown type and unknown inner fields" plus §8's "parse is total".
pub fn parse_line(line: &str) -> StreamEvent {
    serde_json::from_str(line).unwrap_or(StreamEvent::Unknown)
}

fn extract_text_blocks(message: &Value) -> String {
    message
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| {
                    if b.get("type").and_then(Value::as_str) == Some("text") {
                        b.get("text").and_then(Value::as_str)
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Interprets a full sequence of raw lines into the structured `parsed`
/// response shape described in §4.H: session init, assistant text
/// (concatenated), thinking deltas (opt-in), merged tool calls, final
/// result.
pub fn parse_stream(lines: &[String], include_thinking: bool) -> ParsedStream {
    let mut parsed = ParsedStream::default();
    let mut open_calls: std::collections::HashMap<String, MergedToolCall> =
        std::collections::HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for line in lines {
        match parse_line(line) {
            StreamEvent::System {
                session_id, model, ..
            } => {
                parsed.session_id = session_id.or(parsed.session_id.take());
                parsed.model = model.or(parsed.model.take());
            }
            StreamEvent::Assistant { message, .. } => {
                let text = extract_text_blocks(&message);
                if !text.is_empty() {
                    parsed.assistant_text.push(text);
                }
            }
            StreamEvent::Thinking { text, .. } if include_thinking => {
                if let Some(t) = text {
                    parsed.thinking_deltas.push(t);
                }
            }
            StreamEvent::Thinking { .. } => {}
            StreamEvent::ToolCall {
                subtype,
                call_id,
                tool_call,
                timestamp_ms,
            } => {
                let call_id = call_id.unwrap_or_default();
                let (tool_kind, args, result, success) = decompose_tool_call(tool_call);
                match subtype.as_deref() {
                    Some("started") => {
                        order.push(call_id.clone());
                        open_calls.insert(
                            call_id.clone(),
                            MergedToolCall {
                                call_id,
                                tool_kind,
                                args,
                                result: None,
                                success: None,
                                started_ms: timestamp_ms,
                                completed_ms: None,
                            },
                        );
                    }
                    Some("completed") => {
                        if let Some(entry) = open_calls.get_mut(&call_id) {
                            entry.result = result;
                            entry.success = success;
                            entry.completed_ms = timestamp_ms;
                        } else {
                            order.push(call_id.clone());
                            open_calls.insert(
                                call_id.clone(),
                                MergedToolCall {
                                    call_id,
                                    tool_kind,
                                    args,
                                    result,
                                    success,
                                    started_ms: None,
                                    completed_ms: timestamp_ms,
                                },
                            );
                        }
                    }
                    _ => {}
                }
            }
            StreamEvent::Result {
                result, is_error, ..
            } => {
                parsed.final_result = result;
                parsed.is_error = is_error;
            }
            StreamEvent::User { .. } => {}
            StreamEvent::Unknown => {
                parsed.opaque_unknown_count += 1;
            }
        }
    }

    for call_id in order {
        if let Some(call) = open_calls.remove(&call_id) {
            parsed.tool_calls.push(call);
        }
    }
    parsed
}

fn decompose_tool_call(tool_call: Option<Value>) -> (String, Value, Option<Value>, Option<bool>) {
    const KNOWN_KINDS: [&str; 3] = ["shellToolCall", "editToolCall", "readToolCall"];
    let Some(tool_call) = tool_call else {
        return (String::new(), Value::Null, None, None);
    };
    for kind in KNOWN_KINDS {
        if let Some(inner) = tool_call.get(kind) {
            let args = inner.get("args").cloned().unwrap_or(Value::Null);
            let result = inner.get("result").cloned();
            let success = result.as_ref().map(|r| r.get("success").is_some());
            return (kind.to_string(), args, result, success);
        }
    }
    (String::new(), Value::Null, None, None)
}
