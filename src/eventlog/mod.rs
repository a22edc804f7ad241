//! Event Log Store: per-agent append-only JSON-line streams for
//! `progress`, `findings`, and raw `stream` events, with bounded readers
//! (tail, regex filter, truncation modes, and a parsed mode for the
//! structured stream-event schema).
//!
//! Grounded on the teacher's `discord/self_update/structured_logger.rs`
//! for the append-and-flush-per-line discipline and the tar/gzip archival
//! step; the reverse-seek tail reader below has no direct teacher analog
//! and is written fresh against the spec's "never load the whole file for
//! large logs" requirement.

pub mod stream_parser;

use crate::error::Result;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Progress,
    Findings,
    Stream,
}

impl StreamKind {
    fn suffix(&self) -> &'static str {
        match self {
            StreamKind::Progress => "progress",
            StreamKind::Findings => "findings",
            StreamKind::Stream => "stream",
        }
    }

    fn subdir(&self) -> &'static str {
        match self {
            StreamKind::Progress => "progress",
            StreamKind::Findings => "findings",
            StreamKind::Stream => "logs",
        }
    }
}

/// Returns the log file path for `(task workspace, agent_id, stream_kind)`
/// following the workspace layout in spec §6.
pub fn log_path(workspace: &Path, agent_id: &str, kind: StreamKind) -> PathBuf {
    workspace
        .join(kind.subdir())
        .join(format!("{agent_id}_{}.jsonl", kind.suffix()))
}

/// Moves an agent's three event logs into `archive/<agent_id>.tar.gz`,
/// freeing the hot directories (§4.B "Archival"). Grounded on the
/// teacher's `discord/self_update/structured_logger.rs::archive_logs`,
/// which already used `flate2`+`tar` to compress a completed operation's
/// logs; reused here verbatim for the agent case instead of an update
/// case.
pub fn archive_agent_logs(workspace: &Path, agent_id: &str) -> Result<PathBuf> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::Builder;

    let archive_dir = workspace.join("archive");
    fs::create_dir_all(&archive_dir)?;
    let archive_path = archive_dir.join(format!("{agent_id}.tar.gz"));

    let sources = [
        (log_path(workspace, agent_id, StreamKind::Progress), "progress.jsonl"),
        (log_path(workspace, agent_id, StreamKind::Findings), "findings.jsonl"),
        (log_path(workspace, agent_id, StreamKind::Stream), "stream.jsonl"),
    ];

    {
        let file = File::create(&archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut tar = Builder::new(encoder);
        for (path, archive_name) in &sources {
            if path.exists() {
                tar.append_path_with_name(path, archive_name)?;
            }
        }
        tar.finish()?;
    }

    for (path, _) in &sources {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    Ok(archive_path)
}

/// Appends one JSON-serializable record as a line, flushing immediately.
/// Holds no lock: POSIX append-mode writes from a single writer (the
/// agent, or the controller on the agent's behalf) are atomic per line.
pub fn append_line<T: serde::Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Truncation strategy applied to an assembled response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationMode {
    /// Preserve the prefix up to `max_bytes`, append a marker noting how
    /// much was cut.
    PreservePrefix,
    /// Like `PreservePrefix` but also samples a handful of lines from the
    /// middle of the file so structure isn't lost entirely.
    Aggressive,
    /// Keep only lines that match the error/status/key-finding signal set.
    Summary,
}

const SUMMARY_SIGNALS: &[&str] = &[
    "error", "failed", "exception", "result", "success", "finding", "insight", "blocker",
];

/// Reads the entire log as raw lines (each a JSON object), skipping
/// malformed lines but counting them.
pub fn read_full(path: &Path) -> Result<(Vec<String>, usize)> {
    if !path.exists() {
        return Ok((vec![], 0));
    }
    let content = fs::read_to_string(path)?;
    let mut lines = Vec::new();
    let mut malformed = 0;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if serde_json::from_str::<serde_json::Value>(line).is_ok() {
            lines.push(line.to_string());
        } else {
            malformed += 1;
            debug!(path = %path.display(), "skipping malformed log line");
        }
    }
    Ok((lines, malformed))
}

/// Returns the last `n` well-formed lines of `path` without loading the
/// whole file, by seeking backward from the end in fixed-size chunks
/// until at least `n` newlines have been found (or the start of the file
/// is reached).
pub fn read_tail(path: &Path, n: usize) -> Result<Vec<String>> {
    if !path.exists() || n == 0 {
        return Ok(vec![]);
    }
    const CHUNK: i64 = 64 * 1024;

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len() as i64;
    let mut pos = file_len;
    let mut buffer: Vec<u8> = Vec::new();
    let mut newline_count = 0usize;

    while pos > 0 && newline_count <= n {
        let read_size = CHUNK.min(pos);
        pos -= read_size;
        file.seek(SeekFrom::Start(pos as u64))?;
        let mut chunk = vec![0u8; read_size as usize];
        file.read_exact(&mut chunk)?;
        newline_count += chunk.iter().filter(|&&b| b == b'\n').count();
        chunk.extend_from_slice(&buffer);
        buffer = chunk;
    }

    let text = String::from_utf8_lossy(&buffer);
    let mut lines: Vec<String> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter(|l| serde_json::from_str::<serde_json::Value>(l).is_ok())
        .map(|l| l.to_string())
        .collect();

    if lines.len() > n {
        let drop = lines.len() - n;
        lines.drain(0..drop);
    }
    Ok(lines)
}

/// Applies a regex filter over a set of already-read lines.
pub fn filter_lines(lines: Vec<String>, pattern: &str) -> Result<Vec<String>> {
    let re = Regex::new(pattern).map_err(|e| {
        crate::error::SpiralError::InvalidArgument(format!("invalid filter regex: {e}"))
    })?;
    Ok(lines.into_iter().filter(|l| re.is_match(l)).collect())
}

/// Applies a per-response byte cap using the requested truncation mode.
pub fn truncate_response(lines: Vec<String>, max_bytes: usize, mode: TruncationMode) -> String {
    match mode {
        TruncationMode::Summary => {
            let kept: Vec<&String> = lines
                .iter()
                .filter(|l| {
                    let lower = l.to_lowercase();
                    SUMMARY_SIGNALS.iter().any(|s| lower.contains(s))
                })
                .collect();
            let joined = kept
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            cap_bytes(&joined, max_bytes, false)
        }
        TruncationMode::PreservePrefix => {
            let joined = lines.join("\n");
            cap_bytes(&joined, max_bytes, false)
        }
        TruncationMode::Aggressive => {
            let sampled = sample_with_middle(&lines, max_bytes);
            cap_bytes(&sampled, max_bytes, true)
        }
    }
}

fn sample_with_middle(lines: &[String], max_bytes: usize) -> String {
    if lines.is_empty() {
        return String::new();
    }
    // Budget roughly: half for a prefix slice, a small slice from the
    // middle, and whatever remains for a suffix slice.
    let target_lines = (max_bytes / 80).max(6);
    if lines.len() <= target_lines {
        return lines.join("\n");
    }
    let head_n = target_lines / 3;
    let mid_n = target_lines / 6;
    let tail_n = target_lines - head_n - mid_n;

    let mid_start = lines.len() / 2 - mid_n / 2;
    let mut out = Vec::new();
    out.extend_from_slice(&lines[0..head_n]);
    out.push("...[truncated: middle sample]...".to_string());
    out.extend_from_slice(&lines[mid_start..mid_start + mid_n]);
    out.push("...[truncated]...".to_string());
    out.extend_from_slice(&lines[lines.len() - tail_n..]);
    out.join("\n")
}

fn cap_bytes(text: &str, max_bytes: usize, aggressive: bool) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let marker = if aggressive {
        "\n...[truncated: aggressive mode]"
    } else {
        "\n...[truncated]"
    };
    let budget = max_bytes.saturating_sub(marker.len());
    let mut cut = budget.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &text[..cut], marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_full_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_progress.jsonl");
        for i in 0..5 {
            append_line(&path, &serde_json::json!({"n": i})).unwrap();
        }
        let (lines, malformed) = read_full(&path).unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(malformed, 0);
    }

    #[test]
    fn read_tail_matches_last_n_of_full_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_stream.jsonl");
        for i in 0..500 {
            append_line(&path, &serde_json::json!({"n": i})).unwrap();
        }
        let (full, _) = read_full(&path).unwrap();
        let tail = read_tail(&path, 17).unwrap();
        assert_eq!(tail, full[full.len() - 17..]);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_stream.jsonl");
        fs::write(&path, "{\"ok\":1}\nnot json\n{\"ok\":2}\n").unwrap();
        let (lines, malformed) = read_full(&path).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(malformed, 1);
    }

    #[test]
    fn archive_moves_all_three_logs_into_one_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path();
        append_line(
            &log_path(workspace, "agent-1", StreamKind::Progress),
            &serde_json::json!({"p": 1}),
        )
        .unwrap();
        append_line(
            &log_path(workspace, "agent-1", StreamKind::Findings),
            &serde_json::json!({"f": 1}),
        )
        .unwrap();

        let archive_path = archive_agent_logs(workspace, "agent-1").unwrap();
        assert!(archive_path.exists());
        assert!(!log_path(workspace, "agent-1", StreamKind::Progress).exists());
        assert!(!log_path(workspace, "agent-1", StreamKind::Findings).exists());
    }

    #[test]
    fn summary_mode_keeps_only_signal_lines() {
        let lines = vec![
            "{\"type\":\"assistant\",\"text\":\"hello\"}".to_string(),
            "{\"type\":\"result\",\"subtype\":\"success\"}".to_string(),
        ];
        let out = truncate_response(lines, 10_000, TruncationMode::Summary);
        assert!(out.contains("result"));
        assert!(!out.contains("hello"));
    }
}
