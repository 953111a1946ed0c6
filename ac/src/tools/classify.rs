//! Tool result classification
//!
//! Decides whether a result string signals failure, finds unrecoverable
//! (credential/permission) keywords, and compresses error output into a stable
//! fingerprint so repeated failures can be recognised across iterations.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

static TIMESTAMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}[.,\d]*\b").unwrap());
static PID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[\s*\d+\.\d+\]|\bpid\s*=?\s*\d+\b").unwrap());
static HEX_ADDR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]{4,}\b").unwrap());
static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([A-Za-z][A-Za-z0-9_.]*(?:Error|Exception|Warning|Interrupt|Fault|Exit|Stop))(?::(.*))?$").unwrap()
});
static FAULT_FILE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"File "(.+?)", line (\d+)"#).unwrap());
static PACKAGE_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error:.*?(?:conflicting|failed|unable|cannot|not found|permission denied)[^\n]*").unwrap()
});
static SERVICE_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:failed|Active: failed|can't open|error)[^\n]*").unwrap());

/// Lines of output kept in a compressed error
pub const TAIL_LINES: usize = 12;

/// Characters of output kept in a compressed error
pub const MAX_TAIL_CHARS: usize = 800;

/// Whether a tool result signals failure
///
/// Shell-like tools report free-form output, so only an explicit `Error:`
/// result, a non-zero exit code or a shell failure phrase counts. Other tools fail when an `error:`/`exception:`
/// marker appears or the text starts with "error"; a success message that merely
/// mentions the word "error" does not qualify.
pub fn detect_error(tool_name: &str, result: &str, shell_tools: &[String]) -> bool {
    let lower = result.to_lowercase();
    if shell_tools.iter().any(|t| t == tool_name) {
        if lower.trim_start().starts_with("error:") {
            return true;
        }
        if lower.contains("exit code:") && !lower.contains("exit code: 0") {
            return true;
        }
        return lower.contains("command not found") || lower.contains("permission denied");
    }
    lower.contains("error:") || lower.contains("exception:") || lower.trim_start().starts_with("error")
}

/// First critical keyword contained in `result`, case-insensitive
pub fn find_critical_keyword<'a>(result: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lower = result.to_lowercase();
    keywords
        .iter()
        .find(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
        .map(String::as_str)
}

/// Structured summary of a failing tool result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedError {
    pub component: String,
    pub error_type: String,
    pub core_message: String,
    pub suggestion: String,
    pub raw_tail: String,
}

impl CompressedError {
    /// Stable identity of the failure, insensitive to timestamps, PIDs and addresses
    pub fn fingerprint(&self) -> String {
        let material = format!(
            "{}|{}|{}|{}",
            self.component, self.error_type, self.core_message, self.raw_tail
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    /// Single block of text suitable for a model or an operator
    pub fn format_report(&self) -> String {
        let mut lines = vec![
            format!("[ERROR REPORT] Component: {}", self.component),
            format!("Type: {}", self.error_type),
            format!("Core: {}", self.core_message),
        ];
        if !self.suggestion.is_empty() {
            lines.push(format!("Hint: {}", self.suggestion));
        }
        if !self.raw_tail.is_empty() {
            lines.push(format!("Raw (last lines):\n{}", self.raw_tail));
        }
        lines.join("\n")
    }
}

fn suggestion_for(error_type: &str) -> &'static str {
    match error_type {
        "ModuleNotFoundError" => "Consider installing the missing module",
        "ImportError" => "Check if the package is installed in the active environment",
        "PermissionError" => "Check file/directory permissions or run with appropriate privileges",
        "FileNotFoundError" => "Verify the file path exists before accessing it",
        "ConnectionError" => "Check network availability and endpoint configuration",
        "TimeoutError" => "The operation timed out; consider increasing timeout or checking connectivity",
        "KeyError" => "The key does not exist in the mapping; verify the data structure",
        "TypeError" => "Type mismatch; check argument types passed to the function",
        "ValueError" => "Invalid value passed; validate inputs before calling the function",
        _ => "",
    }
}

/// Compress raw error output produced by `source` (usually the tool name)
pub fn compress_error(raw: &str, source: &str) -> CompressedError {
    debug!(%source, raw_len = raw.len(), "compress_error: called");
    if raw.trim().is_empty() {
        return CompressedError {
            component: source.to_string(),
            error_type: "Empty".to_string(),
            core_message: "No error output received".to_string(),
            suggestion: String::new(),
            raw_tail: String::new(),
        };
    }

    let cleaned = clean_noise(raw);
    let tail = extract_tail(&cleaned);
    let last_line = tail.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let source_lower = source.to_lowercase();

    let (error_type, core_message, suggestion) = if source_lower.contains("python") || raw.contains("Traceback") {
        let (error_type, core) = match EXCEPTION_RE.captures_iter(&cleaned).last() {
            Some(caps) => (
                caps[1].to_string(),
                caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            ),
            None => ("UnknownError".to_string(), String::new()),
        };
        let core = if core.is_empty() { last_line.to_string() } else { core };
        let mut suggestion = suggestion_for(&error_type).to_string();
        if let Some(file) = FAULT_FILE_RE.captures_iter(&cleaned).last() {
            let location = format!("Faulting file: {} line {}", &file[1], &file[2]);
            suggestion = if suggestion.is_empty() {
                location
            } else {
                format!("{} ({})", suggestion, location)
            };
        }
        (error_type, core, suggestion)
    } else if source_lower.contains("pacman") || source_lower.contains("apt") {
        let core = PACKAGE_ERROR_RE
            .find_iter(&cleaned)
            .last()
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| last_line.to_string());
        (
            "PackageManagerError".to_string(),
            core,
            "Check the package manager log for details".to_string(),
        )
    } else if source_lower.contains("systemd") || source_lower.contains("journalctl") {
        let core = SERVICE_FAIL_RE
            .find_iter(&cleaned)
            .last()
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| last_line.to_string());
        (
            "SystemdError".to_string(),
            core,
            "Check: journalctl -xe for detailed logs".to_string(),
        )
    } else {
        let core = if last_line.is_empty() {
            cleaned.chars().take(200).collect()
        } else {
            last_line.to_string()
        };
        let lower = core.to_lowercase();
        let error_type = if lower.contains("permission denied") {
            "PermissionError"
        } else if lower.contains("not found") || lower.contains("no such file") {
            "FileNotFoundError"
        } else if lower.contains("connection") || lower.contains("network") {
            "ConnectionError"
        } else {
            "ShellError"
        };
        (error_type.to_string(), core, suggestion_for(error_type).to_string())
    };

    CompressedError {
        component: source.to_string(),
        error_type,
        core_message,
        suggestion,
        raw_tail: tail,
    }
}

fn clean_noise(raw: &str) -> String {
    let text = TIMESTAMP_RE.replace_all(raw, "");
    let text = PID_RE.replace_all(&text, "");
    HEX_ADDR_RE.replace_all(&text, "<addr>").into_owned()
}

fn extract_tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let tail = lines[start..].join("\n");
    let char_count = tail.chars().count();
    if char_count > MAX_TAIL_CHARS {
        tail.chars().skip(char_count - MAX_TAIL_CHARS).collect()
    } else {
        tail
    }
}
