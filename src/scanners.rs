//! Crash/error log scanners.
//!
//! Grounded on `crash_monitor.py` (core-side crash scanner with component
//! classification) and `core_fuzzer.py`'s `drain_gnb_error_since_last`/
//! `normalize_cause` (gNB-side incremental cause extraction). Exact regex
//! shapes are recorded in SPEC_FULL.md §4.7.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use patterns::*;

use crate::error::{Error, Result};

mod patterns {
    pub use regex::Regex;
    use std::sync::OnceLock;

    macro_rules! static_regex {
        ($name:ident, $pat:expr) => {
            pub fn $name() -> &'static Regex {
                static RE: OnceLock<Regex> = OnceLock::new();
                RE.get_or_init(|| Regex::new($pat).unwrap())
            }
        };
    }

    static_regex!(ansi_re, r"\x1b\[[0-?]*[ -/]*[@-~]");
    static_regex!(crash_re, r"(?i)(fatal|fata|assert|assertion|backtrace|abort|panic|segfault|sigsegv|core dumped)");
    static_regex!(tag_re, r"(?i)\[(amf|smf|core)\]");
    static_regex!(amf_re, r"(?i)\bamf\b");
    static_regex!(smf_re, r"(?i)\bsmf\b");
    static_regex!(gnb_error_indication_re, r"(?i)Error(?:\s+|_)indication(?P<tail>.*)$");
    static_regex!(gnb_cause_colon_re, r"(?i)Cause:\s*(?P<cause>.+)$");
    static_regex!(gnb_cause_bracket_re, r"(?i)cause\[(?P<cat>[^\]]+)\]\s*(?P<detail>.+)?$");
    static_regex!(gnb_cause_plain_re, r"([\w.-]+/[\w.-]+)");
}

fn strip_ansi(line: &str) -> String {
    ansi_re().replace_all(line, "").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Amf,
    Smf,
    Core,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CrashIncident {
    pub component: Component,
    pub line_no: usize,
    pub keyword: String,
    pub text: String,
}

/// Finds the component a crash-keyword line belongs to: its own `[amf]`/
/// `[smf]` tag first (a `[core]` tag instead falls back to `last_seen`,
/// but only when that's itself amf/smf), then an exclusive bare `amf`/`smf`
/// token on the same line, then the same exclusive check over the joined
/// ±6-line context window (current line included), falling back to
/// `Unknown`.
fn classify_component(lines: &[String], idx: usize, last_seen: &Option<Component>) -> Component {
    if let Some(caps) = tag_re().captures(&lines[idx]) {
        match caps[1].to_ascii_lowercase().as_str() {
            "amf" => return Component::Amf,
            "smf" => return Component::Smf,
            _ => {
                if matches!(last_seen, Some(Component::Amf) | Some(Component::Smf)) {
                    return last_seen.clone().unwrap();
                }
            }
        }
    }

    let has_amf = amf_re().is_match(&lines[idx]);
    let has_smf = smf_re().is_match(&lines[idx]);
    if has_amf && !has_smf {
        return Component::Amf;
    }
    if has_smf && !has_amf {
        return Component::Smf;
    }

    let lo = idx.saturating_sub(6);
    let hi = (idx + 6).min(lines.len().saturating_sub(1));
    let window = lines[lo..=hi].join("\n");
    let win_has_amf = amf_re().is_match(&window);
    let win_has_smf = smf_re().is_match(&window);
    if win_has_amf && !win_has_smf {
        return Component::Amf;
    }
    if win_has_smf && !win_has_amf {
        return Component::Smf;
    }

    Component::Unknown
}

/// Scans `text` (already ANSI-stripped line by line) for crash keywords,
/// returning every incident found along with its classified component.
pub fn scan_crash_incidents(text: &str) -> Vec<CrashIncident> {
    let lines: Vec<String> = text.lines().map(strip_ansi).collect();
    let mut incidents = Vec::new();
    let mut last_seen: Option<Component> = None;

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = tag_re().captures(line) {
            match caps[1].to_ascii_lowercase().as_str() {
                "amf" => last_seen = Some(Component::Amf),
                "smf" => last_seen = Some(Component::Smf),
                _ => {}
            }
        }
        if let Some(m) = crash_re().find(line) {
            let component = classify_component(&lines, idx, &last_seen);
            incidents.push(CrashIncident {
                component,
                line_no: idx,
                keyword: m.as_str().to_string(),
                text: line.clone(),
            });
        }
    }
    incidents
}

pub fn check_amf_crash(text: &str) -> (bool, Vec<CrashIncident>) {
    let hits: Vec<CrashIncident> = scan_crash_incidents(text)
        .into_iter()
        .filter(|i| i.component == Component::Amf)
        .collect();
    (!hits.is_empty(), hits)
}

pub fn check_smf_crash(text: &str) -> (bool, Vec<CrashIncident>) {
    let hits: Vec<CrashIncident> = scan_crash_incidents(text)
        .into_iter()
        .filter(|i| i.component == Component::Smf)
        .collect();
    (!hits.is_empty(), hits)
}

/// Finds the most-recently-modified `*.log` file directly under `dir`.
pub fn last_core_log(dir: &Path) -> Result<Option<std::path::PathBuf>> {
    let mut best: Option<(std::time::SystemTime, std::path::PathBuf)> = None;
    for entry in fs::read_dir(dir).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let modified = entry.metadata().map_err(Error::Io)?.modified().map_err(Error::Io)?;
        if best.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            best = Some((modified, path));
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Incrementally scans the gNB log for `Error indication` markers,
/// remembering the byte offset already consumed across calls.
pub struct GnbErrorDrain {
    path: std::path::PathBuf,
    offset: u64,
}

impl GnbErrorDrain {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        GnbErrorDrain {
            path: path.into(),
            offset: 0,
        }
    }

    /// Reads any bytes appended since the last call and extracts
    /// normalized error causes from them, in priority order: a `Cause:`
    /// suffix, a `cause[category] detail` suffix, or a bare
    /// `category/detail` token.
    pub fn drain_since_last(&mut self) -> Result<Vec<String>> {
        let mut file = fs::File::open(&self.path).map_err(Error::Io)?;
        let len = file.metadata().map_err(Error::Io)?.len();
        if len < self.offset {
            self.offset = 0; // log truncated/rotated
        }
        file.seek(SeekFrom::Start(self.offset)).map_err(Error::Io)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(Error::Io)?;
        self.offset = len;

        let mut causes = Vec::new();
        for line in buf.lines() {
            let Some(caps) = gnb_error_indication_re().captures(line) else {
                continue;
            };
            let tail = caps.name("tail").map(|m| m.as_str()).unwrap_or("");
            if let Some(c) = normalize_cause(tail) {
                causes.push(c);
            }
        }
        Ok(causes)
    }
}

fn normalize_cause(tail: &str) -> Option<String> {
    if let Some(caps) = gnb_cause_colon_re().captures(tail) {
        return Some(caps["cause"].trim().to_string());
    }
    if let Some(caps) = gnb_cause_bracket_re().captures(tail) {
        let cat = caps["cat"].trim();
        let detail = caps.name("detail").map(|m| m.as_str().trim()).unwrap_or("");
        return Some(if detail.is_empty() {
            cat.to_string()
        } else {
            format!("{cat}/{detail}")
        });
    }
    gnb_cause_plain_re().find(tail).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_tagged_amf_crash() {
        let log = "[amf] assertion failed at line 10\nnothing else";
        let (hit, incidents) = check_amf_crash(log);
        assert!(hit);
        assert_eq!(incidents[0].component, Component::Amf);
    }

    #[test]
    fn context_window_classifies_untagged_line() {
        let log = "[smf] starting up\nsome noise\nfatal error in handler\nmore noise";
        let (hit, incidents) = check_smf_crash(log);
        assert!(hit);
        assert_eq!(incidents[0].component, Component::Smf);
    }

    #[test]
    fn normalize_cause_prefers_colon_form() {
        assert_eq!(normalize_cause(": Cause: radioNetwork/unspecified"), Some("radioNetwork/unspecified".into()));
    }

    #[test]
    fn normalize_cause_falls_back_to_plain_token() {
        assert_eq!(normalize_cause(" saw radioNetwork/unspecified here"), Some("radioNetwork/unspecified".into()));
    }
}
