//! Rate-limit classification of agent output.
//!
//! A rate limit is a transient condition distinct from a hard failure, so it
//! is recovered through agent fallback rather than the error strategy.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static RATE_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b429\b",
        r"(?i)rate[ _-]?limit(ed)?",
        r"(?i)too many requests",
        r"(?i)quota (exceeded|exhausted)",
        r"(?i)resource[ _]exhausted",
        r"(?i)\boverloaded(_error)?\b",
        r"(?i)usage limit (reached|exceeded)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RETRY_AFTER_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:retry[- ]after|try again in)[:=\s]+(\d+)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?")
        .unwrap()
});

/// Only the tail of stdout is inspected; agent transcripts can quote anything.
const STDOUT_TAIL_CHARS: usize = 2000;

/// Verdict for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDetection {
    pub is_rate_limit: bool,
    /// The line that matched, trimmed.
    pub message: Option<String>,
    /// Provider-supplied wait hint.
    pub retry_after: Option<Duration>,
}

impl RateLimitDetection {
    fn none() -> Self {
        Self::default()
    }
}

/// Stateless classifier from process output to a rate-limit verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitDetector;

impl RateLimitDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classifies an execution. A zero exit code is never a rate limit.
    pub fn detect(&self, stdout: &str, stderr: &str, exit_code: Option<i32>) -> RateLimitDetection {
        if exit_code == Some(0) {
            return RateLimitDetection::none();
        }

        let tail = stdout_tail(stdout);
        let matched = [stderr, tail]
            .into_iter()
            .flat_map(str::lines)
            .find(|line| RATE_LIMIT_PATTERNS.iter().any(|re| re.is_match(line)));

        let Some(line) = matched else {
            return RateLimitDetection::none();
        };

        let retry_after = parse_retry_after(stderr).or_else(|| parse_retry_after(tail));

        RateLimitDetection {
            is_rate_limit: true,
            message: Some(line.trim().to_string()),
            retry_after,
        }
    }
}

fn stdout_tail(stdout: &str) -> &str {
    let len = stdout.len();
    if len <= STDOUT_TAIL_CHARS {
        return stdout;
    }
    let mut start = len - STDOUT_TAIL_CHARS;
    while !stdout.is_char_boundary(start) {
        start += 1;
    }
    &stdout[start..]
}

fn parse_retry_after(text: &str) -> Option<Duration> {
    let caps = RETRY_AFTER_SECONDS.captures(text)?;
    let value: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map_or("s", |m| m.as_str()).to_ascii_lowercase();

    let duration = if unit.starts_with("ms") || unit.starts_with("milli") {
        Duration::from_millis(value)
    } else if unit.starts_with('m') {
        Duration::from_secs(value * 60)
    } else {
        Duration::from_secs(value)
    };
    Some(duration)
}
