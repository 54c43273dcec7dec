//! Progress extraction from yt-dlp output lines

use regex::Regex;
use std::sync::LazyLock;

use super::models::ProgressEvent;

/// Line shapes yt-dlp uses to report progress, tried in order. The first one
/// that matches wins, so a line is never counted twice.
static PROGRESS_MATCHERS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        // [download]  10.4% of 12.50MiB at 470.45KiB/s ETA 00:21
        Regex::new(r"\[download\].*?(\d+\.?\d*)%").unwrap(),
        // [download]  10.4% (1.30MiB at 470.45KiB/s)
        Regex::new(r"\[download\]\s*(\d+\.?\d*)%\s*\(").unwrap(),
        // [download]  1.30MiB at 470.45KiB/s (10.4%)
        Regex::new(r"\((\d+\.?\d*)%\)").unwrap(),
    ]
});

/// Pull a completion percentage out of a stdout line, if it carries one
pub fn parse_progress(line: &str) -> Option<f64> {
    PROGRESS_MATCHERS
        .iter()
        .find_map(|re| re.captures(line))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Classify a stdout line
pub fn classify_stdout(line: &str) -> ProgressEvent {
    match parse_progress(line) {
        Some(percent) => ProgressEvent::Progress { percent },
        None => ProgressEvent::status(line),
    }
}

/// Classify a stderr line. Stderr is never scanned for percentages.
pub fn classify_stderr(line: &str) -> ProgressEvent {
    ProgressEvent::status(line)
}
