//! Data structures for the conversion pipeline
//!
//! This file contains the request type handed to the runner, the events it
//! emits while the extractor runs, and the resolved extractor command.

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};
use url::Url;

/// A single conversion job: where to fetch from and where to put the audio
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionRequest {
    pub url: String,
    pub output_dir: PathBuf,
}

impl ConversionRequest {
    pub fn new(url: impl Into<String>, output_dir: impl AsRef<Path>) -> Self {
        Self {
            url: url.into(),
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    /// The `-o` template passed to the extractor. The `%(...)s` placeholders
    /// are expanded by the extractor, not by us.
    pub fn output_template(&self) -> PathBuf {
        self.output_dir.join("%(title)s.%(ext)s")
    }
}

/// Returns true for absolute http(s) URLs pointing at a YouTube host
pub fn is_valid_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    parsed
        .host_str()
        .is_some_and(|host| host.contains("youtube.com") || host.contains("youtu.be"))
}

/// Something that happened during a conversion run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A raw line of output that didn't carry a percentage
    StatusLine { text: String },
    /// Completion percentage parsed from the extractor output. Not clamped.
    Progress { percent: f64 },
    /// The extractor exited cleanly
    Completed { exit_code: i32, output_dir: PathBuf },
    /// The run failed; always the last event
    Failed { message: String },
}

impl ProgressEvent {
    pub fn status(text: impl Into<String>) -> Self {
        Self::StatusLine { text: text.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Check if this event ends the run (either successfully or with failure)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusLine { text } => write!(f, "{}", text),
            Self::Progress { percent } => write!(f, "{:.1}%", percent),
            Self::Completed { output_dir, .. } => {
                write!(f, "Completed: {}", output_dir.display())
            }
            Self::Failed { message } => write!(f, "Failed: {}", message),
        }
    }
}

/// A resolved extractor invocation
///
/// Usually just the path to a `yt-dlp` binary, but a launcher can be put in
/// front of it (e.g. `python3 -m yt_dlp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorTool {
    pub program: PathBuf,
    pub base_args: Vec<OsString>,
}

impl ExtractorTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_launcher<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            base_args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_youtube_urls() {
        for url in [
            "https://www.youtube.com/watch?v=X",
            "https://youtu.be/X",
            "https://m.youtube.com/watch?v=X",
            "https://music.youtube.com/watch?v=X",
            "http://youtube.com/watch?v=X",
        ] {
            assert!(is_valid_url(url), "{url} should be accepted");
        }
    }

    #[test]
    fn test_invalid_urls() {
        for url in [
            "",
            "youtube.com/watch?v=X",
            "www.youtube.com/watch?v=X",
            "/watch?v=X",
            "ftp://www.youtube.com/watch?v=X",
            "file:///home/user/youtube.com",
            "https://vimeo.com/12345",
            "https://example.com/?u=youtube.com",
            "not a url at all",
        ] {
            assert!(!is_valid_url(url), "{url} should be rejected");
        }
    }

    #[test]
    fn test_output_template() {
        let request = ConversionRequest::new("https://youtu.be/X", "/tmp");
        assert_eq!(
            request.output_template(),
            PathBuf::from("/tmp").join("%(title)s.%(ext)s")
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(ProgressEvent::Progress { percent: 10.4 }).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percent"], 10.4);

        let json = serde_json::to_value(ProgressEvent::failed("boom")).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn test_event_display() {
        assert_eq!(ProgressEvent::Progress { percent: 10.44 }.to_string(), "10.4%");
        assert_eq!(ProgressEvent::status("[youtube] x").to_string(), "[youtube] x");
        assert_eq!(ProgressEvent::failed("boom").to_string(), "Failed: boom");
    }
}
