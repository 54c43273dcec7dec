//! Module for converting videos to mp3 through yt-dlp
//!
//! This module spawns the extractor, streams its output back as
//! [`ProgressEvent`]s and reports how the run ended.

mod locate;
mod models;
mod progress;
mod runner;

use std::{io, path::PathBuf};
use thiserror::Error;

// Re-export the public API
pub use locate::{locate_tool, search_path};
pub use models::{ConversionRequest, ExtractorTool, ProgressEvent, is_valid_url};
pub use progress::{classify_stderr, classify_stdout, parse_progress};
pub use runner::{ConversionHandle, ConversionRunner};

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Please enter a valid YouTube URL: {0}")]
    InvalidUrl(String),

    #[error("Output directory does not exist: {}", .0.display())]
    InvalidOutputDirectory(PathBuf),

    #[error("yt-dlp not found. Please install yt-dlp.")]
    ToolNotFound,

    #[error("Failed to start yt-dlp process: {0}")]
    ProcessLaunchFailed(#[source] io::Error),

    #[error("exited with code {0}")]
    ProcessExitedNonZero(i32),

    #[error("terminated by signal")]
    ProcessTerminated,

    #[error("conversion cancelled")]
    Cancelled,

    #[error("Failed to read yt-dlp output: {0}")]
    StreamReadFailed(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
