//! Running yt-dlp and turning its output into progress events
//!
//! Each run gets its own child process. Stdout and stderr are drained by two
//! independent tasks so a full pipe on one side never stalls the other, and
//! every line is forwarded through an unbounded channel so the child is never
//! held up by a slow consumer.

use futures_util::Stream;
use std::{io, path::PathBuf, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinError,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, span, warn};

use super::locate::locate_tool;
use super::models::{ConversionRequest, ExtractorTool, ProgressEvent, is_valid_url};
use super::progress::{classify_stderr, classify_stdout};
use super::{ConvertError, Result};

/// Handle returned to the caller for consuming events and cancelling the run
#[derive(Debug)]
pub struct ConversionHandle {
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    cancellation_token: CancellationToken,
}

impl ConversionHandle {
    /// Next event of the run, `None` once the terminal event has been consumed
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Ask the extractor to stop. The run still drains its output and ends
    /// with a `Failed` event.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        futures_util::stream::unfold(self, |mut handle| async move {
            handle.next_event().await.map(|event| (event, handle))
        })
    }

    /// Drain the run and return the output directory
    ///
    /// Returns Err with the failure message if the run failed.
    pub async fn wait_until_done(&mut self) -> std::result::Result<PathBuf, String> {
        while let Some(event) = self.next_event().await {
            match event {
                ProgressEvent::Completed { output_dir, .. } => return Ok(output_dir),
                ProgressEvent::Failed { message } => return Err(message),
                _ => {}
            }
        }
        Err("Conversion ended without a result".to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversionRunner {
    /// Explicit yt-dlp path, skips the search when set
    tool_path: Option<PathBuf>,
    /// Fully resolved invocation, used as-is when set
    tool: Option<ExtractorTool>,
}

impl ConversionRunner {
    pub fn new(tool_path: Option<PathBuf>) -> Self {
        Self {
            tool_path,
            tool: None,
        }
    }

    pub fn with_tool(tool: ExtractorTool) -> Self {
        Self {
            tool_path: None,
            tool: Some(tool),
        }
    }

    fn resolve_tool(&self) -> Result<ExtractorTool> {
        match &self.tool {
            Some(tool) => Ok(tool.clone()),
            None => locate_tool(self.tool_path.as_deref()).map(ExtractorTool::new),
        }
    }

    /// Start a conversion.
    ///
    /// Bad input and a missing extractor are reported here, before any process
    /// exists. Everything after that arrives as the terminal event of the
    /// returned handle.
    pub fn run(&self, request: ConversionRequest) -> Result<ConversionHandle> {
        if !is_valid_url(&request.url) {
            return Err(ConvertError::InvalidUrl(request.url));
        }
        if !request.output_dir.is_dir() {
            return Err(ConvertError::InvalidOutputDirectory(request.output_dir));
        }
        let tool = self.resolve_tool()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();

        let run_span = span!(Level::INFO, "conversion", url = %request.url);
        tokio::spawn(drive(tool, request, tx, cancellation_token.clone()).instrument(run_span));

        Ok(ConversionHandle {
            events: rx,
            cancellation_token,
        })
    }
}

fn build_command(tool: &ExtractorTool, request: &ConversionRequest) -> Command {
    let mut command = Command::new(&tool.program);
    command
        .args(&tool.base_args)
        .args(["-x", "--audio-format", "mp3", "-o"])
        .arg(request.output_template())
        .arg("--newline")
        .arg(&request.url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    command
}

async fn drive(
    tool: ExtractorTool,
    request: ConversionRequest,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    cancellation_token: CancellationToken,
) {
    let terminal = match supervise(&tool, &request, &tx, &cancellation_token).await {
        Ok(()) => {
            info!(output_dir = %request.output_dir.display(), "Conversion completed");
            ProgressEvent::Completed {
                exit_code: 0,
                output_dir: request.output_dir,
            }
        }
        Err(e) => {
            error!(error = %e, "Conversion failed");
            ProgressEvent::failed(e.to_string())
        }
    };

    // Receiver may be gone already, nothing to do about it
    let _ = tx.send(terminal);
}

async fn supervise(
    tool: &ExtractorTool,
    request: &ConversionRequest,
    tx: &mpsc::UnboundedSender<ProgressEvent>,
    cancellation_token: &CancellationToken,
) -> Result<()> {
    let mut child = build_command(tool, request)
        .spawn()
        .map_err(ConvertError::ProcessLaunchFailed)?;
    info!(pid = ?child.id(), program = %tool.program.display(), "Started yt-dlp");

    let stdout = child.stdout.take().ok_or_else(|| {
        ConvertError::ProcessLaunchFailed(io::Error::other("stdout was not captured"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        ConvertError::ProcessLaunchFailed(io::Error::other("stderr was not captured"))
    })?;

    let stdout_task = tokio::spawn(pump(stdout, classify_stdout, tx.clone()));
    let stderr_task = tokio::spawn(pump(stderr, classify_stderr, tx.clone()));

    let readers = async {
        let (out, err) = tokio::join!(stdout_task, stderr_task);
        reader_outcome(out).and(reader_outcome(err))
    };
    tokio::pin!(readers);

    let mut cancelled = false;
    let read_result = tokio::select! {
        result = &mut readers => result,
        _ = cancellation_token.cancelled() => {
            cancelled = true;
            warn!("Cancellation requested, terminating yt-dlp");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "yt-dlp already gone");
            }
            // Keep draining so the pipes close cleanly
            readers.await
        }
    };

    if read_result.is_err() {
        let _ = child.start_kill();
    }

    // EOF on both pipes doesn't mean the process is gone yet
    let status = child.wait().await.map_err(ConvertError::StreamReadFailed)?;
    debug!(?status, "yt-dlp exited");
    read_result?;

    if cancelled {
        return Err(ConvertError::Cancelled);
    }

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(ConvertError::ProcessExitedNonZero(code)),
        None => Err(ConvertError::ProcessTerminated),
    }
}

fn reader_outcome(joined: std::result::Result<io::Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.map_err(ConvertError::StreamReadFailed),
        Err(e) => Err(ConvertError::StreamReadFailed(io::Error::other(e))),
    }
}

async fn pump<R>(
    reader: R,
    classify: fn(&str) -> ProgressEvent,
    tx: mpsc::UnboundedSender<ProgressEvent>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        // Titles may come through in the console's code page, not UTF-8
        let line = String::from_utf8_lossy(trim_line_ending(&buf));
        // keep reading even if nobody listens, the child must not block
        let _ = tx.send(classify(&line));
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
