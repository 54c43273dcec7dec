use crate::convert::{
    ConversionHandle, ConversionRequest, ConversionRunner, ConvertError, ProgressEvent,
};
use crate::session::{SessionEntry, SessionError, SessionStore, discard_file};
use crate::util::{content_disposition, guess_content_type};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as HttpPath, Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use mime_guess::mime::Mime;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tower_http::{services::ServeFile, trace::TraceLayer};
use tracing::{Instrument, Level, debug, error, info, span, warn};
use ulid::Ulid;

const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0:?}")]
    Error(#[from] color_eyre::Report),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Convert(ConvertError::InvalidUrl(_)) => StatusCode::BAD_REQUEST,
            Error::Convert(ConvertError::ToolNotFound) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Session(SessionError::SessionNotFound | SessionError::SessionExpired) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            // Expired and consumed look the same from the outside
            Error::Session(SessionError::SessionExpired) => {
                SessionError::SessionNotFound.to_string()
            }
            // The path is logged, never sent
            Error::Session(SessionError::FileMissingOnRetrieval(_)) => {
                "File missing on server".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

pub type TubeRes<T> = Result<T, Error>;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<dyn SessionStore>,
    pub runner: ConversionRunner,
    /// Each conversion gets its own subdirectory in here
    pub work_dir: PathBuf,
}

impl AppState {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        runner: ConversionRunner,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sessions,
            runner,
            work_dir: work_dir.into(),
        }
    }
}

/// Deletes a handed-out file once the response body is done with it, whether
/// the transfer finished or was aborted
struct DeleteOnDrop {
    file_path: PathBuf,
    scratch_dir: Option<PathBuf>,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        discard_file(&self.file_path, self.scratch_dir.as_deref());
    }
}

fn attach_cleanup(body: Body, guard: DeleteOnDrop) -> Body {
    let stream = futures_util::stream::unfold(
        (body.into_data_stream(), guard),
        |(mut data, guard)| async move { data.next().await.map(|chunk| (chunk, (data, guard))) },
    );
    Body::from_stream(stream)
}

/// Exchange a one-time token for the converted file
pub async fn download_file(
    State(state): State<AppState>,
    HttpPath(token): HttpPath<String>,
    mut request: Request,
) -> TubeRes<Response> {
    let session = state.sessions.take(&token)?;
    // From here on the file is ours to delete, on every path out of this handler
    let guard = DeleteOnDrop {
        file_path: session.file_path.clone(),
        scratch_dir: session.scratch_dir.clone(),
    };

    if !session.file_path.is_file() {
        error!(path = %session.file_path.display(), "Session file missing on disk");
        return Err(SessionError::FileMissingOnRetrieval(session.file_path).into());
    }

    let mime: Mime = session
        .content_type
        .as_deref()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .parse()
        .unwrap_or(mime_guess::mime::APPLICATION_OCTET_STREAM);
    let filename = session.file_name().unwrap_or("download.mp3").to_string();

    // The token is spent already, a 304 or 412 would hand out nothing
    for name in [
        header::IF_NONE_MATCH,
        header::IF_MODIFIED_SINCE,
        header::IF_MATCH,
        header::IF_UNMODIFIED_SINCE,
    ] {
        request.headers_mut().remove(name);
    }

    let response = match ServeFile::new_with_mime(&session.file_path, &mime)
        .oneshot(request)
        .await
    {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };

    if response.status() == StatusCode::NOT_FOUND {
        // Vanished between the check and the open
        error!(path = %session.file_path.display(), "Session file vanished before serving");
        return Err(SessionError::FileMissingOnRetrieval(session.file_path).into());
    }

    info!(path = %session.file_path.display(), status = %response.status(), "Serving download");

    let (mut parts, body) = response.into_parts();
    parts.headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&filename))
            .map_err(|e| color_eyre::eyre::eyre!(e))?,
    );

    Ok(Response::from_parts(parts, attach_cleanup(Body::new(body), guard)))
}

#[derive(Debug, Deserialize)]
pub struct ConvertPayload {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadReady {
    pub token: String,
    pub download_url: String,
}

/// What the SSE stream of a conversion carries
#[derive(Debug)]
enum JobEvent {
    Update(ProgressEvent),
    Ready(DownloadReady),
    Failed(ErrorResponse),
}

impl JobEvent {
    fn into_sse(self) -> Result<Event, axum::Error> {
        match self {
            JobEvent::Update(event) => Event::default().event("progress").json_data(event),
            JobEvent::Ready(ready) => Event::default().event("ready").json_data(ready),
            JobEvent::Failed(error) => Event::default().event("failed").json_data(error),
        }
    }
}

/// Start a conversion and stream its progress as server-sent events
pub async fn convert(
    State(state): State<AppState>,
    Json(payload): Json<ConvertPayload>,
) -> TubeRes<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let url = payload.url.trim().to_string();
    let job_id = Ulid::new();
    let scratch_dir = state.work_dir.join(job_id.to_string());

    tokio::fs::create_dir_all(&scratch_dir)
        .await
        .map_err(|e| {
            color_eyre::eyre::eyre!("Failed to create {}: {}", scratch_dir.display(), e)
        })?;

    let handle = match state.runner.run(ConversionRequest::new(url, &scratch_dir)) {
        Ok(handle) => handle,
        Err(e) => {
            remove_scratch_dir(&scratch_dir).await;
            return Err(e.into());
        }
    };

    info!(id = %job_id, "Conversion started");
    let (tx, rx) = mpsc::channel(64);
    let job_span = span!(Level::INFO, "job", id = %job_id);
    tokio::spawn(
        coordinate(handle, Arc::clone(&state.sessions), scratch_dir, tx).instrument(job_span),
    );

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event: JobEvent| (event.into_sse(), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Forward a run's events to the client and register the result for download
async fn coordinate(
    mut handle: ConversionHandle,
    sessions: Arc<dyn SessionStore>,
    scratch_dir: PathBuf,
    tx: mpsc::Sender<JobEvent>,
) {
    let mut client_gone = false;
    let mut succeeded = false;

    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            // yt-dlp can be quiet for a long time, don't wait for a failed send
            _ = tx.closed(), if !client_gone => {
                warn!("Client went away, cancelling conversion");
                client_gone = true;
                handle.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        debug!(%event, "Conversion event");
        if let ProgressEvent::Completed { .. } = event {
            succeeded = true;
        }
        if !client_gone && tx.send(JobEvent::Update(event)).await.is_err() {
            warn!("Client went away, cancelling conversion");
            client_gone = true;
            handle.cancel();
        }
    }

    if !succeeded || client_gone {
        remove_scratch_dir(&scratch_dir).await;
        return;
    }

    let Some(file_path) = find_audio_file(&scratch_dir).await else {
        warn!(path = %scratch_dir.display(), "yt-dlp finished without producing an mp3");
        remove_scratch_dir(&scratch_dir).await;
        let _ = tx
            .send(JobEvent::Failed(ErrorResponse::new(
                "Conversion produced no audio file",
            )))
            .await;
        return;
    };

    let content_type = guess_content_type(&file_path);
    let token = sessions.add_entry(
        SessionEntry::new(file_path, Some(content_type)).with_scratch_dir(&scratch_dir),
    );
    let ready = DownloadReady {
        download_url: format!("/download/{token}"),
        token,
    };

    if tx.send(JobEvent::Ready(ready)).await.is_err() {
        // Nobody will ever ask for it; the store purges it once it expires
        warn!("Client went away before the download link was delivered");
    }
}

async fn remove_scratch_dir(dir: &Path) {
    debug!(path = %dir.display(), "Removing scratch directory");
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(path = %dir.display(), error = %e, "Failed to remove scratch directory");
    }
}

async fn find_audio_file(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_mp3 = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"));
        if is_mp3 && path.is_file() {
            return Some(path);
        }
    }
    None
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/convert", post(convert))
        .route("/download/{token}", get(download_file))
        .route("/healthz", get(|| async { "ok" }))
        .fallback(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("Not Found")),
            )
        })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
