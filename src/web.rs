use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use askama::Template;
use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    fetcher::FetchError,
    publisher::{BuildError, BuildOutcome, Publisher},
    state::StatusData,
};

#[derive(Clone)]
pub struct AppState {
    publisher: Arc<Publisher>,
    status: Arc<Mutex<StatusData>>,
    name: Arc<str>,
}

impl AppState {
    pub fn new(publisher: Arc<Publisher>, status: StatusData, name: &str) -> Self {
        Self {
            publisher,
            status: Arc::new(Mutex::new(status)),
            name: name.into(),
        }
    }

    fn status(&self) -> MutexGuard<'_, StatusData> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn router(state: AppState) -> Router {
    let assets = ServeDir::new(state.publisher.assets_dir());
    Router::new()
        .route("/", get(index_page))
        .route("/hello", get(hello))
        .route("/build", get(build_latest))
        .route("/getChapURL", get(build_from_url).post(build_from_url))
        .route("/getLinkUpdate", get(link_update))
        .nest_service("/assets", assets)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_webserver(port: u16, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on port {port}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Could not listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn index_page(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    let status = state.status().clone();
    let built_at = state
        .publisher
        .state()
        .built_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    let template = IndexPageTemplate {
        has_book: status.has_book(),
        service: status.service,
        revision: status.revision,
        latest_chapter: status.latest_chapter,
        built_at,
    };
    Ok(Html(template.render()?))
}

async fn hello(State(state): State<AppState>) -> String {
    format!("BasePage {}!\n", state.name)
}

async fn build_latest(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    let publisher = state.publisher.clone();
    let outcome = tokio::task::spawn_blocking(move || publisher.build_latest())
        .await?
        .inspect_err(|err| error!(stage = err.stage(), "Build of latest chapter failed: {err}"))?;
    log_outcome(&outcome);
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ChapterForm {
    #[serde(rename = "chapterURL")]
    chapter_url: Option<String>,
}

async fn build_from_url(
    State(state): State<AppState>,
    Form(form): Form<ChapterForm>,
) -> Result<StatusCode, AppError> {
    let Some(url) = form.chapter_url.filter(|url| !url.trim().is_empty()) else {
        warn!("Empty URL string");
        return Ok(StatusCode::BAD_REQUEST);
    };
    let url = url.trim().to_string();

    let publisher = state.publisher.clone();
    let chapter_url = url.clone();
    let outcome = tokio::task::spawn_blocking(move || publisher.build_from(&chapter_url))
        .await?
        .inspect_err(|err| error!(%url, stage = err.stage(), "Build failed: {err}"))?;
    log_outcome(&outcome);
    Ok(StatusCode::OK)
}

fn log_outcome(outcome: &BuildOutcome) {
    match outcome {
        BuildOutcome::Built { file_name } => info!(file = %file_name, "New book available"),
        BuildOutcome::Unchanged { title } => info!(%title, "Book already up to date"),
    }
}

/// Hands out the latest book's file name and shows it on the status page from now on.
async fn link_update(State(state): State<AppState>) -> String {
    let link = state.publisher.state().latest_link_path;
    state.status().latest_chapter = link.clone();
    link
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexPageTemplate {
    service: String,
    revision: String,
    latest_chapter: String,
    has_book: bool,
    built_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("Build task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Could not render template: {0}")]
    Render(#[from] askama::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Build(BuildError::Busy) => StatusCode::CONFLICT,
            AppError::Build(BuildError::LinkNotFound(_)) => StatusCode::BAD_GATEWAY,
            AppError::Build(BuildError::Fetch(
                FetchError::InvalidUrl { .. } | FetchError::UnsupportedScheme { .. },
            )) => StatusCode::BAD_REQUEST,
            AppError::Build(BuildError::Fetch(err)) if err.is_retryable() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Build(BuildError::Fetch(_)) => StatusCode::BAD_GATEWAY,
            AppError::Build(BuildError::Book(_)) | AppError::Join(_) | AppError::Render(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::stub::StubSource;
    use crate::state::{NOT_RECEIVED, NOT_UPDATED};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use reqwest::Url;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const HOMEPAGE: &str = "https://example.com/";

    fn app(source: StubSource) -> (TempDir, Router) {
        let dir = tempdir().unwrap();
        let publisher = Publisher::new(
            Arc::new(source),
            Url::parse(HOMEPAGE).unwrap(),
            dir.path().to_path_buf(),
        );
        let state = AppState::new(
            Arc::new(publisher),
            StatusData::new("twi-epub".to_string(), "0.4.2".to_string()),
            "World",
        );
        (dir, router(state))
    }

    fn chapter_site() -> StubSource {
        StubSource::default()
            .with_page(
                HOMEPAGE,
                r#"<div id="latest-chapter-display"><a href="https://example.com/ch1">Latest</a></div>"#,
            )
            .with_page(
                "https://example.com/ch1",
                r#"<h1 class="entry-title">Chapter 1.5</h1><div class="entry-content"><p>Hello</p><p>World &lt;3</p></div>"#,
            )
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(router, request).await
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_index_page() {
        let (_dir, router) = app(StubSource::default());
        let (status, body) = get(&router, "/").await;
        assert_eq!(StatusCode::OK, status);
        assert!(body.contains("twi-epub"));
        assert!(body.contains("0.4.2"));
        assert!(body.contains(NOT_RECEIVED));
    }

    #[tokio::test]
    async fn test_hello() {
        let (_dir, router) = app(StubSource::default());
        assert_eq!((StatusCode::OK, "BasePage World!\n".to_string()), get(&router, "/hello").await);
    }

    #[tokio::test]
    async fn test_link_update_before_any_build() {
        let (_dir, router) = app(StubSource::default());
        assert_eq!((StatusCode::OK, NOT_UPDATED.to_string()), get(&router, "/getLinkUpdate").await);
    }

    #[tokio::test]
    async fn test_build_then_download() {
        let (dir, router) = app(chapter_site());

        let (status, body) = get(&router, "/build").await;
        assert_eq!(StatusCode::OK, status);
        assert!(body.is_empty());
        assert!(dir.path().join("TWIChapter_1-5.epub").exists());

        // The status page only learns about the book once a client asks for it.
        let (_, page) = get(&router, "/").await;
        assert!(!page.contains("TWIChapter_1-5.epub"));

        let (status, link) = get(&router, "/getLinkUpdate").await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!("TWIChapter_1-5.epub", link);

        let (_, page) = get(&router, "/").await;
        assert!(page.contains("/assets/TWIChapter_1-5.epub"));

        let (status, book) = get(&router, "/assets/TWIChapter_1-5.epub").await;
        assert_eq!(StatusCode::OK, status);
        assert!(book.starts_with("PK"));

        let (status, _) = get(&router, "/assets/TWIChapter_9-9.epub").await;
        assert_eq!(StatusCode::NOT_FOUND, status);
    }

    #[tokio::test]
    async fn test_chapter_url_from_form() {
        let (dir, router) = app(chapter_site());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/getChapURL")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("chapterURL=https%3A%2F%2Fexample.com%2Fch1"))
            .unwrap();

        let (status, body) = send(&router, request).await;

        assert_eq!(StatusCode::OK, status);
        assert!(body.is_empty());
        assert!(dir.path().join("TWIChapter_1-5.epub").exists());
    }

    #[tokio::test]
    async fn test_chapter_url_from_query() {
        let (dir, router) = app(chapter_site());
        let (status, _) =
            get(&router, "/getChapURL?chapterURL=https%3A%2F%2Fexample.com%2Fch1").await;
        assert_eq!(StatusCode::OK, status);
        assert!(dir.path().join("TWIChapter_1-5.epub").exists());
    }

    #[tokio::test]
    async fn test_missing_chapter_url() {
        let (_dir, router) = app(chapter_site());
        assert_eq!(StatusCode::BAD_REQUEST, get(&router, "/getChapURL").await.0);
        assert_eq!(StatusCode::BAD_REQUEST, get(&router, "/getChapURL?chapterURL=").await.0);
    }

    #[tokio::test]
    async fn test_bad_chapter_urls() {
        let (_dir, router) = app(chapter_site());
        assert_eq!(StatusCode::BAD_REQUEST, get(&router, "/getChapURL?chapterURL=404").await.0);
        assert_eq!(
            StatusCode::BAD_REQUEST,
            get(&router, "/getChapURL?chapterURL=ftp%3A%2F%2Fexample.com%2Fch1").await.0
        );
        assert_eq!(
            StatusCode::BAD_GATEWAY,
            get(&router, "/getChapURL?chapterURL=https%3A%2F%2Fexample.com%2Fgone").await.0
        );
    }

    #[tokio::test]
    async fn test_build_without_latest_link() {
        let (_dir, router) = app(StubSource::default().with_page(HOMEPAGE, "<p>no marker</p>"));
        assert_eq!(StatusCode::BAD_GATEWAY, get(&router, "/build").await.0);
        // The server keeps answering after a failed build.
        assert_eq!(StatusCode::OK, get(&router, "/getLinkUpdate").await.0);
    }

    #[test]
    fn test_error_status_mapping() {
        let url = Url::parse(HOMEPAGE).unwrap();
        assert_eq!(StatusCode::CONFLICT, AppError::Build(BuildError::Busy).status());
        assert_eq!(
            StatusCode::SERVICE_UNAVAILABLE,
            AppError::Build(BuildError::Fetch(FetchError::Status {
                url: url.clone(),
                status: reqwest::StatusCode::BAD_GATEWAY,
            }))
            .status()
        );
        assert_eq!(
            StatusCode::BAD_GATEWAY,
            AppError::Build(BuildError::Fetch(FetchError::Status {
                url,
                status: reqwest::StatusCode::FORBIDDEN,
            }))
            .status()
        );
    }
}
