use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use scraper::Html;
use std::time::Duration;
use tracing::debug;

/// Failure to retrieve a page, split by whether trying again later could help.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("Cannot fetch {url}: only http and https pages are supported")]
    UnsupportedScheme { url: Url },
    #[error("Could not retrieve page {url}: {source}")]
    Transport { url: Url, source: reqwest::Error },
    #[error("Page {url} answered with status {status}")]
    Status { url: Url, status: StatusCode },
    #[error("Could not read body of {url}: {source}")]
    Body { url: Url, source: reqwest::Error },
}

impl FetchError {
    /// Network failures and server-side errors are transient, everything else
    /// will fail the same way on the next attempt. A builder error means the
    /// request was never sent.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::InvalidUrl { .. } | FetchError::UnsupportedScheme { .. } => false,
            FetchError::Transport { source, .. } => !source.is_builder(),
            FetchError::Body { .. } => true,
            FetchError::Status { status, .. } => status.is_server_error(),
        }
    }
}

/// Anything able to hand back the HTML of a page.
pub trait PageSource: Send + Sync {
    fn fetch_page(&self, url: &Url) -> Result<String, FetchError>;
}

/// Parses `url` and returns the queryable document behind it.
pub fn fetch_document(source: &dyn PageSource, url: &str) -> Result<Html, FetchError> {
    let url = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::UnsupportedScheme { url });
    }
    let page = source.fetch_page(&url)?;
    Ok(Html::parse_document(&page))
}

/// Blocking `reqwest` client with a bounded timeout on every request.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        Ok(Self { client })
    }
}

impl PageSource for HttpFetcher {
    fn fetch_page(&self, url: &Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.clone(),
                status,
            });
        }
        // Sites that use another encoding declare it inside the document anyway,
        // so decode as UTF-8 regardless of the Content-Type header.
        let contents = response.bytes().map_err(|source| FetchError::Body {
            url: url.clone(),
            source,
        })?;
        debug!(%url, bytes = contents.len(), "fetched page");
        Ok(String::from_utf8_lossy(&contents).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::{FetchError, PageSource};
    use reqwest::{StatusCode, Url};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned pages; unknown URLs answer 404.
    #[derive(Default)]
    pub struct StubSource {
        pages: HashMap<String, String>,
        pub fetches: AtomicUsize,
    }

    impl StubSource {
        pub fn with_page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.to_string());
            self
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl PageSource for StubSource {
        fn fetch_page(&self, url: &Url) -> Result<String, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.pages
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| FetchError::Status {
                    url: url.clone(),
                    status: StatusCode::NOT_FOUND,
                })
        }
    }
}

#[test]
fn test_invalid_url_is_not_retryable() {
    let source = stub::StubSource::default();
    let err = fetch_document(&source, "404").unwrap_err();
    assert!(matches!(err, FetchError::InvalidUrl { .. }));
    assert!(!err.is_retryable());
    assert_eq!(0, source.fetch_count());
}

#[test]
fn test_status_retryability() {
    let url = Url::parse("https://example.com/").unwrap();
    let not_found = FetchError::Status {
        url: url.clone(),
        status: StatusCode::NOT_FOUND,
    };
    let unavailable = FetchError::Status {
        url,
        status: StatusCode::SERVICE_UNAVAILABLE,
    };
    assert!(!not_found.is_retryable());
    assert!(unavailable.is_retryable());
}

#[test]
fn test_fetch_document_parses_page() {
    let source = stub::StubSource::default()
        .with_page("https://example.com/", "<html><body><p id='x'>hi</p></body></html>");
    let doc = fetch_document(&source, "https://example.com/").unwrap();
    let selector = scraper::Selector::parse("#x").unwrap();
    assert_eq!("hi", doc.select(&selector).next().unwrap().text().collect::<String>());
}

#[test]
fn test_non_http_scheme_is_rejected_before_fetching() {
    let source = stub::StubSource::default();
    let err = fetch_document(&source, "ftp://example.com/ch1").unwrap_err();
    assert!(matches!(err, FetchError::UnsupportedScheme { .. }));
    assert!(!err.is_retryable());
    assert_eq!(0, source.fetch_count());
}

#[test]
fn test_request_that_cannot_be_built_is_not_retryable() {
    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let url = Url::parse("ftp://example.com/ch1").unwrap();
    let err = fetcher.fetch_page(&url).unwrap_err();
    assert!(matches!(err, FetchError::Transport { .. }));
    assert!(!err.is_retryable());
}

/// Answers a single request on a loopback port with `reply`, after `delay`.
#[cfg(test)]
fn serve_once(reply: &'static str, delay: Duration) -> Url {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = Url::parse(&format!("http://{}/chapter", listener.local_addr().unwrap())).unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        std::thread::sleep(delay);
        let _ = stream.write_all(reply.as_bytes());
    });
    url
}

#[test]
fn test_http_fetcher_reads_page() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 13\r\n\
         Connection: close\r\n\r\n<p>hello</p>\n",
        Duration::ZERO,
    );
    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    assert_eq!("<p>hello</p>\n", fetcher.fetch_page(&url).unwrap());
}

#[test]
fn test_http_fetcher_server_error_is_retryable() {
    let url = serve_once(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        Duration::ZERO,
    );
    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let err = fetcher.fetch_page(&url).unwrap_err();
    assert!(matches!(
        err,
        FetchError::Status { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR
    ));
    assert!(err.is_retryable());
}

#[test]
fn test_http_fetcher_client_error_is_not_retryable() {
    let url = serve_once(
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        Duration::ZERO,
    );
    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let err = fetcher.fetch_page(&url).unwrap_err();
    assert!(matches!(err, FetchError::Status { status, .. } if status == StatusCode::NOT_FOUND));
    assert!(!err.is_retryable());
}

#[test]
fn test_http_fetcher_times_out_on_slow_server() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        Duration::from_secs(3),
    );
    let fetcher = HttpFetcher::new(Duration::from_millis(500)).unwrap();
    let started = std::time::Instant::now();
    let err = fetcher.fetch_page(&url).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        FetchError::Transport { ref source, .. } => assert!(source.is_timeout()),
        ref other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(err.is_retryable());
}
