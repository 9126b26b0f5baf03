//! Pooled, source-scoped HTTP sessions
//!
//! [`SessionManager`] keeps one [`DownloadSession`] per logical source key and
//! recreates it after [`SessionManager::close_session`]. Every response passes
//! through [`check_status`], which maps non-2xx statuses onto the error taxonomy:
//!
//! | status | error |
//! |--------|-------|
//! | 401    | [`Error::Authentication`] |
//! | 403    | [`Error::Permission`] |
//! | 404    | [`Error::ContentNotFound`] |
//! | 429    | [`Error::RateLimited`] (with `Retry-After` hint) |
//! | 5xx    | [`Error::Network`] ("Server error") |
//! | other  | [`Error::Network`] ("HTTP error") |
//!
//! Connection use is bounded per session: at most `2 * max_concurrent_downloads`
//! requests in flight overall and `max_concurrent_downloads` per host. A permit
//! is held until the response body is dropped.

use crate::config::Config;
use crate::error::{Error, Result};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};


/// Source key used when a descriptor names no source
pub const DEFAULT_SOURCE: &str = "default";

/// Manages one pooled session per source
pub struct SessionManager {
    config: Arc<Config>,
    sessions: Mutex<HashMap<String, Arc<DownloadSession>>>,
}

impl SessionManager {
    /// Create a manager; sessions are built lazily on first use
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Session for `source`, creating it when absent or closed
    pub async fn session(&self, source: &str) -> Result<Arc<DownloadSession>> {
        let key = if source.is_empty() {
            DEFAULT_SOURCE
        } else {
            source
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(key)
            && !existing.is_closed()
        {
            return Ok(existing.clone());
        }

        let session = Arc::new(DownloadSession::build(&self.config, key)?);
        tracing::debug!(source = key, "Created HTTP session");
        sessions.insert(key.to_string(), session.clone());
        Ok(session)
    }

    /// Close the session for `source`; the next request recreates it
    pub async fn close_session(&self, source: &str) -> bool {
        let removed = self.sessions.lock().await.remove(source);
        match removed {
            Some(session) => {
                session.close();
                tracing::debug!(source, "Closed HTTP session");
                true
            }
            None => false,
        }
    }

    /// Close every session
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (source, session) in drained {
            session.close();
            tracing::debug!(source = %source, "Closed HTTP session");
        }
    }

    /// Number of open sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Metadata returned by a HEAD probe
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentInfo {
    /// Content-Length
    pub size: Option<u64>,
    /// Content-Type
    pub content_type: Option<String>,
    /// Last-Modified, verbatim
    pub last_modified: Option<String>,
    /// ETag, verbatim
    pub etag: Option<String>,
    /// Whether the server advertises `Accept-Ranges: bytes`
    pub accepts_ranges: bool,
}

/// A pooled HTTP client scoped to one source
pub struct DownloadSession {
    source: String,
    client: reqwest::Client,
    timeout: Duration,
    per_host_limit: usize,
    total: Arc<Semaphore>,
    hosts: std::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
    closed: AtomicBool,
}

impl DownloadSession {
    fn build(config: &Config, source: &str) -> Result<Self> {
        let behavior = config.behavior_for_source(source);
        let headers = build_headers(&config.headers_for_source(source))?;
        let per_host_limit = config.max_concurrent_downloads.max(1);

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .gzip(config.enable_compression)
            .brotli(config.enable_compression)
            .deflate(config.enable_compression)
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .pool_max_idle_per_host(per_host_limit)
            .build()?;

        Ok(Self {
            source: source.to_string(),
            client,
            timeout: behavior.timeout(),
            per_host_limit,
            total: Arc::new(Semaphore::new(per_host_limit * 2)),
            hosts: std::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Source key this session serves
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether [`SessionManager::close_session`] retired this session
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.total.close();
    }

    /// GET `url` and return the response once its status is acceptable
    pub async fn get(&self, url: &str) -> Result<SessionResponse> {
        let request = self.client.get(url);
        let response = self.send(url, request).await?;
        Ok(response)
    }

    /// GET `url` starting at byte `start`, optionally ending at `end` (inclusive)
    ///
    /// Both 206 and 200 are valid answers; on 200 the body starts at byte zero and
    /// [`SessionResponse::is_partial`] is false. Any other status is a protocol error.
    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<SessionResponse> {
        let range = match end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        let request = self.client.get(url).header(header::RANGE, range);
        let response = self.send(url, request).await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => Ok(response),
            other => Err(Error::Network {
                message: format!("Range request failed: HTTP {} for {}", other.as_u16(), url),
                status: Some(other.as_u16()),
            }),
        }
    }

    /// Download the whole body of `url`
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        response.into_bytes(self.timeout).await
    }

    /// Download bytes `start..=end` of `url`
    pub async fn download_range(&self, url: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let response = self.get_range(url, start, Some(end)).await?;
        response.into_bytes(self.timeout).await
    }

    /// HEAD `url` and report size, type and range support
    pub async fn content_info(&self, url: &str) -> Result<ContentInfo> {
        let request = self.client.head(url);
        let response = self.send(url, request).await?;
        let headers = response.response.headers();
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Ok(ContentInfo {
            size: text(header::CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_type: text(header::CONTENT_TYPE),
            last_modified: text(header::LAST_MODIFIED),
            etag: text(header::ETAG),
            accepts_ranges: text(header::ACCEPT_RANGES)
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
        })
    }

    /// Per-operation timeout applied to the response head and to each body chunk
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&self, url: &str, request: reqwest::RequestBuilder) -> Result<SessionResponse> {
        let permits = self.acquire(url).await?;

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| Error::Network {
                message: format!(
                    "request to {} timed out after {}s",
                    url,
                    self.timeout.as_secs()
                ),
                status: None,
            })??;

        let response = check_status(response)?;
        Ok(SessionResponse {
            response,
            _permits: permits,
        })
    }

    async fn acquire(&self, url: &str) -> Result<RequestPermits> {
        let closed = || Error::Network {
            message: format!("session '{}' is closed", self.source),
            status: None,
        };

        let host_gate = {
            let host = url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();
            let mut hosts = self
                .hosts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            hosts
                .entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
                .clone()
        };

        let total = self
            .total
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| closed())?;
        let host = host_gate.acquire_owned().await.map_err(|_| closed())?;
        Ok(RequestPermits {
            _total: total,
            _host: host,
        })
    }
}

struct RequestPermits {
    _total: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

/// A response whose status passed [`check_status`]
///
/// Holds the session's connection permits until dropped.
pub struct SessionResponse {
    response: Response,
    _permits: RequestPermits,
}

impl SessionResponse {
    /// HTTP status
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Whether the server honored a range request with 206
    pub fn is_partial(&self) -> bool {
        self.response.status() == StatusCode::PARTIAL_CONTENT
    }

    /// Content-Length of this response body
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Full length of the resource, from Content-Range on a 206 or Content-Length otherwise
    pub fn total_size(&self) -> Option<u64> {
        if self.is_partial() {
            self.response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.trim().parse().ok())
        } else {
            self.response.content_length()
        }
    }

    /// Next body chunk, or None at end of body
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.response.chunk().await?.map(|c| c.to_vec()))
    }

    /// Read the rest of the body, applying `timeout` per chunk
    pub async fn into_bytes(mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(
            usize::try_from(self.content_length().unwrap_or(0)).unwrap_or(0),
        );
        loop {
            let next = tokio::time::timeout(timeout, self.chunk())
                .await
                .map_err(|_| Error::Network {
                    message: format!("body read timed out after {}s", timeout.as_secs()),
                    status: None,
                })??;
            match next {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => return Ok(body),
            }
        }
    }
}

/// Map a non-2xx response onto the error taxonomy
pub fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let code = status.as_u16();
    let err = match status {
        StatusCode::UNAUTHORIZED => Error::Authentication { status: code, url },
        StatusCode::FORBIDDEN => Error::Permission { status: code, url },
        StatusCode::NOT_FOUND => Error::ContentNotFound { status: code, url },
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            retry_after: parse_retry_after(response.headers()),
            url,
        },
        s if s.is_server_error() => Error::Network {
            message: format!("Server error: HTTP {code} for {url}"),
            status: Some(code),
        },
        _ => Error::Network {
            message: format!("HTTP error: HTTP {code} for {url}"),
            status: Some(code),
        },
    };
    tracing::debug!(status = code, error = %err, "Request rejected");
    Err(err)
}

/// Parse a `Retry-After` header given in (possibly fractional) seconds
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config("custom_headers", format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            Error::config("custom_headers", format!("invalid value for header '{name}': {e}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}
