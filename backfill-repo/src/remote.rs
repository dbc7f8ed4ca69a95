//! HTTP remote fetcher

use std::marker::PhantomData;

use async_trait::async_trait;
use backfill_core::{
    BackfillConfig, BackfillResult, ConfigError, Edge, FetchError, FetchMode, FetchRequest,
    ListingItem, RemoteFetcher,
};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

/// Accepted response bodies: a bare array or an object wrapping one.
#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody<T> {
    Items(Vec<T>),
    Envelope { items: Vec<T> },
}

impl<T> PageBody<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            PageBody::Items(items) | PageBody::Envelope { items } => items,
        }
    }
}

/// Fetches listing pages from `GET {base_url}/{collection}`.
///
/// Query parameters: `limit` is the page size; `after` (End edge) or
/// `before` (Start edge) carries the edge item's cursor when there is one.
pub struct HttpFetcher<T> {
    client: Client,
    base_url: Url,
    _payload: PhantomData<fn() -> T>,
}

impl<T: ListingItem> HttpFetcher<T> {
    /// Client configured with the timeout and user agent from `config`.
    pub fn new(base_url: &str, config: &BackfillConfig) -> BackfillResult<Self> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(timeout) = config.http_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| ConfigError::InvalidValue {
            field: "http_client".to_string(),
            value: base_url.to_string(),
            reason: e.to_string(),
        })?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> BackfillResult<Self> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            field: "base_url".to_string(),
            value: base_url.to_string(),
            reason,
        };
        let base_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("URL cannot carry a path".to_string()).into());
        }
        Ok(Self {
            client,
            base_url,
            _payload: PhantomData,
        })
    }

    /// The URL a request is sent to, query included.
    pub fn request_url(&self, request: &FetchRequest) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::new("base URL cannot carry a path"))?
            .pop_if_empty()
            .push(request.collection.as_str());

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &request.page_size.to_string());
            if let Some(anchor) = &request.anchor {
                match request.mode {
                    FetchMode::Boundary(Edge::End) => {
                        query.append_pair("after", anchor);
                    }
                    FetchMode::Boundary(Edge::Start) => {
                        query.append_pair("before", anchor);
                    }
                    FetchMode::Refresh => {}
                }
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl<T: ListingItem> RemoteFetcher<T> for HttpFetcher<T> {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<T>, FetchError> {
        let url = self.request_url(request)?;
        tracing::debug!(collection = %request.collection, url = %url, "Fetching remote page");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::new(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(FetchError::new(match status {
                StatusCode::TOO_MANY_REQUESTS => "Rate limited by remote".to_string(),
                _ => format!("Remote returned {}: {}", status, body.trim()),
            }));
        }

        let body: PageBody<T> = response
            .json()
            .await
            .map_err(|e| FetchError::new(format!("Failed to parse response: {}", e)))?;
        Ok(body.into_items())
    }
}

impl<T> std::fmt::Debug for HttpFetcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_test_utils::fixtures::key;
    use backfill_test_utils::Post;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fetcher(base: &str) -> HttpFetcher<Post> {
        HttpFetcher::new(base, &BackfillConfig::default()).expect("valid base URL")
    }

    /// Serve one canned HTTP response and hand back the request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.expect("read request");
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.expect("write response");
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{}/r", addr), handle)
    }

    #[test]
    fn test_request_url_for_end_boundary() {
        let fetcher = fetcher("https://example.test/r/");
        let request = FetchRequest::boundary(key("androiddev"), Edge::End, 25, Some("t3_abc".into()));
        let url = fetcher.request_url(&request).expect("url builds");
        assert_eq!(
            url.as_str(),
            "https://example.test/r/androiddev?limit=25&after=t3_abc"
        );
    }

    #[test]
    fn test_request_url_for_refresh_and_start() {
        let fetcher = fetcher("https://example.test/r");
        let refresh = FetchRequest::refresh(key("rust"), 10);
        assert_eq!(
            fetcher.request_url(&refresh).expect("url builds").as_str(),
            "https://example.test/r/rust?limit=10"
        );

        let start = FetchRequest::boundary(key("rust"), Edge::Start, 10, Some("t3_x".into()));
        assert!(fetcher
            .request_url(&start)
            .expect("url builds")
            .as_str()
            .ends_with("before=t3_x"));
    }

    #[test]
    fn test_collection_is_path_encoded() {
        let fetcher = fetcher("https://example.test/r");
        let request = FetchRequest::refresh(key("a b/c"), 1);
        let url = fetcher.request_url(&request).expect("url builds");
        assert!(url.path().ends_with("/a%20b%2Fc"));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(HttpFetcher::<Post>::new("not a url", &BackfillConfig::default()).is_err());
        assert!(HttpFetcher::<Post>::new("mailto:someone@example.test", &BackfillConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_decodes_envelope() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"items":[{"name":"t3_a","title":"A","score":1}]}"#,
        )
        .await;
        let request = FetchRequest::refresh(key("X"), 10);

        let items = fetcher(&base).fetch(&request).await.expect("fetch should succeed");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "t3_a");

        let head = server.await.expect("server task");
        assert!(head.starts_with("GET /r/X?limit=10 "));
    }

    #[tokio::test]
    async fn test_fetch_decodes_bare_array() {
        let (base, _server) = serve_once(
            "200 OK",
            r#"[{"name":"t3_a","title":"A","score":1},{"name":"t3_b","title":"B","score":2}]"#,
        )
        .await;
        let items = fetcher(&base)
            .fetch(&FetchRequest::refresh(key("X"), 10))
            .await
            .expect("fetch should succeed");
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_non_success_status_is_fetch_error() {
        let (base, _server) = serve_once("503 Service Unavailable", r#"{"error":"down"}"#).await;
        let err = fetcher(&base)
            .fetch(&FetchRequest::refresh(key("X"), 10))
            .await
            .expect_err("503 should fail");
        assert!(err.message.contains("503"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_fetch_error() {
        let (base, _server) = serve_once("200 OK", r#"{"children":[]}"#).await;
        let err = fetcher(&base)
            .fetch(&FetchRequest::refresh(key("X"), 10))
            .await
            .expect_err("unknown shape should fail");
        assert!(err.message.starts_with("Failed to parse response"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_fetch_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let err = fetcher(&format!("http://{}/r", addr))
            .fetch(&FetchRequest::refresh(key("X"), 10))
            .await
            .expect_err("closed port should fail");
        assert!(err.message.starts_with("HTTP request failed"));
    }
}
