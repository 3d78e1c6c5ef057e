//! Module fetcher.
//!
//! Retrieves module source text over HTTP, enforcing the size ceiling and
//! the accepted content types before the body is handed to the evaluator.

use crate::error::SandboxError;
use crate::specifier::is_host_allowed;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{redirect, Client};
use std::time::Duration;
use url::Url;

const USER_AGENT: &str = "FunctionSandboxModuleLoader/1.0";
const ACCEPTED_TYPES: &str = "application/javascript, text/javascript, application/json, text/plain";
const MAX_REDIRECTS: usize = 5;

/// Fetches module source from an already-validated URL.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, SandboxError>;
}

/// [`ModuleFetcher`] over `reqwest`.
pub struct HttpModuleFetcher {
    client: Client,
    max_module_size: usize,
}

impl HttpModuleFetcher {
    pub fn new(max_module_size: usize, timeout: Duration) -> Result<Self, SandboxError> {
        // Redirects may only land on allow-listed hosts
        let policy = redirect::Policy::custom(|attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if attempt.url().host_str().is_some_and(is_host_allowed) {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });

        // Every execution drives this client from its own tokio runtime, so
        // pooled connections would outlive the runtime that spawned them.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(policy)
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| SandboxError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_module_size,
        })
    }
}

#[async_trait]
impl ModuleFetcher for HttpModuleFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, SandboxError> {
        let mut response = self
            .client
            .get(url.clone())
            .header(ACCEPT, ACCEPTED_TYPES)
            .send()
            .await
            .map_err(|e| SandboxError::Network(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SandboxError::Fetch {
                url: url.to_string(),
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_module_size as u64)
        {
            return Err(SandboxError::PayloadTooLarge {
                limit: self.max_module_size,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !is_supported_content_type(&content_type) {
            return Err(SandboxError::UnsupportedMediaType { content_type });
        }

        // Content-Length can be absent or wrong; keep counting while reading.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| SandboxError::Network(e.without_url().to_string()))?
        {
            if body.len() + chunk.len() > self.max_module_size {
                return Err(SandboxError::PayloadTooLarge {
                    limit: self.max_module_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

fn is_supported_content_type(content_type: &str) -> bool {
    content_type.contains("javascript")
        || content_type.contains("json")
        || content_type.contains("text/plain")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max: usize) -> HttpModuleFetcher {
        HttpModuleFetcher::new(max, Duration::from_secs(5)).unwrap()
    }

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[tokio::test]
    async fn test_fetches_javascript() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/left-pad"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("module.exports = 42;", "application/javascript"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let body = fetcher(1024).fetch(&url(&server, "/left-pad")).await.unwrap();
        assert_eq!(body, "module.exports = 42;");
    }

    #[tokio::test]
    async fn test_non_success_status_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(1024).fetch(&url(&server, "/missing")).await.unwrap_err();
        match err {
            SandboxError::Fetch {
                status,
                status_text,
                ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(status_text, "Not Found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_content_length_over_limit_is_payload_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("x".repeat(64), "application/javascript"),
            )
            .mount(&server)
            .await;

        let err = fetcher(16).fetch(&url(&server, "/big")).await.unwrap_err();
        assert!(matches!(err, SandboxError::PayloadTooLarge { limit: 16 }));
        assert_eq!(err.status_code(), 413);
    }

    #[tokio::test]
    async fn test_chunked_body_over_limit_is_payload_too_large() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Hand-rolled server: a chunked body carries no Content-Length.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let chunk = "x".repeat(32);
            let response = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: application/javascript\r\n\
                 Transfer-Encoding: chunked\r\n\
                 Connection: close\r\n\r\n\
                 20\r\n{chunk}\r\n20\r\n{chunk}\r\n0\r\n\r\n"
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let url = Url::parse(&format!("http://{addr}/streamed.js")).unwrap();
        let err = fetcher(48).fetch(&url).await.unwrap_err();
        assert!(matches!(err, SandboxError::PayloadTooLarge { limit: 48 }));
    }

    #[tokio::test]
    async fn test_redirect_to_unlisted_host_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/left-pad"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "http://evil.example.com/x.js"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(1024).fetch(&url(&server, "/left-pad")).await.unwrap_err();
        assert!(
            matches!(err, SandboxError::Fetch { status: 302, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_html_is_unsupported_media_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let err = fetcher(1024).fetch(&url(&server, "/page")).await.unwrap_err();
        assert!(
            matches!(err, SandboxError::UnsupportedMediaType { ref content_type } if content_type == "text/html")
        );
        assert_eq!(err.status_code(), 415);
    }

    #[tokio::test]
    async fn test_connection_failure_is_network_error() {
        // Nothing listens on port 9 (discard) in the test environment.
        let err = fetcher(1024)
            .fetch(&Url::parse("http://127.0.0.1:9/mod.js").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Network(_)));
    }

    #[test]
    fn test_content_type_matching() {
        assert!(is_supported_content_type("text/javascript"));
        assert!(is_supported_content_type("application/json"));
        assert!(is_supported_content_type("text/plain; charset=utf-8"));
        assert!(!is_supported_content_type("image/png"));
        assert!(!is_supported_content_type(""));
    }
}
