//! Sandboxed fetch implementation with origin policy.
//!
//! Security model:
//! - Only URLs matching allowed origins can be fetched ("*" = any public origin)
//! - Hosts allowed through "*" must be public both literally and after DNS
//!   resolution, so a name pointing at loopback or private space is refused
//! - Redirects only followed if they stay within the same origin
//! - Response bodies are read up to a size ceiling
//! - Every call counts toward the execution's `apiCallCount`

use crate::output::ApiCallCount;
use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::LOCATION;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use url::{Host, Url};

const MAX_REDIRECTS: usize = 5;
const DEFAULT_MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

const ALLOWED_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration for fetch allowlist
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://api.example.com"), or "*"
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
    /// Largest response body read into the host, in bytes
    pub max_response_size: usize,
    /// Host names answered from this map instead of DNS
    pub dns_overrides: HashMap<String, IpAddr>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// How a URL got past the origin policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Listed explicitly; any address is fine.
    Explicit,
    /// Allowed by "*"; only public addresses may be dialled.
    PublicOnly,
}

impl FetchConfig {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self {
            allowed_origins,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            dns_overrides: HashMap::new(),
        }
    }

    pub fn with_max_response_size(mut self, max_response_size: usize) -> Self {
        self.max_response_size = max_response_size;
        self
    }

    /// Resolve `host` to `ip` without asking DNS.
    pub fn with_dns_override(mut self, host: &str, ip: IpAddr) -> Self {
        self.dns_overrides.insert(host.to_ascii_lowercase(), ip);
        self
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        self.access(url).is_some()
    }

    fn access(&self, url: &Url) -> Option<Access> {
        if self.allowed_origins.is_empty() || !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let origin = url.origin().ascii_serialization();
        if self.allowed_origins.iter().any(|allowed| *allowed == origin) {
            return Some(Access::Explicit);
        }
        (self.allowed_origins.iter().any(|allowed| allowed == "*") && is_public_host(url))
            .then_some(Access::PublicOnly)
    }
}

fn is_public_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain != "localhost" && !domain.ends_with(".localhost") && !domain.ends_with(".internal")
        }
        Some(Host::Ipv4(ip)) => is_public_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_public_ip(IpAddr::V6(ip)),
        None => false,
    }
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                // 0.0.0.0/8 this network, 100.64.0.0/10 shared address space
                || a == 0
                || (a == 100 && (b & 0xc0) == 64)
                // 198.18.0.0/15 benchmarking, 240.0.0.0/4 reserved
                || (a == 198 && (b & 0xfe) == 18)
                || a >= 240)
        }
        IpAddr::V6(v6) => {
            // Covers both IPv4-mapped and IPv4-compatible forms
            if let Some(v4) = v6.to_ipv4() {
                return is_public_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // fc00::/7 unique local, fe80::/10 link-local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

/// DNS for sandbox requests: applies overrides, and for hosts allowed
/// through "*" drops every non-public address.
#[derive(Debug, Clone)]
struct SandboxResolver {
    overrides: HashMap<String, IpAddr>,
    public_only: bool,
}

impl Resolve for SandboxResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_ascii_lowercase();
        let pinned = self.overrides.get(&host).copied();
        let public_only = self.public_only;
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = match pinned {
                Some(ip) => vec![SocketAddr::new(ip, 0)],
                None => tokio::net::lookup_host((host.as_str(), 0)).await?.collect(),
            };
            let addrs = dialable_addrs(&host, addrs, public_only)?;
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

fn dialable_addrs(
    host: &str,
    addrs: Vec<SocketAddr>,
    public_only: bool,
) -> Result<Vec<SocketAddr>, String> {
    if !public_only {
        return Ok(addrs);
    }
    let public: Vec<SocketAddr> = addrs.into_iter().filter(|a| is_public_ip(a.ip())).collect();
    if public.is_empty() {
        return Err(format!("Fetch blocked: '{host}' resolves to a non-public address"));
    }
    Ok(public)
}

/// `error` and its sources, joined the way `anyhow` prints a chain.
fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    message
}

/// `fetch(url, init)` arguments as sent by the bootstrap.
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// What the bootstrap turns into a `Response`-like object.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let config = {
        let mut state = state.borrow_mut();
        state.borrow_mut::<ApiCallCount>().0 += 1;
        state.borrow::<FetchConfig>().clone()
    };

    send_checked(request, &config).await
}

fn parse_method(method: Option<&str>) -> Result<Method, deno_core::error::AnyError> {
    let name = method.unwrap_or("GET").to_ascii_uppercase();
    match Method::from_bytes(name.as_bytes()) {
        Ok(m) if ALLOWED_METHODS.contains(&m) => Ok(m),
        _ => Err(anyhow!("Unsupported HTTP method: {}", name)),
    }
}

fn check_origin(config: &FetchConfig, url: &Url) -> Result<Access, deno_core::error::AnyError> {
    config.access(url).ok_or_else(|| {
        anyhow!(
            "Fetch blocked: origin '{}' is not allowed",
            url.origin().ascii_serialization()
        )
    })
}

/// Send `request`, following same-origin redirects by hand.
async fn send_checked(
    request: FetchRequest,
    config: &FetchConfig,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let origin_url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;
    let access = check_origin(config, &origin_url)?;

    let resolver = SandboxResolver {
        overrides: config.dns_overrides.clone(),
        public_only: access == Access::PublicOnly,
    };
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .dns_resolver(Arc::new(resolver))
        .no_proxy()
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let mut method = parse_method(request.method.as_deref())?;
    let mut body = request.body;
    let mut url = origin_url.clone();

    for _ in 0..=MAX_REDIRECTS {
        let mut builder = client.request(method.clone(), url.clone());
        for (key, value) in request.headers.iter().flatten() {
            builder = builder.header(key, value);
        }
        if let Some(body) = body.take() {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| anyhow!("Fetch failed: {}", error_chain(&e.without_url())))?;
        let status = response.status();

        let location = status
            .is_redirection()
            .then(|| response.headers().get(LOCATION))
            .flatten();
        if let Some(location) = location {
            let target = location
                .to_str()
                .ok()
                .and_then(|l| url.join(l).ok())
                .ok_or_else(|| anyhow!("Invalid redirect location"))?;
            if target.origin() != origin_url.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    target.origin().ascii_serialization(),
                    origin_url.origin().ascii_serialization()
                ));
            }
            // Redirected requests are replayed as body-less GETs
            method = Method::GET;
            url = target;
            continue;
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let final_url = response.url().to_string();
        let text = read_body(response, config.max_response_size).await?;

        return Ok(FetchResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers,
            url: final_url,
            body: text,
        });
    }

    Err(anyhow!("Fetch blocked: too many redirects"))
}

/// Read the body as text, refusing to buffer more than `limit` bytes.
async fn read_body(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<String, deno_core::error::AnyError> {
    let too_large = || anyhow!("Fetch blocked: response body exceeds {} bytes", limit);
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e.without_url()))?
    {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn allowed(config: &FetchConfig, url: &str) -> bool {
        config.is_origin_allowed(&Url::parse(url).unwrap())
    }

    fn get(url: String) -> FetchRequest {
        FetchRequest {
            url,
            method: None,
            headers: None,
            body: None,
        }
    }

    #[test]
    fn test_explicit_origins_match_exactly() {
        let config = FetchConfig::new(vec![
            "https://api.github.com".to_string(),
            "http://localhost:8787".to_string(),
        ]);

        assert!(allowed(&config, "https://api.github.com/repos"));
        assert!(allowed(&config, "http://localhost:8787/hook"));

        assert!(!allowed(&config, "https://github.com/"));
        assert!(!allowed(&config, "http://api.github.com/repos"));
        assert!(!allowed(&config, "https://api.github.com:444/"));
    }

    #[test]
    fn test_empty_allowlist_disables_fetch() {
        let config = FetchConfig::default();
        assert!(!allowed(&config, "https://api.github.com"));
    }

    #[test]
    fn test_wildcard_excludes_private_hosts() {
        let config = FetchConfig::new(vec!["*".to_string()]);

        assert!(allowed(&config, "https://api.github.com/user"));
        assert!(allowed(&config, "http://93.184.216.34/"));

        for blocked in [
            "http://localhost:8080/",
            "http://127.0.0.1/",
            "http://10.0.0.8/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[::ffff:127.0.0.1]/",
            "http://[fd00::1]/",
            "http://metadata.google.internal/",
            "http://0.0.0.0/",
            "http://100.100.100.200/",
            "http://[::127.0.0.1]/",
            "file:///etc/passwd",
        ] {
            assert!(!allowed(&config, blocked), "{blocked} should be blocked");
        }
    }

    #[test]
    fn test_explicit_origin_wins_over_wildcard() {
        let config = FetchConfig::new(vec!["*".to_string(), "http://localhost:8787".to_string()]);
        let url = |u: &str| Url::parse(u).unwrap();

        assert_eq!(config.access(&url("http://localhost:8787/x")), Some(Access::Explicit));
        assert_eq!(config.access(&url("https://api.github.com/")), Some(Access::PublicOnly));
        assert_eq!(config.access(&url("http://localhost:9999/")), None);
    }

    #[test]
    fn test_resolved_addresses_are_filtered() {
        let private: SocketAddr = "10.1.2.3:0".parse().unwrap();
        let public: SocketAddr = "93.184.216.34:0".parse().unwrap();

        assert_eq!(
            dialable_addrs("mixed.test", vec![private, public], true).unwrap(),
            vec![public]
        );
        assert_eq!(
            dialable_addrs("internal.test", vec![private], true).unwrap_err(),
            "Fetch blocked: 'internal.test' resolves to a non-public address"
        );
        assert_eq!(dialable_addrs("listed.test", vec![private], false).unwrap(), vec![private]);
    }

    #[tokio::test]
    async fn test_wildcard_refuses_name_resolving_to_loopback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
            .expect(0)
            .mount(&server)
            .await;
        let port = server.address().port();

        let config = FetchConfig::new(vec!["*".to_string()])
            .with_dns_override("rebind.test", server.address().ip());
        let err = send_checked(get(format!("http://rebind.test:{port}/")), &config)
            .await
            .unwrap_err();

        assert!(
            err.to_string().contains("'rebind.test' resolves to a non-public address"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_explicit_origin_may_resolve_to_loopback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;
        let port = server.address().port();

        let config = FetchConfig::new(vec![format!("http://api.test:{port}")])
            .with_dns_override("api.test", server.address().ip());
        let response = send_checked(get(format!("http://api.test:{port}/")), &config)
            .await
            .unwrap();

        assert_eq!(response.body, "hello");
    }

    #[tokio::test]
    async fn test_response_body_over_limit_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let config = FetchConfig::new(vec![server.uri()]).with_max_response_size(1024);
        let err = send_checked(get(server.uri()), &config).await.unwrap_err();

        assert_eq!(err.to_string(), "Fetch blocked: response body exceeds 1024 bytes");
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        assert_eq!(parse_method(Some("post")).unwrap(), Method::POST);
        assert_eq!(parse_method(None).unwrap(), Method::GET);
        assert!(parse_method(Some("CONNECT")).is_err());
    }

    #[tokio::test]
    async fn test_fetch_follows_same_origin_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let config = FetchConfig::new(vec![server.uri()]);
        let response = send_checked(get(format!("{}/old", server.uri())), &config)
            .await
            .unwrap();

        assert!(response.ok);
        assert_eq!(response.body, "moved");
        assert!(response.url.ends_with("/new"));
    }

    #[tokio::test]
    async fn test_fetch_blocks_cross_origin_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", "https://evil.com/steal"),
            )
            .mount(&server)
            .await;

        let config = FetchConfig::new(vec![server.uri()]);
        let err = send_checked(get(server.uri()), &config).await.unwrap_err();

        assert!(err.to_string().contains("redirect to different origin"));
    }

    #[tokio::test]
    async fn test_redirect_loop_is_cut_off() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&server)
            .await;

        let config = FetchConfig::new(vec![server.uri()]);
        let err = send_checked(get(format!("{}/loop", server.uri())), &config)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Fetch blocked: too many redirects");
    }
}
