//! Base transport: one network round trip per call
//!
//! Wraps a preconfigured `reqwest::Client` with connection pooling, timeouts,
//! a cookie jar and a redirect observer that logs every hop.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::redirect::{Attempt, Policy};
use tracing::{debug, info, instrument};

use super::proxy::ProxyEndpoint;
use super::Transport;
use crate::config::HttpSettings;
use crate::error::{FetchError, Result};
use crate::models::{FetchRequest, FetchResponse};

/// Base network client
pub struct HttpTransport {
    client: reqwest::Client,
    cookies: Arc<Jar>,
    settings: HttpSettings,
    proxy: Option<String>,
}

impl HttpTransport {
    /// Direct client; system proxy variables are ignored
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let cookies = Arc::new(Jar::default());
        let client = Self::client_builder(&settings, cookies.clone())
            .no_proxy()
            .build()
            .map_err(|e| FetchError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cookies,
            settings,
            proxy: None,
        })
    }

    /// Client bound to one egress endpoint, with its own private cookie jar
    pub fn with_proxy(settings: &HttpSettings, endpoint: &ProxyEndpoint) -> Result<Self> {
        let proxy = reqwest::Proxy::all(endpoint.url().as_str())
            .map_err(|e| FetchError::InvalidProxyAddress(format!("{}: {}", endpoint, e)))?;

        let cookies = Arc::new(Jar::default());
        let client = Self::client_builder(settings, cookies.clone())
            .no_proxy()
            .proxy(proxy)
            .build()
            .map_err(|e| {
                FetchError::InvalidConfig(format!(
                    "failed to build HTTP client for proxy {}: {}",
                    endpoint, e
                ))
            })?;

        debug!(proxy = %endpoint, "Created proxy-bound HTTP client");

        Ok(Self {
            client,
            cookies,
            settings: settings.clone(),
            proxy: Some(endpoint.to_string()),
        })
    }

    fn client_builder(settings: &HttpSettings, cookies: Arc<Jar>) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout.max(settings.tls_handshake_timeout))
            .tcp_keepalive(settings.tcp_keepalive)
            .read_timeout(settings.response_header_timeout)
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .pool_idle_timeout(settings.idle_connection_timeout)
            .user_agent(settings.user_agent.clone())
            .cookie_provider(cookies.clone())
            .redirect(redirect_observer(cookies, settings.max_redirects));

        if let Some(timeout) = settings.request_timeout {
            builder = builder.timeout(timeout);
        }

        builder
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Cookie store used by this client
    pub fn cookies(&self) -> &Arc<Jar> {
        &self.cookies
    }

    /// Redacted proxy identity, if this client is proxy-bound
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(method = %request.method, url = %request.url, proxy = ?self.proxy))]
    async fn execute(&self, mut request: FetchRequest) -> Result<FetchResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(std::mem::take(&mut request.headers));
        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        let response = request
            .guard(async { builder.send().await.map_err(FetchError::from) })
            .await?;

        debug!(status = response.status().as_u16(), "Received response");
        Ok(response)
    }

    fn stage_name(&self) -> &'static str {
        "http"
    }
}

/// Redirect policy that logs each hop and the cookies known for the destination
fn redirect_observer(cookies: Arc<Jar>, max_redirects: usize) -> Policy {
    Policy::custom(move |attempt: Attempt| {
        let hops = attempt.previous().len();
        if hops > max_redirects {
            return attempt.error(format!("stopped after {} redirects", max_redirects));
        }

        let from = attempt
            .previous()
            .last()
            .map(|u| u.to_string())
            .unwrap_or_default();
        info!(from = %from, to = %attempt.url(), hops, "Following redirect");

        let names = cookie_names(cookies.as_ref(), attempt.url());
        info!(
            host = attempt.url().host_str().unwrap_or(""),
            cookies = ?names,
            "Cookies for redirect target"
        );

        attempt.follow()
    })
}

/// Names of the cookies a store would send to `url`
pub(crate) fn cookie_names(store: &dyn CookieStore, url: &url::Url) -> Vec<String> {
    store
        .cookies(url)
        .and_then(|value| value.to_str().ok().map(str::to_owned))
        .map(|header| {
            header
                .split(';')
                .filter_map(|pair| pair.split('=').next())
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use url::Url;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(HttpSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_base_transport_returns_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest::get(&format!("{}/ping", server.uri())).unwrap();
        let response = transport().execute(request).await.unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_base_transport_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-trace", "abc"))
            .and(body_string("hello"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/submit", server.uri())).unwrap();
        let request = FetchRequest::new(Method::POST, url)
            .try_header("x-trace", "abc")
            .unwrap()
            .body("hello");

        let response = transport().execute(request).await.unwrap();
        assert_eq!(response.status().as_u16(), 201);
    }

    #[tokio::test]
    async fn test_base_transport_stores_cookies() {
        let server = MockServer::start().await;
        Mock::given(path("/login"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"))
            .mount(&server)
            .await;
        Mock::given(path("/me"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport();
        transport
            .execute(FetchRequest::get(&format!("{}/login", server.uri())).unwrap())
            .await
            .unwrap();
        let response = transport
            .execute(FetchRequest::get(&format!("{}/me", server.uri())).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        let url = Url::parse(&server.uri()).unwrap();
        assert_eq!(cookie_names(transport.cookies().as_ref(), &url), vec!["session"]);
    }

    #[tokio::test]
    async fn test_base_transport_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let request = FetchRequest::get(&format!("{}/old", server.uri())).unwrap();
        let response = transport().execute(request).await.unwrap();

        assert_eq!(response.url().path(), "/new");
        assert_eq!(response.text().await.unwrap(), "moved");
    }

    #[tokio::test]
    async fn test_base_transport_stops_redirect_loops() {
        let server = MockServer::start().await;
        Mock::given(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&server)
            .await;

        let settings = HttpSettings {
            max_redirects: 3,
            ..HttpSettings::default()
        };
        let request = FetchRequest::get(&format!("{}/loop", server.uri())).unwrap();
        let err = HttpTransport::new(settings)
            .unwrap()
            .execute(request)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Network(_)));
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = FetchRequest::get(&format!("http://{}/", addr)).unwrap();
        let err = transport().execute(request).await.unwrap_err();

        assert!(matches!(err, FetchError::Network(_)));
        assert!(err.is_network());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_request_makes_no_network_call() {
        let server = MockServer::start().await;
        Mock::given(path("/never"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        token.cancel();
        let request = FetchRequest::get(&format!("{}/never", server.uri()))
            .unwrap()
            .with_cancellation(token);

        let err = transport().execute(request).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[test]
    fn test_cookie_names_parses_header() {
        let jar = Jar::default();
        let url = Url::parse("https://shop.example/").unwrap();
        jar.add_cookie_str("a=1; Path=/", &url);
        jar.add_cookie_str("b=2; Path=/", &url);

        let mut names = cookie_names(&jar, &url);
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        let other = Url::parse("https://elsewhere.example/").unwrap();
        assert!(cookie_names(&jar, &other).is_empty());

    }
}
