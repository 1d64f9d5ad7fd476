//! HTTP request/response model and network seams.
//!
//! The cache controller and sync queue manager never talk to the network
//! directly; they go through the `Fetcher` and `SyncTransport` traits so the
//! whole protocol can be exercised with scripted implementations.

use color_eyre::{eyre::eyre, Result};
use reqwest::cookie::CookieStore;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::queue::store::Operation;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
    }
  }
}

/// How the request was initiated. Navigation requests (top-level page loads)
/// get a dedicated fallback chain in the cache controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  Subresource,
}

/// An intercepted request, reduced to the fields the routing policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  /// A plain subresource GET.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      mode: RequestMode::Subresource,
    }
  }

  /// A top-level navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      mode: RequestMode::Navigate,
    }
  }

  /// Request identity used as the cache key input: method plus full URL.
  pub fn identity(&self) -> String {
    format!("{} {}", self.method.as_str(), self.url)
  }
}

/// Whether the response body and headers are visible to the caching layer.
/// Cross-origin resources come back opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  Basic,
  Opaque,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseKind::Basic => "basic",
      ResponseKind::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "basic" => Ok(ResponseKind::Basic),
      "opaque" => Ok(ResponseKind::Opaque),
      other => Err(eyre!("Unknown response kind: {}", other)),
    }
  }
}

/// A full response: status, headers and body, as stored in a cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub kind: ResponseKind,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_html(&self) -> bool {
    self
      .content_type
      .as_deref()
      .map(|ct| ct.starts_with("text/html"))
      .unwrap_or(false)
  }

  /// Synthetic response served when a static asset is neither cached nor
  /// reachable. The caller must never see an error on that path.
  pub fn offline() -> Self {
    Self {
      status: 503,
      content_type: Some("text/plain".to_string()),
      kind: ResponseKind::Basic,
      headers: Vec::new(),
      body: b"Offline".to_vec(),
    }
  }
}

/// Network seam for the cache controller.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Fetcher backed by reqwest. Responses from a different origin than the
/// configured one are marked opaque.
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build fetch client: {}", e))?;

    Ok(Self { client, origin })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
    };

    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Fetch failed for {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let kind = if response.url().origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Opaque
    };
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body from {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      content_type,
      kind,
      headers,
      body,
    })
  }
}

/// The full ordered queue contents, submitted as one unit.
#[derive(Debug, Clone, Serialize)]
pub struct SyncBatch {
  pub operations: Vec<Operation>,
}

/// Seam for the batch submission. Success means the remote side acknowledged
/// the whole batch; anything else (transport error, non-2xx) is a failure.
pub trait SyncTransport: Send + Sync {
  fn submit(&self, batch: &SyncBatch) -> impl Future<Output = Result<()>> + Send;
}

/// Source of the anti-forgery token attached to every batch submission.
/// Read at call time, never cached, since the token may rotate.
pub trait TokenSource: Send + Sync {
  fn csrf_token(&self) -> Option<String>;
}

/// Reads the anti-forgery token from the shared cookie jar.
pub struct CookieTokenSource {
  jar: Arc<reqwest::cookie::Jar>,
  endpoint: Url,
  cookie_name: String,
}

impl CookieTokenSource {
  pub fn new(jar: Arc<reqwest::cookie::Jar>, endpoint: Url, cookie_name: String) -> Self {
    Self {
      jar,
      endpoint,
      cookie_name,
    }
  }
}

impl TokenSource for CookieTokenSource {
  fn csrf_token(&self) -> Option<String> {
    let header = self.jar.cookies(&self.endpoint)?;
    let raw = header.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|pair| {
      let (name, value) = pair.split_once('=')?;
      (name == self.cookie_name).then(|| value.to_string())
    })
  }
}

/// Transport backed by reqwest: JSON POST with credentials from the shared
/// cookie jar and a bounded request timeout.
pub struct HttpTransport<T: TokenSource> {
  client: reqwest::Client,
  endpoint: Url,
  tokens: T,
}

impl<T: TokenSource> HttpTransport<T> {
  pub fn new(
    endpoint: Url,
    jar: Arc<reqwest::cookie::Jar>,
    tokens: T,
    timeout: Duration,
  ) -> Result<Self> {
    let client = reqwest::Client::builder()
      .cookie_provider(jar)
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build sync client: {}", e))?;

    Ok(Self {
      client,
      endpoint,
      tokens,
    })
  }
}

impl<T: TokenSource> SyncTransport for HttpTransport<T> {
  async fn submit(&self, batch: &SyncBatch) -> Result<()> {
    let mut request = self.client.post(self.endpoint.clone()).json(batch);
    if let Some(token) = self.tokens.csrf_token() {
      request = request.header("X-CSRFToken", token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Sync request failed: {}", e))?;

    if !response.status().is_success() {
      return Err(eyre!("Sync endpoint returned {}", response.status()));
    }

    Ok(())
  }
}
