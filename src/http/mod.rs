//! Request and response types shared by the network and cache layers.
//!
//! Responses carry a single-read [`Body`]: once the bytes have been taken the
//! body is spent, so anything that needs the payload twice (the caller and the
//! cache) has to duplicate the response first with [`Response::try_clone`].

mod client;

pub use client::{Fetcher, HttpFetcher, OfflineFetcher};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
  Other(String),
}

impl Method {
  pub fn parse(s: &str) -> Self {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Method::Get,
      "HEAD" => Method::Head,
      "POST" => Method::Post,
      "PUT" => Method::Put,
      "PATCH" => Method::Patch,
      "DELETE" => Method::Delete,
      "OPTIONS" => Method::Options,
      other => Method::Other(other.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
      Method::Other(m) => m,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Get the first value for a header name.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace every value of `name` with `value`.
  pub fn set(&mut self, name: &str, value: impl Into<String>) {
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    self.0.push((name.to_ascii_lowercase(), value.into()));
  }

  pub fn append(&mut self, name: &str, value: impl Into<String>) {
    self.0.push((name.to_ascii_lowercase(), value.into()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (k, v) in iter {
      let name: String = k.into();
      headers.append(&name, v);
    }
    headers
  }
}

/// An outgoing request under evaluation.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.set(name, value);
    self
  }

  /// Whether the `Accept` header asks for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get("accept")
      .is_some_and(|accept| accept.contains("text/html"))
  }
}

/// Response payload that can only be read once.
#[derive(Debug, Default)]
pub struct Body {
  bytes: Option<Vec<u8>>,
}

impl Body {
  pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
    Self {
      bytes: Some(bytes.into()),
    }
  }

  #[cfg(test)]
  pub fn is_used(&self) -> bool {
    self.bytes.is_none()
  }

  /// Take the payload, leaving the body spent.
  pub fn take(&mut self) -> Result<Vec<u8>> {
    self
      .bytes
      .take()
      .ok_or_else(|| eyre!("Response body has already been read"))
  }

  fn try_clone(&self) -> Result<Self> {
    match &self.bytes {
      Some(bytes) => Ok(Self::new(bytes.clone())),
      None => Err(eyre!("Cannot clone a response whose body was already read")),
    }
  }
}

/// A network or cached response.
#[derive(Debug)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  /// Final URL the response was produced for, if known.
  pub url: Option<Url>,
  body: Body,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: default_status_text(status).to_string(),
      headers: Headers::new(),
      url: None,
      body: Body::new(body),
    }
  }

  pub fn with_headers(mut self, headers: Headers) -> Self {
    self.headers = headers;
    self
  }

  pub fn with_url(mut self, url: Url) -> Self {
    self.url = Some(url);
    self
  }

  /// Synthetic response for an offline request that nothing in the cache can
  /// satisfy.
  pub fn gateway_timeout() -> Self {
    let mut headers = Headers::new();
    headers.set(OFFLINE_FALLBACK_HEADER, "offline-miss");
    Self::new(504, Vec::new()).with_headers(headers)
  }

  /// Whether the status is in the 2xx range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn body_used(&self) -> bool {
    self.body.is_used()
  }

  /// Read the whole body.
  pub fn bytes(&mut self) -> Result<Vec<u8>> {
    self.body.take()
  }

  #[cfg(test)]
  pub fn text(&mut self) -> Result<String> {
    let bytes = self.bytes()?;
    String::from_utf8(bytes).map_err(|e| eyre!("Response body is not valid UTF-8: {}", e))
  }

  /// Duplicate the response, body included. Fails once the body was read.
  pub fn try_clone(&self) -> Result<Self> {
    Ok(Self {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      url: self.url.clone(),
      body: self.body.try_clone()?,
    })
  }
}

/// Header set on synthetic responses produced by the offline fallback.
pub const OFFLINE_FALLBACK_HEADER: &str = "x-monitor-sw-fallback";

fn default_status_text(status: u16) -> &'static str {
  match status {
    200 => "OK",
    201 => "Created",
    204 => "No Content",
    301 => "Moved Permanently",
    302 => "Found",
    304 => "Not Modified",
    400 => "Bad Request",
    401 => "Unauthorized",
    403 => "Forbidden",
    404 => "Not Found",
    500 => "Internal Server Error",
    502 => "Bad Gateway",
    503 => "Service Unavailable",
    504 => "Gateway Timeout",
    _ => "",
  }
}
