//! Core types for the bucket store.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::{Headers, Method, Request, Response};

/// Identity of a cached request: method plus URL (fragment ignored).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: Method,
  pub url: Url,
}

impl RequestKey {
  pub fn new(method: Method, mut url: Url) -> Self {
    url.set_fragment(None);
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method.clone(), request.url.clone())
  }

  /// Stable, fixed-length storage id for this key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{} {}", self.method, self.url).as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Owned snapshot of a response as kept in a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub url: Option<Url>,
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Snapshot a response, consuming its body.
  pub fn from_response(mut response: Response) -> Result<Self> {
    let body = response.bytes()?;
    Ok(Self {
      status: response.status,
      status_text: response.status_text,
      headers: response.headers,
      body,
      url: response.url,
      cached_at: Utc::now(),
    })
  }

  /// Materialise a fresh, unread response from the snapshot.
  pub fn to_response(&self) -> Response {
    let mut response =
      Response::new(self.status, self.body.clone()).with_headers(self.headers.clone());
    response.status_text = self.status_text.clone();
    response.url = self.url.clone();
    response
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::get(Url::parse("http://localhost/index.html#top").unwrap());
    let b = RequestKey::get(Url::parse("http://localhost/index.html").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_key_hash_depends_on_method() {
    let url = Url::parse("http://localhost/api/readings").unwrap();
    let get = RequestKey::new(Method::Get, url.clone());
    let post = RequestKey::new(Method::Post, url);
    assert_ne!(get.cache_hash(), post.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }

  #[test]
  fn test_snapshot_keeps_status_headers_and_body() {
    let mut headers = Headers::new();
    headers.set("content-type", "text/css");
    let response = Response::new(200, b"body{}".to_vec()).with_headers(headers);

    let snapshot = CachedResponse::from_response(response).unwrap();
    let mut restored = snapshot.to_response();

    assert_eq!(restored.status, 200);
    assert_eq!(restored.status_text, "OK");
    assert_eq!(restored.headers.get("Content-Type"), Some("text/css"));
    assert_eq!(restored.bytes().unwrap(), b"body{}");

    // Every materialisation gets its own body.
    assert_eq!(snapshot.to_response().bytes().unwrap(), b"body{}");
  }
}
