//! Network access for the agent.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;

use super::{Headers, Request, Response};

/// Something that can perform a network request.
///
/// Any `Err` is treated as a network failure by the caller, which is what
/// triggers the cache fallback. Non-2xx statuses are *not* errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Fetcher backed by a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("monitor-sw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in request.headers.iter() {
      builder = builder.header(name, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let url = response.url().clone();
    let headers: Headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        let value = match value.to_str() {
          Ok(v) => v.to_string(),
          Err(_) => {
            debug!(
              url = %request.url,
              header = %name,
              "header value is not UTF-8, storing lossily"
            );
            String::from_utf8_lossy(value.as_bytes()).into_owned()
          }
        };
        (name.as_str().to_string(), value)
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "network response");

    let mut result = Response::new(status.as_u16(), body.to_vec())
      .with_headers(headers)
      .with_url(url);
    if let Some(reason) = status.canonical_reason() {
      result.status_text = reason.to_string();
    }
    Ok(result)
  }
}

/// Fetcher that is permanently offline.
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    Err(eyre!("Network unavailable: {}", request.url))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use url::Url;

  /// Fetcher for loopback tests; ignores any proxy set in the environment.
  fn local_fetcher(timeout: Duration) -> HttpFetcher {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .no_proxy()
      .build()
      .unwrap();
    HttpFetcher { client }
  }

  /// Accept one connection on 127.0.0.1, wait for the request head, then
  /// write `reply` verbatim. Returns the URL of `/app.css` on that server.
  async fn serve_once(reply: &'static [u8]) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut head = Vec::new();
      let mut buf = [0u8; 1024];
      while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        head.extend_from_slice(&buf[..n]);
      }
      socket.write_all(reply).await.unwrap();
      let _ = socket.shutdown().await;
    });
    Url::parse(&format!("http://{}/app.css", addr)).unwrap()
  }

  #[tokio::test]
  async fn test_http_fetcher_maps_response() {
    let url = serve_once(
      b"HTTP/1.1 200 OK\r\n\
        Content-Type: text/css\r\n\
        Content-Length: 15\r\n\
        Connection: close\r\n\
        \r\n\
        body{color:red}",
    )
    .await;

    let mut response = local_fetcher(Duration::from_secs(5))
      .fetch(&Request::get(url.clone()))
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.headers.get("content-type"), Some("text/css"));
    assert_eq!(response.url, Some(url));
    assert_eq!(response.bytes().unwrap(), b"body{color:red}");
  }

  #[tokio::test]
  async fn test_http_fetcher_keeps_error_statuses() {
    let url = serve_once(
      b"HTTP/1.1 404 Not Found\r\n\
        Content-Length: 0\r\n\
        Connection: close\r\n\
        \r\n",
    )
    .await;

    let response = local_fetcher(Duration::from_secs(5))
      .fetch(&Request::get(url))
      .await
      .unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(response.status_text, "Not Found");
    assert!(!response.ok());
  }

  #[tokio::test]
  async fn test_http_fetcher_keeps_non_utf8_header_values() {
    let url = serve_once(
      b"HTTP/1.1 200 OK\r\n\
        X-Sensor: caf\xe9\r\n\
        Content-Length: 2\r\n\
        Connection: close\r\n\
        \r\n\
        ok",
    )
    .await;

    let response = local_fetcher(Duration::from_secs(5))
      .fetch(&Request::get(url))
      .await
      .unwrap();

    assert_eq!(response.headers.get("x-sensor"), Some("caf\u{fffd}"));
  }

  #[tokio::test]
  async fn test_http_fetcher_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      // Hold the connection open without ever answering.
      let (_socket, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(30)).await;
    });
    let url = Url::parse(&format!("http://{}/api/readings", addr)).unwrap();

    let result = local_fetcher(Duration::from_millis(200))
      .fetch(&Request::get(url))
      .await;

    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_offline_fetcher_always_fails() {
    let request = Request::get(Url::parse("http://localhost/index.html").unwrap());
    let err = OfflineFetcher.fetch(&request).await.unwrap_err();
    assert!(err.to_string().contains("Network unavailable"));
  }
}
